//! 基础设施层
//!
//! - 组件容器
//! - 绑定模块
//! - 属性源与 profile

pub mod container;
pub mod module;
pub mod properties;

pub use container::{ContainerBuilder, ContainerState, Scope, ServiceContainer};
pub use module::{BindingModule, ModuleRegistry, ModuleStatus};
pub use properties::{
    ActiveProfiles, EnvPropertySource, MapPropertySource, PropertySource, PropertySources,
};
