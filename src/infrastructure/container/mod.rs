//! Container module
//!
//! 组件容器：绑定目录、作用域存储、候选选择、解析引擎与生命周期编排

pub mod catalog;
pub mod decoration;
pub mod descriptor;
pub mod engine;
pub mod instance;
pub mod lazy;
pub mod scope;
pub mod selector;
pub mod service;
pub mod stats;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use catalog::{BindingCatalog, Registration};
pub use decoration::{DecorationGateway, DecoratorRegistry, IdentityGateway};
pub use descriptor::{
    BindingDescriptor, BindingId, BindingOrigin, DescriptorBuilder, Dependencies,
    InjectionPoint, Requirement, RequirementKind,
};
pub use instance::{ContractKey, Instance};
pub use lazy::Lazy;
pub use scope::{CallScope, ScopeStore, ScopedInstance};
pub use selector::CandidateSelector;
pub use service::{ContainerBuilder, ServiceContainer};
pub use stats::ContainerStats;

/// 绑定的生命周期（作用域）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// 容器级单例
    Singleton,
    /// 每次解析都创建新实例
    Prototype,
    /// 在调用方提供的工作单元内共享
    CallBound,
    /// 与单例相同的缓存机制，但归属于更长生命周期的应用标识
    Application,
}

impl Scope {
    /// 是否参与启动时的预先实例化
    pub fn is_container_wide(&self) -> bool {
        matches!(self, Scope::Singleton | Scope::Application)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Scope::Singleton => "singleton",
            Scope::Prototype => "prototype",
            Scope::CallBound => "call-bound",
            Scope::Application => "application",
        };
        f.write_str(label)
    }
}

/// 作用域存储中缓存区的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeId {
    Singleton,
    Application(uuid::Uuid),
    Call(uuid::Uuid),
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Singleton => write!(f, "singleton"),
            ScopeId::Application(id) => write!(f, "application:{}", id),
            ScopeId::Call(id) => write!(f, "call:{}", id),
        }
    }
}

/// 容器状态机: Created → Starting → Started → Stopping → Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Starting,
    Started,
    Stopping,
    /// 终态，不可复用
    Stopped,
}

impl ContainerState {
    /// 是否允许解析
    pub fn accepts_resolution(&self) -> bool {
        matches!(self, ContainerState::Starting | ContainerState::Started)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ContainerState::Stopping | ContainerState::Stopped)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
