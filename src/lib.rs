pub mod config;
pub mod errors;
pub mod infrastructure;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::ContainerSettings;
pub use errors::{
    ContainerError, ContainerWarning, ModuleError, PropertyError, SettingsError, TeardownError,
    TeardownFailure,
};
pub use infrastructure::container::{
    BindingDescriptor, CallScope, ContainerBuilder, ContainerState, ContainerStats, ContractKey,
    DecorationGateway, DecoratorRegistry, Dependencies, DescriptorBuilder, IdentityGateway,
    Instance, Lazy, Requirement, Scope, ServiceContainer,
};
pub use infrastructure::module::{BindingModule, ModuleRegistry};
pub use infrastructure::properties::{
    ActiveProfiles, EnvPropertySource, MapPropertySource, PropertySource,
};
