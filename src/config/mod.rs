pub mod settings;

pub use settings::{ContainerSettings, DEFAULT_PROFILE_PROPERTY, SETTINGS_ENV_PREFIX};
