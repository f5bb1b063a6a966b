use crate::errors::SettingsError;
use crate::infrastructure::container::Scope;
use serde::{Deserialize, Serialize};

/// 默认的 profile 属性键
pub const DEFAULT_PROFILE_PROPERTY: &str = "container.profiles.active";

/// 环境变量覆盖使用的前缀
pub const SETTINGS_ENV_PREFIX: &str = "WIREBOX_";

/// Configuration for the component container
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    /// Profiles activated in addition to those declared by property sources
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Whether container-wide bindings are created while starting
    #[serde(default = "default_eager_init")]
    pub eager_init: bool,

    /// Whether conflicting registrations replace existing ones
    #[serde(default)]
    pub allow_overwrite: bool,

    /// Property consulted for a comma separated list of active profiles
    #[serde(default = "default_profile_property")]
    pub profile_property: String,

    /// Scope given to bindings that did not choose one
    #[serde(default = "default_scope")]
    pub default_scope: Scope,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            eager_init: default_eager_init(),
            allow_overwrite: false,
            profile_property: default_profile_property(),
            default_scope: default_scope(),
        }
    }
}

impl ContainerSettings {
    /// Parse settings from a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        let settings: ContainerSettings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `WIREBOX_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self, SettingsError> {
        self.with_overrides(std::env::vars())
    }

    /// Apply overrides from the given variables
    pub fn with_overrides<I>(mut self, vars: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(setting) = key.strip_prefix(SETTINGS_ENV_PREFIX) else {
                continue;
            };
            match setting {
                "PROFILES" => {
                    self.profiles = value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "EAGER_INIT" => self.eager_init = parse_flag(&key, &value)?,
                "ALLOW_OVERWRITE" => self.allow_overwrite = parse_flag(&key, &value)?,
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.profile_property.trim().is_empty() {
            return Err(SettingsError::Invalid("profile_property".to_string()));
        }
        if self.profiles.iter().any(|p| p.trim().is_empty()) {
            return Err(SettingsError::Invalid("profiles".to_string()));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::Invalid(key.to_string())),
    }
}

// Default functions
fn default_eager_init() -> bool {
    true
}

fn default_profile_property() -> String {
    DEFAULT_PROFILE_PROPERTY.to_string()
}

fn default_scope() -> Scope {
    Scope::Singleton
}
