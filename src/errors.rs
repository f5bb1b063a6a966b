use crate::infrastructure::container::{ContainerState, ScopeId};
use std::fmt;
use thiserror::Error;

/// 来自生产者/钩子/装饰器等外部回调的错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 容器错误
#[derive(Debug, Error)]
pub enum ContainerError {
    /// 循环依赖 - 携带完整的解析链
    #[error("Circular dependency detected: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Unresolved dependency: no binding for '{missing}' (required by {requester})")]
    UnresolvedDependency { missing: String, requester: String },

    #[error("Ambiguous binding for '{contract}': candidates [{}]", candidates.join(", "))]
    AmbiguousBinding {
        contract: String,
        candidates: Vec<String>,
    },

    #[error("Duplicate binding for '{contract}' ({identity}, scope {scope})")]
    DuplicateBinding {
        contract: String,
        identity: String,
        scope: String,
    },

    #[error("Container is closed")]
    ContainerClosed,

    #[error("Container has not been started (current state: {state})")]
    NotStarted { state: ContainerState },

    #[error("Operation '{operation}' is not allowed in state {state}")]
    IllegalState {
        operation: String,
        state: ContainerState,
    },

    #[error("Scope '{scope}' error: {reason}")]
    ScopeError { scope: String, reason: String },

    #[error("Failed to create '{binding}': {source}")]
    CreationFailed {
        binding: String,
        #[source]
        source: BoxError,
    },

    #[error("Type cast failed: expected '{expected}', found '{actual}' in {context}")]
    TypeCastFailed {
        expected: String,
        actual: String,
        context: String,
    },

    #[error("Invalid binding '{binding}': {reason}")]
    InvalidBinding { binding: String, reason: String },

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("Property source error: {0}")]
    Property(#[from] PropertyError),
}

impl ContainerError {
    pub(crate) fn scope(scope: &ScopeId, reason: impl Into<String>) -> Self {
        ContainerError::ScopeError {
            scope: scope.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn illegal_state(operation: &str, state: ContainerState) -> Self {
        ContainerError::IllegalState {
            operation: operation.to_string(),
            state,
        }
    }

    /// 是否为循环依赖错误
    pub fn is_circular(&self) -> bool {
        matches!(self, ContainerError::CircularDependency { .. })
    }
}

/// 单个销毁钩子的失败记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub binding: String,
    pub hook: String,
    pub scope: String,
    pub message: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] hook '{}': {}",
            self.binding, self.scope, self.hook, self.message
        )
    }
}

/// 聚合的销毁错误，在停止流程结束后统一报告一次
#[derive(Debug, Clone, Error)]
#[error("{} teardown hook(s) failed: {}", failures.len(), render_failures(failures))]
pub struct TeardownError {
    pub failures: Vec<TeardownFailure>,
}

impl TeardownError {
    pub(crate) fn from_failures(failures: Vec<TeardownFailure>) -> Result<(), TeardownError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }
}

fn render_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 非致命警告：构建继续进行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerWarning {
    /// 装饰失败，使用原始实例
    Decoration { binding: String, message: String },
    /// 构造后钩子失败，实例仍然被缓存
    PostConstruct {
        binding: String,
        hook: String,
        message: String,
    },
}

impl fmt::Display for ContainerWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerWarning::Decoration { binding, message } => {
                write!(f, "decoration of '{}' failed: {}", binding, message)
            }
            ContainerWarning::PostConstruct {
                binding,
                hook,
                message,
            } => write!(
                f,
                "post-construct hook '{}' of '{}' failed: {}",
                hook, binding, message
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Dependency module not found: {0}")]
    DependencyNotFound(String),
    #[error("Circular module dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("Failed to load property source '{source_name}': {reason}")]
    LoadFailed { source_name: String, reason: String },
    #[error("Property '{key}' has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to parse container settings: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid container setting '{0}'")]
    Invalid(String),
}
