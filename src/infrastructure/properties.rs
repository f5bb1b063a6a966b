//! 属性源与 profile
//!
//! 容器只消费键值查询与激活的 profile 集合，属性文件的加载由外部负责。

use crate::errors::PropertyError;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// 属性源接口
pub trait PropertySource: Send + Sync {
    fn name(&self) -> &str;

    /// 容器启动时调用
    fn load(&self) -> Result<(), PropertyError> {
        Ok(())
    }

    fn property(&self, key: &str) -> Option<String>;

    /// 该属性源声明的激活 profile
    fn active_profiles(&self) -> Vec<String> {
        Vec::new()
    }
}

/// 内存属性源
#[derive(Debug, Clone, Default)]
pub struct MapPropertySource {
    name: String,
    values: HashMap<String, String>,
    profiles: Vec<String>,
}

impl MapPropertySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: HashMap::new(),
            profiles: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.push(profile.into());
        self
    }
}

impl PropertySource for MapPropertySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn property(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn active_profiles(&self) -> Vec<String> {
        self.profiles.clone()
    }
}

/// 环境变量属性源：`APP_DB_URL` → `db.url`
pub struct EnvPropertySource {
    prefix: String,
    snapshot: RwLock<HashMap<String, String>>,
}

impl EnvPropertySource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    fn normalize(&self, var: &str) -> Option<String> {
        let rest = var.strip_prefix(&self.prefix)?;
        if rest.is_empty() {
            return None;
        }
        Some(rest.to_lowercase().replace('_', "."))
    }

    fn collect<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        vars.into_iter()
            .filter_map(|(key, value)| self.normalize(&key).map(|k| (k, value)))
            .collect()
    }
}

impl PropertySource for EnvPropertySource {
    fn name(&self) -> &str {
        "environment"
    }

    fn load(&self) -> Result<(), PropertyError> {
        let collected = self.collect(std::env::vars());
        tracing::debug!(prefix = %self.prefix, count = collected.len(), "环境变量属性已加载");
        *self.snapshot.write() = collected;
        Ok(())
    }

    fn property(&self, key: &str) -> Option<String> {
        self.snapshot.read().get(key).cloned()
    }
}

/// 有序的属性源集合，先注册者优先
#[derive(Clone, Default)]
pub struct PropertySources {
    sources: Vec<Arc<dyn PropertySource>>,
}

impl PropertySources {
    pub fn new(sources: Vec<Arc<dyn PropertySource>>) -> Self {
        Self { sources }
    }

    pub fn push(&mut self, source: Arc<dyn PropertySource>) {
        self.sources.push(source);
    }

    pub fn load_all(&self) -> Result<(), PropertyError> {
        for source in &self.sources {
            source.load()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.sources.iter().find_map(|s| s.property(key))
    }

    pub fn declared_profiles(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|s| s.active_profiles())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// 激活的 profile 集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveProfiles {
    names: BTreeSet<String>,
}

impl ActiveProfiles {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .map(|n: String| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    /// 解析逗号分隔的列表
    pub fn parse_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// 门控是否满足：空门控总是满足；任一表达式满足即可
    pub fn admits(&self, gate: &[String]) -> bool {
        gate.is_empty()
            || gate.iter().any(|expr| match expr.strip_prefix('!') {
                Some(negated) => !self.is_active(negated),
                None => self.is_active(expr),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}
