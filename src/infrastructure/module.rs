//! 绑定模块
//!
//! 显式的配置步骤：每个模块提供一组绑定描述，注册表按模块依赖顺序收集，
//! 再交给容器构建器写入绑定目录。

use super::container::BindingDescriptor;
use crate::errors::ModuleError;
use std::collections::HashMap;
use std::sync::Arc;

/// 模块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// 已注册，尚未收集
    Registered,
    /// 收集中
    Collecting,
    /// 绑定已收集
    Collected,
    /// 模块未启用，不提供绑定
    Disabled,
    /// 收集失败
    Failed,
}

/// 模块接口
pub trait BindingModule: Send + Sync {
    /// 模块名称
    fn name(&self) -> &str;

    /// 依赖的模块
    fn dependencies(&self) -> Vec<&str> {
        Vec::new()
    }

    /// 检查模块是否可用
    fn is_enabled(&self) -> bool {
        true
    }

    /// 模块提供的绑定
    fn bindings(&self) -> Vec<BindingDescriptor>;
}

/// 模块注册表
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn BindingModule>>,
    status: HashMap<String, ModuleStatus>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模块，同名模块只保留第一次注册
    pub fn register(&mut self, module: Arc<dyn BindingModule>) -> bool {
        let name = module.name().to_string();
        if self.status.contains_key(&name) {
            tracing::debug!(module = %name, "模块已注册，忽略");
            return false;
        }
        self.status.insert(name, ModuleStatus::Registered);
        self.modules.push(module);
        true
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn status(&self, name: &str) -> Option<ModuleStatus> {
        self.status.get(name).copied()
    }

    pub fn statuses(&self) -> HashMap<String, ModuleStatus> {
        self.status.clone()
    }

    /// 依赖在前的模块顺序
    pub fn ordered(&self) -> Result<Vec<Arc<dyn BindingModule>>, ModuleError> {
        let by_name: HashMap<&str, &Arc<dyn BindingModule>> =
            self.modules.iter().map(|m| (m.name(), m)).collect();

        let mut ordered = Vec::with_capacity(self.modules.len());
        let mut done: Vec<String> = Vec::new();
        let mut path: Vec<String> = Vec::new();
        for module in &self.modules {
            visit(module, &by_name, &mut path, &mut done, &mut ordered)?;
        }
        Ok(ordered)
    }

    /// 按依赖顺序收集所有启用模块的绑定
    pub fn collect(&mut self) -> Result<Vec<BindingDescriptor>, ModuleError> {
        let ordered = match self.ordered() {
            Ok(ordered) => ordered,
            Err(e) => {
                for status in self.status.values_mut() {
                    *status = ModuleStatus::Failed;
                }
                return Err(e);
            }
        };

        let mut descriptors = Vec::new();
        for module in ordered {
            let name = module.name().to_string();
            if !module.is_enabled() {
                self.status.insert(name, ModuleStatus::Disabled);
                continue;
            }
            self.status.insert(name.clone(), ModuleStatus::Collecting);
            let bindings = module.bindings();
            tracing::debug!(module = %name, count = bindings.len(), "模块绑定已收集");
            descriptors.extend(bindings);
            self.status.insert(name, ModuleStatus::Collected);
        }
        Ok(descriptors)
    }
}

fn visit(
    module: &Arc<dyn BindingModule>,
    by_name: &HashMap<&str, &Arc<dyn BindingModule>>,
    path: &mut Vec<String>,
    done: &mut Vec<String>,
    ordered: &mut Vec<Arc<dyn BindingModule>>,
) -> Result<(), ModuleError> {
    let name = module.name().to_string();
    if done.contains(&name) {
        return Ok(());
    }
    if path.contains(&name) {
        let start = path.iter().position(|n| *n == name).unwrap_or(0);
        let mut cycle = path[start..].to_vec();
        cycle.push(name);
        return Err(ModuleError::CircularDependency(cycle));
    }

    path.push(name.clone());
    for dependency in module.dependencies() {
        let target = by_name
            .get(dependency)
            .ok_or_else(|| ModuleError::DependencyNotFound(dependency.to_string()))?;
        visit(target, by_name, path, done, ordered)?;
    }
    path.pop();

    done.push(name);
    ordered.push(module.clone());
    Ok(())
}
