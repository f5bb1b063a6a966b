//! 绑定目录
//!
//! 保存声明的绑定（类型 → 描述，名称 → 绑定）。启动前由发现步骤填充，
//! 启动后只接受手动注册，且遵循同样的约束。

use super::descriptor::{BindingDescriptor, BindingId, BindingOrigin};
use super::instance::ContractKey;
use crate::errors::ContainerError;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// 注册结果
#[derive(Debug)]
pub struct Registration {
    pub id: BindingId,
    /// 被覆盖的旧绑定
    pub replaced: Option<Arc<BindingDescriptor>>,
}

#[derive(Default)]
struct CatalogInner {
    /// 按注册顺序保存
    bindings: Vec<Arc<BindingDescriptor>>,
    by_type: HashMap<TypeId, Vec<BindingId>>,
    by_name: HashMap<String, BindingId>,
    next_id: u64,
    sealed: bool,
}

impl CatalogInner {
    fn find(&self, id: BindingId) -> Option<&Arc<BindingDescriptor>> {
        self.bindings.iter().find(|b| b.id == id)
    }

    fn remove(&mut self, id: BindingId) -> Option<Arc<BindingDescriptor>> {
        let position = self.bindings.iter().position(|b| b.id == id)?;
        let removed = self.bindings.remove(position);
        if let Some(ids) = self.by_type.get_mut(&removed.contract.id()) {
            ids.retain(|existing| *existing != id);
        }
        if let Some(name) = &removed.name {
            self.by_name.remove(name);
        }
        Some(removed)
    }

    /// 与新描述冲突的已有绑定
    fn conflict_with(&self, descriptor: &BindingDescriptor) -> Option<BindingId> {
        if let Some(name) = &descriptor.name {
            if let Some(id) = self.by_name.get(name) {
                return Some(*id);
            }
        }
        self.by_type
            .get(&descriptor.contract.id())?
            .iter()
            .filter_map(|id| self.find(*id))
            .find(|existing| {
                existing.identity() == descriptor.identity() && existing.scope == descriptor.scope
            })
            .map(|existing| existing.id)
    }
}

/// 绑定目录
#[derive(Default)]
pub struct BindingCatalog {
    inner: RwLock<CatalogInner>,
}

impl BindingCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册绑定；冲突时除非 `overwrite` 否则返回 DuplicateBinding
    pub fn register(
        &self,
        mut descriptor: BindingDescriptor,
        overwrite: bool,
    ) -> Result<Registration, ContainerError> {
        descriptor.validate()?;

        let mut inner = self.inner.write();
        if inner.sealed && descriptor.origin != BindingOrigin::Manual {
            return Err(ContainerError::InvalidBinding {
                binding: descriptor.label(),
                reason: "catalog is sealed; only manual registrations are accepted after start"
                    .to_string(),
            });
        }

        let replaced = match inner.conflict_with(&descriptor) {
            Some(existing) if overwrite => inner.remove(existing),
            Some(existing) => {
                let scope = inner
                    .find(existing)
                    .map(|b| b.scope.to_string())
                    .unwrap_or_default();
                return Err(ContainerError::DuplicateBinding {
                    contract: descriptor.contract.name().to_string(),
                    identity: descriptor.identity().to_string(),
                    scope,
                });
            }
            None => None,
        };

        inner.next_id += 1;
        let id = BindingId(inner.next_id);
        descriptor.id = id;

        let contract = descriptor.contract.id();
        let name = descriptor.name.clone();
        tracing::debug!(binding = %descriptor.label(), scope = %descriptor.scope, %id, "绑定已注册");

        inner.bindings.push(Arc::new(descriptor));
        inner.by_type.entry(contract).or_default().push(id);
        if let Some(name) = name {
            inner.by_name.insert(name, id);
        }

        Ok(Registration { id, replaced })
    }

    /// 按类型查找，保持注册顺序
    pub fn lookup_by_type(&self, contract: &ContractKey) -> Vec<Arc<BindingDescriptor>> {
        let inner = self.inner.read();
        inner
            .by_type
            .get(&contract.id())
            .map(|ids| ids.iter().filter_map(|id| inner.find(*id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<BindingDescriptor>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.find(*id).cloned())
    }

    pub fn get(&self, id: BindingId) -> Option<Arc<BindingDescriptor>> {
        self.inner.read().find(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<BindingDescriptor>> {
        self.inner.read().bindings.clone()
    }

    pub fn contains(&self, contract: &ContractKey) -> bool {
        self.inner
            .read()
            .by_type
            .get(&contract.id())
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn len(&self) -> usize {
        self.inner.read().bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动时封存
    pub(crate) fn seal(&self) {
        self.inner.write().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }
}
