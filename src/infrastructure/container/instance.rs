//! 类型擦除的实例与契约标识

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// 契约类型标识，允许 `dyn Trait` 作为契约
#[derive(Clone, Copy)]
pub struct ContractKey {
    id: TypeId,
    /// `Arc<T>` 的类型ID，用于校验实例是否满足契约
    stored: TypeId,
    name: &'static str,
}

impl ContractKey {
    pub fn of<T: ?Sized + Send + Sync + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            stored: TypeId::of::<Arc<T>>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 实例是否满足该契约
    pub fn accepts(&self, instance: &Instance) -> bool {
        instance.stored == self.stored
    }
}

impl PartialEq for ContractKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContractKey {}

impl Hash for ContractKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 类型擦除后的实例，内部始终保存一个 `Arc<T>`
#[derive(Clone)]
pub struct Instance {
    value: Arc<dyn Any + Send + Sync>,
    stored: TypeId,
    type_name: &'static str,
}

impl Instance {
    pub fn new<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            value: Arc::new(value),
            stored: TypeId::of::<Arc<T>>(),
            type_name: type_name::<T>(),
        }
    }

    /// 安全的类型转换
    pub fn downcast<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.downcast_ref::<Arc<T>>().cloned()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// 两个句柄是否指向同一个缓存条目
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type", &self.type_name)
            .finish()
    }
}
