//! 装饰网关
//!
//! 引擎在原始构造之后调用网关，由外部能力包装实例（如拦截、代理）。
//! 包装通过显式的包装类型完成，不做运行时子类化。

use super::instance::{ContractKey, Instance};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// 装饰能力接口
pub trait DecorationGateway: Send + Sync {
    fn decorate(&self, instance: Instance, contract: &ContractKey) -> anyhow::Result<Instance>;
}

/// 默认实现：原样返回
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityGateway;

impl DecorationGateway for IdentityGateway {
    fn decorate(&self, instance: Instance, _contract: &ContractKey) -> anyhow::Result<Instance> {
        Ok(instance)
    }
}

type ErasedDecorator = Arc<dyn Fn(Instance) -> anyhow::Result<Instance> + Send + Sync>;

/// 按契约类型注册的类型化包装器
#[derive(Clone, Default)]
pub struct DecoratorRegistry {
    decorators: HashMap<TypeId, Vec<ErasedDecorator>>,
}

impl DecoratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为契约 `T` 添加包装器，按添加顺序依次应用
    pub fn wrap<T, F>(mut self, decorator: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<T>) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let erased: ErasedDecorator = Arc::new(move |instance: Instance| {
            let typed = instance.downcast::<T>().ok_or_else(|| {
                anyhow::anyhow!(
                    "decorator for '{}' received '{}'",
                    std::any::type_name::<T>(),
                    instance.type_name()
                )
            })?;
            decorator(typed).map(Instance::new)
        });
        self.decorators
            .entry(TypeId::of::<T>())
            .or_default()
            .push(erased);
        self
    }

    pub fn len(&self) -> usize {
        self.decorators.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.decorators.is_empty()
    }
}

impl DecorationGateway for DecoratorRegistry {
    fn decorate(&self, instance: Instance, contract: &ContractKey) -> anyhow::Result<Instance> {
        match self.decorators.get(&contract.id()) {
            None => Ok(instance),
            Some(chain) => chain.iter().try_fold(instance, |current, decorator| decorator(current)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Counter: Send + Sync {
        fn value(&self) -> u32;
    }

    struct Base;
    impl Counter for Base {
        fn value(&self) -> u32 {
            1
        }
    }

    struct Doubling(Arc<dyn Counter>);
    impl Counter for Doubling {
        fn value(&self) -> u32 {
            self.0.value() * 2
        }
    }

    #[test]
    fn test_identity_returns_same_instance() {
        let instance = Instance::new(Arc::new(5_u8));
        let out = IdentityGateway
            .decorate(instance.clone(), &ContractKey::of::<u8>())
            .unwrap();
        assert!(out.ptr_eq(&instance));
    }

    #[test]
    fn test_registry_applies_wrappers_in_order() {
        let registry = DecoratorRegistry::new()
            .wrap::<dyn Counter, _>(|inner| Ok(Arc::new(Doubling(inner)) as Arc<dyn Counter>))
            .wrap::<dyn Counter, _>(|inner| Ok(Arc::new(Doubling(inner)) as Arc<dyn Counter>));
        assert_eq!(registry.len(), 2);

        let raw: Arc<dyn Counter> = Arc::new(Base);
        let decorated = registry
            .decorate(Instance::new(raw), &ContractKey::of::<dyn Counter>())
            .unwrap();
        assert_eq!(decorated.downcast::<dyn Counter>().unwrap().value(), 4);

        // 其他契约不受影响
        let other = Instance::new(Arc::new(3_u64));
        let same = registry
            .decorate(other.clone(), &ContractKey::of::<u64>())
            .unwrap();
        assert!(same.ptr_eq(&other));
    }

    #[test]
    fn test_wrapper_error_propagates_to_caller() {
        let registry =
            DecoratorRegistry::new().wrap::<u64, _>(|_| Err(anyhow::anyhow!("proxy unavailable")));
        let result = registry.decorate(Instance::new(Arc::new(1_u64)), &ContractKey::of::<u64>());
        assert!(result.is_err());
    }
}
