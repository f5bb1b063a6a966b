//! 绑定描述与依赖声明
//!
//! 依赖需求是静态声明的列表（类型 + 名称 + 可选标记），解析时按表查找，
//! 而不是在调用时检查生产者的签名。

use super::engine::ResolveRequest;
use super::instance::{ContractKey, Instance};
use super::lazy::Lazy;
use super::scope::CallScope;
use super::service::ContainerInner;
use super::Scope;
use crate::errors::{ContainerError, PropertyError};
use crate::infrastructure::properties::PropertySources;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::{Arc, Weak};

/// 目录分配的绑定ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BindingId(pub(crate) u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 绑定来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOrigin {
    /// 启动前由外部发现步骤提供
    Discovered,
    /// 通过手动注册API提供
    Manual,
}

/// 注入点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionPoint {
    Constructor,
    Field(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    /// 构造时立即解析
    Eager,
    /// 延迟句柄，在双方对象都存在之后再解析
    Lazy,
    /// 注入所有激活的候选
    All,
}

/// 依赖需求
#[derive(Debug, Clone)]
pub struct Requirement {
    pub(crate) contract: ContractKey,
    pub(crate) name: Option<String>,
    pub(crate) optional: bool,
    pub(crate) kind: RequirementKind,
    pub(crate) point: InjectionPoint,
}

impl Requirement {
    pub fn of<T: ?Sized + Send + Sync + 'static>() -> Self {
        Self {
            contract: ContractKey::of::<T>(),
            name: None,
            optional: false,
            kind: RequirementKind::Eager,
            point: InjectionPoint::Constructor,
        }
    }

    pub fn named<T: ?Sized + Send + Sync + 'static>(name: impl Into<String>) -> Self {
        Self::of::<T>().qualified(name)
    }

    pub fn lazy<T: ?Sized + Send + Sync + 'static>() -> Self {
        Self {
            kind: RequirementKind::Lazy,
            ..Self::of::<T>()
        }
    }

    pub fn all<T: ?Sized + Send + Sync + 'static>() -> Self {
        Self {
            kind: RequirementKind::All,
            ..Self::of::<T>()
        }
    }

    pub fn qualified(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 缺失时注入 "absent" 而不是让整个解析失败
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// 字段/setter 注入，在所有构造参数之后解析
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.point = InjectionPoint::Field(field.into());
        self
    }

    pub fn contract(&self) -> &ContractKey {
        &self.contract
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn kind(&self) -> RequirementKind {
        self.kind
    }

    pub(crate) fn request(&self) -> ResolveRequest {
        ResolveRequest {
            contract: self.contract,
            name: self.name.clone(),
        }
    }
}

pub(crate) type ErasedProducer =
    Arc<dyn Fn(&Dependencies<'_>) -> anyhow::Result<Instance> + Send + Sync>;
pub(crate) type ErasedHook = Arc<dyn Fn(&Instance) -> anyhow::Result<()> + Send + Sync>;

/// 生命周期钩子
#[derive(Clone)]
pub struct LifecycleHook {
    pub(crate) name: String,
    pub(crate) priority: i32,
    pub(crate) action: ErasedHook,
}

impl LifecycleHook {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 执行钩子，panic 转换为错误
    pub(crate) fn invoke(&self, instance: &Instance) -> anyhow::Result<()> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.action)(instance))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("hook '{}' panicked", self.name)),
        }
    }
}

impl fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHook")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// 绑定描述
#[derive(Clone)]
pub struct BindingDescriptor {
    pub(crate) id: BindingId,
    pub(crate) contract: ContractKey,
    pub(crate) implementation: String,
    pub(crate) name: Option<String>,
    pub(crate) scope: Scope,
    pub(crate) scope_declared: bool,
    pub(crate) primary: bool,
    pub(crate) alternative: bool,
    pub(crate) profiles: Vec<String>,
    pub(crate) lazy: bool,
    pub(crate) critical: bool,
    pub(crate) requirements: Vec<Requirement>,
    pub(crate) producer: ErasedProducer,
    pub(crate) post_construct: Vec<LifecycleHook>,
    pub(crate) pre_destroy: Vec<LifecycleHook>,
    pub(crate) origin: BindingOrigin,
}

impl BindingDescriptor {
    pub fn builder<T: ?Sized + Send + Sync + 'static>() -> DescriptorBuilder<T> {
        DescriptorBuilder::new()
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn contract(&self) -> &ContractKey {
        &self.contract
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn is_alternative(&self) -> bool {
        self.alternative
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn origin(&self) -> BindingOrigin {
        self.origin
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// 用于错误信息和日志的标签
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}({})", self.implementation, name),
            None => self.implementation.clone(),
        }
    }

    /// 目录中判断重复的标识：名称，缺省时为实现标签
    pub(crate) fn identity(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.implementation)
    }

    /// 解析顺序：先构造参数，再字段/setter，各自保持声明顺序
    pub(crate) fn resolution_order(&self) -> Vec<usize> {
        let (constructor, fields): (Vec<usize>, Vec<usize>) = (0..self.requirements.len())
            .partition(|&i| self.requirements[i].point == InjectionPoint::Constructor);
        constructor.into_iter().chain(fields).collect()
    }

    pub(crate) fn validate(&self) -> Result<(), ContainerError> {
        if self.primary && self.alternative {
            return Err(ContainerError::InvalidBinding {
                binding: self.label(),
                reason: "a binding cannot be both primary and alternative".to_string(),
            });
        }
        if self.profiles.iter().any(|p| p.trim_start_matches('!').is_empty()) {
            return Err(ContainerError::InvalidBinding {
                binding: self.label(),
                reason: "empty profile expression".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for BindingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingDescriptor")
            .field("id", &self.id)
            .field("contract", &self.contract)
            .field("implementation", &self.implementation)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("primary", &self.primary)
            .field("alternative", &self.alternative)
            .field("profiles", &self.profiles)
            .field("requirements", &self.requirements)
            .finish()
    }
}

/// 绑定描述构建器
pub struct DescriptorBuilder<T: ?Sized> {
    implementation: Option<String>,
    name: Option<String>,
    scope: Option<Scope>,
    primary: bool,
    alternative: bool,
    profiles: Vec<String>,
    lazy: bool,
    critical: bool,
    requirements: Vec<Requirement>,
    post_construct: Vec<LifecycleHook>,
    pre_destroy: Vec<LifecycleHook>,
    _contract: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> DescriptorBuilder<T> {
    fn new() -> Self {
        Self {
            implementation: None,
            name: None,
            scope: None,
            primary: false,
            alternative: false,
            profiles: Vec::new(),
            lazy: false,
            critical: false,
            requirements: Vec::new(),
            post_construct: Vec::new(),
            pre_destroy: Vec::new(),
            _contract: PhantomData,
        }
    }

    pub fn implementation(mut self, label: impl Into<String>) -> Self {
        self.implementation = Some(label.into());
        self
    }

    /// 以具体实现类型的名称作为实现标签
    pub fn implemented_by<I: ?Sized + 'static>(self) -> Self {
        let full = std::any::type_name::<I>();
        let base = full.split('<').next().unwrap_or(full);
        let short = base.rsplit("::").next().unwrap_or(base);
        self.implementation(short)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn singleton(self) -> Self {
        self.scope(Scope::Singleton)
    }

    pub fn prototype(self) -> Self {
        self.scope(Scope::Prototype)
    }

    pub fn call_bound(self) -> Self {
        self.scope(Scope::CallBound)
    }

    pub fn application(self) -> Self {
        self.scope(Scope::Application)
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn alternative(mut self) -> Self {
        self.alternative = true;
        self
    }

    /// 仅在指定 profile 激活时生效，`!name` 表示未激活时生效
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.push(profile.into());
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// 构造后钩子，按优先级升序执行
    pub fn post_construct<F>(mut self, name: impl Into<String>, priority: i32, hook: F) -> Self
    where
        F: Fn(&Arc<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.post_construct.push(LifecycleHook {
            name: name.into(),
            priority,
            action: typed_hook(hook),
        });
        self
    }

    /// 销毁前钩子，按声明顺序执行
    pub fn pre_destroy<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&Arc<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pre_destroy.push(LifecycleHook {
            name: name.into(),
            priority: 0,
            action: typed_hook(hook),
        });
        self
    }

    /// 指定生产者并完成构建
    pub fn build<F>(self, producer: F) -> BindingDescriptor
    where
        F: Fn(&Dependencies<'_>) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let contract = ContractKey::of::<T>();
        let mut post_construct = self.post_construct;
        post_construct.sort_by_key(|hook| hook.priority);

        BindingDescriptor {
            id: BindingId::default(),
            contract,
            implementation: self
                .implementation
                .unwrap_or_else(|| contract.name().to_string()),
            name: self.name,
            scope: self.scope.unwrap_or(Scope::Singleton),
            scope_declared: self.scope.is_some(),
            primary: self.primary,
            alternative: self.alternative,
            profiles: self.profiles,
            lazy: self.lazy,
            critical: self.critical,
            requirements: self.requirements,
            producer: Arc::new(move |deps: &Dependencies<'_>| producer(deps).map(Instance::new)),
            post_construct,
            pre_destroy: self.pre_destroy,
            origin: BindingOrigin::Discovered,
        }
    }
}

fn typed_hook<T, F>(hook: F) -> ErasedHook
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&Arc<T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |instance: &Instance| {
        let typed = instance.downcast::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "hook expected '{}', found '{}'",
                std::any::type_name::<T>(),
                instance.type_name()
            )
        })?;
        hook(&typed)
    })
}

/// 已解析的依赖槽位
#[derive(Clone)]
pub(crate) enum Slot {
    Present(Instance),
    /// 可选依赖缺失时的显式哨兵
    Absent,
    Many(Vec<Instance>),
    Deferred(Option<CallScope>),
}

/// 生产者接收到的依赖集合，按声明顺序索引
pub struct Dependencies<'a> {
    binding: String,
    requirements: &'a [Requirement],
    slots: Vec<Slot>,
    properties: &'a PropertySources,
    anchor: &'a Weak<ContainerInner>,
}

impl<'a> Dependencies<'a> {
    pub(crate) fn new(
        binding: String,
        requirements: &'a [Requirement],
        slots: Vec<Slot>,
        properties: &'a PropertySources,
        anchor: &'a Weak<ContainerInner>,
    ) -> Self {
        Self {
            binding,
            requirements,
            slots,
            properties,
            anchor,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 必需依赖
    pub fn get<T: ?Sized + Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Result<Arc<T>, ContainerError> {
        self.optional::<T>(index)?
            .ok_or_else(|| ContainerError::UnresolvedDependency {
                missing: self.requirements[index].contract.name().to_string(),
                requester: self.binding.clone(),
            })
    }

    /// 可选依赖，缺失时为 `None`
    pub fn optional<T: ?Sized + Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Result<Option<Arc<T>>, ContainerError> {
        match self.slot(index)? {
            Slot::Present(instance) => self.cast::<T>(instance, index).map(Some),
            Slot::Absent => Ok(None),
            _ => Err(self.kind_mismatch(index, "a single instance")),
        }
    }

    /// 集合依赖
    pub fn all<T: ?Sized + Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Result<Vec<Arc<T>>, ContainerError> {
        match self.slot(index)? {
            Slot::Many(instances) => instances
                .iter()
                .map(|instance| self.cast::<T>(instance, index))
                .collect(),
            _ => Err(self.kind_mismatch(index, "a collection")),
        }
    }

    /// 延迟句柄
    pub fn lazy<T: ?Sized + Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Result<Lazy<T>, ContainerError> {
        match self.slot(index)? {
            Slot::Deferred(call) => {
                let requirement = &self.requirements[index];
                if requirement.contract != ContractKey::of::<T>() {
                    return Err(ContainerError::TypeCastFailed {
                        expected: requirement.contract.name().to_string(),
                        actual: std::any::type_name::<T>().to_string(),
                        context: format!("lazy requirement #{} of '{}'", index, self.binding),
                    });
                }
                Ok(Lazy::new(
                    self.anchor.clone(),
                    requirement.request(),
                    call.clone(),
                ))
            }
            _ => Err(self.kind_mismatch(index, "a lazy handle")),
        }
    }

    /// 按字段名查找必需依赖
    pub fn field<T: ?Sized + Send + Sync + 'static>(
        &self,
        field: &str,
    ) -> Result<Arc<T>, ContainerError> {
        let index = self.field_index(field).ok_or_else(|| ContainerError::InvalidBinding {
            binding: self.binding.clone(),
            reason: format!("no field requirement named '{}'", field),
        })?;
        self.get::<T>(index)
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.requirements
            .iter()
            .position(|r| matches!(&r.point, InjectionPoint::Field(name) if name == field))
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key)
    }

    pub fn property_or(&self, key: &str, default: &str) -> String {
        self.property(key).unwrap_or_else(|| default.to_string())
    }

    /// 读取并解析属性值
    pub fn property_as<V>(&self, key: &str) -> Result<Option<V>, ContainerError>
    where
        V: FromStr,
        V::Err: fmt::Display,
    {
        match self.property(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<V>().map(Some).map_err(|e| {
                ContainerError::Property(PropertyError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            }),
        }
    }

    fn slot(&self, index: usize) -> Result<&Slot, ContainerError> {
        self.slots
            .get(index)
            .ok_or_else(|| ContainerError::InvalidBinding {
                binding: self.binding.clone(),
                reason: format!(
                    "requested dependency #{} but only {} declared",
                    index,
                    self.slots.len()
                ),
            })
    }

    fn cast<T: ?Sized + Send + Sync + 'static>(
        &self,
        instance: &Instance,
        index: usize,
    ) -> Result<Arc<T>, ContainerError> {
        instance
            .downcast::<T>()
            .ok_or_else(|| ContainerError::TypeCastFailed {
                expected: std::any::type_name::<T>().to_string(),
                actual: instance.type_name().to_string(),
                context: format!("dependency #{} of '{}'", index, self.binding),
            })
    }

    fn kind_mismatch(&self, index: usize, wanted: &str) -> ContainerError {
        ContainerError::InvalidBinding {
            binding: self.binding.clone(),
            reason: format!("dependency #{} is not {}", index, wanted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::properties::MapPropertySource;

    struct Clock;
    struct Repo;

    fn sources() -> PropertySources {
        PropertySources::new(vec![Arc::new(
            MapPropertySource::new("test")
                .with("pool.size", "8")
                .with("pool.name", "main"),
        )])
    }

    #[test]
    fn test_builder_defaults_and_hook_order() {
        let descriptor = BindingDescriptor::builder::<Repo>()
            .implemented_by::<Repo>()
            .post_construct("late", 10, |_| Ok(()))
            .post_construct("early", -5, |_| Ok(()))
            .post_construct("middle", 0, |_| Ok(()))
            .build(|_| Ok(Arc::new(Repo)));

        assert_eq!(descriptor.implementation(), "Repo");
        assert_eq!(descriptor.scope(), Scope::Singleton);
        assert!(!descriptor.scope_declared);
        let names: Vec<&str> = descriptor.post_construct.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_resolution_order_puts_constructor_first() {
        let descriptor = BindingDescriptor::builder::<Repo>()
            .requires(Requirement::of::<Clock>().field("clock"))
            .requires(Requirement::of::<u32>())
            .requires(Requirement::of::<String>().field("label"))
            .requires(Requirement::of::<u64>())
            .build(|_| Ok(Arc::new(Repo)));

        assert_eq!(descriptor.resolution_order(), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_primary_and_alternative_rejected() {
        let descriptor = BindingDescriptor::builder::<Repo>()
            .primary()
            .alternative()
            .build(|_| Ok(Arc::new(Repo)));
        assert!(matches!(
            descriptor.validate(),
            Err(ContainerError::InvalidBinding { .. })
        ));
    }

    #[test]
    fn test_dependencies_access() {
        let requirements = vec![
            Requirement::of::<u32>(),
            Requirement::of::<Clock>().optional(),
            Requirement::all::<u32>(),
            Requirement::of::<String>().field("label"),
        ];
        let slots = vec![
            Slot::Present(Instance::new(Arc::new(5_u32))),
            Slot::Absent,
            Slot::Many(vec![
                Instance::new(Arc::new(1_u32)),
                Instance::new(Arc::new(2_u32)),
            ]),
            Slot::Present(Instance::new(Arc::new("db".to_string()))),
        ];
        let properties = sources();
        let anchor = Weak::new();
        let deps = Dependencies::new("Repo".into(), &requirements, slots, &properties, &anchor);

        assert_eq!(*deps.get::<u32>(0).unwrap(), 5);
        assert!(deps.optional::<Clock>(1).unwrap().is_none());
        assert!(matches!(
            deps.get::<Clock>(1),
            Err(ContainerError::UnresolvedDependency { .. })
        ));
        let all: Vec<u32> = deps.all::<u32>(2).unwrap().iter().map(|v| **v).collect();
        assert_eq!(all, vec![1, 2]);
        assert_eq!(deps.field::<String>("label").unwrap().as_str(), "db");
        assert!(matches!(
            deps.get::<String>(0),
            Err(ContainerError::TypeCastFailed { .. })
        ));
        assert!(matches!(
            deps.get::<u32>(9),
            Err(ContainerError::InvalidBinding { .. })
        ));

        assert_eq!(deps.property_as::<usize>("pool.size").unwrap(), Some(8));
        assert!(deps.property_as::<usize>("pool.name").is_err());
        assert_eq!(deps.property_or("pool.timeout", "30"), "30");
    }
}
