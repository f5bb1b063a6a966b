//! 解析引擎
//!
//! 把请求（类型 + 可选名称）转换为实例：
//! 选择绑定 → 查询作用域缓存 → 递归解析依赖 → 生产 → 装饰 → 构造后钩子 → 缓存。
//! 解析链通过 `ResolutionContext` 显式传递，不同的顶层调用互不影响。

use super::catalog::BindingCatalog;
use super::decoration::DecorationGateway;
use super::descriptor::{BindingDescriptor, BindingId, Dependencies, RequirementKind, Slot};
use super::instance::{ContractKey, Instance};
use super::scope::{CallScope, ScopeStore};
use super::selector::CandidateSelector;
use super::service::ContainerInner;
use super::stats::StatsRecorder;
use crate::errors::ContainerError;
use crate::errors::ContainerWarning;
use crate::infrastructure::properties::{ActiveProfiles, PropertySources};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// 解析请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolveRequest {
    pub(crate) contract: ContractKey,
    pub(crate) name: Option<String>,
}

impl ResolveRequest {
    pub(crate) fn of<T: ?Sized + Send + Sync + 'static>(name: Option<&str>) -> Self {
        Self {
            contract: ContractKey::of::<T>(),
            name: name.map(str::to_string),
        }
    }

    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{}({})", self.contract.name(), name),
            None => self.contract.name().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ChainLink {
    contract: ContractKey,
    name: Option<String>,
    binding: Option<BindingId>,
    label: String,
}

/// 一次顶层解析的上下文：正在构造的链 + 调用作用域句柄
#[derive(Debug, Default)]
pub(crate) struct ResolutionContext {
    chain: Vec<ChainLink>,
    pub(crate) call: Option<CallScope>,
}

impl ResolutionContext {
    pub(crate) fn new(call: Option<CallScope>) -> Self {
        Self {
            chain: Vec::new(),
            call,
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.chain.len()
    }

    /// 请求入链，(类型, 名称) 已在链中即为循环依赖
    fn enter(&mut self, request: &ResolveRequest) -> Result<(), ContainerError> {
        if let Some(existing) = self
            .chain
            .iter()
            .find(|link| link.contract == request.contract && link.name == request.name)
        {
            return Err(self.cycle(existing.label.clone()));
        }
        self.chain.push(ChainLink {
            contract: request.contract,
            name: request.name.clone(),
            binding: None,
            label: request.label(),
        });
        Ok(())
    }

    /// 记录选中的绑定，同一绑定重复出现同样视为循环
    fn bind(&mut self, binding: &BindingDescriptor) -> Result<(), ContainerError> {
        if self.chain.iter().any(|link| link.binding == Some(binding.id)) {
            return Err(self.cycle(binding.label()));
        }
        if let Some(current) = self.chain.last_mut() {
            current.binding = Some(binding.id);
            current.label = binding.label();
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.chain.pop();
    }

    fn cycle(&self, closing: String) -> ContainerError {
        let mut chain: Vec<String> = self.chain.iter().map(|link| link.label.clone()).collect();
        chain.push(closing);
        ContainerError::CircularDependency { chain }
    }
}

/// 解析引擎
pub struct ResolutionEngine {
    catalog: BindingCatalog,
    scopes: ScopeStore,
    selector: RwLock<Arc<CandidateSelector>>,
    decorator: Arc<dyn DecorationGateway>,
    properties: PropertySources,
    warnings: Mutex<Vec<ContainerWarning>>,
    stats: StatsRecorder,
    anchor: Weak<ContainerInner>,
}

impl ResolutionEngine {
    pub(crate) fn new(
        decorator: Arc<dyn DecorationGateway>,
        properties: PropertySources,
        anchor: Weak<ContainerInner>,
    ) -> Self {
        Self {
            catalog: BindingCatalog::new(),
            scopes: ScopeStore::new(uuid::Uuid::new_v4()),
            selector: RwLock::new(Arc::new(CandidateSelector::default())),
            decorator,
            properties,
            warnings: Mutex::new(Vec::new()),
            stats: StatsRecorder::default(),
            anchor,
        }
    }

    pub fn catalog(&self) -> &BindingCatalog {
        &self.catalog
    }

    pub fn scopes(&self) -> &ScopeStore {
        &self.scopes
    }

    pub fn properties(&self) -> &PropertySources {
        &self.properties
    }

    pub(crate) fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    pub(crate) fn selector(&self) -> Arc<CandidateSelector> {
        self.selector.read().clone()
    }

    pub(crate) fn activate_profiles(&self, profiles: ActiveProfiles) {
        *self.selector.write() = Arc::new(CandidateSelector::new(profiles));
    }

    pub(crate) fn warnings(&self) -> Vec<ContainerWarning> {
        self.warnings.lock().clone()
    }

    fn warn(&self, warning: ContainerWarning) {
        tracing::warn!(warning = %warning, "容器警告");
        if matches!(warning, ContainerWarning::Decoration { .. }) {
            self.stats.decoration_warning();
        }
        self.warnings.lock().push(warning);
    }

    /// 为请求选出唯一的绑定
    pub(crate) fn select(
        &self,
        request: &ResolveRequest,
    ) -> Result<Option<Arc<BindingDescriptor>>, ContainerError> {
        let candidates = self.catalog.lookup_by_type(&request.contract);
        self.selector()
            .select(&request.contract, request.name.as_deref(), &candidates)
    }

    /// 解析一个请求
    pub(crate) fn resolve<'a>(
        &'a self,
        request: &'a ResolveRequest,
        requester: &'a str,
        ctx: &'a mut ResolutionContext,
    ) -> BoxFuture<'a, Result<Instance, ContainerError>> {
        Box::pin(async move {
            ctx.enter(request)?;
            let result = self.resolve_entered(request, requester, ctx).await;
            ctx.leave();
            result
        })
    }

    async fn resolve_entered(
        &self,
        request: &ResolveRequest,
        requester: &str,
        ctx: &mut ResolutionContext,
    ) -> Result<Instance, ContainerError> {
        let binding =
            self.select(request)?
                .ok_or_else(|| ContainerError::UnresolvedDependency {
                    missing: request.label(),
                    requester: requester.to_string(),
                })?;
        ctx.bind(&binding)?;
        self.instantiate(&binding, ctx).await
    }

    /// 直接解析一个已知绑定（启动预热、集合注入）
    pub(crate) fn resolve_binding<'a>(
        &'a self,
        binding: &'a Arc<BindingDescriptor>,
        ctx: &'a mut ResolutionContext,
    ) -> BoxFuture<'a, Result<Instance, ContainerError>> {
        Box::pin(async move {
            if ctx.chain.iter().any(|link| link.binding == Some(binding.id)) {
                return Err(ctx.cycle(binding.label()));
            }
            ctx.chain.push(ChainLink {
                contract: binding.contract,
                name: binding.name.clone(),
                binding: Some(binding.id),
                label: binding.label(),
            });
            let result = self.instantiate(binding, ctx).await;
            ctx.leave();
            result
        })
    }

    /// 所有激活候选的实例，保持注册顺序
    pub(crate) async fn resolve_all(
        &self,
        contract: &ContractKey,
        ctx: &mut ResolutionContext,
    ) -> Result<Vec<Instance>, ContainerError> {
        let candidates = self
            .selector()
            .select_all(&self.catalog.lookup_by_type(contract));
        let mut instances = Vec::with_capacity(candidates.len());
        for binding in &candidates {
            instances.push(self.resolve_binding(binding, ctx).await?);
        }
        Ok(instances)
    }

    async fn instantiate(
        &self,
        binding: &Arc<BindingDescriptor>,
        ctx: &mut ResolutionContext,
    ) -> Result<Instance, ContainerError> {
        self.stats.resolution();

        let Some(scope) = self.scopes.scope_for(binding.scope, ctx.call.as_ref())? else {
            let instance = self.construct(binding, ctx).await?;
            self.stats.prototype_creation();
            return Ok(instance);
        };

        if let Some(cached) = self.scopes.peek(&scope, binding.id) {
            self.stats.cache_hit();
            return Ok(cached);
        }

        let (instance, created) = self
            .scopes
            .get_or_create(scope, binding, self.construct(binding, ctx))
            .await?;
        if !created {
            self.stats.cache_hit();
        }
        Ok(instance)
    }

    /// 构造一个新实例：依赖 → 生产者 → 类型校验 → 装饰 → 构造后钩子
    async fn construct(
        &self,
        binding: &Arc<BindingDescriptor>,
        ctx: &mut ResolutionContext,
    ) -> Result<Instance, ContainerError> {
        let label = binding.label();

        // 容器级绑定的生命周期长于调用作用域，不能捕获其中的实例
        let detached = binding.scope.is_container_wide();
        let saved_call = if detached { ctx.call.take() } else { None };
        let slots = self.resolve_requirements(binding, &label, ctx).await;
        if detached {
            ctx.call = saved_call;
        }
        let slots = slots?;

        let raw = {
            let deps = Dependencies::new(
                label.clone(),
                &binding.requirements,
                slots,
                &self.properties,
                &self.anchor,
            );
            (binding.producer)(&deps).map_err(|e| ContainerError::CreationFailed {
                binding: label.clone(),
                source: e.into(),
            })?
        };

        if !binding.contract.accepts(&raw) {
            return Err(ContainerError::TypeCastFailed {
                expected: binding.contract.name().to_string(),
                actual: raw.type_name().to_string(),
                context: format!("producer of '{}'", label),
            });
        }

        let instance = self.decorate(binding, raw);

        for hook in &binding.post_construct {
            if let Err(e) = hook.invoke(&instance) {
                self.warn(ContainerWarning::PostConstruct {
                    binding: label.clone(),
                    hook: hook.name().to_string(),
                    message: e.to_string(),
                });
            }
        }

        self.stats.construction();
        tracing::debug!(binding = %label, scope = %binding.scope, depth = ctx.depth(), "实例已创建");
        Ok(instance)
    }

    async fn resolve_requirements(
        &self,
        binding: &Arc<BindingDescriptor>,
        label: &str,
        ctx: &mut ResolutionContext,
    ) -> Result<Vec<Slot>, ContainerError> {
        let mut slots = vec![Slot::Absent; binding.requirements.len()];
        for index in binding.resolution_order() {
            let requirement = &binding.requirements[index];
            slots[index] = match requirement.kind {
                RequirementKind::Lazy => Slot::Deferred(ctx.call.clone()),
                RequirementKind::All => {
                    Slot::Many(self.resolve_all(&requirement.contract, ctx).await?)
                }
                RequirementKind::Eager => {
                    let request = requirement.request();
                    if requirement.optional && self.select(&request)?.is_none() {
                        tracing::debug!(binding = %label, missing = %request.label(), "可选依赖缺失");
                        Slot::Absent
                    } else {
                        Slot::Present(self.resolve(&request, label, ctx).await?)
                    }
                }
            };
        }
        Ok(slots)
    }

    /// 恰好调用一次装饰网关；失败时降级为警告并使用原始实例
    fn decorate(&self, binding: &BindingDescriptor, raw: Instance) -> Instance {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.decorator.decorate(raw.clone(), &binding.contract)
        }));
        let message = match outcome {
            Ok(Ok(decorated)) if binding.contract.accepts(&decorated) => return decorated,
            Ok(Ok(decorated)) => format!(
                "decorator returned '{}' instead of '{}'",
                decorated.type_name(),
                binding.contract.name()
            ),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "decorator panicked".to_string(),
        };
        self.warn(ContainerWarning::Decoration {
            binding: binding.label(),
            message,
        });
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::container::decoration::{DecoratorRegistry, IdentityGateway};
    use crate::infrastructure::container::descriptor::Requirement;
    use crate::infrastructure::container::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> ResolutionEngine {
        ResolutionEngine::new(
            Arc::new(IdentityGateway),
            PropertySources::default(),
            Weak::new(),
        )
    }

    fn engine_with(decorator: impl DecorationGateway + 'static) -> ResolutionEngine {
        ResolutionEngine::new(Arc::new(decorator), PropertySources::default(), Weak::new())
    }

    async fn get<T: ?Sized + Send + Sync + 'static>(
        engine: &ResolutionEngine,
        name: Option<&str>,
    ) -> Result<Arc<T>, ContainerError> {
        let request = ResolveRequest::of::<T>(name);
        let mut ctx = ResolutionContext::new(None);
        let instance = engine.resolve(&request, "test", &mut ctx).await?;
        assert_eq!(ctx.depth(), 0);
        Ok(instance.downcast::<T>().unwrap())
    }

    struct Config {
        url: String,
    }

    struct Repository {
        config: Arc<Config>,
        clock: Option<Arc<u64>>,
    }

    #[tokio::test]
    async fn test_resolves_dependency_graph() {
        let engine = engine();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<Config>()
                    .build(|_| Ok(Arc::new(Config { url: "mem://".into() }))),
                false,
            )
            .unwrap();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<Repository>()
                    .requires(Requirement::of::<Config>())
                    .requires(Requirement::of::<u64>().optional())
                    .build(|deps| {
                        Ok(Arc::new(Repository {
                            config: deps.get::<Config>(0)?,
                            clock: deps.optional::<u64>(1)?,
                        }))
                    }),
                false,
            )
            .unwrap();

        let repo = get::<Repository>(&engine, None).await.unwrap();
        assert_eq!(repo.config.url, "mem://");
        assert!(repo.clock.is_none());

        let again = get::<Repository>(&engine, None).await.unwrap();
        assert!(Arc::ptr_eq(&repo, &again));
        let config = get::<Config>(&engine, None).await.unwrap();
        assert!(Arc::ptr_eq(&repo.config, &config));
    }

    #[tokio::test]
    async fn test_missing_dependency_names_requester() {
        let engine = engine();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<Repository>()
                    .implementation("Repository")
                    .requires(Requirement::of::<Config>())
                    .build(|deps| {
                        Ok(Arc::new(Repository {
                            config: deps.get::<Config>(0)?,
                            clock: None,
                        }))
                    }),
                false,
            )
            .unwrap();

        match get::<Repository>(&engine, None).await {
            Err(ContainerError::UnresolvedDependency { missing, requester }) => {
                assert!(missing.ends_with("Config"));
                assert_eq!(requester, "Repository");
            }
            _ => panic!("expected unresolved dependency"),
        }
        assert!(engine.scopes().snapshot(&crate::infrastructure::container::ScopeId::Singleton).is_empty());
    }

    #[derive(Debug)]
    struct A;
    #[derive(Debug)]
    struct B;

    #[tokio::test]
    async fn test_mutual_dependency_reports_chain() {
        let engine = engine();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<A>()
                    .implementation("A")
                    .requires(Requirement::of::<B>())
                    .build(|_| Ok(Arc::new(A))),
                false,
            )
            .unwrap();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<B>()
                    .implementation("B")
                    .requires(Requirement::of::<A>())
                    .build(|_| Ok(Arc::new(B))),
                false,
            )
            .unwrap();

        match get::<A>(&engine, None).await {
            Err(ContainerError::CircularDependency { chain }) => {
                assert_eq!(chain, vec!["A", "B", "A"]);
            }
            _ => panic!("expected circular dependency"),
        }
        // 链在失败后被清空，后续解析给出同样的结果
        assert!(get::<B>(&engine, None).await.unwrap_err().is_circular());
    }

    #[tokio::test]
    async fn test_self_reference_through_name_is_detected() {
        let engine = engine();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<A>()
                    .implementation("A")
                    .named("a")
                    .requires(Requirement::named::<A>("a").field("me"))
                    .build(|_| Ok(Arc::new(A))),
                false,
            )
            .unwrap();
        assert!(get::<A>(&engine, None).await.unwrap_err().is_circular());
    }

    #[tokio::test]
    async fn test_prototype_creates_fresh_instances() {
        let engine = engine();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<A>()
                    .prototype()
                    .pre_destroy("never", |_| panic!("prototype teardown"))
                    .build(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Arc::new(A))
                    }),
                false,
            )
            .unwrap();

        let first = get::<A>(&engine, None).await.unwrap();
        let second = get::<A>(&engine, None).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(engine.scopes().live_instances(), 0);
    }

    #[tokio::test]
    async fn test_producer_error_becomes_creation_failed() {
        let engine = engine();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<A>()
                    .implementation("A")
                    .build(|_| Err(anyhow::anyhow!("connection refused"))),
                false,
            )
            .unwrap();
        match get::<A>(&engine, None).await {
            Err(ContainerError::CreationFailed { binding, source }) => {
                assert_eq!(binding, "A");
                assert_eq!(source.to_string(), "connection refused");
            }
            _ => panic!("expected creation failure"),
        }
    }

    #[tokio::test]
    async fn test_decoration_failure_keeps_raw_instance() {
        let engine =
            engine_with(DecoratorRegistry::new().wrap::<u32, _>(|_| Err(anyhow::anyhow!("no proxy"))));
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<u32>()
                    .implementation("Answer")
                    .build(|_| Ok(Arc::new(42))),
                false,
            )
            .unwrap();

        assert_eq!(*get::<u32>(&engine, None).await.unwrap(), 42);
        let warnings = engine.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], ContainerWarning::Decoration { binding, .. } if binding == "Answer"));
        assert_eq!(engine.stats().snapshot(0, 0).decoration_warnings, 1);
    }

    #[tokio::test]
    async fn test_decorator_panic_is_downgraded() {
        let engine = engine_with(DecoratorRegistry::new().wrap::<u32, _>(|_| panic!("bad decorator")));
        engine
            .catalog()
            .register(BindingDescriptor::builder::<u32>().build(|_| Ok(Arc::new(7))), false)
            .unwrap();
        assert_eq!(*get::<u32>(&engine, None).await.unwrap(), 7);
        assert_eq!(engine.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_post_construct_failure_is_warning_and_instance_cached() {
        let engine = engine();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (order.clone(), order.clone());
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<A>()
                    .post_construct("second", 2, move |_| {
                        second.lock().push("second");
                        Err(anyhow::anyhow!("warm-up failed"))
                    })
                    .post_construct("first", 1, move |_| {
                        first.lock().push("first");
                        Ok(())
                    })
                    .build(|_| Ok(Arc::new(A))),
                false,
            )
            .unwrap();

        let a = get::<A>(&engine, None).await.unwrap();
        let b = get::<A>(&engine, None).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(matches!(
            engine.warnings().as_slice(),
            [ContainerWarning::PostConstruct { hook, .. }] if hook == "second"
        ));
    }

    #[tokio::test]
    async fn test_singleton_cannot_capture_call_bound_dependency() {
        let engine = engine();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<Config>()
                    .call_bound()
                    .build(|_| Ok(Arc::new(Config { url: "req".into() }))),
                false,
            )
            .unwrap();
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<Repository>()
                    .requires(Requirement::of::<Config>())
                    .build(|deps| {
                        Ok(Arc::new(Repository {
                            config: deps.get::<Config>(0)?,
                            clock: None,
                        }))
                    }),
                false,
            )
            .unwrap();

        let call = engine.scopes().open_call("request");
        let request = ResolveRequest::of::<Repository>(None);
        let mut ctx = ResolutionContext::new(Some(call.clone()));
        let err = engine.resolve(&request, "test", &mut ctx).await.unwrap_err();
        assert!(matches!(err, ContainerError::ScopeError { .. }));
        assert_eq!(ctx.call, Some(call.clone()));

        // 调用作用域内可以直接解析
        let request = ResolveRequest::of::<Config>(None);
        let instance = engine.resolve(&request, "test", &mut ctx).await.unwrap();
        assert_eq!(instance.downcast::<Config>().unwrap().url, "req");
    }

    #[tokio::test]
    async fn test_collection_requirement_follows_registration_order() {
        let engine = engine();
        for (label, value) in [("One", 1_u32), ("Two", 2), ("Skipped", 3)] {
            let mut builder = BindingDescriptor::builder::<u32>().implementation(label);
            if label == "Skipped" {
                builder = builder.alternative();
            }
            engine
                .catalog()
                .register(builder.build(move |_| Ok(Arc::new(value))), false)
                .unwrap();
        }
        engine
            .catalog()
            .register(
                BindingDescriptor::builder::<Vec<u32>>()
                    .scope(Scope::Prototype)
                    .requires(Requirement::all::<u32>())
                    .build(|deps| Ok(Arc::new(deps.all::<u32>(0)?.iter().map(|v| **v).collect()))),
                false,
            )
            .unwrap();

        assert_eq!(*get::<Vec<u32>>(&engine, None).await.unwrap(), vec![1, 2]);
    }
}
