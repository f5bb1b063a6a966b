//! 服务容器
//!
//! 拥有一个绑定目录和一个作用域存储，负责启动（分阶段预先创建容器级实例）
//! 与停止（从内到外驱逐作用域）。容器之间互不共享状态，可以并行运行。

use super::decoration::{DecorationGateway, IdentityGateway};
use super::descriptor::{BindingDescriptor, BindingId, BindingOrigin, Dependencies};
use super::engine::{ResolutionContext, ResolutionEngine, ResolveRequest};
use super::instance::{ContractKey, Instance};
use super::scope::{CallScope, InFlightGate};
use super::stats::ContainerStats;
use super::{ContainerState, Scope, ScopeId};
use crate::config::ContainerSettings;
use crate::errors::{ContainerError, ContainerWarning, ModuleError, TeardownError, TeardownFailure};
use crate::infrastructure::module::{BindingModule, ModuleRegistry};
use crate::infrastructure::properties::{ActiveProfiles, PropertySource, PropertySources};
use crate::logging::OperationTimer;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// 容器共享状态
pub struct ContainerInner {
    pub(crate) engine: ResolutionEngine,
    state: RwLock<ContainerState>,
    settings: ContainerSettings,
    builder_profiles: Vec<String>,
    active: RwLock<ActiveProfiles>,
    /// 运行期覆盖注册产生的销毁失败，停止时一并报告
    pending_failures: Mutex<Vec<TeardownFailure>>,
    /// 顶层解析的闸门，停止时先关闭并等待其排空，再驱逐作用域
    resolutions: InFlightGate,
    /// 串行化 start/stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl ContainerInner {
    fn state(&self) -> ContainerState {
        *self.state.read()
    }

    fn set_state(&self, next: ContainerState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        tracing::info!(from = %previous, to = %next, "容器状态变更");
    }

    fn check_resolvable(&self) -> Result<(), ContainerError> {
        match self.state() {
            ContainerState::Created => Err(ContainerError::NotStarted {
                state: ContainerState::Created,
            }),
            state if state.is_closed() => Err(ContainerError::ContainerClosed),
            _ => Ok(()),
        }
    }

    /// 在新的解析链中解析请求
    pub(crate) async fn resolve_request(
        &self,
        request: &ResolveRequest,
        call: Option<CallScope>,
    ) -> Result<Instance, ContainerError> {
        self.check_resolvable()?;
        let _in_flight = self
            .resolutions
            .enter()
            .ok_or(ContainerError::ContainerClosed)?;
        let mut ctx = ResolutionContext::new(call);
        let result = self.engine.resolve(request, "container", &mut ctx).await;
        self.closed_if_stopping(result)
    }

    async fn resolve_all(
        &self,
        contract: &ContractKey,
        call: Option<CallScope>,
    ) -> Result<Vec<Instance>, ContainerError> {
        self.check_resolvable()?;
        let _in_flight = self
            .resolutions
            .enter()
            .ok_or(ContainerError::ContainerClosed)?;
        let mut ctx = ResolutionContext::new(call);
        let result = self.engine.resolve_all(contract, &mut ctx).await;
        self.closed_if_stopping(result)
    }

    /// 解析结束时容器已进入停止流程，结果即将被销毁，统一报告为 ContainerClosed
    fn closed_if_stopping<R>(&self, result: Result<R, ContainerError>) -> Result<R, ContainerError> {
        if self.state().is_closed() {
            return Err(ContainerError::ContainerClosed);
        }
        result
    }

    fn compute_profiles(&self) -> ActiveProfiles {
        let properties = self.engine.properties();
        let mut names = self.builder_profiles.clone();
        names.extend(self.settings.profiles.iter().cloned());
        names.extend(properties.declared_profiles());
        if let Some(raw) = properties.get(&self.settings.profile_property) {
            names.extend(ActiveProfiles::parse_list(&raw));
        }
        ActiveProfiles::new(names)
    }

    async fn boot(&self) -> Result<(), ContainerError> {
        self.engine.properties().load_all()?;

        let profiles = self.compute_profiles();
        tracing::info!(profiles = ?profiles.names(), "激活的 profile");
        self.engine.activate_profiles(profiles.clone());
        *self.active.write() = profiles;

        self.engine.catalog().seal();

        if !self.settings.eager_init {
            tracing::debug!("预先实例化已禁用");
            return Ok(());
        }

        let selector = self.engine.selector();
        let (critical, standard): (Vec<Arc<BindingDescriptor>>, Vec<Arc<BindingDescriptor>>) = self
            .engine
            .catalog()
            .all()
            .into_iter()
            .filter(|b| b.scope.is_container_wide() && !b.lazy && selector.is_active(b))
            .partition(|b| b.critical);

        for (phase, bindings) in [("critical", critical), ("standard", standard)] {
            for binding in &bindings {
                let mut ctx = ResolutionContext::new(None);
                self.engine.resolve_binding(binding, &mut ctx).await?;
            }
            tracing::debug!(phase, count = bindings.len(), "预先实例化阶段完成");
        }
        Ok(())
    }

    /// 从内到外驱逐所有作用域，收集销毁失败
    async fn shutdown(&self) -> Vec<TeardownFailure> {
        self.set_state(ContainerState::Stopping);
        self.resolutions.close_and_drain().await;
        let scopes = self.engine.scopes();

        let mut failures = std::mem::take(&mut *self.pending_failures.lock());
        for scope in scopes.call_scopes() {
            match scopes.evict(scope).await {
                Ok(found) => failures.extend(found),
                Err(e) => tracing::debug!(scope = %scope, error = %e, "作用域已被驱逐"),
            }
        }

        // 单例与应用作用域都是容器级的，按统一的创建逆序销毁
        let container_wide = [ScopeId::Singleton, scopes.application_scope()];
        match scopes.evict_many(&container_wide).await {
            Ok(found) => failures.extend(found),
            Err(e) => tracing::debug!(error = %e, "容器级作用域已被驱逐"),
        }

        self.set_state(ContainerState::Stopped);
        failures
    }

    fn register_manual(
        &self,
        mut descriptor: BindingDescriptor,
        overwrite: bool,
    ) -> Result<BindingId, ContainerError> {
        let state = self.state();
        if !matches!(state, ContainerState::Created | ContainerState::Started) {
            return Err(ContainerError::illegal_state("register", state));
        }

        descriptor.origin = BindingOrigin::Manual;
        if !descriptor.scope_declared {
            descriptor.scope = self.settings.default_scope;
        }
        let registration = self.engine.catalog().register(descriptor, overwrite)?;

        if let Some(replaced) = registration.replaced {
            let failures = self.engine.scopes().evict_binding(replaced.id);
            tracing::info!(binding = %replaced.label(), "绑定已被覆盖");
            self.pending_failures.lock().extend(failures);
        }
        Ok(registration.id)
    }
}

/// 服务容器
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<ContainerInner>,
}

impl ServiceContainer {
    /// 创建一个空容器
    pub fn new() -> Self {
        Self::assemble(
            Arc::new(IdentityGateway),
            PropertySources::default(),
            Vec::new(),
            ContainerSettings::default(),
        )
    }

    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    fn assemble(
        decorator: Arc<dyn DecorationGateway>,
        properties: PropertySources,
        builder_profiles: Vec<String>,
        settings: ContainerSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|anchor| ContainerInner {
            engine: ResolutionEngine::new(decorator, properties, anchor.clone()),
            state: RwLock::new(ContainerState::Created),
            settings,
            builder_profiles,
            active: RwLock::new(ActiveProfiles::default()),
            pending_failures: Mutex::new(Vec::new()),
            resolutions: InFlightGate::default(),
            lifecycle: tokio::sync::Mutex::new(()),
        });
        Self { inner }
    }

    pub fn state(&self) -> ContainerState {
        self.inner.state()
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.inner.settings
    }

    /// 启动容器：加载属性源、激活 profile、封存目录、分阶段预先实例化
    pub async fn start(&self) -> Result<(), ContainerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.inner.state();
        if state != ContainerState::Created {
            return Err(ContainerError::illegal_state("start", state));
        }

        let timer = OperationTimer::new("container.start");
        self.inner.set_state(ContainerState::Starting);
        match self.inner.boot().await {
            Ok(()) => {
                self.inner.set_state(ContainerState::Started);
                tracing::info!(bindings = self.inner.engine.catalog().len(), "容器已启动");
                timer.finish();
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "容器启动失败，开始回收");
                let failures = self.inner.shutdown().await;
                for failure in &failures {
                    tracing::warn!(failure = %failure, "回收过程中的销毁失败");
                }
                Err(e)
            }
        }
    }

    /// 停止容器；销毁失败在全部作用域处理完之后统一返回
    pub async fn stop(&self) -> Result<(), TeardownError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.inner.state() {
            ContainerState::Stopped => return Ok(()),
            ContainerState::Created => {
                self.inner.set_state(ContainerState::Stopped);
                return TeardownError::from_failures(std::mem::take(
                    &mut *self.inner.pending_failures.lock(),
                ));
            }
            _ => {}
        }

        let failures = self.inner.shutdown().await;
        if !failures.is_empty() {
            tracing::warn!(count = failures.len(), "停止过程中存在销毁失败");
        }
        TeardownError::from_failures(failures)
    }

    /// 解析服务
    pub async fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.resolve_typed::<T>(None, None).await
    }

    /// 按名称解析服务
    pub async fn get_named<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ContainerError> {
        self.resolve_typed::<T>(Some(name), None).await
    }

    /// 在调用作用域内解析服务
    pub async fn get_in<T: ?Sized + Send + Sync + 'static>(
        &self,
        call: &CallScope,
    ) -> Result<Arc<T>, ContainerError> {
        self.resolve_typed::<T>(None, Some(call)).await
    }

    pub async fn get_named_in<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
        call: &CallScope,
    ) -> Result<Arc<T>, ContainerError> {
        self.resolve_typed::<T>(Some(name), Some(call)).await
    }

    /// 所有激活候选的实例，保持注册顺序
    pub async fn get_all<T: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Vec<Arc<T>>, ContainerError> {
        let instances = self
            .inner
            .resolve_all(&ContractKey::of::<T>(), None)
            .await?;
        instances.iter().map(|i| cast::<T>(i)).collect()
    }

    async fn resolve_typed<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: Option<&str>,
        call: Option<&CallScope>,
    ) -> Result<Arc<T>, ContainerError> {
        let request = ResolveRequest::of::<T>(name);
        let instance = self.inner.resolve_request(&request, call.cloned()).await?;
        cast::<T>(&instance)
    }

    /// 手动注册绑定，遵循与发现的绑定相同的约束
    pub fn register_binding(&self, descriptor: BindingDescriptor) -> Result<BindingId, ContainerError> {
        self.inner
            .register_manual(descriptor, self.inner.settings.allow_overwrite)
    }

    /// 以生产者注册绑定
    pub fn register_binding_fn<T, F>(&self, scope: Scope, producer: F) -> Result<BindingId, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Dependencies<'_>) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.register_binding(BindingDescriptor::builder::<T>().scope(scope).build(producer))
    }

    /// 注册现成的实例；首次获取时经过装饰网关
    pub fn register_instance<T>(&self, name: impl Into<String>, instance: Arc<T>) -> Result<BindingId, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.inner
            .register_manual(instance_binding(name.into(), instance), false)
    }

    /// 替换同名实例；旧实例执行销毁钩子后移除
    pub fn replace_instance<T>(&self, name: impl Into<String>, instance: Arc<T>) -> Result<BindingId, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.inner
            .register_manual(instance_binding(name.into(), instance), true)
    }

    /// 打开调用作用域
    pub fn begin_call_scope(&self, name: impl Into<String>) -> Result<CallScope, ContainerError> {
        self.inner.check_resolvable()?;
        Ok(self.inner.engine.scopes().open_call(name))
    }

    /// 结束调用作用域，按创建逆序执行销毁钩子
    pub async fn end_call_scope(&self, call: &CallScope) -> Result<(), ContainerError> {
        let id = call.scope_id();
        if !self.inner.engine.scopes().is_open(&id) {
            return Err(ContainerError::scope(&id, "call scope is not active"));
        }
        let failures = self.inner.engine.scopes().evict(id).await?;
        TeardownError::from_failures(failures)?;
        Ok(())
    }

    pub fn stats(&self) -> ContainerStats {
        let engine = &self.inner.engine;
        engine
            .stats()
            .snapshot(engine.catalog().len(), engine.scopes().live_instances())
    }

    /// 非致命警告（装饰失败、构造后钩子失败）
    pub fn warnings(&self) -> Vec<ContainerWarning> {
        self.inner.engine.warnings()
    }

    pub fn active_profiles(&self) -> Vec<String> {
        self.inner.active.read().names()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.inner.engine.properties().get(key)
    }

    pub fn is_registered<T: ?Sized + Send + Sync + 'static>(&self) -> bool {
        self.inner.engine.catalog().contains(&ContractKey::of::<T>())
    }

    pub fn bindings(&self) -> Vec<Arc<BindingDescriptor>> {
        self.inner.engine.catalog().all()
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

fn cast<T: ?Sized + Send + Sync + 'static>(instance: &Instance) -> Result<Arc<T>, ContainerError> {
    instance
        .downcast::<T>()
        .ok_or_else(|| ContainerError::TypeCastFailed {
            expected: std::any::type_name::<T>().to_string(),
            actual: instance.type_name().to_string(),
            context: "container lookup".to_string(),
        })
}

fn instance_binding<T>(name: String, instance: Arc<T>) -> BindingDescriptor
where
    T: ?Sized + Send + Sync + 'static,
{
    BindingDescriptor::builder::<T>()
        .implementation(format!("instance:{}", name))
        .named(name)
        .singleton()
        .build(move |_| Ok(instance.clone()))
}

/// 容器构建器
pub struct ContainerBuilder {
    descriptors: Vec<BindingDescriptor>,
    modules: ModuleRegistry,
    decorator: Arc<dyn DecorationGateway>,
    properties: PropertySources,
    profiles: Vec<String>,
    settings: ContainerSettings,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            descriptors: Vec::new(),
            modules: ModuleRegistry::new(),
            decorator: Arc::new(IdentityGateway),
            properties: PropertySources::default(),
            profiles: Vec::new(),
            settings: ContainerSettings::default(),
        }
    }

    pub fn binding(mut self, descriptor: BindingDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn bindings<I>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = BindingDescriptor>,
    {
        self.descriptors.extend(descriptors);
        self
    }

    pub fn module(mut self, module: Arc<dyn BindingModule>) -> Self {
        self.modules.register(module);
        self
    }

    pub fn decorator(mut self, decorator: impl DecorationGateway + 'static) -> Self {
        self.decorator = Arc::new(decorator);
        self
    }

    /// 追加属性源，先追加者优先
    pub fn property_source(mut self, source: impl PropertySource + 'static) -> Self {
        self.properties.push(Arc::new(source));
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.push(profile.into());
        self
    }

    pub fn settings(mut self, settings: ContainerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 收集模块绑定并写入目录；模块绑定在直接添加的绑定之前
    pub fn build(self) -> Result<ServiceContainer, ModuleError> {
        let mut modules = self.modules;
        let mut descriptors = modules.collect()?;
        descriptors.extend(self.descriptors);

        let allow_overwrite = self.settings.allow_overwrite;
        let default_scope = self.settings.default_scope;
        let container =
            ServiceContainer::assemble(self.decorator, self.properties, self.profiles, self.settings);

        let count = descriptors.len();
        for mut descriptor in descriptors {
            if !descriptor.scope_declared {
                descriptor.scope = default_scope;
            }
            container
                .inner
                .engine
                .catalog()
                .register(descriptor, allow_overwrite)?;
        }
        tracing::info!(bindings = count, modules = modules.len(), "容器已构建");
        Ok(container)
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
