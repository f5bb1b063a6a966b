//! 作用域存储
//!
//! 每个作用域一个实例缓存。`get_or_create` 是唯一的同步点：每个绑定一个
//! `OnceCell`，保证生产者至多执行一次；缓存建立后读取不再加锁。
//! 驱逐时先关闭作用域并等待进行中的解析结束，再按创建的逆序执行销毁钩子。

use super::descriptor::{BindingDescriptor, BindingId};
use super::instance::Instance;
use super::{Scope, ScopeId};
use crate::errors::{ContainerError, TeardownFailure};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OnceCell};

/// 调用方持有的工作单元句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallScope {
    id: uuid::Uuid,
    name: String,
}

impl CallScope {
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_id(&self) -> ScopeId {
        ScopeId::Call(self.id)
    }
}

/// 缓存中的实例，在作用域销毁前由存储独占持有
#[derive(Clone)]
pub struct ScopedInstance {
    pub instance: Instance,
    pub scope: ScopeId,
    pub created_at: DateTime<Utc>,
    pub(crate) sequence: u64,
    pub(crate) binding: Arc<BindingDescriptor>,
}

impl ScopedInstance {
    pub fn binding(&self) -> &BindingDescriptor {
        &self.binding
    }

    /// 全局创建序号，越大越晚创建
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Debug for ScopedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedInstance")
            .field("binding", &self.binding.label())
            .field("scope", &self.scope)
            .field("created_at", &self.created_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// 进行中操作的闸门：关闭后拒绝新的进入，并可以等待已进入的操作结束
#[derive(Default)]
pub(crate) struct InFlightGate {
    count: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

/// 进行中的操作计数守卫
pub(crate) struct InFlight<'a> {
    gate: &'a InFlightGate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.gate.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.drained.notify_waiters();
        }
    }
}

impl InFlightGate {
    /// 闸门已关闭时返回 `None`
    pub(crate) fn enter(&self) -> Option<InFlight<'_>> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { gate: self };
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 关闭闸门并等待进行中的操作结束
    pub(crate) async fn close_and_drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}

/// 缓存条目；`released` 保证每个实例只交给销毁流程一次
#[derive(Default)]
struct CacheEntry {
    cell: OnceCell<ScopedInstance>,
    released: AtomicBool,
}

impl CacheEntry {
    fn release(&self) -> Option<ScopedInstance> {
        let stored = self.cell.get()?;
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(stored.clone())
    }
}

struct ScopeCache {
    name: String,
    entries: DashMap<BindingId, Arc<CacheEntry>>,
    /// 构造期间绑定被覆盖而脱离缓存的实例，随作用域一起销毁
    orphans: Mutex<Vec<ScopedInstance>>,
    gate: InFlightGate,
}

impl ScopeCache {
    fn new(name: String) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            orphans: Mutex::new(Vec::new()),
            gate: InFlightGate::default(),
        }
    }

    fn initialized(&self) -> Vec<ScopedInstance> {
        let mut instances: Vec<ScopedInstance> = self
            .entries
            .iter()
            .filter_map(|entry| entry.value().cell.get().cloned())
            .collect();
        instances.extend(self.orphans.lock().iter().cloned());
        instances
    }

    /// 取出所有待销毁的实例并清空缓存
    fn drain(&self) -> Vec<ScopedInstance> {
        let mut instances: Vec<ScopedInstance> = self
            .entries
            .iter()
            .filter_map(|entry| entry.value().release())
            .collect();
        self.entries.clear();
        instances.append(&mut self.orphans.lock());
        instances
    }
}

/// 作用域存储
pub struct ScopeStore {
    caches: DashMap<ScopeId, Arc<ScopeCache>>,
    /// 调用作用域的打开顺序
    call_order: Mutex<Vec<ScopeId>>,
    application: ScopeId,
    sequence: AtomicU64,
}

impl ScopeStore {
    pub fn new(application_id: uuid::Uuid) -> Self {
        let store = Self {
            caches: DashMap::new(),
            call_order: Mutex::new(Vec::new()),
            application: ScopeId::Application(application_id),
            sequence: AtomicU64::new(0),
        };
        store.open(ScopeId::Singleton, "singleton".to_string());
        store.open(store.application, "application".to_string());
        store
    }

    fn open(&self, id: ScopeId, name: String) {
        self.caches.insert(id, Arc::new(ScopeCache::new(name)));
    }

    fn cache(&self, id: &ScopeId) -> Result<Arc<ScopeCache>, ContainerError> {
        self.caches
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ContainerError::scope(id, "scope is not open"))
    }

    pub fn application_scope(&self) -> ScopeId {
        self.application
    }

    /// 绑定作用域对应的缓存区；原型作用域没有缓存
    pub fn scope_for(
        &self,
        scope: Scope,
        call: Option<&CallScope>,
    ) -> Result<Option<ScopeId>, ContainerError> {
        match scope {
            Scope::Prototype => Ok(None),
            Scope::Singleton => Ok(Some(ScopeId::Singleton)),
            Scope::Application => Ok(Some(self.application)),
            Scope::CallBound => match call {
                Some(handle) => Ok(Some(handle.scope_id())),
                None => Err(ContainerError::ScopeError {
                    scope: Scope::CallBound.to_string(),
                    reason: "no active call scope for call-bound binding".to_string(),
                }),
            },
        }
    }

    /// 打开新的调用作用域
    pub fn open_call(&self, name: impl Into<String>) -> CallScope {
        let handle = CallScope {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
        };
        self.open(handle.scope_id(), handle.name.clone());
        self.call_order.lock().push(handle.scope_id());
        tracing::debug!(scope = %handle.scope_id(), name = %handle.name, "调用作用域已打开");
        handle
    }

    pub fn is_open(&self, id: &ScopeId) -> bool {
        self.caches
            .get(id)
            .is_some_and(|cache| !cache.gate.is_closed())
    }

    /// 打开中的调用作用域，最内层（最晚打开）在前
    pub fn call_scopes(&self) -> Vec<ScopeId> {
        self.call_order.lock().iter().rev().copied().collect()
    }

    /// 无锁快速路径：已缓存的实例
    pub fn peek(&self, scope: &ScopeId, binding: BindingId) -> Option<Instance> {
        let cache = self.caches.get(scope)?;
        let entry = cache.entries.get(&binding)?;
        entry.cell.get().map(|stored| stored.instance.clone())
    }

    /// 获取或创建实例，`supplier` 至多被驱动一次；返回值第二项表示本次是否新建
    pub async fn get_or_create<Fut>(
        &self,
        scope: ScopeId,
        binding: &Arc<BindingDescriptor>,
        supplier: Fut,
    ) -> Result<(Instance, bool), ContainerError>
    where
        Fut: Future<Output = Result<Instance, ContainerError>>,
    {
        let cache = self.cache(&scope)?;
        let _in_flight = cache
            .gate
            .enter()
            .ok_or_else(|| ContainerError::scope(&scope, "scope is closed"))?;

        let entry = cache
            .entries
            .entry(binding.id)
            .or_default()
            .clone();

        if let Some(existing) = entry.cell.get() {
            return Ok((existing.instance.clone(), false));
        }

        let mut created = false;
        let flag = &mut created;
        let stored = entry
            .cell
            .get_or_try_init(move || async move {
                let instance = supplier.await?;
                *flag = true;
                Ok::<_, ContainerError>(ScopedInstance {
                    instance,
                    scope,
                    created_at: Utc::now(),
                    sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
                    binding: binding.clone(),
                })
            })
            .await?;

        if created {
            let attached = cache
                .entries
                .get(&binding.id)
                .is_some_and(|current| Arc::ptr_eq(current.value(), &entry));
            if !attached {
                if let Some(orphan) = entry.release() {
                    tracing::debug!(binding = %binding.label(), scope = %scope, "绑定在构造期间被移除，实例随作用域销毁");
                    cache.orphans.lock().push(orphan);
                }
            }
        }

        Ok((stored.instance.clone(), created))
    }

    /// 驱逐整个作用域，返回销毁钩子的失败记录
    pub async fn evict(&self, scope: ScopeId) -> Result<Vec<TeardownFailure>, ContainerError> {
        self.evict_many(&[scope]).await
    }

    /// 一起驱逐多个作用域：全部关闭并等待进行中的操作结束后，
    /// 合并其中的实例，按全局创建逆序执行销毁钩子
    pub async fn evict_many(
        &self,
        scopes: &[ScopeId],
    ) -> Result<Vec<TeardownFailure>, ContainerError> {
        let mut caches = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let cache = self.cache(scope)?;
            if cache.gate.is_closed() {
                return Err(ContainerError::scope(scope, "scope already evicted"));
            }
            caches.push((*scope, cache));
        }
        for (_, cache) in &caches {
            cache.gate.close_and_drain().await;
        }

        let mut instances = Vec::new();
        for (scope, cache) in &caches {
            self.caches.remove(scope);
            self.call_order.lock().retain(|id| id != scope);
            let drained = cache.drain();
            tracing::debug!(scope = %scope, name = %cache.name, count = drained.len(), "作用域驱逐");
            instances.extend(drained);
        }
        instances.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(run_teardown(&instances))
    }

    /// 从所有作用域中移除某个绑定的缓存实例（覆盖注册时使用）。
    /// 仍在构造中的实例不会等待，完成后由 `get_or_create` 转入所属作用域的待销毁列表
    pub fn evict_binding(&self, binding: BindingId) -> Vec<TeardownFailure> {
        let caches: Vec<Arc<ScopeCache>> = self.caches.iter().map(|e| e.value().clone()).collect();
        let mut instances: Vec<ScopedInstance> = caches
            .iter()
            .filter_map(|cache| cache.entries.remove(&binding))
            .filter_map(|(_, entry)| entry.release())
            .collect();
        instances.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        run_teardown(&instances)
    }

    /// 作用域内已创建的实例，按创建顺序
    pub fn snapshot(&self, scope: &ScopeId) -> Vec<ScopedInstance> {
        let mut instances = self
            .caches
            .get(scope)
            .map(|cache| cache.initialized())
            .unwrap_or_default();
        instances.sort_by_key(|i| i.sequence);
        instances
    }

    /// 所有作用域中存活的实例数量
    pub fn live_instances(&self) -> usize {
        self.caches
            .iter()
            .map(|cache| {
                let cached = cache.entries.iter().filter(|e| e.value().cell.initialized()).count();
                cached + cache.orphans.lock().len()
            })
            .sum()
    }
}

fn run_teardown(instances: &[ScopedInstance]) -> Vec<TeardownFailure> {
    let mut failures = Vec::new();
    for stored in instances {
        for hook in &stored.binding.pre_destroy {
            if let Err(e) = hook.invoke(&stored.instance) {
                tracing::warn!(
                    binding = %stored.binding.label(),
                    hook = %hook.name(),
                    error = %e,
                    "销毁钩子执行失败"
                );
                failures.push(TeardownFailure {
                    binding: stored.binding.label(),
                    hook: hook.name().to_string(),
                    scope: stored.scope.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::container::descriptor::BindingDescriptor;
    use std::sync::atomic::AtomicUsize;

    fn binding(id: u64, name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<BindingDescriptor> {
        let label = name.to_string();
        let mut descriptor = BindingDescriptor::builder::<String>()
            .implementation(name)
            .pre_destroy("close", move |_| {
                log.lock().push(label.clone());
                Ok(())
            })
            .build(|_| Ok(Arc::new(String::new())));
        descriptor.id = BindingId(id);
        Arc::new(descriptor)
    }

    fn value(text: &str) -> Instance {
        Instance::new(Arc::new(text.to_string()))
    }

    #[tokio::test]
    async fn test_supplier_runs_at_most_once() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let log = Arc::new(Mutex::new(Vec::new()));
        let b = binding(1, "A", log);
        let calls = AtomicUsize::new(0);

        let (first, created) = store
            .get_or_create(ScopeId::Singleton, &b, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value("a"))
            })
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .get_or_create(ScopeId::Singleton, &b, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value("b"))
            })
            .await
            .unwrap();
        assert!(!created);
        assert!(first.ptr_eq(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.peek(&ScopeId::Singleton, b.id).is_some());
    }

    #[tokio::test]
    async fn test_failed_supplier_is_not_cached() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let b = binding(1, "A", Arc::new(Mutex::new(Vec::new())));

        let err = store
            .get_or_create(ScopeId::Singleton, &b, async {
                Err(ContainerError::ContainerClosed)
            })
            .await;
        assert!(err.is_err());
        assert!(store.peek(&ScopeId::Singleton, b.id).is_none());

        let (_, created) = store
            .get_or_create(ScopeId::Singleton, &b, async { Ok(value("ok")) })
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_evict_runs_teardown_in_reverse_creation_order() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = store.open_call("request");
        let scope = call.scope_id();

        for (id, name) in [(1, "first"), (2, "second"), (3, "third")] {
            let b = binding(id, name, log.clone());
            store
                .get_or_create(scope, &b, async { Ok(value(name)) })
                .await
                .unwrap();
        }
        assert_eq!(store.snapshot(&scope).len(), 3);

        let failures = store.evict(scope).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
        assert!(!store.is_open(&scope));
        assert!(store.call_scopes().is_empty());

        // 已驱逐的作用域不能再使用
        let b = binding(4, "late", log.clone());
        assert!(store
            .get_or_create(scope, &b, async { Ok(value("late")) })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_call_bound_requires_handle() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        assert!(store.scope_for(Scope::CallBound, None).is_err());
        assert_eq!(store.scope_for(Scope::Prototype, None).unwrap(), None);

        let outer = store.open_call("outer");
        let inner = store.open_call("inner");
        assert_eq!(
            store.scope_for(Scope::CallBound, Some(&inner)).unwrap(),
            Some(inner.scope_id())
        );
        assert_eq!(store.call_scopes(), vec![inner.scope_id(), outer.scope_id()]);
    }

    #[tokio::test]
    async fn test_teardown_failures_do_not_stop_remaining_hooks() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut failing = BindingDescriptor::builder::<String>()
            .implementation("Failing")
            .pre_destroy("explode", |_| Err(anyhow::anyhow!("boom")))
            .build(|_| Ok(Arc::new(String::new())));
        failing.id = BindingId(1);
        let failing = Arc::new(failing);
        let healthy = binding(2, "Healthy", log.clone());

        store
            .get_or_create(ScopeId::Singleton, &healthy, async { Ok(value("h")) })
            .await
            .unwrap();
        store
            .get_or_create(ScopeId::Singleton, &failing, async { Ok(value("f")) })
            .await
            .unwrap();

        let failures = store.evict(ScopeId::Singleton).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].binding, "Failing");
        assert_eq!(failures[0].message, "boom");
        assert_eq!(*log.lock(), vec!["Healthy"]);
    }

    #[tokio::test]
    async fn test_evict_binding_tears_down_single_entry() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = binding(1, "A", log.clone());
        let b = binding(2, "B", log.clone());
        for target in [&a, &b] {
            store
                .get_or_create(ScopeId::Singleton, target, async { Ok(value("x")) })
                .await
                .unwrap();
        }

        assert!(store.evict_binding(a.id).is_empty());
        assert_eq!(*log.lock(), vec!["A"]);
        assert!(store.peek(&ScopeId::Singleton, a.id).is_none());
        assert!(store.peek(&ScopeId::Singleton, b.id).is_some());
        assert_eq!(store.live_instances(), 1);
    }

    #[tokio::test]
    async fn test_evict_many_merges_scopes_by_creation_order() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let log = Arc::new(Mutex::new(Vec::new()));
        let application = store.application_scope();

        let plan = [
            (1, "single-early", ScopeId::Singleton),
            (2, "app", application),
            (3, "single-late", ScopeId::Singleton),
        ];
        for (id, name, scope) in plan {
            let b = binding(id, name, log.clone());
            store
                .get_or_create(scope, &b, async { Ok(value(name)) })
                .await
                .unwrap();
        }

        let failures = store
            .evict_many(&[ScopeId::Singleton, application])
            .await
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(*log.lock(), vec!["single-late", "app", "single-early"]);
        assert!(!store.is_open(&ScopeId::Singleton));
        assert!(!store.is_open(&application));
        assert!(store.evict(application).await.is_err());
    }

    #[tokio::test]
    async fn test_binding_removed_during_construction_is_torn_down_with_scope() {
        let store = ScopeStore::new(uuid::Uuid::new_v4());
        let log = Arc::new(Mutex::new(Vec::new()));
        let b = binding(1, "A", log.clone());
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let constructing = store.get_or_create(ScopeId::Singleton, &b, async {
            let _ = wait.await;
            Ok(value("a"))
        });
        let replacing = async {
            let failures = store.evict_binding(b.id);
            let _ = release.send(());
            failures
        };
        let (created, failures) = futures_util::future::join(constructing, replacing).await;

        let (_, fresh) = created.unwrap();
        assert!(fresh);
        assert!(failures.is_empty());
        assert!(log.lock().is_empty());
        assert!(store.peek(&ScopeId::Singleton, b.id).is_none());
        assert_eq!(store.live_instances(), 1);

        store.evict(ScopeId::Singleton).await.unwrap();
        assert_eq!(*log.lock(), vec!["A"]);
    }
}
