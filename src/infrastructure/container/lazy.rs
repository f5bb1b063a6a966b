//! 延迟句柄
//!
//! 互相引用的两个组件中，一方声明 `Requirement::lazy`，在双方都构造完成后
//! 再通过句柄取得另一方。句柄只持有容器的弱引用，不延长容器生命周期。

use super::engine::ResolveRequest;
use super::scope::CallScope;
use super::service::ContainerInner;
use crate::errors::ContainerError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;

pub struct Lazy<T: ?Sized> {
    anchor: Weak<ContainerInner>,
    request: ResolveRequest,
    call: Option<CallScope>,
    resolved: Arc<OnceCell<Arc<T>>>,
    _contract: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Lazy<T> {
    pub(crate) fn new(
        anchor: Weak<ContainerInner>,
        request: ResolveRequest,
        call: Option<CallScope>,
    ) -> Self {
        Self {
            anchor,
            request,
            call,
            resolved: Arc::new(OnceCell::new()),
            _contract: PhantomData,
        }
    }

    /// 首次调用时解析（新的解析链），之后返回缓存的结果
    pub async fn get(&self) -> Result<Arc<T>, ContainerError> {
        self.resolved
            .get_or_try_init(|| async {
                let inner = self.anchor.upgrade().ok_or(ContainerError::ContainerClosed)?;
                let instance = inner.resolve_request(&self.request, self.call.clone()).await?;
                instance
                    .downcast::<T>()
                    .ok_or_else(|| ContainerError::TypeCastFailed {
                        expected: std::any::type_name::<T>().to_string(),
                        actual: instance.type_name().to_string(),
                        context: format!("lazy handle for '{}'", self.request.label()),
                    })
            })
            .await
            .cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.initialized()
    }
}

impl<T: ?Sized> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            anchor: self.anchor.clone(),
            request: self.request.clone(),
            call: self.call.clone(),
            resolved: self.resolved.clone(),
            _contract: PhantomData,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("request", &self.request.label())
            .field("resolved", &self.resolved.initialized())
            .finish()
    }
}
