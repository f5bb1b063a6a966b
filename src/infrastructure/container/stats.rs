//! 容器统计信息

use std::sync::atomic::{AtomicU64, Ordering};

/// 内部统计计数器（原子）
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    total_resolutions: AtomicU64,
    cache_hits: AtomicU64,
    constructions: AtomicU64,
    prototype_creations: AtomicU64,
    decoration_warnings: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn resolution(&self) {
        self.total_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn construction(&self) {
        self.constructions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn prototype_creation(&self) {
        self.prototype_creations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decoration_warning(&self) {
        self.decoration_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, registered_bindings: usize, active_instances: usize) -> ContainerStats {
        ContainerStats {
            total_resolutions: self.total_resolutions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            constructions: self.constructions.load(Ordering::Relaxed),
            prototype_creations: self.prototype_creations.load(Ordering::Relaxed),
            decoration_warnings: self.decoration_warnings.load(Ordering::Relaxed),
            registered_bindings,
            active_instances,
        }
    }
}

/// 容器统计信息快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStats {
    /// 总解析次数
    pub total_resolutions: u64,
    /// 作用域缓存命中次数
    pub cache_hits: u64,
    /// 实际执行生产者的次数
    pub constructions: u64,
    /// 原型实例创建次数
    pub prototype_creations: u64,
    pub decoration_warnings: u64,
    pub registered_bindings: usize,
    /// 各作用域中存活的实例数量
    pub active_instances: usize,
}

impl ContainerStats {
    /// 缓存命中率（小数形式）
    pub fn hit_rate(&self) -> f64 {
        if self.total_resolutions == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_resolutions as f64
        }
    }

    /// 性能指标摘要
    pub fn performance_summary(&self) -> String {
        format!(
            "Container Performance: {} total resolutions, {:.1}% cache hit rate, {} constructions, {} registered bindings, {} active instances",
            self.total_resolutions,
            self.hit_rate() * 100.0,
            self.constructions,
            self.registered_bindings,
            self.active_instances
        )
    }
}
