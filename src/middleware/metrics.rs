//! Per-request Prometheus metrics.
//!
//! Three series per (method, route, status): a request counter, a latency
//! histogram and a gauge holding the last observed latency. Label sets are
//! built through a bounded LRU so hot routes reuse one allocation. Evicting a
//! label set never touches the series it keyed; series go away only through
//! [`Metrics::unregister`].

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tracing::{debug, error};

use super::{BoxFuture, Middleware, Next};
use crate::context::Context;

/// Path label for requests no route matched.
const UNMATCHED: &str = "unmatched";

const DEFAULT_PREFIX: &str = "http";
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Latency buckets, in seconds.
const LATENCY_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Label set shared by every request series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Labels {
    pub method: String,
    /// Route template, or `unmatched`.
    pub path: String,
    pub status: String,
}

struct CachedLabels {
    status: u16,
    labels: Arc<Labels>,
}

impl CachedLabels {
    fn matches(&self, method: &str, path: &str, status: u16) -> bool {
        self.status == status && self.labels.method == method && self.labels.path == path
    }
}

/// LRU-bounded cache of resolved label sets.
///
/// Entries are keyed by a hash of the tuple, so a hit allocates nothing. A
/// hash collision is detected against the stored labels and treated as a
/// miss.
pub struct LabelCache {
    entries: Mutex<LruCache<u64, CachedLabels>>,
    hasher: RandomState,
}

impl LabelCache {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), hasher: RandomState::new() }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<u64, CachedLabels>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, method: &str, path: &str, status: u16) -> u64 {
        self.hasher.hash_one((method, path, status))
    }

    /// Returns the label set for the tuple, building and caching it on a
    /// miss. A hit marks the entry most recently used.
    pub fn resolve(&self, method: &str, path: &str, status: u16) -> Arc<Labels> {
        let key = self.key(method, path, status);
        let mut entries = self.lock();
        if let Some(cached) = entries.get(&key) {
            if cached.matches(method, path, status) {
                return Arc::clone(&cached.labels);
            }
        }
        let labels = Arc::new(Labels {
            method: method.to_owned(),
            path: path.to_owned(),
            status: status.to_string(),
        });
        let cached = CachedLabels { status, labels: Arc::clone(&labels) };
        if let Some((_, evicted)) = entries.push(key, cached) {
            debug!(labels = ?evicted.labels, "label set evicted");
        }
        labels
    }

    /// Whether the tuple is cached. Does not touch recency.
    pub fn contains(&self, method: &str, path: &str, status: u16) -> bool {
        self.lock()
            .peek(&self.key(method, path, status))
            .is_some_and(|cached| cached.matches(method, path, status))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Request metrics recorder.
///
/// Also a [`Middleware`]: it times the rest of the chain and records the
/// outcome. Requests that reported errors are logged instead of recorded.
pub struct Metrics {
    requests: Family<Labels, Counter>,
    duration: Family<Labels, Histogram>,
    latency: Family<Labels, Gauge<f64, AtomicU64>>,
    labels: LabelCache,
    prefix: String,
    registered: AtomicBool,
}

impl Metrics {
    pub fn new(prefix: impl Into<String>, cache_capacity: usize) -> Self {
        Self {
            requests: Family::default(),
            duration: Family::new_with_constructor(|| Histogram::new(LATENCY_BUCKETS.into_iter())),
            latency: Family::default(),
            labels: LabelCache::new(cache_capacity),
            prefix: prefix.into(),
            registered: AtomicBool::new(false),
        }
    }

    /// Registers the families under the configured prefix. Only the first
    /// call has any effect.
    pub fn register(&self, registry: &mut Registry) {
        if self.registered.swap(true, Ordering::AcqRel) {
            return;
        }
        let sub = registry.sub_registry_with_prefix(&self.prefix);
        sub.register("requests", "HTTP requests served", self.requests.clone());
        sub.register(
            "request_duration_seconds",
            "HTTP request latency",
            self.duration.clone(),
        );
        sub.register(
            "request_latency_seconds",
            "Latency of the last HTTP request",
            self.latency.clone(),
        );
    }

    /// Drops every recorded series and cached label set.
    ///
    /// A no-op unless [`register`](Self::register) ran first.
    pub fn unregister(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        self.requests.clear();
        self.duration.clear();
        self.latency.clear();
        self.labels.clear();
    }

    /// Records one completed request.
    pub fn observe(&self, method: &str, path: &str, status: u16, latency: Duration) {
        let labels = self.labels.resolve(method, path, status);
        let secs = latency.as_secs_f64();
        self.requests.get_or_create(&labels).inc();
        self.duration.get_or_create(&labels).observe(secs);
        self.latency.get_or_create(&labels).set(secs);
    }

    pub fn labels(&self) -> &LabelCache {
        &self.labels
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_CACHE_CAPACITY)
    }
}

impl Middleware for Metrics {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> BoxFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            next.run(ctx).await;

            if !ctx.errors().is_empty() {
                for err in ctx.errors() {
                    error!(parent: ctx.span(), error = %err, "request failed");
                }
                return;
            }
            self.observe(
                ctx.method().as_str(),
                ctx.route().unwrap_or(UNMATCHED),
                ctx.writer().status().as_u16(),
                started.elapsed(),
            );
        })
    }
}
