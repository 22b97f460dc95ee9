//! Pipeline configuration.
//!
//! Built once at startup and handed to [`Pipeline::new`](crate::Pipeline::new).
//! Nothing here is read from process-wide state.
//!
//! ```rust
//! use kiln::Config;
//!
//! let config = Config::default()
//!     .max_idle_buffers(64)
//!     .label_cache_capacity(256)
//!     .skip_path("/internal")
//!     .metrics_prefix("api");
//! ```

use std::sync::Arc;

use crate::log::{LogSink, default_access_log, default_failure_log};

/// Decides from a `content-type` header whether a body may be buffered and
/// logged. `None` means the header is absent.
pub type ContentTypeFilter = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

const SKIP_PATHS: [&str; 5] = ["/healthz", "/readyz", "/metrics", "/swagger", "/debug/pprof"];

const BODY_CONTENT_TYPES: [&str; 5] = [
    "application/json",
    "application/x-www-form-urlencoded",
    "application/xml",
    "text/plain",
    "text/xml",
];

pub struct Config {
    pub(crate) max_idle_buffers: usize,
    pub(crate) max_idle_events: usize,
    pub(crate) label_cache_capacity: usize,
    pub(crate) skip_paths: Vec<String>,
    pub(crate) body_filter: ContentTypeFilter,
    pub(crate) access_log: LogSink,
    pub(crate) failure_log: LogSink,
    pub(crate) metrics_prefix: String,
}

impl Config {
    /// Idle buffers kept per size class.
    pub fn max_idle_buffers(mut self, n: usize) -> Self {
        self.max_idle_buffers = n;
        self
    }

    /// Idle log events kept for reuse.
    pub fn max_idle_events(mut self, n: usize) -> Self {
        self.max_idle_events = n;
        self
    }

    /// Label sets kept warm by the metrics layer. Zero is raised to one.
    pub fn label_cache_capacity(mut self, n: usize) -> Self {
        self.label_cache_capacity = n.max(1);
        self
    }

    /// Adds a path prefix that bypasses access logging.
    pub fn skip_path(mut self, prefix: impl Into<String>) -> Self {
        self.skip_paths.push(prefix.into());
        self
    }

    /// Replaces the skip list.
    pub fn skip_paths<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Admits bodies whose MIME type is one of `types`.
    pub fn body_content_types<I, S>(self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        self.body_filter(Arc::new(move |ct: Option<&str>| mime_allowed(&types, ct)))
    }

    /// Replaces the content-type check altogether.
    pub fn body_filter(mut self, filter: ContentTypeFilter) -> Self {
        self.body_filter = filter;
        self
    }

    pub fn access_log(mut self, sink: LogSink) -> Self {
        self.access_log = sink;
        self
    }

    pub fn failure_log(mut self, sink: LogSink) -> Self {
        self.failure_log = sink;
        self
    }

    /// Prefix for metric names, e.g. `http` gives `http_requests_total`.
    pub fn metrics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metrics_prefix = prefix.into();
        self
    }

    /// Whether `path` bypasses access logging.
    pub fn is_skipped(&self, path: &str) -> bool {
        path_skipped(&self.skip_paths, path)
    }
}

/// Whether `path` starts with any of `prefixes`.
pub(crate) fn path_skipped(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|p| path.starts_with(p.as_str()))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_idle_buffers: 256,
            max_idle_events: 1024,
            label_cache_capacity: 1024,
            skip_paths: SKIP_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            body_filter: Arc::new(|ct: Option<&str>| mime_allowed(&BODY_CONTENT_TYPES, ct)),
            access_log: default_access_log(),
            failure_log: default_failure_log(),
            metrics_prefix: "http".to_owned(),
        }
    }
}

/// Matches the MIME essence of `content_type`, ignoring case and parameters.
fn mime_allowed<T: AsRef<str>>(allowed: &[T], content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let essence = ct.split(';').next().unwrap_or_default().trim();
    allowed.iter().any(|a| a.as_ref().eq_ignore_ascii_case(essence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_reads_essence() {
        let config = Config::default();
        let allowed = |ct| (config.body_filter)(ct);
        assert!(allowed(Some("application/json")));
        assert!(allowed(Some("Application/JSON; charset=utf-8")));
        assert!(allowed(Some("text/plain;charset=utf-8")));
        assert!(!allowed(Some("application/octet-stream")));
        assert!(!allowed(Some("multipart/form-data; boundary=x")));
        assert!(!allowed(None));
    }

    #[test]
    fn custom_types_replace_defaults() {
        let config = Config::default().body_content_types(["application/cbor"]);
        assert!((config.body_filter)(Some("application/cbor")));
        assert!(!(config.body_filter)(Some("application/json")));
    }

    #[test]
    fn skip_list_matches_prefixes() {
        let config = Config::default().skip_path("/internal");
        assert!(config.is_skipped("/healthz"));
        assert!(config.is_skipped("/debug/pprof/heap"));
        assert!(config.is_skipped("/internal/jobs"));
        assert!(!config.is_skipped("/users"));

        let config = config.skip_paths(Vec::<String>::new());
        assert!(!config.is_skipped("/healthz"));
    }

    #[test]
    fn zero_label_capacity_is_raised() {
        assert_eq!(Config::default().label_cache_capacity(0).label_cache_capacity, 1);
    }
}
