//! Auxiliary data metrics
//!
//! Enable with the `metrics` feature flag (on by default). Requires a
//! `metrics` recorder to be installed (e.g. via `metrics-exporter-prometheus`);
//! without one every call is a cheap no-op.
//!
//! ## Metrics Provided
//!
//! - `auxdata_cache_access_total` - Counter for cache probes (labels: kind, result)
//! - `auxdata_cache_live_objects` - Gauge for live cache entries (labels: kind)
//! - `auxdata_cache_max_size` - Gauge for configured cache capacity (labels: kind)
//! - `auxdata_keyset_refresh_total` - Counter for remote keyset fetches (labels: status)

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, gauge};

#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static INIT: Once = Once::new();

/// Cache kind label used by the JWT verification cache
pub(crate) const JWT_CACHE_KIND: &str = "jwt";

/// Initialize metric descriptions. Call once at startup.
///
/// Idempotent; only the first call registers descriptions.
#[cfg(feature = "metrics")]
pub fn init_auxdata_metrics() {
    INIT.call_once(|| {
        describe_counter!(
            "auxdata_cache_access_total",
            "Total verification cache probes by result"
        );
        describe_gauge!(
            "auxdata_cache_live_objects",
            "Number of entries currently held by the cache"
        );
        describe_gauge!("auxdata_cache_max_size", "Configured cache capacity");
        describe_counter!(
            "auxdata_keyset_refresh_total",
            "Total remote keyset fetches (initial and background)"
        );
    });
}

#[cfg(feature = "metrics")]
pub(crate) fn record_cache_access(kind: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("auxdata_cache_access_total", "kind" => kind, "result" => result).increment(1);
}

/// Move the live-entry gauge by `delta`
///
/// Adjusted in place rather than set, so concurrent inserts and removals
/// cannot overwrite each other's updates.
#[cfg(feature = "metrics")]
pub(crate) fn record_cache_size_change(kind: &'static str, delta: i64) {
    let live = gauge!("auxdata_cache_live_objects", "kind" => kind);
    if delta >= 0 {
        live.increment(delta as f64);
    } else {
        live.decrement(delta.unsigned_abs() as f64);
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_cache_max_size(kind: &'static str, size: u64) {
    gauge!("auxdata_cache_max_size", "kind" => kind).set(size as f64);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_keyset_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("auxdata_keyset_refresh_total", "status" => status).increment(1);
}

// No-op versions when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
#[allow(missing_docs)]
pub fn init_auxdata_metrics() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cache_access(_kind: &'static str, _hit: bool) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cache_size_change(_kind: &'static str, _delta: i64) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_cache_max_size(_kind: &'static str, _size: u64) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_keyset_refresh(_success: bool) {}
