use once_cell::sync::Lazy;

/// key: limits-config -> cached usage staleness window
pub static USAGE_STALENESS_WINDOW_MINUTES: Lazy<i64> = Lazy::new(|| {
    std::env::var("USAGE_STALENESS_WINDOW_MINUTES")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// key: health-config -> renewal warning lead time
pub static RENEWAL_WARNING_WINDOW_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("RENEWAL_WARNING_WINDOW_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(30)
});

/// key: health-config -> sweep cadence
pub static HEALTH_SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("HEALTH_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: health-config -> bounded worker pool for the sweep
pub static HEALTH_SWEEP_CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    std::env::var("HEALTH_SWEEP_CONCURRENCY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(8)
});

/// key: health-config -> per-tenant meter deadline; timeout is treated as DataUnavailable
pub static HEALTH_CHECK_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("HEALTH_CHECK_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});
