use std::env;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1") | Ok("true"))
}

static WAIT_TIMEOUT_MS: LazyLock<u64> =
    LazyLock::new(|| env_u64("HCQDEV_WAIT_TIMEOUT_MS", 30_000));

static PROFILE: LazyLock<bool> = LazyLock::new(|| env_bool("HCQ_PROFILE"));

static PROFILE_PATH: LazyLock<PathBuf> = LazyLock::new(|| {
    env::var_os("HCQ_PROFILE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join("hcq_profile.json"))
});

/// Signal wait timeout in milliseconds.
///
/// Read once per process from `HCQDEV_WAIT_TIMEOUT_MS`, default 30000.
pub fn wait_timeout_ms() -> u64 {
    *WAIT_TIMEOUT_MS
}

/// Whether profiling is enabled for this process (`HCQ_PROFILE`).
pub fn profile_enabled() -> bool {
    *PROFILE
}

/// Where the trace document is written (`HCQ_PROFILE_PATH`).
pub fn profile_path() -> &'static Path {
    &PROFILE_PATH
}
