//! Build identity reported by `--version`, the logging bootstrap event and the
//! `build_info` metric.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("FEATURE_SYNC_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("FEATURE_SYNC_GIT_COMMIT_HASH")
);

/// Short hash for log fields and metric labels; `"unknown"` passes through untouched.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }
    &GIT_COMMIT_HASH[..GIT_COMMIT_HASH.len().min(12)]
}
