/// Build identity reported by `--version` and the bootstrap log event.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("FUOTA_WORKER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("FUOTA_WORKER_GIT_COMMIT_HASH")
);

const UNKNOWN_COMMIT: &str = "unknown";
const SHORT_HASH_LEN: usize = 12;

/// Abbreviated commit hash for log fields, or `"unknown"` for builds without git metadata.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == UNKNOWN_COMMIT {
        return GIT_COMMIT_HASH;
    }

    &GIT_COMMIT_HASH[..SHORT_HASH_LEN.min(GIT_COMMIT_HASH.len())]
}

#[cfg(test)]
mod tests {
    use super::{short_commit_hash, GIT_COMMIT_HASH, VERSION, VERSION_WITH_COMMIT};

    #[test]
    fn version_with_commit_is_semver_plus_hash() {
        assert_eq!(VERSION_WITH_COMMIT, format!("{VERSION}+{GIT_COMMIT_HASH}"));
    }

    #[test]
    fn short_hash_is_a_prefix() {
        assert!(!short_commit_hash().is_empty());
        assert!(GIT_COMMIT_HASH.starts_with(short_commit_hash()));
    }
}
