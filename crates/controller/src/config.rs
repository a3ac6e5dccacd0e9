//! Controller settings. Defaults, then `DEFREV_*` environment overrides.

use std::time::Duration;

use crate::retry::Backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Revisions kept per definition; 0 keeps all.
    pub def_revision_limit: usize,
    pub concurrent_reconciles: usize,
    /// Period of the full re-list feeding every definition back into the queue.
    pub resync: Duration,
    /// Restrict watching to one namespace.
    pub namespace: Option<String>,
    pub status_backoff: Backoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            def_revision_limit: 20,
            concurrent_reconciles: 4,
            resync: Duration::from_secs(300),
            namespace: None,
            status_backoff: Backoff::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl ControllerConfig {
    /// Read `DEFREV_REVISION_LIMIT`, `DEFREV_CONCURRENT_RECONCILES`,
    /// `DEFREV_RESYNC_SECS`, `DEFREV_NAMESPACE` and `DEFREV_STATUS_RETRY_STEPS`.
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("DEFREV_REVISION_LIMIT") { cfg.def_revision_limit = v; }
        if let Some(v) = env_parse::<usize>("DEFREV_CONCURRENT_RECONCILES") { cfg.concurrent_reconciles = v.max(1); }
        if let Some(v) = env_parse("DEFREV_RESYNC_SECS") { cfg.resync = Duration::from_secs(v); }
        cfg.namespace = std::env::var("DEFREV_NAMESPACE").ok().filter(|s| !s.is_empty());
        if let Some(v) = env_parse::<u32>("DEFREV_STATUS_RETRY_STEPS") { cfg.status_backoff.steps = v.max(1); }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.def_revision_limit, 20);
        assert_eq!(cfg.concurrent_reconciles, 4);
        assert_eq!(cfg.resync, Duration::from_secs(300));
        assert_eq!(cfg.status_backoff.steps, 4);
    }
}
