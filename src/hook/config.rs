// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Hook engine tunables.

use std::str::FromStr;

use crate::matching::MatchOptions;

/// Every tunable of the hook engine, including the matcher's.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HookConfig {
    /// Minimum score at which a selection is re-found in a new record.
    pub match_threshold: f32,
    /// Order-preserving candidate window for sibling pairing.
    pub sibling_window: usize,
    /// Bytes of copy buffers the pool may hold, pooled and in use.
    pub copy_budget_bytes: u64,
    /// Query slots available to hooks.
    pub query_capacity: u32,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period_ns: f64,
    /// Hook records kept for reuse across frames.
    pub max_cached_hook_records: usize,
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig {
            match_threshold: 0.6,
            sibling_window: 4,
            copy_budget_bytes: 64 * 1024 * 1024,
            query_capacity: 64,
            timestamp_period_ns: 1.0,
            max_cached_hook_records: 8,
        }
    }
}

fn env_override<T: FromStr>(name: &str, value: &mut T) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(parsed) => *value = parsed,
        Err(_) => {
            logwise::warn_sync!(
                "ignoring {name}={raw}: not a valid value",
                name = logwise::privacy::LogIt(&name),
                raw = logwise::privacy::LogIt(&raw)
            );
        }
    }
}

impl HookConfig {
    /// Defaults, overridden by any `RAH_*` environment variables that are set.
    pub fn from_env() -> Self {
        let mut config = HookConfig::default();
        env_override("RAH_MATCH_THRESHOLD", &mut config.match_threshold);
        env_override("RAH_SIBLING_WINDOW", &mut config.sibling_window);
        env_override("RAH_COPY_BUDGET", &mut config.copy_budget_bytes);
        env_override("RAH_QUERY_CAPACITY", &mut config.query_capacity);
        env_override("RAH_TIMESTAMP_PERIOD_NS", &mut config.timestamp_period_ns);
        env_override("RAH_MAX_CACHED_HOOKS", &mut config.max_cached_hook_records);
        config
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            threshold: self.match_threshold,
            sibling_window: self.sibling_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_into_match_options() {
        let config = HookConfig::default();
        assert_eq!(config.match_options(), MatchOptions::default());
        assert_eq!(config.copy_budget_bytes, 64 << 20);
    }

    #[test]
    fn unset_variable_keeps_default() {
        let mut window = 4usize;
        env_override("RAH_TEST_UNSET_VARIABLE", &mut window);
        assert_eq!(window, 4);
    }
}
