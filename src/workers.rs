//! Worker counts for phase pools.
//!
//! Several pipeline instances may run on one host. A parent that fans out
//! child pipelines sets `STAGEHAND_BATCH_CHILD` so each child runs a single
//! worker per phase instead of sizing itself to the whole machine.

/// Environment variable marking this process as a batch child.
pub const BATCH_CHILD_ENV: &str = "STAGEHAND_BATCH_CHILD";

/// Upper bound for auto-detected pools.
pub const MAX_AUTO_WORKERS: usize = 12;

/// Cores left free for the rest of the host when auto-sizing.
const RESERVED_CORES: usize = 2;

/// Inputs to the worker-count decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPolicy {
    pub batch_child: bool,
    pub worker_override: Option<usize>,
    pub physical_cores: usize,
}

impl WorkerPolicy {
    /// Policy for this process: batch signal from the environment and the
    /// host's physical core count.
    pub fn detect(worker_override: Option<usize>) -> Self {
        let physical_cores = num_cpus::get_physical();
        let batch_child = is_batch_child();
        tracing::debug!(physical_cores, batch_child, ?worker_override, "worker policy");
        Self {
            batch_child,
            worker_override,
            physical_cores,
        }
    }

    /// Workers for a phase, optionally capped by the phase's own limit.
    pub fn worker_count(&self, phase_max: Option<usize>) -> usize {
        if self.batch_child {
            return 1;
        }
        let base = match self.worker_override {
            Some(n) => n.max(1),
            None => self
                .physical_cores
                .saturating_sub(RESERVED_CORES)
                .clamp(1, MAX_AUTO_WORKERS),
        };
        match phase_max {
            Some(cap) => base.min(cap.max(1)),
            None => base,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Whether `STAGEHAND_BATCH_CHILD` is set to a truthy value.
pub fn is_batch_child() -> bool {
    std::env::var(BATCH_CHILD_ENV).is_ok_and(|v| is_truthy(&v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(batch_child: bool, worker_override: Option<usize>, cores: usize) -> WorkerPolicy {
        WorkerPolicy {
            batch_child,
            worker_override,
            physical_cores: cores,
        }
    }

    #[test]
    fn batch_child_always_gets_one_worker() {
        assert_eq!(policy(true, None, 32).worker_count(None), 1);
        assert_eq!(policy(true, Some(8), 32).worker_count(Some(4)), 1);
    }

    #[test]
    fn auto_detect_reserves_two_cores_and_clamps() {
        assert_eq!(policy(false, None, 8).worker_count(None), 6);
        assert_eq!(policy(false, None, 2).worker_count(None), 1);
        assert_eq!(policy(false, None, 1).worker_count(None), 1);
        assert_eq!(policy(false, None, 64).worker_count(None), MAX_AUTO_WORKERS);
    }

    #[test]
    fn override_wins_over_detection() {
        assert_eq!(policy(false, Some(3), 64).worker_count(None), 3);
        assert_eq!(policy(false, Some(0), 64).worker_count(None), 1);
    }

    #[test]
    fn phase_limit_caps_the_pool() {
        assert_eq!(policy(false, None, 16).worker_count(Some(2)), 2);
        assert_eq!(policy(false, Some(3), 16).worker_count(Some(8)), 3);
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "YES", " on "] {
            assert!(is_truthy(v), "{v}");
        }
        for v in ["0", "false", "", "no", "2"] {
            assert!(!is_truthy(v), "{v}");
        }
    }
}
