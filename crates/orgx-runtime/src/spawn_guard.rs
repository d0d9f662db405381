//! Spawn-guard interpretation (§4.5 step 2). The guard probe itself lives
//! in the cloud plane (`orgx_cloud::CloudClient::check_spawn_guard`); this
//! module turns its result (or its failure) into a dispatch-time decision,
//! the same sequential-rule shape as an in-process spawn policy but
//! generalized to a cloud-probed one.

use orgx_cloud::{CloudError, SpawnGuardResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnGuardOutcome {
    /// Guard allowed the dispatch, or the check itself failed and is
    /// treated as degraded (proceed per §4.5 step 2).
    Proceed { degraded: bool },
    /// A hard block: mark the task blocked, sync rollups, request a
    /// decision, emit a `blocked` activity event.
    HardBlock { reason: String },
    /// A rate-limit block: emit `blocked/warn`, but do not mark the task
    /// blocked — it's retryable.
    RateLimited { reason: String },
}

/// Interprets the cloud plane's spawn-guard response. A transport/other
/// failure is treated as degraded (proceed); an `allowed=false` result is
/// either a hard block or a rate-limit block depending on
/// `checks.rateLimit.passed`.
pub fn evaluate(result: Result<SpawnGuardResult, CloudError>) -> SpawnGuardOutcome {
    match result {
        Err(_) => SpawnGuardOutcome::Proceed { degraded: true },
        Ok(guard) => {
            if guard.allowed {
                return SpawnGuardOutcome::Proceed { degraded: false };
            }
            let reason = guard
                .blocked_reason
                .unwrap_or_else(|| "spawn guard denied".to_string());
            if guard.checks.rate_limit.passed {
                SpawnGuardOutcome::HardBlock { reason }
            } else {
                SpawnGuardOutcome::RateLimited { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgx_cloud::{RateLimitCheck, SpawnGuardChecks};

    #[test]
    fn failed_check_is_degraded_proceed() {
        let outcome = evaluate(Err(CloudError::Transport("timeout".to_string())));
        assert_eq!(outcome, SpawnGuardOutcome::Proceed { degraded: true });
    }

    #[test]
    fn allowed_result_proceeds_clean() {
        let outcome = evaluate(Ok(SpawnGuardResult {
            allowed: true,
            checks: SpawnGuardChecks {
                rate_limit: RateLimitCheck { passed: true },
            },
            blocked_reason: None,
            tier: None,
        }));
        assert_eq!(outcome, SpawnGuardOutcome::Proceed { degraded: false });
    }

    #[test]
    fn hard_block_when_rate_limit_passed_but_guard_denies() {
        let outcome = evaluate(Ok(SpawnGuardResult {
            allowed: false,
            checks: SpawnGuardChecks {
                rate_limit: RateLimitCheck { passed: true },
            },
            blocked_reason: Some("policy".to_string()),
            tier: None,
        }));
        assert_eq!(
            outcome,
            SpawnGuardOutcome::HardBlock {
                reason: "policy".to_string()
            }
        );
    }

    #[test]
    fn rate_limited_when_rate_limit_check_itself_failed() {
        let outcome = evaluate(Ok(SpawnGuardResult {
            allowed: false,
            checks: SpawnGuardChecks {
                rate_limit: RateLimitCheck { passed: false },
            },
            blocked_reason: Some("too many requests".to_string()),
            tier: None,
        }));
        assert_eq!(
            outcome,
            SpawnGuardOutcome::RateLimited {
                reason: "too many requests".to_string()
            }
        );
    }
}
