//! Startup election: who is primary, who is secondary
//!
//! Every process runs the same loop against the shared coordination block.
//! A consistent read resolves the role in one critical section; an
//! inconsistent read starts a staleness timer and, once it expires, the block
//! is reinitialized on the assumption that its last writer crashed. Between
//! attempts the process sleeps a jittered interval so that simultaneously
//! launched processes do not retry in lockstep.

use crate::block::CoordinationBlock;
use crate::error::CoordResult;
use crate::segment::{ConsistentRead, CoordinationSegment};
use rand::Rng;
use std::time::{Duration, Instant};

/// Staleness threshold: how long an inconsistent block is tolerated before it
/// is declared abandoned and reinitialized.
///
/// Measured tradeoff between recovery latency and tolerance for legitimate
/// writers racing at startup; see [`ElectionConfig`].
pub const STALENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Lower bound of the retry jitter window, in milliseconds
pub const JITTER_MIN_MS: u64 = 8;

/// Upper bound of the retry jitter window, in milliseconds
pub const JITTER_MAX_MS: u64 = 18;

/// Tunables for the election loop.
///
/// The defaults are the production policy; they exist as fields so tests can
/// shrink the staleness window, not as an invitation to tune the jitter away.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Inconsistency tolerance before reinitializing the block
    pub staleness_timeout: Duration,
    /// Minimum retry backoff in milliseconds
    pub jitter_min_ms: u64,
    /// Maximum retry backoff in milliseconds
    pub jitter_max_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            staleness_timeout: STALENESS_TIMEOUT,
            jitter_min_ms: JITTER_MIN_MS,
            jitter_max_ms: JITTER_MAX_MS,
        }
    }
}

/// Resolved role of this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// This process claimed the primary role
    Primary,
    /// This process was admitted as a secondary
    Secondary {
        /// Id assigned to this secondary; non-zero, unique per primary epoch
        instance_id: u32,
        /// Process id of the primary, as recorded in the block
        primary_pid: i64,
        /// User name of the primary, as recorded in the block
        primary_user: String,
    },
}

/// Run the election against the shared block until a role is resolved.
///
/// Never returns a consistency failure: inconsistency drives the internal
/// staleness-timeout recovery loop. The caller observes only the resolved
/// role, possibly delayed by up to the staleness window.
pub fn resolve_role(
    segment: &mut CoordinationSegment,
    config: &ElectionConfig,
    own_pid: i64,
    own_user: &str,
) -> CoordResult<Resolution> {
    let mut inconsistent_since: Option<Instant> = None;
    let segment_name = segment.name().to_string();

    loop {
        {
            let mut guard = segment.lock()?;
            match guard.read() {
                ConsistentRead::Valid(block) => {
                    return Ok(decide(&mut guard, block, own_pid, own_user));
                }
                ConsistentRead::Inconsistent => {
                    let since = *inconsistent_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= config.staleness_timeout {
                        tracing::warn!(
                            segment = %segment_name,
                            "coordination block inconsistent past staleness window, \
                             assuming primary crashed and reinitializing"
                        );
                        guard.reinitialize();
                        inconsistent_since = None;
                        // Re-read on the next pass rather than deciding here:
                        // another process may have won the same recovery race
                    }
                }
            }
        }

        // Jittered backoff between passes
        let jitter = rand::thread_rng().gen_range(config.jitter_min_ms..=config.jitter_max_ms);
        std::thread::sleep(Duration::from_millis(jitter));
    }
}

fn decide(
    guard: &mut crate::segment::LockedBlock<'_>,
    mut block: CoordinationBlock,
    own_pid: i64,
    own_user: &str,
) -> Resolution {
    if !block.primary_alive {
        block.set_primary(own_pid, own_user);
        guard.commit(&block);
        tracing::info!(pid = own_pid, "claimed primary role");
        return Resolution::Primary;
    }

    block.secondary_count += 1;
    let instance_id = block.secondary_count;
    guard.commit(&block);
    tracing::info!(instance_id, primary_pid = block.primary_pid, "admitted as secondary");

    Resolution::Secondary {
        instance_id,
        primary_pid: block.primary_pid,
        primary_user: block.primary_user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_policy_constants() {
        let config = ElectionConfig::default();
        assert_eq!(config.staleness_timeout, Duration::from_secs(5));
        assert_eq!(config.jitter_min_ms, 8);
        assert_eq!(config.jitter_max_ms, 18);
    }
}
