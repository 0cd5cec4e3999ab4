//! Resolution escalation.
//!
//! Coarse feeds are cheap to catch up on but lag behind real time by up to one
//! period. Once the next coarse diff lies in the future, ingestion moves one
//! level finer. The finer feed numbers its diffs independently, so the matching
//! position is found by probing its state files:
//!
//! 1. Estimate: scale the current sequence number by the ratio of periods.
//! 2. Probe the candidate. Too late (or 404) moves backward, too early moves forward.
//! 3. Halve the step whenever the direction reverses.
//! 4. Stop once a state timestamp lies within half a finer period of the target.
//!
//! A step that shrinks to zero, or a probe budget that runs out, means the remote
//! index is not what this search assumes; both are fatal.

use strata_core::replica::{Cursor, Feed};

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::source::ReplicationSource;

const INITIAL_STEP: i64 = 2 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Returns `cursor` moved one resolution finer, positioned at the finer diff whose
/// timestamp matches the cursor's last diff.
///
/// `dataset` and `last_sequence_id` are unchanged. A cursor already at the finest
/// resolution is returned as is.
///
/// # Errors
///
/// Returns [`ReplicationError::NavigationFailed`] if the search does not converge
/// within `max_probes` probes, and propagates any fetch error.
pub async fn escalate<S>(source: &S, cursor: &Cursor, max_probes: u32) -> Result<Cursor>
where
    S: ReplicationSource + ?Sized,
{
    let Some(finer) = cursor.resolution.finer() else {
        return Ok(cursor.clone());
    };
    let feed = Feed::new(cursor.dataset, finer);
    let target = cursor.last_replica.created_at;
    let threshold = finer.period() / 2;
    let ratio = cursor.resolution.period().num_seconds() / finer.period().num_seconds();

    let mut candidate = i64::try_from(cursor.last_replica.sequence_number)
        .unwrap_or(i64::MAX)
        .saturating_mul(ratio);
    let mut step = INITIAL_STEP;
    let mut direction = None;
    let failed = |message: String| ReplicationError::NavigationFailed {
        feed,
        target,
        message,
    };

    for _ in 0..max_probes {
        if step == 0 {
            return Err(failed(format!(
                "search step shrank to zero near sequence {candidate}"
            )));
        }

        let observed = match u64::try_from(candidate) {
            Err(_) => None,
            Ok(sequence_number) => {
                metrics::record_navigator_probe(finer.as_str());
                source.fetch_state(feed, sequence_number).await?
            }
        };

        let next = match observed {
            // Nothing before sequence zero: treat as too early.
            None if candidate < 0 => Direction::Forward,
            None => Direction::Backward,
            Some(pointer) => {
                let offset = pointer.created_at - target;
                if offset.abs() < threshold {
                    tracing::info!(
                        from = %cursor.resolution,
                        to = %finer,
                        sequence_number = pointer.sequence_number,
                        created_at = %pointer.created_at,
                        "found replica at finer resolution"
                    );
                    return Ok(Cursor {
                        resolution: finer,
                        last_replica: pointer,
                        ..cursor.clone()
                    });
                }
                if offset > chrono::TimeDelta::zero() {
                    Direction::Backward
                } else {
                    Direction::Forward
                }
            }
        };

        if direction.is_some_and(|previous| previous != next) {
            step >>= 1;
        }
        direction = Some(next);
        candidate = match next {
            Direction::Forward => candidate.saturating_add(step),
            Direction::Backward => candidate.saturating_sub(step),
        };
    }

    Err(failed(format!("no convergence within {max_probes} probes")))
}
