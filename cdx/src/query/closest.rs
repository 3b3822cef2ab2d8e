//! Nearest-in-time search over the captures of one URL.
//!
//! Two cursors start at `url SP target`: one walks forward to later captures,
//! the other backward to earlier ones. Each step emits whichever current
//! capture is nearer the target and advances only that cursor, so results
//! come out in order of increasing distance. When both are equally near the
//! earlier capture (the backward cursor) goes first.
//!
//! Note the tie rule is not "forward first". A lookup for 12:00 between
//! captures at 11:00 and 13:00 returns the 11:00 capture before the 13:00
//! one, even though the forward cursor holds the later capture.

use super::stream::{Emitter, Flow};
use super::{KeyPlan, Plan, QueryError};
use crate::record::CdxKey;
use crate::store::{prefix_end, Cursor, KeyRange, Namespace, Order, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClosestState {
    BothValid,
    ForwardOnly,
    BackwardOnly,
    Exhausted,
}

impl ClosestState {
    fn of(forward: &Cursor<'_>, backward: &Cursor<'_>) -> Self {
        match (forward.valid(), backward.valid()) {
            (true, true) => ClosestState::BothValid,
            (true, false) => ClosestState::ForwardOnly,
            (false, true) => ClosestState::BackwardOnly,
            (false, false) => ClosestState::Exhausted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Forward,
    Backward,
}

/// Seconds between a capture and the target; unparsable keys sort last.
fn distance(key: &[u8], target: i64) -> u64 {
    CdxKey::parse_bytes(key)
        .and_then(|key| key.seconds())
        .map(|seconds| seconds.abs_diff(target))
        .unwrap_or(u64::MAX)
}

/// Pick the side to emit from, earlier capture first on a tie.
fn pick(state: ClosestState, forward: &Cursor<'_>, backward: &Cursor<'_>, target: i64) -> Option<Side> {
    match state {
        ClosestState::BothValid => {
            if distance(backward.key(), target) <= distance(forward.key(), target) {
                Some(Side::Backward)
            } else {
                Some(Side::Forward)
            }
        }
        ClosestState::ForwardOnly => Some(Side::Forward),
        ClosestState::BackwardOnly => Some(Side::Backward),
        ClosestState::Exhausted => None,
    }
}

pub(crate) fn walk(
    snapshot: &dyn Snapshot,
    plan: &Plan,
    key: &KeyPlan,
    emitter: &mut Emitter,
) -> Result<Flow, QueryError> {
    let (seek, (target, target_seconds)) = match (&key.scope.seek, &plan.target) {
        (Some(seek), Some(target)) => (seek, target),
        _ => return Ok(Flow::Continue),
    };
    let start = format!("{}{}", seek, target).into_bytes();
    let prefix = key.scope.prefix.as_bytes();

    let mut forward = snapshot.scan(
        Namespace::Cdx,
        KeyRange::new(start.clone(), prefix_end(prefix)),
        Order::Ascending,
    )?;
    let mut backward = snapshot.scan(
        Namespace::Cdx,
        KeyRange::new(prefix.to_vec(), start),
        Order::Descending,
    )?;

    let mut flow = Flow::Continue;
    while let Some(side) = pick(
        ClosestState::of(&forward, &backward),
        &forward,
        &backward,
        *target_seconds,
    ) {
        flow = emitter.check();
        if flow == Flow::Stop {
            break;
        }
        let cursor = match side {
            Side::Forward => &mut forward,
            Side::Backward => &mut backward,
        };
        if let Some(result) = plan.admit(&key.scope, cursor.key(), cursor.value()) {
            trace!(
                "closest: {:?} {}",
                side,
                String::from_utf8_lossy(cursor.key())
            );
            flow = emitter.send(result);
            if flow == Flow::Stop {
                break;
            }
        }
        cursor.advance();
    }

    forward.close()?;
    backward.close()?;
    Ok(flow)
}
