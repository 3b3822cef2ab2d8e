//! Running a plan: strategy selection and the single-URL scan.

use super::stream::{Emitter, Flow};
use super::{closest, merge, KeyPlan, Plan, QueryError, Sort};
use crate::store::{Namespace, Order, Snapshot, Store};

/// Run a plan to completion, retrying single `http` searches over `https`
/// when they find nothing.
pub(crate) fn execute(store: &dyn Store, plan: &Plan, emitter: &mut Emitter) -> Result<(), QueryError> {
    let flow = run(store, plan, emitter)?;
    if flow == Flow::Continue && emitter.sent() == 0 {
        if let Some(fallback) = plan.https_fallback() {
            debug!("No captures of {}; retrying over https", plan.keys[0].url);
            run(store, &fallback, emitter)?;
        }
    }
    Ok(())
}

fn run(store: &dyn Store, plan: &Plan, emitter: &mut Emitter) -> Result<Flow, QueryError> {
    let snapshot = store.snapshot()?;
    let snapshot = &*snapshot;

    match (plan.keys.as_slice(), plan.sort) {
        ([key], Sort::Closest) if key.scope.seek.is_some() => {
            closest::walk(snapshot, plan, key, emitter)
        }
        ([key], Sort::Descending) => scan(snapshot, plan, key, Order::Descending, emitter),
        ([key], Sort::Unsorted | Sort::Ascending) => {
            scan(snapshot, plan, key, Order::Ascending, emitter)
        }
        (_, Sort::Unsorted) => merge::interleave(snapshot, plan, emitter),
        _ => merge::sorted(store, snapshot, plan, emitter),
    }
}

/// Walk one scope in key order.
fn scan(
    snapshot: &dyn Snapshot,
    plan: &Plan,
    key: &KeyPlan,
    order: Order,
    emitter: &mut Emitter,
) -> Result<Flow, QueryError> {
    let mut cursor = snapshot.scan(Namespace::Cdx, plan.key_range(&key.scope), order)?;
    let mut flow = Flow::Continue;
    while cursor.valid() {
        flow = emitter.check();
        if flow == Flow::Stop {
            break;
        }
        if let Some(result) = plan.admit(&key.scope, cursor.key(), cursor.value()) {
            flow = emitter.send(result);
            if flow == Flow::Stop {
                break;
            }
        }
        cursor.advance();
    }
    cursor.close()?;
    Ok(flow)
}
