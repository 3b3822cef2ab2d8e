//! Searches spanning several URLs (or one non-exact closest search).
//!
//! [`interleave`] streams: it keeps one cursor per URL and always emits from
//! the cursor holding the earliest capture. [`sorted`] does not: one worker per
//! URL collects matching keys into a shared channel, the full key set is
//! sorted, and each key is then looked up again in the query's snapshot.

use std::cmp::Ordering;
use std::sync::mpsc;
use std::thread;

use super::stream::{CancelToken, Emitter, Flow};
use super::{KeyPlan, Plan, QueryError, Sort};
use crate::record::{key_timestamp, CdxKey};
use crate::store::{Cursor, Namespace, Order, Snapshot, Store};

pub(crate) fn interleave(
    snapshot: &dyn Snapshot,
    plan: &Plan,
    emitter: &mut Emitter,
) -> Result<Flow, QueryError> {
    let mut cursors: Vec<(&KeyPlan, Cursor<'_>)> = Vec::with_capacity(plan.keys.len());
    for key in &plan.keys {
        let cursor = snapshot.scan(Namespace::Cdx, plan.key_range(&key.scope), Order::Ascending)?;
        cursors.push((key, cursor));
    }

    loop {
        if emitter.check() == Flow::Stop {
            return Ok(Flow::Stop);
        }

        // Retire exhausted cursors, surfacing any that stopped on an error.
        let mut i = 0;
        while i < cursors.len() {
            if cursors[i].1.valid() {
                i += 1;
            } else {
                let (_, cursor) = cursors.remove(i);
                cursor.close()?;
            }
        }

        // min_by keeps the first of equal elements, so ties go to the URL
        // listed first.
        let earliest = cursors
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| compare_timestamps(a.1.key(), b.1.key()))
            .map(|(i, _)| i);
        let (key, cursor) = match earliest {
            Some(i) => &mut cursors[i],
            None => return Ok(Flow::Continue),
        };

        // A capture that is filtered out only advances its cursor; the next
        // round looks for the earliest capture again.
        if let Some(result) = plan.admit(&key.scope, cursor.key(), cursor.value()) {
            if emitter.send(result) == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        cursor.advance();
    }
}

fn compare_timestamps(a: &[u8], b: &[u8]) -> Ordering {
    key_timestamp(a).cmp(&key_timestamp(b))
}

/// A matching capture key found by a collection worker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    seconds: i64,
    key: Vec<u8>,
}

fn collect(
    store: &dyn Store,
    plan: &Plan,
    key: &KeyPlan,
    cancel: &CancelToken,
    tx: mpsc::Sender<Result<Candidate, QueryError>>,
) {
    let result = (|| -> Result<(), QueryError> {
        let snapshot = store.snapshot()?;
        let mut cursor =
            snapshot.scan(Namespace::Cdx, plan.key_range(&key.scope), Order::Ascending)?;
        while cursor.valid() && !cancel.is_cancelled() {
            let parsed = CdxKey::parse_bytes(cursor.key())?;
            if plan.admit_key(&key.scope, &parsed) {
                let candidate = Candidate {
                    seconds: parsed.seconds()?,
                    key: cursor.key().to_vec(),
                };
                if tx.send(Ok(candidate)).is_err() {
                    break;
                }
            }
            cursor.advance();
        }
        cursor.close()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = tx.send(Err(e));
    }
}

fn order(candidates: &mut Vec<Candidate>, sort: Sort, target: Option<i64>) {
    match (sort, target) {
        (Sort::Closest, Some(target)) => candidates.sort_by(|a, b| {
            (a.seconds.abs_diff(target), a.seconds, &a.key).cmp(&(
                b.seconds.abs_diff(target),
                b.seconds,
                &b.key,
            ))
        }),
        (Sort::Descending, _) => {
            candidates.sort_by(|a, b| (b.seconds, &b.key).cmp(&(a.seconds, &a.key)))
        }
        _ => candidates.sort_by(|a, b| (a.seconds, &a.key).cmp(&(b.seconds, &b.key))),
    }
    // Overlapping scopes find the same key more than once.
    candidates.dedup_by(|a, b| a.key == b.key);
}

pub(crate) fn sorted(
    store: &dyn Store,
    snapshot: &dyn Snapshot,
    plan: &Plan,
    emitter: &mut Emitter,
) -> Result<Flow, QueryError> {
    let (tx, rx) = mpsc::channel();
    let cancel = emitter.token();

    let mut candidates = Vec::new();
    let mut failure = None;
    thread::scope(|scope| {
        for key in &plan.keys {
            let tx = tx.clone();
            let cancel = &cancel;
            scope.spawn(move || collect(store, plan, key, cancel, tx));
        }
        drop(tx);

        for candidate in rx {
            match candidate {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }

    let target = plan.target.as_ref().map(|(_, seconds)| *seconds);
    order(&mut candidates, plan.sort, target);
    debug!(
        "Merging {} candidate captures from {} keys",
        candidates.len(),
        plan.keys.len()
    );

    for candidate in candidates {
        if emitter.check() == Flow::Stop {
            return Ok(Flow::Stop);
        }
        let value = match snapshot.get(Namespace::Cdx, &candidate.key)? {
            Some(value) => value,
            // Written after this query's snapshot was taken.
            None => continue,
        };
        let result = match crate::record::decode(&value) {
            Ok(capture) if super::filter::matches_all(&plan.filters, &capture) => Ok(capture),
            Ok(_) => continue,
            Err(e) => Err(e.into()),
        };
        if emitter.send(result) == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn candidate(seconds: i64, key: &str) -> Candidate {
        Candidate {
            seconds,
            key: key.as_bytes().to_vec(),
        }
    }

    fn keys(candidates: &[Candidate]) -> Vec<&str> {
        candidates
            .iter()
            .map(|c| std::str::from_utf8(&c.key).unwrap())
            .collect()
    }

    #[test]
    fn orders_and_deduplicates() {
        let input = vec![
            candidate(30, "b 30"),
            candidate(10, "a 10"),
            candidate(20, "c 20"),
            candidate(10, "a 10"),
        ];

        let mut ascending = input.clone();
        order(&mut ascending, Sort::Ascending, None);
        assert_eq!(keys(&ascending), ["a 10", "c 20", "b 30"]);

        let mut descending = input.clone();
        order(&mut descending, Sort::Descending, None);
        assert_eq!(keys(&descending), ["b 30", "c 20", "a 10"]);

        let mut closest = input;
        order(&mut closest, Sort::Closest, Some(24));
        assert_eq!(keys(&closest), ["c 20", "b 30", "a 10"]);
    }

    #[test]
    fn closest_ties_prefer_earlier() {
        let mut input = vec![candidate(30, "later"), candidate(10, "earlier")];
        order(&mut input, Sort::Closest, Some(20));
        assert_eq!(keys(&input), ["earlier", "later"]);
    }

    #[test]
    fn compares_key_timestamps() {
        assert_eq!(
            compare_timestamps(
                b"z 20200101000000 80:http: response",
                b"a 20210101000000 80:http: response"
            ),
            Ordering::Less
        );
    }
}
