//! Locating the capture a revisit record refers to.
//!
//! Resolution is a single hop: a revisit that points at another revisit is
//! resolved to that revisit, never followed further.

use std::fmt;

use super::QueryError;
use crate::matching::{self, MatchType};
use crate::record::{self, CaptureRecord, CdxKey, RecordType};
use crate::ssurt::SsurtKey;
use crate::store::{KeyRange, Namespace, Order, Snapshot, Store};
use crate::timestamp;

/// Why a revisit could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisitFailure {
    NotRevisit,
    /// The record names neither a target id nor a target URI and date.
    NoLinkage,
    SelfReference,
    TargetMissing,
}

impl fmt::Display for RevisitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RevisitFailure::NotRevisit => "record is not a revisit",
            RevisitFailure::NoLinkage => "record does not say what it revisits",
            RevisitFailure::SelfReference => "record refers to itself",
            RevisitFailure::TargetMissing => "target is not in the index",
        })
    }
}

/// The record a revisit resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisitTarget {
    pub record_id: String,
    pub storage_ref: String,
}

/// Find the original capture of a revisit record.
///
/// The target's record id is looked up first; failing that, the capture of the
/// target URI at the target date.
pub fn resolve_revisit(store: &dyn Store, revisit: &CaptureRecord) -> Result<RevisitTarget, QueryError> {
    let unresolved = |reason| QueryError::UnresolvedRevisit {
        record_id: revisit.record_id.clone(),
        reason,
    };

    if revisit.record_type != RecordType::Revisit {
        return Err(unresolved(RevisitFailure::NotRevisit));
    }
    let link = match &revisit.revisit {
        Some(link) => link,
        None => return Err(unresolved(RevisitFailure::NoLinkage)),
    };
    let by_date = match (&link.target_uri, &link.target_date) {
        (Some(uri), Some(date)) => Some((uri.as_str(), timestamp::format(date))),
        _ => None,
    };
    if link.target_id.is_none() && by_date.is_none() {
        return Err(unresolved(RevisitFailure::NoLinkage));
    }

    let snapshot = store.snapshot()?;

    if let Some(id) = &link.target_id {
        if *id == revisit.record_id {
            return Err(unresolved(RevisitFailure::SelfReference));
        }
        if let Some(value) = snapshot.get(Namespace::Id, id.as_bytes())? {
            return Ok(RevisitTarget {
                record_id: id.clone(),
                storage_ref: record::decode_storage_ref(&value)?,
            });
        }
        debug!("Revisit target {} of {} not in id index", id, revisit.record_id);
    }

    if let Some((uri, date)) = by_date {
        if let Some(original) = capture_at(&*snapshot, uri, &date)? {
            if original.record_id == revisit.record_id {
                return Err(unresolved(RevisitFailure::SelfReference));
            }
            return Ok(RevisitTarget {
                record_id: original.record_id,
                storage_ref: original.storage_ref,
            });
        }
    }

    Err(unresolved(RevisitFailure::TargetMissing))
}

/// The first response capture of `uri` at exactly `timestamp`.
fn capture_at(
    snapshot: &dyn Snapshot,
    uri: &str,
    timestamp: &str,
) -> Result<Option<CaptureRecord>, QueryError> {
    let key = SsurtKey::encode(uri)?.to_string();
    let scope = matching::scope(&key, MatchType::Exact);
    let seek = match scope.seek {
        Some(seek) => seek,
        None => return Ok(None),
    };

    let prefix = format!("{}{} ", seek, timestamp);
    let mut cursor = snapshot.scan(
        Namespace::Cdx,
        KeyRange::prefix(prefix.as_bytes()),
        Order::Ascending,
    )?;
    while cursor.valid() {
        if CdxKey::parse_bytes(cursor.key())?.record_type == RecordType::Response {
            return Ok(Some(record::decode(cursor.value())?));
        }
        cursor.advance();
    }
    cursor.close()?;
    Ok(None)
}
