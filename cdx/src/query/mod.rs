//! Searching the capture index.
//!
//! A [`SearchRequest`] is validated into a plan up front, so a malformed
//! request fails before any results are produced. The plan then runs on its
//! own thread, which opens a snapshot of the store and streams matching
//! captures back through a bounded channel ([`ResultStream`]).
//!
//! Which retrieval strategy runs depends on the shape of the request:
//!
//! | URLs | sort               | strategy                                   |
//! |------|--------------------|--------------------------------------------|
//! | 1    | none/asc/desc      | prefix scan, forward or reverse            |
//! | 1    | closest, exact URL | two cursors walking away from the target   |
//! | many | none               | interleave cursors by earliest timestamp   |
//! | any  | other              | parallel key collection, sort, re-resolve  |

use std::fmt;
use std::str::FromStr;
use std::sync::{mpsc, Arc};
use std::thread;

use thiserror::Error;
use url::Url;

use crate::matching::{self, MatchType, Scope};
use crate::record::{self, CdxKey, RecordError};
use crate::ssurt::{self, SsurtError, SsurtKey};
use crate::store::{prefix_end, KeyRange, Store, StoreError};
use crate::timestamp::{self, TimestampError};

mod closest;
mod filter;
mod merge;
mod revisit;
mod search;
mod stream;

pub use filter::{Filter, FilterError};
pub use revisit::{resolve_revisit, RevisitFailure, RevisitTarget};
pub use stream::{CancelToken, QueryResult, ResultStream};

use stream::Emitter;

/// Order of search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sort {
    /// Key order for one URL; earliest-first interleaving for several.
    #[default]
    Unsorted,
    Ascending,
    Descending,
    /// Nearest to the requested time first.
    Closest,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown sort order {0:?}")]
pub struct InvalidSort(pub String);

impl FromStr for Sort {
    type Err = InvalidSort;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "unsorted" => Ok(Sort::Unsorted),
            "asc" | "ascending" => Ok(Sort::Ascending),
            "desc" | "descending" | "reverse" => Ok(Sort::Descending),
            "closest" => Ok(Sort::Closest),
            _ => Err(InvalidSort(s.to_owned())),
        }
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sort::Unsorted => "unsorted",
            Sort::Ascending => "ascending",
            Sort::Descending => "descending",
            Sort::Closest => "closest",
        })
    }
}

/// What to search for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub urls: Vec<String>,
    pub match_type: MatchType,
    /// Inclusive lower bound, 4 to 14 digits.
    pub from: Option<String>,
    /// Inclusive upper bound, 4 to 14 digits.
    pub to: Option<String>,
    /// Target time for closest sorting, 4 to 14 digits.
    pub closest: Option<String>,
    pub sort: Sort,
    pub limit: Option<usize>,
    /// `[!][=|~]field:value` expressions; see [`Filter`].
    pub filters: Vec<String>,
}

impl SearchRequest {
    /// An exact, unsorted search for one URL.
    pub fn new(url: &str) -> Self {
        SearchRequest {
            urls: vec![url.to_owned()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Results buffered between a query's worker and its reader.
    pub capacity: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions { capacity: 256 }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("search needs at least one URL")]
    NoUrls,
    #[error("invalid search URL")]
    Url(#[from] SsurtError),
    #[error("invalid timestamp")]
    Timestamp(#[from] TimestampError),
    #[error("invalid filter")]
    Filter(#[from] FilterError),
    #[error("closest sorting needs a target time")]
    ClosestWithoutTarget,
    #[error("storage error")]
    Store(#[from] StoreError),
    #[error("unreadable capture")]
    Record(#[from] RecordError),
    #[error("query worker could not be started")]
    Io(#[from] std::io::Error),
    #[error("query cancelled")]
    Cancelled,
    #[error("cannot resolve revisit {record_id}: {reason}")]
    UnresolvedRevisit {
        record_id: String,
        reason: RevisitFailure,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct KeyPlan {
    pub url: Url,
    pub scope: Scope,
}

impl KeyPlan {
    fn new(url: Url, match_type: MatchType) -> Result<KeyPlan, QueryError> {
        let key = SsurtKey::from_url(&url)?.to_string();
        Ok(KeyPlan {
            scope: matching::scope(&key, match_type),
            url,
        })
    }
}

/// A validated request.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub keys: Vec<KeyPlan>,
    pub match_type: MatchType,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Padded target timestamp and its epoch seconds.
    pub target: Option<(String, i64)>,
    pub sort: Sort,
    pub limit: Option<usize>,
    pub filters: Vec<Filter>,
}

impl Plan {
    pub(crate) fn prepare(request: &SearchRequest) -> Result<Plan, QueryError> {
        if request.urls.is_empty() {
            return Err(QueryError::NoUrls);
        }
        let mut keys: Vec<KeyPlan> = Vec::with_capacity(request.urls.len());
        for url in &request.urls {
            let key = KeyPlan::new(ssurt::normalize(url)?, request.match_type)?;
            // Overlapping scopes would yield the same capture once per URL.
            if keys.iter().any(|k| k.scope.covers(&key.scope)) {
                continue;
            }
            keys.retain(|k| !key.scope.covers(&k.scope));
            keys.push(key);
        }

        let from = request.from.as_deref().map(timestamp::pad_lower).transpose()?;
        let to = request.to.as_deref().map(timestamp::pad_upper).transpose()?;
        let target = match request.closest.as_deref() {
            Some(t) => {
                let padded = timestamp::pad_lower(t)?;
                let seconds = timestamp::seconds(&padded)?;
                Some((padded, seconds))
            }
            None => None,
        };

        let sort = match (request.sort, &target) {
            (Sort::Unsorted, Some(_)) => Sort::Closest,
            (Sort::Closest, None) => return Err(QueryError::ClosestWithoutTarget),
            (sort, _) => sort,
        };

        let filters = request
            .filters
            .iter()
            .map(|f| f.parse())
            .collect::<Result<Vec<Filter>, _>>()?;

        Ok(Plan {
            keys,
            match_type: request.match_type,
            from,
            to,
            target,
            sort,
            limit: request.limit,
            filters,
        })
    }

    /// The same single-URL search over `https`, if that covers different keys.
    pub(crate) fn https_fallback(&self) -> Option<Plan> {
        let key = match self.keys.as_slice() {
            [key] if key.url.scheme() == "http" => key,
            _ => return None,
        };
        let mut url = key.url.clone();
        url.set_scheme("https").ok()?;
        let fallback = KeyPlan::new(url, self.match_type).ok()?;
        if fallback.scope == key.scope {
            return None;
        }
        Some(Plan {
            keys: vec![fallback],
            ..self.clone()
        })
    }

    /// Keys a scan for `scope` must visit, narrowed by the date range when
    /// the scope pins down one URL.
    pub(crate) fn key_range(&self, scope: &Scope) -> KeyRange {
        match &scope.seek {
            Some(seek) => {
                let start = match &self.from {
                    Some(from) => format!("{}{}", seek, from),
                    None => seek.clone(),
                };
                let end = match &self.to {
                    Some(to) => prefix_end(format!("{}{}", seek, to).as_bytes()),
                    None => prefix_end(scope.prefix.as_bytes()),
                };
                KeyRange::new(start.into_bytes(), end)
            }
            None => KeyRange::prefix(scope.prefix.as_bytes()),
        }
    }

    /// Whether a capture key passes the date range and scheme restriction.
    pub(crate) fn admit_key(&self, scope: &Scope, key: &CdxKey) -> bool {
        if let Some(from) = &self.from {
            if key.timestamp.as_str() < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if key.timestamp.as_str() > to.as_str() {
                return false;
            }
        }
        match &scope.scheme {
            Some(scheme) => &key.scheme == scheme,
            None => true,
        }
    }

    /// Decide whether a stored capture belongs in the results.
    ///
    /// `None` means skip it; an error is reported against that one result.
    pub(crate) fn admit(&self, scope: &Scope, key: &[u8], value: &[u8]) -> Option<QueryResult> {
        let parsed = match CdxKey::parse_bytes(key) {
            Ok(parsed) => parsed,
            Err(e) => return Some(Err(e.into())),
        };
        if !self.admit_key(scope, &parsed) {
            return None;
        }
        match record::decode(value) {
            Ok(capture) if filter::matches_all(&self.filters, &capture) => Some(Ok(capture)),
            Ok(_) => None,
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Start a search on its own thread.
pub fn search(
    store: Arc<dyn Store>,
    request: &SearchRequest,
    options: &QueryOptions,
) -> Result<ResultStream, QueryError> {
    let plan = Plan::prepare(request)?;
    debug!(
        "Search {:?} match={} sort={} keys={}",
        request.urls,
        plan.match_type,
        plan.sort,
        plan.keys.len()
    );

    let (tx, rx) = mpsc::sync_channel(options.capacity.max(1));
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let worker = thread::Builder::new()
        .name("cdx-query".into())
        .spawn(move || {
            let mut emitter = Emitter::new(tx, worker_cancel, plan.limit);
            if let Err(e) = search::execute(&*store, &plan, &mut emitter) {
                warn!("Search failed: {}", e);
                emitter.fail(e);
            }
        })?;

    Ok(ResultStream::new(rx, cancel, worker))
}

/// Every capture of `url`, nearest to `target` first.
pub fn closest(
    store: Arc<dyn Store>,
    url: &str,
    target: &str,
    limit: Option<usize>,
    options: &QueryOptions,
) -> Result<ResultStream, QueryError> {
    let request = SearchRequest {
        closest: Some(target.to_owned()),
        sort: Sort::Closest,
        limit,
        ..SearchRequest::new(url)
    };
    search(store, &request, options)
}
