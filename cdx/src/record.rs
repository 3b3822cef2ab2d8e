//! Capture records and their persisted key/value shapes.
//!
//! One [`CaptureRecord`] becomes two entries when indexed:
//!
//!  * id namespace: `WARC-Record-ID` to storage reference
//!  * cdx namespace: capture key to the JSON-serialized record
//!
//! A capture key is `host+path SP timestamp SP scheme-part SP record-type`, for
//! example `com,example,/// 20200101000000 80:http: response`. Sorting on the
//! host and path first and the timestamp second puts every capture of one URL
//! next to each other in time order, and lets a timestamp appended to the
//! `host+path SP` prefix act as a seek point.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ssurt::{SsurtError, SsurtKey};
use crate::timestamp::{self, TimestampError};

/// Errors converting between captures and stored entries.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("capture URL cannot be keyed")]
    Url(#[from] SsurtError),
    #[error("only response and revisit captures are indexed, not {0}")]
    NotIndexed(RecordType),
    #[error("capture has no WARC record id")]
    MissingId,
    #[error("malformed capture key {0:?}")]
    MalformedKey(String),
    #[error("malformed timestamp in capture key")]
    Timestamp(#[from] TimestampError),
    #[error("stored value is not a valid record")]
    Json(#[from] serde_json::Error),
    #[error("stored value is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// The WARC record types the index distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    #[default]
    Response,
    Revisit,
    Other,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Response => "response",
            RecordType::Revisit => "revisit",
            RecordType::Other => "other",
        }
    }

    pub fn is_indexed(self) -> bool {
        self != RecordType::Other
    }
}

impl FromStr for RecordType {
    type Err = std::convert::Infallible;

    /// Anything other than `response` or `revisit` is [`RecordType::Other`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("response") {
            RecordType::Response
        } else if s.eq_ignore_ascii_case("revisit") {
            RecordType::Revisit
        } else {
            RecordType::Other
        })
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a revisit record refers back to.
///
/// Any part may be missing in real-world data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RevisitLink {
    /// `WARC-Refers-To-Target-URI`
    pub target_uri: Option<String>,
    /// `WARC-Refers-To-Date`
    pub target_date: Option<DateTime<Utc>>,
    /// `WARC-Refers-To`
    pub target_id: Option<String>,
}

/// One indexed capture.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub uri: String,
    /// SSURT form of `uri`, derived when the record is stored.
    pub ssurt: String,
    pub record_id: String,
    pub digest: String,
    /// Opaque locator of the raw record, `file:offset:length` for WARC files.
    pub storage_ref: String,
    pub record_type: RecordType,
    pub timestamp: DateTime<Utc>,
    pub status: Option<u16>,
    pub mime: Option<String>,
    pub content_length: u64,
    pub payload_length: u64,
    pub record_length: u64,
    pub revisit: Option<RevisitLink>,
}

impl CaptureRecord {
    /// A capture with its SSURT key derived and every optional field empty.
    pub fn new(
        uri: &str,
        record_id: &str,
        record_type: RecordType,
        timestamp: DateTime<Utc>,
    ) -> Result<CaptureRecord, SsurtError> {
        Ok(CaptureRecord {
            uri: uri.to_owned(),
            ssurt: crate::ssurt::encode(uri)?,
            record_id: record_id.to_owned(),
            record_type,
            timestamp,
            ..Default::default()
        })
    }

    /// The 14-digit form of this capture's timestamp.
    pub fn timestamp14(&self) -> String {
        timestamp::format(&self.timestamp)
    }

    /// The key this capture is stored under in the cdx namespace.
    pub fn cdx_key(&self) -> Result<CdxKey, RecordError> {
        let ssurt = SsurtKey::encode(&self.uri)?;
        Ok(CdxKey {
            search_key: ssurt.search_key(),
            timestamp: self.timestamp14(),
            scheme: ssurt.scheme().to_owned(),
            record_type: self.record_type,
        })
    }
}

/// A parsed capture key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdxKey {
    /// Host and path parts of the SSURT.
    pub search_key: String,
    pub timestamp: String,
    /// Scheme part of the SSURT, e.g. `443:https:`.
    pub scheme: String,
    pub record_type: RecordType,
}

impl CdxKey {
    pub fn parse(key: &str) -> Result<CdxKey, RecordError> {
        let malformed = || RecordError::MalformedKey(key.to_owned());

        // Splitting from the right keeps any spaces in the search key intact.
        let mut parts = key.rsplitn(4, ' ');
        let record_type = parts.next().ok_or_else(malformed)?;
        let scheme = parts.next().ok_or_else(malformed)?;
        let timestamp = parts.next().ok_or_else(malformed)?;
        let search_key = parts.next().ok_or_else(malformed)?;
        if timestamp.len() != timestamp::TIMESTAMP_LEN
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        Ok(CdxKey {
            search_key: search_key.to_owned(),
            timestamp: timestamp.to_owned(),
            scheme: scheme.to_owned(),
            record_type: record_type.parse().unwrap_or(RecordType::Other),
        })
    }

    pub fn parse_bytes(key: &[u8]) -> Result<CdxKey, RecordError> {
        let key = std::str::from_utf8(key)
            .map_err(|_| RecordError::MalformedKey(String::from_utf8_lossy(key).into_owned()))?;
        Self::parse(key)
    }

    /// Seconds since the epoch of the capture time.
    pub fn seconds(&self) -> Result<i64, RecordError> {
        Ok(timestamp::seconds(&self.timestamp)?)
    }
}

impl fmt::Display for CdxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.search_key, self.timestamp, self.scheme, self.record_type
        )
    }
}

/// Timestamp part of a raw capture key, without allocating.
pub(crate) fn key_timestamp(key: &[u8]) -> Option<&[u8]> {
    let mut parts = key.rsplitn(4, |&b| b == b' ');
    parts.next()?;
    parts.next()?;
    let timestamp = parts.next()?;
    parts.next()?;
    Some(timestamp)
}

/// A key and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// The entries one capture contributes to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entries {
    pub id: Entry,
    pub cdx: Entry,
}

/// Produce the id and cdx entries for a capture.
///
/// The stored record carries the SSURT derived from its URI, whatever the
/// `ssurt` field held before.
pub fn encode(record: &CaptureRecord) -> Result<Entries, RecordError> {
    if !record.record_type.is_indexed() {
        return Err(RecordError::NotIndexed(record.record_type));
    }
    if record.record_id.is_empty() {
        return Err(RecordError::MissingId);
    }

    let ssurt = SsurtKey::encode(&record.uri)?;
    let key = CdxKey {
        search_key: ssurt.search_key(),
        timestamp: record.timestamp14(),
        scheme: ssurt.scheme().to_owned(),
        record_type: record.record_type,
    };

    let ssurt = ssurt.to_string();
    let value = if ssurt == record.ssurt {
        serde_json::to_vec(record)?
    } else {
        serde_json::to_vec(&CaptureRecord {
            ssurt,
            ..record.clone()
        })?
    };

    Ok(Entries {
        id: Entry {
            key: record.record_id.as_bytes().to_vec(),
            value: record.storage_ref.as_bytes().to_vec(),
        },
        cdx: Entry {
            key: key.to_string().into_bytes(),
            value,
        },
    })
}

/// Recover a capture from its cdx entry value.
pub fn decode(value: &[u8]) -> Result<CaptureRecord, RecordError> {
    Ok(serde_json::from_slice(value)?)
}

/// Recover a storage reference from its id entry value.
pub fn decode_storage_ref(value: &[u8]) -> Result<String, RecordError> {
    Ok(String::from_utf8(value.to_vec())?)
}

/// Format a capture as a CDXJ line: `urlkey timestamp {json}`.
pub fn to_cdxj(record: &CaptureRecord) -> Result<String, RecordError> {
    let urlkey = match record.cdx_key() {
        Ok(key) => key.search_key,
        Err(_) => record.ssurt.clone(),
    };
    let mut fields = serde_json::Map::new();
    fields.insert("url".into(), record.uri.clone().into());
    if let Some(mime) = &record.mime {
        fields.insert("mime".into(), mime.clone().into());
    }
    if let Some(status) = record.status {
        fields.insert("status".into(), status.to_string().into());
    }
    fields.insert("digest".into(), record.digest.clone().into());
    fields.insert("length".into(), record.record_length.to_string().into());
    fields.insert("filename".into(), record.storage_ref.clone().into());
    fields.insert("type".into(), record.record_type.as_str().into());

    Ok(format!(
        "{} {} {}",
        urlkey,
        record.timestamp14(),
        serde_json::to_string(&fields)?
    ))
}

/// Bookkeeping for one indexed source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileInfo {
    /// Describe the file at `path` as it is now, keyed by its file name.
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<FileInfo> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
            })?;

        Ok(FileInfo {
            name,
            path: fs::canonicalize(path)?,
            size: metadata.len(),
            modified: metadata.modified()?.into(),
        })
    }

    /// Whether `current` describes the same file contents as this record did.
    pub fn is_unchanged(&self, current: &FileInfo) -> bool {
        self.size == current.size && self.modified == current.modified
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(value: &[u8]) -> Result<FileInfo, RecordError> {
        Ok(serde_json::from_slice(value)?)
    }
}
