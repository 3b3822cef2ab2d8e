//! Field filters over capture records.
//!
//! A filter is written `[!][=|~]field:value`:
//!
//! * `status:2..` matches when the field starts with a match of the regex
//! * `=mime:text/html` matches when the field equals the value
//! * `~url:login` matches when the field contains the value
//! * a leading `!` inverts any of the above

use std::borrow::Cow;
use std::str::FromStr;

use regex::Regex;
use thiserror::Error;

use crate::record::CaptureRecord;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter {0:?} is not of the form [!][=|~]field:value")]
    Syntax(String),
    #[error("unknown filter field {0:?}")]
    UnknownField(String),
    #[error("invalid filter expression")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    UrlKey,
    Timestamp,
    Url,
    Mime,
    Status,
    Digest,
    Length,
    Type,
    Filename,
}

impl Field {
    fn parse(name: &str) -> Option<Field> {
        Some(match name {
            "urlkey" => Field::UrlKey,
            "timestamp" => Field::Timestamp,
            "url" | "original" => Field::Url,
            "mime" | "mimetype" => Field::Mime,
            "status" | "statuscode" => Field::Status,
            "digest" => Field::Digest,
            "length" => Field::Length,
            "type" => Field::Type,
            "filename" => Field::Filename,
            _ => return None,
        })
    }

    fn extract(self, record: &CaptureRecord) -> Cow<'_, str> {
        match self {
            Field::UrlKey => Cow::Borrowed(&record.ssurt),
            Field::Timestamp => Cow::Owned(record.timestamp14()),
            Field::Url => Cow::Borrowed(&record.uri),
            Field::Mime => Cow::Borrowed(record.mime.as_deref().unwrap_or("-")),
            Field::Status => match record.status {
                Some(status) => Cow::Owned(status.to_string()),
                None => Cow::Borrowed("-"),
            },
            Field::Digest => Cow::Borrowed(&record.digest),
            Field::Length => Cow::Owned(record.record_length.to_string()),
            Field::Type => Cow::Borrowed(record.record_type.as_str()),
            Field::Filename => Cow::Borrowed(&record.storage_ref),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Exact(String),
    Contains(String),
}

/// One parsed filter expression.
#[derive(Debug, Clone)]
pub struct Filter {
    field: Field,
    matcher: Matcher,
    negate: bool,
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let (negate, rest) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, expr),
        };
        let (mode, rest) = match rest.chars().next() {
            Some(c @ ('=' | '~')) => (Some(c), &rest[1..]),
            _ => (None, rest),
        };
        let (name, value) = rest
            .split_once(':')
            .ok_or_else(|| FilterError::Syntax(expr.to_owned()))?;
        if name.is_empty() {
            return Err(FilterError::Syntax(expr.to_owned()));
        }
        let field = Field::parse(name).ok_or_else(|| FilterError::UnknownField(name.to_owned()))?;

        let matcher = match mode {
            Some('=') => Matcher::Exact(value.to_owned()),
            Some(_) => Matcher::Contains(value.to_owned()),
            None => Matcher::Regex(Regex::new(&format!("^(?:{})", value))?),
        };
        Ok(Filter {
            field,
            matcher,
            negate,
        })
    }
}

impl Filter {
    pub fn matches(&self, record: &CaptureRecord) -> bool {
        let value = self.field.extract(record);
        let hit = match &self.matcher {
            Matcher::Regex(re) => re.is_match(&value),
            Matcher::Exact(s) => value == s.as_str(),
            Matcher::Contains(s) => value.contains(s.as_str()),
        };
        hit != self.negate
    }
}

/// Whether `record` passes every filter.
pub fn matches_all(filters: &[Filter], record: &CaptureRecord) -> bool {
    filters.iter().all(|f| f.matches(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use chrono::{TimeZone, Utc};

    fn record() -> CaptureRecord {
        CaptureRecord {
            status: Some(404),
            mime: Some("text/html".into()),
            storage_ref: "crawl-1.warc.gz:0:10".into(),
            ..CaptureRecord::new(
                "http://example.com/login?next=/",
                "<urn:uuid:x>",
                RecordType::Response,
                Utc.with_ymd_and_hms(2021, 5, 1, 12, 0, 0).unwrap(),
            )
            .unwrap()
        }
    }

    fn check(expr: &str) -> bool {
        expr.parse::<Filter>().unwrap().matches(&record())
    }

    #[test]
    fn regex_is_anchored_at_start() {
        assert!(check("status:4.."));
        assert!(check("mime:text/"));
        assert!(!check("mime:html"));
        assert!(check("timestamp:2021"));
    }

    #[test]
    fn exact_and_contains() {
        assert!(check("=mime:text/html"));
        assert!(!check("=mime:text/"));
        assert!(check("~url:login"));
        assert!(check("~filename:crawl-1"));
        assert!(check("=type:response"));
    }

    #[test]
    fn negation() {
        assert!(!check("!status:4.."));
        assert!(check("!=status:200"));
        assert!(check("!~url:logout"));
    }

    #[test]
    fn missing_fields_match_dash() {
        let bare = CaptureRecord {
            status: None,
            mime: None,
            ..record()
        };
        let filter: Filter = "=status:-".parse().unwrap();
        assert!(filter.matches(&bare));
    }

    #[test]
    fn rejects_bad_filters() {
        assert!(matches!(
            "status".parse::<Filter>(),
            Err(FilterError::Syntax(_))
        ));
        assert!(matches!(
            "=:x".parse::<Filter>(),
            Err(FilterError::Syntax(_))
        ));
        assert!(matches!(
            "colour:red".parse::<Filter>(),
            Err(FilterError::UnknownField(f)) if f == "colour"
        ));
        assert!(matches!(
            "status:(".parse::<Filter>(),
            Err(FilterError::Regex(_))
        ));
    }
}
