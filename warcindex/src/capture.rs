//! Turning WARC records into capture records.

use std::str::FromStr;

use cdx::ssurt::SsurtError;
use cdx::{CaptureRecord, RecordType, RevisitLink};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use crate::digest::format_digest;
use crate::warc::WarcRecord;

const MAX_HTTP_HEADERS: usize = 96;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("record has no {0} field")]
    MissingField(&'static str),
    #[error("{field} {value:?} is not a valid date")]
    BadDate { field: &'static str, value: String },
    #[error("target URI cannot be indexed")]
    Url(#[from] SsurtError),
}

/// Describe a record as a capture stored at `filename`, or `None` if records
/// of its type are not indexed.
pub fn capture(record: &WarcRecord, filename: &str) -> Result<Option<CaptureRecord>, CaptureError> {
    let header = &record.header;
    let record_type = match header.warc_type() {
        Some(t) => match RecordType::from_str(t) {
            Ok(t) => t,
            Err(never) => match never {},
        },
        None => return Err(CaptureError::MissingField("WARC-Type")),
    };
    if !record_type.is_indexed() {
        return Ok(None);
    }

    let uri = header
        .get_field("warc-target-uri")
        .ok_or(CaptureError::MissingField("WARC-Target-URI"))?;
    let record_id = header
        .record_id()
        .ok_or(CaptureError::MissingField("WARC-Record-ID"))?;
    let timestamp = date_field(header.get_field("warc-date"), "WARC-Date")?
        .ok_or(CaptureError::MissingField("WARC-Date"))?;

    let http = if is_http(uri) {
        HttpHead::parse(&record.block.head)
    } else {
        None
    };
    let digest = match header.get_field("warc-payload-digest") {
        Some(digest) => digest.to_owned(),
        None => format_digest(&record.block.sha1),
    };
    let revisit = match record_type {
        RecordType::Revisit => revisit_link(record)?,
        _ => None,
    };
    let head_len = http.as_ref().and_then(|h| h.len).unwrap_or(0) as u64;

    Ok(Some(CaptureRecord {
        digest,
        storage_ref: format!("{}:{}:{}", filename, record.offset, record.length),
        status: http.as_ref().and_then(|h| h.status),
        mime: http.and_then(|h| h.mime),
        content_length: record.block.length,
        payload_length: record.block.length.saturating_sub(head_len),
        record_length: record.length,
        revisit,
        ..CaptureRecord::new(uri, record_id, record_type, timestamp)?
    }))
}

fn revisit_link(record: &WarcRecord) -> Result<Option<RevisitLink>, CaptureError> {
    let header = &record.header;
    let link = RevisitLink {
        target_uri: header.get_field("warc-refers-to-target-uri").map(str::to_owned),
        target_date: date_field(
            header.get_field("warc-refers-to-date"),
            "WARC-Refers-To-Date",
        )?,
        target_id: header.get_field("warc-refers-to").map(str::to_owned),
    };
    if link == RevisitLink::default() {
        Ok(None)
    } else {
        Ok(Some(link))
    }
}

fn is_http(uri: &str) -> bool {
    let scheme = uri.split(':').next().unwrap_or_default();
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}

fn date_field(
    value: Option<&str>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, CaptureError> {
    match value {
        None => Ok(None),
        Some(value) => parse_warc_date(value)
            .map(Some)
            .ok_or_else(|| CaptureError::BadDate {
                field,
                value: value.to_owned(),
            }),
    }
}

/// Parse a W3C-DTF date as WARC uses them: RFC 3339, or truncated to minutes.
pub fn parse_warc_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// The parts of an HTTP response head a capture records.
#[derive(Debug, PartialEq, Eq)]
struct HttpHead {
    status: Option<u16>,
    mime: Option<String>,
    /// Length of the head, when it was read to its end.
    len: Option<usize>,
}

impl HttpHead {
    fn parse(block: &[u8]) -> Option<HttpHead> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HTTP_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(block) {
            Ok(httparse::Status::Complete(n)) => Some(n),
            Ok(httparse::Status::Partial) => None,
            Err(e) => {
                debug!("Unparseable HTTP response head: {}", e);
                return None;
            }
        };

        let mime = response
            .headers
            .iter()
            .take_while(|h| !h.name.is_empty())
            .find(|h| h.name.eq_ignore_ascii_case("content-type"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(content_type);
        Some(HttpHead {
            status: response.code,
            mime,
            len,
        })
    }
}

/// The essence (`type/subtype`) of a Content-Type value.
fn content_type(value: &str) -> Option<String> {
    match value.parse::<mime::Mime>() {
        Ok(mime) => Some(mime.essence_str().to_owned()),
        Err(_) => {
            let essence = value.split(';').next().unwrap_or_default().trim();
            if essence.is_empty() {
                None
            } else {
                Some(essence.to_ascii_lowercase())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::BlockDigester;
    use crate::warc::{Compression, RecordReader};
    use pretty_assertions::assert_eq;

    fn read(header: &str, block: &str) -> WarcRecord {
        let raw = format!(
            "WARC/1.0\r\n{}Content-Length: {}\r\n\r\n{}\r\n\r\n",
            header,
            block.len(),
            block
        );
        RecordReader::new(raw.as_bytes(), Compression::None)
            .read_record()
            .unwrap()
            .unwrap()
    }

    const HTTP_BLOCK: &str = "HTTP/1.1 200 OK\r\n\
                              Content-Type: text/html; charset=UTF-8\r\n\
                              \r\n\
                              <html></html>";

    #[test]
    fn response_capture() {
        let record = read(
            "WARC-Type: response\r\n\
             WARC-Target-URI: <http://example.com/>\r\n\
             WARC-Record-ID: <urn:uuid:1>\r\n\
             WARC-Date: 2020-03-01T12:00:00Z\r\n",
            HTTP_BLOCK,
        );
        let capture = capture(&record, "a.warc").unwrap().unwrap();

        let mut digester = BlockDigester::new(0);
        digester.handle_data(HTTP_BLOCK.as_bytes());
        assert_eq!(capture.digest, format_digest(&digester.finalize().sha1));
        assert_eq!(capture.uri, "http://example.com/");
        assert_eq!(capture.record_id, "urn:uuid:1");
        assert_eq!(capture.timestamp14(), "20200301120000");
        assert_eq!(capture.status, Some(200));
        assert_eq!(capture.mime.as_deref(), Some("text/html"));
        assert_eq!(capture.content_length, HTTP_BLOCK.len() as u64);
        assert_eq!(capture.payload_length, 13);
        assert_eq!(
            capture.storage_ref,
            format!("a.warc:0:{}", record.length)
        );
        assert_eq!(capture.revisit, None);
    }

    #[test]
    fn revisit_capture() {
        let record = read(
            "WARC-Type: revisit\r\n\
             WARC-Target-URI: http://example.com/\r\n\
             WARC-Record-ID: <urn:uuid:2>\r\n\
             WARC-Date: 2020-04-01T12:00Z\r\n\
             WARC-Payload-Digest: sha1:AAAA\r\n\
             WARC-Refers-To: <urn:uuid:1>\r\n\
             WARC-Refers-To-Date: 2020-03-01T12:00:00Z\r\n",
            "HTTP/1.1 404 Not Found\r\n\r\n",
        );
        let capture = capture(&record, "a.warc").unwrap().unwrap();

        assert_eq!(capture.record_type, RecordType::Revisit);
        assert_eq!(capture.timestamp14(), "20200401120000");
        assert_eq!(capture.digest, "sha1:AAAA");
        assert_eq!(capture.status, Some(404));
        assert_eq!(capture.mime, None);
        assert_eq!(
            capture.revisit,
            Some(RevisitLink {
                target_uri: None,
                target_date: parse_warc_date("2020-03-01T12:00:00Z"),
                target_id: Some("urn:uuid:1".into()),
            })
        );
    }

    #[test]
    fn skips_other_types() {
        let record = read(
            "WARC-Type: request\r\n\
             WARC-Target-URI: http://example.com/\r\n\
             WARC-Record-ID: <urn:uuid:3>\r\n\
             WARC-Date: 2020-03-01T12:00:00Z\r\n",
            "GET / HTTP/1.1\r\n\r\n",
        );
        assert_eq!(capture(&record, "a.warc").unwrap(), None);
    }

    #[test]
    fn reports_missing_fields() {
        let record = read(
            "WARC-Type: response\r\n\
             WARC-Record-ID: <urn:uuid:4>\r\n\
             WARC-Date: 2020-03-01T12:00:00Z\r\n",
            "",
        );
        assert!(matches!(
            capture(&record, "a.warc"),
            Err(CaptureError::MissingField("WARC-Target-URI"))
        ));

        let record = read(
            "WARC-Type: response\r\n\
             WARC-Target-URI: http://example.com/\r\n\
             WARC-Record-ID: <urn:uuid:4>\r\n\
             WARC-Date: yesterday\r\n",
            "",
        );
        assert!(matches!(
            capture(&record, "a.warc"),
            Err(CaptureError::BadDate { field: "WARC-Date", .. })
        ));
    }

    #[test]
    fn non_http_block_has_no_status() {
        let record = read(
            "WARC-Type: response\r\n\
             WARC-Target-URI: http://example.com/\r\n\
             WARC-Record-ID: <urn:uuid:5>\r\n\
             WARC-Date: 2020-03-01T12:00:00Z\r\n",
            "not http at all",
        );
        let capture = capture(&record, "a.warc").unwrap().unwrap();
        assert_eq!(capture.status, None);
        assert_eq!(capture.payload_length, 15);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type("Text/HTML; charset=utf-8").as_deref(), Some("text/html"));
        assert_eq!(content_type("weird;").as_deref(), Some("weird"));
        assert_eq!(content_type(""), None);
    }
}
