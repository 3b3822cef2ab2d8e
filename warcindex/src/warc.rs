//! Reading WARC records and locating them in their file.
//!
//! A WARC file is a concatenation of records, each a version line, header
//! fields, a blank line, `Content-Length` bytes of block and a CRLF CRLF
//! tail. Compressed files hold one gzip member per record, so a record can be
//! read alone given its offset; [`RecordReader`] reports that offset and the
//! record's length in the file for every record it reads.

use std::io::{self, BufRead, Read};
use std::path::Path;
use std::str;

use flate2::bufread::GzDecoder;
use indexmap::IndexMap;
use thiserror::Error;

use crate::digest::{BlockDigester, BlockSummary};

/// Bytes of each block kept for parsing an HTTP message head.
pub const HEAD_LIMIT: usize = 16 << 10;

const BUFFER_SIZE: usize = 8 << 10;

/// Fields whose values are URIs, which WARC 1.0 wraps in angle brackets.
const BARE_URI_FIELDS: &[&str] = &[
    "warc-record-id",
    "warc-target-uri",
    "warc-refers-to",
    "warc-refers-to-target-uri",
];

/// WARC EBNF "separators" class
const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";

/// Reasons it may be impossible to parse a WARC header.
#[derive(Debug, Error)]
pub enum HeaderParseError {
    /// The WARC/m.n signature marking the start of a record is not present or invalid.
    #[error("WARC signature missing or invalid (near {0:?})")]
    InvalidSignature(String),
    #[error("header field is malformed")]
    MalformedField,
    #[error("I/O error")]
    Io(#[from] io::Error),
    /// The input ended before the end of the header.
    #[error("input ended before end of header")]
    Truncated,
}

/// An error in reading a record from an input stream.
#[derive(Debug, Error)]
pub enum InvalidRecord {
    /// The header of the record was malformed.
    ///
    /// This may mean the input doesn't actually contain WARC records.
    #[error("record header is not valid")]
    InvalidHeader(#[source] HeaderParseError),
    #[error("Content-Length is missing or not an integer (found {0:?})")]
    UnknownLength(Option<String>),
    #[error("input ended inside a record")]
    Truncated,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl From<HeaderParseError> for InvalidRecord {
    fn from(e: HeaderParseError) -> Self {
        match e {
            HeaderParseError::Io(e) => InvalidRecord::Io(e),
            HeaderParseError::Truncated => InvalidRecord::Truncated,
            e => InvalidRecord::InvalidHeader(e),
        }
    }
}

/// How the records of a file are compressed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Compression {
    None,
    /// One gzip member per record.
    Gzip,
}

impl Compression {
    /// Guess the compression of a file from its name alone.
    ///
    /// ```
    /// # use warcindex::warc::Compression;
    /// assert_eq!(Compression::guess_for_filename("crawl.warc.gz"), Compression::Gzip);
    /// assert_eq!(Compression::guess_for_filename("crawl.warc"), Compression::None);
    /// ```
    pub fn guess_for_filename<P: AsRef<Path>>(path: P) -> Compression {
        match path.as_ref().extension() {
            Some(ext) if ext == "gz" => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// The header of a WARC record.
///
/// Field names are case-insensitive; values are raw bytes. Fields keep the
/// order they were read in.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    version: (u32, u32),
    fields: IndexMap<String, Vec<u8>>,
}

impl Header {
    /// Parse a header from bytes, returning the header and the number of bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Header, usize), HeaderParseError> {
        let (version, mut consumed) = parse_version(bytes)?;

        let mut fields = IndexMap::new();
        loop {
            match bytes.get(consumed..consumed + 2) {
                Some(b"\r\n") => break,
                Some(_) => {}
                None => return Err(HeaderParseError::Truncated),
            }
            let (name, value, n) = parse_field(&bytes[consumed..])?;
            fields.insert(name, value);
            consumed += n;
        }

        Ok((Header { version, fields }, consumed + 2))
    }

    pub fn version(&self) -> (u32, u32) {
        self.version
    }

    /// Raw value of a field.
    pub fn get_field_bytes(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    /// Value of a field, if present and valid UTF-8.
    ///
    /// Angle brackets around URI-valued fields are removed, whatever the record
    /// version.
    pub fn get_field(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        let value = str::from_utf8(self.fields.get(&name)?).ok()?;
        if BARE_URI_FIELDS.contains(&name.as_str()) {
            if let Some(inner) = value.strip_prefix('<').and_then(|v| v.strip_suffix('>')) {
                return Some(inner);
            }
        }
        Some(value)
    }

    pub fn set_field<V: Into<Vec<u8>>>(&mut self, name: &str, value: V) -> Option<Vec<u8>> {
        self.fields.insert(name.to_ascii_lowercase(), value.into())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get_field("content-length")?.trim().parse().ok()
    }

    pub fn warc_type(&self) -> Option<&str> {
        self.get_field("warc-type")
    }

    pub fn record_id(&self) -> Option<&str> {
        self.get_field("warc-record-id")
    }
}

/// Parse the `WARC/m.n` line, returning the version and its length.
fn parse_version(bytes: &[u8]) -> Result<((u32, u32), usize), HeaderParseError> {
    const SIGNATURE: &[u8] = b"WARC/";
    const MAX_LINE: usize = 32;

    let line_end = match bytes.windows(2).position(|w| w == b"\r\n") {
        Some(i) => i,
        None if bytes.len() < MAX_LINE && SIGNATURE.starts_with(&bytes[..bytes.len().min(5)]) => {
            return Err(HeaderParseError::Truncated)
        }
        None => return Err(invalid_signature(bytes)),
    };
    let line = &bytes[..line_end];

    let version = line
        .strip_prefix(SIGNATURE)
        .and_then(|v| str::from_utf8(v).ok())
        .and_then(|v| v.split_once('.'))
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)));
    match version {
        Some(version) => Ok((version, line_end + 2)),
        None => Err(invalid_signature(line)),
    }
}

fn invalid_signature(bytes: &[u8]) -> HeaderParseError {
    let near = &bytes[..bytes.len().min(16)];
    HeaderParseError::InvalidSignature(String::from_utf8_lossy(near).into_owned())
}

/// Parse one field, which may continue over folded lines, returning its
/// lowercased name, value and the number of bytes it occupies.
fn parse_field(bytes: &[u8]) -> Result<(String, Vec<u8>, usize), HeaderParseError> {
    // field-name: at least one token, which is an ASCII value excluding CTL or SEPARATORS
    let name_end = bytes
        .iter()
        .position(|&b| !b.is_ascii() || b.is_ascii_control() || SEPARATORS.contains(&b))
        .ok_or(HeaderParseError::Truncated)?;
    if name_end == 0 {
        return Err(HeaderParseError::MalformedField);
    }
    match bytes.get(name_end) {
        Some(b':') => {}
        Some(_) => return Err(HeaderParseError::MalformedField),
        None => return Err(HeaderParseError::Truncated),
    }

    let mut value = Vec::new();
    let mut start = name_end + 1;
    let consumed = loop {
        start += bytes[start..]
            .iter()
            .position(|&b| b != b' ' && b != b'\t')
            .ok_or(HeaderParseError::Truncated)?;
        let end = start
            + bytes[start..]
                .windows(2)
                .position(|w| w == b"\r\n")
                .ok_or(HeaderParseError::Truncated)?;
        if !value.is_empty() {
            value.push(b' ');
        }
        value.extend_from_slice(trim_end(&bytes[start..end]));

        match bytes.get(end + 2) {
            // Folded line
            Some(b' ') | Some(b'\t') => start = end + 2,
            Some(_) => break end + 2,
            None => return Err(HeaderParseError::Truncated),
        }
    };

    // Names were checked to be ASCII above.
    let name = String::from_utf8_lossy(&bytes[..name_end]).to_ascii_lowercase();
    Ok((name, value, consumed))
}

fn trim_end(mut bytes: &[u8]) -> &[u8] {
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Parse a record header out of a `BufRead`, leaving it at the start of the block.
///
/// Most headers fit in the reader's buffer and are parsed in place; longer
/// ones are copied out and reparsed as more input arrives.
fn read_header<R: BufRead>(reader: &mut R) -> Result<Header, HeaderParseError> {
    let mut owned: Vec<u8> = {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Err(HeaderParseError::Truncated);
        }
        match Header::parse(buf) {
            Ok((header, n)) => {
                reader.consume(n);
                return Ok(header);
            }
            Err(HeaderParseError::Truncated) => buf.to_vec(),
            Err(e) => return Err(e),
        }
    };
    reader.consume(owned.len());
    trace!("Header exceeds buffer; copying {} bytes", owned.len());

    loop {
        let searched = owned.len();
        owned.extend_from_slice(reader.fill_buf()?);
        if owned.len() == searched {
            return Err(HeaderParseError::Truncated);
        }
        match Header::parse(&owned) {
            Ok((header, n)) => {
                reader.consume(n - searched);
                return Ok(header);
            }
            Err(HeaderParseError::Truncated) => reader.consume(owned.len() - searched),
            Err(e) => return Err(e),
        }
    }
}

/// Tracks how many bytes have been consumed from a reader.
struct Counting<R> {
    inner: R,
    position: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for Counting<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.position += amt as u64;
    }
}

/// A record that has been read in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarcRecord {
    pub header: Header,
    /// Where the record (its gzip member, if compressed) starts in the input.
    pub offset: u64,
    /// Bytes the record occupies in the input.
    pub length: u64,
    pub block: BlockSummary,
}

struct Body {
    header: Header,
    block: BlockSummary,
}

/// Reads records one after another, noting where each one lies in the input.
pub struct RecordReader<R> {
    input: Counting<R>,
    compression: Compression,
    failed: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(input: R, compression: Compression) -> Self {
        RecordReader {
            input: Counting { inner: input, position: 0 },
            compression,
            failed: false,
        }
    }

    /// Bytes of input consumed so far.
    pub fn position(&self) -> u64 {
        self.input.position
    }

    /// Read the next record, or `None` at the end of the input.
    pub fn read_record(&mut self) -> Result<Option<WarcRecord>, InvalidRecord> {
        let offset = self.input.position;
        if self.input.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let body = match self.compression {
            Compression::None => read_body(&mut self.input)?,
            Compression::Gzip => {
                let mut member =
                    io::BufReader::with_capacity(BUFFER_SIZE, GzDecoder::new(&mut self.input));
                let body = read_body(&mut member)?;
                // Run the decoder to the end of the member so its trailer is consumed.
                let extra = io::copy(&mut member, &mut io::sink())?;
                if extra > 0 {
                    debug!("{} unexpected bytes after record at {}", extra, offset);
                }
                body
            }
        };

        Ok(Some(WarcRecord {
            header: body.header,
            offset,
            length: self.input.position - offset,
            block: body.block,
        }))
    }
}

/// Records in input order; iteration ends after the first error.
impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<WarcRecord, InvalidRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.read_record().transpose();
        if let Some(Err(_)) = result {
            self.failed = true;
        }
        result
    }
}

fn read_body<R: BufRead>(input: &mut R) -> Result<Body, InvalidRecord> {
    let header = read_header(input)?;
    let length = header.content_length().ok_or_else(|| {
        InvalidRecord::UnknownLength(header.get_field("content-length").map(str::to_owned))
    })?;

    // Digest the block straight out of the input's buffer.
    let mut digester = BlockDigester::new(HEAD_LIMIT);
    let mut remaining = length;
    while remaining > 0 {
        let n = {
            let buf = input.fill_buf()?;
            if buf.is_empty() {
                return Err(InvalidRecord::Truncated);
            }
            let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            digester.handle_data(&buf[..n]);
            n
        };
        input.consume(n);
        remaining -= n as u64;
    }

    if !(skip_crlf(input)? && skip_crlf(input)?) {
        warn!(
            "Record {} is missing its CRLF CRLF tail",
            header.record_id().unwrap_or("<missing>")
        );
    }
    Ok(Body {
        header,
        block: digester.finalize(),
    })
}

/// Consume a CRLF if one is next, byte by byte so nothing else is lost.
fn skip_crlf<R: BufRead>(input: &mut R) -> io::Result<bool> {
    for expected in b"\r\n" {
        if input.fill_buf()?.first() != Some(expected) {
            return Ok(false);
        }
        input.consume(1);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn record(id: &str, block: &str) -> Vec<u8> {
        format!(
            "WARC/1.0\r\n\
             WARC-Type: resource\r\n\
             WARC-Record-ID: <{}>\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}\r\n\r\n",
            id,
            block.len(),
            block
        )
        .into_bytes()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn parses_header() {
        let raw = b"WARC/1.1\r\n\
                    Warc-Type: testdata\r\n\
                    Content-Length: 6\r\n\
                    X-Multiline-Test:lol \r\n  multiline headers\r\n\
                    \r\n\
                    block";
        let (header, n) = Header::parse(raw).unwrap();

        assert_eq!(n, raw.len() - 5);
        assert_eq!(header.version(), (1, 1));
        assert_eq!(header.warc_type(), Some("testdata"));
        assert_eq!(header.content_length(), Some(6));
        assert_eq!(
            header.get_field("x-multiline-test"),
            Some("lol multiline headers")
        );
        assert_eq!(header.get_field("missing"), None);
    }

    #[test]
    fn header_errors() {
        assert!(matches!(
            Header::parse(b"WARC/1.0\r\nContent-Le"),
            Err(HeaderParseError::Truncated)
        ));
        assert!(matches!(Header::parse(b"WA"), Err(HeaderParseError::Truncated)));
        assert!(matches!(
            Header::parse(b"HTTP/1.1 200 OK\r\n\r\n"),
            Err(HeaderParseError::InvalidSignature(_))
        ));
        assert!(matches!(
            Header::parse(b"WARC/1.0\r\nBad Field: x\r\n\r\n"),
            Err(HeaderParseError::MalformedField)
        ));
    }

    #[test]
    fn strips_uri_brackets() {
        let mut header = Header::parse(b"WARC/1.0\r\n\r\n").unwrap().0;
        header.set_field("WARC-Record-ID", "<urn:uuid:1>");
        header.set_field("X-Other", "<kept>");
        assert_eq!(header.record_id(), Some("urn:uuid:1"));
        assert_eq!(header.get_field("x-other"), Some("<kept>"));
        assert_eq!(header.get_field_bytes("warc-record-id"), Some(&b"<urn:uuid:1>"[..]));
    }

    #[test]
    fn reads_header_across_buffers() {
        let long_value = "v".repeat(100);
        let mut data = format!("WARC/1.0\r\nX-Long: {}\r\n", long_value).into_bytes();
        data.extend_from_slice(b"Content-Length: 0\r\n\r\n\r\n\r\n");
        let mut reader = io::BufReader::with_capacity(16, &data[..]);

        let header = read_header(&mut reader).unwrap();
        assert_eq!(header.get_field("x-long"), Some(long_value.as_str()));
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"\r\n\r\n");
    }

    #[test]
    fn locates_plain_records() {
        let first = record("urn:uuid:1", "hello");
        let second = record("urn:uuid:2", "world!");
        let input = [first.clone(), second.clone()].concat();

        let records: Vec<_> = RecordReader::new(&input[..], Compression::None)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].offset, records[0].length), (0, first.len() as u64));
        assert_eq!(
            (records[1].offset, records[1].length),
            (first.len() as u64, second.len() as u64)
        );
        assert_eq!(records[1].block.head, b"world!");
        assert_eq!(records[1].header.record_id(), Some("urn:uuid:2"));
    }

    #[test]
    fn locates_gzip_members() {
        let first = gzip(&record("urn:uuid:1", "hello"));
        let second = gzip(&record("urn:uuid:2", "compressed"));
        let input = [first.clone(), second.clone()].concat();

        let mut reader = RecordReader::new(&input[..], Compression::Gzip);
        let a = reader.read_record().unwrap().unwrap();
        let b = reader.read_record().unwrap().unwrap();
        assert!(reader.read_record().unwrap().is_none());

        assert_eq!((a.offset, a.length), (0, first.len() as u64));
        assert_eq!((b.offset, b.length), (first.len() as u64, second.len() as u64));
        assert_eq!(b.block.length, 10);
    }

    #[test]
    fn tolerates_missing_tail() {
        let mut input = record("urn:uuid:1", "abc");
        input.truncate(input.len() - 4);
        input.extend(record("urn:uuid:2", "def"));

        let ids: Vec<_> = RecordReader::new(&input[..], Compression::None)
            .map(|r| r.unwrap().header.record_id().map(str::to_owned))
            .collect();
        assert_eq!(ids, [Some("urn:uuid:1".into()), Some("urn:uuid:2".into())]);
    }

    #[test]
    fn stops_on_truncated_block() {
        let mut input = record("urn:uuid:1", "abcdef");
        input.truncate(input.len() - 6);

        let mut reader = RecordReader::new(&input[..], Compression::None);
        assert!(matches!(reader.next(), Some(Err(InvalidRecord::Truncated))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn rejects_unknown_length() {
        let input = b"WARC/1.0\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(
            RecordReader::new(&input[..], Compression::None).read_record(),
            Err(InvalidRecord::UnknownLength(Some(s))) if s == "lots"
        ));
    }
}
