use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

use cdx::batch::BatchOptions;
use cdx::{CdxIndex, IndexOptions, Namespace, RecordType, SearchRequest, StoreOptions};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use warcindex::{FileOutcome, IndexError, IndexStats, Indexer};

fn record(fields: &[(&str, &str)], block: &str) -> Vec<u8> {
    let mut out = String::from("WARC/1.0\r\n");
    for (name, value) in fields {
        out += &format!("{}: {}\r\n", name, value);
    }
    out += &format!("Content-Length: {}\r\n\r\n{}\r\n\r\n", block.len(), block);
    out.into_bytes()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn response(id: &str, uri: &str, date: &str, body: &str) -> Vec<u8> {
    let block = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    record(
        &[
            ("WARC-Type", "response"),
            ("WARC-Target-URI", uri),
            ("WARC-Date", date),
            ("WARC-Record-ID", id),
            ("Content-Type", "application/http;msgtype=response"),
        ],
        &block,
    )
}

fn crawl() -> Vec<Vec<u8>> {
    vec![
        record(
            &[
                ("WARC-Type", "warcinfo"),
                ("WARC-Date", "2020-03-01T12:00:00Z"),
                ("WARC-Record-ID", "<urn:uuid:info>"),
            ],
            "software: test\r\n",
        ),
        record(
            &[
                ("WARC-Type", "request"),
                ("WARC-Target-URI", "http://example.com/"),
                ("WARC-Date", "2020-03-01T12:00:00Z"),
                ("WARC-Record-ID", "<urn:uuid:req>"),
            ],
            "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        ),
        response(
            "<urn:uuid:orig>",
            "http://example.com/",
            "2020-03-01T12:00:01Z",
            "<html>hello</html>",
        ),
        record(
            &[
                ("WARC-Type", "revisit"),
                ("WARC-Target-URI", "http://example.com/"),
                ("WARC-Date", "2020-04-01T12:00:00Z"),
                ("WARC-Record-ID", "<urn:uuid:rev>"),
                ("WARC-Refers-To", "<urn:uuid:orig>"),
                (
                    "WARC-Profile",
                    "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest",
                ),
            ],
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n",
        ),
    ]
}

fn open(dir: &TempDir) -> CdxIndex {
    CdxIndex::open(IndexOptions {
        store: StoreOptions {
            path: dir.path().join("index"),
            ..Default::default()
        },
        batch: BatchOptions {
            max_size: 2,
            max_wait: Duration::from_secs(3600),
        },
        ..Default::default()
    })
    .unwrap()
}

fn write_gz(path: &Path, records: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let members: Vec<_> = records.iter().map(|r| gzip(r)).collect();
    fs::write(path, members.concat()).unwrap();
    members
}

/// Read back the record a storage reference points at.
fn fetch(dir: &Path, storage_ref: &str) -> String {
    let mut parts = storage_ref.rsplitn(3, ':');
    let length: u64 = parts.next().unwrap().parse().unwrap();
    let offset: u64 = parts.next().unwrap().parse().unwrap();
    let name = parts.next().unwrap();

    let mut file = fs::File::open(dir.join(name)).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut member = Vec::new();
    file.take(length).read_to_end(&mut member).unwrap();
    let mut text = String::new();
    GzDecoder::new(&member[..]).read_to_string(&mut text).unwrap();
    text
}

#[test]
fn indexes_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let warc = dir.path().join("crawl.warc.gz");
    let members = write_gz(&warc, &crawl());
    let index = open(&dir);
    let indexer = Indexer::new(&index);

    let expected = IndexStats {
        records: 4,
        indexed: 2,
        skipped: 2,
        invalid: 0,
    };
    assert_eq!(indexer.index_file(&warc).unwrap(), FileOutcome::Indexed(expected));
    assert_eq!(indexer.index_file(&warc).unwrap(), FileOutcome::Unchanged);

    let info = index.resolve_filename("crawl.warc.gz").unwrap().unwrap();
    assert_eq!(info.size, fs::metadata(&warc).unwrap().len());

    let captures: Vec<_> = index
        .search(&SearchRequest::new("http://example.com/"))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(captures.len(), 2);
    let (original, revisit) = (&captures[0], &captures[1]);
    assert_eq!(original.record_type, RecordType::Response);
    assert_eq!(original.status, Some(200));
    assert_eq!(original.mime.as_deref(), Some("text/html"));
    assert_eq!(original.payload_length, 18);
    assert_eq!(revisit.record_type, RecordType::Revisit);

    let offset: usize = members[..2].iter().map(Vec::len).sum();
    assert_eq!(
        original.storage_ref,
        format!("crawl.warc.gz:{}:{}", offset, members[2].len())
    );
    assert!(fetch(dir.path(), &original.storage_ref).contains("<html>hello</html>"));

    assert_eq!(
        index.resolve_id("urn:uuid:orig").unwrap(),
        Some(original.storage_ref.clone())
    );
    let target = index.resolve_revisit(revisit).unwrap();
    assert_eq!(target.record_id, "urn:uuid:orig");
    assert_eq!(target.storage_ref, original.storage_ref);
}

#[test]
fn reindexes_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    let warc = dir.path().join("crawl.warc");
    fs::write(&warc, crawl().concat()).unwrap();
    let index = open(&dir);
    let indexer = Indexer::new(&index);

    assert!(matches!(indexer.index_file(&warc).unwrap(), FileOutcome::Indexed(_)));

    let mut file = OpenOptions::new().append(true).open(&warc).unwrap();
    file.write_all(&response(
        "<urn:uuid:later>",
        "http://example.com/other",
        "2020-05-01T00:00:00Z",
        "later",
    ))
    .unwrap();
    drop(file);

    match indexer.index_file(&warc).unwrap() {
        FileOutcome::Indexed(stats) => assert_eq!(stats.indexed, 3),
        other => panic!("expected a reindex, got {:?}", other),
    }
    // Reindexing rewrites the same keys.
    assert_eq!(index.count(Namespace::Cdx).unwrap(), 3);
    assert_eq!(index.count(Namespace::Id).unwrap(), 3);
}

#[test]
fn malformed_file_is_not_marked_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let warc = dir.path().join("broken.warc");
    let mut data = crawl().concat();
    data.extend_from_slice(b"this is not a WARC record\r\n\r\n");
    fs::write(&warc, data).unwrap();
    let index = open(&dir);

    let err = Indexer::new(&index).index_file(&warc).unwrap_err();
    match err {
        IndexError::Record { name, offset, .. } => {
            assert_eq!(name, "broken.warc");
            assert_eq!(offset, crawl().concat().len() as u64);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(index.resolve_filename("broken.warc").unwrap(), None);
}

#[test]
fn dropped_capture_in_full_queue_leaves_file_unmarked() {
    let dir = tempfile::tempdir().unwrap();
    let warc = dir.path().join("long-id.warc");
    let id = format!("<urn:uuid:{}>", "0123456789".repeat(7));
    fs::write(
        &warc,
        response(&id, "http://example.com/", "2020-03-01T12:00:01Z", "hello"),
    )
    .unwrap();
    let index = CdxIndex::open(IndexOptions {
        store: StoreOptions {
            path: dir.path().join("index"),
            max_key_size: Some(64),
            ..Default::default()
        },
        batch: BatchOptions {
            max_size: 1,
            max_wait: Duration::from_secs(3600),
        },
        ..Default::default()
    })
    .unwrap();

    // The queue fills on the only capture, so it is dropped before the final flush.
    let outcome = Indexer::new(&index).index_file(&warc).unwrap();
    assert!(
        matches!(outcome, FileOutcome::Incomplete(stats) if stats.indexed == 1),
        "unexpected outcome {:?}",
        outcome
    );
    assert_eq!(index.count(Namespace::Cdx).unwrap(), 0);
    assert_eq!(index.resolve_filename("long-id.warc").unwrap(), None);
    assert_eq!(index.flush_totals().dropped, 1);
}
