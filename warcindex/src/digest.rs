use data_encoding::BASE32;
use sha1::{Digest, Sha1};

/// Accumulates a record block: its length, its SHA-1 hash and the first
/// `head_limit` bytes, which hold the HTTP message head of an HTTP capture.
pub struct BlockDigester {
    length: u64,
    hasher: Sha1,
    head: Vec<u8>,
    head_limit: usize,
}

/// What was learned about a record block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub length: u64,
    pub head: Vec<u8>,
    pub sha1: [u8; 20],
}

impl BlockDigester {
    pub fn new(head_limit: usize) -> Self {
        BlockDigester {
            length: 0,
            hasher: Sha1::new(),
            head: Vec::new(),
            head_limit,
        }
    }

    pub fn handle_data(&mut self, data: &[u8]) {
        let room = self.head_limit.saturating_sub(self.head.len());
        self.head.extend_from_slice(&data[..room.min(data.len())]);
        self.length += data.len() as u64;
        self.hasher.update(data);
    }

    pub fn finalize(self) -> BlockSummary {
        let mut sha1 = [0u8; 20];
        sha1.copy_from_slice(self.hasher.finalize().as_slice());
        BlockSummary {
            length: self.length,
            head: self.head,
            sha1,
        }
    }
}

/// Format a SHA-1 hash as a WARC `labelled-digest`, base32-encoded (RFC 4648)
/// as suggested by sections 5.8 and 5.9 of WARC 1.1.
pub fn format_digest(sha1: &[u8; 20]) -> String {
    let mut out = String::with_capacity(5 + BASE32.encode_len(sha1.len()));
    out += "sha1:";
    BASE32.encode_append(&sha1[..], &mut out);
    out
}
