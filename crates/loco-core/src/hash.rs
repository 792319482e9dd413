use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const HASH_CHUNK_BYTES: usize = 8192;

/// Hex-encoded SHA-256 of a file's raw bytes; the identity key of an ingested log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn compute_hash(path: impl AsRef<Path>) -> io::Result<ContentDigest> {
    let file = File::open(path)?;
    hash_reader(file)
}

pub fn hash_reader<R: Read>(reader: R) -> io::Result<ContentDigest> {
    let mut hasher = Sha256::new();
    for_each_chunk(reader, |chunk| hasher.update(chunk))?;
    Ok(ContentDigest(hex_lower(&hasher.finalize())))
}

/// Reads `reader` to the end and hashes the same bytes in one pass, so the
/// digest always describes exactly the returned buffer.
pub fn read_hashed<R: Read>(reader: R) -> io::Result<(Vec<u8>, ContentDigest)> {
    let mut hasher = Sha256::new();
    let mut bytes = Vec::new();
    for_each_chunk(reader, |chunk| {
        hasher.update(chunk);
        bytes.extend_from_slice(chunk);
    })?;
    Ok((bytes, ContentDigest(hex_lower(&hasher.finalize()))))
}

fn for_each_chunk<R: Read>(mut reader: R, mut visit: impl FnMut(&[u8])) -> io::Result<()> {
    let mut chunk = [0_u8; HASH_CHUNK_BYTES];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        visit(&chunk[..read]);
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

fn hex_lower(digest: &[u8]) -> String {
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
