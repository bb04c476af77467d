//! Streaming content hasher for e2build ids.
//!
//! Every identifier in e2build (sourceid, buildid, chroot group id, …) is a
//! 40-character lowercase hex string produced by feeding a canonical byte
//! stream into this hasher. `append` never inserts delimiters; callers that
//! hash structured data encode their own.
//!
//! # Example
//!
//! ```
//! use e2build_hash::Hasher;
//!
//! let mut h = Hasher::new();
//! h.append("var=val4");
//! assert_eq!(h.finish(), "404aa226cf94a483fd61878682f8e2759998b197");
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

/// The length of every id produced by [`Hasher::finish`].
pub const ID_LEN: usize = 40;

/// Incremental hasher: `new → append* → finish`.
///
/// There are no error paths; `append` accepts anything byte-like.
#[derive(Debug, Default, Clone)]
pub struct Hasher {
    inner: Sha1,
}

impl Hasher {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    /// Feed raw bytes. No delimiter is added between calls.
    pub fn append(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data.as_ref());
    }

    /// Finish the stream and return the lowercase hex digest.
    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hash a single byte slice in one call.
pub fn hash_bytes(data: impl AsRef<[u8]>) -> String {
    let mut h = Hasher::new();
    h.append(data);
    h.finish()
}

/// Hash the contents of a file, streaming.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.append(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// True if `s` has the shape of an id: exactly 40 lowercase hex characters.
pub fn is_hex_id(s: &str) -> bool {
    s.len() == ID_LEN
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
