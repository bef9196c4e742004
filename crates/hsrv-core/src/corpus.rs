//! Hash Corpus - the sorted, de-duplicated set of known digests
//!
//! The corpus is built once at startup and never mutated afterwards, so it
//! can be shared behind an `Arc` by every connection without locking.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::digest::{self, BinaryKey, DIGEST_LEN};
use crate::error::{Error, Result};

/// Progress is reported every this many digests during a build
const PROGRESS_INTERVAL: usize = 1_000_000;

/// Bytes per corpus file line: one digest plus the newline
const BYTES_PER_LINE: u64 = DIGEST_LEN as u64 + 1;

/// Immutable, strictly ascending set of binary keys
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    keys: Vec<BinaryKey>,
}

impl Corpus {
    /// Build a corpus from source lines, failing on the first bad line
    /// or on any duplicate.
    pub fn build<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = lines.into_iter();
        let mut builder = CorpusBuilder::with_capacity(lines.size_hint().0)?;
        for line in lines {
            builder.push_line(line.as_ref())?;
        }
        builder.finish()
    }

    /// Load a corpus file (one digest per line, blank lines ignored)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let expected = file.metadata()?.len() / BYTES_PER_LINE;
        info!(path = %path.display(), expected = expected, "Loading hash corpus");

        let mut builder = CorpusBuilder::with_capacity(expected as usize)?;
        let mut reader = BufReader::new(file);
        let mut raw = Vec::with_capacity(BYTES_PER_LINE as usize + 1);
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            builder.push_bytes(&raw)?;
        }
        builder.finish()
    }

    /// Binary search for `key`
    pub fn contains(&self, key: &BinaryKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }

    /// Validate and look up a hex digest
    pub fn contains_digest(&self, digest: &str) -> Result<bool> {
        let key = BinaryKey::encode(digest)?;
        Ok(self.contains(&key))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BinaryKey> {
        self.keys.iter()
    }
}

/// Incremental corpus construction
///
/// Keys are appended as lines arrive and sorted once in [`finish`].
///
/// [`finish`]: CorpusBuilder::finish
pub struct CorpusBuilder {
    keys: Vec<BinaryKey>,
    line_number: usize,
}

impl CorpusBuilder {
    /// Reserve room for `capacity` keys up front
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut keys = Vec::new();
        keys.try_reserve_exact(capacity).map_err(|e| {
            error!(capacity = capacity, error = %e, "Couldn't reserve memory for hash corpus");
            Error::AllocationFailure(format!("reserving {} keys: {}", capacity, e))
        })?;

        Ok(Self {
            keys,
            line_number: 0,
        })
    }

    /// Append one raw source line; bytes that aren't text are corruption
    pub fn push_bytes(&mut self, raw: &[u8]) -> Result<()> {
        match std::str::from_utf8(raw) {
            Ok(line) => self.push_line(line),
            Err(_) => {
                self.line_number += 1;
                Err(self.corrupt(&String::from_utf8_lossy(raw)))
            }
        }
    }

    /// Validate and append one source line
    pub fn push_line(&mut self, line: &str) -> Result<()> {
        self.line_number += 1;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(());
        }

        if !digest::is_well_formed(line) {
            return Err(self.corrupt(line));
        }
        let key = BinaryKey::encode(line)?;

        if self.keys.len() == self.keys.capacity() {
            self.keys.try_reserve(1).map_err(|e| {
                error!(loaded = self.keys.len(), error = %e, "Couldn't grow hash corpus");
                Error::AllocationFailure(format!("growing past {} keys: {}", self.keys.len(), e))
            })?;
        }
        self.keys.push(key);

        if self.keys.len() % PROGRESS_INTERVAL == 0 {
            info!("Loaded {} million hashes", self.keys.len() / PROGRESS_INTERVAL);
        }

        Ok(())
    }

    fn corrupt(&self, content: &str) -> Error {
        let content = content.trim_end_matches(['\r', '\n']);
        error!(
            line = self.line_number,
            content = %content.to_uppercase(),
            "Hash source appears corrupt, loading no hashes"
        );
        Error::CorruptSource {
            line: self.line_number,
            content: content.to_string(),
        }
    }

    /// Sort, reject duplicates and seal the corpus
    pub fn finish(mut self) -> Result<Corpus> {
        info!(count = self.keys.len(), "Read hashes, sorting");
        self.keys.sort_unstable();

        debug!("Ensuring no duplicates");
        if let Some(pair) = self.keys.windows(2).find(|pair| pair[0] == pair[1]) {
            let duplicate = pair[0].decode();
            error!(digest = %duplicate, "Hash source contains duplicates");
            return Err(Error::DuplicateEntry(duplicate));
        }

        if self.keys.is_empty() {
            warn!("Hash corpus is empty, every query will miss");
        }
        self.keys.shrink_to_fit();

        Ok(Corpus { keys: self.keys })
    }
}
