//! Corpus source preparation
//!
//! Vendor hash sets ship as CSV-like listings carrying several digests per
//! row. [`normalize_listing`] pulls the MD5 column out of such a listing and
//! writes the sorted, de-duplicated, uppercase file that [`Corpus::load`]
//! expects.
//!
//! [`Corpus::load`]: crate::Corpus::load

use std::io::{BufRead, Write};

use tracing::{debug, info};

use crate::digest::{BinaryKey, DIGEST_LEN};
use crate::error::{Error, Result};

/// Hex run lengths of other digest algorithms (SHA-1, SHA-256)
const FOREIGN_LENGTHS: [usize; 2] = [40, 64];

/// Extract one digest per line from `reader` and write a loadable corpus to
/// `writer`. Returns the number of digests written.
pub fn normalize_listing<R: BufRead, W: Write>(reader: R, mut writer: W) -> Result<usize> {
    let mut keys = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        match first_digest(&line) {
            Some(Ok(key)) => keys.push(key),
            Some(Err(len)) => {
                return Err(Error::CorruptSource {
                    line: index + 1,
                    content: format!("{}-digit hash found, expected {}", len, DIGEST_LEN),
                });
            }
            None => skipped += 1,
        }
    }

    if keys.is_empty() {
        return Err(Error::CorruptSource {
            line: 0,
            content: "no hashes found in listing".to_string(),
        });
    }

    let found = keys.len();
    keys.sort_unstable();
    keys.dedup();
    info!(
        found = found,
        unique = keys.len(),
        skipped = skipped,
        "Normalized hash listing"
    );

    for key in &keys {
        writeln!(writer, "{}", key)?;
    }
    writer.flush()?;

    debug!(written = keys.len(), "Corpus file written");
    Ok(keys.len())
}

/// Scan `line` for the first maximal run of hex digits that is a digest.
///
/// `Some(Err(len))` means the line has no digest but does carry a run of
/// another algorithm's length.
fn first_digest(line: &str) -> Option<std::result::Result<BinaryKey, usize>> {
    let bytes = line.as_bytes();
    let mut start = 0;
    let mut foreign = None;

    while start < bytes.len() {
        if !bytes[start].is_ascii_hexdigit() {
            start += 1;
            continue;
        }

        let len = bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_hexdigit())
            .count();

        if len == DIGEST_LEN {
            if let Ok(key) = BinaryKey::encode(&line[start..start + len]) {
                return Some(Ok(key));
            }
        } else if foreign.is_none() && FOREIGN_LENGTHS.contains(&len) {
            foreign = Some(len);
        }
        start += len;
    }

    foreign.map(Err)
}
