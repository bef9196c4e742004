//! hsrv Core - Digest Codec and Hash Corpus
//!
//! This crate provides the data side of hsrv:
//! - Conversion between hex digests and compact binary keys
//! - The immutable, sorted corpus of known digests
//! - Tooling to turn raw hash listings into loadable corpus files

pub mod corpus;
pub mod digest;
pub mod error;
pub mod source;

pub use corpus::{Corpus, CorpusBuilder};
pub use digest::{BinaryKey, ALGORITHM, DIGEST_LEN};
pub use error::{Error, Result};
pub use source::normalize_listing;
