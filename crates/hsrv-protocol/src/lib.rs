//! hsrv line protocol
//!
//! A text protocol with case-insensitive keywords, one command per line.
//!
//! ## Session Format
//! ```text
//! VERSION: 2.0            -> OK | NOT OK
//! QUERY <digest> ...      -> OK <bitstring>
//! STATUS                  -> OK <count> md5 hashes, load <l1> <l2> <l3> | NOT SUPPORTED
//! UPSHIFT                 -> NOT OK
//! DOWNSHIFT               -> OK
//! BYE                     -> (connection closes)
//! ```
//!
//! Generation 1 answers a single command after the version line; generation
//! 2 keeps reading commands until `BYE`.

pub mod command;
pub mod error;
pub mod parser;
pub mod response;

pub use command::{Command, CommandKind, Generation, ProtocolVersion};
pub use error::{ProtocolError, ProtocolResult};
pub use parser::{parse_line, tokenize, LineBuffer};
pub use response::Response;
