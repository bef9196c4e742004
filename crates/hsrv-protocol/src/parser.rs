//! hsrv line framing and command parser

use bytes::BytesMut;
use hsrv_core::BinaryKey;

use crate::command::{Command, ProtocolVersion};
use crate::error::{ProtocolError, ProtocolResult};

/// Maximum bytes held without a complete line
pub const MAX_PENDING_BYTES: usize = 65535;

const VERSION_KEYWORD: &str = "VERSION:";

/// Accumulates raw bytes and hands out complete lines
pub struct LineBuffer {
    buffer: BytesMut,
    max_pending: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING_BYTES)
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_pending,
        }
    }

    /// Add data to the buffer
    pub fn feed(&mut self, data: &[u8]) -> ProtocolResult<()> {
        if self.buffer.len() + data.len() > self.max_pending {
            return Err(ProtocolError::LineTooLong {
                size: self.buffer.len() + data.len(),
                max: self.max_pending,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Take the next complete line, without its `\n` or trailing `\r`
    pub fn next_line(&mut self) -> Option<String> {
        let line_end = self.buffer.iter().position(|&b| b == b'\n')?;

        let line_len = if line_end > 0 && self.buffer[line_end - 1] == b'\r' {
            line_end - 1
        } else {
            line_end
        };

        let line = String::from_utf8_lossy(&self.buffer[..line_len]).into_owned();
        let _ = self.buffer.split_to(line_end + 1);

        Some(line)
    }

    /// Bytes received but not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Split on runs of whitespace and uppercase every token
pub fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(|t| t.to_uppercase()).collect()
}

/// Parse one line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> ProtocolResult<Option<Command>> {
    let tokens = tokenize(line);
    let Some((keyword, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let command = match keyword.as_str() {
        VERSION_KEYWORD => parse_version(args)?,
        "QUERY" => parse_query(args)?,
        "BYE" => Command::Bye,
        "STATUS" => Command::Status,
        "UPSHIFT" => Command::Upshift,
        "DOWNSHIFT" => Command::Downshift,
        // Tolerate "VERSION:2.0" with no space after the colon
        other => match other.strip_prefix(VERSION_KEYWORD) {
            Some(version) if args.is_empty() => {
                Command::Version(ProtocolVersion::parse(version)?)
            }
            _ => return Err(ProtocolError::UnknownCommand(other.to_string())),
        },
    };

    Ok(Some(command))
}

fn parse_version(args: &[String]) -> ProtocolResult<Command> {
    match args {
        [] => Err(ProtocolError::MissingArgument("version".into())),
        [version] => Ok(Command::Version(ProtocolVersion::parse(version)?)),
        _ => Err(ProtocolError::InvalidVersion(args.join(" "))),
    }
}

fn parse_query(args: &[String]) -> ProtocolResult<Command> {
    let keys = args
        .iter()
        .map(|digest| BinaryKey::encode(digest))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Command::Query(keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    #[test]
    fn test_line_buffer_splits_lines() {
        let mut buf = LineBuffer::new();
        buf.feed(b"VERSION: 2.0\r\nQUERY ab").unwrap();

        assert_eq!(buf.next_line().as_deref(), Some("VERSION: 2.0"));
        assert_eq!(buf.next_line(), None);
        assert_eq!(buf.pending(), 8);

        buf.feed(b"cd\n\n").unwrap();
        assert_eq!(buf.next_line().as_deref(), Some("QUERY abcd"));
        assert_eq!(buf.next_line().as_deref(), Some(""));
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_line_buffer_only_strips_trailing_cr() {
        let mut buf = LineBuffer::new();
        buf.feed(b"a\rb\r\n").unwrap();
        assert_eq!(buf.next_line().as_deref(), Some("a\rb"));
    }

    #[test]
    fn test_line_buffer_limit() {
        let mut buf = LineBuffer::with_limit(8);
        buf.feed(b"12345").unwrap();
        let err = buf.feed(b"6789").unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { size: 9, max: 8 }));
    }

    #[test]
    fn test_tokenize_uppercases_and_trims() {
        assert_eq!(
            tokenize("  query\tabc   Def \r"),
            vec!["QUERY".to_string(), "ABC".into(), "DEF".into()]
        );
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_parse_version() {
        let cmd = parse_line("version: 2.0.0.0").unwrap().unwrap();
        assert_eq!(cmd, Command::Version(ProtocolVersion::from_ordinal(0x0200_0000)));

        let cmd = parse_line("VERSION:1.0").unwrap().unwrap();
        assert_eq!(cmd, Command::Version(ProtocolVersion::from_ordinal(0x0100_0000)));

        assert!(matches!(
            parse_line("VERSION:"),
            Err(ProtocolError::MissingArgument(_))
        ));
        assert!(matches!(
            parse_line("VERSION: 2.0 extra"),
            Err(ProtocolError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_parse_query() {
        let cmd = parse_line("query aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB")
            .unwrap()
            .unwrap();
        match cmd {
            Command::Query(keys) => {
                assert_eq!(keys.len(), 2);
                assert_eq!(keys[0].decode(), "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_query_rejects_malformed_digest() {
        let err = parse_line("QUERY AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA nothex").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Core(hsrv_core::Error::MalformedDigest(ref d)) if d == "NOTHEX"
        ));
    }

    #[test]
    fn test_parse_simple_commands() {
        for (line, kind) in [
            ("bye", CommandKind::Bye),
            ("Status", CommandKind::Status),
            ("UPSHIFT", CommandKind::Upshift),
            ("  downshift  ", CommandKind::Downshift),
        ] {
            assert_eq!(parse_line(line).unwrap().unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_blank_and_unknown_lines() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line(" \t ").unwrap().is_none());
        assert!(matches!(
            parse_line("GET foo"),
            Err(ProtocolError::UnknownCommand(ref c)) if c == "GET"
        ));
    }
}
