//! hsrv command types and protocol generations

use hsrv_core::BinaryKey;

use crate::error::{ProtocolError, ProtocolResult};

/// Highest ordinal served by generation 1 (`1.0.0.0`)
pub const PROTOCOL1_MAX: u32 = 0x0100_0000;

/// Highest ordinal served by generation 2 (`2.0.0.0`)
pub const PROTOCOL2_MAX: u32 = 0x0200_0000;

/// Largest value a single version component may take
const MAX_COMPONENT: u32 = 254;

/// A parsed hsrv command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// VERSION: <a>[.<b>[.<c>[.<d>]]]
    Version(ProtocolVersion),

    /// QUERY <digest> [<digest> ...]
    Query(Vec<BinaryKey>),

    /// BYE
    Bye,

    /// STATUS
    Status,

    /// UPSHIFT
    Upshift,

    /// DOWNSHIFT
    Downshift,
}

/// Command discriminant, used by the per-generation dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Version,
    Query,
    Bye,
    Status,
    Upshift,
    Downshift,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Version(_) => CommandKind::Version,
            Command::Query(_) => CommandKind::Query,
            Command::Bye => CommandKind::Bye,
            Command::Status => CommandKind::Status,
            Command::Upshift => CommandKind::Upshift,
            Command::Downshift => CommandKind::Downshift,
        }
    }
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Version => "VERSION",
            CommandKind::Query => "QUERY",
            CommandKind::Bye => "BYE",
            CommandKind::Status => "STATUS",
            CommandKind::Upshift => "UPSHIFT",
            CommandKind::Downshift => "DOWNSHIFT",
        }
    }
}

/// Protocol version family negotiated at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Single transaction: one command after the version line
    Protocol1,
    /// Command loop until BYE
    Protocol2,
}

const PROTOCOL1_COMMANDS: &[CommandKind] = &[CommandKind::Version, CommandKind::Query];

const PROTOCOL2_COMMANDS: &[CommandKind] = &[
    CommandKind::Version,
    CommandKind::Query,
    CommandKind::Bye,
    CommandKind::Status,
    CommandKind::Upshift,
    CommandKind::Downshift,
];

impl Generation {
    /// Commands this generation understands
    pub fn commands(self) -> &'static [CommandKind] {
        match self {
            Generation::Protocol1 => PROTOCOL1_COMMANDS,
            Generation::Protocol2 => PROTOCOL2_COMMANDS,
        }
    }

    pub fn accepts(self, kind: CommandKind) -> bool {
        self.commands().contains(&kind)
    }

    /// True if the session ends after one command
    pub fn is_single_shot(self) -> bool {
        matches!(self, Generation::Protocol1)
    }

    pub fn number(self) -> u8 {
        match self {
            Generation::Protocol1 => 1,
            Generation::Protocol2 => 2,
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol{}", self.number())
    }
}

/// Client version packed as `(a << 24) | (b << 16) | (c << 8) | d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    pub fn from_ordinal(ordinal: u32) -> Self {
        Self(ordinal)
    }

    /// Parse `a.b.c.d`; missing trailing components are zero
    pub fn parse(s: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidVersion(s.to_string());

        let components: Vec<&str> = s.split('.').collect();
        if components.len() > 4 {
            return Err(invalid());
        }

        let mut ordinal = 0u32;
        for (index, component) in components.iter().enumerate() {
            if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let value: u32 = component.parse().map_err(|_| invalid())?;
            if value > MAX_COMPONENT {
                return Err(invalid());
            }
            ordinal |= value << (24 - 8 * index);
        }

        Ok(Self(ordinal))
    }

    pub fn ordinal(&self) -> u32 {
        self.0
    }

    /// The generation serving this version, if any
    pub fn generation(&self, old_protocol_only: bool) -> Option<Generation> {
        match self.0 {
            0 => None,
            1..=PROTOCOL1_MAX => Some(Generation::Protocol1),
            v if v <= PROTOCOL2_MAX && !old_protocol_only => Some(Generation::Protocol2),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d] = self.0.to_be_bytes();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordinal_packing() {
        assert_eq!(ProtocolVersion::parse("1.2.3.4").unwrap().ordinal(), 0x0102_0304);
        assert_eq!(ProtocolVersion::parse("2").unwrap().ordinal(), 0x0200_0000);
        assert_eq!(ProtocolVersion::parse("1.5").unwrap().ordinal(), 0x0105_0000);
        assert_eq!(ProtocolVersion::parse("1.2.3.4").unwrap().to_string(), "1.2.3.4");
    }

    #[test]
    fn test_version_rejects_bad_components() {
        for bad in ["", "1..0", "1.2.3.4.5", "255", "1.x", "-1", "+1", "1.2.3.1000"] {
            assert!(ProtocolVersion::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_generation_ranges() {
        let gen = |s: &str| ProtocolVersion::parse(s).unwrap().generation(false);

        assert_eq!(gen("0.0.0.0"), None);
        assert_eq!(gen("0.0.0.1"), Some(Generation::Protocol1));
        assert_eq!(gen("1.0.0.0"), Some(Generation::Protocol1));
        assert_eq!(gen("1.0.0.1"), Some(Generation::Protocol2));
        assert_eq!(gen("2.0.0.0"), Some(Generation::Protocol2));
        assert_eq!(gen("2.0.0.1"), None);
        assert_eq!(gen("3"), None);
    }

    #[test]
    fn test_old_protocol_only_refuses_generation_two() {
        let v2 = ProtocolVersion::parse("2.0").unwrap();
        let v1 = ProtocolVersion::parse("1.0").unwrap();
        assert_eq!(v2.generation(true), None);
        assert_eq!(v1.generation(true), Some(Generation::Protocol1));
    }

    #[test]
    fn test_dispatch_table() {
        assert!(Generation::Protocol1.accepts(CommandKind::Query));
        assert!(!Generation::Protocol1.accepts(CommandKind::Bye));
        assert!(!Generation::Protocol1.accepts(CommandKind::Downshift));
        assert!(Generation::Protocol2.accepts(CommandKind::Status));
        assert!(Generation::Protocol1.is_single_shot());
        assert!(!Generation::Protocol2.is_single_shot());
    }
}
