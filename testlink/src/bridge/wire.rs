//! Wire grammar and command vocabulary.
//!
//! ```text
//! FRAME := COMMAND (SEPARATOR SEGMENT)* TERMINATOR
//! ```
//!
//! The terminator is a line feed. Segments are compact JSON or plain
//! identifiers, neither of which can contain a raw line feed. Only the first
//! separator is significant at each split, so a trailing JSON segment may
//! contain spaces.

use std::fmt;

/// Separates the command token from its segments and segments from each other.
pub const SEPARATOR: &[u8] = b" ";

/// Ends every frame.
pub const TERMINATOR: &[u8] = b"\n";

/// Capability level spoken by this implementation.
pub const PROTOCOL_CAPABILITY: u32 = 1;

/// Known command tokens.
///
/// `Info` is sent by both roles. `Cancel` and `Quit` are runner-originated,
/// `Message` is execution-originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Info,
    Cancel,
    Quit,
    Message,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Info,
        Command::Cancel,
        Command::Quit,
        Command::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Cancel => "CANCEL",
            Self::Quit => "QUIT",
            Self::Message => "MESSAGE",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Look up a token. Unknown tokens are data, not errors.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_bytes() == token)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `buffer` at the first separator.
///
/// Returns the remainder as `None` when no separator is present.
pub fn split_on_separator(buffer: &[u8]) -> (&[u8], Option<&[u8]>) {
    match find(buffer, SEPARATOR) {
        Some(at) => (&buffer[..at], Some(&buffer[at + SEPARATOR.len()..])),
        None => (buffer, None),
    }
}

/// True when `segment` can travel as a non-final segment without being split.
pub fn is_valid_segment(segment: &[u8]) -> bool {
    !segment.is_empty() && find(segment, SEPARATOR).is_none() && find(segment, TERMINATOR).is_none()
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_recovers_both_halves() {
        let (first, rest) = split_on_separator(b"op-1 {\"type\":\"result\", \"passed\":true}");
        assert_eq!(first, b"op-1");
        assert_eq!(rest, Some(&b"{\"type\":\"result\", \"passed\":true}"[..]));
    }

    #[test]
    fn split_without_separator_has_no_remainder() {
        let (first, rest) = split_on_separator(b"QUIT");
        assert_eq!(first, b"QUIT");
        assert_eq!(rest, None);
    }

    #[test]
    fn split_with_trailing_separator_yields_empty_remainder() {
        let (first, rest) = split_on_separator(b"CANCEL ");
        assert_eq!(first, b"CANCEL");
        assert_eq!(rest, Some(&b""[..]));
    }

    #[test]
    fn split_of_joined_segments() {
        for (a, b) in [("INFO", "{}"), ("op", "x y z"), ("MESSAGE", "op-2 {\"a\":1}")] {
            let joined = [a.as_bytes(), SEPARATOR, b.as_bytes()].concat();
            let (first, rest) = split_on_separator(&joined);
            assert_eq!(first, a.as_bytes());
            assert_eq!(rest, Some(b.as_bytes()));
        }
    }

    #[test]
    fn command_tokens() {
        for command in Command::ALL {
            assert_eq!(Command::from_token(command.as_bytes()), Some(command));
        }
        assert_eq!(Command::from_token(b"MSG"), None);
        assert_eq!(Command::from_token(b"info"), None);
        assert_eq!(Command::from_token(b""), None);
    }

    #[test]
    fn json_never_contains_terminator() {
        let value = serde_json::json!({"text": "line one\nline two", "n": 1});
        let json = serde_json::to_vec(&value).unwrap();
        assert_eq!(find(&json, TERMINATOR), None);
    }

    #[test]
    fn segment_validation() {
        assert!(is_valid_segment(b"op-1"));
        assert!(!is_valid_segment(b""));
        assert!(!is_valid_segment(b"op 1"));
        assert!(!is_valid_segment(b"op\n1"));
    }
}
