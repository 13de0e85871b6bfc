//! Classification of inbound command payloads.
//!
//! Payloads arrive as opaque bytes. The text of a payload is everything up to
//! the first NUL byte (publishers written in C commonly send the terminator
//! along with the string). That text is either the shutdown token, three
//! whitespace-separated decimal integers, or something we ignore.
//!
//! ```text
//! "quit"          -> Shutdown
//! "1 0 150"       -> Command { v1: 1, v2: 0, v3: 150 }
//! " -4\t+2  7xyz" -> Command { v1: -4, v2: 2, v3: 7 }
//! "1 2"           -> Ignore
//! ```
//!
//! Classification is total: every payload maps to exactly one
//! [`ParseResult`], and nothing here can fail.

use std::fmt;

/// Payload text that requests a graceful shutdown of the bridge.
///
/// Matched exactly; case and surrounding whitespace are significant.
pub const SHUTDOWN_TOKEN: &str = "quit";

/// A validated actuator command: three signed integers in message order.
///
/// The values are kept exactly as received. Interpreting them (flags,
/// clamping) is the job of [`crate::actuator::ActuatorFrame::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub v1: i32,
    pub v2: i32,
    pub v3: i32,
}

impl Command {
    pub const fn new(v1: i32, v2: i32, v3: i32) -> Self {
        Self { v1, v2, v3 }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.v1, self.v2, self.v3)
    }
}

/// Outcome of classifying one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// Three integers were scanned; drive the actuator.
    Command(Command),

    /// The payload is the shutdown token.
    Shutdown,

    /// Anything else. Still counts as an arrival.
    Ignore,
}

/// Classify a raw payload.
pub fn classify(payload: &[u8]) -> ParseResult {
    let text = payload_text(payload);

    if text == SHUTDOWN_TOKEN.as_bytes() {
        return ParseResult::Shutdown;
    }

    match scan_command(text) {
        Some(command) => ParseResult::Command(command),
        None => ParseResult::Ignore,
    }
}

/// Text portion of a payload: the bytes before the first NUL.
pub fn payload_text(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == 0) {
        Some(end) => &payload[..end],
        None => payload,
    }
}

/// Scan `"%d %d %d"`. Content after the third integer is not examined.
fn scan_command(text: &[u8]) -> Option<Command> {
    let mut scanner = IntScanner::new(text);

    let v1 = scanner.next_int()?;
    let v2 = scanner.next_int()?;
    let v3 = scanner.next_int()?;

    Some(Command { v1, v2, v3 })
}

/// Sequential reader of `%d` conversions over a byte string.
struct IntScanner<'a> {
    rest: &'a [u8],
}

impl<'a> IntScanner<'a> {
    fn new(text: &'a [u8]) -> Self {
        Self { rest: text }
    }

    /// Skip leading whitespace and read one signed decimal integer.
    ///
    /// Returns `None` without consuming input if no digits follow the
    /// optional sign, or if the value does not fit in an `i32`.
    fn next_int(&mut self) -> Option<i32> {
        let start = self
            .rest
            .iter()
            .position(|&b| !is_c_space(b))
            .unwrap_or(self.rest.len());
        let mut s = &self.rest[start..];

        let negative = match s.first() {
            Some(b'-') => {
                s = &s[1..];
                true
            }
            Some(b'+') => {
                s = &s[1..];
                false
            }
            _ => false,
        };

        let digits = s.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }

        // Accumulate the magnitude wide enough to hold |i32::MIN|.
        let mut magnitude: i64 = 0;
        for &d in &s[..digits] {
            magnitude = magnitude * 10 + i64::from(d - b'0');
            if magnitude > i64::from(i32::MAX) + 1 {
                return None;
            }
        }

        let value = if negative { -magnitude } else { magnitude };
        let value = i32::try_from(value).ok()?;

        self.rest = &s[digits..];
        Some(value)
    }
}

/// Whitespace as the C locale defines it (includes vertical tab).
fn is_c_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(v1: i32, v2: i32, v3: i32) -> ParseResult {
        ParseResult::Command(Command::new(v1, v2, v3))
    }

    #[test]
    fn shutdown_token_is_exact() {
        assert_eq!(classify(b"quit"), ParseResult::Shutdown);
        assert_eq!(classify(b"Quit"), ParseResult::Ignore);
        assert_eq!(classify(b"quit "), ParseResult::Ignore);
        assert_eq!(classify(b" quit"), ParseResult::Ignore);
        assert_eq!(classify(b"quit\n"), ParseResult::Ignore);
    }

    #[test]
    fn shutdown_token_with_c_terminator() {
        assert_eq!(classify(b"quit\0"), ParseResult::Shutdown);
        assert_eq!(classify(b"quit\0garbage"), ParseResult::Shutdown);
    }

    #[test]
    fn three_integers() {
        assert_eq!(classify(b"1 0 150"), command(1, 0, 150));
        assert_eq!(classify(b"5 -3 200"), command(5, -3, 200));
        assert_eq!(classify(b"+7 +8 +9"), command(7, 8, 9));
        assert_eq!(classify(b"0 0 0"), command(0, 0, 0));
    }

    #[test]
    fn any_whitespace_separates() {
        assert_eq!(classify(b"  1\t\t2\n3"), command(1, 2, 3));
        assert_eq!(classify(b"\r\n-1\x0b-2\x0c-3"), command(-1, -2, -3));
    }

    #[test]
    fn trailing_content_is_tolerated() {
        assert_eq!(classify(b"1 2 3abc"), command(1, 2, 3));
        assert_eq!(classify(b"1 2 3 4"), command(1, 2, 3));
        assert_eq!(classify(b"10 20 30\0"), command(10, 20, 30));
    }

    #[test]
    fn fewer_than_three_integers_is_ignored() {
        assert_eq!(classify(b""), ParseResult::Ignore);
        assert_eq!(classify(b"   \t\n"), ParseResult::Ignore);
        assert_eq!(classify(b"1"), ParseResult::Ignore);
        assert_eq!(classify(b"1 2"), ParseResult::Ignore);
        assert_eq!(classify(b"1 2abc 3"), ParseResult::Ignore);
        assert_eq!(classify(b"a 1 2 3"), ParseResult::Ignore);
        assert_eq!(classify(b"1 - 2 3"), ParseResult::Ignore);
        assert_eq!(classify(b"1 2 +"), ParseResult::Ignore);
    }

    #[test]
    fn self_test_greeting_is_ignored() {
        let greeting = b"Hello World!  QoS 0 message from app version 0.300000\0";
        assert_eq!(classify(greeting), ParseResult::Ignore);
    }

    #[test]
    fn nul_truncates_the_text() {
        assert_eq!(classify(b"1 2\0 3"), ParseResult::Ignore);
        assert_eq!(classify(b"\01 2 3"), ParseResult::Ignore);
    }

    #[test]
    fn i32_range_limits() {
        assert_eq!(
            classify(b"2147483647 -2147483648 0"),
            command(i32::MAX, i32::MIN, 0)
        );
        assert_eq!(classify(b"2147483648 0 0"), ParseResult::Ignore);
        assert_eq!(classify(b"0 -2147483649 0"), ParseResult::Ignore);
        assert_eq!(classify(b"1 2 99999999999999999999"), ParseResult::Ignore);
    }

    #[test]
    fn non_utf8_bytes_do_not_matter_after_third_integer() {
        assert_eq!(classify(b"1 2 3\xff\xfe"), command(1, 2, 3));
        assert_eq!(classify(b"\xff1 2 3"), ParseResult::Ignore);
    }

    #[test]
    fn command_display_round_trips_through_classify() {
        let cmd = Command::new(-12, 0, 99);
        assert_eq!(classify(cmd.to_string().as_bytes()), ParseResult::Command(cmd));
    }
}
