//! TCPMUX line protocol shared by the remote and registrant sides.
//!
//! Both directions exchange a single CRLF-terminated line:
//!
//! ```text
//! C: <service>\r\n
//! S: +\r\n | -<reason>\r\n
//! ```
//!
//! Lines are read one byte at a time so nothing past the terminator is
//! consumed. Whatever follows belongs to the application (remote side) or
//! to the handoff transport (registrant side).

use crate::error::{MuxError, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Raw bytes a line may occupy, terminator included.
pub const MAX_LINE_LEN: usize = 256;

pub const REASON_TOO_LONG: &str = "Service name too long";
pub const REASON_INVALID_CHARACTER: &str = "Service name contains invalid character";
pub const REASON_ALREADY_EXISTS: &str = "Service already exists";
pub const REASON_NOT_FOUND: &str = "Service not found";

/// Read one CRLF-terminated line, returning it without the terminator.
pub async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    while line.len() < MAX_LINE_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(MuxError::PeerClosed)
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' && line.last() == Some(&b'\r') {
            line.pop();
            return Ok(line);
        }
        line.push(byte);
    }
    Err(MuxError::LineTooLong)
}

fn is_name_byte(b: u8) -> bool {
    (32..=127).contains(&b)
}

/// Check that `raw` fits in one line with its CRLF and is printable ASCII.
fn validate(raw: &[u8]) -> Result<()> {
    if raw.len() + 2 > MAX_LINE_LEN {
        return Err(MuxError::LineTooLong);
    }
    if !raw.iter().copied().all(is_name_byte) {
        return Err(MuxError::InvalidCharacter);
    }
    Ok(())
}

/// Canonical (lowercased, printable ASCII) service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        validate(raw)?;
        // All bytes are ASCII at this point.
        let name = raw
            .iter()
            .map(|b| char::from(b.to_ascii_lowercase()))
            .collect();
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode a client request line, checking the name before it hits the wire.
pub fn encode_request(service: &str) -> Result<Vec<u8>> {
    let raw = service.as_bytes();
    validate(raw)?;
    let mut line = Vec::with_capacity(raw.len() + 2);
    line.extend_from_slice(raw);
    line.extend_from_slice(b"\r\n");
    Ok(line)
}

/// Status line sent by the daemon after a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Err(String),
}

impl Reply {
    pub fn err(reason: impl Into<String>) -> Self {
        Self::Err(reason.into())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"+\r\n".to_vec(),
            Reply::Err(reason) => {
                let mut out = Vec::with_capacity(reason.len() + 3);
                out.push(b'-');
                out.extend(reason.bytes().filter(|b| *b != b'\r' && *b != b'\n'));
                out.extend_from_slice(b"\r\n");
                out
            }
        }
    }

    /// Parse a reply line (terminator already stripped). `None` means the
    /// line is neither a success nor a failure reply.
    pub fn parse(line: &[u8]) -> Option<Self> {
        match line.split_first() {
            Some((b'+', _)) => Some(Reply::Ok),
            Some((b'-', reason)) => Some(Reply::Err(String::from_utf8_lossy(reason).into_owned())),
            _ => None,
        }
    }

    /// Reply a registrant gets for a failed handshake or insert.
    pub fn for_registration_error(err: &MuxError) -> Option<Self> {
        match err {
            MuxError::LineTooLong => Some(Reply::err(REASON_TOO_LONG)),
            MuxError::InvalidCharacter => Some(Reply::err(REASON_INVALID_CHARACTER)),
            MuxError::AlreadyExists(_) => Some(Reply::err(REASON_ALREADY_EXISTS)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn read_line_leaves_trailing_bytes_unread() {
        let mut input: &[u8] = b"foo\r\nabc";
        let line = read_line(&mut input).await.unwrap();
        assert_eq!(line, b"foo");

        let mut rest = Vec::new();
        input.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"abc");
    }

    #[tokio::test]
    async fn bare_lf_and_cr_are_part_of_the_line() {
        let mut input: &[u8] = b"a\nb\rc\r\n";
        let line = read_line(&mut input).await.unwrap();
        assert_eq!(line, b"a\nb\rc");
    }

    #[tokio::test]
    async fn longest_name_fits_the_line_buffer() {
        let mut data = vec![b'x'; 254];
        data.extend_from_slice(b"\r\n");
        let mut input: &[u8] = &data;
        let line = read_line(&mut input).await.unwrap();
        assert_eq!(line.len(), 254);
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let mut data = vec![b'x'; 255];
        data.extend_from_slice(b"\r\n");
        let mut input: &[u8] = &data;
        assert!(matches!(
            read_line(&mut input).await,
            Err(MuxError::LineTooLong)
        ));
    }

    #[tokio::test]
    async fn eof_before_terminator_is_peer_closed() {
        let mut input: &[u8] = b"foo\r";
        assert!(matches!(
            read_line(&mut input).await,
            Err(MuxError::PeerClosed)
        ));
    }

    #[test]
    fn service_names_are_lowercased() {
        let name = ServiceName::parse(b"Foo-BAR 1").unwrap();
        assert_eq!(name.as_str(), "foo-bar 1");
    }

    #[test]
    fn control_and_high_bytes_are_invalid() {
        assert!(matches!(
            ServiceName::parse(b"foo\tbar"),
            Err(MuxError::InvalidCharacter)
        ));
        assert!(matches!(
            ServiceName::parse(&[b'f', 0xC3, 0xA9]),
            Err(MuxError::InvalidCharacter)
        ));
        // DEL is inside the accepted range.
        assert!(ServiceName::parse(&[b'a', 127]).is_ok());
    }

    #[test]
    fn replies_encode_and_parse() {
        assert_eq!(Reply::Ok.encode(), b"+\r\n");
        assert_eq!(
            Reply::err(REASON_NOT_FOUND).encode(),
            b"-Service not found\r\n"
        );
        assert_eq!(Reply::err("a\r\nb").encode(), b"-ab\r\n");

        assert_eq!(Reply::parse(b"+"), Some(Reply::Ok));
        assert_eq!(
            Reply::parse(b"-Service already exists"),
            Some(Reply::err(REASON_ALREADY_EXISTS))
        );
        assert_eq!(Reply::parse(b""), None);
        assert_eq!(Reply::parse(b"?"), None);
    }

    #[test]
    fn encode_request_rejects_bad_names_locally() {
        assert_eq!(encode_request("echo").unwrap(), b"echo\r\n");
        assert!(matches!(
            encode_request("a\r\nb"),
            Err(MuxError::InvalidCharacter)
        ));
        assert!(matches!(
            encode_request(&"x".repeat(255)),
            Err(MuxError::LineTooLong)
        ));
    }

    #[test]
    fn request_encoding_and_parsing_agree_on_limits() {
        let fits = "x".repeat(254);
        let overflows = "x".repeat(255);
        for name in ["", "Echo", "tab\there", "\u{7f}", fits.as_str(), overflows.as_str()] {
            let encoded = encode_request(name).map(|_| ());
            let parsed = ServiceName::parse(name.as_bytes()).map(|_| ());
            assert_eq!(
                encoded.map_err(|e| e.to_string()),
                parsed.map_err(|e| e.to_string()),
                "disagreement on {name:?}"
            );
        }
    }

    #[test]
    fn registration_errors_have_literal_reasons() {
        assert_eq!(
            Reply::for_registration_error(&MuxError::AlreadyExists("x".into())),
            Some(Reply::err("Service already exists"))
        );
        assert_eq!(Reply::for_registration_error(&MuxError::Timeout), None);
    }
}
