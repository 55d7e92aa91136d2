//! Binary codec for SSH channel request payloads (RFC 4254).
//!
//! # Wire Formats
//!
//! Request payloads are built from two primitives:
//! - string: 4 bytes big-endian length, then that many bytes of UTF-8
//! - window-size quad: four big-endian u32 values (columns, rows, pixel
//!   width, pixel height), 16 bytes in total
//!
//! The parsers never allocate beyond the returned string and never panic
//! on short input; every failure is reported as a [`WireError`].

use bytes::{BufMut, BytesMut};

use crate::error::{Result, WireError};

/// Size of a string length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of an encoded window-size quad.
pub const WINDOW_SIZE_LEN: usize = 16;

/// Terminal mode list terminator (`TTY_OP_END`).
pub const TTY_OP_END: u8 = 0;

/// Parse one length-prefixed string from the front of `buf`.
///
/// Returns the string and the number of bytes consumed (`length + 4`).
pub fn parse_string(buf: &[u8]) -> Result<(String, usize)> {
    let (raw, consumed) = parse_bytes(buf)?;
    let text = std::str::from_utf8(raw)?;
    Ok((text.to_string(), consumed))
}

/// Parse one length-prefixed byte string without UTF-8 validation.
pub fn parse_bytes(buf: &[u8]) -> Result<(&[u8], usize)> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Err(WireError::TruncatedLength {
            available: buf.len(),
        });
    }

    let declared = read_u32(buf) as usize;
    let end = declared
        .checked_add(LENGTH_PREFIX_SIZE)
        .filter(|end| *end <= buf.len())
        .ok_or(WireError::TruncatedString {
            declared,
            available: buf.len(),
        })?;

    Ok((&buf[LENGTH_PREFIX_SIZE..end], end))
}

/// Parse consecutive length-prefixed strings until `buf` is exhausted.
///
/// An empty buffer yields an empty list.
pub fn parse_strings(mut buf: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let (s, consumed) = parse_string(buf)?;
        out.push(s);
        buf = &buf[consumed..];
    }
    Ok(out)
}

/// Terminal dimensions carried by `pty-req` and `window-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    /// Width in characters.
    pub cols: u32,
    /// Height in rows.
    pub rows: u32,
    /// Width in pixels.
    pub pixel_width: u32,
    /// Height in pixels.
    pub pixel_height: u32,
}

impl WindowSize {
    /// Create a window size with zero pixel dimensions.
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Append the 16-byte big-endian encoding to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.cols);
        out.put_u32(self.rows);
        out.put_u32(self.pixel_width);
        out.put_u32(self.pixel_height);
    }
}

/// Parse a window-size quad from the first 16 bytes of `buf`.
///
/// Trailing bytes are ignored.
pub fn parse_window_size(buf: &[u8]) -> Result<WindowSize> {
    if buf.len() < WINDOW_SIZE_LEN {
        return Err(WireError::TruncatedWindowSize {
            available: buf.len(),
        });
    }

    Ok(WindowSize {
        cols: read_u32(&buf[0..]),
        rows: read_u32(&buf[4..]),
        pixel_width: read_u32(&buf[8..]),
        pixel_height: read_u32(&buf[12..]),
    })
}

/// Append a length-prefixed string.
pub fn put_string(out: &mut BytesMut, value: &[u8]) {
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

/// A decoded `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value for the `TERM` environment variable.
    pub term: String,
    /// Initial terminal dimensions.
    pub size: WindowSize,
    /// Encoded terminal modes, passed through unparsed.
    pub modes: Vec<u8>,
}

impl PtyRequest {
    /// Decode a `pty-req` payload: terminal name, then window size.
    ///
    /// The trailing terminal modes string is kept raw when present.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (term, consumed) = parse_string(buf)?;
        let rest = &buf[consumed..];
        let size = parse_window_size(rest)?;
        let modes = parse_bytes(&rest[WINDOW_SIZE_LEN..])
            .map(|(raw, _)| raw.to_vec())
            .unwrap_or_default();
        Ok(Self { term, size, modes })
    }

    /// Encode as a `pty-req` payload.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(
            LENGTH_PREFIX_SIZE * 2 + self.term.len() + WINDOW_SIZE_LEN + self.modes.len(),
        );
        put_string(&mut out, self.term.as_bytes());
        self.size.encode(&mut out);
        if self.modes.is_empty() {
            put_string(&mut out, &[TTY_OP_END]);
        } else {
            put_string(&mut out, &self.modes);
        }
        out
    }
}

/// Encode the payload of an `exit-status` message.
pub fn encode_exit_status(code: u32) -> [u8; 4] {
    code.to_be_bytes()
}

/// Decode the payload of an `exit-status` message.
pub fn parse_exit_status(buf: &[u8]) -> Option<u32> {
    (buf.len() >= 4).then(|| read_u32(buf))
}

#[inline]
fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_payload(parts: &[&str]) -> BytesMut {
        let mut out = BytesMut::new();
        for part in parts {
            put_string(&mut out, part.as_bytes());
        }
        out
    }

    #[test]
    fn test_parse_string_leaves_remainder() {
        let buf = [0, 0, 0, 3, b'a', b'b', b'c', b'X', b'Y', b'Z'];
        let (s, consumed) = parse_string(&buf).unwrap();
        assert_eq!(s, "abc");
        assert_eq!(consumed, 7);
        assert_eq!(&buf[consumed..], b"XYZ");
    }

    #[test]
    fn test_parse_string_short_prefix() {
        for len in 0..4 {
            let buf = vec![0u8; len];
            let err = parse_string(&buf).unwrap_err();
            assert_eq!(err, WireError::TruncatedLength { available: len });
        }
    }

    #[test]
    fn test_parse_string_truncated_body() {
        let buf = [0, 0, 0, 10, b'a', b'b'];
        let err = parse_string(&buf).unwrap_err();
        assert_eq!(
            err,
            WireError::TruncatedString {
                declared: 10,
                available: 6
            }
        );
    }

    #[test]
    fn test_parse_string_huge_length_does_not_overflow() {
        let buf = [0xff, 0xff, 0xff, 0xff, b'a'];
        assert!(matches!(
            parse_string(&buf),
            Err(WireError::TruncatedString { .. })
        ));
    }

    #[test]
    fn test_parse_string_empty() {
        let (s, consumed) = parse_string(&[0, 0, 0, 0]).unwrap();
        assert_eq!(s, "");
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_parse_string_rejects_invalid_utf8() {
        let buf = [0, 0, 0, 2, 0xc3, 0x28];
        assert_eq!(parse_string(&buf).unwrap_err(), WireError::InvalidUtf8);
    }

    #[test]
    fn test_parse_strings_sequence() {
        let payload = string_payload(&["ls", "-la", "/tmp"]);
        let tokens = parse_strings(&payload).unwrap();
        assert_eq!(tokens, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn test_parse_strings_empty_buffer() {
        assert!(parse_strings(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_strings_trailing_garbage_fails() {
        let mut payload = string_payload(&["echo"]);
        payload.put_slice(&[0, 0]);
        assert!(matches!(
            parse_strings(&payload),
            Err(WireError::TruncatedLength { available: 2 })
        ));
    }

    #[test]
    fn test_parse_window_size_exact() {
        let mut buf = BytesMut::new();
        WindowSize::new(80, 24).encode(&mut buf);
        assert_eq!(buf.len(), WINDOW_SIZE_LEN);

        let size = parse_window_size(&buf).unwrap();
        assert_eq!(size, WindowSize::new(80, 24));
    }

    #[test]
    fn test_parse_window_size_field_order() {
        let buf: Vec<u8> = [1u32, 2, 3, 4]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        let size = parse_window_size(&buf).unwrap();
        assert_eq!(size.cols, 1);
        assert_eq!(size.rows, 2);
        assert_eq!(size.pixel_width, 3);
        assert_eq!(size.pixel_height, 4);
    }

    #[test]
    fn test_parse_window_size_short() {
        let err = parse_window_size(&[0u8; 15]).unwrap_err();
        assert_eq!(err, WireError::TruncatedWindowSize { available: 15 });
    }

    #[test]
    fn test_pty_request_parse() {
        let req = PtyRequest {
            term: "xterm-256color".to_string(),
            size: WindowSize::new(120, 40),
            modes: Vec::new(),
        };
        let parsed = PtyRequest::parse(&req.encode()).unwrap();
        assert_eq!(parsed.term, "xterm-256color");
        assert_eq!(parsed.size, WindowSize::new(120, 40));
    }

    #[test]
    fn test_pty_request_without_modes() {
        let mut buf = string_payload(&["vt100"]);
        WindowSize::new(80, 24).encode(&mut buf);
        let parsed = PtyRequest::parse(&buf).unwrap();
        assert_eq!(parsed.term, "vt100");
        assert!(parsed.modes.is_empty());
    }

    #[test]
    fn test_pty_request_keeps_binary_modes() {
        let req = PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize::new(80, 24),
            modes: vec![53, 0, 0, 0, 1, 0xff, TTY_OP_END],
        };
        let parsed = PtyRequest::parse(&req.encode()).unwrap();
        assert_eq!(parsed.modes, req.modes);
    }

    #[test]
    fn test_pty_request_missing_size() {
        let buf = string_payload(&["vt100"]);
        assert!(matches!(
            PtyRequest::parse(&buf),
            Err(WireError::TruncatedWindowSize { available: 0 })
        ));
    }

    #[test]
    fn test_exit_status_encoding() {
        assert_eq!(encode_exit_status(255), [0, 0, 0, 255]);
        assert_eq!(encode_exit_status(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(parse_exit_status(&[0, 0, 1, 0]), Some(256));
        assert_eq!(parse_exit_status(&[0, 0, 1]), None);
    }
}
