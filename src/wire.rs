//! Framing: self-sizing decimal length prefix + textual message body.
//!
//! One frame on the wire is
//!
//! ```text
//! <len><rf><id><kind><port>:<payload>
//! ```
//!
//! where `<len>` is the decimal byte length of the whole frame *including
//! the length digits themselves*, `<rf>` is `t`/`f` for "sender awaits a
//! response", `<id>` is the decimal message id (`0` when unused), `<kind>`
//! is a single tag byte, and `<port>` is the sender's listening port
//! terminated by the literal `:`. Everything after the `:` is payload.
//!
//! Because the length counts its own digits, the encoder grows the length
//! until its digit count stabilizes; a body of 9 bytes is framed as 11
//! (`9 + two length digits`), never 10.

use thiserror::Error;

/// Message taxonomy carried in the `<kind>` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Admission handshake.
    Approval,
    /// Approved-neighbor enumeration.
    Neighbors,
    /// Liveness probe.
    Ping,
    /// Overlay maintenance traffic.
    System,
    /// Application payload.
    User,
    /// Anything with an unrecognized tag byte; dropped at dispatch.
    Unknown,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Approval => b'a',
            FrameKind::Neighbors => b'n',
            FrameKind::Ping => b'p',
            FrameKind::System => b's',
            FrameKind::User => b'u',
            FrameKind::Unknown => b'?',
        }
    }

    fn from_tag(byte: u8) -> Self {
        match byte {
            b'a' => FrameKind::Approval,
            b'n' => FrameKind::Neighbors,
            b'p' => FrameKind::Ping,
            b's' => FrameKind::System,
            b'u' => FrameKind::User,
            _ => FrameKind::Unknown,
        }
    }
}

/// A decoded frame. The sender's IP is not on the wire; the dispatcher
/// pairs `sender_port` with the IP observed on the carrying stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub message_id: u64,
    pub awaiting_response: bool,
    pub sender_port: u16,
    pub payload: String,
}

impl Frame {
    /// A frame with a non-zero id that is not itself awaiting a response
    /// is the reply to an earlier request.
    pub fn in_response_to(&self) -> bool {
        self.message_id != 0 && !self.awaiting_response
    }
}

/// Error raised by the decoder or the incremental frame buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("length prefix does not start with a digit")]
    MalformedLength,
    #[error("length prefix out of range")]
    LengthOutOfRange,
    #[error("frame truncated before `{0}` field")]
    Truncated(&'static str),
    #[error("invalid `{0}` field")]
    InvalidField(&'static str),
}

/// Frames longer than this are rejected outright; the protocol carries
/// short textual control messages, so anything near this bound is junk.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Longest run of length digits the buffer will accept before declaring
/// the stream corrupt. 9 digits already covers `MAX_FRAME_LEN`.
const MAX_LEN_DIGITS: usize = 9;

fn decimal_width(mut n: usize) -> usize {
    let mut width = 1;
    while n >= 10 {
        n /= 10;
        width += 1;
    }
    width
}

/// Encode a frame, computing the self-referential length prefix.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let rf = if frame.awaiting_response { 't' } else { 'f' };
    let body = format!(
        "{rf}{id}{kind}{port}:{payload}",
        id = frame.message_id,
        kind = frame.kind.tag() as char,
        port = frame.sender_port,
        payload = frame.payload,
    );

    // Total length includes its own digits; iterate until the digit
    // count is stable. Adding a digit can itself add a digit at the
    // 9->10 and 99->100 style boundaries, hence the loop.
    let body_len = body.len();
    let mut total = body_len + decimal_width(body_len);
    loop {
        let candidate = body_len + decimal_width(total);
        if candidate == total {
            break;
        }
        total = candidate;
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(total.to_string().as_bytes());
    out.extend_from_slice(body.as_bytes());
    debug_assert_eq!(out.len(), total);
    out
}

/// Decode one complete frame (length prefix included).
///
/// Field order follows the wire layout; the first non-digit terminates
/// each numeric field. An unrecognized kind byte decodes successfully as
/// [`FrameKind::Unknown`] so the dispatcher can drop it silently.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let mut pos = 0;

    // <len>: already honored by the frame buffer; skip the digit run.
    let len_digits = leading_digits(&bytes[pos..]);
    if len_digits == 0 {
        return Err(WireError::MalformedLength);
    }
    pos += len_digits;

    // <rf>
    let rf = *bytes.get(pos).ok_or(WireError::Truncated("rf"))?;
    let awaiting_response = rf == b't';
    pos += 1;

    // <id>
    let id_digits = leading_digits(&bytes[pos..]);
    let message_id: u64 = parse_decimal(&bytes[pos..pos + id_digits], "id")?;
    pos += id_digits;

    // <kind>
    let kind_byte = *bytes.get(pos).ok_or(WireError::Truncated("kind"))?;
    let kind = FrameKind::from_tag(kind_byte);
    pos += 1;

    // <port>, terminated by the literal `:`
    let port_digits = leading_digits(&bytes[pos..]);
    let port_value: u64 = parse_decimal(&bytes[pos..pos + port_digits], "port")?;
    let sender_port =
        u16::try_from(port_value).map_err(|_| WireError::InvalidField("port"))?;
    pos += port_digits;
    match bytes.get(pos) {
        Some(b':') => pos += 1,
        Some(_) => return Err(WireError::InvalidField("port")),
        None => return Err(WireError::Truncated("port")),
    }

    let payload = String::from_utf8_lossy(&bytes[pos..]).into_owned();

    Ok(Frame {
        kind,
        message_id,
        awaiting_response,
        sender_port,
        payload,
    })
}

fn leading_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

fn parse_decimal(digits: &[u8], field: &'static str) -> Result<u64, WireError> {
    if digits.is_empty() {
        return Err(WireError::InvalidField(field));
    }
    let mut value: u64 = 0;
    for b in digits {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or(WireError::InvalidField(field))?;
    }
    Ok(value)
}

/// Per-peer accumulator that cuts a byte stream into whole frames.
///
/// `expected_len` is `None` until the length prefix has been parsed;
/// once known, exactly that many bytes from the head of the buffer form
/// one frame, after which the field resets. The digit run that makes up
/// the prefix stays in the emitted frame; its terminator (the `rf` byte)
/// is body, never consumed during length parsing.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    expected_len: Option<usize>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete frame, if the buffer holds one.
    ///
    /// `Ok(None)` means "feed me more bytes". An error means the stream
    /// is unframeable (corrupt length prefix) and the peer must be
    /// dropped; resynchronizing inside a byte stream with no other
    /// delimiters is not possible.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.expected_len.is_none() {
            if self.buf.is_empty() {
                return Ok(None);
            }
            let digits = leading_digits(&self.buf);
            if digits == 0 {
                return Err(WireError::MalformedLength);
            }
            if digits > MAX_LEN_DIGITS {
                return Err(WireError::LengthOutOfRange);
            }
            if digits == self.buf.len() {
                // Still inside the digit run; the terminator has not
                // arrived, so the prefix may grow.
                return Ok(None);
            }
            let length = parse_decimal(&self.buf[..digits], "len")
                .map_err(|_| WireError::LengthOutOfRange)? as usize;
            // The smallest possible body after the prefix is rf + id +
            // kind + port + ':' = 5 bytes.
            if length < digits + 5 || length > MAX_FRAME_LEN {
                return Err(WireError::LengthOutOfRange);
            }
            self.expected_len = Some(length);
        }

        let expected = self.expected_len.expect("set above or on a prior call");
        if self.buf.len() < expected {
            return Ok(None);
        }

        let rest = self.buf.split_off(expected);
        let frame = std::mem::replace(&mut self.buf, rest);
        self.expected_len = None;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_frame(payload: &str) -> Frame {
        Frame {
            kind: FrameKind::User,
            message_id: 0,
            awaiting_response: false,
            sender_port: 5000,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn encodes_known_user_frame() {
        let bytes = encode_frame(&user_frame("hi"));
        assert_eq!(bytes, b"12f0u5000:hi");
    }

    #[test]
    fn decodes_known_user_frame() {
        let frame = decode_frame(b"12f0u5000:hi").unwrap();
        assert_eq!(frame.kind, FrameKind::User);
        assert_eq!(frame.message_id, 0);
        assert!(!frame.awaiting_response);
        assert_eq!(frame.sender_port, 5000);
        assert_eq!(frame.payload, "hi");
        assert!(!frame.in_response_to());
    }

    #[test]
    fn round_trips_every_kind_and_flag() {
        for kind in [
            FrameKind::Approval,
            FrameKind::Neighbors,
            FrameKind::Ping,
            FrameKind::System,
            FrameKind::User,
        ] {
            for awaiting in [false, true] {
                let frame = Frame {
                    kind,
                    message_id: 314,
                    awaiting_response: awaiting,
                    sender_port: 61000,
                    payload: "some payload: with a colon".to_string(),
                };
                let bytes = encode_frame(&frame);
                let decoded = decode_frame(&bytes).unwrap();
                assert_eq!(decoded, frame);
            }
        }
    }

    #[test]
    fn length_prefix_matches_on_wire_length() {
        // Sweep across both digit-count cusps (totals near 10 and 100).
        for payload_len in 0..130 {
            let frame = user_frame(&"x".repeat(payload_len));
            let bytes = encode_frame(&frame);
            let digits = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
            let prefix: usize = std::str::from_utf8(&bytes[..digits])
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(prefix, bytes.len(), "payload_len={payload_len}");
        }
    }

    #[test]
    fn digit_count_cusp_rounds_up() {
        // A 9-byte body cannot be framed in 10 bytes: "10" is two digits,
        // so the total becomes 11.
        let mut frame = user_frame("");
        frame.sender_port = 5;
        // body = "f0u5:" = 5 bytes, pad payload to make body 9 bytes
        frame.payload = "abcd".to_string();
        let bytes = encode_frame(&frame);
        assert_eq!(bytes.len(), 11);
        assert!(bytes.starts_with(b"11"));
    }

    #[test]
    fn unknown_kind_decodes_as_unknown() {
        let frame = decode_frame(b"12f0z5000:hi").unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
    }

    #[test]
    fn response_flag_derivation() {
        let request = decode_frame(b"12t7u5000:hi").unwrap();
        assert!(request.awaiting_response);
        assert!(!request.in_response_to());

        let response = decode_frame(b"12f7u5000:ok").unwrap();
        assert!(!response.awaiting_response);
        assert!(response.in_response_to());
    }

    #[test]
    fn buffer_waits_for_body() {
        let bytes = encode_frame(&user_frame("hello"));
        let mut fb = FrameBuffer::new();

        // Length digits only: no frame yet.
        fb.extend(&bytes[..2]);
        assert_eq!(fb.next_frame().unwrap(), None);

        // Entire frame except the last byte: still no frame.
        fb.extend(&bytes[2..bytes.len() - 1]);
        assert_eq!(fb.next_frame().unwrap(), None);

        // Exact completion yields the frame and an empty buffer.
        fb.extend(&bytes[bytes.len() - 1..]);
        assert_eq!(fb.next_frame().unwrap(), Some(bytes.clone()));
        assert!(fb.is_empty());
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn buffer_keeps_residual_after_frame() {
        let first = encode_frame(&user_frame("one"));
        let second = encode_frame(&user_frame("two"));

        let mut joined = first.clone();
        joined.extend_from_slice(&second[..3]);

        let mut fb = FrameBuffer::new();
        fb.extend(&joined);
        assert_eq!(fb.next_frame().unwrap(), Some(first));
        assert_eq!(fb.len(), 3);
        assert_eq!(fb.next_frame().unwrap(), None);

        fb.extend(&second[3..]);
        assert_eq!(fb.next_frame().unwrap(), Some(second));
    }

    #[test]
    fn buffer_splits_coalesced_frames() {
        let first = encode_frame(&user_frame("alpha"));
        let second = encode_frame(&user_frame("beta"));
        let mut joined = first.clone();
        joined.extend_from_slice(&second);

        let mut fb = FrameBuffer::new();
        fb.extend(&joined);
        assert_eq!(fb.next_frame().unwrap(), Some(first));
        assert_eq!(fb.next_frame().unwrap(), Some(second));
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn buffer_rejects_nondigit_length() {
        let mut fb = FrameBuffer::new();
        fb.extend(b"xf0u5000:hi");
        assert_eq!(fb.next_frame(), Err(WireError::MalformedLength));
    }

    #[test]
    fn buffer_rejects_absurd_length() {
        let mut fb = FrameBuffer::new();
        fb.extend(b"99999999999f");
        assert_eq!(fb.next_frame(), Err(WireError::LengthOutOfRange));
    }

    #[test]
    fn buffer_rejects_length_smaller_than_minimal_frame() {
        let mut fb = FrameBuffer::new();
        fb.extend(b"2f0u5000:hi");
        assert_eq!(fb.next_frame(), Err(WireError::LengthOutOfRange));
    }
}
