use std::io;
use std::ops::Range;

use bytes::{Buf, BytesMut};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{self, Frame, CRLF};
use crate::request::Request;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("protocol error; {0}")]
    Malformed(&'static str),
    #[error("frame size exceeds limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error("connection closed in the middle of a request")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Splits the client byte stream into [`Request`]s and encodes reply [`Frame`]s.
///
/// Requests are either RESP arrays of bulk strings, which is what every real client sends, or
/// inline commands: one CRLF terminated line of whitespace separated words. A malformed request
/// leaves the stream at an unknown position, so decoding errors are final for the connection.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_frame_size: usize,
}

impl RequestCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn decode_request(&self, src: &mut BytesMut, eof: bool) -> Result<Option<Request>, Error> {
        let parsed = match src.first() {
            None => return Ok(None),
            Some(&b'*') => parse_array(src)?,
            Some(_) => parse_inline(src, eof)?,
        };

        let Some((parts, consumed)) = parsed else {
            // Check if the frame size exceeds a certain limit to prevent DoS attacks
            if src.len() > self.max_frame_size {
                return Err(Error::FrameTooLarge(self.max_frame_size));
            }
            return Ok(None);
        };

        // Remove the parsed request from the buffer, the arguments keep pointing into it.
        let bytes = src.split_to(consumed).freeze();
        let mut parts = parts.into_iter().map(|range| bytes.slice(range));

        let name = parts
            .next()
            .ok_or(Error::Malformed("empty request"))?;
        let name = String::from_utf8_lossy(&name).into_owned();

        Ok(Some(Request::new(name, parts.collect())))
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_request(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode_request(src, true)? {
            Some(request) => Ok(Some(request)),
            None if src.is_empty() => Ok(None),
            None => {
                src.advance(src.len());
                Err(Error::Truncated)
            }
        }
    }
}

impl Encoder<Frame> for RequestCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode(dst);
        Ok(())
    }
}

type Parsed = Option<(Vec<Range<usize>>, usize)>;

// *<count>\r\n followed by <count> times $<length>\r\n<bytes>\r\n
fn parse_array(src: &[u8]) -> Result<Parsed, Error> {
    let Ok(line) = frame::line_end(src) else {
        return Ok(None);
    };
    let count = match frame::parse_length(&src[1..line]) {
        Ok(Some(count)) if count > 0 => count,
        _ => return Err(Error::Malformed("invalid multibulk length")),
    };

    let mut position = line + CRLF.len();
    let mut parts = Vec::with_capacity(count.min(1024));

    for _ in 0..count {
        let rest = &src[position..];
        match rest.first() {
            None => return Ok(None),
            Some(&b'$') => {}
            Some(_) => return Err(Error::Malformed("expected bulk string")),
        }

        let Ok(line) = frame::line_end(rest) else {
            return Ok(None);
        };
        let len = match frame::parse_length(&rest[1..line]) {
            Ok(Some(len)) => len,
            _ => return Err(Error::Malformed("invalid bulk length")),
        };

        let start = position + line + CRLF.len();
        let (end, terminated) = start
            .checked_add(len)
            .and_then(|end| Some((end, end.checked_add(CRLF.len())?)))
            .ok_or(Error::Malformed("invalid bulk length"))?;
        if src.len() < terminated {
            return Ok(None);
        }
        if &src[end..terminated] != CRLF {
            return Err(Error::Malformed("bulk string is not terminated by CRLF"));
        }

        parts.push(start..end);
        position = terminated;
    }

    Ok(Some((parts, position)))
}

// COMMAND arg1 arg2\r\n
fn parse_inline(src: &[u8], eof: bool) -> Result<Parsed, Error> {
    let (line, consumed) = match src.windows(2).position(|window| window == CRLF) {
        Some(end) => (end, end + CRLF.len()),
        // The peer is gone, take whatever was sent as the last line.
        None if eof => (src.len(), src.len()),
        None => return Ok(None),
    };

    let mut parts = Vec::new();
    let mut start = None;
    for (i, byte) in src[..line].iter().enumerate() {
        match (byte.is_ascii_whitespace(), start) {
            (true, Some(s)) => {
                parts.push(s..i);
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        parts.push(s..line);
    }

    if parts.is_empty() {
        return Err(Error::Malformed("empty inline request"));
    }

    Ok(Some((parts, consumed)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn request(name: &str, args: &[&str]) -> Request {
        Request::new(
            name,
            args.iter().map(|arg| Bytes::copy_from_slice(arg.as_bytes())).collect(),
        )
    }

    #[test]
    fn decode_array_request() {
        let mut codec = RequestCodec::default();
        let mut src = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n"[..]);

        let actual = codec.decode(&mut src).unwrap();

        assert_eq!(actual, Some(request("PING", &["hello"])));
        assert!(src.is_empty());
    }

    #[test]
    fn decode_inline_request() {
        let mut codec = RequestCodec::default();
        let mut src = BytesMut::from(&b"PING hello\r\n"[..]);

        let actual = codec.decode(&mut src).unwrap();

        assert_eq!(actual, Some(request("PING", &["hello"])));
        assert!(src.is_empty());
    }

    #[test]
    fn decode_inline_request_collapses_whitespace() {
        let mut codec = RequestCodec::default();
        let mut src = BytesMut::from(&b"  SET \t key   value \r\n"[..]);

        let actual = codec.decode(&mut src).unwrap();

        assert_eq!(actual, Some(request("SET", &["key", "value"])));
    }

    #[test]
    fn decode_binary_safe_arguments() {
        let mut codec = RequestCodec::default();
        let mut src = BytesMut::from(&b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$4\r\na\r\nb\r\n"[..]);

        let actual = codec.decode(&mut src).unwrap();

        assert_eq!(actual, Some(request("SET", &["k", "a\r\nb"])));
    }

    #[test]
    fn decode_waits_for_the_whole_request() {
        let mut codec = RequestCodec::default();
        let mut src = BytesMut::from(&b"*3\r\n$3\r\nSE"[..]);

        assert_eq!(codec.decode(&mut src).unwrap(), None);
        // Nothing is consumed until the request is complete.
        assert_eq!(&src[..], b"*3\r\n$3\r\nSE");

        src.extend_from_slice(b"T\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n");
        let actual = codec.decode(&mut src).unwrap();

        assert_eq!(actual, Some(request("SET", &["mykey", "myvalue"])));
    }

    #[test]
    fn decode_consecutive_requests() {
        let mut codec = RequestCodec::default();
        let mut src = BytesMut::from(&b"*1\r\n$4\r\nPING\r\nECHO hi\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"[..]);

        assert_eq!(codec.decode(&mut src).unwrap(), Some(request("PING", &[])));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(request("ECHO", &["hi"])));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(request("GET", &["k"])));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn decode_rejects_invalid_count() {
        for data in [&b"*0\r\n"[..], b"*-1\r\n", b"*abc\r\n"] {
            let mut src = BytesMut::from(data);
            let actual = RequestCodec::default().decode(&mut src);

            assert!(matches!(actual, Err(Error::Malformed(_))), "{:?}", data);
        }
    }

    #[test]
    fn decode_rejects_non_bulk_elements() {
        let mut src = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n:1\r\n"[..]);

        let actual = RequestCodec::default().decode(&mut src);

        assert!(matches!(actual, Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_rejects_unterminated_bulk_string() {
        let mut src = BytesMut::from(&b"*1\r\n$4\r\nPINGxx"[..]);

        let actual = RequestCodec::default().decode(&mut src);

        assert!(matches!(actual, Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_rejects_empty_inline_request() {
        let mut src = BytesMut::from(&b"   \r\n"[..]);

        let actual = RequestCodec::default().decode(&mut src);

        assert!(matches!(actual, Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_eof_with_empty_buffer_ends_the_stream() {
        let mut src = BytesMut::new();

        let actual = RequestCodec::default().decode_eof(&mut src).unwrap();

        assert_eq!(actual, None);
    }

    #[test]
    fn decode_eof_with_truncated_bulk_string() {
        let mut src = BytesMut::from(&b"*2\r\n$4\r\nPING\r\n$10\r\nhel"[..]);

        let actual = RequestCodec::default().decode_eof(&mut src);

        assert!(matches!(actual, Err(Error::Truncated)));
    }

    #[test]
    fn decode_eof_returns_partial_inline_line() {
        let mut src = BytesMut::from(&b"ECHO bye"[..]);

        let actual = RequestCodec::default().decode_eof(&mut src).unwrap();

        assert_eq!(actual, Some(request("ECHO", &["bye"])));
        assert!(src.is_empty());
    }

    #[test]
    fn decode_enforces_max_frame_size() {
        let mut codec = RequestCodec::new(8);
        let mut src = BytesMut::from(&b"*1\r\n$100\r\nabc"[..]);

        let actual = codec.decode(&mut src);

        assert!(matches!(actual, Err(Error::FrameTooLarge(8))));
    }

    #[test]
    fn decode_rejects_bulk_length_near_usize_max() {
        let header = format!("*1\r\n${}\r\n", usize::MAX - 27);
        let mut src = BytesMut::from(header.as_bytes());

        let actual = RequestCodec::default().decode(&mut src);

        assert!(matches!(actual, Err(Error::Malformed(_))));
    }

    #[test]
    fn decode_waits_for_large_bulk_length() {
        let mut src = BytesMut::from(&b"*1\r\n$1000000\r\nab"[..]);

        let actual = RequestCodec::default().decode(&mut src).unwrap();

        assert_eq!(actual, None);
    }

    #[test]
    fn encode_reply() {
        let mut dst = BytesMut::new();

        RequestCodec::default()
            .encode(Frame::NullBulkString, &mut dst)
            .unwrap();

        assert_eq!(&dst[..], b"$-1\r\n");
    }
}
