// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::str::{self, FromStr};

use bytes::{BufMut, Bytes, BytesMut};
use num_bigint::BigInt;
use std::string::FromUtf8Error;
use thiserror::Error as ThisError;

pub(crate) static CRLF: &[u8; 2] = b"\r\n";

/// Arrays nested deeper than this are rejected instead of recursing further.
pub const MAX_DEPTH: usize = 128;

const NULL_BULK_STRING: &[u8; 5] = b"$-1\r\n";
const DEFAULT_ERROR_PREFIX: &str = "ERR";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    #[error("protocol error; invalid length header")]
    InvalidLength,
    #[error("simple values cannot contain CR or LF")]
    LineBreak,
    #[error("protocol error; arrays nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    /// Invalid message encoding.
    #[error("{0}")]
    Other(crate::Error),
}

/// A RESP value, either decoded from the wire or produced as a reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Null,
    // RESP2 null bulk string, `$-1\r\n`. Still what most clients expect for a missing value.
    NullBulkString,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    BigNumber(BigInt),
    Simple(SimpleString),
    Bulk(Bytes),
    Error(SimpleError),
    BulkError(BulkError),
    Array(Vec<Frame>),
}

/// How in-memory strings are mapped onto the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StringEncoding {
    #[default]
    AlwaysBulk,
    /// Use a simple string whenever the text has no CR or LF.
    PreferSimple,
}

/// Payload of a `+` frame. Never contains CR or LF.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleString(String);

impl SimpleString {
    pub fn new(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        if has_line_break(&s) {
            return Err(Error::LineBreak);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SimpleString {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

/// A `-<prefix> <message>` error. Neither part may contain CR or LF.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleError {
    prefix: String,
    message: String,
}

impl SimpleError {
    pub fn new(prefix: impl Into<String>, message: impl Into<String>) -> Result<Self, Error> {
        let prefix = check_prefix(prefix.into())?;
        let message = message.into();
        if has_line_break(&message) {
            return Err(Error::LineBreak);
        }
        Ok(Self { prefix, message })
    }

    /// An `ERR` error. Line breaks in `message` are replaced by spaces, which makes this safe to
    /// use with text that echoes client input.
    pub fn sanitized(message: &str) -> Self {
        Self {
            prefix: DEFAULT_ERROR_PREFIX.to_string(),
            message: message.replace(['\r', '\n'], " "),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A `!<length>\r\n<prefix> <message>\r\n` error. The message may hold any text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkError {
    prefix: String,
    message: String,
}

impl BulkError {
    pub fn new(prefix: impl Into<String>, message: impl Into<String>) -> Result<Self, Error> {
        let prefix = check_prefix(prefix.into())?;
        Ok(Self {
            prefix,
            message: message.into(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Builds a string reply following `encoding`.
    pub fn string(s: &str, encoding: StringEncoding) -> Frame {
        match encoding {
            StringEncoding::PreferSimple if !has_line_break(s) => {
                Frame::Simple(SimpleString(s.to_string()))
            }
            _ => Frame::Bulk(Bytes::copy_from_slice(s.as_bytes())),
        }
    }

    /// Decodes the first value in `src`, returning it along with the number of bytes it spans.
    /// Bytes after that value are never looked at.
    pub fn decode(src: &[u8]) -> Result<(Frame, usize), Error> {
        decode_nested(src, 0)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Null => {
                dst.put_u8(u8::from(DataType::Null));
                dst.put_slice(CRLF);
            }
            Frame::NullBulkString => dst.put_slice(NULL_BULK_STRING),
            Frame::Boolean(b) => {
                dst.put_u8(u8::from(DataType::Boolean));
                dst.put_u8(if *b { b't' } else { b'f' });
                dst.put_slice(CRLF);
            }
            Frame::Integer(i) => put_line(dst, DataType::Integer, i.to_string().as_bytes()),
            Frame::Double(d) => put_line(dst, DataType::Double, format_double(*d).as_bytes()),
            Frame::BigNumber(n) => put_line(dst, DataType::BigNumber, n.to_string().as_bytes()),
            Frame::Simple(s) => put_line(dst, DataType::SimpleString, s.as_str().as_bytes()),
            Frame::Bulk(bytes) => put_bulk(dst, DataType::BulkString, bytes),
            Frame::Error(e) => {
                let text = format!("{} {}", e.prefix, e.message);
                put_line(dst, DataType::SimpleError, text.as_bytes());
            }
            Frame::BulkError(e) => {
                let text = format!("{} {}", e.prefix, e.message);
                put_bulk(dst, DataType::BulkError, text.as_bytes());
            }
            Frame::Array(arr) => {
                put_line(dst, DataType::Array, arr.len().to_string().as_bytes());
                for frame in arr {
                    frame.encode(dst);
                }
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes);
        bytes.to_vec()
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::string(s, StringEncoding::default())
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::from(s.as_str())
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Frame::Bulk(bytes)
    }
}

impl From<i64> for Frame {
    fn from(i: i64) -> Self {
        Frame::Integer(i)
    }
}

macro_rules! integer_frame_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Frame {
                fn from(i: $t) -> Self {
                    Frame::Integer(i64::from(i))
                }
            }
        )*
    };
}

integer_frame_from!(i8, i16, i32, u8, u16, u32);

macro_rules! integer_frame_try_from {
    ($($t:ty),*) => {
        $(
            impl TryFrom<$t> for Frame {
                type Error = Error;

                fn try_from(i: $t) -> Result<Self, <Frame as TryFrom<$t>>::Error> {
                    i64::try_from(i)
                        .map(Frame::Integer)
                        .map_err(|_| Error::from("integer does not fit in a signed 64-bit frame"))
                }
            }
        )*
    };
}

integer_frame_try_from!(u64, usize, i128, u128, isize);

impl From<f64> for Frame {
    fn from(d: f64) -> Self {
        Frame::Double(d)
    }
}

impl From<bool> for Frame {
    fn from(b: bool) -> Self {
        Frame::Boolean(b)
    }
}

impl From<BigInt> for Frame {
    fn from(n: BigInt) -> Self {
        Frame::BigNumber(n)
    }
}

impl From<SimpleError> for Frame {
    fn from(e: SimpleError) -> Self {
        Frame::Error(e)
    }
}

impl From<BulkError> for Frame {
    fn from(e: BulkError) -> Self {
        Frame::BulkError(e)
    }
}

impl<T: Into<Frame>> From<Vec<T>> for Frame {
    fn from(values: Vec<T>) -> Self {
        Frame::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Frame>> From<Option<T>> for Frame {
    fn from(value: Option<T>) -> Self {
        value.map_or(Frame::Null, Into::into)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Null => write!(f, "_"),
            Frame::NullBulkString => write!(f, "$-1"),
            Frame::Boolean(b) => write!(f, "#{}", if *b { 't' } else { 'f' }),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Double(d) => write!(f, ",{}", format_double(*d)),
            Frame::BigNumber(n) => write!(f, "({}", n),
            Frame::Simple(s) => write!(f, "+{}", s.as_str()),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Error(e) => write!(f, "-{} {}", e.prefix, e.message),
            Frame::BulkError(e) => write!(f, "!{} {}", e.prefix, e.message),
            Frame::Array(arr) => {
                write!(f, "*{}[", arr.len())?;
                for (i, frame) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", frame)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// How a data type delimits its payload on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Payload runs up to the first CRLF.
    Simple,
    /// Header carries the payload length in bytes.
    Bulk,
    /// Header carries the number of nested elements.
    Aggregate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Null,         // '_'
    Boolean,      // '#'
    SimpleString, // '+'
    BulkString,   // '$'
    Integer,      // ':'
    Double,       // ','
    BigNumber,    // '('
    Array,        // '*'
    SimpleError,  // '-'
    BulkError,    // '!'
}

impl DataType {
    pub fn shape(self) -> Shape {
        match self {
            DataType::BulkString | DataType::BulkError => Shape::Bulk,
            DataType::Array => Shape::Aggregate,
            _ => Shape::Simple,
        }
    }

    /// Number of bytes one instance of this type occupies at the start of `src`, tag and
    /// trailing CRLF included. For arrays only the header line is counted.
    pub fn length(self, src: &[u8]) -> Result<usize, Error> {
        let line = line_end(src)?;
        let header = line + CRLF.len();

        match self.shape() {
            Shape::Simple | Shape::Aggregate => Ok(header),
            Shape::Bulk => match parse_length(&src[1..line])? {
                Some(len) => {
                    let total = header
                        .checked_add(len)
                        .and_then(|n| n.checked_add(CRLF.len()))
                        .ok_or(Error::InvalidLength)?;
                    if src.len() < total {
                        return Err(Error::Incomplete);
                    }
                    Ok(total)
                }
                None if self == DataType::BulkString => Ok(header),
                None => Err(Error::InvalidLength),
            },
        }
    }

    /// Decodes `src`, which must hold exactly one instance of this type and nothing else.
    pub fn decode(self, src: &[u8]) -> Result<Frame, Error> {
        if src.first().copied() != Some(u8::from(self)) {
            return Err("protocol error; frame does not start with its type tag".into());
        }

        if self == DataType::Array {
            let (frame, consumed) = Frame::decode(src)?;
            if consumed != src.len() {
                return Err("protocol error; trailing bytes after array".into());
            }
            return Ok(frame);
        }

        if src.len() < 1 + CRLF.len() || !src.ends_with(CRLF) {
            return Err(Error::Incomplete);
        }
        let line = line_end(src)?;
        let body = &src[1..line];

        match self {
            DataType::Null if body.is_empty() && line + CRLF.len() == src.len() => Ok(Frame::Null),
            DataType::Null => Err("protocol error; null frame carries data".into()),
            DataType::Boolean => match body {
                b"t" => Ok(Frame::Boolean(true)),
                b"f" => Ok(Frame::Boolean(false)),
                _ => Err("protocol error; invalid boolean".into()),
            },
            DataType::SimpleString => {
                let string = String::from_utf8(single_line(src, line)?.to_vec())?;
                Ok(Frame::Simple(SimpleString::new(string)?))
            }
            DataType::SimpleError => {
                let text = String::from_utf8(single_line(src, line)?.to_vec())?;
                let (prefix, message) = split_error(&text);
                Ok(Frame::Error(SimpleError::new(prefix, message)?))
            }
            DataType::Integer => {
                let integer = str::from_utf8(single_line(src, line)?)
                    .map_err(|_| Error::from("protocol error; invalid frame format"))?
                    .parse::<i64>()
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
                    .map_err(Error::Other)?;
                Ok(Frame::Integer(integer))
            }
            DataType::Double => {
                let double = match single_line(src, line)? {
                    b"inf" => f64::INFINITY,
                    b"-inf" => f64::NEG_INFINITY,
                    b"nan" => f64::NAN,
                    digits => str::from_utf8(digits)
                        .map_err(|_| Error::from("protocol error; invalid frame format"))?
                        .parse::<f64>()
                        .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
                        .map_err(Error::Other)?,
                };
                Ok(Frame::Double(double))
            }
            DataType::BigNumber => {
                let number = str::from_utf8(single_line(src, line)?)
                    .map_err(|_| Error::from("protocol error; invalid frame format"))?;
                let number = BigInt::from_str(number)
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
                    .map_err(Error::Other)?;
                Ok(Frame::BigNumber(number))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => match bulk_payload(src, line)? {
                Some(data) => Ok(Frame::Bulk(Bytes::copy_from_slice(data))),
                None => Ok(Frame::NullBulkString),
            },
            // !<length>\r\n<error>\r\n
            DataType::BulkError => {
                let data = bulk_payload(src, line)?.ok_or(Error::InvalidLength)?;
                let text = String::from_utf8(data.to_vec())?;
                let (prefix, message) = split_error(&text);
                Ok(Frame::BulkError(BulkError::new(prefix, message)?))
            }
            DataType::Array => unreachable!("arrays are decoded above"),
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'_' => Ok(Self::Null),
            b'#' => Ok(Self::Boolean),
            b'+' => Ok(Self::SimpleString),
            b'$' => Ok(Self::BulkString),
            b':' => Ok(Self::Integer),
            b',' => Ok(Self::Double),
            b'(' => Ok(Self::BigNumber),
            b'*' => Ok(Self::Array),
            b'-' => Ok(Self::SimpleError),
            b'!' => Ok(Self::BulkError),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Null => b'_',
            DataType::Boolean => b'#',
            DataType::SimpleString => b'+',
            DataType::BulkString => b'$',
            DataType::Integer => b':',
            DataType::Double => b',',
            DataType::BigNumber => b'(',
            DataType::Array => b'*',
            DataType::SimpleError => b'-',
            DataType::BulkError => b'!',
        }
    }
}

/// Skips one entity at the start of `src` without materializing it, returning the number of
/// bytes it spans. Unknown tags are skipped up to the end of their line.
pub fn skip_entity(src: &[u8]) -> Result<usize, Error> {
    skip_nested(src, 0)
}

fn skip_nested(src: &[u8], depth: usize) -> Result<usize, Error> {
    let first_byte = *src.first().ok_or(Error::Incomplete)?;

    match DataType::try_from(first_byte) {
        Ok(DataType::Array) => {
            if depth >= MAX_DEPTH {
                return Err(Error::TooDeep);
            }
            let line = line_end(src)?;
            let mut consumed = line + CRLF.len();
            let count = parse_length(&src[1..line])?.unwrap_or(0);
            for _ in 0..count {
                consumed += skip_nested(&src[consumed..], depth + 1)?;
            }
            Ok(consumed)
        }
        Ok(data_type) => data_type.length(src),
        Err(_) => Ok(line_end(src)? + CRLF.len()),
    }
}

fn decode_nested(src: &[u8], depth: usize) -> Result<(Frame, usize), Error> {
    // The first byte in an RESP-serialized payload always identifies its type.
    // Subsequent bytes constitute the type's contents.
    let first_byte = *src.first().ok_or(Error::Incomplete)?;
    let data_type = DataType::try_from(first_byte)?;

    if data_type != DataType::Array {
        let len = data_type.length(src)?;
        return Ok((data_type.decode(&src[..len])?, len));
    }

    // *<number-of-elements>\r\n<element-1>...<element-n>
    if depth >= MAX_DEPTH {
        return Err(Error::TooDeep);
    }

    let line = line_end(src)?;
    let mut consumed = line + CRLF.len();
    let count = match parse_length(&src[1..line])? {
        Some(count) => count,
        None => return Ok((Frame::Null, consumed)),
    };

    // The header is untrusted, don't let it size the allocation on its own.
    let mut frames = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (frame, len) = decode_nested(&src[consumed..], depth + 1)?;
        frames.push(frame);
        consumed += len;
    }

    Ok((Frame::Array(frames), consumed))
}

/// Index of the CR of the first CRLF after the tag byte.
pub(crate) fn line_end(src: &[u8]) -> Result<usize, Error> {
    src.get(1..)
        .and_then(|rest| rest.windows(2).position(|window| window == CRLF))
        .map(|index| index + 1)
        .ok_or(Error::Incomplete)
}

/// Parses a length or count header. `-1` is the null marker and yields `None`.
pub(crate) fn parse_length(digits: &[u8]) -> Result<Option<usize>, Error> {
    if digits == b"-1" {
        return Ok(None);
    }
    if digits.is_empty() {
        return Err(Error::InvalidLength);
    }

    digits
        .iter()
        .try_fold(0usize, |len, &byte| {
            if !byte.is_ascii_digit() {
                return None;
            }
            len.checked_mul(10)?.checked_add(usize::from(byte - b'0'))
        })
        .map(Some)
        .ok_or(Error::InvalidLength)
}

fn single_line(src: &[u8], line: usize) -> Result<&[u8], Error> {
    if line + CRLF.len() != src.len() {
        return Err(Error::LineBreak);
    }
    Ok(&src[1..line])
}

fn bulk_payload(src: &[u8], line: usize) -> Result<Option<&[u8]>, Error> {
    let start = line + CRLF.len();
    match parse_length(&src[1..line])? {
        None if start == src.len() => Ok(None),
        Some(len)
            if start
                .checked_add(len)
                .and_then(|end| end.checked_add(CRLF.len()))
                == Some(src.len()) =>
        {
            Ok(Some(&src[start..start + len]))
        }
        _ => Err(Error::InvalidLength),
    }
}

fn split_error(text: &str) -> (&str, &str) {
    text.split_once(' ').unwrap_or((text, ""))
}

fn check_prefix(prefix: String) -> Result<String, Error> {
    if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
        return Err("error prefix must be a single non-empty word".into());
    }
    Ok(prefix)
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n'])
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d == f64::INFINITY {
        "inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        d.to_string()
    }
}

fn put_line(dst: &mut BytesMut, data_type: DataType, body: &[u8]) {
    dst.reserve(1 + body.len() + CRLF.len());
    dst.put_u8(u8::from(data_type));
    dst.put_slice(body);
    dst.put_slice(CRLF);
}

fn put_bulk(dst: &mut BytesMut, data_type: DataType, payload: &[u8]) {
    put_line(dst, data_type, payload.len().to_string().as_bytes());
    dst.reserve(payload.len() + CRLF.len());
    dst.put_slice(payload);
    dst.put_slice(CRLF);
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}
