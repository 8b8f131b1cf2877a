use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::frame::{Frame, StringEncoding};
use crate::store::{SetStatus, Store, WriteMode};
use crate::Error;

/// Set key to hold the string value. If key already holds a value, it is overwritten. Any
/// previous time to live associated with the key is discarded on successful SET operation.
///
/// Options:
/// * `EX seconds` / `PX milliseconds`: set the specified expire time.
/// * `NX`: only set the key if it does not already exist.
/// * `XX`: only set the key if it already exists.
///
/// Ref: <https://redis.io/docs/latest/commands/set/>
#[derive(Debug, PartialEq)]
pub struct Set {
    pub key: String,
    pub value: Bytes,
    /// Time to live in milliseconds.
    pub ttl: Option<u64>,
    pub mode: WriteMode,
}

impl Executable for Set {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        let status = store.set(self.key, self.value, self.ttl, self.mode)?;

        let res = match status {
            SetStatus::Written => Frame::string("OK", StringEncoding::PreferSimple),
            SetStatus::NotWritten => Frame::NullBulkString,
        };

        Ok(res)
    }
}

impl TryFrom<&mut CommandParser> for Set {
    type Error = CommandParserError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        let value = parser.next_bytes()?;

        let mut ttl = None;
        let mut mode = None;

        loop {
            let option = match parser.next_string() {
                Ok(option) => option,
                Err(CommandParserError::EndOfStream) => {
                    break;
                }
                Err(err) => return Err(err),
            };

            match option.to_uppercase().as_str() {
                // TTL options
                "EX" if ttl.is_none() => {
                    let seconds = next_positive(parser)?;
                    let millis = seconds
                        .checked_mul(1000)
                        .ok_or(CommandParserError::NotAnInteger)?;
                    ttl = Some(millis);
                }
                "PX" if ttl.is_none() => {
                    ttl = Some(next_positive(parser)?);
                }

                // Write mode options
                "NX" if mode.is_none() => {
                    mode = Some(WriteMode::OnlyIfAbsent);
                }
                "XX" if mode.is_none() => {
                    mode = Some(WriteMode::OnlyIfPresent);
                }

                // Unexpected or repeated option
                _ => return Err(CommandParserError::Syntax),
            }
        }

        Ok(Self {
            key,
            value,
            ttl,
            mode: mode.unwrap_or_default(),
        })
    }
}

fn next_positive(parser: &mut CommandParser) -> Result<u64, CommandParserError> {
    let value = match parser.next_integer() {
        Ok(value) => value,
        // The option is there, its value is not.
        Err(CommandParserError::EndOfStream) => return Err(CommandParserError::Syntax),
        Err(err) => return Err(err),
    };

    match u64::try_from(value) {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(CommandParserError::NotAnInteger),
    }
}
