pub mod echo;
pub mod executable;
pub mod get;
pub mod ping;
pub mod set;

use bytes::Bytes;
use std::{str, vec};
use thiserror::Error as ThisError;
use tracing::{debug, error};

use crate::commands::executable::Executable;
use crate::frame::{Frame, SimpleError};
use crate::request::Request;
use crate::store::Store;
use crate::Error;

use echo::Echo;
use get::Get;
use ping::Ping;
use set::Set;

#[derive(Debug, PartialEq)]
pub enum Command {
    Get(Get),
    Set(Set),

    Echo(Echo),
    Ping(Ping),
}

impl Executable for Command {
    fn exec(self, store: Store) -> Result<Frame, Error> {
        match self {
            Command::Echo(cmd) => cmd.exec(store),
            Command::Get(cmd) => cmd.exec(store),
            Command::Ping(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Request> for Command {
    type Error = CommandParserError;

    fn try_from(request: Request) -> Result<Self, Self::Error> {
        let (name, args) = request.into_parts();

        let mut parser = CommandParser {
            command: name.to_lowercase(),
            parts: args.into_iter(),
        };

        let command = match &name.to_uppercase()[..] {
            "ECHO" => Echo::try_from(&mut parser).map(Command::Echo),
            "GET" => Get::try_from(&mut parser).map(Command::Get),
            "PING" => Ping::try_from(&mut parser).map(Command::Ping),
            "SET" => Set::try_from(&mut parser).map(Command::Set),
            _ => {
                return Err(CommandParserError::UnknownCommand {
                    command: parser.command,
                })
            }
        };

        // Running out of arguments before the command is complete is an arity problem.
        command.map_err(|err| match err {
            CommandParserError::EndOfStream => parser.wrong_arity(),
            err => err,
        })
    }
}

/// Runs one request against the store and returns the reply to send back. Invalid requests are
/// answered with an error reply and never reach the store.
pub fn dispatch(request: Request, store: &Store) -> Frame {
    let cmd = match Command::try_from(request) {
        Ok(cmd) => cmd,
        Err(err) => {
            debug!("Rejected command: {}", err);
            return err.into();
        }
    };

    match cmd.exec(store.clone()) {
        Ok(res) => res,
        Err(err) => {
            // Internal details stay in the logs.
            error!("Command failed: {}", err);
            Frame::Error(SimpleError::sanitized("internal error"))
        }
    }
}

pub struct CommandParser {
    command: String,
    parts: vec::IntoIter<Bytes>,
}

impl CommandParser {
    /// Invalid UTF-8 sequences are replaced, the same way command names are read.
    fn next_string(&mut self) -> Result<String, CommandParserError> {
        let bytes = self.next_bytes()?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn next_integer(&mut self) -> Result<i64, CommandParserError> {
        let bytes = self.next_bytes()?;

        str::from_utf8(&bytes[..])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(CommandParserError::NotAnInteger)
    }

    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        self.parts.next().ok_or(CommandParserError::EndOfStream)
    }

    /// Fails if arguments are left over once the command has read everything it accepts.
    fn finish(&mut self) -> Result<(), CommandParserError> {
        match self.parts.len() {
            0 => Ok(()),
            _ => Err(self.wrong_arity()),
        }
    }

    fn wrong_arity(&self) -> CommandParserError {
        CommandParserError::WrongArity {
            command: self.command.clone(),
        }
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("unknown command '{command}'")]
    UnknownCommand { command: String },
    #[error("wrong number of arguments for '{command}' command")]
    WrongArity { command: String },
    #[error("syntax error")]
    Syntax,
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("attempting to extract a value failed due to the request being fully consumed")]
    EndOfStream,
}

impl From<CommandParserError> for Frame {
    fn from(err: CommandParserError) -> Self {
        Frame::Error(SimpleError::sanitized(&err.to_string()))
    }
}

#[cfg(test)]
pub(crate) fn request(parts: &[&str]) -> Request {
    Request::new(
        parts[0],
        parts[1..]
            .iter()
            .map(|part| Bytes::copy_from_slice(part.as_bytes()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WriteMode;

    #[test]
    fn parse_get_command() {
        let get_command = Command::try_from(request(&["GET", "foo"])).unwrap();

        assert_eq!(
            get_command,
            Command::Get(Get {
                key: String::from("foo")
            })
        );
    }

    #[test]
    fn parse_command_name_case_insensitive() {
        let set_command = Command::try_from(request(&["sEt", "foo", "baz"])).unwrap();

        assert_eq!(
            set_command,
            Command::Set(Set {
                key: String::from("foo"),
                value: Bytes::from("baz"),
                ttl: None,
                mode: WriteMode::Upsert,
            })
        );
    }

    #[test]
    fn unknown_command() {
        let err = Command::try_from(request(&["FLUSHALL", "now"])).unwrap_err();

        assert_eq!(
            err,
            CommandParserError::UnknownCommand {
                command: String::from("flushall")
            }
        );
        assert_eq!(
            Frame::from(err).serialize(),
            b"-ERR unknown command 'flushall'\r\n"
        );
    }

    #[test]
    fn missing_arguments_is_an_arity_error() {
        let err = Command::try_from(request(&["GET"])).unwrap_err();

        assert_eq!(
            Frame::from(err).serialize(),
            b"-ERR wrong number of arguments for 'get' command\r\n"
        );
    }

    #[test]
    fn dispatch_replies_with_errors_instead_of_failing() {
        let store = Store::new();

        let res = dispatch(request(&["ECHO"]), &store);

        assert_eq!(
            res,
            Frame::Error(SimpleError::sanitized(
                "wrong number of arguments for 'echo' command"
            ))
        );
    }

    #[test]
    fn dispatch_runs_commands_against_the_store() {
        let store = Store::new();

        dispatch(request(&["SET", "k", "v"]), &store);
        let res = dispatch(request(&["GET", "k"]), &store);

        assert_eq!(res, Frame::Bulk(Bytes::from("v")));
    }

    #[test]
    fn non_utf8_keys_are_read_lossily() {
        let store = Store::new();
        let key = Bytes::from_static(b"k\xffey");
        let set = Request::new("SET", vec![key.clone(), Bytes::from("v")]);

        assert_eq!(dispatch(set, &store).serialize(), b"+OK\r\n");
        assert_eq!(
            store.get("k\u{FFFD}ey").unwrap(),
            Some(Bytes::from("v"))
        );

        let get = Request::new("GET", vec![key]);
        assert_eq!(dispatch(get, &store), Frame::Bulk(Bytes::from("v")));
    }

    #[test]
    fn error_replies_never_break_lines() {
        let name = "bad\r\nname";
        let res = dispatch(request(&[name]), &Store::new());

        assert_eq!(res.serialize(), b"-ERR unknown command 'bad  name'\r\n");
    }
}
