//! fastami is a fast, ergonomic and correct implementation of the two asterisk
//! wire protocols: a FastAGI server and an AMI client.
//!
//! fastami requires the use of tokio. Executor independence is currently not a goal.
//!
//! # FastAGI
//!
//! Asterisk dials out to us (`AGI(agi://127.0.0.1:4573/...)` in the dialplan),
//! dumps the environment of the call and then waits for commands. To get
//! started, consider this "Hello World" example:
//! ```ignore
//! use fastami::{serve, AGIError, CallHandler, Connection};
//! use tokio::net::TcpListener;
//!
//! #[derive(Debug)]
//! struct HelloCall;
//!
//! #[async_trait::async_trait]
//! impl CallHandler for HelloCall {
//!     async fn start_call(&self, agi: &Connection) -> Result<(), AGIError> {
//!         agi.answer().await?;
//!         agi.stream_file("tt-monkeys", "", 0).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("0.0.0.0:4573").await?;
//!     serve::serve(listener, HelloCall).await?;
//!     Ok(())
//! }
//! ```
//!
//! A [`CallHandler`] is invoked exactly once per incoming call, with a
//! [`Connection`] that exposes every AGI command as an async method. Commands
//! may be pipelined: replies are matched to commands in send order.
//!
//! # AMI
//!
//! The manager interface is the opposite direction: we dial the PBX and keep a
//! long-lived control connection. See [`ami`] for the client and
//! [`ami::connect`] for the login dance.
pub mod agiurl;
pub mod ami;
pub mod command;
pub mod connection;
pub(crate) mod framer;
pub mod handler;
pub mod serve;

pub use agiurl::AGIUrl;
pub use command::{ChannelStatus, Command};
pub use connection::{Connection, SessionEnv};
pub use handler::CallHandler;

/// Contains all the ways in which serving a FastAGI request can fail.
#[derive(Debug)]
pub enum AGIError {
    /// Handlers may use this to bubble up errors if they want.
    InnerError(Box<dyn std::error::Error + Send + Sync>),
    /// An AGI reply classified as failure by the command catalogue, or a
    /// non-200 status line. The [`Command`] is present in the catalogue case.
    CommandFailure {
        code: u16,
        message: String,
        command: Option<Command>,
    },
    /// `WAIT FOR DIGIT` ran out of time before a digit was pressed.
    CommandTimeout(Command),
    /// A media command reported success with `endpos=0`: the file could not be
    /// opened.
    FailureOnOpen(Command),
    /// A date-typed argument could not be expressed as epoch seconds.
    UndefinedTimeFormat(String),
    /// The connection closed while commands were outstanding.
    ConnectionTerminated,
    /// Unable to send a command.
    CannotSendCommand(tokio::io::Error),
    /// Unable to accept connections on the TCP listener.
    CannotSpawnListener,
    /// Unable to parse an incoming packet.
    ParseError(AGIParseError),
}
impl std::fmt::Display for AGIError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::InnerError(x) => {
                write!(f, "InnerError: {x}")
            }
            Self::CommandFailure {
                code,
                message,
                command,
            } => match command {
                Some(c) => {
                    write!(f, "Command {} failed: {code} {message}", c.name)
                }
                None => {
                    write!(f, "Command failed: {code} {message}")
                }
            },
            Self::CommandTimeout(x) => {
                write!(f, "Command {} timed out waiting for a digit", x.name)
            }
            Self::FailureOnOpen(x) => {
                write!(f, "Command {} was unable to open its file", x.name)
            }
            Self::UndefinedTimeFormat(x) => {
                write!(f, "The value {x} is not expressible as epoch seconds")
            }
            Self::ConnectionTerminated => {
                write!(f, "FastAGI connection terminated")
            }
            Self::CannotSendCommand(x) => {
                write!(f, "Unable to send an AGI command: {x}")
            }
            Self::CannotSpawnListener => {
                write!(f, "Unable to accept on the TCP listener")
            }
            Self::ParseError(x) => {
                write!(f, "Unable to parse packet: {x}")
            }
        }
    }
}
impl std::error::Error for AGIError {}

/// The common error type for all problems related to parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AGIParseError {
    /// A packet contained non-utf8 codepoints.
    NotUtf8,
    /// An environment line contained no value.
    NoValue(String),
    /// A value was not parsable as an AGI request URL.
    UrlUnparsable(String),
    /// A result expected to be a DTMF ASCII code was not one.
    DtmfUnparsable(String),
}
impl std::fmt::Display for AGIParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotUtf8 => {
                write!(f, "The input is not utf8")
            }
            Self::NoValue(x) => {
                write!(f, "The line {x} contained no value.")
            }
            Self::UrlUnparsable(x) => {
                write!(f, "The value {x} is not parsable as an AGI request URL.")
            }
            Self::DtmfUnparsable(x) => {
                write!(f, "The result {x} is not a DTMF ASCII code.")
            }
        }
    }
}
impl std::error::Error for AGIParseError {}
