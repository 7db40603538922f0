//! Line protocol: command classification and replies.
//!
//! Every trimmed message maps to exactly one [`Command`]:
//! - Keywords: `hello`, `bye` (exact match)
//! - Slash-commands: `/time`, `/quit`, `/echo <text>`, anything else is unknown
//! - Empty lines and plain text
//!
//! [`Command::dispatch`] is pure: it takes the clock reading as input and
//! returns the reply, the next session state and the text to record, if any.

use chrono::{DateTime, Local};
use std::borrow::Cow;

/// `strftime` pattern used by `/time`, e.g. `Mon Jan 2 15:04:05 2006`.
pub const TIME_FORMAT: &str = "%a %b %-d %H:%M:%S %Y";

pub const REPLY_EMPTY: &str = "Say something...";
pub const REPLY_HELLO: &str = "Hi there!";
pub const REPLY_BYE: &str = "Goodbye!";
pub const REPLY_QUIT: &str = "Closing connection...";
pub const REPLY_ECHO_MISSING: &str = "Error: Missing message for /echo";
pub const REPLY_UNKNOWN: &str = "Error: Unknown command";
pub const REPLY_TOO_LONG: &str = "Error: message too long";

/// Parsed client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Blank line
    Empty,
    /// `hello`
    Hello,
    /// `bye`
    Bye,
    /// `/time`
    Time,
    /// `/quit`
    Quit,
    /// `/echo` and the whitespace-separated words after it
    Echo { args: Vec<&'a str> },
    /// Slash-prefixed token that is not a known command
    Unknown { name: &'a str },
    /// Anything else
    Text(&'a str),
}

/// Session state after a message has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Keep reading.
    Reading,
    /// Close the connection once the reply is sent.
    Closed,
}

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<'a> {
    /// Reply line, without the trailing newline.
    pub reply: Cow<'a, str>,
    pub state: State,
    /// Text to append to the client's log, set for plain text only.
    pub record: Option<&'a str>,
}

impl<'a> Outcome<'a> {
    fn reply(reply: impl Into<Cow<'a, str>>) -> Self {
        Self {
            reply: reply.into(),
            state: State::Reading,
            record: None,
        }
    }

    fn close(reply: &'a str) -> Self {
        Self {
            reply: Cow::Borrowed(reply),
            state: State::Closed,
            record: None,
        }
    }
}

impl<'a> Command<'a> {
    /// Classify an already trimmed message.
    pub fn parse(message: &'a str) -> Self {
        match message {
            "" => return Command::Empty,
            "hello" => return Command::Hello,
            "bye" => return Command::Bye,
            _ => {}
        }

        if !message.starts_with('/') {
            return Command::Text(message);
        }

        let mut fields = message.split_whitespace();
        // A trimmed message starting with '/' has at least one field
        let name = fields.next().unwrap_or(message);

        match name {
            "/time" => Command::Time,
            "/quit" => Command::Quit,
            "/echo" => Command::Echo {
                args: fields.collect(),
            },
            _ => Command::Unknown { name },
        }
    }

    /// Produce the reply and next state for this command.
    pub fn dispatch(&self, now: DateTime<Local>) -> Outcome<'a> {
        match self {
            Command::Empty => Outcome::reply(REPLY_EMPTY),
            Command::Hello => Outcome::reply(REPLY_HELLO),
            Command::Bye => Outcome::close(REPLY_BYE),
            Command::Time => Outcome::reply(now.format(TIME_FORMAT).to_string()),
            Command::Quit => Outcome::close(REPLY_QUIT),
            Command::Echo { args } if args.is_empty() => Outcome::reply(REPLY_ECHO_MISSING),
            Command::Echo { args } => Outcome::reply(args.join(" ")),
            Command::Unknown { .. } => Outcome::reply(REPLY_UNKNOWN),
            Command::Text(text) => Outcome {
                reply: Cow::Borrowed(*text),
                state: State::Reading,
                record: Some(*text),
            },
        }
    }
}

/// Whether a trimmed message is within the accepted length.
///
/// Length is counted in characters, not bytes.
pub fn within_limit(message: &str, max_len: usize) -> bool {
    // Fast path: byte length bounds character count from above
    message.len() <= max_len || message.chars().count() <= max_len
}
