//! Session handler: one accepted connection from first read to close.
//!
//! The loop is strictly sequential. Each iteration arms a fresh idle
//! deadline, reads one newline-terminated line, applies the length cap,
//! dispatches the command and writes a single reply line.

use crate::config::Config;
use crate::protocol::{self, Command, State};
use crate::sink::{LogSink, SinkError};
use bytes::BytesMut;
use chrono::Local;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, trace, warn};

/// Per-session limits, shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_message_len: usize,
    pub max_line_bytes: usize,
    pub log_dir: PathBuf,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            max_message_len: config.max_message_len,
            max_line_bytes: config.max_line_bytes,
            log_dir: config.log_dir.clone(),
        }
    }
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// No complete line within the idle deadline.
    Idle,
    /// Peer closed its write half.
    PeerClosed,
    /// Client sent `bye`.
    Bye,
    /// Client sent `/quit`.
    Quit,
}

/// Session failures. Both are local to the session.
#[derive(Debug)]
pub enum SessionError {
    /// The log sink could not be opened; no data was read.
    Sink(SinkError),
    /// Reading from the connection failed.
    Read(io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Sink(e) => write!(f, "{e}"),
            SessionError::Read(e) => write!(f, "read failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Sink(e) => Some(e),
            SessionError::Read(e) => Some(e),
        }
    }
}

impl From<SinkError> for SessionError {
    fn from(e: SinkError) -> Self {
        SessionError::Sink(e)
    }
}

/// One line read off the connection.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// The whole line is in the buffer, minus leading whitespace.
    Line,
    /// The line ran past the buffer bound with non-whitespace content.
    Overflow,
}

/// Run the protocol on `stream` until a terminal condition.
///
/// The stream and the log sink are dropped, and therefore closed, on every
/// return path.
///
/// Lines are decoded lossily: invalid UTF-8 is replaced with U+FFFD before
/// dispatch, so a plain-text echo of such a line does not return the bytes
/// the client sent, and the log record carries the replaced text too.
pub async fn handle_session<S>(
    stream: S,
    peer: SocketAddr,
    settings: &SessionSettings,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sink = match LogSink::open(&settings.log_dir, peer.ip()).await {
        Ok(sink) => sink,
        Err(e) => {
            error!(peer = %peer, error = %e, "Could not open client log, dropping connection");
            return Err(e.into());
        }
    };
    debug!(peer = %peer, path = %sink.path().display(), "Client log opened");

    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = BytesMut::with_capacity(1024);

    let result = loop {
        let read = tokio::time::timeout(
            settings.idle_timeout,
            read_frame(&mut reader, &mut line, settings.max_line_bytes),
        )
        .await;

        let frame = match read {
            Err(_elapsed) => {
                info!(peer = %peer, "Client disconnected due to inactivity");
                break Ok(SessionEnd::Idle);
            }
            Ok(Ok(None)) => {
                info!(peer = %peer, "Client disconnected");
                break Ok(SessionEnd::PeerClosed);
            }
            Ok(Err(e)) => {
                error!(peer = %peer, error = %e, "Error reading from client");
                break Err(SessionError::Read(e));
            }
            Ok(Ok(Some(frame))) => frame,
        };

        let text = String::from_utf8_lossy(&line);
        let message = text.trim();

        if frame == Frame::Overflow || !protocol::within_limit(message, settings.max_message_len)
        {
            send(&mut writer, peer, protocol::REPLY_TOO_LONG).await;
            warn!(peer = %peer, "Client sent an oversized message, rejected");
            continue;
        }

        let command = Command::parse(message);
        trace!(peer = %peer, ?command, "Processing message");

        let outcome = command.dispatch(Local::now());
        send(&mut writer, peer, &outcome.reply).await;

        if let Some(record) = outcome.record {
            if let Err(e) = sink.append(record).await {
                warn!(peer = %peer, error = %e, "Failed to append to client log");
            }
        }

        if outcome.state == State::Closed {
            let end = match command {
                Command::Bye => SessionEnd::Bye,
                _ => SessionEnd::Quit,
            };
            info!(peer = %peer, command = message, "Client closed the session");
            break Ok(end);
        }
    };

    if let Err(e) = writer.shutdown().await {
        trace!(peer = %peer, error = %e, "Shutdown after session end failed");
    }

    result
}

/// Write one reply line. Failures are logged, never propagated.
async fn send<W>(writer: &mut W, peer: SocketAddr, reply: &str)
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(reply.len() + 1);
    out.extend_from_slice(reply.as_bytes());
    out.push(b'\n');

    if let Err(e) = writer.write_all(&out).await {
        warn!(peer = %peer, error = %e, "Error writing to client");
    }
}

/// Read the next `\n`-terminated line into `buf`.
///
/// Leading whitespace is skipped and at most `limit` bytes are kept.
/// Bytes past `limit` are discarded up to the newline; if any of them is not
/// whitespace the frame is an [`Frame::Overflow`]. Whitespace is judged per
/// UTF-8 character, so it matches `str::trim`. Returns `None` at end of
/// stream, discarding any unterminated partial line.
async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut, limit: usize) -> io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut scan = LineScan::new(limit);

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(None);
        }

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };
        let used = chunk.len();

        scan.feed(buf, chunk);
        reader.consume(used);

        if done {
            return Ok(Some(scan.finish()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Skipping whitespace before the first character of content.
    Leading,
    /// Copying bytes into the line buffer.
    Keeping,
    /// Buffer is full; only checking the rest for non-whitespace.
    Spilling,
}

/// Per-line state of [`read_frame`].
///
/// `carry` holds a UTF-8 sequence cut by a chunk or buffer boundary so it is
/// classified once its remaining bytes arrive.
#[derive(Debug)]
struct LineScan {
    limit: usize,
    phase: Phase,
    carry: Vec<u8>,
    overflow: bool,
}

impl LineScan {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            phase: Phase::Leading,
            carry: Vec::new(),
            overflow: false,
        }
    }

    fn feed(&mut self, buf: &mut BytesMut, bytes: &[u8]) {
        match self.phase {
            Phase::Leading => {
                let data = self.take_carry(bytes);
                match first_non_whitespace(&data) {
                    Scan::Found(at) => {
                        self.phase = Phase::Keeping;
                        self.keep(buf, &data[at..]);
                    }
                    Scan::Incomplete(at) => self.carry = data[at..].to_vec(),
                    Scan::Whitespace => {}
                }
            }
            Phase::Keeping => self.keep(buf, bytes),
            Phase::Spilling => self.spill(bytes),
        }
    }

    fn keep(&mut self, buf: &mut BytesMut, bytes: &[u8]) {
        let room = self.limit.saturating_sub(buf.len());
        if bytes.len() <= room {
            buf.extend_from_slice(bytes);
            return;
        }

        let (fits, rest) = bytes.split_at(room);
        buf.extend_from_slice(fits);
        // A character cut by the bound is classified with the spill
        let cut = buf.len() - incomplete_tail(buf);
        self.carry = buf.split_off(cut).to_vec();
        self.phase = Phase::Spilling;
        self.spill(rest);
    }

    fn spill(&mut self, bytes: &[u8]) {
        if self.overflow {
            return;
        }
        let data = self.take_carry(bytes);
        match first_non_whitespace(&data) {
            Scan::Found(_) => self.overflow = true,
            Scan::Incomplete(at) => self.carry = data[at..].to_vec(),
            Scan::Whitespace => {}
        }
    }

    fn take_carry(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);
        data
    }

    fn finish(self) -> Frame {
        if self.overflow {
            Frame::Overflow
        } else {
            Frame::Line
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Byte offset of the first non-whitespace character.
    Found(usize),
    /// All whitespace up to a trailing partial character at this offset.
    Incomplete(usize),
    /// All whitespace.
    Whitespace,
}

/// Find the first character of `data` that is not whitespace.
///
/// Invalid UTF-8 counts as content.
fn first_non_whitespace(data: &[u8]) -> Scan {
    let complete = data.len() - incomplete_tail(data);
    let mut offset = 0;

    for chunk in data[..complete].utf8_chunks() {
        let valid = chunk.valid();
        if let Some((i, _)) = valid.char_indices().find(|(_, c)| !c.is_whitespace()) {
            return Scan::Found(offset + i);
        }
        offset += valid.len();
        if !chunk.invalid().is_empty() {
            return Scan::Found(offset);
        }
    }

    if complete < data.len() {
        Scan::Incomplete(complete)
    } else {
        Scan::Whitespace
    }
}

/// Number of trailing bytes that start a UTF-8 sequence but do not finish it.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        // Skip continuation bytes until the lead byte
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
