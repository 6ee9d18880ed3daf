//! Incoming SMTP byte stream splitter
//!
//! [`StreamParser`] is a sans-IO parser: the connection feeds it raw socket
//! bytes and pulls [`StreamEvent`]s out one at a time.
//!
//! In command mode the input is split into lines (CRLF or bare LF). After
//! [`StreamParser::start_data_mode`] the input is treated as an RFC 5321
//! message body: leading escape dots are removed and `CRLF . CRLF` ends the
//! data. Once the body has ended the parser is paused and yields nothing
//! until [`StreamParser::resume`] is called, so pipelined commands that
//! arrived together with the body are only interpreted after the message
//! has been handed off.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Something the parser recognised in the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete command line without its line ending
    Command(Bytes),
    /// Unescaped message body bytes
    Data(Bytes),
    /// The terminating `.` line was seen
    DataEnd(DataSummary),
}

/// Totals for a finished message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSummary {
    pub byte_length: usize,
    pub size_exceeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStart {
    No,
    AfterLf,
    AfterCrLf,
}

#[derive(Debug)]
struct DataState {
    max_bytes: Option<usize>,
    bytes: usize,
    line_start: LineStart,
    prev_cr: bool,
}

#[derive(Debug)]
enum Mode {
    Command,
    Data(DataState),
    Paused,
}

#[derive(Debug)]
pub struct StreamParser {
    buffer: BytesMut,
    mode: Mode,
    pending: VecDeque<StreamEvent>,
    eof: bool,
    closed: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            mode: Mode::Command,
            pending: VecDeque::new(),
            eof: false,
            closed: false,
        }
    }

    /// Append freshly read bytes. Ignored once the parser is closed.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.closed || chunk.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Switch to data mode. `max_bytes` only sets the "exceeded" flag of the
    /// final [`DataSummary`]; nothing is truncated.
    pub fn start_data_mode(&mut self, max_bytes: Option<usize>) {
        self.mode = Mode::Data(DataState {
            max_bytes,
            bytes: 0,
            line_start: LineStart::AfterCrLf,
            prev_cr: false,
        });
    }

    /// Return to command mode after a finished message body
    pub fn resume(&mut self) {
        if matches!(self.mode, Mode::Paused) {
            self.mode = Mode::Command;
        }
    }

    /// Mark end of input; a trailing partial command line is flushed once
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Drop everything buffered but not yet parsed
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }

    /// Stop accepting input for good
    pub fn close(&mut self) {
        self.closed = true;
        self.clear();
    }

    pub fn is_data_mode(&self) -> bool {
        matches!(self.mode, Mode::Data(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.mode, Mode::Paused)
    }

    /// Number of bytes waiting to be parsed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.closed {
            return None;
        }

        match self.mode {
            Mode::Command => self.next_command(),
            Mode::Data(_) => self.next_data(),
            Mode::Paused => None,
        }
    }

    fn next_command(&mut self) -> Option<StreamEvent> {
        if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            return Some(StreamEvent::Command(line.freeze()));
        }

        if self.eof && !self.buffer.is_empty() {
            let line = self.buffer.split().freeze();
            return Some(StreamEvent::Command(line));
        }

        None
    }

    fn next_data(&mut self) -> Option<StreamEvent> {
        let Mode::Data(state) = &mut self.mode else {
            return None;
        };

        let buf = &self.buffer[..];
        let mut out = Vec::with_capacity(buf.len());
        let mut i = 0;
        let mut ended = false;

        while i < buf.len() {
            let b = buf[i];

            if b == b'.' && state.line_start != LineStart::No {
                let rest = &buf[i + 1..];

                if state.line_start == LineStart::AfterCrLf && rest.starts_with(b"\r\n") {
                    ended = true;
                    break;
                }

                // not enough input yet to classify the dot
                if rest.is_empty() || (state.line_start == LineStart::AfterCrLf && rest == b"\r") {
                    break;
                }

                if rest[0] == b'.' {
                    // escape dot: drop it, the next dot is plain content
                    state.line_start = LineStart::No;
                    state.prev_cr = false;
                    i += 1;
                    continue;
                }
            }

            out.push(b);
            state.line_start = match b {
                b'\n' if state.prev_cr => LineStart::AfterCrLf,
                b'\n' => LineStart::AfterLf,
                _ => LineStart::No,
            };
            state.prev_cr = b == b'\r';
            i += 1;
        }

        state.bytes += out.len();
        let consumed = if ended { i + 3 } else { i };

        let summary = DataSummary {
            byte_length: state.bytes,
            size_exceeded: state.max_bytes.map_or(false, |max| state.bytes > max),
        };

        self.buffer.advance(consumed);

        let data = (!out.is_empty()).then(|| StreamEvent::Data(Bytes::from(out)));

        if ended {
            self.mode = Mode::Paused;
            self.pending.push_back(StreamEvent::DataEnd(summary));
            return match data {
                Some(event) => Some(event),
                None => self.pending.pop_front(),
            };
        }

        data
    }
}
