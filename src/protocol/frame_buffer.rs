//! Incremental frame decoder.
//!
//! Accumulates transport reads in a `bytes::BytesMut` and yields complete
//! frames as they become available. A state machine tracks progress:
//! - `StartLine`: waiting for the CRLF-terminated first line
//! - `Headers`: collecting header lines until the `End:` sentinel
//! - `Body`: a `Length:` was declared, waiting for that many octets
//!
//! Fragmentation is arbitrary; byte-at-a-time input decodes identically to
//! a single contiguous push. Any [`ParseError`] leaves the stream position
//! unrecoverable and the caller must close the tunnel.

use bytes::{Bytes, BytesMut};

use super::frame::{headers, Frame, StartLine};
use crate::config::{DEFAULT_FRAME_HEADER_MAX, DEFAULT_NON_CHUNKED_BODY_MAX};
use crate::error::ParseError;

/// Frame under construction while headers are still arriving.
#[derive(Debug)]
struct Partial {
    frame: Frame,
    /// Bytes of header block consumed so far, for the `MissingEnd` limit.
    header_bytes: usize,
}

/// Decoder state.
#[derive(Debug)]
enum State {
    /// Waiting for the start line.
    StartLine,
    /// Start line parsed, collecting headers until `End:`.
    Headers(Box<Partial>),
    /// Header block complete, waiting for `total` body octets.
    Body { frame: Box<Frame>, total: usize },
}

/// Buffer for accumulating incoming octets and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    header_max: usize,
    body_max: usize,
}

impl FrameBuffer {
    /// Create a decoder with the recommended limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_FRAME_HEADER_MAX, DEFAULT_NON_CHUNKED_BODY_MAX)
    }

    /// Create a decoder with explicit header-block and body limits.
    pub fn with_limits(header_max: usize, body_max: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::StartLine,
            header_max,
            body_max,
        }
    }

    /// Push octets into the buffer and extract all complete frames.
    ///
    /// Returns the frames completed by this push; an empty vector means
    /// more octets are needed.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ParseError> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Signal end of stream. Errors if the stream stopped mid-frame.
    pub fn finish(&self) -> Result<(), ParseError> {
        match &self.state {
            State::Body { total, .. } => Err(ParseError::BodyTooShort {
                remaining: total.saturating_sub(self.buffer.len()),
            }),
            State::Headers(_) => Err(ParseError::MissingEnd),
            State::StartLine if !self.buffer.is_empty() => Err(ParseError::MissingEnd),
            State::StartLine => Ok(()),
        }
    }

    /// Number of buffered, not-yet-consumed octets.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>, ParseError> {
        loop {
            match &mut self.state {
                State::StartLine => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let text = std::str::from_utf8(&line).map_err(|_| {
                        ParseError::MalformedStartLine("start line is not UTF-8".into())
                    })?;
                    let start = parse_start_line(text)?;
                    self.state = State::Headers(Box::new(Partial {
                        frame: Frame::from_start(start),
                        header_bytes: 0,
                    }));
                }
                State::Headers(_) => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    let State::Headers(partial) = &mut self.state else {
                        unreachable!()
                    };
                    partial.header_bytes += line.len() + 2;
                    if partial.header_bytes > self.header_max {
                        return Err(ParseError::MissingEnd);
                    }
                    let text = std::str::from_utf8(&line)
                        .map_err(|_| ParseError::BadHeader("header is not UTF-8".into()))?;
                    if text == "End:" {
                        let State::Headers(partial) =
                            std::mem::replace(&mut self.state, State::StartLine)
                        else {
                            unreachable!()
                        };
                        match self.finalize_headers(partial.frame)? {
                            Finalized::Complete(frame) => return Ok(Some(frame)),
                            Finalized::NeedsBody { frame, total } => {
                                self.state = State::Body { frame, total };
                            }
                        }
                        continue;
                    }
                    let (key, value) = parse_header_line(text)?;
                    partial.frame.push_header_raw(key, value);
                }
                State::Body { total, .. } => {
                    let total = *total;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }
                    let body: Bytes = self.buffer.split_to(total).freeze();
                    let State::Body { frame, .. } =
                        std::mem::replace(&mut self.state, State::StartLine)
                    else {
                        unreachable!()
                    };
                    let mut frame = *frame;
                    let is_text = frame
                        .view()
                        .map(|v| v.starts_with("text/"))
                        .unwrap_or(false);
                    if is_text && std::str::from_utf8(&body).is_err() {
                        return Err(ParseError::BodyNotUtf8);
                    }
                    frame.body = body;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Take one CRLF-terminated line off the buffer, without the CRLF.
    ///
    /// Enforces CRLF discipline: a LF not preceded by CR is an error. Also
    /// bounds unterminated lines by the header limit.
    fn take_line(&mut self) -> Result<Option<BytesMut>, ParseError> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(0) => Err(ParseError::BareLineFeed),
            Some(i) => {
                if self.buffer[i - 1] != b'\r' {
                    return Err(ParseError::BareLineFeed);
                }
                let mut line = self.buffer.split_to(i + 1);
                line.truncate(i - 1);
                Ok(Some(line))
            }
            None => {
                if self.buffer.len() > self.header_max {
                    return Err(ParseError::MissingEnd);
                }
                Ok(None)
            }
        }
    }

    fn finalize_headers(&self, frame: Frame) -> Result<Finalized, ParseError> {
        let length = frame.header(headers::LENGTH);
        if length.is_some() && frame.is_chunked() {
            return Err(ParseError::MixedTransfer);
        }
        match length {
            Some(raw) => {
                let total: usize = raw
                    .parse()
                    .map_err(|_| ParseError::BadLength(raw.to_string()))?;
                if total > self.body_max {
                    return Err(ParseError::FrameTooLarge {
                        size: total,
                        limit: self.body_max,
                    });
                }
                if total == 0 {
                    Ok(Finalized::Complete(frame))
                } else {
                    Ok(Finalized::NeedsBody {
                        frame: Box::new(frame),
                        total,
                    })
                }
            }
            None => Ok(Finalized::Complete(frame)),
        }
    }
}

enum Finalized {
    Complete(Frame),
    NeedsBody { frame: Box<Frame>, total: usize },
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_start_line(text: &str) -> Result<StartLine, ParseError> {
    let text = text.trim_end_matches(' ');
    let first = text
        .split(' ')
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ParseError::MalformedStartLine("empty start line".into()))?;
    if first.bytes().all(|b| b.is_ascii_digit()) {
        let code: u16 = first
            .parse()
            .map_err(|_| ParseError::MalformedStartLine(format!("bad status code: {first}")))?;
        let phrase = text[first.len()..].trim_start_matches(' ').to_string();
        Ok(StartLine::Response { code, phrase })
    } else {
        let verb = first.parse()?;
        let args = text[first.len()..]
            .split(' ')
            .filter(|a| !a.is_empty())
            .map(|a| a.to_string())
            .collect();
        Ok(StartLine::Request { verb, args })
    }
}

fn parse_header_line(text: &str) -> Result<(String, String), ParseError> {
    let (key, value) = text
        .split_once(':')
        .ok_or_else(|| ParseError::BadHeader(text.to_string()))?;
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(ParseError::BadHeader(format!("bad key: {key}")));
    }
    let value = value.strip_prefix(' ').unwrap_or(value);
    if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(ParseError::BadHeader(format!("non-printable value in {key}")));
    }
    Ok((key.to_string(), value.to_string()))
}
