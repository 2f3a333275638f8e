//! Frame type with typed accessors.
//!
//! A frame is a start line (verb + arguments, or a numeric status plus
//! reason), an ordered header list, and an optional body. Header keys
//! compare case-insensitively but are stored as given, so unknown headers
//! pass through a relay byte-identical. Bodies use `bytes::Bytes` for
//! zero-copy sharing between the codec and lane delivery.

use bytes::{BufMut, Bytes, BytesMut};

use super::verb::Verb;
use crate::status::Status;

/// Well-known header names.
pub mod headers {
    pub const LANE: &str = "Lane";
    pub const TXN: &str = "Txn";
    pub const SEQ: &str = "Seq";
    pub const ACK: &str = "Ack";
    pub const CREDIT: &str = "Credit";
    pub const LENGTH: &str = "Length";
    pub const TRANSFER: &str = "Transfer";
    pub const PART: &str = "Part";
    pub const VIEW: &str = "View";
    pub const CAPS: &str = "Caps";
    pub const BURROW_ID: &str = "Burrow-ID";
    pub const RESUME: &str = "Resume";
    pub const LANES_RESUME: &str = "Lanes-Resume";
    pub const LANES: &str = "Lanes";
    pub const SINCE: &str = "Since";
    pub const HEARTBEATS: &str = "Heartbeats";
    pub const QUERY: &str = "Query";
    pub const TIMEOUT: &str = "Timeout";
    pub const EXPECTED: &str = "Expected";
    pub const LOCATION: &str = "Location";
    pub const HOPS: &str = "Hops";
    pub const IDEM: &str = "Idem";
    pub const NONCE: &str = "Nonce";
    pub const PROOF: &str = "Proof";
}

/// Position of one frame within a chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPart {
    Begin,
    More,
    End,
}

impl ChunkPart {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkPart::Begin => "BEGIN",
            ChunkPart::More => "MORE",
            ChunkPart::End => "END",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BEGIN" => Some(ChunkPart::Begin),
            "MORE" => Some(ChunkPart::More),
            "END" => Some(ChunkPart::End),
            _ => None,
        }
    }
}

/// The first line of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// A request: verb plus whitespace-separated arguments.
    Request { verb: Verb, args: Vec<String> },
    /// A response: numeric code plus reason phrase.
    Response { code: u16, phrase: String },
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Parsed start line.
    pub start: StartLine,
    /// Headers in insertion order, keys case-preserved.
    headers: Vec<(String, String)>,
    /// Body bytes; empty for body-less frames.
    pub body: Bytes,
}

impl Frame {
    /// Create an empty frame from a parsed start line.
    pub(crate) fn from_start(start: StartLine) -> Self {
        Self {
            start,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Create a request frame with no arguments.
    pub fn request(verb: Verb) -> Self {
        Self {
            start: StartLine::Request { verb, args: Vec::new() },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Create a request frame with one argument (usually a selector).
    pub fn request_with(verb: Verb, arg: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                verb,
                args: vec![arg.into()],
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Create a response frame for a status.
    pub fn response(status: Status) -> Self {
        Self {
            start: StartLine::Response {
                code: status.code(),
                phrase: status.phrase().to_string(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Create a response echoing the `Lane:` and `Txn:` of a request.
    pub fn response_to(status: Status, request: &Frame) -> Self {
        let mut frame = Self::response(status);
        if let Some(lane) = request.header(headers::LANE) {
            frame.set_header(headers::LANE, lane);
        }
        if let Some(txn) = request.header(headers::TXN) {
            frame.set_header(headers::TXN, txn);
        }
        frame
    }

    /// Builder-style header setter.
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Builder-style body setter.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup. Returns the first match.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace a header (matched case-insensitively).
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((key.to_string(), value)),
        }
    }

    /// Remove a header (matched case-insensitively).
    pub fn remove_header(&mut self, key: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// All headers in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn push_header_raw(&mut self, key: String, value: String) {
        self.headers.push((key, value));
    }

    /// The verb, when this is a request frame.
    pub fn verb(&self) -> Option<Verb> {
        match &self.start {
            StartLine::Request { verb, .. } => Some(*verb),
            StartLine::Response { .. } => None,
        }
    }

    /// Start-line arguments, when this is a request frame.
    pub fn args(&self) -> &[String] {
        match &self.start {
            StartLine::Request { args, .. } => args,
            StartLine::Response { .. } => &[],
        }
    }

    /// First start-line argument (the selector for most verbs).
    pub fn selector_arg(&self) -> Option<&str> {
        self.args().first().map(|s| s.as_str())
    }

    /// The status code, when this is a response frame.
    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// The reason phrase, when this is a response frame.
    pub fn status_phrase(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { phrase, .. } => Some(phrase.as_str()),
            StartLine::Request { .. } => None,
        }
    }

    /// `Lane:` header, parsed. Absent means lane 0 (control).
    pub fn lane(&self) -> Option<u16> {
        self.header(headers::LANE).and_then(|v| v.parse().ok())
    }

    pub fn set_lane(&mut self, lane: u16) {
        self.set_header(headers::LANE, lane.to_string());
    }

    /// `Txn:` header.
    pub fn txn(&self) -> Option<&str> {
        self.header(headers::TXN)
    }

    pub fn set_txn(&mut self, txn: impl Into<String>) {
        self.set_header(headers::TXN, txn);
    }

    /// `Seq:` header, parsed.
    pub fn seq(&self) -> Option<u64> {
        self.header(headers::SEQ).and_then(|v| v.parse().ok())
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.set_header(headers::SEQ, seq.to_string());
    }

    /// Cumulative acknowledgement carried by an `ACK` frame.
    pub fn ack_seq(&self) -> Option<u64> {
        self.header(headers::ACK).and_then(|v| v.parse().ok())
    }

    /// Additive grant carried by a `CREDIT` frame (`Credit: +N`).
    pub fn credit_grant(&self) -> Option<u32> {
        self.header(headers::CREDIT)
            .and_then(|v| v.strip_prefix('+'))
            .and_then(|v| v.parse().ok())
    }

    /// `View:` header (content type of the body).
    pub fn view(&self) -> Option<&str> {
        self.header(headers::VIEW)
    }

    /// Whether this frame is a chunked-transfer envelope.
    pub fn is_chunked(&self) -> bool {
        self.header(headers::TRANSFER)
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// `Part:` position within a chunked body.
    pub fn part(&self) -> Option<ChunkPart> {
        self.header(headers::PART).and_then(ChunkPart::parse)
    }

    /// Control frames (`ACK`/`PING`/`CREDIT`) bypass credit accounting.
    pub fn is_control(&self) -> bool {
        self.verb().map(|v| v.is_control()).unwrap_or(false)
    }

    /// Encode this frame to wire bytes.
    ///
    /// A `Length:` header is stamped automatically for non-chunked frames
    /// with a non-empty body. Body-less frames still end with `End:`.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        match &self.start {
            StartLine::Request { verb, args } => {
                out.put_slice(verb.as_str().as_bytes());
                for arg in args {
                    out.put_u8(b' ');
                    out.put_slice(arg.as_bytes());
                }
            }
            StartLine::Response { code, phrase } => {
                out.put_slice(code.to_string().as_bytes());
                out.put_u8(b' ');
                out.put_slice(phrase.as_bytes());
            }
        }
        out.put_slice(b"\r\n");

        let needs_length = !self.body.is_empty()
            && self.header(headers::LENGTH).is_none()
            && !self.is_chunked();

        for (key, value) in &self.headers {
            out.put_slice(key.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        if needs_length {
            out.put_slice(b"Length: ");
            out.put_slice(self.body.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"End:\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}
