//! Protocol verbs.
//!
//! The start line of a request frame begins with one of these tokens.
//! Responses use numeric status lines instead; see [`crate::status`].

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// The closed set of request verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Hello,
    Auth,
    List,
    Fetch,
    Search,
    Describe,
    Subscribe,
    Publish,
    Event,
    Offer,
    Ping,
    Ack,
    Credit,
    Cancel,
}

impl Verb {
    /// Wire token for this verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Hello => "HELLO",
            Verb::Auth => "AUTH",
            Verb::List => "LIST",
            Verb::Fetch => "FETCH",
            Verb::Search => "SEARCH",
            Verb::Describe => "DESCRIBE",
            Verb::Subscribe => "SUBSCRIBE",
            Verb::Publish => "PUBLISH",
            Verb::Event => "EVENT",
            Verb::Offer => "OFFER",
            Verb::Ping => "PING",
            Verb::Ack => "ACK",
            Verb::Credit => "CREDIT",
            Verb::Cancel => "CANCEL",
        }
    }

    /// Control frames bypass per-lane credit accounting.
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self, Verb::Ack | Verb::Ping | Verb::Credit)
    }

    /// Verbs that expect exactly one terminal response on their `Txn`.
    #[inline]
    pub fn expects_response(&self) -> bool {
        !matches!(self, Verb::Event | Verb::Ack | Verb::Credit)
    }
}

impl FromStr for Verb {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELLO" => Ok(Verb::Hello),
            "AUTH" => Ok(Verb::Auth),
            "LIST" => Ok(Verb::List),
            "FETCH" => Ok(Verb::Fetch),
            "SEARCH" => Ok(Verb::Search),
            "DESCRIBE" => Ok(Verb::Describe),
            "SUBSCRIBE" => Ok(Verb::Subscribe),
            "PUBLISH" => Ok(Verb::Publish),
            "EVENT" => Ok(Verb::Event),
            "OFFER" => Ok(Verb::Offer),
            "PING" => Ok(Verb::Ping),
            "ACK" => Ok(Verb::Ack),
            "CREDIT" => Ok(Verb::Credit),
            "CANCEL" => Ok(Verb::Cancel),
            other => Err(ParseError::MalformedStartLine(format!(
                "unknown verb: {other}"
            ))),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
