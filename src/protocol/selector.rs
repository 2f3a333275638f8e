//! Selectors and the item-type taxonomy.
//!
//! A selector is a path starting with `/`. The first segment is a single
//! item-type character; the remainder addresses an item beneath it. The
//! bare root `/` addresses the burrow's top-level menu. The type character
//! decides which verbs are legal against the selector.

use std::fmt;

use crate::error::RabbitError;
use crate::protocol::verb::Verb;

/// Selector reserved for warren peer discovery (`OFFER`).
pub const WARREN_SELECTOR: &str = "/warren";

/// Item types, one character each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// `0` — plain text document.
    Text,
    /// `1` — menu (Rabbitmap).
    Menu,
    /// `7` — search endpoint.
    Search,
    /// `9` — opaque binary.
    Binary,
    /// `q` — event topic (queue).
    Topic,
    /// `u` — UI bundle.
    Ui,
    /// `i` — inline informational item.
    Info,
}

impl ItemType {
    /// Parse from the selector's type character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(ItemType::Text),
            '1' => Some(ItemType::Menu),
            '7' => Some(ItemType::Search),
            '9' => Some(ItemType::Binary),
            'q' => Some(ItemType::Topic),
            'u' => Some(ItemType::Ui),
            'i' => Some(ItemType::Info),
            _ => None,
        }
    }

    /// The type character used on the wire.
    pub fn as_char(&self) -> char {
        match self {
            ItemType::Text => '0',
            ItemType::Menu => '1',
            ItemType::Search => '7',
            ItemType::Binary => '9',
            ItemType::Topic => 'q',
            ItemType::Ui => 'u',
            ItemType::Info => 'i',
        }
    }
}

/// A parsed selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    raw: String,
    kind: SelectorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SelectorKind {
    /// The bare root `/`, equivalent to the top-level menu.
    Root,
    /// `/<type><sub-path>`.
    Typed { item: ItemType },
    /// `/warren`, legal only for `OFFER`.
    Warren,
}

impl Selector {
    /// Parse a selector path.
    ///
    /// Accepts the root `/`, typed paths like `/0/readme` or `/q/news`,
    /// and the reserved `/warren`.
    pub fn parse(raw: &str) -> Result<Self, RabbitError> {
        if !raw.starts_with('/') {
            return Err(RabbitError::ProtocolViolation(format!(
                "selector must start with '/': {raw}"
            )));
        }
        if raw == "/" {
            return Ok(Self { raw: raw.to_string(), kind: SelectorKind::Root });
        }
        if raw == WARREN_SELECTOR {
            return Ok(Self { raw: raw.to_string(), kind: SelectorKind::Warren });
        }
        let first_segment = raw[1..].split('/').next().unwrap_or("");
        let mut chars = first_segment.chars();
        let (type_char, trailing) = (chars.next(), chars.next());
        let item = match (type_char, trailing) {
            (Some(c), None) => ItemType::from_char(c),
            _ => None,
        };
        match item {
            Some(item) => Ok(Self { raw: raw.to_string(), kind: SelectorKind::Typed { item } }),
            None => Err(RabbitError::ProtocolViolation(format!(
                "selector type segment must be a single item-type character: {raw}"
            ))),
        }
    }

    /// The selector as written on the wire.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The item type. The root selector is a menu.
    pub fn item_type(&self) -> Option<ItemType> {
        match self.kind {
            SelectorKind::Root => Some(ItemType::Menu),
            SelectorKind::Typed { item } => Some(item),
            SelectorKind::Warren => None,
        }
    }

    /// Whether this is the reserved warren discovery selector.
    pub fn is_warren(&self) -> bool {
        self.kind == SelectorKind::Warren
    }

    /// Path beneath the type segment, including its leading `/` (empty for
    /// the root and for bare type selectors like `/1`).
    pub fn sub_path(&self) -> &str {
        match self.kind {
            SelectorKind::Root | SelectorKind::Warren => "",
            SelectorKind::Typed { .. } => {
                let rest = &self.raw[1..];
                rest.find('/').map(|i| &rest[i..]).unwrap_or("")
            }
        }
    }

    /// Whether `verb` is legal against this selector's item type.
    pub fn permits_verb(&self, verb: Verb) -> bool {
        if self.is_warren() {
            return verb == Verb::Offer;
        }
        let Some(item) = self.item_type() else { return false };
        match verb {
            Verb::List => item == ItemType::Menu,
            Verb::Fetch => matches!(
                item,
                ItemType::Text | ItemType::Binary | ItemType::Ui | ItemType::Info
            ),
            Verb::Search => matches!(item, ItemType::Search | ItemType::Menu),
            Verb::Describe => true,
            Verb::Subscribe | Verb::Publish | Verb::Event => item == ItemType::Topic,
            Verb::Offer => false,
            // Control and session verbs are not selector-scoped.
            Verb::Hello | Verb::Auth | Verb::Ping | Verb::Ack | Verb::Credit | Verb::Cancel => {
                true
            }
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A parsed `rabbit://` URI: an authority (DNS name, IP literal, or
/// `ed25519:<base32>`) plus a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitUri {
    pub authority: String,
    pub selector: Selector,
}

impl RabbitUri {
    /// Parse `rabbit://<burrow>/<type><selector>`. A bare authority
    /// addresses the root menu.
    pub fn parse(uri: &str) -> Result<Self, RabbitError> {
        let rest = uri.strip_prefix("rabbit://").ok_or_else(|| {
            RabbitError::ProtocolViolation(format!("not a rabbit URI: {uri}"))
        })?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(RabbitError::ProtocolViolation(format!(
                "rabbit URI missing authority: {uri}"
            )));
        }
        Ok(Self {
            authority: authority.to_string(),
            selector: Selector::parse(path)?,
        })
    }
}

impl fmt::Display for RabbitUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rabbit://{}{}", self.authority, self.selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root() {
        let sel = Selector::parse("/").unwrap();
        assert_eq!(sel.item_type(), Some(ItemType::Menu));
        assert!(sel.permits_verb(Verb::List));
    }

    #[test]
    fn test_parse_typed() {
        let sel = Selector::parse("/0/readme").unwrap();
        assert_eq!(sel.item_type(), Some(ItemType::Text));
        assert_eq!(sel.sub_path(), "/readme");
        assert!(sel.permits_verb(Verb::Fetch));
        assert!(!sel.permits_verb(Verb::Subscribe));
    }

    #[test]
    fn test_topic_verb_legality() {
        let sel = Selector::parse("/q/news").unwrap();
        assert_eq!(sel.item_type(), Some(ItemType::Topic));
        assert!(sel.permits_verb(Verb::Subscribe));
        assert!(sel.permits_verb(Verb::Publish));
        assert!(!sel.permits_verb(Verb::Fetch));
        assert!(!sel.permits_verb(Verb::List));
    }

    #[test]
    fn test_warren_reserved() {
        let sel = Selector::parse("/warren").unwrap();
        assert!(sel.is_warren());
        assert!(sel.permits_verb(Verb::Offer));
        assert!(!sel.permits_verb(Verb::List));
    }

    #[test]
    fn test_bad_selectors_rejected() {
        assert!(Selector::parse("readme").is_err());
        assert!(Selector::parse("/x/unknown-type").is_err());
        assert!(Selector::parse("/00/two-chars").is_err());
        assert!(Selector::parse("").is_err());
    }

    #[test]
    fn test_bare_type_selector() {
        let sel = Selector::parse("/1").unwrap();
        assert_eq!(sel.item_type(), Some(ItemType::Menu));
        assert_eq!(sel.sub_path(), "");
    }

    #[test]
    fn test_item_type_char_roundtrip() {
        for c in ['0', '1', '7', '9', 'q', 'u', 'i'] {
            assert_eq!(ItemType::from_char(c).unwrap().as_char(), c);
        }
        assert!(ItemType::from_char('z').is_none());
    }

    #[test]
    fn test_rabbit_uri_parse() {
        let uri = RabbitUri::parse("rabbit://hutch.example/0/readme").unwrap();
        assert_eq!(uri.authority, "hutch.example");
        assert_eq!(uri.selector.as_str(), "/0/readme");
        assert_eq!(uri.to_string(), "rabbit://hutch.example/0/readme");

        let bare = RabbitUri::parse("rabbit://ed25519:MFRGGZDF").unwrap();
        assert_eq!(bare.authority, "ed25519:MFRGGZDF");
        assert_eq!(bare.selector.as_str(), "/");

        assert!(RabbitUri::parse("gopher://old.example/1/").is_err());
        assert!(RabbitUri::parse("rabbit:///0/readme").is_err());
    }
}
