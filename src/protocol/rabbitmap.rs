//! Rabbitmap menu bodies.
//!
//! A menu body is a sequence of tab-separated lines, one item each:
//! `<type><display>\t<selector>\t<host>\t` followed by CRLF, closed by a
//! lone `.` line. `=` in the host column means the item lives on the same
//! burrow that served the menu.

use bytes::Bytes;

use super::selector::ItemType;
use crate::error::RabbitError;

/// Host column value meaning "same burrow as carrier".
pub const SAME_BURROW: &str = "=";

/// One line of a Rabbitmap menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// Item type of the target.
    pub item_type: ItemType,
    /// Human-readable display text.
    pub display: String,
    /// Selector addressing the item.
    pub selector: String,
    /// Authority serving the item, or [`SAME_BURROW`].
    pub host: String,
}

impl MapEntry {
    /// Entry for an item on the carrying burrow.
    pub fn local(item_type: ItemType, display: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            item_type,
            display: display.into(),
            selector: selector.into(),
            host: SAME_BURROW.to_string(),
        }
    }

    /// Entry for an item served by another burrow.
    pub fn remote(
        item_type: ItemType,
        display: impl Into<String>,
        selector: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            item_type,
            display: display.into(),
            selector: selector.into(),
            host: host.into(),
        }
    }

    /// Render this entry as one wire line, without the CRLF.
    pub fn to_line(&self) -> String {
        format!(
            "{}{}\t{}\t{}\t",
            self.item_type.as_char(),
            self.display,
            self.selector,
            self.host
        )
    }

    /// Parse one menu line (CRLF already stripped).
    pub fn parse_line(line: &str) -> Result<Self, RabbitError> {
        let mut columns = line.split('\t');
        let first = columns
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| bad_line(line))?;
        let type_char = first.chars().next().ok_or_else(|| bad_line(line))?;
        let item_type = ItemType::from_char(type_char).ok_or_else(|| bad_line(line))?;
        let display = first[type_char.len_utf8()..].to_string();
        let selector = columns.next().ok_or_else(|| bad_line(line))?.to_string();
        let host = columns.next().ok_or_else(|| bad_line(line))?.to_string();
        Ok(Self { item_type, display, selector, host })
    }
}

fn bad_line(line: &str) -> RabbitError {
    RabbitError::ProtocolViolation(format!("bad rabbitmap line: {line:?}"))
}

/// Render a full menu body: entry lines plus the closing `.` line.
pub fn encode_menu(entries: &[MapEntry]) -> Bytes {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_line());
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    Bytes::from(out)
}

/// Parse a menu body back into entries. The closing `.` line is required.
pub fn decode_menu(body: &[u8]) -> Result<Vec<MapEntry>, RabbitError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| RabbitError::ProtocolViolation("menu body is not UTF-8".into()))?;
    let mut entries = Vec::new();
    let mut closed = false;
    for line in text.split("\r\n") {
        if closed {
            if !line.is_empty() {
                return Err(RabbitError::ProtocolViolation(
                    "data after menu terminator".into(),
                ));
            }
            continue;
        }
        if line == "." {
            closed = true;
            continue;
        }
        if line.is_empty() {
            continue;
        }
        entries.push(MapEntry::parse_line(line)?);
    }
    if !closed {
        return Err(RabbitError::ProtocolViolation(
            "menu body missing '.' terminator".into(),
        ));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_line_shape() {
        let entry = MapEntry::local(ItemType::Text, "Read me", "/0/readme");
        assert_eq!(entry.to_line(), "0Read me\t/0/readme\t=\t");
    }

    #[test]
    fn test_menu_roundtrip() {
        let entries = vec![
            MapEntry::local(ItemType::Menu, "Docs", "/1/docs"),
            MapEntry::remote(ItemType::Topic, "News", "/q/news", "burrow.example"),
            MapEntry::local(ItemType::Info, "Welcome to the warren", "/i/banner"),
        ];
        let body = encode_menu(&entries);
        assert!(body.ends_with(b".\r\n"));
        let decoded = decode_menu(&body).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_empty_menu_is_legal() {
        let body = encode_menu(&[]);
        assert_eq!(&body[..], b".\r\n");
        assert!(decode_menu(&body).unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_menu_rejected() {
        let err = decode_menu(b"0Read me\t/0/readme\t=\t\r\n").unwrap_err();
        assert!(matches!(err, RabbitError::ProtocolViolation(_)));
    }

    #[test]
    fn test_bad_type_char_rejected() {
        assert!(MapEntry::parse_line("zOops\t/0/x\t=\t").is_err());
        assert!(MapEntry::parse_line("no tabs here").is_err());
    }
}
