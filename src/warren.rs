//! Warren peer table.
//!
//! A minimal registry of peers known to this burrow, feeding the
//! `OFFER /warren` response. Population (multicast discovery, federation
//! exchange, static config) happens outside the engine; the table only
//! records what it is told.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Source of peer identities for `OFFER /warren`.
pub trait Discovery: Send + Sync {
    /// Peer identities, `ed25519:<key>` or `dns:<name>` form.
    fn peers(&self) -> Vec<String>;
}

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Identity string: `ed25519:<base32>` or `dns:<name>`.
    pub burrow_id: String,
    /// Last known dialable address.
    pub address: String,
    /// When the peer was last seen or announced.
    pub last_seen: DateTime<Utc>,
    /// Capability names the peer advertised.
    pub capabilities: Vec<String>,
}

/// Registry of known peers, keyed by identity.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns `true` when the peer was new.
    pub fn register(&self, info: PeerInfo) -> bool {
        let mut peers = write_recover(&self.peers);
        peers.insert(info.burrow_id.clone(), info).is_none()
    }

    /// Forget a peer.
    pub fn remove(&self, burrow_id: &str) -> bool {
        write_recover(&self.peers).remove(burrow_id).is_some()
    }

    /// Look up one peer.
    pub fn get(&self, burrow_id: &str) -> Option<PeerInfo> {
        read_recover(&self.peers).get(burrow_id).cloned()
    }

    /// All peer identities, sorted for stable menu output.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_recover(&self.peers).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        read_recover(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        read_recover(&self.peers).is_empty()
    }
}

impl Discovery for PeerTable {
    fn peers(&self) -> Vec<String> {
        self.identities()
    }
}

fn read_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_recover<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Render an `OFFER /warren` body: one `burrow: <identity>` line per peer,
/// terminated by `.`.
pub fn encode_peer_list(identities: &[String]) -> Bytes {
    let mut out = String::new();
    for id in identities {
        out.push_str("burrow: ");
        out.push_str(id);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            burrow_id: id.to_string(),
            address: "127.0.0.1:7443".to_string(),
            last_seen: Utc::now(),
            capabilities: vec!["lanes".to_string()],
        }
    }

    #[test]
    fn test_register_is_upsert() {
        let table = PeerTable::new();
        assert!(table.register(peer("dns:hutch.example")));
        assert!(!table.register(peer("dns:hutch.example")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_identities_sorted() {
        let table = PeerTable::new();
        table.register(peer("dns:zeta.example"));
        table.register(peer("dns:alpha.example"));
        assert_eq!(
            table.identities(),
            vec!["dns:alpha.example", "dns:zeta.example"]
        );
    }

    #[test]
    fn test_discovery_impl() {
        let table = PeerTable::new();
        table.register(peer("dns:hutch.example"));
        assert_eq!(Discovery::peers(&table), vec!["dns:hutch.example"]);
    }

    #[test]
    fn test_peer_list_body() {
        let body = encode_peer_list(&[
            "dns:hutch.example".to_string(),
            "ed25519:MFRGGZDF".to_string(),
        ]);
        assert_eq!(
            &body[..],
            b"burrow: dns:hutch.example\r\nburrow: ed25519:MFRGGZDF\r\n.\r\n"
        );
    }

    #[test]
    fn test_empty_peer_list_body() {
        assert_eq!(&encode_peer_list(&[])[..], b".\r\n");
    }
}
