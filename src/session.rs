//! Sessions, capability sets, and the resume store.
//!
//! A session binds a tunnel to a negotiated capability set, a peer
//! identity with its trust level, and a resume token. Sessions outlive
//! their transport only inside [`SessionStore`], which parks lane state
//! for the resume window and forgets it on expiry.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::identity::{Identity, TrustLevel};
use crate::protocol::Frame;

/// Length of generated resume tokens.
const RESUME_TOKEN_LEN: usize = 32;

/// A negotiated capability set.
///
/// Capabilities are advertised as a comma-separated list in `Caps:`; the
/// effective set is the intersection of both sides' lists. Unknown names
/// are ignored for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapSet(u8);

impl CapSet {
    pub const LANES: CapSet = CapSet(1 << 0);
    pub const ASYNC: CapSet = CapSet(1 << 1);
    pub const UI: CapSet = CapSet(1 << 2);
    pub const RESUME: CapSet = CapSet(1 << 3);
    pub const CHUNKED: CapSet = CapSet(1 << 4);
    pub const EVENTS: CapSet = CapSet(1 << 5);
    pub const SINCE_SEQ: CapSet = CapSet(1 << 6);

    const NAMES: [(CapSet, &'static str); 7] = [
        (CapSet::LANES, "lanes"),
        (CapSet::ASYNC, "async"),
        (CapSet::UI, "ui"),
        (CapSet::RESUME, "resume"),
        (CapSet::CHUNKED, "chunked"),
        (CapSet::EVENTS, "events"),
        (CapSet::SINCE_SEQ, "since-seq"),
    ];

    /// The empty set.
    pub fn none() -> Self {
        CapSet(0)
    }

    /// Everything this implementation speaks.
    pub fn all() -> Self {
        Self::NAMES
            .iter()
            .fold(CapSet(0), |acc, (cap, _)| acc.union(*cap))
    }

    /// Parse a `Caps:` header value. Unknown capability names are ignored.
    pub fn parse(value: &str) -> Self {
        let mut set = CapSet(0);
        for name in value.split(',').map(|n| n.trim()) {
            if let Some((cap, _)) = Self::NAMES.iter().find(|(_, n)| *n == name) {
                set = set.union(*cap);
            }
        }
        set
    }

    pub fn union(self, other: CapSet) -> CapSet {
        CapSet(self.0 | other.0)
    }

    /// The intersection negotiated at `HELLO`.
    pub fn intersect(self, other: CapSet) -> CapSet {
        CapSet(self.0 & other.0)
    }

    pub fn contains(self, cap: CapSet) -> bool {
        self.0 & cap.0 == cap.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CapSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (cap, name) in Self::NAMES {
            if self.contains(cap) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Negotiated per-tunnel session context.
#[derive(Debug, Clone)]
pub struct Session {
    /// Peer identity, anonymous unless proven or asserted.
    pub identity: Identity,
    /// Intersection of both sides' capabilities.
    pub caps: CapSet,
    /// How far the peer identity is corroborated.
    pub trust: TrustLevel,
    /// Opaque token the peer may present to resume after transport loss.
    pub resume_token: String,
}

impl Session {
    /// Fresh anonymous session with a newly minted resume token.
    pub fn anonymous(caps: CapSet) -> Self {
        Self {
            identity: Identity::Anonymous,
            caps,
            trust: TrustLevel::SelfSigned,
            resume_token: generate_resume_token(),
        }
    }
}

/// Mint an opaque resume token.
pub fn generate_resume_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RESUME_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Sender-side lane state parked for resumption.
#[derive(Debug, Clone)]
pub struct RetainedLane {
    /// Next outbound seq the lane would assign.
    pub local_seq_next: u64,
    /// Next inbound seq the lane expects.
    pub peer_seq_expected: u64,
    /// Highest seq the peer has acked.
    pub peer_ack: u64,
    /// Sent frames past `peer_ack`, in seq order, for replay.
    pub unacked: Vec<(u64, Frame)>,
}

/// A live subscription parked for resumption.
#[derive(Debug, Clone)]
pub struct RetainedSubscription {
    /// Topic selector.
    pub selector: String,
    /// Subscriber lane on the dropped tunnel.
    pub lane: u16,
    /// Last topic seq the subscriber acked before the drop.
    pub last_acked_topic_seq: u64,
    /// Delivered-but-unacked events: (lane seq, topic seq), in order.
    /// Resume consults this when the peer's `Lanes-Resume` ack is ahead
    /// of what we recorded.
    pub pending: Vec<(u64, u64)>,
}

/// Everything preserved across a transport loss.
#[derive(Debug, Clone)]
pub struct RetainedTunnel {
    pub session: Session,
    pub lanes: HashMap<u16, RetainedLane>,
    pub subscriptions: Vec<RetainedSubscription>,
    retained_at: Instant,
}

impl RetainedTunnel {
    pub fn new(
        session: Session,
        lanes: HashMap<u16, RetainedLane>,
        subscriptions: Vec<RetainedSubscription>,
    ) -> Self {
        Self { session, lanes, subscriptions, retained_at: Instant::now() }
    }
}

/// Parked tunnel state keyed by resume token.
///
/// Entries expire `ttl` after retention; expired entries are dropped on
/// access and by [`prune`](Self::prune).
pub struct SessionStore {
    inner: Mutex<HashMap<String, RetainedTunnel>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self { inner: Mutex::new(HashMap::new()), ttl }
    }

    /// Park tunnel state under its resume token.
    pub async fn retain(&self, state: RetainedTunnel) {
        let token = state.session.resume_token.clone();
        self.inner.lock().await.insert(token, state);
    }

    /// Claim parked state. Returns `None` for unknown or expired tokens;
    /// a successful claim consumes the entry, so a token resumes at most
    /// one tunnel.
    pub async fn take(&self, token: &str) -> Option<RetainedTunnel> {
        let mut inner = self.inner.lock().await;
        let state = inner.remove(token)?;
        if state.retained_at.elapsed() > self.ttl {
            return None;
        }
        Some(state)
    }

    /// Drop every expired entry.
    pub async fn prune(&self) {
        let mut inner = self.inner.lock().await;
        inner.retain(|_, state| state.retained_at.elapsed() <= self.ttl);
    }

    /// Number of parked tunnels.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_parse_and_display() {
        let caps = CapSet::parse("lanes, async,events");
        assert!(caps.contains(CapSet::LANES));
        assert!(caps.contains(CapSet::ASYNC));
        assert!(caps.contains(CapSet::EVENTS));
        assert!(!caps.contains(CapSet::RESUME));
        assert_eq!(caps.to_string(), "lanes,async,events");
    }

    #[test]
    fn test_caps_unknown_names_ignored() {
        let caps = CapSet::parse("lanes,teleport,warp");
        assert_eq!(caps, CapSet::LANES);
    }

    #[test]
    fn test_caps_intersection() {
        let ours = CapSet::all();
        let theirs = CapSet::parse("lanes,resume");
        let negotiated = ours.intersect(theirs);
        assert!(negotiated.contains(CapSet::LANES));
        assert!(negotiated.contains(CapSet::RESUME));
        assert!(!negotiated.contains(CapSet::EVENTS));
    }

    #[test]
    fn test_resume_tokens_unique() {
        let one = generate_resume_token();
        let two = generate_resume_token();
        assert_eq!(one.len(), RESUME_TOKEN_LEN);
        assert_ne!(one, two);
    }

    #[tokio::test]
    async fn test_store_take_consumes() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = Session::anonymous(CapSet::LANES);
        let token = session.resume_token.clone();
        store
            .retain(RetainedTunnel::new(session, HashMap::new(), Vec::new()))
            .await;
        assert_eq!(store.len().await, 1);
        assert!(store.take(&token).await.is_some());
        assert!(store.take(&token).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_expiry() {
        let store = SessionStore::new(Duration::from_millis(10));
        let session = Session::anonymous(CapSet::LANES);
        let token = session.resume_token.clone();
        store
            .retain(RetainedTunnel::new(session, HashMap::new(), Vec::new()))
            .await;
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(store.take(&token).await.is_none());
    }
}
