//! Handshake and identity binding.
//!
//! A tunnel opens with `HELLO RABBIT/1.0` on lane 0. The responder either
//! accepts (`200 HELLO`), challenges (`300 CHALLENGE` with a nonce), or —
//! for a valid `Resume:` token — restores parked lane state
//! (`201 RESUMED`). Challenge proofs sign the nonce concatenated with the
//! transport's exported keying material so a proof cannot be replayed on
//! another channel; transports without an exporter fall back to the nonce
//! alone, kept safe by single-use nonces with a short TTL.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{RabbitError, Result};
use crate::identity::{Identity, IdentityProvider, TrustLevel};
use crate::protocol::{headers, Frame, Verb};
use crate::session::{generate_resume_token, CapSet, RetainedTunnel, Session, SessionStore};
use crate::status::Status;

/// Protocol version token carried on the `HELLO` start line.
pub const PROTOCOL_VERSION: &str = "RABBIT/1.0";

/// Exporter label for channel binding.
pub const EKM_LABEL: &str = "rabbit auth";

/// Exported keying material length.
pub const EKM_LEN: usize = 32;

const NONCE_LEN: usize = 24;

/// Whether the responder demands an identity proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPolicy {
    /// Accept anonymous and asserted identities (trust-on-first-use).
    #[default]
    Open,
    /// Challenge every `HELLO`; only proven identities get a session.
    Challenge,
}

/// Client-side snapshot presented to resume a dropped tunnel.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    /// Token issued by the responder at the original `HELLO`.
    pub token: String,
    /// Per-lane highest inbound seq we acked before the drop.
    pub lane_acks: Vec<(u16, u64)>,
    /// Live subscriptions to re-attach: (selector, lane).
    pub subscriptions: Vec<(String, u16)>,
}

/// Single-use nonces with a TTL, for the no-exporter fallback.
pub struct NonceRegistry {
    issued: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl NonceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self { issued: Mutex::new(HashMap::new()), ttl }
    }

    /// Mint a fresh nonce.
    pub async fn issue(&self) -> String {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        self.issued.lock().await.insert(nonce.clone(), Instant::now());
        nonce
    }

    /// Consume a nonce. Reuse and expiry both fail.
    pub async fn consume(&self, nonce: &str) -> Result<()> {
        let mut issued = self.issued.lock().await;
        match issued.remove(nonce) {
            Some(at) if at.elapsed() <= self.ttl => Ok(()),
            Some(_) => Err(RabbitError::ProtocolViolation("nonce expired".into())),
            None => Err(RabbitError::ProtocolViolation("nonce unknown or reused".into())),
        }
    }
}

/// Outcome of processing an inbound `HELLO`.
pub enum HelloOutcome {
    /// Session established; send `reply` and start the tunnel.
    Accept { session: Session, reply: Frame },
    /// Proof required; send `reply` and await `AUTH PROOF`.
    Challenge { pending: PendingChallenge, reply: Frame },
    /// Valid resumption; restore `retained` and send `reply`.
    Resume {
        retained: RetainedTunnel,
        lane_acks: Vec<(u16, u64)>,
        reply: Frame,
    },
    /// Negotiation failed; send `reply` and close.
    Reject { reply: Frame },
}

/// Challenge state held between `300 CHALLENGE` and `AUTH PROOF`.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub nonce: String,
    pub peer: Identity,
    pub caps: CapSet,
}

/// Handshake logic shared by both tunnel roles.
pub struct Handshake {
    identity: std::sync::Arc<dyn IdentityProvider>,
    sessions: std::sync::Arc<SessionStore>,
    nonces: NonceRegistry,
    policy: AuthPolicy,
    local_caps: CapSet,
}

impl Handshake {
    pub fn new(
        identity: std::sync::Arc<dyn IdentityProvider>,
        sessions: std::sync::Arc<SessionStore>,
        policy: AuthPolicy,
        config: &EngineConfig,
    ) -> Self {
        Self {
            identity,
            sessions,
            nonces: NonceRegistry::new(config.nonce_ttl),
            policy,
            local_caps: CapSet::all(),
        }
    }

    /// Capabilities this side advertises.
    pub fn local_caps(&self) -> CapSet {
        self.local_caps
    }

    /// Build the opening `HELLO` for the initiating side.
    pub fn hello_frame(&self, resume: Option<&ResumeRequest>) -> Frame {
        let mut frame = Frame::request_with(Verb::Hello, PROTOCOL_VERSION);
        frame.set_lane(0);
        frame.set_header(headers::CAPS, self.local_caps.to_string());
        let local = self.identity.local_identity();
        if !local.is_anonymous() {
            frame.set_header(headers::BURROW_ID, local.to_string());
        }
        if let Some(resume) = resume {
            frame.set_header(headers::RESUME, resume.token.clone());
            frame.set_header(headers::LANES_RESUME, format_lane_acks(&resume.lane_acks));
        }
        frame
    }

    /// Process an inbound `HELLO` on a fresh tunnel.
    pub async fn process_hello(&self, frame: &Frame) -> HelloOutcome {
        if frame.verb() != Some(Verb::Hello)
            || frame.selector_arg() != Some(PROTOCOL_VERSION)
        {
            return self.reject("expected HELLO RABBIT/1.0");
        }
        let peer_caps = match frame.header(headers::CAPS) {
            Some(value) => CapSet::parse(value),
            None => CapSet::none(),
        };
        if !peer_caps.contains(CapSet::LANES) {
            return self.reject("peer does not speak lanes");
        }
        let caps = self.local_caps.intersect(peer_caps);

        let peer = match frame.header(headers::BURROW_ID) {
            Some(raw) => match raw.parse::<Identity>() {
                Ok(identity) => identity,
                Err(_) => return self.reject("bad Burrow-ID"),
            },
            None => Identity::Anonymous,
        };

        // Resumption takes priority over re-authentication: the token was
        // only ever issued to an accepted session.
        if let Some(token) = frame.header(headers::RESUME) {
            if !caps.contains(CapSet::RESUME) {
                return self.reject("resume not negotiated");
            }
            match self.sessions.take(token).await {
                Some(retained) => {
                    let lane_acks = frame
                        .header(headers::LANES_RESUME)
                        .map(parse_lane_acks)
                        .unwrap_or_default();
                    let accepted: Vec<String> = lane_acks
                        .iter()
                        .filter(|(id, _)| retained.lanes.contains_key(id))
                        .map(|(id, _)| id.to_string())
                        .collect();
                    let mut reply = Frame::response(Status::RESUMED);
                    reply.set_lane(0);
                    reply.set_header(headers::LANES, accepted.join(","));
                    reply.set_header(headers::CAPS, caps.to_string());
                    debug!(lanes = %accepted.join(","), "tunnel resumed");
                    return HelloOutcome::Resume { retained, lane_acks, reply };
                }
                None => return self.reject("unknown or expired resume token"),
            }
        }

        match self.policy {
            AuthPolicy::Open => {
                let session = Session {
                    identity: peer,
                    caps,
                    trust: TrustLevel::SelfSigned,
                    resume_token: generate_resume_token(),
                };
                let mut reply = Frame::response(Status::HELLO);
                reply.set_lane(0);
                reply.set_header(headers::CAPS, caps.to_string());
                reply.set_header(headers::RESUME, session.resume_token.clone());
                let local = self.identity.local_identity();
                if !local.is_anonymous() {
                    reply.set_header(headers::BURROW_ID, local.to_string());
                }
                HelloOutcome::Accept { session, reply }
            }
            AuthPolicy::Challenge => {
                if peer.is_anonymous() {
                    let mut reply = Frame::response(Status::AUTH_REQUIRED);
                    reply.set_lane(0);
                    return HelloOutcome::Reject { reply };
                }
                let nonce = self.nonces.issue().await;
                let mut reply = Frame::response(Status::CHALLENGE);
                reply.set_lane(0);
                reply.set_header(headers::NONCE, nonce.clone());
                HelloOutcome::Challenge {
                    pending: PendingChallenge { nonce, peer, caps },
                    reply,
                }
            }
        }
    }

    /// Verify an `AUTH PROOF` against the pending challenge.
    pub async fn process_auth(
        &self,
        frame: &Frame,
        pending: &PendingChallenge,
        ekm: Option<&[u8]>,
    ) -> Result<(Session, Frame)> {
        if frame.verb() != Some(Verb::Auth) || frame.selector_arg() != Some("PROOF") {
            return Err(RabbitError::Unauthorized("expected AUTH PROOF".into()));
        }
        let nonce = frame
            .header(headers::NONCE)
            .ok_or_else(|| RabbitError::ProtocolViolation("AUTH missing Nonce".into()))?;
        if nonce != pending.nonce {
            return Err(RabbitError::ProtocolViolation("nonce mismatch".into()));
        }
        self.nonces.consume(nonce).await?;
        let proof = frame
            .header(headers::PROOF)
            .ok_or_else(|| RabbitError::Unauthorized("AUTH missing Proof".into()))?;
        let signature = BASE64
            .decode(proof)
            .map_err(|_| RabbitError::Unauthorized("Proof is not base64".into()))?;
        let message = binding_message(nonce, ekm);
        if !self.identity.verify(&pending.peer, &message, &signature) {
            return Err(RabbitError::Unauthorized("proof verification failed".into()));
        }
        let session = Session {
            identity: pending.peer.clone(),
            caps: pending.caps,
            trust: TrustLevel::Verified,
            resume_token: generate_resume_token(),
        };
        let mut reply = Frame::response(Status::HELLO);
        reply.set_lane(0);
        reply.set_header(headers::CAPS, session.caps.to_string());
        reply.set_header(headers::RESUME, session.resume_token.clone());
        Ok((session, reply))
    }

    /// Build the `AUTH PROOF` answering a `300 CHALLENGE` (initiator side).
    pub fn answer_challenge(&self, challenge: &Frame, ekm: Option<&[u8]>) -> Result<Frame> {
        let nonce = challenge
            .header(headers::NONCE)
            .ok_or_else(|| RabbitError::ProtocolViolation("CHALLENGE missing Nonce".into()))?;
        let message = binding_message(nonce, ekm);
        let signature = self.identity.sign(&message)?;
        let mut frame = Frame::request_with(Verb::Auth, "PROOF");
        frame.set_lane(0);
        frame.set_header(headers::NONCE, nonce);
        frame.set_header(headers::BURROW_ID, self.identity.local_identity().to_string());
        frame.set_header(headers::PROOF, BASE64.encode(signature));
        Ok(frame)
    }

    fn reject(&self, reason: &str) -> HelloOutcome {
        debug!(reason, "rejecting HELLO");
        let mut reply = Frame::response(Status::BAD_HELLO);
        reply.set_lane(0);
        HelloOutcome::Reject { reply }
    }
}

/// The signed message: nonce, then exported keying material when present.
fn binding_message(nonce: &str, ekm: Option<&[u8]>) -> Vec<u8> {
    let mut message = nonce.as_bytes().to_vec();
    if let Some(ekm) = ekm {
        message.extend_from_slice(ekm);
    }
    message
}

/// Format `Lanes-Resume: <id>=ACK:<seq>,…`.
pub fn format_lane_acks(acks: &[(u16, u64)]) -> String {
    acks.iter()
        .map(|(lane, seq)| format!("{lane}=ACK:{seq}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a `Lanes-Resume:` header value; malformed entries are skipped.
pub fn parse_lane_acks(value: &str) -> Vec<(u16, u64)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (lane, ack) = entry.trim().split_once('=')?;
            let seq = ack.strip_prefix("ACK:")?;
            Some((lane.parse().ok()?, seq.parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AnonymousProvider;
    use std::sync::Arc;

    fn handshake(policy: AuthPolicy) -> Handshake {
        let config = EngineConfig::default();
        Handshake::new(
            Arc::new(AnonymousProvider),
            Arc::new(SessionStore::new(config.resume_ttl)),
            policy,
            &config,
        )
    }

    #[test]
    fn test_lane_acks_roundtrip() {
        let acks = vec![(5u16, 10u64), (7, 2)];
        let formatted = format_lane_acks(&acks);
        assert_eq!(formatted, "5=ACK:10,7=ACK:2");
        assert_eq!(parse_lane_acks(&formatted), acks);
    }

    #[test]
    fn test_lane_acks_parse_skips_garbage() {
        assert_eq!(parse_lane_acks("5=ACK:10,nope,8=NACK:3"), vec![(5, 10)]);
    }

    #[tokio::test]
    async fn test_open_hello_accepted() {
        let hs = handshake(AuthPolicy::Open);
        let hello = hs.hello_frame(None);
        match hs.process_hello(&hello).await {
            HelloOutcome::Accept { session, reply } => {
                assert_eq!(reply.status_code(), Some(200));
                assert_eq!(reply.status_phrase(), Some("HELLO"));
                assert!(session.caps.contains(CapSet::LANES));
                assert!(!session.resume_token.is_empty());
                assert!(reply.header(headers::RESUME).is_some());
            }
            _ => panic!("expected Accept"),
        }
    }

    #[tokio::test]
    async fn test_hello_without_lanes_rejected() {
        let hs = handshake(AuthPolicy::Open);
        let mut hello = Frame::request_with(Verb::Hello, PROTOCOL_VERSION);
        hello.set_header(headers::CAPS, "async,events");
        match hs.process_hello(&hello).await {
            HelloOutcome::Reject { reply } => {
                assert_eq!(reply.status_code(), Some(431));
            }
            _ => panic!("expected Reject"),
        }
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let hs = handshake(AuthPolicy::Open);
        let mut hello = Frame::request_with(Verb::Hello, "RABBIT/9.9");
        hello.set_header(headers::CAPS, "lanes");
        assert!(matches!(
            hs.process_hello(&hello).await,
            HelloOutcome::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn test_challenge_policy_rejects_anonymous() {
        let hs = handshake(AuthPolicy::Challenge);
        let mut hello = Frame::request_with(Verb::Hello, PROTOCOL_VERSION);
        hello.set_header(headers::CAPS, "lanes");
        match hs.process_hello(&hello).await {
            HelloOutcome::Reject { reply } => {
                assert_eq!(reply.status_code(), Some(440));
            }
            _ => panic!("expected 440 reject"),
        }
    }

    #[tokio::test]
    async fn test_challenge_policy_challenges_identified_peer() {
        let hs = handshake(AuthPolicy::Challenge);
        let mut hello = Frame::request_with(Verb::Hello, PROTOCOL_VERSION);
        hello.set_header(headers::CAPS, "lanes");
        hello.set_header(headers::BURROW_ID, "ed25519:MFRGGZDF");
        match hs.process_hello(&hello).await {
            HelloOutcome::Challenge { pending, reply } => {
                assert_eq!(reply.status_code(), Some(300));
                assert_eq!(reply.header(headers::NONCE).unwrap(), pending.nonce);
                assert_eq!(pending.peer.to_string(), "ed25519:MFRGGZDF");
            }
            _ => panic!("expected Challenge"),
        }
    }

    #[tokio::test]
    async fn test_nonce_single_use() {
        let registry = NonceRegistry::new(Duration::from_secs(30));
        let nonce = registry.issue().await;
        assert!(registry.consume(&nonce).await.is_ok());
        assert!(registry.consume(&nonce).await.is_err());
        assert!(registry.consume("never-issued").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_expiry() {
        let registry = NonceRegistry::new(Duration::from_secs(1));
        let nonce = registry.issue().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(registry.consume(&nonce).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_resume_token_rejected() {
        let hs = handshake(AuthPolicy::Open);
        let mut hello = Frame::request_with(Verb::Hello, PROTOCOL_VERSION);
        hello.set_header(headers::CAPS, "lanes,resume");
        hello.set_header(headers::RESUME, "stale-token");
        assert!(matches!(
            hs.process_hello(&hello).await,
            HelloOutcome::Reject { .. }
        ));
    }

    #[test]
    fn test_binding_message_includes_ekm() {
        let with = binding_message("abc", Some(b"keys"));
        let without = binding_message("abc", None);
        assert_eq!(&with[..3], b"abc");
        assert_ne!(with, without);
    }
}
