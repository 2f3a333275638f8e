//! Verb dispatcher and selector resolution.
//!
//! The dispatcher interprets request verbs against a content resolver,
//! enforcing selector/verb legality, permissions, hop limits, and the
//! `Idem:` dedupe window. Handler failures never escape: every outcome is
//! a status response echoing the request's `Lane:` and `Txn:`, with
//! unexpected errors mapped to `520 INTERNAL`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{RabbitError, Result};
use crate::identity::Identity;
use crate::protocol::{
    encode_menu, headers, ChunkPart, Frame, MapEntry, Selector, Verb,
};
use crate::session::Session;
use crate::status::Status;
use crate::subscribe::{SinceCursor, SubscriptionEngine};
use crate::session::CapSet;
use crate::warren::{encode_peer_list, Discovery};

/// Chunk payload size for bodies above the non-chunked limit.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A fetched content body with its view type.
#[derive(Debug, Clone)]
pub struct Content {
    pub body: Bytes,
    pub view: String,
}

impl Content {
    pub fn text(body: impl Into<Bytes>) -> Self {
        Self { body: body.into(), view: "text/plain".to_string() }
    }
}

/// How a selector resolved: locally, moved, or delegated to another
/// burrow in the warren.
#[derive(Debug, Clone)]
pub enum Resolved<T> {
    /// This burrow produces the answer.
    Local(T),
    /// The item moved; the client must re-issue at `location`.
    Moved { location: String },
    /// Another burrow owns the item; forwarded or redirected.
    Delegated { host: String },
}

/// Content provider consumed by the dispatcher.
///
/// Implementations map selectors to menus, documents, search results, and
/// schemas; the engine supplies protocol discipline around them.
#[async_trait]
pub trait SelectorResolver: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<Resolved<Vec<MapEntry>>>;

    async fn fetch(
        &self,
        selector: &Selector,
        accept_view: Option<&str>,
    ) -> Result<Resolved<Content>>;

    async fn search(&self, selector: &Selector, query: &str) -> Result<Resolved<Vec<MapEntry>>>;

    async fn describe(&self, selector: &Selector) -> Result<Resolved<String>>;

    /// Whether `principal` may apply `verb` to `selector`.
    fn permits(&self, principal: &Identity, verb: Verb, selector: &Selector) -> bool;
}

/// Resolver that serves nothing; every lookup is `404 MISSING`.
pub struct EmptyResolver;

#[async_trait]
impl SelectorResolver for EmptyResolver {
    async fn list(&self, selector: &Selector) -> Result<Resolved<Vec<MapEntry>>> {
        Err(RabbitError::NotFound(selector.to_string()))
    }

    async fn fetch(
        &self,
        selector: &Selector,
        _accept_view: Option<&str>,
    ) -> Result<Resolved<Content>> {
        Err(RabbitError::NotFound(selector.to_string()))
    }

    async fn search(&self, selector: &Selector, _query: &str) -> Result<Resolved<Vec<MapEntry>>> {
        Err(RabbitError::NotFound(selector.to_string()))
    }

    async fn describe(&self, selector: &Selector) -> Result<Resolved<String>> {
        Err(RabbitError::NotFound(selector.to_string()))
    }

    fn permits(&self, _principal: &Identity, _verb: Verb, _selector: &Selector) -> bool {
        true
    }
}

/// Discovery source with no peers.
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn peers(&self) -> Vec<String> {
        Vec::new()
    }
}

/// What the multiplexer should do with a handled request.
pub enum DispatchOutcome {
    /// Send these frames on the request's lane, in order.
    Replies(Vec<Frame>),
    /// Register a subscription, then send `reply` (`201 SUBSCRIBED`).
    Subscribe {
        selector: Selector,
        since: Option<SinceCursor>,
        reply: Frame,
    },
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct IdemKey {
    principal: String,
    selector: String,
    idem: String,
}

/// Verb dispatcher. One per engine, shared across tunnels.
pub struct Dispatcher {
    resolver: Arc<dyn SelectorResolver>,
    topics: Arc<SubscriptionEngine>,
    discovery: Arc<dyn Discovery>,
    config: EngineConfig,
    idem_cache: Mutex<HashMap<IdemKey, (Instant, Status)>>,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<dyn SelectorResolver>,
        topics: Arc<SubscriptionEngine>,
        discovery: Arc<dyn Discovery>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            topics,
            discovery,
            config,
            idem_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one request frame. Never errors outward; failures become
    /// status replies.
    pub async fn dispatch(&self, request: &Frame, session: &Session) -> DispatchOutcome {
        let deadline = request
            .header(headers::TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let handled = match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.handle(request, session)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(RabbitError::Timeout),
            },
            None => self.handle(request, session).await,
        };
        match handled {
            Ok(outcome) => outcome,
            Err(err) => {
                let status = match &err {
                    // Dispatcher-level surprises surface as 520 with a
                    // stable phrase; everything typed keeps its code.
                    RabbitError::Io(_) | RabbitError::ConnectionClosed => Status::INTERNAL,
                    other => other.status(),
                };
                debug!(%err, code = status.code(), "request failed");
                let mut reply = Frame::response_to(status, request);
                if let RabbitError::OutOfOrder { expected, .. } = &err {
                    reply.set_header(headers::EXPECTED, expected.to_string());
                }
                DispatchOutcome::Replies(vec![reply])
            }
        }
    }

    async fn handle(&self, request: &Frame, session: &Session) -> Result<DispatchOutcome> {
        let verb = request
            .verb()
            .ok_or_else(|| RabbitError::ProtocolViolation("response frame dispatched".into()))?;

        if let Some(hops) = request.header(headers::HOPS) {
            let hops: u32 = hops.parse().map_err(|_| {
                RabbitError::ProtocolViolation(format!("bad Hops value: {hops}"))
            })?;
            if hops > self.config.hop_limit {
                return Err(RabbitError::Precondition(format!(
                    "hop limit {} exceeded",
                    self.config.hop_limit
                )));
            }
        }

        match verb {
            Verb::Ping => Ok(DispatchOutcome::Replies(vec![Frame::response_to(
                Status::PONG,
                request,
            )])),
            Verb::Offer => self.handle_offer(request).await,
            Verb::List
            | Verb::Fetch
            | Verb::Search
            | Verb::Describe
            | Verb::Subscribe
            | Verb::Publish => self.handle_selector_verb(verb, request, session).await,
            Verb::Hello | Verb::Auth | Verb::Event | Verb::Ack | Verb::Credit | Verb::Cancel => {
                Err(RabbitError::ProtocolViolation(format!(
                    "{verb} is not dispatched here"
                )))
            }
        }
    }

    async fn handle_offer(&self, request: &Frame) -> Result<DispatchOutcome> {
        let raw = request
            .selector_arg()
            .ok_or_else(|| RabbitError::ProtocolViolation("OFFER missing selector".into()))?;
        let selector = Selector::parse(raw)?;
        if !selector.is_warren() {
            return Err(RabbitError::ProtocolViolation(
                "OFFER only serves /warren".into(),
            ));
        }
        let peers = self.discovery.peers();
        let mut reply = Frame::response_to(Status::PEERS, request);
        reply.body = encode_peer_list(&peers);
        Ok(DispatchOutcome::Replies(vec![reply]))
    }

    async fn handle_selector_verb(
        &self,
        verb: Verb,
        request: &Frame,
        session: &Session,
    ) -> Result<DispatchOutcome> {
        let raw = request
            .selector_arg()
            .ok_or_else(|| RabbitError::ProtocolViolation(format!("{verb} missing selector")))?;
        let selector = Selector::parse(raw)?;
        if !selector.permits_verb(verb) {
            return Err(RabbitError::ProtocolViolation(format!(
                "{verb} is not legal for {selector}"
            )));
        }
        if !self.resolver.permits(&session.identity, verb, &selector) {
            return Err(RabbitError::Forbidden(selector.to_string()));
        }

        let idem_key = request.header(headers::IDEM).map(|idem| IdemKey {
            principal: session.identity.to_string(),
            selector: selector.to_string(),
            idem: idem.to_string(),
        });
        if let Some(key) = &idem_key {
            if let Some(status) = self.idem_lookup(key).await {
                debug!(selector = %selector, "replaying idempotent status");
                return Ok(DispatchOutcome::Replies(vec![Frame::response_to(
                    status, request,
                )]));
            }
        }

        let outcome = match verb {
            Verb::List => {
                let entries = match self.resolver.list(&selector).await? {
                    Resolved::Local(entries) => entries,
                    other => return Ok(self.redirect(other_location(other), request)),
                };
                let mut reply = Frame::response_to(Status::MENU, request);
                reply.set_header(headers::VIEW, "application/rabbitmap");
                reply.body = encode_menu(&entries);
                DispatchOutcome::Replies(vec![reply])
            }
            Verb::Fetch => {
                let accept = request.view();
                let content = match self.resolver.fetch(&selector, accept).await? {
                    Resolved::Local(content) => content,
                    other => return Ok(self.redirect(other_location(other), request)),
                };
                DispatchOutcome::Replies(self.content_replies(request, content))
            }
            Verb::Search => {
                let query = request.header(headers::QUERY).ok_or_else(|| {
                    RabbitError::ProtocolViolation("SEARCH missing Query".into())
                })?;
                let entries = match self.resolver.search(&selector, query).await? {
                    Resolved::Local(entries) => entries,
                    other => return Ok(self.redirect(other_location(other), request)),
                };
                let mut reply = Frame::response_to(Status::MENU, request);
                reply.set_header(headers::VIEW, "application/rabbitmap");
                reply.body = encode_menu(&entries);
                DispatchOutcome::Replies(vec![reply])
            }
            Verb::Describe => {
                let schema = match self.resolver.describe(&selector).await? {
                    Resolved::Local(schema) => schema,
                    other => return Ok(self.redirect(other_location(other), request)),
                };
                let mut reply = Frame::response_to(Status::DESCRIPTION, request);
                reply.set_header(headers::VIEW, "text/rabbit-description");
                reply.body = Bytes::from(schema);
                DispatchOutcome::Replies(vec![reply])
            }
            Verb::Subscribe => {
                let since = match request.header(headers::SINCE) {
                    Some(value) => Some(SinceCursor::parse(
                        value,
                        session.caps.contains(CapSet::SINCE_SEQ),
                    )?),
                    None => None,
                };
                if since.is_some() && !self.topics.has_oracle() {
                    return Err(RabbitError::Precondition(
                        "Since requires a continuity oracle".into(),
                    ));
                }
                let mut reply = Frame::response_to(Status::SUBSCRIBED, request);
                reply.set_header(
                    headers::HEARTBEATS,
                    self.config.heartbeat.as_secs().to_string(),
                );
                DispatchOutcome::Subscribe { selector, since, reply }
            }
            Verb::Publish => {
                let seq = self
                    .topics
                    .publish(selector.as_str(), request.body.clone())
                    .await?;
                debug!(selector = %selector, seq, "published");
                DispatchOutcome::Replies(vec![Frame::response_to(Status::DONE, request)])
            }
            _ => unreachable!("handled above"),
        };

        if let Some(key) = idem_key {
            let status = match &outcome {
                DispatchOutcome::Replies(replies) => replies.first().and_then(first_status),
                DispatchOutcome::Subscribe { .. } => None,
            };
            if let Some(status) = status {
                self.idem_store(key, status).await;
            }
        }
        Ok(outcome)
    }

    /// Build the reply frames for fetched content, chunking bodies above
    /// the non-chunked limit.
    fn content_replies(&self, request: &Frame, content: Content) -> Vec<Frame> {
        if content.body.len() <= self.config.non_chunked_body_max {
            let mut reply = Frame::response_to(Status::CONTENT, request);
            reply.set_header(headers::VIEW, content.view);
            reply.body = content.body;
            return vec![reply];
        }
        let mut envelope = Frame::response_to(Status::CONTENT, request);
        envelope.set_header(headers::VIEW, content.view);
        envelope.set_header(headers::TRANSFER, "chunked");
        let mut frames = vec![envelope];
        let chunks: Vec<Bytes> = chunk_body(&content.body, CHUNK_SIZE);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let part = match i {
                0 => ChunkPart::Begin,
                n if n == last => ChunkPart::End,
                _ => ChunkPart::More,
            };
            let mut frame = Frame::response_to(Status::CONTENT, request);
            frame.set_header(headers::PART, part.as_str());
            frame.body = chunk;
            frames.push(frame);
        }
        frames
    }

    fn redirect(&self, location: String, request: &Frame) -> DispatchOutcome {
        let mut reply = Frame::response_to(Status::MOVED, request);
        reply.set_header(headers::LOCATION, location);
        DispatchOutcome::Replies(vec![reply])
    }

    async fn idem_lookup(&self, key: &IdemKey) -> Option<Status> {
        let mut cache = self.idem_cache.lock().await;
        match cache.get(key) {
            Some((at, status)) if at.elapsed() <= self.config.idem_ttl => Some(*status),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn idem_store(&self, key: IdemKey, status: Status) {
        let mut cache = self.idem_cache.lock().await;
        // Opportunistic sweep keeps the window map from growing without a
        // dedicated janitor task.
        if cache.len() > 1024 {
            let ttl = self.config.idem_ttl;
            cache.retain(|_, (at, _)| at.elapsed() <= ttl);
        }
        cache.insert(key, (Instant::now(), status));
    }
}

/// Split a body into chunk payloads of at most `size` bytes.
fn chunk_body(body: &Bytes, size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + size).min(body.len());
        chunks.push(body.slice(offset..end));
        offset = end;
    }
    if chunks.is_empty() {
        chunks.push(Bytes::new());
    }
    chunks
}

fn other_location<T>(resolved: Resolved<T>) -> String {
    match resolved {
        Resolved::Moved { location } => location,
        Resolved::Delegated { host } => host,
        Resolved::Local(_) => {
            warn!("redirect requested for local resolution");
            String::new()
        }
    }
}

fn first_status(frame: &Frame) -> Option<Status> {
    // Statuses are re-derived from the canonical table so the cached copy
    // stays `'static`.
    match (frame.status_code()?, frame.status_phrase()?) {
        (200, "MENU") => Some(Status::MENU),
        (200, "CONTENT") => Some(Status::CONTENT),
        (200, "DESCRIPTION") => Some(Status::DESCRIPTION),
        (204, "DONE") => Some(Status::DONE),
        (301, "MOVED") => Some(Status::MOVED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CapSet;

    struct ScriptedResolver;

    #[async_trait]
    impl SelectorResolver for ScriptedResolver {
        async fn list(&self, selector: &Selector) -> Result<Resolved<Vec<MapEntry>>> {
            match selector.as_str() {
                "/" => Ok(Resolved::Local(vec![MapEntry::local(
                    crate::protocol::ItemType::Text,
                    "Read me",
                    "/0/readme",
                )])),
                "/1/moved" => Ok(Resolved::Moved { location: "/1/docs".into() }),
                _ => Err(RabbitError::NotFound(selector.to_string())),
            }
        }

        async fn fetch(
            &self,
            selector: &Selector,
            _accept_view: Option<&str>,
        ) -> Result<Resolved<Content>> {
            match selector.as_str() {
                "/0/readme" => Ok(Resolved::Local(Content::text("Rabbit runs fast and light."))),
                "/9/big" => Ok(Resolved::Local(Content {
                    body: Bytes::from(vec![0xAB; 3 * 1024 * 1024]),
                    view: "application/octet-stream".into(),
                })),
                "/0/secret" => Err(RabbitError::Forbidden(selector.to_string())),
                _ => Err(RabbitError::NotFound(selector.to_string())),
            }
        }

        async fn search(
            &self,
            _selector: &Selector,
            query: &str,
        ) -> Result<Resolved<Vec<MapEntry>>> {
            if query == "carrot" {
                Ok(Resolved::Local(vec![MapEntry::local(
                    crate::protocol::ItemType::Text,
                    "Carrot facts",
                    "/0/carrots",
                )]))
            } else {
                Ok(Resolved::Local(Vec::new()))
            }
        }

        async fn describe(&self, _selector: &Selector) -> Result<Resolved<String>> {
            Ok(Resolved::Local("item readme\n  view text/plain\n".into()))
        }

        fn permits(&self, _principal: &Identity, verb: Verb, selector: &Selector) -> bool {
            !(verb == Verb::Fetch && selector.as_str() == "/0/walled")
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(ScriptedResolver),
            Arc::new(SubscriptionEngine::new(None)),
            Arc::new(NoDiscovery),
            EngineConfig::default(),
        )
    }

    fn session() -> Session {
        Session::anonymous(CapSet::all())
    }

    fn request(verb: Verb, selector: &str, lane: u16, txn: &str) -> Frame {
        let mut frame = Frame::request_with(verb, selector);
        frame.set_lane(lane);
        frame.set_txn(txn);
        frame
    }

    fn only_reply(outcome: DispatchOutcome) -> Frame {
        match outcome {
            DispatchOutcome::Replies(mut replies) => {
                assert_eq!(replies.len(), 1);
                replies.remove(0)
            }
            DispatchOutcome::Subscribe { .. } => panic!("unexpected subscribe"),
        }
    }

    #[tokio::test]
    async fn test_list_returns_menu() {
        let reply = only_reply(
            dispatcher()
                .dispatch(&request(Verb::List, "/", 1, "L1"), &session())
                .await,
        );
        assert_eq!(reply.status_phrase(), Some("MENU"));
        assert_eq!(reply.lane(), Some(1));
        assert_eq!(reply.txn(), Some("L1"));
        let entries = crate::protocol::decode_menu(&reply.body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].selector, "/0/readme");
    }

    #[tokio::test]
    async fn test_fetch_small_body() {
        let reply = only_reply(
            dispatcher()
                .dispatch(&request(Verb::Fetch, "/0/readme", 3, "F1"), &session())
                .await,
        );
        assert_eq!(reply.status_phrase(), Some("CONTENT"));
        assert_eq!(reply.view(), Some("text/plain"));
        assert_eq!(&reply.body[..], b"Rabbit runs fast and light.");
    }

    #[tokio::test]
    async fn test_fetch_large_body_chunked() {
        let outcome = dispatcher()
            .dispatch(&request(Verb::Fetch, "/9/big", 3, "F2"), &session())
            .await;
        let DispatchOutcome::Replies(frames) = outcome else {
            panic!("expected replies");
        };
        assert!(frames[0].is_chunked());
        assert!(frames.len() > 2);
        assert_eq!(frames[1].part(), Some(ChunkPart::Begin));
        assert_eq!(frames.last().unwrap().part(), Some(ChunkPart::End));
        let total: usize = frames[1..].iter().map(|f| f.body.len()).sum();
        assert_eq!(total, 3 * 1024 * 1024);
        // Every part echoes the transaction.
        assert!(frames.iter().all(|f| f.txn() == Some("F2")));
    }

    #[tokio::test]
    async fn test_fetch_missing_is_404() {
        let reply = only_reply(
            dispatcher()
                .dispatch(&request(Verb::Fetch, "/0/nope", 3, "F3"), &session())
                .await,
        );
        assert_eq!(reply.status_code(), Some(404));
        assert_eq!(reply.txn(), Some("F3"));
    }

    #[tokio::test]
    async fn test_permission_denied_is_403() {
        let reply = only_reply(
            dispatcher()
                .dispatch(&request(Verb::Fetch, "/0/walled", 3, "F4"), &session())
                .await,
        );
        assert_eq!(reply.status_code(), Some(403));
    }

    #[tokio::test]
    async fn test_verb_illegal_for_type_is_400() {
        // SUBSCRIBE on a text selector
        let reply = only_reply(
            dispatcher()
                .dispatch(&request(Verb::Subscribe, "/0/readme", 5, "Q1"), &session())
                .await,
        );
        assert_eq!(reply.status_code(), Some(400));
    }

    #[tokio::test]
    async fn test_search_returns_menu() {
        let mut req = request(Verb::Search, "/7/find", 2, "S1");
        req.set_header(headers::QUERY, "carrot");
        let reply = only_reply(dispatcher().dispatch(&req, &session()).await);
        assert_eq!(reply.status_phrase(), Some("MENU"));
        let entries = crate::protocol::decode_menu(&reply.body).unwrap();
        assert_eq!(entries[0].display, "Carrot facts");
    }

    #[tokio::test]
    async fn test_search_empty_result_is_wellformed_menu() {
        let mut req = request(Verb::Search, "/7/find", 2, "S2");
        req.set_header(headers::QUERY, "nothing");
        let reply = only_reply(dispatcher().dispatch(&req, &session()).await);
        assert!(crate::protocol::decode_menu(&reply.body).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_moved_redirect() {
        let reply = only_reply(
            dispatcher()
                .dispatch(&request(Verb::List, "/1/moved", 1, "L2"), &session())
                .await,
        );
        assert_eq!(reply.status_code(), Some(301));
        assert_eq!(reply.header(headers::LOCATION), Some("/1/docs"));
    }

    #[tokio::test]
    async fn test_subscribe_outcome() {
        let outcome = dispatcher()
            .dispatch(&request(Verb::Subscribe, "/q/news", 5, "Q1"), &session())
            .await;
        match outcome {
            DispatchOutcome::Subscribe { selector, since, reply } => {
                assert_eq!(selector.as_str(), "/q/news");
                assert!(since.is_none());
                assert_eq!(reply.status_code(), Some(201));
                assert_eq!(reply.header(headers::HEARTBEATS), Some("30"));
            }
            DispatchOutcome::Replies(replies) => {
                panic!("expected subscribe, got {:?}", replies[0].status_code())
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_since_without_oracle_412() {
        let mut req = request(Verb::Subscribe, "/q/news", 5, "Q2");
        req.set_header(headers::SINCE, "2026-08-01T00:00:00Z");
        let reply = only_reply(dispatcher().dispatch(&req, &session()).await);
        assert_eq!(reply.status_code(), Some(412));
    }

    #[tokio::test]
    async fn test_publish_done() {
        let mut req = request(Verb::Publish, "/q/news", 8, "P1");
        req.body = Bytes::from_static(b"Rabbit spec finalized.");
        let reply = only_reply(dispatcher().dispatch(&req, &session()).await);
        assert_eq!(reply.status_code(), Some(204));
        assert_eq!(reply.status_phrase(), Some("DONE"));
    }

    #[tokio::test]
    async fn test_offer_lists_peers() {
        struct TwoPeers;
        impl Discovery for TwoPeers {
            fn peers(&self) -> Vec<String> {
                vec!["dns:hutch.example".into(), "ed25519:MFRGGZDF".into()]
            }
        }
        let dispatcher = Dispatcher::new(
            Arc::new(ScriptedResolver),
            Arc::new(SubscriptionEngine::new(None)),
            Arc::new(TwoPeers),
            EngineConfig::default(),
        );
        let reply = only_reply(
            dispatcher
                .dispatch(&request(Verb::Offer, "/warren", 1, "O1"), &session())
                .await,
        );
        assert_eq!(reply.status_phrase(), Some("PEERS"));
        let text = std::str::from_utf8(&reply.body).unwrap();
        assert!(text.contains("burrow: dns:hutch.example\r\n"));
        assert!(text.ends_with(".\r\n"));
    }

    #[tokio::test]
    async fn test_hop_limit_412() {
        let mut req = request(Verb::Fetch, "/0/readme", 3, "F5");
        req.set_header(headers::HOPS, "9");
        let reply = only_reply(dispatcher().dispatch(&req, &session()).await);
        assert_eq!(reply.status_code(), Some(412));
    }

    #[tokio::test]
    async fn test_idem_replays_status() {
        let d = dispatcher();
        let mut req = request(Verb::Publish, "/q/news", 8, "P1");
        req.set_header(headers::IDEM, "dedupe-1");
        req.body = Bytes::from_static(b"once");
        let first = only_reply(d.dispatch(&req, &session()).await);
        assert_eq!(first.status_code(), Some(204));

        // Same Idem replays 204 without re-publishing.
        let mut again = request(Verb::Publish, "/q/news", 8, "P2");
        again.set_header(headers::IDEM, "dedupe-1");
        again.body = Bytes::from_static(b"twice");
        let second = only_reply(d.dispatch(&again, &session()).await);
        assert_eq!(second.status_code(), Some(204));
        assert_eq!(second.txn(), Some("P2"));
        assert_eq!(
            d.topics.publish("/q/news", Bytes::new()).await.unwrap(),
            2,
            "only the first publish reached the topic"
        );
    }

    #[tokio::test]
    async fn test_dispatch_timeout_maps_to_408() {
        struct SlowResolver;
        #[async_trait]
        impl SelectorResolver for SlowResolver {
            async fn list(&self, _: &Selector) -> Result<Resolved<Vec<MapEntry>>> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Resolved::Local(Vec::new()))
            }
            async fn fetch(&self, _: &Selector, _: Option<&str>) -> Result<Resolved<Content>> {
                unimplemented!()
            }
            async fn search(&self, _: &Selector, _: &str) -> Result<Resolved<Vec<MapEntry>>> {
                unimplemented!()
            }
            async fn describe(&self, _: &Selector) -> Result<Resolved<String>> {
                unimplemented!()
            }
            fn permits(&self, _: &Identity, _: Verb, _: &Selector) -> bool {
                true
            }
        }
        let dispatcher = Dispatcher::new(
            Arc::new(SlowResolver),
            Arc::new(SubscriptionEngine::new(None)),
            Arc::new(NoDiscovery),
            EngineConfig::default(),
        );
        let mut req = request(Verb::List, "/", 1, "L9");
        req.set_header(headers::TIMEOUT, "0");
        let reply = only_reply(dispatcher.dispatch(&req, &session()).await);
        assert_eq!(reply.status_code(), Some(408));
    }

    #[test]
    fn test_chunk_body_boundaries() {
        let body = Bytes::from(vec![1u8; 10]);
        let chunks = chunk_body(&body, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4);
        assert_eq!(chunks[2].len(), 2);
    }
}
