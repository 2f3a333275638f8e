//! Engine builder and tunnel establishment.
//!
//! An [`Engine`] bundles everything one burrow needs to speak Rabbit: the
//! content resolver, identity provider, discovery source, subscription
//! engine, and the session store backing resumption. It opens tunnels in
//! either role over any [`Transport`]:
//!
//! ```ignore
//! let engine = Engine::builder()
//!     .resolver(my_resolver)
//!     .oracle(MemoryOracle::new())
//!     .build();
//!
//! let (server_side, client_side) = memory_pair(64 * 1024);
//! let server = tokio::spawn({
//!     let engine = engine.clone();
//!     async move { engine.accept(server_side).await }
//! });
//! let tunnel = engine.connect(client_side).await?;
//! let menu = tunnel.list("/").await?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, EmptyResolver, NoDiscovery, SelectorResolver};
use crate::error::{RabbitError, Result};
use crate::handshake::{
    AuthPolicy, Handshake, HelloOutcome, ResumeRequest, EKM_LABEL, EKM_LEN,
};
use crate::identity::{AnonymousProvider, Identity, IdentityProvider, TrustLevel};
use crate::protocol::{headers, Frame, FrameBuffer};
use crate::session::{CapSet, Session, SessionStore};
use crate::subscribe::{ContinuityOracle, SubscriptionEngine};
use crate::transport::Transport;
use crate::tunnel::{spawn_tunnel, Role, Subscription, TunnelHandle, TunnelParams};
use crate::warren::Discovery;

/// Fluent configuration for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    resolver: Arc<dyn SelectorResolver>,
    identity: Arc<dyn IdentityProvider>,
    discovery: Arc<dyn Discovery>,
    oracle: Option<Arc<dyn ContinuityOracle>>,
    policy: AuthPolicy,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            resolver: Arc::new(EmptyResolver),
            identity: Arc::new(AnonymousProvider),
            discovery: Arc::new(NoDiscovery),
            oracle: None,
            policy: AuthPolicy::Open,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: impl SelectorResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn resolver_arc(mut self, resolver: Arc<dyn SelectorResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn identity(mut self, identity: impl IdentityProvider + 'static) -> Self {
        self.identity = Arc::new(identity);
        self
    }

    pub fn identity_arc(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn discovery(mut self, discovery: impl Discovery + 'static) -> Self {
        self.discovery = Arc::new(discovery);
        self
    }

    pub fn discovery_arc(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn oracle(mut self, oracle: impl ContinuityOracle + 'static) -> Self {
        self.oracle = Some(Arc::new(oracle));
        self
    }

    pub fn oracle_arc(mut self, oracle: Arc<dyn ContinuityOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Engine {
        let sessions = Arc::new(SessionStore::new(self.config.resume_ttl));
        let topics = Arc::new(SubscriptionEngine::new(self.oracle));
        let dispatcher = Arc::new(Dispatcher::new(
            self.resolver,
            topics.clone(),
            self.discovery,
            self.config.clone(),
        ));
        let handshake = Arc::new(Handshake::new(
            self.identity,
            sessions.clone(),
            self.policy,
            &self.config,
        ));
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                topics,
                sessions,
                dispatcher,
                handshake,
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct EngineInner {
    config: EngineConfig,
    topics: Arc<SubscriptionEngine>,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<Dispatcher>,
    handshake: Arc<Handshake>,
}

/// One burrow's protocol engine. Cheap to clone; tunnels share its topic
/// registry and session store.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The topic registry, for publishing events locally (without a
    /// tunnel) and inspecting subscriber counts.
    pub fn topics(&self) -> &Arc<SubscriptionEngine> {
        &self.inner.topics
    }

    /// Publish to a local topic; remote subscribers on any tunnel of this
    /// engine receive the event.
    pub async fn publish(&self, selector: &str, body: impl Into<Bytes>) -> Result<u64> {
        self.inner.topics.publish(selector, body.into()).await
    }

    /// Answer an inbound transport as the responder.
    pub async fn accept<T: Transport>(&self, transport: T) -> Result<TunnelHandle> {
        let ekm = transport.exported_keying_material(EKM_LABEL, EKM_LEN);
        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = HandshakeReader::new(read_half, &self.inner.config);
        let mut write_half = write_half;

        let hello = reader.next_frame(&self.inner.config).await?;
        match self.inner.handshake.process_hello(&hello).await {
            HelloOutcome::Accept { session, reply } => {
                send_direct(&mut write_half, &reply).await?;
                Ok(self.spawn(reader, write_half, session, Role::Responder, None, None))
            }
            HelloOutcome::Challenge { pending, reply } => {
                send_direct(&mut write_half, &reply).await?;
                let auth = reader.next_frame(&self.inner.config).await?;
                match self
                    .inner
                    .handshake
                    .process_auth(&auth, &pending, ekm.as_deref())
                    .await
                {
                    Ok((session, reply)) => {
                        send_direct(&mut write_half, &reply).await?;
                        Ok(self.spawn(reader, write_half, session, Role::Responder, None, None))
                    }
                    Err(err) => {
                        let reply = Frame::response(err.status());
                        send_direct(&mut write_half, &reply).await?;
                        Err(err)
                    }
                }
            }
            HelloOutcome::Resume { retained, lane_acks, reply } => {
                send_direct(&mut write_half, &reply).await?;
                let session = retained.session.clone();
                // Hold inbound routing until the lanes are restored.
                let (open, gate) = tokio::sync::oneshot::channel();
                let handle =
                    self.spawn(reader, write_half, session, Role::Responder, None, Some(gate));
                handle.restore_retained(&retained, &lane_acks).await;
                let _ = open.send(());
                Ok(handle)
            }
            HelloOutcome::Reject { reply } => {
                let code = reply.status_code().unwrap_or(431);
                send_direct(&mut write_half, &reply).await?;
                if code == 440 {
                    Err(RabbitError::Unauthorized("identity proof required".into()))
                } else {
                    Err(RabbitError::BadHello("negotiation failed".into()))
                }
            }
        }
    }

    /// Open an outbound tunnel as the initiator.
    pub async fn connect<T: Transport>(&self, transport: T) -> Result<TunnelHandle> {
        let ekm = transport.exported_keying_material(EKM_LABEL, EKM_LEN);
        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = HandshakeReader::new(read_half, &self.inner.config);
        let mut write_half = write_half;

        let hello = self.inner.handshake.hello_frame(None);
        send_direct(&mut write_half, &hello).await?;
        let mut reply = reader.next_frame(&self.inner.config).await?;

        if reply.status_code() == Some(300) {
            let auth = self.inner.handshake.answer_challenge(&reply, ekm.as_deref())?;
            send_direct(&mut write_half, &auth).await?;
            reply = reader.next_frame(&self.inner.config).await?;
        }

        match reply.status_code() {
            Some(200) => {
                let session = session_from_reply(&reply, &self.inner.handshake)?;
                let peer_token = reply.header(headers::RESUME).map(str::to_string);
                debug!(caps = %session.caps, "tunnel established");
                Ok(self.spawn(reader, write_half, session, Role::Initiator, peer_token, None))
            }
            Some(440) => Err(RabbitError::Unauthorized("peer requires proof".into())),
            _ => Err(RabbitError::BadHello(format!(
                "handshake refused: {} {}",
                reply.status_code().unwrap_or(0),
                reply.status_phrase().unwrap_or_default()
            ))),
        }
    }

    /// Reconnect within the resume window, restoring lanes and
    /// subscriptions. Returns the handle plus the re-attached event
    /// streams, in the order of `resume.subscriptions`.
    pub async fn resume<T: Transport>(
        &self,
        transport: T,
        resume: ResumeRequest,
    ) -> Result<(TunnelHandle, Vec<(String, Subscription)>)> {
        let (read_half, write_half) = tokio::io::split(transport);
        let mut reader = HandshakeReader::new(read_half, &self.inner.config);
        let mut write_half = write_half;

        let hello = self.inner.handshake.hello_frame(Some(&resume));
        send_direct(&mut write_half, &hello).await?;
        let reply = reader.next_frame(&self.inner.config).await?;
        if reply.status_code() != Some(201) {
            return Err(RabbitError::BadHello(format!(
                "resume refused: {} {}",
                reply.status_code().unwrap_or(0),
                reply.status_phrase().unwrap_or_default()
            )));
        }
        let session = session_from_reply(&reply, &self.inner.handshake)?;
        let token = resume.token.clone();
        // Hold inbound routing until the event streams are re-attached,
        // so backfill racing the 201 cannot be dropped.
        let (open, gate) = tokio::sync::oneshot::channel();
        let handle =
            self.spawn(reader, write_half, session, Role::Initiator, Some(token), Some(gate));
        let streams = handle.apply_client_resume(&resume).await;
        let _ = open.send(());
        Ok((handle, streams))
    }

    fn spawn<T: Transport>(
        &self,
        reader: HandshakeReader<T>,
        write_half: WriteHalf<T>,
        session: Session,
        role: Role,
        peer_token: Option<String>,
        start_gate: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> TunnelHandle {
        let HandshakeReader { read_half, buffer, queued, .. } = reader;
        spawn_tunnel(
            read_half,
            write_half,
            buffer,
            queued,
            start_gate,
            TunnelParams {
                config: self.inner.config.clone(),
                session,
                role,
                peer_token,
                dispatcher: self.inner.dispatcher.clone(),
                topics: self.inner.topics.clone(),
                sessions: self.inner.sessions.clone(),
            },
        )
    }
}

/// Build the initiator's session from the responder's accept reply.
fn session_from_reply(reply: &Frame, handshake: &Handshake) -> Result<Session> {
    let caps = reply
        .header(headers::CAPS)
        .map(CapSet::parse)
        .unwrap_or_else(|| handshake.local_caps());
    let identity = match reply.header(headers::BURROW_ID) {
        Some(raw) => raw.parse::<Identity>()?,
        None => Identity::Anonymous,
    };
    Ok(Session {
        identity,
        caps,
        trust: TrustLevel::SelfSigned,
        resume_token: String::new(),
    })
}

async fn send_direct<W: AsyncWrite + Unpin>(write_half: &mut W, frame: &Frame) -> Result<()> {
    write_half.write_all(&frame.encode()).await?;
    write_half.flush().await?;
    Ok(())
}

/// Frame reader used before the tunnel's read task exists. Keeps the
/// byte-level buffer and any over-read frames for handoff.
struct HandshakeReader<T> {
    read_half: ReadHalf<T>,
    buffer: FrameBuffer,
    queued: Vec<Frame>,
}

impl<T: Transport> HandshakeReader<T> {
    fn new(read_half: ReadHalf<T>, config: &EngineConfig) -> Self {
        Self {
            read_half,
            buffer: FrameBuffer::with_limits(
                config.frame_header_max,
                config.non_chunked_body_max,
            ),
            queued: Vec::new(),
        }
    }

    async fn next_frame(&mut self, config: &EngineConfig) -> Result<Frame> {
        tokio::time::timeout(config.heartbeat, self.read_one())
            .await
            .map_err(|_| RabbitError::Timeout)?
    }

    async fn read_one(&mut self) -> Result<Frame> {
        use tokio::io::AsyncReadExt;
        loop {
            if !self.queued.is_empty() {
                return Ok(self.queued.remove(0));
            }
            let mut chunk = [0u8; 4096];
            let n = self.read_half.read(&mut chunk).await?;
            if n == 0 {
                return Err(RabbitError::ConnectionClosed);
            }
            self.queued.extend(self.buffer.push(&chunk[..n])?);
        }
    }
}
