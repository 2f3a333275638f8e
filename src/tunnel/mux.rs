//! Tunnel multiplexer.
//!
//! One read task decodes frames and routes them to lanes; one writer task
//! drains the fair per-lane queues; a heartbeat task keeps lane 0 alive
//! and emits subscription liveness markers. Verb handlers run as spawned
//! tasks so a slow resolver never stalls the read loop.
//!
//! ```text
//!            ┌► lane 0 control (PING/PONG, global errors)
//! transport ─┤► responses ─► txn awaiters
//!   reads    ├► EVENT ─► subscription streams
//!            └► requests ─► dispatcher tasks ─┐
//!                                             ▼
//! transport ◄── writer task ◄── per-lane outbound queues
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::lane::{ChunkPush, LaneMode, Opener, SendDecision};
use super::lane_table::LaneTable;
use super::writer::{spawn_writer_task, OutboundQueues};
use super::TxnCounter;
use crate::config::EngineConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{RabbitError, Result};
use crate::handshake::ResumeRequest;
use crate::protocol::{decode_menu, headers, Frame, FrameBuffer, MapEntry, Verb};
use crate::session::{
    RetainedSubscription, RetainedTunnel, Session, SessionStore,
};
use crate::status::Status;
use crate::subscribe::{EventRecord, EventSink, SinceCursor, SubscriberId, SubscriptionEngine};

/// Which side of the handshake this tunnel held. The responder issued the
/// resume token and parks state on transport loss; the initiator snapshots
/// what it needs to present `Resume:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

const STATE_RUNNING: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One delivered subscription event.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    /// Topic selector the event was published to.
    pub selector: String,
    /// Lane-local event seq; `None` for heartbeat markers.
    pub seq: Option<u64>,
    /// Event payload.
    pub body: Bytes,
}

/// Client half of a subscription: an async stream of events.
pub struct Subscription {
    lane: u16,
    selector: String,
    receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("lane", &self.lane)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Lane carrying this subscription.
    pub fn lane(&self) -> u16 {
        self.lane
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Next event, or `None` once the subscription is torn down.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll used by tests.
    pub fn try_next(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }
}

struct ClientSub {
    selector: String,
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
}

struct ServerSub {
    selector: String,
    subscriber: Option<SubscriberId>,
    /// Lane seq of the most recently delivered event.
    event_count: u64,
    /// Delivered, unacked events: (lane seq, topic seq).
    pending: VecDeque<(u64, u64)>,
    last_acked_topic_seq: u64,
    last_delivery: Instant,
}

pub(crate) struct TunnelParams {
    pub config: EngineConfig,
    pub session: Session,
    pub role: Role,
    pub peer_token: Option<String>,
    pub dispatcher: Arc<Dispatcher>,
    pub topics: Arc<SubscriptionEngine>,
    pub sessions: Arc<SessionStore>,
}

pub(crate) struct TunnelShared {
    config: EngineConfig,
    session: Session,
    role: Role,
    /// Resume token the peer issued to us (initiator side).
    peer_token: Option<String>,
    lanes: LaneTable,
    out: Arc<OutboundQueues>,
    txns: TxnCounter,
    next_lane: AtomicU16,
    subs_in: Mutex<HashMap<u16, ClientSub>>,
    subs_out: Mutex<HashMap<u16, ServerSub>>,
    /// Chunked-transfer envelopes awaiting their parts, by (lane, txn).
    chunk_envelopes: Mutex<HashMap<(u16, String), Frame>>,
    dispatcher: Arc<Dispatcher>,
    topics: Arc<SubscriptionEngine>,
    sessions: Arc<SessionStore>,
    last_inbound: Mutex<Instant>,
    outstanding_pings: AtomicU32,
    state: AtomicU8,
    resume_snapshot: Mutex<Option<ResumeRequest>>,
    closed: Notify,
}

impl TunnelShared {
    fn new(params: TunnelParams, out: Arc<OutboundQueues>) -> Arc<Self> {
        Arc::new(Self {
            lanes: LaneTable::new(params.config.max_lanes, params.config.initial_credit),
            out,
            txns: TxnCounter::new(),
            next_lane: AtomicU16::new(1),
            subs_in: Mutex::new(HashMap::new()),
            subs_out: Mutex::new(HashMap::new()),
            chunk_envelopes: Mutex::new(HashMap::new()),
            dispatcher: params.dispatcher,
            topics: params.topics,
            sessions: params.sessions,
            last_inbound: Mutex::new(Instant::now()),
            outstanding_pings: AtomicU32::new(0),
            state: AtomicU8::new(STATE_RUNNING),
            resume_snapshot: Mutex::new(None),
            closed: Notify::new(),
            config: params.config,
            session: params.session,
            role: params.role,
            peer_token: params.peer_token,
        })
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Send a frame outside the credit window (control frames, status
    /// replies the peer must see even when starved).
    async fn send_raw(&self, lane: u16, frame: Frame) {
        self.out.enqueue(lane, frame.encode()).await;
    }

    /// Send a frame through the lane's credit window.
    async fn send_on_lane(&self, lane: u16, frame: Frame, stamp_seq: bool) -> Result<()> {
        let decision = self
            .lanes
            .with_lane(lane, Opener::Local, |l| l.try_send(frame, stamp_seq))
            .await?;
        if let SendDecision::Send(frame) = decision {
            self.out.enqueue(lane, frame.encode()).await;
        }
        Ok(())
    }

    /// Pick a lane id for a locally-opened lane, skipping lane 0 and ids
    /// already in use (restored or peer-opened).
    async fn alloc_lane_id(&self) -> u16 {
        loop {
            let id = self.next_lane.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.lanes.contains(id).await {
                return id;
            }
        }
    }

    /// Route one inbound frame. An `Err` is tunnel-fatal.
    async fn route(self: &Arc<Self>, frame: Frame) -> Result<()> {
        *self.last_inbound.lock().await = Instant::now();
        let lane = frame.lane().unwrap_or(0);
        trace!(lane, "inbound frame");

        // Lane 0 control plane.
        if lane == 0 {
            return self.route_control(frame).await;
        }

        match frame.verb() {
            Some(Verb::Ping) => {
                self.send_raw(lane, Frame::response_to(Status::PONG, &frame)).await;
                return Ok(());
            }
            Some(Verb::Ack) => {
                if let Some(k) = frame.ack_seq() {
                    self.lanes
                        .with_existing(lane, |l| l.record_peer_ack(k))
                        .await;
                    self.note_subscriber_ack(lane, k).await;
                }
                return Ok(());
            }
            Some(Verb::Credit) => {
                if let Some(n) = frame.credit_grant() {
                    let released = self
                        .lanes
                        .with_existing(lane, |l| l.grant_send_credit(n))
                        .await
                        .unwrap_or_default();
                    for frame in released {
                        self.out.enqueue(lane, frame.encode()).await;
                    }
                }
                return Ok(());
            }
            Some(Verb::Cancel) => {
                self.handle_cancel(lane, frame).await;
                return Ok(());
            }
            Some(Verb::Hello) | Some(Verb::Auth) => {
                // HELLO strictly precedes everything and lives on lane 0.
                self.send_raw(0, Frame::response(Status::BAD_REQUEST)).await;
                return Err(RabbitError::ProtocolViolation(
                    "handshake frame after handshake".into(),
                ));
            }
            _ => {}
        }

        // Admission: first frame with a fresh id opens the lane.
        let admitted = self
            .lanes
            .with_lane(lane, Opener::Peer, |l| l.opener)
            .await;
        let opener = match admitted {
            Ok(opener) => opener,
            Err(err) => {
                let mut reply = Frame::response_to(err.status(), &frame);
                reply.set_lane(lane);
                self.send_raw(lane, reply).await;
                return Ok(());
            }
        };

        // A request on a lane we opened is an id collision; the opener
        // renegotiates with a different id.
        if opener == Opener::Local && frame.verb().map(|v| v.expects_response()).unwrap_or(false)
        {
            self.send_raw(lane, Frame::response_to(Status::BAD_HELLO, &frame))
                .await;
            return Ok(());
        }

        // Sequencing: frames bearing `Seq:` must arrive in order.
        if let Some(seq) = frame.seq() {
            let accepted = self
                .lanes
                .with_existing(lane, |l| l.accept_inbound_seq(seq))
                .await
                .unwrap_or(Ok(()));
            if let Err(err) = accepted {
                if let RabbitError::OutOfOrder { expected, .. } = err {
                    let mut reply = Frame::response_to(Status::OUT_OF_ORDER, &frame);
                    reply.set_header(headers::EXPECTED, expected.to_string());
                    self.send_raw(lane, reply).await;
                }
                return Ok(());
            }
        }

        // Inbound data consumes the credit we granted; top the peer up
        // once the window drops below the low watermark.
        if !frame.is_control() {
            let top_up = self
                .lanes
                .with_existing(lane, |l| l.consume_recv_credit())
                .await
                .flatten();
            if let Some(n) = top_up {
                let mut credit = Frame::request(Verb::Credit);
                credit.set_lane(lane);
                credit.set_header(headers::CREDIT, format!("+{n}"));
                self.send_raw(lane, credit).await;
            }
        }

        // Chunked transfer: stash envelopes, feed parts, resume routing
        // once a body completes.
        if frame.is_chunked() {
            if let Some(txn) = frame.txn() {
                self.chunk_envelopes
                    .lock()
                    .await
                    .insert((lane, txn.to_string()), frame);
            }
            return Ok(());
        }
        if let Some(part) = frame.part() {
            let Some(txn) = frame.txn().map(str::to_string) else {
                return Ok(());
            };
            let cap = self.config.reassembly_cap;
            let push = self
                .lanes
                .with_existing(lane, |l| l.chunk_push(&txn, part, &frame.body, cap))
                .await;
            match push {
                Some(ChunkPush::Complete(body)) => {
                    let envelope = self
                        .chunk_envelopes
                        .lock()
                        .await
                        .remove(&(lane, txn.clone()));
                    if let Some(mut envelope) = envelope {
                        envelope.remove_header(headers::TRANSFER);
                        envelope.body = body;
                        self.route_assembled(lane, envelope).await;
                    }
                }
                Some(ChunkPush::Overflow) => {
                    warn!(lane, txn = %txn, "chunked body exceeded cap");
                    let reply = Frame::response_to(Status::FRAME_TOO_LARGE, &frame);
                    self.send_raw(lane, reply).await;
                    self.chunk_envelopes.lock().await.remove(&(lane, txn.clone()));
                    self.lanes
                        .with_existing(lane, |l| l.cancel_txn(&txn))
                        .await;
                }
                Some(ChunkPush::Incomplete) | None => {}
            }
            return Ok(());
        }

        self.route_assembled(lane, frame).await;
        Ok(())
    }

    /// Route a frame whose body is complete (directly or via reassembly).
    async fn route_assembled(self: &Arc<Self>, lane: u16, frame: Frame) {
        if frame.status_code().is_some() {
            if let Some(txn) = frame.txn() {
                let txn = txn.to_string();
                let completed = self
                    .lanes
                    .with_existing(lane, |l| l.complete_txn(&txn, Ok(frame)))
                    .await
                    .unwrap_or(false);
                if !completed {
                    debug!(lane, txn = %txn, "response without awaiter");
                }
            }
            return;
        }
        match frame.verb() {
            Some(Verb::Event) => self.deliver_event(lane, frame).await,
            Some(_) => {
                let shared = self.clone();
                tokio::spawn(async move {
                    shared.handle_request(lane, frame).await;
                });
            }
            None => {}
        }
    }

    /// Lane-0 traffic: keepalive and global errors.
    async fn route_control(self: &Arc<Self>, frame: Frame) -> Result<()> {
        if let Some(verb) = frame.verb() {
            match verb {
                Verb::Ping => {
                    self.send_raw(0, Frame::response_to(Status::PONG, &frame)).await;
                    return Ok(());
                }
                Verb::Hello | Verb::Auth => {
                    self.send_raw(0, Frame::response(Status::BAD_REQUEST)).await;
                    return Err(RabbitError::ProtocolViolation(
                        "HELLO must precede all other frames".into(),
                    ));
                }
                _ => {
                    debug!(%verb, "ignoring control-lane verb");
                    return Ok(());
                }
            }
        }
        match (frame.status_code(), frame.status_phrase()) {
            (Some(200), Some("PONG")) => {
                self.outstanding_pings.store(0, Ordering::Release);
                Ok(())
            }
            (Some(code), _) if code >= 400 => Err(RabbitError::ProtocolViolation(format!(
                "peer reported tunnel error {code}"
            ))),
            _ => Ok(()),
        }
    }

    async fn handle_cancel(self: &Arc<Self>, lane: u16, frame: Frame) {
        if let Some(txn) = frame.txn() {
            let txn = txn.to_string();
            self.lanes.with_existing(lane, |l| l.cancel_txn(&txn)).await;
            self.chunk_envelopes.lock().await.remove(&(lane, txn));
        }
        // A canceled subscription is torn down with its lane.
        let sub = self.subs_out.lock().await.remove(&lane);
        if let Some(sub) = sub {
            if let Some(id) = sub.subscriber {
                self.topics.unsubscribe(&sub.selector, id).await;
            }
        }
        self.subs_in.lock().await.remove(&lane);
        self.send_raw(lane, Frame::response_to(Status::CANCELED, &frame))
            .await;
        self.lanes
            .with_existing(lane, |l| l.mode = LaneMode::Closing)
            .await;
    }

    /// Deliver an inbound `EVENT` to the local subscription stream.
    async fn deliver_event(&self, lane: u16, frame: Frame) {
        let seq = frame.seq();
        let selector = frame.selector_arg().unwrap_or_default().to_string();
        let delivered = {
            let subs = self.subs_in.lock().await;
            match subs.get(&lane) {
                Some(sub) => sub
                    .sender
                    .send(SubscriptionEvent {
                        selector: selector.clone(),
                        seq,
                        body: frame.body.clone(),
                    })
                    .is_ok(),
                None => {
                    debug!(lane, "event on lane without subscription");
                    return;
                }
            }
        };
        if !delivered {
            // Stream consumer is gone; tear the subscription down.
            self.subs_in.lock().await.remove(&lane);
            let mut cancel = Frame::request(Verb::Cancel);
            cancel.set_lane(lane);
            self.send_raw(lane, cancel).await;
            return;
        }
        // Heartbeat markers carry no seq and are not acked.
        if let Some(seq) = seq {
            self.lanes
                .with_existing(lane, |l| l.record_local_ack(seq))
                .await;
            let mut ack = Frame::request(Verb::Ack);
            ack.set_lane(lane);
            ack.set_header(headers::ACK, seq.to_string());
            self.send_raw(lane, ack).await;
        }
    }

    /// Run one request through the dispatcher and send its replies.
    async fn handle_request(self: &Arc<Self>, lane: u16, frame: Frame) {
        match self.dispatcher.dispatch(&frame, &self.session).await {
            DispatchOutcome::Replies(replies) => {
                for reply in replies {
                    if let Err(err) = self.send_on_lane(lane, reply, false).await {
                        warn!(lane, %err, "failed to queue reply");
                        return;
                    }
                }
            }
            DispatchOutcome::Subscribe { selector, since, reply } => {
                self.start_subscription(lane, selector.as_str(), since, Some(reply))
                    .await;
            }
        }
    }

    /// Server side of SUBSCRIBE: wire a lane-backed sink into the topic
    /// registry. `reply` (the `201 SUBSCRIBED`) goes out before the sink
    /// registers, so backfilled events follow it on the wire.
    async fn start_subscription(
        self: &Arc<Self>,
        lane: u16,
        selector: &str,
        since: Option<SinceCursor>,
        reply: Option<Frame>,
    ) {
        let base = self
            .lanes
            .with_existing(lane, |l| {
                l.mode = LaneMode::Subscribed;
                l.peer_ack()
            })
            .await
            .unwrap_or(0);
        {
            let mut subs = self.subs_out.lock().await;
            subs.insert(
                lane,
                ServerSub {
                    selector: selector.to_string(),
                    subscriber: None,
                    event_count: base,
                    pending: VecDeque::new(),
                    last_acked_topic_seq: 0,
                    last_delivery: Instant::now(),
                },
            );
        }
        if let Some(reply) = reply {
            if let Err(err) = self.send_on_lane(lane, reply, false).await {
                warn!(lane, %err, "failed to queue SUBSCRIBED reply");
            }
        }
        let sink = Arc::new(LaneEventSink { shared: Arc::downgrade(self), lane });
        match self.topics.subscribe(selector, since, sink).await {
            Ok(id) => {
                let mut subs = self.subs_out.lock().await;
                if let Some(sub) = subs.get_mut(&lane) {
                    sub.subscriber = Some(id);
                }
            }
            Err(err) => {
                warn!(lane, selector, %err, "subscription failed");
                self.subs_out.lock().await.remove(&lane);
            }
        }
    }

    /// Map a subscriber's cumulative lane ack onto topic seqs.
    async fn note_subscriber_ack(&self, lane: u16, k: u64) {
        let mut subs = self.subs_out.lock().await;
        if let Some(sub) = subs.get_mut(&lane) {
            while let Some((lane_seq, topic_seq)) = sub.pending.front().copied() {
                if lane_seq > k {
                    break;
                }
                sub.pending.pop_front();
                sub.last_acked_topic_seq = topic_seq;
            }
        }
    }

    /// Heartbeat pass: lane-0 keepalive plus idle-subscription markers.
    async fn heartbeat_tick(self: &Arc<Self>) -> Result<()> {
        let idle = self.last_inbound.lock().await.elapsed();
        if idle >= self.config.heartbeat {
            if self.outstanding_pings.fetch_add(1, Ordering::AcqRel) >= 2 {
                return Err(RabbitError::Timeout);
            }
            let mut ping = Frame::request(Verb::Ping);
            ping.set_lane(0);
            self.send_raw(0, ping).await;
        }

        let idle_subs: Vec<(u16, String)> = {
            let mut subs = self.subs_out.lock().await;
            let mut idle = Vec::new();
            for (lane, sub) in subs.iter_mut() {
                if sub.last_delivery.elapsed() >= self.config.heartbeat {
                    sub.last_delivery = Instant::now();
                    idle.push((*lane, sub.selector.clone()));
                }
            }
            idle
        };
        for (lane, selector) in idle_subs {
            // Liveness marker: no Seq, explicit zero length, never acked.
            let mut marker = Frame::request_with(Verb::Event, selector);
            marker.set_lane(lane);
            marker.set_header(headers::LENGTH, "0");
            self.send_raw(lane, marker).await;
        }
        Ok(())
    }

    /// Graceful close: cancel live subscriptions, drain, shut the writer.
    async fn close_graceful(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let client_lanes: Vec<u16> = self.subs_in.lock().await.keys().copied().collect();
        for lane in client_lanes {
            let mut cancel = Frame::request(Verb::Cancel);
            cancel.set_lane(lane);
            self.send_raw(lane, cancel).await;
        }
        let server_subs: Vec<(u16, ServerSub)> =
            self.subs_out.lock().await.drain().collect();
        for (_, sub) in server_subs {
            if let Some(id) = sub.subscriber {
                self.topics.unsubscribe(&sub.selector, id).await;
            }
        }
        self.out.close().await;
        self.finish_close().await;
    }

    /// Transport ended without a graceful close: park resumable state.
    async fn close_abrupt(self: &Arc<Self>) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        match self.role {
            Role::Responder => {
                let lanes = self.lanes.snapshot_retained().await;
                // Collect under the lock, unsubscribe after releasing it:
                // the publish path takes these locks in the other order.
                let (subscriptions, drained) = {
                    let mut subs = self.subs_out.lock().await;
                    let subscriptions: Vec<RetainedSubscription> = subs
                        .iter()
                        .map(|(lane, sub)| RetainedSubscription {
                            selector: sub.selector.clone(),
                            lane: *lane,
                            last_acked_topic_seq: sub.last_acked_topic_seq,
                            pending: sub.pending.iter().copied().collect(),
                        })
                        .collect();
                    let drained: Vec<(String, Option<SubscriberId>)> = subs
                        .drain()
                        .map(|(_, sub)| (sub.selector, sub.subscriber))
                        .collect();
                    (subscriptions, drained)
                };
                for (selector, id) in drained {
                    if let Some(id) = id {
                        self.topics.unsubscribe(&selector, id).await;
                    }
                }
                debug!(
                    token = %self.session.resume_token,
                    lanes = lanes.len(),
                    "parking tunnel state for resume"
                );
                self.sessions
                    .retain(RetainedTunnel::new(self.session.clone(), lanes, subscriptions))
                    .await;
            }
            Role::Initiator => {
                if let Some(token) = &self.peer_token {
                    let mut lane_acks = Vec::new();
                    for id in self.lanes.ids().await {
                        let ack = self
                            .lanes
                            .with_existing(id, |l| l.local_ack())
                            .await
                            .unwrap_or(0);
                        if ack > 0 {
                            lane_acks.push((id, ack));
                        }
                    }
                    let subscriptions: Vec<(String, u16)> = self
                        .subs_in
                        .lock()
                        .await
                        .iter()
                        .map(|(lane, sub)| (sub.selector.clone(), *lane))
                        .collect();
                    *self.resume_snapshot.lock().await = Some(ResumeRequest {
                        token: token.clone(),
                        lane_acks,
                        subscriptions,
                    });
                }
            }
        }
        self.finish_close_inner().await;
    }

    async fn finish_close(self: &Arc<Self>) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.finish_close_inner().await;
    }

    async fn finish_close_inner(self: &Arc<Self>) {
        self.lanes.close_all().await;
        self.out.close().await;
        self.subs_in.lock().await.clear();
        self.closed.notify_waiters();
    }
}

/// Delivery endpoint for one server-side subscriber lane.
struct LaneEventSink {
    shared: Weak<TunnelShared>,
    lane: u16,
}

#[async_trait]
impl EventSink for LaneEventSink {
    async fn deliver(&self, event: &EventRecord) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or(RabbitError::ConnectionClosed)?;
        if shared.is_closed() {
            return Err(RabbitError::ConnectionClosed);
        }
        let max_inflight = shared.config.max_inflight_per_subscriber;
        let decision = shared
            .lanes
            .with_existing(self.lane, |l| {
                if l.queued_len() >= max_inflight {
                    return Err(RabbitError::FlowLimit(format!(
                        "subscriber lane {} exceeded {} queued events",
                        l.id(),
                        max_inflight
                    )));
                }
                let mut frame = Frame::request_with(Verb::Event, event.selector.clone());
                frame.set_lane(l.id());
                frame.body = event.payload.clone();
                Ok(l.try_send(frame, true))
            })
            .await
            .ok_or(RabbitError::ConnectionClosed)??;
        if let SendDecision::Send(frame) = decision {
            shared.out.enqueue(self.lane, frame.encode()).await;
        }
        let mut subs = shared.subs_out.lock().await;
        if let Some(sub) = subs.get_mut(&self.lane) {
            sub.event_count += 1;
            sub.pending.push_back((sub.event_count, event.topic_seq));
            sub.last_delivery = Instant::now();
        }
        Ok(())
    }

    async fn overflow(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        warn!(lane = self.lane, "disconnecting slow subscriber");
        let mut reply = Frame::response(Status::FLOW_LIMIT);
        reply.set_lane(self.lane);
        shared.send_raw(self.lane, reply).await;
        shared.subs_out.lock().await.remove(&self.lane);
        shared.lanes.close_lane(self.lane).await;
    }
}

/// A running tunnel. Cloning is cheap; all clones drive the same tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<TunnelShared>,
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle").finish_non_exhaustive()
    }
}

impl TunnelHandle {
    /// Negotiated session context.
    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Resume token the peer issued to us, when it did.
    pub fn peer_resume_token(&self) -> Option<&str> {
        self.shared.peer_token.as_deref()
    }

    /// Whether the tunnel has fully closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the tunnel closes.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.closed.notified().await;
    }

    /// Issue a request and await its response.
    ///
    /// Allocates a lane and `Txn` unless the frame carries them. A
    /// `Timeout:` header (seconds) arms a local deadline; on expiry the
    /// peer gets `CANCEL` and the caller `RabbitError::Timeout`.
    pub async fn request(&self, mut frame: Frame) -> Result<Frame> {
        if self.shared.is_closed() {
            return Err(RabbitError::ConnectionClosed);
        }
        let lane = match frame.lane() {
            Some(lane) => lane,
            None => {
                let lane = self.shared.alloc_lane_id().await;
                frame.set_lane(lane);
                lane
            }
        };
        if frame.txn().is_none() {
            frame.set_txn(self.shared.txns.next());
        }
        let txn = frame.txn().unwrap_or_default().to_string();
        let deadline = frame
            .header(headers::TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);

        let (tx, rx) = oneshot::channel();
        let decision = self
            .shared
            .lanes
            .with_lane(lane, Opener::Local, |l| {
                l.mode = LaneMode::Request;
                l.register_txn(&txn, tx)?;
                Ok::<_, RabbitError>(l.try_send(frame, false))
            })
            .await??;
        if let SendDecision::Send(frame) = decision {
            self.shared.out.enqueue(lane, frame.encode()).await;
        }

        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.shared
                        .lanes
                        .with_existing(lane, |l| l.cancel_txn(&txn))
                        .await;
                    let mut cancel = Frame::request(Verb::Cancel);
                    cancel.set_lane(lane);
                    cancel.set_txn(&txn);
                    let _ = self.shared.send_on_lane(lane, cancel, false).await;
                    return Err(RabbitError::Timeout);
                }
            },
            None => rx.await,
        };
        match received {
            Ok(result) => result,
            Err(_) => Err(RabbitError::ConnectionClosed),
        }
    }

    /// `LIST <sel>` and decode the returned Rabbitmap.
    pub async fn list(&self, selector: &str) -> Result<Vec<MapEntry>> {
        let reply = self
            .request(Frame::request_with(Verb::List, selector))
            .await?;
        expect_status(&reply, 200)?;
        decode_menu(&reply.body)
    }

    /// `FETCH <sel>`: returns the full response frame (body plus `View:`).
    pub async fn fetch(&self, selector: &str) -> Result<Frame> {
        let reply = self
            .request(Frame::request_with(Verb::Fetch, selector))
            .await?;
        expect_status(&reply, 200)?;
        Ok(reply)
    }

    /// `SEARCH <sel>` with a query.
    pub async fn search(&self, selector: &str, query: &str) -> Result<Vec<MapEntry>> {
        let mut frame = Frame::request_with(Verb::Search, selector);
        frame.set_header(headers::QUERY, query);
        let reply = self.request(frame).await?;
        expect_status(&reply, 200)?;
        decode_menu(&reply.body)
    }

    /// `DESCRIBE <sel>`: the schema body as UTF-8.
    pub async fn describe(&self, selector: &str) -> Result<String> {
        let reply = self
            .request(Frame::request_with(Verb::Describe, selector))
            .await?;
        expect_status(&reply, 200)?;
        String::from_utf8(reply.body.to_vec())
            .map_err(|_| RabbitError::ProtocolViolation("description is not UTF-8".into()))
    }

    /// `PUBLISH <sel>` a payload; resolves on `204 DONE`.
    pub async fn publish(&self, selector: &str, body: impl Into<Bytes>) -> Result<()> {
        let mut frame = Frame::request_with(Verb::Publish, selector);
        frame.body = body.into();
        let reply = self.request(frame).await?;
        expect_status(&reply, 204)?;
        Ok(())
    }

    /// `OFFER /warren`: peer identities known to the remote burrow.
    pub async fn offer(&self) -> Result<Vec<String>> {
        let reply = self
            .request(Frame::request_with(Verb::Offer, crate::protocol::WARREN_SELECTOR))
            .await?;
        expect_status(&reply, 200)?;
        let text = std::str::from_utf8(&reply.body)
            .map_err(|_| RabbitError::ProtocolViolation("peer list is not UTF-8".into()))?;
        Ok(text
            .split("\r\n")
            .filter_map(|line| line.strip_prefix("burrow: "))
            .map(str::to_string)
            .collect())
    }

    /// Round-trip keepalive.
    pub async fn ping(&self) -> Result<()> {
        let reply = self.request(Frame::request(Verb::Ping)).await?;
        expect_status(&reply, 200)?;
        Ok(())
    }

    /// `SUBSCRIBE <sel>`, optionally resuming from a `Since:` position.
    ///
    /// The event stream is registered before the request goes out, so
    /// backfilled events racing the `201 SUBSCRIBED` are never lost.
    pub async fn subscribe(&self, selector: &str, since: Option<&str>) -> Result<Subscription> {
        let lane = self.shared.alloc_lane_id().await;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subs_in.lock().await.insert(
            lane,
            ClientSub { selector: selector.to_string(), sender },
        );
        let mut frame = Frame::request_with(Verb::Subscribe, selector);
        frame.set_lane(lane);
        if let Some(since) = since {
            frame.set_header(headers::SINCE, since);
        }
        match self.request(frame).await {
            Ok(reply) if reply.status_code() == Some(201) => {
                self.shared
                    .lanes
                    .with_existing(lane, |l| l.mode = LaneMode::Subscribed)
                    .await;
                Ok(Subscription { lane, selector: selector.to_string(), receiver })
            }
            Ok(reply) => {
                self.shared.subs_in.lock().await.remove(&lane);
                Err(status_error(&reply))
            }
            Err(err) => {
                self.shared.subs_in.lock().await.remove(&lane);
                Err(err)
            }
        }
    }

    /// Cancel an outstanding transaction on a lane.
    pub async fn cancel(&self, lane: u16, txn: &str) -> Result<()> {
        let mut frame = Frame::request(Verb::Cancel);
        frame.set_lane(lane);
        frame.set_txn(txn);
        self.shared
            .lanes
            .with_existing(lane, |l| l.cancel_txn(txn))
            .await;
        self.shared.send_on_lane(lane, frame, false).await
    }

    /// Graceful shutdown: cancel subscriptions, drain, close.
    pub async fn close(&self) {
        self.shared.close_graceful().await;
    }

    /// Snapshot for reconnecting after a transport loss. Available once
    /// the peer issued a resume token; on a live tunnel it reflects the
    /// current ack positions.
    pub async fn resume_request(&self) -> Option<ResumeRequest> {
        if let Some(snapshot) = self.shared.resume_snapshot.lock().await.clone() {
            return Some(snapshot);
        }
        let token = self.shared.peer_token.clone()?;
        let mut lane_acks = Vec::new();
        for id in self.shared.lanes.ids().await {
            let ack = self
                .shared
                .lanes
                .with_existing(id, |l| l.local_ack())
                .await
                .unwrap_or(0);
            if ack > 0 {
                lane_acks.push((id, ack));
            }
        }
        let subscriptions: Vec<(String, u16)> = self
            .shared
            .subs_in
            .lock()
            .await
            .iter()
            .map(|(lane, sub)| (sub.selector.clone(), *lane))
            .collect();
        Some(ResumeRequest { token, lane_acks, subscriptions })
    }

    /// Depth of the outbound queues, for tests and introspection.
    pub async fn outbound_depth(&self) -> usize {
        self.shared.out.depth().await
    }

    // Engine-internal wiring below.

    /// Restore parked lanes and replay unacked frames (responder resume).
    pub(crate) async fn restore_retained(
        &self,
        retained: &RetainedTunnel,
        lane_acks: &[(u16, u64)],
    ) {
        let sub_lanes: Vec<u16> = retained.subscriptions.iter().map(|s| s.lane).collect();
        let replay = self
            .shared
            .lanes
            .restore(&retained.lanes, lane_acks, Opener::Peer)
            .await;
        for (lane, frame) in replay {
            if sub_lanes.contains(&lane) {
                continue;
            }
            self.shared.out.enqueue(lane, frame.encode()).await;
        }
        for sub in &retained.subscriptions {
            // Events past the ack re-deliver from the oracle with their
            // old lane seqs, so rewind the stamp position first.
            let ack = lane_acks
                .iter()
                .find(|(lane, _)| *lane == sub.lane)
                .map(|(_, ack)| *ack);
            let mut last_acked = sub.last_acked_topic_seq;
            if let Some(ack) = ack {
                for (lane_seq, topic_seq) in &sub.pending {
                    if *lane_seq <= ack {
                        last_acked = *topic_seq;
                    }
                }
            }
            self.shared
                .lanes
                .with_existing(sub.lane, |l| {
                    l.rewind_unacked();
                    l.mode = LaneMode::Subscribed;
                })
                .await;
            self.shared
                .start_subscription(
                    sub.lane,
                    &sub.selector,
                    Some(SinceCursor::Seq(last_acked)),
                    None,
                )
                .await;
        }
    }

    /// Re-register client-side state after a `201 RESUMED` (initiator).
    pub(crate) async fn apply_client_resume(
        &self,
        resume: &ResumeRequest,
    ) -> Vec<(String, Subscription)> {
        for (lane, ack) in &resume.lane_acks {
            let _ = self
                .shared
                .lanes
                .with_lane(*lane, Opener::Local, |l| {
                    l.set_peer_seq_expected(*ack + 1);
                    l.record_local_ack(*ack);
                })
                .await;
        }
        let mut streams = Vec::new();
        for (selector, lane) in &resume.subscriptions {
            let (sender, receiver) = mpsc::unbounded_channel();
            self.shared.subs_in.lock().await.insert(
                *lane,
                ClientSub { selector: selector.clone(), sender },
            );
            self.shared
                .lanes
                .with_existing(*lane, |l| l.mode = LaneMode::Subscribed)
                .await;
            streams.push((
                selector.clone(),
                Subscription {
                    lane: *lane,
                    selector: selector.clone(),
                    receiver,
                },
            ));
        }
        streams
    }
}

/// Map a non-success response onto the error taxonomy.
fn status_error(frame: &Frame) -> RabbitError {
    let phrase = frame.status_phrase().unwrap_or_default().to_string();
    match frame.status_code() {
        Some(403) => RabbitError::Forbidden(phrase),
        Some(404) => RabbitError::NotFound(phrase),
        Some(408) => RabbitError::Timeout,
        Some(412) => RabbitError::Precondition(phrase),
        Some(429) => RabbitError::FlowLimit(phrase),
        Some(431) => RabbitError::BadHello(phrase),
        Some(440) => RabbitError::Unauthorized(phrase),
        Some(499) => RabbitError::Canceled,
        Some(503) => RabbitError::Busy(phrase),
        Some(520) => RabbitError::Internal(phrase),
        Some(code) => RabbitError::ProtocolViolation(format!("unexpected status {code} {phrase}")),
        None => RabbitError::ProtocolViolation("expected a response frame".into()),
    }
}

fn expect_status(frame: &Frame, code: u16) -> Result<()> {
    if frame.status_code() == Some(code) {
        Ok(())
    } else {
        Err(status_error(frame))
    }
}

/// Start the tunnel's background tasks over a split transport.
///
/// `leftover` and `initial_frames` carry anything the handshake read past
/// its own frames; they are processed before new transport reads. When
/// `start_gate` is given, the read task waits for it before touching any
/// frame, so resume wiring can finish first.
pub(crate) fn spawn_tunnel<R, W>(
    read_half: R,
    write_half: W,
    leftover: FrameBuffer,
    initial_frames: Vec<Frame>,
    start_gate: Option<oneshot::Receiver<()>>,
    params: TunnelParams,
) -> TunnelHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let out = OutboundQueues::new();
    let shared = TunnelShared::new(params, out.clone());
    spawn_writer_task(write_half, out);

    let reader_shared = shared.clone();
    tokio::spawn(async move {
        if let Some(gate) = start_gate {
            let _ = gate.await;
        }
        for frame in initial_frames {
            if let Err(err) = reader_shared.route(frame).await {
                error!(%err, "tunnel-fatal frame");
                reader_shared.close_graceful().await;
                return;
            }
        }
        read_loop(read_half, leftover, reader_shared).await;
    });

    let heartbeat_shared = shared.clone();
    tokio::spawn(async move {
        let period = heartbeat_shared.config.heartbeat;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_shared.is_closed() {
                break;
            }
            if heartbeat_shared.heartbeat_tick().await.is_err() {
                warn!("peer missed keepalives, closing tunnel");
                heartbeat_shared.close_abrupt().await;
                break;
            }
        }
    });

    TunnelHandle { shared }
}

async fn read_loop<R>(mut read_half: R, mut buffer: FrameBuffer, shared: Arc<TunnelShared>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => {
                if let Err(err) = buffer.finish() {
                    warn!(%err, "transport ended mid-frame");
                }
                break;
            }
            Ok(n) => n,
            Err(err) => {
                debug!(%err, "transport read failed");
                break;
            }
        };
        let frames = match buffer.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                error!(%err, "codec failure, closing tunnel");
                let mut reply = Frame::response(Status::BAD_REQUEST);
                reply.set_lane(0);
                shared.send_raw(0, reply).await;
                // Codec state is unrecoverable; no resume window.
                shared.state.store(STATE_CLOSED, Ordering::Release);
                shared.finish_close_inner().await;
                return;
            }
        };
        for frame in frames {
            if let Err(err) = shared.route(frame).await {
                error!(%err, "tunnel-fatal frame");
                shared.close_graceful().await;
                return;
            }
        }
        if shared.is_closed() {
            return;
        }
    }
    if shared.state.load(Ordering::Acquire) == STATE_RUNNING {
        shared.close_abrupt().await;
    } else {
        shared.finish_close_inner().await;
    }
}
