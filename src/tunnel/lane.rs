//! Per-lane state machine.
//!
//! A lane is an independent ordered channel inside a tunnel: its own
//! sequence counters, cumulative acks, credit window, outstanding
//! transactions, and chunked-body reassembly. Lanes do no I/O; the
//! multiplexer consults them when routing frames and the writer drains
//! what they release.

use std::collections::{HashMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{RabbitError, Result};
use crate::protocol::{ChunkPart, Frame};
use crate::session::RetainedLane;

/// Lane lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneMode {
    Idle,
    Request,
    Streaming,
    Subscribed,
    Closing,
}

/// Which side opened the lane (sent its first frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opener {
    Local,
    Peer,
}

/// Decision for an outbound frame against the credit window.
#[derive(Debug)]
pub enum SendDecision {
    /// Credit available; send this (possibly seq-stamped) frame now.
    Send(Frame),
    /// No credit; the frame is queued until the peer grants more.
    Queued,
}

/// Result of feeding one `Part:` frame into reassembly.
#[derive(Debug)]
pub enum ChunkPush {
    /// More parts expected.
    Incomplete,
    /// `END` received; here is the assembled body.
    Complete(Bytes),
    /// Buffered bytes exceeded the cap; the transaction must be canceled.
    Overflow,
}

#[derive(Debug)]
struct ChunkBuffer {
    buf: BytesMut,
    cap: usize,
}

#[derive(Debug)]
struct QueuedFrame {
    frame: Frame,
    stamp_seq: bool,
}

/// State for one lane.
pub struct Lane {
    id: u16,
    pub mode: LaneMode,
    pub opener: Opener,
    /// Next inbound `Seq:` we will accept.
    peer_seq_expected: u64,
    /// Next outbound `Seq:` we will assign.
    local_seq_next: u64,
    /// Highest seq the peer has acked (cumulative).
    peer_ack: u64,
    /// Highest inbound seq we have acked.
    local_ack: u64,
    /// Frames we may still send before the peer must grant again.
    send_credit: u32,
    /// Outstanding grant to the peer, replenished on consumption.
    recv_granted: u32,
    recv_initial: u32,
    /// Outbound frames blocked on credit, FIFO.
    pending_out: VecDeque<QueuedFrame>,
    /// Sent seq-stamped frames not yet acked, for resume replay.
    retained: VecDeque<(u64, Frame)>,
    /// Outstanding requests awaiting a response, by `Txn`.
    txns: HashMap<String, oneshot::Sender<Result<Frame>>>,
    /// Chunked bodies under reassembly, by `Txn`.
    reassembly: HashMap<String, ChunkBuffer>,
    /// Last frame activity, for keepalive decisions.
    pub last_activity: Instant,
}

impl Lane {
    /// Create a lane. Both sides assume the configured initial credit in
    /// each direction; later adjustments travel as `CREDIT: +N`.
    pub fn new(id: u16, opener: Opener, initial_credit: u32) -> Self {
        Self {
            id,
            mode: LaneMode::Idle,
            opener,
            peer_seq_expected: 1,
            local_seq_next: 1,
            peer_ack: 0,
            local_ack: 0,
            send_credit: initial_credit,
            recv_granted: initial_credit,
            recv_initial: initial_credit,
            pending_out: VecDeque::new(),
            retained: VecDeque::new(),
            txns: HashMap::new(),
            reassembly: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    /// Rebuild a lane from parked resume state.
    pub fn from_retained(
        id: u16,
        opener: Opener,
        initial_credit: u32,
        retained: &RetainedLane,
    ) -> Self {
        let mut lane = Self::new(id, opener, initial_credit);
        lane.local_seq_next = retained.local_seq_next;
        lane.peer_seq_expected = retained.peer_seq_expected;
        lane.peer_ack = retained.peer_ack;
        lane.retained = retained.unacked.iter().cloned().collect();
        lane
    }

    /// Snapshot sender-side state for the resume window.
    pub fn to_retained(&self) -> RetainedLane {
        RetainedLane {
            local_seq_next: self.local_seq_next,
            peer_seq_expected: self.peer_seq_expected,
            peer_ack: self.peer_ack,
            unacked: self.retained.iter().cloned().collect(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn send_credit(&self) -> u32 {
        self.send_credit
    }

    pub fn peer_ack(&self) -> u64 {
        self.peer_ack
    }

    pub fn local_ack(&self) -> u64 {
        self.local_ack
    }

    pub fn next_expected_seq(&self) -> u64 {
        self.peer_seq_expected
    }

    pub fn queued_len(&self) -> usize {
        self.pending_out.len()
    }

    /// Apply the credit window to an outbound frame.
    ///
    /// With credit available the frame is released (seq-stamped and
    /// retained when `stamp_seq`); otherwise it is queued FIFO until
    /// [`grant_send_credit`](Self::grant_send_credit) releases it.
    pub fn try_send(&mut self, frame: Frame, stamp_seq: bool) -> SendDecision {
        if self.send_credit == 0 {
            self.pending_out.push_back(QueuedFrame { frame, stamp_seq });
            return SendDecision::Queued;
        }
        self.send_credit -= 1;
        SendDecision::Send(self.release(frame, stamp_seq))
    }

    /// Record a `CREDIT: +N` grant and release queued frames, in order.
    pub fn grant_send_credit(&mut self, n: u32) -> Vec<Frame> {
        self.send_credit = self.send_credit.saturating_add(n);
        let mut released = Vec::new();
        while self.send_credit > 0 {
            match self.pending_out.pop_front() {
                Some(queued) => {
                    self.send_credit -= 1;
                    released.push(self.release(queued.frame, queued.stamp_seq));
                }
                None => break,
            }
        }
        released
    }

    fn release(&mut self, mut frame: Frame, stamp_seq: bool) -> Frame {
        if stamp_seq {
            let seq = self.local_seq_next;
            self.local_seq_next += 1;
            frame.set_seq(seq);
            self.retained.push_back((seq, frame.clone()));
        }
        frame
    }

    /// Validate an inbound `Seq:` against the expected position.
    pub fn accept_inbound_seq(&mut self, seq: u64) -> Result<()> {
        if seq != self.peer_seq_expected {
            return Err(RabbitError::OutOfOrder {
                lane: self.id,
                expected: self.peer_seq_expected,
                got: seq,
            });
        }
        self.peer_seq_expected += 1;
        Ok(())
    }

    /// Record that we acked inbound seqs up to `seq`.
    pub fn record_local_ack(&mut self, seq: u64) {
        if seq > self.local_ack {
            self.local_ack = seq;
        }
    }

    /// Apply a cumulative `ACK: k` from the peer. Duplicates are
    /// idempotent; regressions are ignored.
    pub fn record_peer_ack(&mut self, k: u64) {
        if k > self.peer_ack {
            self.peer_ack = k;
            self.retained.retain(|(seq, _)| *seq > k);
        }
    }

    /// Account one consumed unit of the grant we gave the peer. Returns a
    /// top-up amount once the outstanding grant falls below the low
    /// watermark (half the initial grant).
    pub fn consume_recv_credit(&mut self) -> Option<u32> {
        self.recv_granted = self.recv_granted.saturating_sub(1);
        if self.recv_granted < self.recv_initial / 2 || self.recv_granted == 0 {
            let top_up = self.recv_initial - self.recv_granted;
            self.recv_granted = self.recv_initial;
            Some(top_up)
        } else {
            None
        }
    }

    /// Register an outstanding request. `Txn` ids must be unique among
    /// outstanding requests on the lane.
    pub fn register_txn(
        &mut self,
        txn: &str,
        sender: oneshot::Sender<Result<Frame>>,
    ) -> Result<()> {
        if self.txns.contains_key(txn) {
            return Err(RabbitError::ProtocolViolation(format!(
                "duplicate outstanding Txn {txn} on lane {}",
                self.id
            )));
        }
        self.txns.insert(txn.to_string(), sender);
        Ok(())
    }

    /// Complete an outstanding request. Returns false when no awaiter was
    /// registered (response to an unknown or already-completed txn).
    pub fn complete_txn(&mut self, txn: &str, result: Result<Frame>) -> bool {
        match self.txns.remove(txn) {
            Some(sender) => {
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Cancel one transaction: the awaiter resolves to `Canceled` and any
    /// partial chunked body is dropped.
    pub fn cancel_txn(&mut self, txn: &str) {
        self.reassembly.remove(txn);
        if let Some(sender) = self.txns.remove(txn) {
            let _ = sender.send(Err(RabbitError::Canceled));
        }
    }

    /// Tear the lane down: every awaiter resolves to `Canceled`, queued
    /// and partial state is dropped.
    pub fn close(&mut self) {
        self.mode = LaneMode::Closing;
        for (_, sender) in self.txns.drain() {
            let _ = sender.send(Err(RabbitError::Canceled));
        }
        self.pending_out.clear();
        self.reassembly.clear();
    }

    /// Feed one `Part:` frame into the reassembly buffer for `txn`.
    pub fn chunk_push(&mut self, txn: &str, part: ChunkPart, data: &[u8], cap: usize) -> ChunkPush {
        let buffer = self
            .reassembly
            .entry(txn.to_string())
            .or_insert_with(|| ChunkBuffer { buf: BytesMut::new(), cap });
        if buffer.buf.len() + data.len() > buffer.cap {
            self.reassembly.remove(txn);
            return ChunkPush::Overflow;
        }
        buffer.buf.put_slice(data);
        match part {
            ChunkPart::Begin | ChunkPart::More => ChunkPush::Incomplete,
            ChunkPart::End => {
                let buffer = self
                    .reassembly
                    .remove(txn)
                    .map(|b| b.buf.freeze())
                    .unwrap_or_default();
                ChunkPush::Complete(buffer)
            }
        }
    }

    /// Whether the lane still has work that resume should preserve.
    pub fn has_unacked(&self) -> bool {
        !self.retained.is_empty()
    }

    /// Force the inbound position (resume: acked seq + 1).
    pub(crate) fn set_peer_seq_expected(&mut self, seq: u64) {
        self.peer_seq_expected = seq;
    }

    /// Roll the outbound position back to just past the peer's ack and
    /// forget retained frames. Subscription lanes use this on resume:
    /// unacked events are re-delivered from the continuity oracle rather
    /// than from the retained copies, and must keep the old numbering.
    pub(crate) fn rewind_unacked(&mut self) {
        self.local_seq_next = self.peer_ack + 1;
        self.retained.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Verb;

    fn event_frame(lane: u16) -> Frame {
        let mut frame = Frame::request_with(Verb::Event, "/q/news");
        frame.set_lane(lane);
        frame
    }

    #[test]
    fn test_seq_stamping_monotone() {
        let mut lane = Lane::new(5, Opener::Peer, 10);
        for expected in 1..=3u64 {
            match lane.try_send(event_frame(5), true) {
                SendDecision::Send(frame) => assert_eq!(frame.seq(), Some(expected)),
                SendDecision::Queued => panic!("should have credit"),
            }
        }
    }

    #[test]
    fn test_credit_exhaustion_queues() {
        let mut lane = Lane::new(5, Opener::Peer, 2);
        assert!(matches!(lane.try_send(event_frame(5), true), SendDecision::Send(_)));
        assert!(matches!(lane.try_send(event_frame(5), true), SendDecision::Send(_)));
        assert!(matches!(lane.try_send(event_frame(5), true), SendDecision::Queued));
        assert_eq!(lane.queued_len(), 1);

        let released = lane.grant_send_credit(1);
        assert_eq!(released.len(), 1);
        // The queued frame got the next seq in order.
        assert_eq!(released[0].seq(), Some(3));
        assert_eq!(lane.send_credit(), 0);
    }

    #[test]
    fn test_credit_never_exceeded() {
        let mut lane = Lane::new(1, Opener::Local, 0);
        let mut sent = 0;
        for _ in 0..5 {
            if matches!(lane.try_send(event_frame(1), true), SendDecision::Send(_)) {
                sent += 1;
            }
        }
        sent += lane.grant_send_credit(3).len();
        for _ in 0..5 {
            if matches!(lane.try_send(event_frame(1), true), SendDecision::Send(_)) {
                sent += 1;
            }
        }
        // 0 initial + 3 granted
        assert_eq!(sent, 3);
    }

    #[test]
    fn test_inbound_seq_ordering() {
        let mut lane = Lane::new(5, Opener::Local, 4);
        assert!(lane.accept_inbound_seq(1).is_ok());
        let err = lane.accept_inbound_seq(3).unwrap_err();
        match err {
            RabbitError::OutOfOrder { lane: id, expected, got } => {
                assert_eq!(id, 5);
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Position does not advance on a gap.
        assert!(lane.accept_inbound_seq(2).is_ok());
    }

    #[test]
    fn test_cumulative_ack_drops_retained() {
        let mut lane = Lane::new(5, Opener::Peer, 10);
        for _ in 0..4 {
            lane.try_send(event_frame(5), true);
        }
        assert!(lane.has_unacked());
        lane.record_peer_ack(3);
        assert_eq!(lane.peer_ack(), 3);
        assert_eq!(lane.to_retained().unacked.len(), 1);
        // Duplicate and stale acks are idempotent.
        lane.record_peer_ack(3);
        lane.record_peer_ack(1);
        assert_eq!(lane.peer_ack(), 3);
    }

    #[test]
    fn test_recv_credit_replenishment() {
        let mut lane = Lane::new(2, Opener::Peer, 8);
        // Consuming down to the low watermark triggers a top-up of the
        // amount consumed.
        let mut top_up = None;
        for _ in 0..5 {
            top_up = lane.consume_recv_credit();
            if top_up.is_some() {
                break;
            }
        }
        assert_eq!(top_up, Some(5));
    }

    #[test]
    fn test_txn_registration_unique() {
        let mut lane = Lane::new(3, Opener::Local, 4);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(lane.register_txn("T-1", tx1).is_ok());
        assert!(lane.register_txn("T-1", tx2).is_err());
    }

    #[tokio::test]
    async fn test_cancel_resolves_awaiter() {
        let mut lane = Lane::new(3, Opener::Local, 4);
        let (tx, rx) = oneshot::channel();
        lane.register_txn("T-1", tx).unwrap();
        lane.cancel_txn("T-1");
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RabbitError::Canceled)));
    }

    #[tokio::test]
    async fn test_close_resolves_all_awaiters() {
        let mut lane = Lane::new(3, Opener::Local, 4);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        lane.register_txn("T-1", tx1).unwrap();
        lane.register_txn("T-2", tx2).unwrap();
        lane.close();
        assert!(matches!(rx1.await.unwrap(), Err(RabbitError::Canceled)));
        assert!(matches!(rx2.await.unwrap(), Err(RabbitError::Canceled)));
        assert_eq!(lane.mode, LaneMode::Closing);
    }

    #[test]
    fn test_chunk_reassembly() {
        let mut lane = Lane::new(4, Opener::Peer, 4);
        assert!(matches!(
            lane.chunk_push("T-9", ChunkPart::Begin, b"alpha ", 1024),
            ChunkPush::Incomplete
        ));
        assert!(matches!(
            lane.chunk_push("T-9", ChunkPart::More, b"beta ", 1024),
            ChunkPush::Incomplete
        ));
        match lane.chunk_push("T-9", ChunkPart::End, b"gamma", 1024) {
            ChunkPush::Complete(body) => assert_eq!(&body[..], b"alpha beta gamma"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_chunk_overflow() {
        let mut lane = Lane::new(4, Opener::Peer, 4);
        assert!(matches!(
            lane.chunk_push("T-9", ChunkPart::Begin, &[0u8; 8], 10),
            ChunkPush::Incomplete
        ));
        assert!(matches!(
            lane.chunk_push("T-9", ChunkPart::More, &[0u8; 8], 10),
            ChunkPush::Overflow
        ));
        // Buffer was discarded with the overflow.
        assert!(matches!(
            lane.chunk_push("T-9", ChunkPart::End, b"x", 10),
            ChunkPush::Complete(_)
        ));
    }

    #[test]
    fn test_resume_snapshot_roundtrip() {
        let mut lane = Lane::new(5, Opener::Peer, 10);
        for _ in 0..4 {
            lane.try_send(event_frame(5), true);
        }
        lane.record_peer_ack(2);
        let retained = lane.to_retained();
        assert_eq!(retained.local_seq_next, 5);
        assert_eq!(retained.peer_ack, 2);
        assert_eq!(retained.unacked.len(), 2);

        let restored = Lane::from_retained(5, Opener::Peer, 10, &retained);
        assert_eq!(restored.peer_ack(), 2);
        assert_eq!(restored.to_retained().unacked.len(), 2);
        // Next stamped frame continues the sequence.
        let mut restored = restored;
        match restored.try_send(event_frame(5), true) {
            SendDecision::Send(frame) => assert_eq!(frame.seq(), Some(5)),
            SendDecision::Queued => panic!("should have credit"),
        }
    }
}
