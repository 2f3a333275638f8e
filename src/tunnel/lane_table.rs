//! Shared lane registry with admission control.
//!
//! Lanes come into existence with the first frame bearing their id in a
//! direction and are torn down on `CANCEL`, terminal error, or tunnel
//! close. The table owns every lane behind one async mutex; callers pass
//! closures so no lane reference escapes the lock.

use std::collections::HashMap;

use tokio::sync::Mutex;

use super::lane::{Lane, Opener};
use crate::error::{RabbitError, Result};
use crate::session::RetainedLane;

/// Concurrency-safe registry of lanes keyed by lane id.
pub struct LaneTable {
    lanes: Mutex<HashMap<u16, Lane>>,
    max_lanes: usize,
    initial_credit: u32,
}

impl LaneTable {
    pub fn new(max_lanes: usize, initial_credit: u32) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            max_lanes,
            initial_credit,
        }
    }

    /// Run `f` against the lane, creating it first if the quota allows.
    ///
    /// `opener` records which side is opening when the lane is new; it is
    /// ignored for existing lanes.
    pub async fn with_lane<R>(
        &self,
        id: u16,
        opener: Opener,
        f: impl FnOnce(&mut Lane) -> R,
    ) -> Result<R> {
        let mut lanes = self.lanes.lock().await;
        if !lanes.contains_key(&id) && lanes.len() >= self.max_lanes {
            return Err(RabbitError::FlowLimit(format!(
                "lane quota {} exhausted",
                self.max_lanes
            )));
        }
        let lane = lanes
            .entry(id)
            .or_insert_with(|| Lane::new(id, opener, self.initial_credit));
        Ok(f(lane))
    }

    /// Run `f` only when the lane already exists.
    pub async fn with_existing<R>(
        &self,
        id: u16,
        f: impl FnOnce(&mut Lane) -> R,
    ) -> Option<R> {
        let mut lanes = self.lanes.lock().await;
        lanes.get_mut(&id).map(f)
    }

    /// Whether a lane exists without creating it.
    pub async fn contains(&self, id: u16) -> bool {
        self.lanes.lock().await.contains_key(&id)
    }

    /// Tear down one lane, resolving its awaiters with `Canceled`.
    pub async fn close_lane(&self, id: u16) {
        let mut lanes = self.lanes.lock().await;
        if let Some(mut lane) = lanes.remove(&id) {
            lane.close();
        }
    }

    /// Tear down everything, resolving all awaiters with `Canceled`.
    pub async fn close_all(&self) {
        let mut lanes = self.lanes.lock().await;
        for (_, lane) in lanes.iter_mut() {
            lane.close();
        }
        lanes.clear();
    }

    /// Snapshot every lane's sender-side state for the resume window.
    pub async fn snapshot_retained(&self) -> HashMap<u16, RetainedLane> {
        let lanes = self.lanes.lock().await;
        lanes
            .iter()
            .map(|(id, lane)| (*id, lane.to_retained()))
            .collect()
    }

    /// Rebuild lanes from parked resume state, applying the acks the peer
    /// presented in `Lanes-Resume`. Returns the frames to replay, in lane
    /// then seq order. `opener` records which side originally opened the
    /// restored lanes.
    pub async fn restore(
        &self,
        retained: &HashMap<u16, RetainedLane>,
        lane_acks: &[(u16, u64)],
        opener: Opener,
    ) -> Vec<(u16, crate::protocol::Frame)> {
        let mut lanes = self.lanes.lock().await;
        let mut replay = Vec::new();
        let mut ordered: Vec<_> = retained.iter().collect();
        ordered.sort_by_key(|(id, _)| **id);
        for (id, state) in ordered {
            let mut lane = Lane::from_retained(*id, opener, self.initial_credit, state);
            if let Some((_, ack)) = lane_acks.iter().find(|(lane_id, _)| lane_id == id) {
                lane.record_peer_ack(*ack);
            }
            for (_, frame) in lane.to_retained().unacked {
                replay.push((*id, frame));
            }
            lanes.insert(*id, lane);
        }
        replay
    }

    /// Ids of all open lanes.
    pub async fn ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.lanes.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.lanes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lanes.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lane_created_on_first_use() {
        let table = LaneTable::new(8, 16);
        assert!(!table.contains(3).await);
        table
            .with_lane(3, Opener::Peer, |lane| assert_eq!(lane.id(), 3))
            .await
            .unwrap();
        assert!(table.contains(3).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let table = LaneTable::new(2, 16);
        table.with_lane(1, Opener::Peer, |_| ()).await.unwrap();
        table.with_lane(2, Opener::Peer, |_| ()).await.unwrap();
        let err = table.with_lane(3, Opener::Peer, |_| ()).await.unwrap_err();
        assert!(matches!(err, RabbitError::FlowLimit(_)));
        // Existing lanes stay reachable at the quota.
        assert!(table.with_lane(1, Opener::Peer, |_| ()).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_lane_removes() {
        let table = LaneTable::new(8, 16);
        table.with_lane(1, Opener::Local, |_| ()).await.unwrap();
        table.close_lane(1).await;
        assert!(!table.contains(1).await);
    }

    #[tokio::test]
    async fn test_restore_applies_acks_and_replays() {
        let table = LaneTable::new(8, 16);
        table
            .with_lane(5, Opener::Local, |lane| {
                for _ in 0..4 {
                    lane.try_send(
                        crate::protocol::Frame::request_with(crate::protocol::Verb::Event, "/q/a"),
                        true,
                    );
                }
            })
            .await
            .unwrap();
        let retained = table.snapshot_retained().await;

        let fresh = LaneTable::new(8, 16);
        let replay = fresh.restore(&retained, &[(5, 2)], Opener::Peer).await;
        // Seqs 1 and 2 were acked; 3 and 4 replay.
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].1.seq(), Some(3));
        assert_eq!(replay[1].1.seq(), Some(4));
    }
}
