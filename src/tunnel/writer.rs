//! Fair outbound writer.
//!
//! Every lane owns a FIFO of encoded frames; a dedicated writer task
//! drains them round-robin, one frame per ready lane per rotation, and
//! batches the picks into vectored writes. A lane with nothing ready
//! (usually because credit ran out) simply drops out of the rotation and
//! cannot stall its siblings.
//!
//! ```text
//! Lane 1 queue ─┐
//! Lane 2 queue ─┼─► round-robin picker ─► writer task ─► transport
//! Lane N queue ─┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::IoSlice;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{RabbitError, Result};

/// Maximum frames drained into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

#[derive(Default)]
struct QueueState {
    queues: HashMap<u16, VecDeque<Bytes>>,
    /// Lanes with at least one queued frame, in service order.
    rotation: VecDeque<u16>,
    closed: bool,
}

/// Per-lane outbound queues shared between lanes and the writer task.
#[derive(Default)]
pub struct OutboundQueues {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl OutboundQueues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an encoded frame on a lane. Frames on one lane leave in the
    /// order they arrive here.
    pub async fn enqueue(&self, lane: u16, bytes: Bytes) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        let queue = state.queues.entry(lane).or_default();
        let was_empty = queue.is_empty();
        queue.push_back(bytes);
        if was_empty {
            state.rotation.push_back(lane);
        }
        drop(state);
        self.ready.notify_one();
    }

    /// Stop accepting frames; the writer exits after draining.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.ready.notify_one();
    }

    /// Total queued frames across all lanes.
    pub async fn depth(&self) -> usize {
        let state = self.state.lock().await;
        state.queues.values().map(|q| q.len()).sum()
    }

    /// Wait for the next batch: one frame per ready lane, round-robin,
    /// up to `max` frames. `None` means closed and fully drained.
    async fn next_batch(&self, max: usize) -> Option<Vec<Bytes>> {
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.rotation.is_empty() {
                    let mut batch = Vec::new();
                    while batch.len() < max {
                        let Some(lane) = state.rotation.pop_front() else {
                            break;
                        };
                        if let Some(queue) = state.queues.get_mut(&lane) {
                            if let Some(frame) = queue.pop_front() {
                                batch.push(frame);
                            }
                            if queue.is_empty() {
                                state.queues.remove(&lane);
                            } else {
                                state.rotation.push_back(lane);
                            }
                        }
                    }
                    if !batch.is_empty() {
                        return Some(batch);
                    }
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }
}

/// Spawn the writer task draining `queues` into `writer`.
pub fn spawn_writer_task<W>(mut writer: W, queues: Arc<OutboundQueues>) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(batch) = queues.next_batch(MAX_BATCH_SIZE).await {
            trace!(frames = batch.len(), "writing batch");
            write_batch(&mut writer, &batch).await?;
        }
        writer.shutdown().await?;
        Ok(())
    })
}

/// Write a batch of encoded frames with scatter/gather I/O, finishing
/// partial writes before returning.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(|b| b.len()).sum();
    let mut written = 0usize;
    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(RabbitError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }
    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for the unwritten tail of a batch.
fn remaining_slices(batch: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0usize;
    for frame in batch {
        let end = offset + frame.len();
        if skip < end {
            let start = skip.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_single_lane_fifo_order() {
        let queues = OutboundQueues::new();
        queues.enqueue(1, Bytes::from_static(b"first ")).await;
        queues.enqueue(1, Bytes::from_static(b"second ")).await;
        queues.enqueue(1, Bytes::from_static(b"third")).await;
        queues.close().await;

        let (client, mut server) = tokio::io::duplex(4096);
        spawn_writer_task(client, queues).await.unwrap().unwrap();

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "first second third");
    }

    #[tokio::test]
    async fn test_round_robin_across_lanes() {
        let queues = OutboundQueues::new();
        // Lane 1 floods; lane 2 has one frame. The single batch must
        // interleave lane 2 ahead of lane 1's backlog.
        queues.enqueue(1, Bytes::from_static(b"a1.")).await;
        queues.enqueue(1, Bytes::from_static(b"a2.")).await;
        queues.enqueue(1, Bytes::from_static(b"a3.")).await;
        queues.enqueue(2, Bytes::from_static(b"b1.")).await;
        let batch = queues.next_batch(16).await.unwrap();
        let text: Vec<&[u8]> = batch.iter().map(|b| &b[..]).collect();
        assert_eq!(text, vec![b"a1.", b"b1.", b"a2.", b"a3."]);
    }

    #[tokio::test]
    async fn test_batch_respects_max() {
        let queues = OutboundQueues::new();
        for i in 0..10u8 {
            queues.enqueue(u16::from(i), Bytes::from(vec![i])).await;
        }
        let batch = queues.next_batch(4).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(queues.depth().await, 6);
    }

    #[tokio::test]
    async fn test_writer_exits_on_close() {
        let queues = OutboundQueues::new();
        let (client, _server) = tokio::io::duplex(64);
        let task = spawn_writer_task(client, queues.clone());
        queues.close().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_dropped() {
        let queues = OutboundQueues::new();
        queues.close().await;
        queues.enqueue(1, Bytes::from_static(b"late")).await;
        assert_eq!(queues.depth().await, 0);
    }

    #[tokio::test]
    async fn test_write_batch_handles_partial_writes() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![
            Bytes::from_static(b"alpha "),
            Bytes::from_static(b"beta "),
            Bytes::from_static(b"gamma"),
        ];
        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner(), b"alpha beta gamma");
    }

    #[test]
    fn test_remaining_slices_mid_frame() {
        let batch = vec![Bytes::from_static(b"abcde"), Bytes::from_static(b"fgh")];
        let slices = remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&slices[0][..], b"de");
        assert_eq!(&slices[1][..], b"fgh");
        let slices = remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 1);
        assert_eq!(&slices[0][..], b"fgh");
    }
}
