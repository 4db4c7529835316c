//! Receive pipeline: demultiplexes the agent stream while a monitor
//! session is active, feeding frames into a bounded queue and text into an
//! event channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::protocol::wire::{StreamDemux, StreamUnit};

/// What the stream carried besides frames.
#[derive(Debug)]
pub enum StreamEvent {
    /// A text reply that arrived while streaming.
    Text(String),
    /// The agent closed the stream or it failed; the session is over.
    Disconnected,
}

/// Bounded frame buffer: when full, the oldest frame is evicted to admit
/// the newest; stale frames are worthless once a newer one exists.
pub struct FrameQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

pub const FRAME_QUEUE_CAPACITY: usize = 5;

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, frame: Vec<u8>) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    /// Take everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the read half for the duration of a streaming session and hands
/// it back on stop.
pub struct ReceivePipeline<R> {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<R>,
}

impl<R: AsyncRead + Unpin + Send + 'static> ReceivePipeline<R> {
    pub fn spawn(
        reader: R,
        queue: std::sync::Arc<FrameQueue>,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut demux = StreamDemux::new(reader);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    item = demux.next() => match item {
                        Ok(Some(StreamUnit::Frame(frame))) => queue.push(frame),
                        Ok(Some(StreamUnit::Text(text))) => {
                            let _ = events.send(StreamEvent::Text(text));
                        }
                        Ok(None) => {
                            let _ = events.send(StreamEvent::Disconnected);
                            break;
                        }
                        Err(e) => {
                            warn!("stream receive failed: {e}");
                            let _ = events.send(StreamEvent::Disconnected);
                            break;
                        }
                    },
                }
            }
            demux.into_inner()
        });

        Self { stop_tx, task }
    }

    /// Stop the pipeline and reclaim the reader. A stop can interrupt a
    /// partially received frame; the caller drains the stream back to idle
    /// before reusing it for request/response traffic.
    pub async fn stop(self) -> anyhow::Result<R> {
        let _ = self.stop_tx.send(());
        Ok(self.task.await?)
    }
}
