//! The controller: connects out to an agent, issues commands, and hosts
//! the receive/display pipelines while a monitor session runs.

pub mod display;
pub mod receive;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::protocol::{Command, MonitorRequest};
use crate::session::{ConnectionState, MAX_FPS, MIN_FPS};
use display::{spawn_consumer, DecodedFrame, Viewport};
use receive::{FrameQueue, ReceivePipeline, StreamEvent, FRAME_QUEUE_CAPACITY};

/// Longest we wait for a reply: shell commands may legitimately run for
/// their full 30 s allowance on the agent.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(35);

/// Reply wait after streaming a file payload.
const FILE_ACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause between the file header and its payload so the agent reads the
/// header as its own unit (legacy pacing, part of the wire contract).
const FILE_HEADER_PAUSE: Duration = Duration::from_secs(1);

/// Time for the agent to halt its producer after a stop directive.
const STOP_GRACE: Duration = Duration::from_millis(200);

/// Idle window when draining straggler bytes after a session ends.
const DRAIN_IDLE: Duration = Duration::from_millis(300);

const FILE_CHUNK: usize = 1024;

/// Receiver ends of an active streaming session.
pub struct StreamHandles {
    /// Text and lifecycle events from the receive pipeline.
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    /// Decoded frames, paced at the session fps.
    pub frames: mpsc::UnboundedReceiver<DecodedFrame>,
    /// Set this to rescale frames to the display surface.
    pub viewport: Viewport,
}

struct ActiveStream {
    pipeline: ReceivePipeline<OwnedReadHalf>,
    display_stop: oneshot::Sender<()>,
    display_task: JoinHandle<()>,
}

/// One control connection to an agent.
///
/// Lifecycle is `Disconnected → Connecting → Connected → (Streaming ⇄
/// Connected) → Disconnected`. The caller drives `Streaming →
/// Disconnected` on a [`StreamEvent::Disconnected`] by calling
/// [`Controller::disconnect`]; a dropped connection never resumes a
/// session; reconnect and start over.
pub struct Controller {
    state: ConnectionState,
    write: Option<OwnedWriteHalf>,
    read: Option<OwnedReadHalf>,
    stream: Option<ActiveStream>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            write: None,
            read: None,
            stream: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn connect(&mut self, addr: &str) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            bail!("already {}", self.state);
        }
        self.state = ConnectionState::Connecting;

        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let (read, write) = stream.into_split();
                self.read = Some(read);
                self.write = Some(write);
                self.state = ConnectionState::Connected;
                info!(addr, "connected to agent");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e).with_context(|| format!("cannot connect to {addr}"))
            }
        }
    }

    /// Write one text unit. Valid while connected or streaming; during a
    /// session the reply surfaces as a [`StreamEvent::Text`].
    pub async fn send(&mut self, text: &str) -> Result<()> {
        let write = match self.write.as_mut() {
            Some(write) => write,
            None => bail!("not connected"),
        };
        if let Err(e) = write.write_all(text.as_bytes()).await {
            self.drop_connection();
            return Err(e).context("send failed");
        }
        Ok(())
    }

    /// Request/response outside a streaming session.
    pub async fn send_command(&mut self, text: &str) -> Result<String> {
        if self.state != ConnectionState::Connected {
            bail!("need a connected, non-streaming link (currently {})", self.state);
        }
        self.send(text).await?;
        self.read_reply(RESPONSE_TIMEOUT).await
    }

    /// Upload a file: header, pacing pause, raw payload, verdict.
    pub async fn send_file(&mut self, path: &Path) -> Result<String> {
        if self.state != ConnectionState::Connected {
            bail!("need a connected, non-streaming link (currently {})", self.state);
        }

        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());

        let header = Command::FileTransfer {
            name,
            size: data.len() as u64,
        }
        .encode();
        self.send(&header).await?;
        tokio::time::sleep(FILE_HEADER_PAUSE).await;

        for chunk in data.chunks(FILE_CHUNK) {
            let write = self.write.as_mut().context("not connected")?;
            if let Err(e) = write.write_all(chunk).await {
                self.drop_connection();
                return Err(e).context("file payload send failed");
            }
        }

        self.read_reply(FILE_ACK_TIMEOUT).await
    }

    /// Start a streaming session. The read half moves into the receive
    /// pipeline until [`Controller::stop_monitor`] reclaims it.
    pub async fn start_monitor(&mut self, request: MonitorRequest) -> Result<StreamHandles> {
        if self.state != ConnectionState::Connected {
            bail!("need a connected, non-streaming link (currently {})", self.state);
        }

        self.send(&Command::StartMonitor(request).encode()).await?;
        let read = self.read.take().context("read half missing")?;

        let queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pipeline = ReceivePipeline::spawn(read, queue.clone(), events_tx);

        let viewport: Viewport = Arc::new(Mutex::new(None));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (display_stop, display_stop_rx) = oneshot::channel();
        let fps = request.fps.clamp(MIN_FPS, MAX_FPS);
        let display_task = spawn_consumer(
            queue,
            fps,
            viewport.clone(),
            frames_tx,
            display_stop_rx,
        );

        self.stream = Some(ActiveStream {
            pipeline,
            display_stop,
            display_task,
        });
        self.state = ConnectionState::Streaming;
        info!(
            width = request.width,
            height = request.height,
            fps,
            "monitor session started"
        );
        Ok(StreamHandles {
            events: events_rx,
            frames: frames_rx,
            viewport,
        })
    }

    /// Stop the session and return the link to plain request/response.
    pub async fn stop_monitor(&mut self) -> Result<()> {
        if self.state != ConnectionState::Streaming {
            bail!("no streaming session (currently {})", self.state);
        }

        self.send(&Command::StopMonitor.encode()).await?;
        tokio::time::sleep(STOP_GRACE).await;

        let stream = self.stream.take().context("stream handles missing")?;
        let mut read = stream.pipeline.stop().await?;
        let _ = stream.display_stop.send(());
        let _ = stream.display_task.await;

        // In-flight frames may still be queued behind the stop ack; eat
        // everything until the stream goes idle so the next reply is clean.
        drain_until_idle(&mut read).await;

        self.read = Some(read);
        self.state = ConnectionState::Connected;
        info!("monitor session stopped");
        Ok(())
    }

    /// Tear everything down. Safe in any state.
    pub async fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Best effort: the peer may already be gone.
            if let Ok(read) = stream.pipeline.stop().await {
                self.read = Some(read);
            }
            let _ = stream.display_stop.send(());
            let _ = stream.display_task.await;
        }
        self.drop_connection();
        info!("disconnected");
    }

    fn drop_connection(&mut self) {
        self.read = None;
        self.write = None;
        self.state = ConnectionState::Disconnected;
    }

    async fn read_reply(&mut self, limit: Duration) -> Result<String> {
        let read = self.read.as_mut().context("not connected")?;
        let mut buf = vec![0u8; 4096];
        match timeout(limit, read.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.drop_connection();
                bail!("agent closed the connection");
            }
            Ok(Ok(n)) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Ok(Err(e)) => {
                self.drop_connection();
                Err(e).context("reply read failed")
            }
            Err(_) => bail!("no reply within {} seconds", limit.as_secs()),
        }
    }
}

async fn drain_until_idle(read: &mut OwnedReadHalf) {
    let mut buf = [0u8; 4096];
    loop {
        match timeout(DRAIN_IDLE, read.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                warn!(bytes = n, "drained stragglers after session stop");
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }
}
