//! The agent: listens for a controller, executes its commands, and streams
//! screen frames while a monitor session is active.
//!
//! One connection is served at a time; a second controller waits in the
//! accept backlog. Per connection, the read loop owns the read half and the
//! writer task owns the write half; text replies and frames reach the
//! writer over separate channels so a long shell command never interleaves
//! bytes into a frame. The frame channel has capacity 1: the capture
//! thread's blocking handoff is the producer backpressure.

pub mod capture;
pub mod exec;
pub mod system;
pub mod transfer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::{wire, Command};
use crate::session::StreamParams;
use system::{NativeSystem, SystemOps};

/// Liveness tick: a quiet controller is normal, not an error.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period so the exit ack reaches the controller before we go away.
const EXIT_GRACE: Duration = Duration::from_millis(500);

const READ_BUFFER: usize = 4096;

pub struct AgentConfig {
    pub bind: String,
    pub download_dir: PathBuf,
}

/// Run the agent until a controller sends the exit directive.
pub async fn run(config: AgentConfig) -> Result<()> {
    run_with(config, Arc::new(NativeSystem)).await
}

pub async fn run_with(config: AgentConfig, system: Arc<dyn SystemOps>) -> Result<()> {
    let screen = capture::detect_screen_size();
    info!(width = screen.0, height = screen.1, "screen resolution detected");

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    info!("agent listening on {}", listener.local_addr()?);

    let (popup_tx, popup_rx) = mpsc::unbounded_channel();
    tokio::spawn(log_popups(popup_rx));

    loop {
        let (stream, addr) = listener.accept().await.context("accept failed")?;
        info!(%addr, "controller connected");

        match handle_connection(stream, &config, screen, system.clone(), popup_tx.clone()).await {
            Ok(ConnectionEnd::Closed) => info!(%addr, "controller disconnected"),
            Ok(ConnectionEnd::Shutdown) => {
                info!("exit directive received, shutting down");
                return Ok(());
            }
            Err(e) => warn!(%addr, "connection failed: {e}"),
        }
    }
}

/// Default popup consumer. A host environment that can render dialogs
/// would take this receiver instead.
async fn log_popups(mut popups: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = popups.recv().await {
        info!(%message, "popup");
    }
}

enum ConnectionEnd {
    Closed,
    Shutdown,
}

enum Flow {
    Continue,
    Shutdown,
}

async fn handle_connection(
    stream: TcpStream,
    config: &AgentConfig,
    screen: (u32, u32),
    system: Arc<dyn SystemOps>,
    popup_tx: mpsc::UnboundedSender<String>,
) -> Result<ConnectionEnd> {
    let (mut read_half, write_half) = stream.into_split();

    let (reply_tx, reply_rx) = mpsc::channel::<String>(8);
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(1);
    let writer = tokio::spawn(write_loop(write_half, reply_rx, frame_rx));

    let mut dispatcher = Dispatcher {
        screen,
        input_locked: false,
        net_disabled: false,
        session: None,
        system,
        reply_tx,
        frame_tx,
        popup_tx,
        download_dir: config.download_dir.clone(),
    };

    let mut buf = vec![0u8; READ_BUFFER];
    let end = loop {
        let n = match timeout(READ_TIMEOUT, read_half.read(&mut buf)).await {
            Err(_) => continue, // liveness tick
            Ok(Ok(0)) => break ConnectionEnd::Closed,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("read failed: {e}");
                break ConnectionEnd::Closed;
            }
        };

        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        debug!(bytes = n, "command received");

        let command = match Command::parse(&text) {
            Ok(command) => command,
            Err(e) => {
                dispatcher.reply(format!("Rejected: {e}")).await;
                continue;
            }
        };

        match dispatcher.dispatch(command, &mut read_half).await {
            Flow::Continue => {}
            Flow::Shutdown => break ConnectionEnd::Shutdown,
        }
    };

    dispatcher.teardown().await;
    drop(dispatcher); // closes both writer channels
    let _ = writer.await;
    Ok(end)
}

/// Single owner of the write half. Replies and frames arrive on separate
/// channels; when both close the connection is over.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut replies: mpsc::Receiver<String>,
    mut frames: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            Some(text) = replies.recv() => {
                if let Err(e) = writer.write_all(text.as_bytes()).await {
                    warn!("reply write failed: {e}");
                    break;
                }
            }
            Some(payload) = frames.recv() => {
                if let Err(e) = wire::write_frame(&mut writer, &payload).await {
                    warn!("frame write failed: {e}");
                    break;
                }
            }
            else => break,
        }
    }
}

/// Per-connection command dispatcher. Owns the streaming-session handle;
/// the single-active-session invariant lives here.
struct Dispatcher {
    screen: (u32, u32),
    input_locked: bool,
    net_disabled: bool,
    session: Option<capture::SessionHandle>,
    system: Arc<dyn SystemOps>,
    reply_tx: mpsc::Sender<String>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    popup_tx: mpsc::UnboundedSender<String>,
    download_dir: PathBuf,
}

impl Dispatcher {
    async fn reply(&self, text: String) {
        if self.reply_tx.send(text).await.is_err() {
            warn!("writer gone, reply dropped");
        }
    }

    async fn dispatch<R: AsyncRead + Unpin>(&mut self, command: Command, reader: &mut R) -> Flow {
        match command {
            Command::Shell(cmd) => {
                let report = exec::run_shell(&cmd, exec::SHELL_TIMEOUT).await;
                self.reply(report).await;
            }
            Command::LockInput => {
                let report = self.set_input_lock(true);
                self.reply(report).await;
            }
            Command::UnlockInput => {
                let report = self.set_input_lock(false);
                self.reply(report).await;
            }
            Command::DisableNet => {
                let report = self.set_network(false);
                self.reply(report).await;
            }
            Command::EnableNet => {
                let report = self.set_network(true);
                self.reply(report).await;
            }
            Command::Popup(message) => {
                let message = if message.trim().is_empty() {
                    "(empty message)".to_string()
                } else {
                    message
                };
                let length = message.chars().count();
                let _ = self.popup_tx.send(message);
                self.reply(format!("Popup queued ({length} characters)")).await;
            }
            Command::Exit => {
                self.reply("Exit acknowledged, agent shutting down".into()).await;
                tokio::time::sleep(EXIT_GRACE).await;
                return Flow::Shutdown;
            }
            Command::StartMonitor(request) => {
                let params = StreamParams::clamp(&request, self.screen.0, self.screen.1);
                if let Some(session) = self.session.take() {
                    // Reconfigure: the old producer must be gone before a
                    // new one starts.
                    debug!("stopping active session for reconfigure");
                    session.stop().await;
                }
                self.session = Some(capture::spawn(params, self.frame_tx.clone()));
                self.reply(format!(
                    "Screen monitor started: {}x{}, {} fps, quality {}, delay {}s",
                    params.width, params.height, params.fps, params.quality, params.delay
                ))
                .await;
            }
            Command::StopMonitor => match self.session.take() {
                Some(session) => {
                    session.stop().await;
                    self.reply("Screen monitor stopped".into()).await;
                }
                None => self.reply("Screen monitor is not running".into()).await,
            },
            Command::FileTransfer { name, size } => {
                let report = transfer::receive_file(reader, &name, size, &self.download_dir).await;
                self.reply(report).await;
            }
        }
        Flow::Continue
    }

    fn set_input_lock(&mut self, lock: bool) -> String {
        if self.input_locked == lock {
            return if lock {
                "Input devices already locked".into()
            } else {
                "Input devices already unlocked".into()
            };
        }
        match self.system.block_input(lock) {
            Ok(()) => {
                self.input_locked = lock;
                if lock {
                    "Input devices locked".into()
                } else {
                    "Input devices unlocked".into()
                }
            }
            Err(e) => format!(
                "Failed to {} input devices: {e}",
                if lock { "lock" } else { "unlock" }
            ),
        }
    }

    fn set_network(&mut self, enable: bool) -> String {
        if enable && !self.net_disabled {
            return "Network is already enabled".into();
        }
        if !enable && self.net_disabled {
            return "Network is already disabled".into();
        }

        let adapters = self.system.list_adapters();
        let mut lines = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            match self.system.set_adapter(adapter, enable) {
                Ok(()) => lines.push(format!(
                    "{}: {adapter}",
                    if enable { "Enabled" } else { "Disabled" }
                )),
                Err(e) => lines.push(format!("Failed on {adapter}: {e}")),
            }
        }
        self.net_disabled = !enable;
        lines.join("\n")
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
    }
}
