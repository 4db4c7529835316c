//! Connection lifecycle and streaming-session parameters.

use std::fmt;

use crate::protocol::MonitorRequest;

/// Lifecycle of one control connection.
///
/// `Disconnected → Connecting → Connected → (Streaming ⇄ Connected) →
/// Disconnected`. A failed connect drops straight back to `Disconnected`;
/// any teardown from `Streaming` stops the stream session first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Effective (post-clamp) streaming configuration. At most one active
/// session per connection; a reconfigure destroys and recreates it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
    /// Advisory pacing hint in seconds; carried but not enforced by the codec.
    pub delay: f64,
}

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 15;
pub const MIN_QUALITY: u32 = 10;
pub const MAX_QUALITY: u32 = 80;
pub const MIN_DELAY: f64 = 0.2;
pub const MAX_DELAY: f64 = 2.0;

/// Requested geometry with a ratio outside this band is considered
/// nonsensical and replaced by the default resolution.
const MIN_ASPECT: f64 = 1.2;
const MAX_ASPECT: f64 = 2.5;

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: 10,
            quality: 50,
            delay: 0.5,
        }
    }
}

impl StreamParams {
    /// Clamp a controller request against the agent's actual screen size.
    ///
    /// The aspect-ratio guard judges the geometry the controller asked
    /// for: a ratio below 1.2 or at/above 2.5 (or a zero dimension) resets
    /// both axes to 1280×720. Sane requests are then capped per axis at
    /// the physical resolution. The result is authoritative: the caller
    /// must report these values, never the requested ones.
    pub fn clamp(req: &MonitorRequest, screen_w: u32, screen_h: u32) -> StreamParams {
        let (width, height) = if req.height == 0 || req.width == 0 {
            (DEFAULT_WIDTH, DEFAULT_HEIGHT)
        } else {
            let aspect = req.width as f64 / req.height as f64;
            if aspect < MIN_ASPECT || aspect >= MAX_ASPECT {
                (DEFAULT_WIDTH, DEFAULT_HEIGHT)
            } else {
                (req.width.min(screen_w), req.height.min(screen_h))
            }
        };

        StreamParams {
            width,
            height,
            fps: req.fps.clamp(MIN_FPS, MAX_FPS),
            quality: req.quality.clamp(MIN_QUALITY, MAX_QUALITY) as u8,
            delay: req.delay.clamp(MIN_DELAY, MAX_DELAY),
        }
    }

    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.fps as f64)
    }
}
