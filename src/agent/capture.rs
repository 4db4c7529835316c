//! Screen capture pipeline.
//!
//! One dedicated thread per streaming session: grab the display, resize to
//! the session geometry, JPEG-compress, and hand the payload to the socket
//! writer over a capacity-1 channel. The blocking handoff is the
//! backpressure: a slow network stalls capture instead of queueing frames.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, RgbImage};
use scrap::{Capturer, Display};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::MAX_FRAME_SIZE;
use crate::session::{StreamParams, MIN_QUALITY};

/// Produces full-resolution RGB frames. The production impl wraps the
/// platform capturer; tests substitute a synthetic source.
pub trait FrameSource {
    fn next_frame(&mut self) -> std::io::Result<RgbImage>;
}

/// Physical screen size, with the conventional fallback when no display
/// can be opened (headless agent).
pub fn detect_screen_size() -> (u32, u32) {
    match Display::primary() {
        Ok(display) => (display.width() as u32, display.height() as u32),
        Err(e) => {
            warn!("no primary display ({e}), assuming 1920x1080");
            (1920, 1080)
        }
    }
}

/// Primary-display source.
pub struct DisplaySource {
    capturer: Capturer,
    width: usize,
    height: usize,
}

impl DisplaySource {
    /// Must be called on the capture thread; the capturer is not `Send`
    /// on X11.
    pub fn open() -> std::io::Result<Self> {
        let display = Display::primary()?;
        let width = display.width();
        let height = display.height();
        let capturer = Capturer::new(display)?;
        Ok(Self {
            capturer,
            width,
            height,
        })
    }
}

impl FrameSource for DisplaySource {
    fn next_frame(&mut self) -> std::io::Result<RgbImage> {
        let frame = self.capturer.frame()?;
        // BGRA with a stride that may include padding.
        let stride = frame.len() / self.height;
        Ok(bgra_to_rgb(&frame, self.width, self.height, stride))
    }
}

/// Handle to a running capture session. Stopping is cooperative: clear the
/// flag, then join the thread so no second producer can overlap this one.
pub struct SessionHandle {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SessionHandle {
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Start a capture session against the primary display.
pub fn spawn(params: StreamParams, frames: mpsc::Sender<Vec<u8>>) -> SessionHandle {
    spawn_with(DisplaySource::open, params, frames)
}

/// Start a capture session with a caller-supplied source constructor.
/// The source is created inside the thread (platform capturers are not
/// `Send`).
pub fn spawn_with<S, F>(open: F, params: StreamParams, frames: mpsc::Sender<Vec<u8>>) -> SessionHandle
where
    S: FrameSource,
    F: FnOnce() -> std::io::Result<S> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    let thread = std::thread::spawn(move || {
        let source = match open() {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot open frame source: {e}");
                return;
            }
        };
        capture_loop(source, params, frames, running_clone);
    });

    SessionHandle {
        running,
        thread: Some(thread),
    }
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    mut params: StreamParams,
    frames: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
) {
    debug!(
        width = params.width,
        height = params.height,
        fps = params.fps,
        "capture loop started"
    );
    let interval = params.frame_interval();
    let mut last_send: Option<Instant> = None;

    while running.load(Ordering::Relaxed) {
        // Upper-bound the frame rate: wait out the rest of the interval.
        if let Some(sent_at) = last_send {
            let elapsed = sent_at.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
                continue;
            }
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Frame not ready yet.
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(e) => {
                warn!("screen grab failed: {e}");
                std::thread::sleep(Duration::from_millis(500));
                continue;
            }
        };

        let resized = if frame.dimensions() == (params.width, params.height) {
            frame
        } else {
            imageops::resize(&frame, params.width, params.height, FilterType::Lanczos3)
        };

        let mut jpeg = match encode_jpeg(&resized, params.quality) {
            Ok(data) => data,
            Err(e) => {
                warn!("jpeg encode failed: {e}");
                continue;
            }
        };

        if jpeg.len() > MAX_FRAME_SIZE {
            // Back the quality off and keep it there for the session.
            let reduced = reduce_quality(params.quality);
            warn!(
                size = jpeg.len(),
                quality = reduced,
                "frame over size cap, reducing quality"
            );
            params.quality = reduced;
            jpeg = match encode_jpeg(&resized, reduced) {
                Ok(data) => data,
                Err(e) => {
                    warn!("jpeg re-encode failed: {e}");
                    continue;
                }
            };
        }

        last_send = Some(Instant::now());
        if frames.blocking_send(jpeg).is_err() {
            break; // writer gone, the connection is closing
        }
    }

    debug!("capture loop ended");
}

fn reduce_quality(quality: u8) -> u8 {
    quality.saturating_sub(10).max(MIN_QUALITY as u8)
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

/// Convert a padded BGRA buffer to a tightly packed RGB image.
fn bgra_to_rgb(bgra: &[u8], width: usize, height: usize, stride: usize) -> RgbImage {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let offset = y * stride + x * 4;
            if offset + 2 < bgra.len() {
                rgb.push(bgra[offset + 2]);
                rgb.push(bgra[offset + 1]);
                rgb.push(bgra[offset]);
            } else {
                rgb.extend_from_slice(&[0, 0, 0]);
            }
        }
    }
    ImageBuffer::from_raw(width as u32, height as u32, rgb)
        .unwrap_or_else(|| RgbImage::new(width as u32, height as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    /// Synthetic source that tracks how many instances are live at once.
    struct TestSource {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TestSource {
        fn new(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            Self { active, peak }
        }
    }

    impl Drop for TestSource {
        fn drop(&mut self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for TestSource {
        fn next_frame(&mut self) -> std::io::Result<RgbImage> {
            let now = self.active.load(Ordering::SeqCst);
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(RgbImage::from_pixel(8, 8, image::Rgb([30, 60, 90])))
        }
    }

    fn test_params() -> StreamParams {
        StreamParams {
            width: 8,
            height: 8,
            fps: 15,
            quality: 50,
            delay: 0.2,
        }
    }

    #[tokio::test]
    async fn test_produces_jpeg_frames() {
        let (tx, mut rx) = mpsc::channel(16);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let handle = spawn_with(move || Ok(TestSource::new(a, p)), test_params(), tx);

        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame within 2s")
            .expect("channel closed");
        // JPEG SOI marker
        assert_eq!(&frame[..2], &[0xFF, 0xD8][..]);

        handle.stop().await;
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_joins_before_next_session_starts() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (tx1, _rx1) = mpsc::channel(16);
        let (a, p) = (active.clone(), peak.clone());
        let first = spawn_with(move || Ok(TestSource::new(a, p)), test_params(), tx1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Reconfigure: stop-then-start, the way the dispatcher does it.
        first.stop().await;

        let (tx2, _rx2) = mpsc::channel(16);
        let (a, p) = (active.clone(), peak.clone());
        let second = spawn_with(move || Ok(TestSource::new(a, p)), test_params(), tx2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        second.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1, "two capture loops overlapped");
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_loop() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let (a, p) = (active.clone(), peak.clone());
        let handle = spawn_with(move || Ok(TestSource::new(a, p)), test_params(), tx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(active.load(Ordering::SeqCst), 0, "loop should have exited");
        handle.stop().await;
    }

    #[test]
    fn test_quality_reduction_floors_at_minimum() {
        assert_eq!(reduce_quality(50), 40);
        assert_eq!(reduce_quality(15), 10);
        assert_eq!(reduce_quality(10), 10);
    }

    #[test]
    fn test_bgra_conversion_honors_stride() {
        // 2×1 image, stride padded to 12 bytes per row.
        let bgra = [
            10, 20, 30, 255, // pixel 0: B G R A
            40, 50, 60, 255, // pixel 1
            0, 0, 0, 0, // padding
        ];
        let rgb = bgra_to_rgb(&bgra, 2, 1, 12);
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(rgb.get_pixel(1, 0).0, [60, 50, 40]);
    }
}
