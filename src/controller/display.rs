//! Frame consumer: paces dequeue at the session fps, decodes JPEG
//! payloads, rescales to the current viewport, and hands decoded frames to
//! the presentation sink. A corrupt frame is logged and skipped, it never
//! ends the session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::receive::FrameQueue;

/// Target render size, set by whatever hosts the display surface.
/// `None` renders at the frame's native size.
pub type Viewport = Arc<Mutex<Option<(u32, u32)>>>;

/// One decoded frame ready for presentation.
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub image: RgbImage,
}

impl DecodedFrame {
    pub fn from_jpeg(data: &[u8]) -> Result<Self> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .context("jpeg decode failed")?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Ok(Self {
            width,
            height,
            image,
        })
    }

    fn rescale(self, viewport: &Viewport) -> Self {
        let target = *viewport.lock().unwrap_or_else(|e| e.into_inner());
        match target {
            Some((w, h)) if (w, h) != (self.width, self.height) && w > 0 && h > 0 => {
                let image = imageops::resize(&self.image, w, h, FilterType::Lanczos3);
                Self {
                    width: w,
                    height: h,
                    image,
                }
            }
            _ => self,
        }
    }
}

/// Spawn the consumer loop. Each tick drains the queue, decodes what it
/// finds and delivers the newest good frame; the sender side of `frames`
/// closing or the stop signal ends the loop.
pub fn spawn_consumer(
    queue: Arc<FrameQueue>,
    fps: u32,
    viewport: Viewport,
    frames: mpsc::UnboundedSender<DecodedFrame>,
    mut stop: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }

            let mut newest: Option<DecodedFrame> = None;
            for payload in queue.drain() {
                match DecodedFrame::from_jpeg(&payload) {
                    Ok(frame) => newest = Some(frame),
                    Err(e) => warn!("undecodable frame skipped: {e}"),
                }
            }

            if let Some(frame) = newest {
                let frame = frame.rescale(&viewport);
                debug!(width = frame.width, height = frame.height, "frame ready");
                if frames.send(frame).is_err() {
                    break; // presentation side went away
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::receive::FRAME_QUEUE_CAPACITY;
    use image::codecs::jpeg::JpegEncoder;
    use std::io::Cursor;

    fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([200, 100, 50]));
        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, 80);
        image.write_with_encoder(encoder).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_round_trip() {
        let frame = DecodedFrame::from_jpeg(&sample_jpeg(32, 16)).unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
    }

    #[test]
    fn test_corrupt_data_is_an_error() {
        assert!(DecodedFrame::from_jpeg(b"not a jpeg").is_err());
    }

    #[test]
    fn test_rescale_to_viewport() {
        let viewport: Viewport = Arc::new(Mutex::new(Some((64, 32))));
        let frame = DecodedFrame::from_jpeg(&sample_jpeg(32, 16)).unwrap();
        let frame = frame.rescale(&viewport);
        assert_eq!((frame.width, frame.height), (64, 32));
    }

    #[tokio::test]
    async fn test_consumer_skips_corrupt_and_delivers_newest() {
        let queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY));
        queue.push(sample_jpeg(16, 8));
        queue.push(b"garbage".to_vec());
        queue.push(sample_jpeg(32, 16));

        let viewport: Viewport = Arc::new(Mutex::new(None));
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let consumer = spawn_consumer(queue, 15, viewport, frames_tx, stop_rx);

        let frame = tokio::time::timeout(Duration::from_secs(2), frames_rx.recv())
            .await
            .expect("no frame within 2s")
            .expect("consumer closed");
        assert_eq!((frame.width, frame.height), (32, 16));

        let _ = stop_tx.send(());
        consumer.await.unwrap();
    }
}
