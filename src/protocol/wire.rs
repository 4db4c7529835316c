//! Binary frame codec and stream demultiplexer.
//!
//! A frame on the wire is `IMGB` + u32 big-endian payload length + payload.
//! Everything else on the stream is free UTF-8 text. The receiver tells the
//! two apart solely by probing 4 bytes: an exact magic match starts a frame,
//! anything else starts a text unit that runs until the stream goes idle.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::warn;

use super::{FRAME_MAGIC, MAX_FRAME_SIZE};

/// How long a text unit may stay silent before it is considered complete,
/// and how long an invalid-length drain waits for more bytes.
const IDLE_WINDOW: Duration = Duration::from_millis(50);

const DRAIN_CHUNK: usize = 4096;

/// One demultiplexed unit from the agent→controller stream.
#[derive(Debug)]
pub enum StreamUnit {
    /// A complete frame payload (JPEG bytes).
    Frame(Vec<u8>),
    /// A text response, decoded lossily.
    Text(String),
}

/// Write one frame: magic, length, payload. `write_all` retries short
/// writes until the buffer is flushed or the socket errors; the payload is
/// chunked so a stalled peer blocks here rather than queueing memory.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(&FRAME_MAGIC).await?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    for chunk in payload.chunks(DRAIN_CHUNK) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

/// Splits the incoming stream into frames and text units.
///
/// Tolerates arbitrary chunking: every multi-byte read loops on short
/// reads. A frame header with a length outside `(0, MAX_FRAME_SIZE]` is
/// drained best-effort so the stream stays decodable, and never surfaces
/// to the caller.
pub struct StreamDemux<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> StreamDemux<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Hand the underlying reader back, e.g. after streaming stops.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Next frame or text unit; `None` once the peer closes.
    pub async fn next(&mut self) -> std::io::Result<Option<StreamUnit>> {
        loop {
            let mut probe = [0u8; 4];
            let mut filled = 0;
            while filled < 4 {
                let n = self.reader.read(&mut probe[filled..]).await?;
                if n == 0 {
                    // Peer closed before a full probe arrived.
                    return Ok(None);
                }
                filled += n;
            }

            if probe != FRAME_MAGIC {
                return Ok(Some(StreamUnit::Text(self.read_text_tail(&probe).await)));
            }

            let mut len_buf = [0u8; 4];
            match self.reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
            let length = u32::from_be_bytes(len_buf) as usize;

            if length == 0 || length > MAX_FRAME_SIZE {
                warn!(length, "invalid frame length, draining");
                self.drain(length).await;
                continue;
            }

            let mut payload = vec![0u8; length];
            match self.reader.read_exact(&mut payload).await {
                Ok(_) => return Ok(Some(StreamUnit::Frame(payload))),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(length, "stream closed mid-frame");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The probe was not a frame: it is the head of a text unit. Collect
    /// whatever else arrives until the stream goes idle and decode lossily.
    async fn read_text_tail(&mut self, head: &[u8]) -> String {
        let mut data = head.to_vec();
        let mut buf = [0u8; DRAIN_CHUNK];
        loop {
            match timeout(IDLE_WINDOW, self.reader.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => data.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
                Err(_) => break, // idle, unit complete
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Discard up to `length` bytes. Best effort: stops on idle timeout or
    /// close rather than waiting forever for bytes that may never come.
    async fn drain(&mut self, length: usize) {
        let mut remaining = length;
        let mut buf = [0u8; DRAIN_CHUNK];
        while remaining > 0 {
            let want = remaining.min(DRAIN_CHUNK);
            match timeout(IDLE_WINDOW, self.reader.read(&mut buf[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => remaining -= n,
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_survives_one_byte_chunks() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&FRAME_MAGIC);
        encoded.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&payload);

        let (mut tx, rx) = duplex(16);
        let writer = tokio::spawn(async move {
            for byte in encoded {
                tx.write_all(&[byte]).await.unwrap();
            }
        });

        let mut demux = StreamDemux::new(rx);
        match demux.next().await.unwrap() {
            Some(StreamUnit::Frame(got)) => assert_eq!(got, payload),
            other => panic!("unexpected: {other:?}"),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_large_frame_round_trip() {
        let payload = vec![0xABu8; MAX_FRAME_SIZE];
        let (mut tx, rx) = duplex(64 * 1024);
        let sent = payload.clone();
        let writer = tokio::spawn(async move { write_frame(&mut tx, &sent).await });

        let mut demux = StreamDemux::new(rx);
        match demux.next().await.unwrap() {
            Some(StreamUnit::Frame(got)) => {
                assert_eq!(got.len(), payload.len());
                assert_eq!(got, payload);
            }
            other => panic!("unexpected: {other:?}"),
        }
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_length_header_does_not_desync() {
        let (mut tx, rx) = duplex(256);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FRAME_MAGIC);
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(b"input devices locked");
        tx.write_all(&bytes).await.unwrap();
        drop(tx);

        let mut demux = StreamDemux::new(rx);
        match demux.next().await.unwrap() {
            Some(StreamUnit::Text(text)) => assert_eq!(text, "input devices locked"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(demux.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_header_drained_then_text_decodes() {
        let (mut tx, rx) = duplex(4096);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FRAME_MAGIC);
        bytes.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        bytes.extend_from_slice(&[0xFF; 100]); // garbage that must be eaten
        tx.write_all(&bytes).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut demux = StreamDemux::new(rx);
            demux.next().await.unwrap()
        });

        // Let the drain give up on the missing remainder, then send a reply.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.write_all(b"still alive").await.unwrap();

        match reader.await.unwrap() {
            Some(StreamUnit::Text(text)) => assert_eq!(text, "still alive"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_then_text() {
        let (mut tx, rx) = duplex(4096);
        write_frame(&mut tx, b"\xFF\xD8jpegdata").await.unwrap();
        tx.write_all("monitor stopped".as_bytes()).await.unwrap();
        drop(tx);

        let mut demux = StreamDemux::new(rx);
        match demux.next().await.unwrap() {
            Some(StreamUnit::Frame(f)) => assert_eq!(f, b"\xFF\xD8jpegdata"),
            other => panic!("unexpected: {other:?}"),
        }
        match demux.next().await.unwrap() {
            Some(StreamUnit::Text(t)) => assert_eq!(t, "monitor stopped"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_before_full_probe() {
        let (mut tx, rx) = duplex(16);
        tx.write_all(b"IM").await.unwrap();
        drop(tx);

        let mut demux = StreamDemux::new(rx);
        assert!(demux.next().await.unwrap().is_none());
    }
}
