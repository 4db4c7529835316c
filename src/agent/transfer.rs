//! Incoming file transfers.
//!
//! The payload follows its `__SEND_FILE__|name|size` header on the same
//! stream. We read exactly `size` bytes, save under the downloads
//! directory with `_1`, `_2`, ... suffixes on name collisions, and delete
//! anything partial so a broken transfer never leaves debris.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{info, warn};

/// Per-read stall timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Overall ceiling for one transfer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

const CHUNK: usize = 4096;

/// Where received files land when no directory was configured:
/// Desktop, else home, else the working directory.
pub fn default_download_dir() -> PathBuf {
    dirs::desktop_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Receive `size` bytes from `reader` into `dir`. The outcome, success
/// or any failure, is rendered as the reply text for the controller.
pub async fn receive_file<R: AsyncRead + Unpin>(
    reader: &mut R,
    name: &str,
    size: u64,
    dir: &Path,
) -> String {
    match receive_inner(reader, name, size, dir).await {
        Ok(path) => {
            info!(?path, size, "file received");
            format!("File {name} received ({size} bytes), saved to {}", path.display())
        }
        Err(e) => {
            warn!(name, "file receive failed: {e}");
            format!("Failed to receive file {name}: {e}")
        }
    }
}

async fn receive_inner<R: AsyncRead + Unpin>(
    reader: &mut R,
    name: &str,
    size: u64,
    dir: &Path,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).await?;

    // Strip any path components the sender smuggled into the name.
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "received.bin".to_string());
    let path = resolve_collision(dir, &base);

    let mut file = fs::File::create(&path).await?;
    let mut received: u64 = 0;
    let mut buf = [0u8; CHUNK];
    let started = Instant::now();

    while received < size {
        if started.elapsed() > TRANSFER_TIMEOUT {
            drop(file);
            let _ = fs::remove_file(&path).await;
            anyhow::bail!("transfer timed out after {} seconds", TRANSFER_TIMEOUT.as_secs());
        }

        let want = ((size - received) as usize).min(CHUNK);
        let n = match timeout(READ_TIMEOUT, reader.read(&mut buf[..want])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                drop(file);
                let _ = fs::remove_file(&path).await;
                return Err(e.into());
            }
            Err(_) => {
                drop(file);
                let _ = fs::remove_file(&path).await;
                anyhow::bail!("no data for {} seconds", READ_TIMEOUT.as_secs());
            }
        };
        if n == 0 {
            break; // peer closed mid-transfer
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }

    if received != size {
        drop(file);
        let _ = fs::remove_file(&path).await;
        anyhow::bail!("incomplete: expected {size} bytes, got {received}");
    }

    file.flush().await?;
    Ok(path)
}

/// `report.pdf` → `report_1.pdf`, `report_2.pdf`, ... until free.
fn resolve_collision(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.to_string(), String::new()),
    };

    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_receive_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 10_000];
        let (mut tx, mut rx) = duplex(1024);

        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&sent).await.unwrap();
        });

        let reply = receive_file(&mut rx, "blob.bin", payload.len() as u64, dir.path()).await;
        writer.await.unwrap();

        assert!(reply.contains("received"), "{reply}");
        let saved = std::fs::read(dir.path().join("blob.bin")).unwrap();
        assert_eq!(saved, payload);
    }

    #[tokio::test]
    async fn test_short_transfer_deletes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tx, mut rx) = duplex(1024);

        tx.write_all(&[1u8; 100]).await.unwrap();
        drop(tx); // closes the stream well before the promised size

        let reply = receive_file(&mut rx, "partial.bin", 5000, dir.path()).await;
        assert!(reply.contains("expected 5000 bytes, got 100"), "{reply}");
        assert!(!dir.path().join("partial.bin").exists());
    }

    #[tokio::test]
    async fn test_collision_gets_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"old").unwrap();
        std::fs::write(dir.path().join("report_1.pdf"), b"older").unwrap();

        let (mut tx, mut rx) = duplex(64);
        tx.write_all(b"new contents").await.unwrap();
        drop(tx);

        let reply = receive_file(&mut rx, "report.pdf", 12, dir.path()).await;
        assert!(reply.contains("report_2.pdf"), "{reply}");
        assert_eq!(
            std::fs::read(dir.path().join("report_2.pdf")).unwrap(),
            b"new contents"
        );
    }

    #[test]
    fn test_collision_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes"), b"x").unwrap();
        let path = resolve_collision(dir.path(), "notes");
        assert_eq!(path, dir.path().join("notes_1"));
    }
}
