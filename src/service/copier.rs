//! Asynchronous file copier.
//!
//! Copies run on a helper task that receives `(src, dest)` requests over a
//! channel and posts each result back on a oneshot completion channel. The
//! service awaits the completion, so copy traffic never blocks the cache
//! index.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Streams one file to another location.
#[async_trait]
pub trait FileCopier: Send + Sync {
    /// Copy `src` to `dest`, returning the number of bytes written.
    async fn copy(&self, src: &Path, dest: &Path) -> io::Result<u64>;
}

struct CopyRequest {
    src: PathBuf,
    dest: PathBuf,
    reply: oneshot::Sender<io::Result<u64>>,
}

/// A [`FileCopier`] backed by a spawned worker task.
#[derive(Clone)]
pub struct AsyncCopier {
    requests: mpsc::UnboundedSender<CopyRequest>,
}

impl AsyncCopier {
    /// Spawn the copier task. It runs until every clone of the handle is
    /// dropped.
    pub fn spawn() -> Self {
        let (requests, mut rx) = mpsc::unbounded_channel::<CopyRequest>();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = copy_file(&request.src, &request.dest).await;
                if let Err(e) = &result {
                    warn!(
                        src = %request.src.display(),
                        dest = %request.dest.display(),
                        error = %e,
                        "copy failed"
                    );
                }
                // A dropped receiver means the requester went away.
                let _ = request.reply.send(result);
            }
        });
        Self { requests }
    }
}

#[async_trait]
impl FileCopier for AsyncCopier {
    async fn copy(&self, src: &Path, dest: &Path) -> io::Result<u64> {
        let (reply, completion) = oneshot::channel();
        self.requests
            .send(CopyRequest {
                src: src.to_path_buf(),
                dest: dest.to_path_buf(),
                reply,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "copier task is gone"))?;
        completion
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "copier task is gone"))?
    }
}

async fn copy_file(src: &Path, dest: &Path) -> io::Result<u64> {
    let input = tokio::fs::File::open(src).await?;
    let output = tokio::fs::File::create(dest).await?;
    let mut reader = BufReader::new(input);
    let mut writer = BufWriter::new(output);
    let written = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.flush().await?;
    debug!(src = %src.display(), dest = %dest.display(), written, "copy complete");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_streams_contents() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.bin");
        let dest = tmp.path().join("dest.bin");
        let payload = vec![42u8; 100_000];
        tokio::fs::write(&src, &payload).await.unwrap();

        let copier = AsyncCopier::spawn();
        let written = copier.copy(&src, &dest).await.unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let copier = AsyncCopier::spawn();
        let err = copier
            .copy(&tmp.path().join("absent"), &tmp.path().join("out"))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_copies_are_independent() {
        let tmp = TempDir::new().unwrap();
        let copier = AsyncCopier::spawn();
        let mut tasks = Vec::new();
        for n in 0..4 {
            let src = tmp.path().join(format!("in{}.bin", n));
            let dest = tmp.path().join(format!("out{}.bin", n));
            tokio::fs::write(&src, vec![n as u8; 10_000]).await.unwrap();
            let copier = copier.clone();
            tasks.push(tokio::spawn(async move { copier.copy(&src, &dest).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }
}
