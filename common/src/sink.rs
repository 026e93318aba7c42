//! File of CIDs that failed to copy, one per line, reusable as a later CID list

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use cid::Cid;
use tokio::io::AsyncWriteExt;

enum Target {
    File {
        path: PathBuf,
        writer: tokio::sync::Mutex<tokio::io::BufWriter<tokio::fs::File>>,
    },
    Discard,
}

/// Records CIDs that failed to copy, one per line, so a later run can retry just those.
///
/// Writes are buffered and serialized internally, so the sink can be shared between workers.
/// Nothing is guaranteed to be on disk until [`FailureSink::flush`] returns.
pub struct FailureSink {
    target: Target,
    recorded: AtomicU64,
}

impl std::fmt::Debug for FailureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("FailureSink");
        if let Some(path) = self.path() {
            debug.field("path", &path);
        }
        debug.field("recorded", &self.recorded()).finish()
    }
}

impl FailureSink {
    /// Creates (or truncates) the file at `path`.
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("cannot create failed CIDs file {path:?}"))?;
        Ok(Self {
            target: Target::File {
                path: path.to_path_buf(),
                writer: tokio::sync::Mutex::new(tokio::io::BufWriter::new(file)),
            },
            recorded: AtomicU64::new(0),
        })
    }

    /// Sink that accepts every write and keeps nothing.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            target: Target::Discard,
            recorded: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File { path, .. } => Some(path),
            Target::Discard => None,
        }
    }

    /// Number of CIDs written to the file so far (always 0 when discarding).
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub async fn write(&self, cid: &Cid) -> std::io::Result<()> {
        let Target::File { writer, .. } = &self.target else {
            return Ok(());
        };
        let line = format!("{cid}\n");
        writer.lock().await.write_all(line.as_bytes()).await?;
        self.recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn flush(&self) -> std::io::Result<()> {
        let Target::File { writer, path } = &self.target else {
            return Ok(());
        };
        let mut writer = writer.lock().await;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        tracing::debug!(
            "flushed {} failed CID(s) to {:?}",
            self.recorded(),
            path
        );
        Ok(())
    }
}
