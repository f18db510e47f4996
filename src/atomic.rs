//! 上传写入用的临时文件与原子替换。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Sibling temp file that replaces its target on [`AtomicFile::commit`].
///
/// Temp names start with `.`, which sanitized names never do, so they can't
/// be addressed by a download. Dropping an uncommitted `AtomicFile` (for
/// example when the upload future is cancelled) removes the temp file.
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file: Some(file),
            finished: false,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::other("temp file already closed")),
        }
    }

    /// 放弃写入并删除临时文件。
    pub async fn discard(mut self) {
        self.file.take();
        self.finished = true;
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷盘后用临时文件替换目标文件，后写入者覆盖先写入者。
    pub async fn commit(mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Err(io::Error::other("temp file already closed"));
        };
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        self.finished = true;
        if let Err(err) = synced {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.file.take();
        if std::fs::remove_file(&self.temp_path).is_ok() {
            debug!(path = %self.temp_path.display(), "removed abandoned upload temp file");
        }
    }
}
