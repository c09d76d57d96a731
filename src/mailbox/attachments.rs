//! Scoped scratch directory for attachment files.
//!
//! One [`AttachmentCache`] lives for exactly one delivery attempt. Callers
//! [`release`](AttachmentCache::release) it when the attempt ends; a cache
//! dropped without release is removed off the async worker threads.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Per-account attachment directory, removed on release or drop.
#[derive(Debug)]
pub struct AttachmentCache {
    root: PathBuf,
    released: bool,
}

impl AttachmentCache {
    /// Scope a cache at `<base>/<account_id>`. Nothing is created until
    /// an attachment is written.
    pub fn new(base: &Path, account_id: i64) -> Self {
        Self {
            root: base.join(account_id.to_string()),
            released: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the attachments of one message.
    pub fn message_dir(&self, message_id: u32) -> PathBuf {
        self.root.join(message_id.to_string())
    }

    /// Write one attachment and return its path.
    ///
    /// Name collisions within a message get a numeric prefix.
    pub async fn save(
        &self,
        message_id: u32,
        file_name: &str,
        contents: &[u8],
    ) -> std::io::Result<PathBuf> {
        let dir = self.message_dir(message_id);
        tokio::fs::create_dir_all(&dir).await?;

        let clean = sanitize_file_name(file_name);
        let mut path = dir.join(&clean);
        let mut n = 1;
        while tokio::fs::try_exists(&path).await? {
            path = dir.join(format!("{n}_{clean}"));
            n += 1;
        }

        tokio::fs::write(&path, contents).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Attachment cached");
        Ok(path)
    }

    /// Remove the directory and everything in it.
    pub async fn release(mut self) {
        self.released = true;
        let result = tokio::fs::remove_dir_all(&self.root).await;
        log_removal(&self.root, result);
    }
}

impl Drop for AttachmentCache {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let root = std::mem::take(&mut self.root);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let result = std::fs::remove_dir_all(&root);
                    log_removal(&root, result);
                });
            }
            Err(_) => {
                let result = std::fs::remove_dir_all(&root);
                log_removal(&root, result);
            }
        }
    }
}

fn log_removal(root: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %root.display(), "Attachment cache released"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %root.display(), error = %e, "Failed to remove attachment cache"),
    }
}

/// Strip path separators and control characters from an attachment name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}
