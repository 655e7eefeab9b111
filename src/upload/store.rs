//! Filesystem collaborator for the upload handler
//!
//! The handler talks to storage through `FileStore`/`FileSink` so tests
//! can substitute a failing store. A sink must release its resources on
//! every exit path: `finish` commits the file, `abort` removes whatever
//! was written so no partial file is left behind.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Destination for one uploaded file's bytes.
pub trait FileSink {
    /// Append a chunk.
    fn write(&mut self, chunk: &[u8]) -> impl std::future::Future<Output = io::Result<()>>;

    /// Commit the file, returning the bytes written. On error the partial
    /// file has already been removed.
    fn finish(self) -> impl std::future::Future<Output = io::Result<u64>>;

    /// Discard the file, removing anything already written.
    fn abort(self) -> impl std::future::Future<Output = ()>;
}

/// Storage backend creating sinks for destination paths.
pub trait FileStore {
    type Sink: FileSink;

    /// Make sure the destination directory exists.
    fn ensure_dir(&self, path: &Path) -> impl std::future::Future<Output = io::Result<()>>;

    /// Open a sink for the destination path, truncating any existing file.
    /// Concurrent writers to the same path are not serialized here.
    fn create(&self, dest: &Path) -> impl std::future::Future<Output = io::Result<Self::Sink>>;
}

/// `FileStore` backed by the local filesystem via `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStore;

impl DiskStore {
    pub const fn new() -> Self {
        Self
    }
}

impl FileStore for DiskStore {
    type Sink = DiskSink;

    async fn ensure_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn create(&self, dest: &Path) -> io::Result<DiskSink> {
        let file = File::create(dest).await?;
        Ok(DiskSink {
            file,
            path: dest.to_path_buf(),
            written: 0,
        })
    }
}

/// Open file handle plus enough state to clean up after a failure.
pub struct DiskSink {
    file: File,
    path: PathBuf,
    written: u64,
}

impl FileSink for DiskSink {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self) -> io::Result<u64> {
        if let Err(e) = self.file.flush().await {
            drop(self.file);
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(e);
        }
        Ok(self.written)
    }

    async fn abort(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_sink_writes_and_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let store = DiskStore::new();
        let mut sink = store.create(&dest).await.unwrap();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        let written = sink.finish().await.unwrap();

        assert_eq!(written, 11);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("partial.bin");

        let store = DiskStore::new();
        let mut sink = store.create(&dest).await.unwrap();
        sink.write(b"half written").await.unwrap();
        sink.abort().await;

        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn ensure_dir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");

        DiskStore::new().ensure_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
    }
}
