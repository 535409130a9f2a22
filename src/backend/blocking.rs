use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;

use super::Backend;
use crate::error::{Error, Result};

/// Blocking entry points for filesystem callbacks running on their own threads.
///
/// Each call is spawned onto the backend's runtime and the calling thread
/// waits for it. Must not be used from inside that runtime's tasks.
#[derive(Clone)]
pub struct SyncBackend {
    backend: Arc<Backend>,
    runtime: Handle,
}

impl SyncBackend {
    pub fn new(backend: Arc<Backend>, runtime: Handle) -> Self {
        Self { backend, runtime }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    fn run<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let task = self.runtime.spawn(task);
        match self.runtime.block_on(task) {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Task(e.to_string())),
        }
    }

    pub fn open(&self, hash: &str, file_index: usize, flags: i32) -> io::Result<u64> {
        let backend = Arc::clone(&self.backend);
        let hash = hash.to_string();
        Ok(self.run(async move { backend.open(&hash, file_index, flags).await })?)
    }

    pub fn read(
        &self,
        hash: &str,
        file_index: usize,
        offset: u64,
        size: u64,
        handle: u64,
        timeout: Option<Duration>,
    ) -> io::Result<Bytes> {
        let backend = Arc::clone(&self.backend);
        let hash = hash.to_string();
        Ok(self.run(async move {
            backend
                .read(&hash, file_index, offset, size, handle, timeout)
                .await
        })?)
    }

    pub fn release(&self, hash: &str, file_index: usize, handle: u64) -> io::Result<()> {
        let backend = Arc::clone(&self.backend);
        let hash = hash.to_string();
        Ok(self.run(async move { backend.release(&hash, file_index, handle).await })?)
    }
}
