//! In-process byte pipes connecting a worker to its running script.
//!
//! Writes are split into chunks of at most [`MAX_CHUNK`] bytes and queued in
//! order. A [`bounded_pipe`] makes blocking writers wait for the reader.
//! Readers see end-of-stream once every writer is dropped, and the blocking
//! read used by scripts also gives up when its cancellation token fires.

use std::time::Duration;

use bytes::Bytes;
use flume::RecvTimeoutError;
use tokio_util::sync::CancellationToken;

/// Largest chunk handed to the reader in one piece.
pub const MAX_CHUNK: usize = 4096;

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("pipe closed")]
    Closed,
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = flume::unbounded();
    (PipeWriter { tx }, PipeReader { rx })
}

/// Pipe holding at most `capacity` chunks.
pub fn bounded_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = flume::bounded(capacity);
    (PipeWriter { tx }, PipeReader { rx })
}

#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: flume::Sender<Bytes>,
}

impl PipeWriter {
    pub fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        for chunk in data.chunks(MAX_CHUNK) {
            self.tx
                .send(Bytes::copy_from_slice(chunk))
                .map_err(|_| PipeError::Closed)?;
        }
        Ok(data.len())
    }

    /// Queue `data` without copying, splitting it if needed. Waits for room
    /// without blocking the runtime.
    pub async fn send(&self, mut data: Bytes) -> Result<(), PipeError> {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_CHUNK));
            self.tx
                .send_async(chunk)
                .await
                .map_err(|_| PipeError::Closed)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipeReader {
    rx: flume::Receiver<Bytes>,
}

impl PipeReader {
    /// Next chunk, or `None` once every writer is gone.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.recv_async().await.ok()
    }

    /// Blocking read for use off the async runtime.
    pub fn recv_blocking(&self, cancel: &CancellationToken) -> Option<Bytes> {
        loop {
            match self.rx.recv_timeout(CANCEL_POLL) {
                Ok(chunk) => return Some(chunk),
                Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => return None,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_are_chunked_in_order() {
        let (writer, reader) = pipe();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(writer.write(&data).unwrap(), data.len());
        drop(writer);

        let mut received = Vec::new();
        let mut sizes = Vec::new();
        while let Some(chunk) = reader.recv().await {
            sizes.push(chunk.len());
            received.extend_from_slice(&chunk);
        }
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_send_splits() {
        let (writer, reader) = pipe();
        writer.send(Bytes::from(vec![7u8; 5000])).await.unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(reader.recv_blocking(&cancel).unwrap().len(), MAX_CHUNK);
        assert_eq!(reader.recv_blocking(&cancel).unwrap().len(), 904);
    }

    #[test]
    fn test_blocking_read_unblocks() {
        let (writer, reader) = pipe();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(reader.recv_blocking(&cancel).is_none());

        drop(writer);
        assert!(reader.recv_blocking(&CancellationToken::new()).is_none());
    }

    #[test]
    fn test_bounded_pipe_blocks_writer_until_read() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let (writer, reader) = bounded_pipe(2);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let thread = std::thread::spawn(move || {
            writer.write(&[1u8; MAX_CHUNK * 3]).unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));

        let cancel = CancellationToken::new();
        assert_eq!(reader.recv_blocking(&cancel).unwrap().len(), MAX_CHUNK);
        thread.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_async_send_waits_for_room() {
        let (writer, reader) = bounded_pipe(1);
        writer.send(Bytes::from_static(b"one")).await.unwrap();
        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.send(Bytes::from_static(b"two")).await }
        });
        assert_eq!(reader.recv().await.unwrap(), Bytes::from_static(b"one"));
        pending.await.unwrap().unwrap();
        assert_eq!(reader.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn test_write_after_reader_dropped() {
        let (writer, reader) = pipe();
        drop(reader);
        assert!(matches!(writer.write(b"x").unwrap_err(), PipeError::Closed));
    }
}
