// src/io/pump.rs
//
// Byte stream pump: a cancellable task that pulls raw chunks from an open transport
// and republishes them on a bounded channel consumed by the frame decoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::error::LinkError;
use super::subscribers::Subscribers;
use super::transport::{ReadOutcome, Transport};
use super::now_us;
use crate::logging::hexdump;

/// Bytes shown per chunk in pump logs
const LOG_HEXDUMP_LEN: usize = 32;

/// Bytes delivered by a single transport read
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawChunk {
    pub bytes: Vec<u8>,
    /// Host receive time, microseconds since the Unix epoch
    pub timestamp_us: u64,
}

impl RawChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        RawChunk {
            bytes,
            timestamp_us: now_us(),
        }
    }
}

/// One item on the chunk channel. An `Err` is always the last item.
pub type ChunkItem = Result<RawChunk, LinkError>;

/// Receiving end of the chunk channel. Clones share the same receiver.
#[derive(Clone)]
pub struct ChunkSource {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkItem>>>,
}

impl ChunkSource {
    /// Create a bounded chunk channel.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ChunkItem>, ChunkSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            ChunkSource {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
        )
    }

    /// Next chunk, or `None` once the pump has exited and the channel is drained.
    pub async fn next(&self) -> Option<ChunkItem> {
        self.rx.lock().await.recv().await
    }
}

struct Running {
    source: ChunkSource,
    cancel_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task_handle: JoinHandle<()>,
}

/// Read loop over one transport handle.
pub struct BytePump {
    capacity: usize,
    running: Mutex<Option<Running>>,
}

impl BytePump {
    pub fn new(capacity: usize) -> Self {
        BytePump {
            capacity,
            running: Mutex::new(None),
        }
    }

    /// Whether the read loop is still alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.task_handle.is_finished()))
            .unwrap_or(false)
    }

    /// Start reading from `transport`. While a loop is already running its
    /// ChunkSource is returned and no second loop is spawned.
    pub fn start(
        &self,
        transport: Arc<dyn Transport>,
        raw_tap: Arc<Subscribers<RawChunk>>,
    ) -> Result<ChunkSource, LinkError> {
        let mut guard = self
            .running
            .lock()
            .map_err(|e| LinkError::ReadFailed(format!("Failed to lock pump state: {}", e)))?;

        if let Some(running) = guard.as_ref() {
            if !running.task_handle.is_finished() {
                return Ok(running.source.clone());
            }
        }

        let (tx, source) = ChunkSource::channel(self.capacity);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let task_handle = tokio::spawn(run_pump(
            transport,
            tx,
            raw_tap,
            cancel_flag.clone(),
            wake.clone(),
        ));

        *guard = Some(Running {
            source: source.clone(),
            cancel_flag,
            wake,
            task_handle,
        });
        Ok(source)
    }

    /// Cancel the read loop and wait for it to exit. No-op when not running.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(running) = running else {
            return;
        };

        running.cancel_flag.store(true, Ordering::Relaxed);
        // Stores a permit if the loop is between selects
        running.wake.notify_one();

        if let Err(e) = running.task_handle.await {
            if e.is_panic() {
                tlog!("[pump] Read loop panicked: {}", e);
            }
        }
    }
}

impl Drop for BytePump {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .map(|r| r.take())
            .unwrap_or(None);
        if let Some(running) = running {
            running.cancel_flag.store(true, Ordering::Relaxed);
            running.task_handle.abort();
        }
    }
}

async fn run_pump(
    transport: Arc<dyn Transport>,
    tx: mpsc::Sender<ChunkItem>,
    raw_tap: Arc<Subscribers<RawChunk>>,
    cancel_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let device = transport.describe();
    let mut total_bytes: u64 = 0;
    tlog!("[pump:{}] Read loop started", device);

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            tlog!("[pump:{}] Cancelled after {} bytes", device, total_bytes);
            break;
        }

        let outcome = tokio::select! {
            biased;
            _ = wake.notified() => continue,
            outcome = transport.read_chunk() => outcome,
        };

        match outcome {
            Ok(ReadOutcome::Chunk(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                let chunk = RawChunk::new(bytes);
                total_bytes += chunk.bytes.len() as u64;
                tlog!(
                    "[pump:{}] RX {} bytes: {}",
                    device,
                    chunk.bytes.len(),
                    hexdump(&chunk.bytes, LOG_HEXDUMP_LEN)
                );
                raw_tap.emit(&chunk);

                tokio::select! {
                    biased;
                    _ = wake.notified() => continue,
                    sent = tx.send(Ok(chunk)) => {
                        if sent.is_err() {
                            tlog!("[pump:{}] Chunk consumer gone, stopping", device);
                            break;
                        }
                    }
                }
            }
            Ok(ReadOutcome::EndOfStream) => {
                tlog!("[pump:{}] End of stream after {} bytes", device, total_bytes);
                break;
            }
            Err(e) => {
                tlog!("[pump:{}] Read error: {}", device, e);
                tokio::select! {
                    biased;
                    _ = wake.notified() => {}
                    _ = tx.send(Err(e)) => {}
                }
                break;
            }
        }
    }
}
