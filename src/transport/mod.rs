// Transport abstraction for the hub link.
//
// One duplex byte stream per session, either a USB serial port or a BLE
// notify/write characteristic pair. The trait keeps the rest of the engine
// ignorant of which one it is talking to; the loopback implementation
// stands in for real hardware in tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::TransportError;

pub mod loopback;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub mod serial;

pub mod ble;

/// A single duplex byte stream to the hub.
///
/// `read` returning an empty buffer means nothing arrived before the
/// timeout - that is the normal idle condition, not a fault.
#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read whatever is available, waiting at most `timeout`. An empty
    /// result is an idle timeout; errors mean the link itself failed.
    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Close the stream, cancelling any in-flight read. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Largest payload one write can carry, when the link is MTU-limited.
    /// `None` means the link takes arbitrarily large writes and the
    /// unframed newline wire shape applies.
    fn payload_ceiling(&self) -> Option<usize> {
        None
    }
}

/// Shared handle to the session's one transport. The supervisor's
/// operation lock decides who gets to hold this mutex for long stretches.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

// ============================================================================
// Continuous read loop
// ============================================================================

/// Handle to a running read loop. Dropping it without calling `stop`
/// leaves the loop running.
pub struct ReadLoopHandle {
    stop_flag: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReadLoopHandle {
    /// Signal the loop to stop and wait for it to actually finish, so the
    /// transport's read side is fully released when this returns.
    pub async fn stop(self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = self.task.await;
    }
}

/// Spawn the continuous read loop: poll the transport, hand every chunk to
/// `on_data`, and report a terminal error to `on_error` - unless the loop
/// was stopped deliberately, in which case errors from the dying transport
/// are suppressed.
pub fn spawn_read_loop<D, E>(
    transport: SharedTransport,
    poll: Duration,
    mut on_data: D,
    on_error: E,
) -> ReadLoopHandle
where
    D: FnMut(Vec<u8>) + Send + 'static,
    E: FnOnce(TransportError) + Send + 'static,
{
    let stop_flag = Arc::new(AtomicBool::new(false));
    let flag = stop_flag.clone();

    let task = tokio::spawn(async move {
        loop {
            if flag.load(Ordering::SeqCst) {
                break;
            }

            // Lock per iteration so writers and a stopping supervisor are
            // never starved for longer than one poll interval.
            let result = {
                let mut guard = transport.lock().await;
                guard.read(poll).await
            };

            match result {
                Ok(bytes) => {
                    if !bytes.is_empty() {
                        on_data(bytes);
                    }
                }
                Err(e) => {
                    if flag.load(Ordering::SeqCst) {
                        // Planned stop racing a close - not a fault
                        break;
                    }
                    tlog!("[transport] read loop terminated: {e}");
                    on_error(e);
                    break;
                }
            }
        }
    });

    ReadLoopHandle { stop_flag, task }
}
