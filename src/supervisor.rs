// Connection supervision.
//
// Owns the session's one transport and arbitrates between the two ways of
// using it: the continuous streaming read loop feeding typed events to the
// consumer, and exclusive REPL operations (identity query, uploads, reset)
// that need the byte stream to themselves. Exclusive operations take the
// operation lock, stop the read loop and wait for it to actually exit plus
// a settle delay, do their REPL work, then restart the loop - on every
// exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::config::LinkConfig;
use crate::error::{LinkError, OperationBusyError, TransportError};
use crate::framing::{encode_frame, HubFramer, WireShape};
use crate::protocol::{
    encode_request, parse_hub_message, AckStatus, DeviceRecord, HubMessage, HubRequest,
    RssiThreshold,
};
use crate::repl::{DeviceIdentity, ReplController};
use crate::transport::{share, spawn_read_loop, ReadLoopHandle, SharedTransport, Transport};
use crate::upload::{FileSpec, FileUploadCoordinator, UploadPhase, UploadResult};

// ============================================================================
// Events
// ============================================================================

/// Typed events delivered to the consumer over the event channel.
#[derive(Clone, Debug)]
pub enum HubEvent {
    Connected,
    Disconnected { detail: String, planned: bool },
    /// The hub announced itself after bringing its radio up.
    Ready { mode: String, mac: String },
    DevicesUpdated(Vec<DeviceRecord>),
    CommandAcknowledged {
        command: String,
        status: AckStatus,
        rssi: RssiThreshold,
    },
    Error { message: String },
}

/// What the connection is currently being used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkMode {
    Idle,
    Streaming,
    Repl,
}

// ============================================================================
// Supervisor
// ============================================================================

struct ConnState {
    transport: SharedTransport,
    read_loop: Option<ReadLoopHandle>,
    shape: WireShape,
}

pub struct ConnectionSupervisor {
    config: LinkConfig,
    /// Shared with the read loop's error path, which tears the connection
    /// down from its own task.
    state: Arc<Mutex<Option<ConnState>>>,
    /// Operation lock. Holds the name of the running exclusive operation.
    busy: StdMutex<Option<String>>,
    planned_close: Arc<AtomicBool>,
    events: UnboundedSender<HubEvent>,
    mode: Arc<StdMutex<LinkMode>>,
}

/// Clears the busy slot when the operation ends, however it ends.
struct OpGuard<'a> {
    slot: &'a StdMutex<Option<String>>,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl ConnectionSupervisor {
    pub fn new(config: &LinkConfig) -> (Self, UnboundedReceiver<HubEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            ConnectionSupervisor {
                config: config.clone(),
                state: Arc::new(Mutex::new(None)),
                busy: StdMutex::new(None),
                planned_close: Arc::new(AtomicBool::new(false)),
                events,
                mode: Arc::new(StdMutex::new(LinkMode::Idle)),
            },
            receiver,
        )
    }

    pub fn mode(&self) -> LinkMode {
        self.mode.lock().map(|m| *m).unwrap_or(LinkMode::Idle)
    }

    /// Name of the exclusive operation currently holding the lock.
    pub fn current_operation(&self) -> Option<String> {
        self.busy.lock().ok().and_then(|slot| slot.clone())
    }

    /// Adopt an open transport and start streaming. The wire shape follows
    /// the transport's payload ceiling (config can force one for links
    /// that cannot report theirs).
    pub async fn connect(&self, transport: Box<dyn Transport>) -> Result<(), LinkError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(TransportError::Busy.into());
        }

        let ceiling = transport
            .payload_ceiling()
            .or(self.config.mtu_payload_ceiling);
        let shape = if ceiling.is_some() {
            WireShape::LengthPrefixed
        } else {
            WireShape::Lines
        };

        self.planned_close.store(false, Ordering::SeqCst);
        let shared = share(transport);
        let handle = self.spawn_loop(shared.clone(), shape);
        *state = Some(ConnState {
            transport: shared,
            read_loop: Some(handle),
            shape,
        });
        self.set_mode(LinkMode::Streaming);

        tlog!("[link] Connected ({shape:?} wire shape)");
        let _ = self.events.send(HubEvent::Connected);
        Ok(())
    }

    /// Orderly teardown: stop the loop, close the transport, report a
    /// planned disconnect. A no-op when not connected.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        let conn = match state.take() {
            Some(c) => c,
            None => return,
        };

        // Errors out of the dying transport are expected from here on
        self.planned_close.store(true, Ordering::SeqCst);
        if let Some(handle) = conn.read_loop {
            handle.stop().await;
        }
        if let Err(e) = conn.transport.lock().await.close().await {
            tlog!("[link] Close reported: {e}");
        }
        self.set_mode(LinkMode::Idle);

        tlog!("[link] Disconnected (requested)");
        let _ = self.events.send(HubEvent::Disconnected {
            detail: "closed by request".to_string(),
            planned: true,
        });
    }

    /// Send one command to the hub, encoded for the connection's wire
    /// shape.
    pub async fn send_command(
        &self,
        cmd: &str,
        threshold: RssiThreshold,
    ) -> Result<(), LinkError> {
        let state = self.state.lock().await;
        let conn = state.as_ref().ok_or_else(not_connected)?;

        let payload = encode_request(&HubRequest {
            cmd: cmd.to_string(),
            rssi: threshold,
        });
        let bytes = match conn.shape {
            WireShape::Lines => {
                let mut out = payload.into_bytes();
                out.push(b'\n');
                out
            }
            WireShape::LengthPrefixed => encode_frame(payload.as_bytes()),
        };

        conn.transport.lock().await.write(&bytes).await?;
        Ok(())
    }

    /// Ask the hub firmware what it is. Exclusive.
    pub async fn query_identity(&self) -> Result<DeviceIdentity, LinkError> {
        let (_guard, shared) = self.begin_exclusive("identity query").await?;
        let result = {
            let mut transport = shared.lock().await;
            let mut repl = ReplController::new(&mut **transport, &self.config);
            repl.query_identity().await
        };
        self.end_exclusive().await;
        result
    }

    /// Push files to the hub's filesystem. Exclusive. Per-file failures
    /// are recorded in the result list; the manifest keeps going.
    pub async fn upload_files<P>(
        &self,
        files: &[FileSpec],
        mut on_progress: P,
    ) -> Result<Vec<UploadResult>, LinkError>
    where
        P: FnMut(&str, UploadPhase),
    {
        let (_guard, shared) = self.begin_exclusive("file upload").await?;
        let results = {
            let mut transport = shared.lock().await;
            let mut repl = ReplController::new(&mut **transport, &self.config);
            let mut uploader = FileUploadCoordinator::new(&mut repl);
            uploader.upload_manifest(files, &mut on_progress).await
        };
        self.end_exclusive().await;
        Ok(results)
    }

    /// Soft-reset the hub firmware. Exclusive.
    pub async fn soft_reset(&self) -> Result<(), LinkError> {
        let (_guard, shared) = self.begin_exclusive("soft reset").await?;
        let result = {
            let mut transport = shared.lock().await;
            let mut repl = ReplController::new(&mut **transport, &self.config);
            repl.soft_reset().await
        };
        self.end_exclusive().await;
        result
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn acquire(&self, name: &str) -> Result<OpGuard<'_>, OperationBusyError> {
        let mut slot = self.busy.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = slot.clone() {
            return Err(OperationBusyError {
                current_operation: current,
            });
        }
        *slot = Some(name.to_string());
        Ok(OpGuard { slot: &self.busy })
    }

    /// Take the operation lock and quiet the line: stop the read loop,
    /// wait for it to actually exit, then wait the settle delay before
    /// handing the transport over.
    async fn begin_exclusive(
        &self,
        name: &str,
    ) -> Result<(OpGuard<'_>, SharedTransport), LinkError> {
        let guard = self.acquire(name)?;
        let shared = {
            let mut state = self.state.lock().await;
            let conn = state.as_mut().ok_or_else(not_connected)?;
            if let Some(handle) = conn.read_loop.take() {
                handle.stop().await;
            }
            conn.transport.clone()
        };
        tokio::time::sleep(self.config.settle_delay()).await;
        self.set_mode(LinkMode::Repl);
        tlog!("[link] Exclusive operation started: {name}");
        Ok((guard, shared))
    }

    /// Put the connection back into streaming after an exclusive
    /// operation, if it still exists.
    async fn end_exclusive(&self) {
        let mut state = self.state.lock().await;
        match state.as_mut() {
            Some(conn) => {
                if conn.read_loop.is_none() {
                    conn.read_loop = Some(self.spawn_loop(conn.transport.clone(), conn.shape));
                }
                self.set_mode(LinkMode::Streaming);
            }
            None => self.set_mode(LinkMode::Idle),
        }
    }

    fn spawn_loop(&self, shared: SharedTransport, shape: WireShape) -> ReadLoopHandle {
        let mut framer = HubFramer::new(shape, self.config.frame_timeout());
        let events = self.events.clone();
        let on_data = move |chunk: Vec<u8>| {
            for frame in framer.feed(&chunk, Instant::now()) {
                let text = String::from_utf8_lossy(&frame);
                match parse_hub_message(&text) {
                    Ok(msg) => dispatch(&events, msg),
                    Err(e) => {
                        tlog!("[link] Dropping unparseable message: {}", e.detail);
                    }
                }
            }
        };

        let events = self.events.clone();
        let planned = self.planned_close.clone();
        let state = self.state.clone();
        let mode = self.mode.clone();
        let on_error = move |e: TransportError| {
            if planned.load(Ordering::SeqCst) {
                return;
            }
            // Tear the connection down before reporting it gone, so the
            // event's observer can reconnect immediately. The dead state
            // must not linger: a stale ConnState would refuse the next
            // connect and force a second, planned-looking disconnect.
            tokio::spawn(async move {
                if let Some(conn) = state.lock().await.take() {
                    if let Some(handle) = conn.read_loop {
                        handle.stop().await;
                    }
                    if let Err(close_err) = conn.transport.lock().await.close().await {
                        tlog!("[link] Close after link loss reported: {close_err}");
                    }
                }
                if let Ok(mut slot) = mode.lock() {
                    *slot = LinkMode::Idle;
                }
                tlog!("[link] Link lost: {e}");
                let _ = events.send(HubEvent::Disconnected {
                    detail: e.to_string(),
                    planned: false,
                });
            });
        };

        spawn_read_loop(shared, self.config.read_poll(), on_data, on_error)
    }

    fn set_mode(&self, mode: LinkMode) {
        if let Ok(mut slot) = self.mode.lock() {
            *slot = mode;
        }
    }
}

fn not_connected() -> LinkError {
    TransportError::Io("not connected".to_string()).into()
}

/// Map one inbound hub message onto its consumer event.
fn dispatch(events: &UnboundedSender<HubEvent>, msg: HubMessage) {
    let event = match msg {
        HubMessage::Ack {
            command,
            status,
            rssi,
        } => HubEvent::CommandAcknowledged {
            command,
            status,
            rssi,
        },
        HubMessage::Devices { list } => HubEvent::DevicesUpdated(list),
        HubMessage::Error { message } => HubEvent::Error { message },
        HubMessage::Ready { mode, mac } => HubEvent::Ready { mode, mac },
    };
    let _ = events.send(event);
}
