// Typed errors for the hub link protocol engine.
//
// Every fallible operation in the crate returns one of these instead of a
// bare string, so callers can branch on the failure class: a busy serial
// port is recoverable by closing another program, a failed raw-mode entry
// is not.

use thiserror::Error;

/// Errors raised by the byte transport itself.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The underlying device is already claimed by another process.
    #[error("transport busy: device already in use")]
    Busy,
    /// The user cancelled the port/device chooser. Not a fault condition.
    #[error("transport access denied by user")]
    Denied,
    /// The device vanished (cable pulled, hub powered off, link lost).
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    /// Any other I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error means the device is gone (as opposed to a
    /// transient or configuration problem).
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected(_))
    }
}

/// A REPL state transition was not confirmed by the expected marker.
///
/// The controller never proceeds on an unconfirmed transition; the
/// snippet carries the tail of whatever the device actually sent.
#[derive(Debug, Clone, Error)]
#[error("unconfirmed REPL transition '{transition}' (last output: {snippet:?})")]
pub struct ProtocolStateError {
    pub transition: String,
    pub snippet: String,
}

impl ProtocolStateError {
    pub fn new(transition: &str, buffer: &[u8]) -> Self {
        Self {
            transition: transition.to_string(),
            snippet: snippet_of(buffer),
        }
    }
}

/// A protocol wait ran out of time.
#[derive(Debug, Clone, Error)]
#[error("operation '{operation}' timed out after {elapsed_ms}ms")]
pub struct TimeoutError {
    pub operation: String,
    pub elapsed_ms: u64,
}

/// Frame reassembly faults. These are recovered locally by the framer
/// (buffer reset) and are never surfaced to the user.
#[derive(Debug, Clone, Error)]
pub enum FramingError {
    #[error("truncated frame header")]
    TruncatedHeader,
    #[error("frame payload timed out mid-assembly")]
    PayloadTimeout,
}

/// A file failed to land on the device.
#[derive(Debug, Clone, Error)]
#[error("upload of '{path}' failed: {detail}")]
pub struct UploadError {
    pub path: String,
    pub detail: String,
}

/// Remote code ran but produced a traceback.
#[derive(Debug, Clone, Error)]
#[error("remote execution error: {captured:?}")]
pub struct ExecutionError {
    pub captured: String,
}

/// A scan was requested while another scan is active.
#[derive(Debug, Clone, Error)]
#[error("a device scan is already in progress")]
pub struct ScanBusyError;

/// An exclusive operation was requested while another holds the lock.
#[derive(Debug, Clone, Error)]
#[error("connection busy with operation '{current_operation}'")]
pub struct OperationBusyError {
    pub current_operation: String,
}

/// A runtime protocol message could not be parsed or dispatched.
#[derive(Debug, Clone, Error)]
#[error("command error: {detail}")]
pub struct CommandError {
    pub detail: String,
}

/// Umbrella error for the high-level connection API.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ProtocolState(#[from] ProtocolStateError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    ScanBusy(#[from] ScanBusyError),
    #[error(transparent)]
    OperationBusy(#[from] OperationBusyError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Maximum bytes of device output carried in an error snippet.
const SNIPPET_LEN: usize = 120;

/// Render the tail of a device output buffer for inclusion in an error.
pub(crate) fn snippet_of(buffer: &[u8]) -> String {
    let start = buffer.len().saturating_sub(SNIPPET_LEN);
    String::from_utf8_lossy(&buffer[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_truncates_to_tail() {
        let buf: Vec<u8> = (0..300).map(|i| b'a' + (i % 26) as u8).collect();
        let s = snippet_of(&buf);
        assert_eq!(s.len(), SNIPPET_LEN);
        assert!(buf.ends_with(s.as_bytes()));
    }

    #[test]
    fn test_framing_recovery_messages() {
        // These render into the framer's recovery log lines
        assert_eq!(
            FramingError::TruncatedHeader.to_string(),
            "truncated frame header"
        );
        assert_eq!(
            FramingError::PayloadTimeout.to_string(),
            "frame payload timed out mid-assembly"
        );
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(TransportError::Disconnected("gone".into()).is_disconnect());
        assert!(!TransportError::Busy.is_disconnect());
        assert!(!TransportError::Io("x".into()).is_disconnect());
    }

    #[test]
    fn test_link_error_from_conversions() {
        let e: LinkError = TransportError::Busy.into();
        assert!(matches!(e, LinkError::Transport(TransportError::Busy)));

        let e: LinkError = OperationBusyError {
            current_operation: "upload".into(),
        }
        .into();
        assert!(e.to_string().contains("upload"));
    }
}
