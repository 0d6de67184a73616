// Interactive interpreter control.
//
// Drives the hub's MicroPython REPL through its interrupt, raw-execution
// and paste states. Every transition is confirmed by the interpreter's own
// marker text before the controller proceeds; an unconfirmed transition is
// an error carrying a snippet of whatever the device actually sent, never
// a silent "continue anyway".

use std::time::Instant;

use crate::config::LinkConfig;
use crate::error::{
    snippet_of, ExecutionError, LinkError, ProtocolStateError, TimeoutError,
};
use crate::transport::Transport;

// ============================================================================
// Control bytes and markers
// ============================================================================

/// Ctrl-A: enter raw mode
pub const ENTER_RAW: u8 = 0x01;
/// Ctrl-B: leave raw mode
pub const EXIT_RAW: u8 = 0x02;
/// Ctrl-C: break / keyboard interrupt
pub const BREAK: u8 = 0x03;
/// Ctrl-D: execute pending input, or soft reset at the normal prompt
pub const EXECUTE: u8 = 0x04;
/// Ctrl-E: enter paste mode
pub const PASTE: u8 = 0x05;

pub const RAW_PROMPT_MARKER: &str = "raw REPL; CTRL-B to exit";
pub const NORMAL_PROMPT: &str = ">>> ";
pub const PASTE_PROMPT: &str = "=== ";
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// One-liner the identity query pastes at the prompt. The '|' separators
/// keep the reply trivially parseable next to the echoed input.
const IDENTITY_SNIPPET: &str =
    "import sys; print(sys.implementation.name + '|' + sys.version + '|' + sys.platform)";

// ============================================================================
// Types
// ============================================================================

/// Where the controller believes the interpreter currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Interrupting,
    NormalPrompt,
    EnteringRaw,
    RawPrompt,
    PasteMode,
    Executing,
    Resetting,
}

/// Parsed reply to an identity query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub implementation: String,
    pub version: String,
    pub platform: String,
}

// ============================================================================
// Controller
// ============================================================================

pub struct ReplController<'a> {
    transport: &'a mut dyn Transport,
    config: LinkConfig,
    state: DeviceState,
}

impl<'a> ReplController<'a> {
    pub fn new(transport: &'a mut dyn Transport, config: &LinkConfig) -> Self {
        ReplController {
            transport,
            config: config.clone(),
            state: DeviceState::Unknown,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Break out of whatever the interpreter is doing and land at a
    /// confirmed normal prompt. Break signals go out several times because
    /// a busy program may swallow the first one.
    pub async fn interrupt(&mut self) -> Result<(), LinkError> {
        let prior = self.state;
        self.state = DeviceState::Interrupting;

        for attempt in 0..self.config.interrupt_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.interrupt_spacing()).await;
            }
            if let Err(e) = self.transport.write(&[BREAK]).await {
                self.state = prior;
                return Err(e.into());
            }
        }

        if let Err(e) = self.drain_stale().await {
            self.state = prior;
            return Err(e);
        }

        // A bare newline makes an idle interpreter reprint its prompt
        if let Err(e) = self.transport.write(b"\r\n").await {
            self.state = prior;
            return Err(e.into());
        }
        match self.wait_for_marker(NORMAL_PROMPT, "interrupt").await {
            Ok(_) => {
                self.state = DeviceState::NormalPrompt;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Unknown;
                Err(e)
            }
        }
    }

    /// Enter raw mode. On failure the controller's state is unchanged.
    pub async fn enter_raw(&mut self) -> Result<(), LinkError> {
        let prior = self.state;
        self.state = DeviceState::EnteringRaw;
        match self.signal_and_confirm(ENTER_RAW, RAW_PROMPT_MARKER, "enter raw mode").await {
            Ok(()) => {
                self.state = DeviceState::RawPrompt;
                Ok(())
            }
            Err(e) => {
                self.state = prior;
                Err(e)
            }
        }
    }

    /// Leave raw mode, confirming the normal prompt.
    pub async fn exit_raw(&mut self) -> Result<(), LinkError> {
        let prior = self.state;
        match self.signal_and_confirm(EXIT_RAW, NORMAL_PROMPT, "exit raw mode").await {
            Ok(()) => {
                self.state = DeviceState::NormalPrompt;
                Ok(())
            }
            Err(e) => {
                self.state = prior;
                Err(e)
            }
        }
    }

    /// Enter paste mode from a confirmed normal prompt.
    pub async fn enter_paste(&mut self) -> Result<(), LinkError> {
        if self.state != DeviceState::NormalPrompt {
            return Err(ProtocolStateError {
                transition: "enter paste mode".into(),
                snippet: format!("not at the normal prompt (state {:?})", self.state),
            }
            .into());
        }
        match self.signal_and_confirm(PASTE, PASTE_PROMPT, "enter paste mode").await {
            Ok(()) => {
                self.state = DeviceState::PasteMode;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::NormalPrompt;
                Err(e)
            }
        }
    }

    /// Send `code` and run it, capturing everything the interpreter prints
    /// until the output goes quiet. Valid from the raw prompt or paste
    /// mode only. A traceback in the output is an execution error.
    pub async fn execute(&mut self, code: &str) -> Result<String, LinkError> {
        let entry = self.state;
        if entry != DeviceState::RawPrompt && entry != DeviceState::PasteMode {
            return Err(ProtocolStateError {
                transition: "execute".into(),
                snippet: format!("not executable from state {:?}", entry),
            }
            .into());
        }

        self.transport.write(code.as_bytes()).await?;
        if entry == DeviceState::PasteMode && !code.ends_with('\n') {
            self.transport.write(b"\r\n").await?;
        }
        self.state = DeviceState::Executing;
        self.transport.write(&[EXECUTE]).await?;

        let captured = match self.capture_until_quiescent("execute").await {
            Ok(buf) => buf,
            Err(e) => {
                self.state = DeviceState::Unknown;
                return Err(e);
            }
        };

        // Running a paste buffer drops the interpreter back at the prompt
        self.state = if entry == DeviceState::PasteMode {
            DeviceState::NormalPrompt
        } else {
            DeviceState::RawPrompt
        };

        let text = String::from_utf8_lossy(&captured).into_owned();
        if text.contains(TRACEBACK_MARKER) {
            return Err(ExecutionError {
                captured: snippet_of(&captured),
            }
            .into());
        }
        Ok(text)
    }

    /// Ask the interpreter what it is. Safe to repeat; never resets the
    /// device.
    pub async fn query_identity(&mut self) -> Result<DeviceIdentity, LinkError> {
        self.interrupt().await?;
        self.enter_paste().await?;
        let output = self.execute(IDENTITY_SNIPPET).await?;
        parse_identity(&output).ok_or_else(|| {
            ProtocolStateError {
                transition: "identity query".into(),
                snippet: snippet_of(output.as_bytes()),
            }
            .into()
        })
    }

    /// Soft-reset the interpreter. Requires a confirmed normal prompt, so
    /// the controller interrupts first.
    pub async fn soft_reset(&mut self) -> Result<(), LinkError> {
        self.interrupt().await?;
        self.state = DeviceState::Resetting;
        if let Err(e) = self.transport.write(&[EXECUTE]).await {
            self.state = DeviceState::Unknown;
            return Err(e.into());
        }
        match self.wait_for_marker(NORMAL_PROMPT, "soft reset").await {
            Ok(_) => {
                self.state = DeviceState::NormalPrompt;
                Ok(())
            }
            Err(e) => {
                self.state = DeviceState::Unknown;
                Err(e)
            }
        }
    }

    /// Hard-reset the board. No confirmation is awaited - the link drops
    /// as the chip reboots.
    pub async fn hard_reset(&mut self) -> Result<(), LinkError> {
        self.interrupt().await?;
        self.enter_paste().await?;
        self.transport
            .write(b"import machine\r\nmachine.reset()\r\n")
            .await?;
        self.transport.write(&[EXECUTE]).await?;
        self.state = DeviceState::Unknown;
        tlog!("[repl] Hard reset issued");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn signal_and_confirm(
        &mut self,
        signal: u8,
        marker: &str,
        transition: &str,
    ) -> Result<(), LinkError> {
        self.transport.write(&[signal]).await?;
        self.wait_for_marker(marker, transition).await?;
        Ok(())
    }

    /// Accumulate device output until `marker` appears, or fail with the
    /// tail of whatever did arrive.
    async fn wait_for_marker(
        &mut self,
        marker: &str,
        transition: &str,
    ) -> Result<Vec<u8>, LinkError> {
        let deadline = Instant::now() + self.config.marker_timeout();
        let mut buf: Vec<u8> = Vec::new();
        let needle = marker.as_bytes();

        loop {
            let chunk = self.transport.read(self.config.read_poll()).await?;
            buf.extend_from_slice(&chunk);
            if buf.len() >= needle.len()
                && buf.windows(needle.len()).any(|w| w == needle)
            {
                return Ok(buf);
            }
            if Instant::now() >= deadline {
                tlog!("[repl] Transition '{transition}' unconfirmed");
                return Err(ProtocolStateError::new(transition, &buf).into());
            }
        }
    }

    /// Discard pending output until the line goes quiet, bounded by the
    /// drain timeout.
    async fn drain_stale(&mut self) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.config.drain_timeout();
        loop {
            let chunk = self.transport.read(self.config.read_poll()).await?;
            if chunk.is_empty() || Instant::now() >= deadline {
                return Ok(());
            }
        }
    }

    /// Capture output until no new bytes arrive for a quiescence window.
    /// The overall wait is bounded by the execute timeout.
    async fn capture_until_quiescent(&mut self, operation: &str) -> Result<Vec<u8>, LinkError> {
        let started = Instant::now();
        let deadline = started + self.config.execute_timeout();
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let chunk = self.transport.read(self.config.quiescence()).await?;
            if chunk.is_empty() {
                if !buf.is_empty() {
                    return Ok(buf);
                }
            } else {
                buf.extend_from_slice(&chunk);
            }
            if Instant::now() >= deadline {
                if !buf.is_empty() {
                    return Ok(buf);
                }
                return Err(TimeoutError {
                    operation: operation.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
                .into());
            }
        }
    }
}

/// Pick the identity triple out of the captured output, skipping the
/// echoed input line.
fn parse_identity(output: &str) -> Option<DeviceIdentity> {
    for line in output.lines().rev() {
        if line.contains("print(") {
            continue;
        }
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() == 3 && !parts[0].is_empty() {
            return Some(DeviceIdentity {
                implementation: parts[0].trim().to_string(),
                version: parts[1].trim().to_string(),
                platform: parts[2].trim().to_string(),
            });
        }
    }
    None
}

// ============================================================================
// Scripted interpreter double (test support)
// ============================================================================
