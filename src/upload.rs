// File uploads to the hub's flash filesystem.
//
// Content travels as a Python bytes literal pasted at the REPL, so the
// write path never fights the interpreter's line discipline: backslashes
// and quotes are escaped and every non-printable byte is spelled \xNN.
// The remote write prints a sentinel with the byte count; a missing or
// wrong sentinel fails the file rather than trusting the transfer.

use crate::error::{LinkError, UploadError};
use crate::repl::{DeviceState, ReplController};

// ============================================================================
// Types
// ============================================================================

/// One file to push: device path plus exact content bytes.
#[derive(Clone, Debug)]
pub struct FileSpec {
    pub path: String,
    pub content: Vec<u8>,
}

/// Progress phases reported per file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPhase {
    Queued,
    Writing,
    Verifying,
    Done,
    Error,
}

/// Per-file outcome of a manifest upload.
#[derive(Clone, Debug)]
pub struct UploadResult {
    pub path: String,
    pub ok: bool,
    pub detail: Option<String>,
}

/// Sentinel word the remote write prints together with the byte count.
const SENTINEL: &str = "WROTE";

// ============================================================================
// Coordinator
// ============================================================================

pub struct FileUploadCoordinator<'a, 'c> {
    repl: &'c mut ReplController<'a>,
}

impl<'a, 'c> FileUploadCoordinator<'a, 'c> {
    pub fn new(repl: &'c mut ReplController<'a>) -> Self {
        FileUploadCoordinator { repl }
    }

    /// Create every missing directory along `path`'s parent, one segment
    /// at a time. Already-existing segments are fine (EEXIST tolerated).
    pub async fn ensure_directory(&mut self, path: &str) -> Result<(), LinkError> {
        let parent = match path.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => parent,
            _ => return Ok(()), // root-level file, nothing to create
        };

        let mut prefix = String::new();
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            let code = format!(
                "import os\r\ntry:\r\n    os.mkdir('{}')\r\nexcept OSError:\r\n    pass",
                escape_path(&prefix)
            );
            self.run(&code).await?;
        }
        Ok(())
    }

    /// Push one file, reporting phases to `on_progress`.
    pub async fn upload_file<P>(
        &mut self,
        spec: &FileSpec,
        on_progress: &mut P,
    ) -> Result<(), LinkError>
    where
        P: FnMut(&str, UploadPhase),
    {
        on_progress(&spec.path, UploadPhase::Queued);

        self.ensure_directory(&spec.path).await?;

        on_progress(&spec.path, UploadPhase::Writing);
        let code = format!(
            "_b = b\"{literal}\"\r\n_f = open('{path}', 'wb')\r\n_n = _f.write(_b)\r\n_f.close()\r\nprint('{sentinel}', _n)",
            literal = escape_bytes(&spec.content),
            path = escape_path(&spec.path),
            sentinel = SENTINEL,
        );
        let output = match self.run(&code).await {
            Ok(out) => out,
            Err(e) => {
                on_progress(&spec.path, UploadPhase::Error);
                return Err(UploadError {
                    path: spec.path.clone(),
                    detail: e.to_string(),
                }
                .into());
            }
        };

        on_progress(&spec.path, UploadPhase::Verifying);
        let expected = format!("{} {}", SENTINEL, spec.content.len());
        let confirmed = output
            .lines()
            .any(|line| !line.contains("print(") && line.trim() == expected);
        if !confirmed {
            on_progress(&spec.path, UploadPhase::Error);
            tlog!("[upload] Missing sentinel for {}", spec.path);
            return Err(UploadError {
                path: spec.path.clone(),
                detail: format!("write not confirmed (expected '{}')", expected),
            }
            .into());
        }

        on_progress(&spec.path, UploadPhase::Done);
        tlog!("[upload] Wrote {} ({} bytes)", spec.path, spec.content.len());
        Ok(())
    }

    /// Push a whole manifest, strictly in order. A failed file is recorded
    /// and the run keeps going; the caller gets the full result list.
    pub async fn upload_manifest<P>(
        &mut self,
        files: &[FileSpec],
        on_progress: &mut P,
    ) -> Vec<UploadResult>
    where
        P: FnMut(&str, UploadPhase),
    {
        let mut results = Vec::with_capacity(files.len());
        for spec in files {
            match self.upload_file(spec, on_progress).await {
                Ok(()) => results.push(UploadResult {
                    path: spec.path.clone(),
                    ok: true,
                    detail: None,
                }),
                Err(e) => results.push(UploadResult {
                    path: spec.path.clone(),
                    ok: false,
                    detail: Some(e.to_string()),
                }),
            }
        }
        results
    }

    /// Run a snippet in paste mode, re-entering it as needed (each run
    /// drops the interpreter back at the normal prompt).
    async fn run(&mut self, code: &str) -> Result<String, LinkError> {
        if self.repl.state() != DeviceState::PasteMode {
            if self.repl.state() != DeviceState::NormalPrompt {
                self.repl.interrupt().await?;
            }
            self.repl.enter_paste().await?;
        }
        self.repl.execute(code).await
    }
}

// ============================================================================
// Byte-literal encoding
// ============================================================================

/// Render `content` as the body of a Python bytes literal delimited by
/// double quotes. The remote `write` reproduces the exact input bytes.
pub fn escape_bytes(content: &[u8]) -> String {
    let mut out = String::with_capacity(content.len());
    for &b in content {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

/// Escape a device path for a single-quoted Python string.
fn escape_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::repl::test_double::spawn_interpreter;
    use crate::transport::loopback::LoopbackTransport;
    use std::sync::{Arc, Mutex};

    fn fast_config() -> LinkConfig {
        let mut cfg = LinkConfig::default();
        cfg.marker_timeout_ms = 200;
        cfg.drain_timeout_ms = 60;
        cfg.quiescence_ms = 40;
        cfg.execute_timeout_ms = 500;
        cfg.read_poll_ms = 10;
        cfg.interrupt_spacing_ms = 5;
        cfg
    }

    #[test]
    fn test_escape_bytes_covers_hazards() {
        assert_eq!(escape_bytes(b"plain text"), "plain text");
        assert_eq!(escape_bytes(b"a\\b"), "a\\\\b");
        assert_eq!(escape_bytes(b"say \"hi\""), "say \\\"hi\\\"");
        assert_eq!(escape_bytes(b"\x00\x1f\x7f"), "\\x00\\x1f\\x7f");
        assert_eq!(escape_bytes(b"line\r\n"), "line\\x0d\\x0a");
    }

    #[test]
    fn test_escape_path_quotes() {
        assert_eq!(escape_path("lib/it's.py"), "lib/it\\'s.py");
    }

    /// Undo `escape_bytes`, byte for byte. Test-side mirror of what the
    /// interpreter does with the literal.
    fn unescape(literal: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chars = literal.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c as u8);
                continue;
            }
            match chars.next() {
                Some('\\') => out.push(b'\\'),
                Some('"') => out.push(b'"'),
                Some('x') => {
                    let hi = chars.next().unwrap();
                    let lo = chars.next().unwrap();
                    let hex = format!("{hi}{lo}");
                    out.push(u8::from_str_radix(&hex, 16).unwrap());
                }
                other => panic!("unexpected escape: {:?}", other),
            }
        }
        out
    }

    /// Extract the bytes-literal body from an upload snippet.
    fn literal_of(code: &str) -> Option<String> {
        let start = code.find("b\"")? + 2;
        let rest = &code[start..];
        let mut end = 0;
        let bytes = rest.as_bytes();
        while end < bytes.len() {
            if bytes[end] == b'"' {
                return Some(rest[..end].to_string());
            }
            if bytes[end] == b'\\' {
                end += 1; // skip the escaped character
            }
            end += 1;
        }
        None
    }

    fn interpreter_with_fs(
        far: LoopbackTransport,
    ) -> (Arc<Mutex<Vec<(String, Vec<u8>)>>>, tokio::task::JoinHandle<()>) {
        let written: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let handle = spawn_interpreter(far, move |code| {
            if code.contains("os.mkdir") {
                return String::new();
            }
            if let Some(literal) = literal_of(code) {
                let bytes = unescape(&literal);
                let path = code
                    .split("open('")
                    .nth(1)
                    .and_then(|rest| rest.split('\'').next())
                    .unwrap_or("")
                    .to_string();
                let n = bytes.len();
                sink.lock().unwrap().push((path, bytes));
                return format!("{} {}", SENTINEL, n);
            }
            String::new()
        });
        (written, handle)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_round_trips_delimiter_bearing_content() {
        let (mut near, far) = LoopbackTransport::pair();
        let (written, _device) = interpreter_with_fs(far);
        let cfg = fast_config();
        let mut repl = ReplController::new(&mut near, &cfg);
        let mut uploader = FileUploadCoordinator::new(&mut repl);

        // Content full of the exact bytes that would break a naive paste
        let content = b"x = \"MSG:5|\"\r\nprint('\\\\')\x00\x04\x1b".to_vec();
        let spec = FileSpec {
            path: "main.py".into(),
            content: content.clone(),
        };

        let mut phases = Vec::new();
        uploader
            .upload_file(&spec, &mut |_, phase| phases.push(phase))
            .await
            .unwrap();

        let files = written.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "main.py");
        assert_eq!(files[0].1, content);
        assert_eq!(
            phases,
            vec![
                UploadPhase::Queued,
                UploadPhase::Writing,
                UploadPhase::Verifying,
                UploadPhase::Done
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nested_path_creates_directories_first() {
        let (mut near, far) = LoopbackTransport::pair();
        let mkdirs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = mkdirs.clone();
        let _device = spawn_interpreter(far, move |code| {
            if let Some(rest) = code.split("os.mkdir('").nth(1) {
                let dir = rest.split('\'').next().unwrap_or("").to_string();
                sink.lock().unwrap().push(dir);
                return String::new();
            }
            if code.contains("_f.write") {
                // Sentinel with whatever length the literal decodes to
                return format!("{} 2", SENTINEL);
            }
            String::new()
        });
        let cfg = fast_config();
        let mut repl = ReplController::new(&mut near, &cfg);
        let mut uploader = FileUploadCoordinator::new(&mut repl);

        let spec = FileSpec {
            path: "lib/games/words.py".into(),
            content: b"ok".to_vec(),
        };
        uploader.upload_file(&spec, &mut |_, _| {}).await.unwrap();

        assert_eq!(*mkdirs.lock().unwrap(), vec!["lib", "lib/games"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_sentinel_fails_the_file() {
        let (mut near, far) = LoopbackTransport::pair();
        let _device = spawn_interpreter(far, |_| "no confirmation here".to_string());
        let cfg = fast_config();
        let mut repl = ReplController::new(&mut near, &cfg);
        let mut uploader = FileUploadCoordinator::new(&mut repl);

        let spec = FileSpec {
            path: "main.py".into(),
            content: b"data".to_vec(),
        };
        let mut phases = Vec::new();
        let err = uploader
            .upload_file(&spec, &mut |_, phase| phases.push(phase))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Upload(_)));
        assert_eq!(phases.last(), Some(&UploadPhase::Error));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_manifest_continues_past_a_failure() {
        let (mut near, far) = LoopbackTransport::pair();
        let _device = spawn_interpreter(far, move |code| {
            if code.contains("os.mkdir") {
                return String::new();
            }
            if let Some(literal) = literal_of(code) {
                let bytes = unescape(&literal);
                // "bad" content gets a wrong count, everything else is honest
                if bytes == b"bad" {
                    return format!("{} 999", SENTINEL);
                }
                return format!("{} {}", SENTINEL, bytes.len());
            }
            String::new()
        });
        let cfg = fast_config();
        let mut repl = ReplController::new(&mut near, &cfg);
        let mut uploader = FileUploadCoordinator::new(&mut repl);

        let files = vec![
            FileSpec { path: "a.py".into(), content: b"first".to_vec() },
            FileSpec { path: "b.py".into(), content: b"bad".to_vec() },
            FileSpec { path: "c.py".into(), content: b"third".to_vec() },
        ];
        let results = uploader.upload_manifest(&files, &mut |_, _| {}).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].ok);
        assert!(!results[1].ok);
        assert!(results[1].detail.as_deref().unwrap_or("").contains("not confirmed"));
        assert!(results[2].ok);
    }
}
