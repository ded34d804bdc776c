//! Short-lived utility subprocesses. The dispatcher and the mixer worker
//! shell out to `mod-amixer`, `mod-bluetooth` and friends; everything goes
//! through the [`Runner`] trait so tests can substitute a recorder.

use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::Mutex;

/// Captured output never exceeds one serial carrier minus the NUL.
pub const CAPTURE_LIMIT: usize = 254;

pub trait Runner: Send + Sync {
    /// Runs `argv` to completion, discarding its output.
    fn run(&self, argv: &[&str]) -> bool;

    /// Runs `argv` and returns its stdout, stripped of a single trailing
    /// newline and silently truncated to [`CAPTURE_LIMIT`] bytes. `None` on
    /// any failure: spawn error, nonzero exit or empty output.
    fn run_capture(&self, argv: &[&str]) -> Option<String>;
}

pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, argv: &[&str]) -> bool {
        log::debug!("running {:?}", argv);
        match Command::new(argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                log::error!("cannot exec {:?}: {}", argv[0], e);
                false
            }
        }
    }

    fn run_capture(&self, argv: &[&str]) -> Option<String> {
        log::debug!("running {:?} with capture", argv);
        let output = match Command::new(argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                log::error!("cannot exec {:?}: {}", argv[0], e);
                return None;
            }
        };

        if !output.status.success() || output.stdout.is_empty() {
            return None;
        }

        let mut bytes = &output.stdout[..output.stdout.len().min(CAPTURE_LIMIT)];
        if bytes.last() == Some(&b'\n') {
            bytes = &bytes[..bytes.len() - 1];
        }
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Test double: records every invocation and replays configured outputs.
/// An invocation whose joined argv has no configured output fails, which is
/// also how tests exercise the error replies.
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    outputs: Mutex<HashMap<String, String>>,
}

impl RecordingRunner {
    pub fn new() -> RecordingRunner {
        RecordingRunner { calls: Mutex::new(Vec::new()), outputs: Mutex::new(HashMap::new()) }
    }

    /// Declares `argv` (space-joined) as succeeding with `output`.
    pub fn set_output(&self, argv: &str, output: &str) {
        self.outputs.lock().unwrap().insert(argv.to_owned(), output.to_owned());
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, argv: &[&str]) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .push(argv.iter().map(|s| (*s).to_owned()).collect());
        self.outputs.lock().unwrap().get(&argv.join(" ")).cloned()
    }
}

impl Runner for RecordingRunner {
    fn run(&self, argv: &[&str]) -> bool {
        self.record(argv).is_some()
    }

    fn run_capture(&self, argv: &[&str]) -> Option<String> {
        self.record(argv)
    }
}
