//! Refresh progress reporting.
//!
//! Reports what `tpr refresh` is doing while it walks history and writes
//! batches. Progress goes to **stderr** so stdout stays parseable for
//! scripts.

use std::io::Write;

/// A single progress event for refresh.
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshProgressEvent {
    /// Walking history. Total unknown.
    Scanning { scanned: u64 },
    /// A batch was embedded and written.
    Writing { written: u64, extracted: u64 },
}

/// Reports refresh progress. Implementations write to stderr (human or JSON).
pub trait RefreshProgressReporter: Send + Sync {
    fn report(&self, event: RefreshProgressEvent);
}

/// Human-friendly progress on stderr: "refresh  writing  1,234 / 5,000 patterns".
pub struct StderrProgress;

impl RefreshProgressReporter for StderrProgress {
    fn report(&self, event: RefreshProgressEvent) {
        let line = match &event {
            RefreshProgressEvent::Scanning { scanned } => {
                format!("refresh  scanning  {} revisions\n", format_number(*scanned))
            }
            RefreshProgressEvent::Writing { written, extracted } => format!(
                "refresh  writing  {} / {} patterns\n",
                format_number(*written),
                format_number(*extracted)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RefreshProgressReporter for JsonProgress {
    fn report(&self, event: RefreshProgressEvent) {
        let obj = match &event {
            RefreshProgressEvent::Scanning { scanned } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "scanned": scanned
            }),
            RefreshProgressEvent::Writing { written, extracted } => serde_json::json!({
                "event": "progress",
                "phase": "writing",
                "written": written,
                "extracted": extracted
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RefreshProgressReporter for NoProgress {
    fn report(&self, _event: RefreshProgressEvent) {}
}

/// `1234567` → `"1,234,567"`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RefreshProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
