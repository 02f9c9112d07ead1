//! Structured JSONL logging for scenario runs and scheduler traces.
//!
//! - [`LogEntry`]: one JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes records to a file or an in-memory buffer.
//! - [`ArtifactIndex`]: lists emitted files with their SHA-256 digests.
//! - [`validate_log_line`] / [`validate_log_file`]: schema checks.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uthread_core::trace::{TraceEvent, TraceKind};

use crate::scenarios::ScenarioReport;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const NAMES: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

impl Outcome {
    const NAMES: [&'static str; 3] = ["pass", "fail", "error"];
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// A scenario summary.
    Scenario,
    /// A scheduler event copied out of the trace ring.
    Trace,
    /// The harness itself.
    Harness,
}

impl Source {
    const NAMES: [&'static str; 3] = ["scenario", "trace", "harness"];
}

/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Runtime id from the trace ring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u64>,
    /// Packed thread id from the trace ring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<u64>,
    /// Trace ring sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_refs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            source: None,
            scenario: None,
            seed: None,
            runtime: None,
            thread: None,
            seq: None,
            outcome: None,
            errno: None,
            duration_ms: None,
            artifact_refs: None,
            details: None,
        }
    }

    /// Record for one scheduler trace event. Violations and fatal errors log
    /// at `error`, everything else at `trace`.
    #[must_use]
    pub fn from_trace(trace_id: impl Into<String>, ev: &TraceEvent) -> Self {
        let level = match ev.kind {
            TraceKind::Violation | TraceKind::Fatal => LogLevel::Error,
            _ => LogLevel::Trace,
        };
        let mut entry = Self::new(trace_id, level, ev.kind.as_str()).with_source(Source::Trace);
        entry.runtime = Some(ev.runtime);
        entry.thread = Some(ev.thread);
        entry.seq = Some(ev.seq);
        if !ev.detail.is_empty() {
            entry.details = Some(serde_json::json!({ "detail": ev.detail }));
        }
        entry
    }

    /// Summary record for a finished scenario.
    pub fn from_report(trace_id: impl Into<String>, report: &ScenarioReport) -> serde_json::Result<Self> {
        let (level, outcome) = if report.passed() {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        Ok(Self::new(trace_id, level, "scenario_end")
            .with_source(Source::Scenario)
            .with_scenario(&report.name, report.seed)
            .with_outcome(outcome)
            .with_duration_ms(report.duration_ms)
            .with_details(serde_json::to_value(report)?))
    }

    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn with_scenario(mut self, name: impl Into<String>, seed: u64) -> Self {
        self.scenario = Some(name.into());
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_artifacts(mut self, refs: Vec<String>) -> Self {
        self.artifact_refs = Some(refs);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// One JSONL line, no trailing newline.
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Artifact index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index_version: u32,
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            index_version: 1,
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    /// Hash `path` and add it.
    pub fn add_file(&mut self, path: &Path, kind: impl Into<String>) -> std::io::Result<&mut Self> {
        let bytes = std::fs::read(path)?;
        self.artifacts.push(ArtifactEntry {
            path: path.display().to_string(),
            kind: kind.into(),
            sha256: sha256_hex(&bytes),
            size_bytes: bytes.len() as u64,
        });
        Ok(self)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Writes JSONL records, numbering trace ids as `<run_id>::<seq>`.
pub struct LogEmitter {
    writer: Box<dyn Write>,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(Box::new(std::io::BufWriter::new(file)), run_id))
    }

    #[must_use]
    pub fn to_writer(writer: Box<dyn Write>, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    pub fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{:06}", self.run_id, self.seq)
    }

    /// Emit a bare record with a fresh trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let entry = LogEntry::new(self.next_trace_id(), level, event).with_source(Source::Harness);
        self.emit_entry(&entry)?;
        Ok(entry)
    }

    pub fn emit_entry(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")
    }

    /// Emit every event in `events`; returns how many were written.
    pub fn emit_trace(&mut self, events: &[TraceEvent]) -> std::io::Result<usize> {
        for ev in events {
            let entry = LogEntry::from_trace(self.next_trace_id(), ev);
            self.emit_entry(&entry)?;
        }
        Ok(events.len())
    }

    pub fn emit_report(&mut self, report: &ScenarioReport) -> std::io::Result<LogEntry> {
        let entry =
            LogEntry::from_report(self.next_trace_id(), report).map_err(std::io::Error::other)?;
        self.emit_entry(&entry)?;
        Ok(entry)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: field '{}': {}", self.line_number, self.field, self.message)
    }
}

fn check_enum(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
    allowed: &[&str],
    line_number: usize,
    errors: &mut Vec<LogValidationError>,
) {
    if let Some(v) = obj.get(field).and_then(|v| v.as_str())
        && !allowed.contains(&v)
    {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message: format!("invalid {field}: '{v}'"),
        });
    }
}

/// Check one JSONL line and parse it.
pub fn validate_log_line(line: &str, line_number: usize) -> Result<LogEntry, Vec<LogValidationError>> {
    let err = |field: &str, message: String| LogValidationError {
        line_number,
        field: field.to_string(),
        message,
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![err("<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![err("<root>", "expected JSON object".to_string())]);
    };

    let mut errors = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(err(field, "required field missing".to_string()));
        }
    }
    check_enum(obj, "level", &LogLevel::NAMES, line_number, &mut errors);
    check_enum(obj, "outcome", &Outcome::NAMES, line_number, &mut errors);
    check_enum(obj, "source", &Source::NAMES, line_number, &mut errors);

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.contains("::")
    {
        errors.push(err(
            "trace_id",
            format!("trace_id should follow <run_id>::<seq>, got: '{trace_id}'"),
        ));
    }

    // Trace records must say where in the ring they came from.
    if obj.get("source").and_then(|v| v.as_str()) == Some("trace") {
        for field in ["runtime", "thread", "seq"] {
            if !obj.get(field).is_some_and(serde_json::Value::is_u64) {
                errors.push(err(field, "trace records need an unsigned integer".to_string()));
            }
        }
    }

    if obj.get("source").and_then(|v| v.as_str()) == Some("scenario")
        && !obj.get("scenario").is_some_and(serde_json::Value::is_string)
    {
        errors.push(err("scenario", "scenario records must name the scenario".to_string()));
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value::<LogEntry>(value)
        .map_err(|e| vec![err("<deserialization>", format!("failed to deserialize: {e}"))])
}

/// Validate a whole JSONL file. Returns the number of non-empty lines and
/// every error found.
pub fn validate_log_file(path: &Path) -> std::io::Result<(usize, Vec<LogValidationError>)> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }
    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let since = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(since.as_secs(), since.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    // Days to civil date, proleptic Gregorian.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}
