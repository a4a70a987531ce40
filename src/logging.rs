//! Logging Setup
//!
//! Installs a `tracing` subscriber with two sinks:
//!
//! - `<logs_dir>/<service>.log`: one JSON record per line
//! - stdout: human-readable `time | LEVEL | service | message | fields | correlation id`
//!
//! Every record carries the service name and, when one is set for the
//! emitting task or thread, the current correlation id.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{info, Event, Level, Subscriber};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt as sub_fmt, EnvFilter};

use crate::correlation;
use crate::error::{Error, Result};

/// Environment variable selecting the log directory
pub const LOGS_DIR_ENV: &str = "LOGS_DIR";

/// Environment variable selecting the minimum level
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Files and directories marking a project root
const PROJECT_ROOT_MARKERS: &[&str] = &["Cargo.toml", ".git", "logs"];

/// Size at which the log file is rotated
pub const DEFAULT_ROTATION_SIZE: u64 = 500 * 1024 * 1024;

/// How many parent directories are searched for a project root
const PROJECT_ROOT_SEARCH_DEPTH: usize = 10;

// =============================================================================
// Configuration
// =============================================================================

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Service name stamped on every record
    pub service_name: String,

    /// Directory for the JSON log file (defaults to `<project root>/logs`)
    pub logs_dir: Option<PathBuf>,

    /// Minimum level, case-insensitive (defaults to info)
    pub log_level: Option<String>,

    /// Also log to stdout
    pub console: bool,

    /// Rotate the log file past this many bytes (defaults to 500 MB)
    pub rotation_size: Option<u64>,
}

impl LoggingConfig {
    /// Configuration with defaults for `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            logs_dir: None,
            log_level: None,
            console: true,
            rotation_size: None,
        }
    }

    /// Configuration reading `LOGS_DIR` and `LOG_LEVEL`
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self {
            logs_dir: std::env::var_os(LOGS_DIR_ENV).map(PathBuf::from),
            log_level: std::env::var(LOG_LEVEL_ENV).ok(),
            ..Self::new(service_name)
        }
    }

    /// Resolved minimum level
    pub fn level(&self) -> Level {
        parse_level(self.log_level.as_deref().unwrap_or("info"))
    }

    /// Resolved log directory
    pub fn resolved_logs_dir(&self) -> PathBuf {
        self.logs_dir.clone().unwrap_or_else(default_logs_dir)
    }
}

/// Parse a level name case-insensitively. Unknown names map to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" | "critical" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// `<project root>/logs`, falling back to the working directory as root.
pub fn default_logs_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_project_root(&cwd).join("logs")
}

/// Walk up from `start` looking for a project marker.
pub fn find_project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .take(PROJECT_ROOT_SEARCH_DEPTH + 1)
        .find(|dir| PROJECT_ROOT_MARKERS.iter().any(|m| dir.join(m).exists()))
        .unwrap_or(start)
        .to_path_buf()
}

// =============================================================================
// Initialization
// =============================================================================

/// Install the global subscriber and return the log file path.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<PathBuf> {
    let logs_dir = config.resolved_logs_dir();
    fs::create_dir_all(&logs_dir)?;

    let log_file = logs_dir.join(format!("{}.log", config.service_name));
    let file = RotatingFile::open(
        &log_file,
        config.rotation_size.unwrap_or(DEFAULT_ROTATION_SIZE),
    )?;

    let level = config.level();
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(
            "hyper=warn"
                .parse::<Directive>()
                .map_err(|e| Error::Config(format!("invalid log directive: {}", e)))?,
        );

    let file_layer = sub_fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .event_format(ServiceFormat::json(&config.service_name));

    let console_layer = config
        .console
        .then(|| sub_fmt::layer().event_format(ServiceFormat::console(&config.service_name)));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("logger already initialized: {}", e)))?;

    info!(
        service = %config.service_name,
        level = %level,
        logs_dir = %logs_dir.display(),
        "Logger configured"
    );

    Ok(log_file)
}

// =============================================================================
// Rotating File
// =============================================================================

/// Append-only log file that is rotated once it would grow past `max_bytes`.
///
/// A full file is renamed to `<stem>.<UTC timestamp>.log` beside the active
/// one and a fresh file is opened in its place. Rotated files are kept.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    written: u64,
}

impl RotatingFile {
    /// Open (or continue) the file at `path`.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            state: Mutex::new(FileState { file, written }),
        })
    }

    /// Path of the active file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotate(&self, state: &mut FileState) -> io::Result<()> {
        state.file.flush()?;
        fs::rename(&self.path, self.archive_path())?;
        state.file = open_append(&self.path)?;
        state.written = 0;
        Ok(())
    }

    fn archive_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("service");
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S_%6f");

        let mut candidate = self.path.with_file_name(format!("{}.{}.log", stem, stamp));
        let mut n = 1;
        while candidate.exists() {
            candidate = self
                .path
                .with_file_name(format!("{}.{}.{}.log", stem, stamp, n));
            n += 1;
        }
        candidate
    }
}

impl Write for &RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.written > 0 && state.written + buf.len() as u64 > self.max_bytes {
            self.rotate(&mut state)?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

// =============================================================================
// Event Format
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Console,
    Json,
}

/// Event formatter stamping the service name and correlation id.
#[derive(Debug, Clone)]
pub struct ServiceFormat {
    service: Arc<str>,
    style: Style,
}

impl ServiceFormat {
    /// Human-readable single-line records
    pub fn console(service: &str) -> Self {
        Self {
            service: Arc::from(service),
            style: Style::Console,
        }
    }

    /// One JSON object per line
    pub fn json(service: &str) -> Self {
        Self {
            service: Arc::from(service),
            style: Style::Json,
        }
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    level: String,
    service: &'a str,
    target: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span: Option<&'a str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    fields: Map<String, Value>,
}

impl<S, N> FormatEvent<S, N> for ServiceFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        let correlation_id = correlation::get();
        let now = Utc::now();

        match self.style {
            Style::Console => {
                write!(
                    writer,
                    "{} | {:<5} | {} | {}",
                    now.format("%Y-%m-%d %H:%M:%S"),
                    metadata.level().to_string(),
                    self.service,
                    collector.message.unwrap_or_default()
                )?;
                if !collector.fields.is_empty() {
                    write!(writer, " | {}", Value::Object(collector.fields))?;
                }
                if let Some(id) = correlation_id {
                    write!(writer, " | {}", id)?;
                }
                writeln!(writer)
            }
            Style::Json => {
                let span = ctx.lookup_current();
                let record = LogRecord {
                    timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, true),
                    level: metadata.level().to_string(),
                    service: &self.service,
                    target: metadata.target(),
                    message: collector.message.unwrap_or_default(),
                    correlation_id,
                    span: span.as_ref().map(|s| s.name()),
                    fields: collector.fields,
                };
                let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
                writeln!(writer, "{}", line)
            }
        }
    }
}

/// Collects event fields into JSON values, splitting out `message`.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, serde_json::json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{:?}", value)));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(format: ServiceFormat, emit: impl FnOnce()) -> String {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::registry().with(
            sub_fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .event_format(format),
        );
        tracing::subscriber::with_default(subscriber, emit);
        buffer.contents()
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("Warning"), Level::WARN);
        assert_eq!(parse_level("critical"), Level::ERROR);
        assert_eq!(parse_level(" trace "), Level::TRACE);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_config_defaults() {
        let config = LoggingConfig::new("svc");
        assert_eq!(config.level(), Level::INFO);
        assert!(config.console);
        assert!(config.resolved_logs_dir().ends_with("logs"));
    }

    #[test]
    fn test_find_project_root() {
        let root = std::env::temp_dir().join(format!("svc-obs-root-{}", std::process::id()));
        let nested = root.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.join("Cargo.toml"), "").unwrap();

        assert_eq!(find_project_root(&nested), root);
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_json_record_shape() {
        correlation::set(Some("req_0123456789ab".to_string()));
        let output = capture(ServiceFormat::json("orders"), || {
            tracing::info!(batch = 3, ok = true, "processed batch");
        });
        correlation::clear();

        let record: Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["service"], "orders");
        assert_eq!(record["message"], "processed batch");
        assert_eq!(record["correlation_id"], "req_0123456789ab");
        assert_eq!(record["fields"]["batch"], 3);
        assert_eq!(record["fields"]["ok"], true);
        assert!(record["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_json_without_correlation_id() {
        let output = capture(ServiceFormat::json("orders"), || {
            tracing::warn!("no request");
        });

        let record: Value = serde_json::from_str(output.trim()).unwrap();
        assert!(record.get("correlation_id").is_none());
        assert!(record.get("fields").is_none());
    }

    #[test]
    fn test_json_includes_current_span() {
        let output = capture(ServiceFormat::json("orders"), || {
            let span = tracing::info_span!("instrumented");
            let _entered = span.enter();
            tracing::info!("inside");
        });

        let record: Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(record["span"], "instrumented");
    }

    #[test]
    fn test_console_line() {
        correlation::set(Some("req_feedfacecafe".to_string()));
        let output = capture(ServiceFormat::console("billing"), || {
            tracing::error!(code = 7, "charge failed");
        });
        correlation::clear();

        assert!(output.contains(" | ERROR | billing | charge failed"));
        assert!(output.contains("\"code\":7"));
        assert!(output.trim_end().ends_with("| req_feedfacecafe"));
        assert_eq!(output.lines().count(), 1);
    }

    #[test]
    fn test_rotating_file_rolls_over_at_size() {
        let dir = std::env::temp_dir().join(format!("svc-obs-rotate-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("orders.log");

        let sink = RotatingFile::open(&path, 64).unwrap();
        let line = [b'x'; 39];
        for _ in 0..5 {
            (&sink).write_all(&line).unwrap();
            (&sink).write_all(b"\n").unwrap();
        }
        (&sink).flush().unwrap();

        let mut archived: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| p != &path)
            .collect();
        archived.sort();

        assert_eq!(archived.len(), 4);
        assert!(archived.iter().all(|p| {
            let name = p.file_name().unwrap().to_str().unwrap();
            name.starts_with("orders.") && name.ends_with(".log")
        }));
        assert!(fs::metadata(&path).unwrap().len() <= 64);
        assert_eq!(fs::read(&archived[0]).unwrap().len(), 40);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rotating_file_resumes_existing_size() {
        let dir = std::env::temp_dir().join(format!("svc-obs-resume-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("billing.log");
        fs::write(&path, [b'y'; 60]).unwrap();

        let sink = RotatingFile::open(&path, 64).unwrap();
        (&sink).write_all(b"0123456789\n").unwrap();
        (&sink).flush().unwrap();

        assert_eq!(fs::read(sink.path()).unwrap(), b"0123456789\n");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

        fs::remove_dir_all(&dir).unwrap();
    }
}
