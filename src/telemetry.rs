//! Newline-delimited JSON telemetry with size-based rotation.
//!
//! One event is written per analysis.  Writing is best-effort: a failed
//! write is counted and logged, never surfaced to the request path.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Simple size-based rotating writer (numbered backups, newest backup
/// optionally gzipped).
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.rotate_if_needed();
        writeln!(self.file, "{}", line)
    }

    fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn rotate_if_needed(&mut self) {
        let Some(limit) = self.max_bytes else { return };
        if self.current_size().map(|size| size >= limit).unwrap_or(false) {
            self.shift_backups();
            self.compress_newest_backup();
            self.reopen_truncated();
        }
    }

    fn shift_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let old = if idx == 1 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("{}", idx - 1))
            };
            if old.exists() {
                let new = self.path.with_extension(format!("{}", idx));
                let _ = fs::rename(&old, &new);
            }
        }
    }

    fn compress_newest_backup(&self) {
        if !self.compress || self.keep == 0 {
            return;
        }
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(rotated.with_extension("1.gz"), buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }

    fn reopen_truncated(&mut self) {
        if let Ok(file) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = file;
        }
    }
}

/// Per-analysis event fields, borrowed from the request path.
pub struct AnalysisEvent<'a> {
    pub identity: &'a str,
    pub endpoint: &'a str,
    pub code_count: usize,
    pub fallback_used: bool,
    pub has_critical: bool,
    pub latency_ms: u128,
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<Arc<Mutex<RotatingWriter>>>, log_stdout: bool) -> Self {
        TelemetrySink {
            writer,
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
            file_size_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        TelemetrySink::new(None, false)
    }

    pub fn emit(&self, event: &AnalysisEvent<'_>) {
        let payload = serde_json::json!({
            "schemaVersion": 1,
            "ts": chrono::Utc::now().to_rfc3339(),
            "identity": event.identity,
            "endpoint": event.endpoint,
            "codeCount": event.code_count,
            "fallbackUsed": event.fallback_used,
            "hasCritical": event.has_critical,
            "latencyMs": event.latency_ms,
        });
        if let Some(writer) = &self.writer {
            if let Ok(mut guard) = writer.lock() {
                match guard.write_line(&payload.to_string()) {
                    Ok(_) => {
                        self.lines_total.fetch_add(1, Ordering::Relaxed);
                        if let Some(size) = guard.current_size() {
                            self.file_size_bytes.store(size, Ordering::Relaxed);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to write telemetry line");
                        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if self.log_stdout {
            tracing::info!(
                target = "telemetry",
                identity = event.identity,
                endpoint = event.endpoint,
                codeCount = event.code_count,
                fallbackUsed = event.fallback_used,
                hasCritical = event.has_critical,
                latencyMs = event.latency_ms as u64,
            );
        }
    }

    pub fn lines_total(&self) -> &Arc<AtomicU64> {
        &self.lines_total
    }

    pub fn write_errors_total(&self) -> &Arc<AtomicU64> {
        &self.write_errors_total
    }

    pub fn file_size_bytes(&self) -> &Arc<AtomicU64> {
        &self.file_size_bytes
    }
}
