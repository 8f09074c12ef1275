use crate::config::LogPaths;
use crate::error::{CorralError, Result};
use chrono::Local;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// Minimum gap between two dropped-log warnings for the same sink
const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(30);

/// Timestamp format used when the configured one cannot be rendered
const FALLBACK_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Stdout,
    Stderr,
}

/// Destination for one app's stdout/stderr.
///
/// Every line is prefixed with `[<timestamp>] `. With `merge` set both
/// streams go to the out file in arrival order. Write failures never reach
/// the caller: the line is dropped and counted, and the file is reopened on
/// the next write.
pub struct LogSink {
    out_path: PathBuf,
    err_path: PathBuf,
    merge: bool,
    date_format: String,
    out_file: Option<TokioFile>,
    err_file: Option<TokioFile>,
    dropped: u64,
    last_warning: Option<Instant>,
}

impl LogSink {
    /// Create a sink without touching the filesystem
    pub fn new(paths: &LogPaths, merge: bool, date_format: impl Into<String>) -> Self {
        Self {
            out_path: paths.out.clone(),
            err_path: paths.err.clone(),
            merge,
            date_format: date_format.into(),
            out_file: None,
            err_file: None,
            dropped: 0,
            last_warning: None,
        }
    }

    /// Create a sink and open its files. An open failure leaves the sink in
    /// dropped-log state rather than failing.
    pub async fn open(paths: &LogPaths, merge: bool, date_format: impl Into<String>) -> Self {
        let mut sink = Self::new(paths, merge, date_format);
        sink.reopen().await;
        sink
    }

    /// (Re)open the destination files, creating parent directories
    pub async fn reopen(&mut self) {
        self.out_file = None;
        self.err_file = None;

        if let Err(e) = self.ensure_open(StreamId::Stdout).await {
            self.warn_degraded(&e);
        }
        if !self.merge {
            if let Err(e) = self.ensure_open(StreamId::Stderr).await {
                self.warn_degraded(&e);
            }
        }
    }

    /// Append one line from `stream`. Embedded newlines split into several
    /// prefixed lines; a trailing newline is optional.
    pub async fn write(&mut self, stream: StreamId, data: &[u8]) {
        let data = data.strip_suffix(b"\n").unwrap_or(data);
        let data = data.strip_suffix(b"\r").unwrap_or(data);

        let entry = self.format_entry(data);
        if let Err(e) = self.try_write(stream, &entry).await {
            self.dropped += 1;
            self.warn_degraded(&e);
        }
    }

    /// Append a supervisor event line to the out log
    pub async fn write_event(&mut self, message: &str) {
        self.write(StreamId::Stdout, format!("[corral] {}", message).as_bytes())
            .await;
    }

    /// Flush and release the files
    pub async fn close(&mut self) {
        for file in [self.out_file.take(), self.err_file.take()].into_iter().flatten() {
            let mut file = file;
            let _ = file.flush().await;
        }
    }

    /// Lines lost to write failures since the sink was created
    pub fn dropped_lines(&self) -> u64 {
        self.dropped
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn err_path(&self) -> &Path {
        if self.merge {
            &self.out_path
        } else {
            &self.err_path
        }
    }

    async fn try_write(&mut self, stream: StreamId, entry: &[u8]) -> Result<()> {
        let target = self.target(stream);
        self.ensure_open(target).await?;

        let path = self.path_for(target).to_path_buf();
        let file = match target {
            StreamId::Stdout => self.out_file.as_mut(),
            StreamId::Stderr => self.err_file.as_mut(),
        }
        .ok_or_else(|| CorralError::LogWrite(format!("{} is not open", path.display())))?;

        let result = async {
            file.write_all(entry).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            // Force a reopen on the next write
            match target {
                StreamId::Stdout => self.out_file = None,
                StreamId::Stderr => self.err_file = None,
            }
            return Err(CorralError::LogWrite(format!(
                "Failed to write to {}: {}",
                path.display(),
                e
            )));
        }

        Ok(())
    }

    async fn ensure_open(&mut self, target: StreamId) -> Result<()> {
        let slot_open = match target {
            StreamId::Stdout => self.out_file.is_some(),
            StreamId::Stderr => self.err_file.is_some(),
        };
        if slot_open {
            return Ok(());
        }

        let file = open_append(self.path_for(target)).await?;
        match target {
            StreamId::Stdout => self.out_file = Some(file),
            StreamId::Stderr => self.err_file = Some(file),
        }
        Ok(())
    }

    fn target(&self, stream: StreamId) -> StreamId {
        if self.merge {
            StreamId::Stdout
        } else {
            stream
        }
    }

    fn path_for(&self, target: StreamId) -> &Path {
        match target {
            StreamId::Stdout => &self.out_path,
            StreamId::Stderr => &self.err_path,
        }
    }

    /// Format: `[<timestamp>] <line>\n`, once per embedded line
    fn format_entry(&self, data: &[u8]) -> Vec<u8> {
        let timestamp = self.timestamp();
        let mut entry = Vec::with_capacity(timestamp.len() + 4 + data.len());

        for line in data.split(|b| *b == b'\n') {
            entry.push(b'[');
            entry.extend_from_slice(timestamp.as_bytes());
            entry.extend_from_slice(b"] ");
            entry.extend_from_slice(line);
            entry.push(b'\n');
        }

        entry
    }

    fn timestamp(&self) -> String {
        let now = Local::now();
        let mut rendered = String::new();
        if write!(rendered, "{}", now.format(&self.date_format)).is_err() {
            rendered.clear();
            let _ = write!(rendered, "{}", now.format(FALLBACK_DATE_FORMAT));
        }
        rendered
    }

    fn warn_degraded(&mut self, error: &CorralError) {
        let due = self
            .last_warning
            .map_or(true, |at| at.elapsed() >= DROP_WARNING_INTERVAL);
        if due {
            tracing::warn!(
                "Log output degraded ({} line(s) dropped so far): {}",
                self.dropped,
                error
            );
            self.last_warning = Some(Instant::now());
        }
    }
}

async fn open_append(path: &Path) -> Result<TokioFile> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            CorralError::LogFileError(format!(
                "Failed to create log directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CorralError::LogFileError(format!("{}: {}", path.display(), e)))?;

    Ok(TokioFile::from_std(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &Path) -> LogPaths {
        LogPaths {
            out: dir.join("app-out.log"),
            err: dir.join("app-error.log"),
        }
    }

    #[tokio::test]
    async fn test_split_streams() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(&paths(temp_dir.path()), false, "%H:%M:%S").await;

        sink.write(StreamId::Stdout, b"hello stdout\n").await;
        sink.write(StreamId::Stderr, b"hello stderr").await;
        sink.close().await;

        let out = std::fs::read_to_string(temp_dir.path().join("app-out.log")).unwrap();
        let err = std::fs::read_to_string(temp_dir.path().join("app-error.log")).unwrap();
        assert!(out.contains("] hello stdout\n"));
        assert!(!out.contains("hello stderr"));
        assert!(err.starts_with('['));
        assert!(err.contains("] hello stderr\n"));
        assert_eq!(sink.dropped_lines(), 0);
    }

    #[tokio::test]
    async fn test_merged_preserves_arrival_order() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(&paths(temp_dir.path()), true, "%Y-%m-%d").await;

        sink.write(StreamId::Stdout, b"A").await;
        sink.write(StreamId::Stderr, b"B").await;
        sink.write(StreamId::Stdout, b"C").await;
        sink.close().await;

        let out = std::fs::read_to_string(temp_dir.path().join("app-out.log")).unwrap();
        let lines: Vec<&str> = out
            .lines()
            .map(|l| l.split_once("] ").unwrap().1)
            .collect();
        assert_eq!(lines, vec!["A", "B", "C"]);
        assert!(!temp_dir.path().join("app-error.log").exists());
    }

    #[tokio::test]
    async fn test_multiline_write_prefixes_each_line() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(&paths(temp_dir.path()), false, "%H:%M").await;

        sink.write(StreamId::Stdout, b"one\ntwo").await;
        sink.write_event("started").await;
        sink.close().await;

        let out = std::fs::read_to_string(temp_dir.path().join("app-out.log")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.starts_with('[')));
        assert!(lines[2].ends_with("] [corral] started"));
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let mut sink = LogSink::open(&paths(&nested), false, "%H:%M").await;

        sink.write(StreamId::Stderr, b"deep").await;
        assert!(nested.join("app-error.log").exists());
    }

    #[tokio::test]
    async fn test_write_failure_degrades_then_recovers() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("logs");
        // A regular file where the log directory should be
        std::fs::write(&blocker, b"").unwrap();

        let mut sink = LogSink::open(&paths(&blocker), false, "%H:%M").await;
        sink.write(StreamId::Stdout, b"lost 1").await;
        sink.write(StreamId::Stdout, b"lost 2").await;
        assert_eq!(sink.dropped_lines(), 2);

        std::fs::remove_file(&blocker).unwrap();
        sink.write(StreamId::Stdout, b"kept").await;
        assert_eq!(sink.dropped_lines(), 2);

        let out = std::fs::read_to_string(blocker.join("app-out.log")).unwrap();
        assert!(out.contains("kept"));
        assert!(!out.contains("lost"));
    }

    #[tokio::test]
    async fn test_appends_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = LogSink::open(&paths(temp_dir.path()), false, "%H:%M").await;

        sink.write(StreamId::Stdout, b"first run").await;
        sink.close().await;
        sink.reopen().await;
        sink.write(StreamId::Stdout, b"second run").await;
        sink.close().await;

        let out = std::fs::read_to_string(temp_dir.path().join("app-out.log")).unwrap();
        assert_eq!(out.lines().count(), 2);
    }
}
