//! Per-client message log.
//!
//! Each session opens its own append-mode handle on `<dir>/<ip>.log`.
//! Sessions from the same IP share the file, never the handle: every record
//! goes out in a single write so concurrent appends interleave by line.

use chrono::{DateTime, Local, SecondsFormat};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only log file for one client IP
#[derive(Debug)]
pub struct LogSink {
    file: File,
    path: PathBuf,
}

impl LogSink {
    /// Create `dir` if needed and open the log file for `ip` in append mode.
    pub async fn open(dir: &Path, ip: IpAddr) -> Result<Self, SinkError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| SinkError::CreateDir(dir.to_path_buf(), e))?;

        let path = log_path(dir, ip);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SinkError::Open(path.clone(), e))?;

        Ok(LogSink { file, path })
    }

    /// Append a timestamped record for `text`.
    pub async fn append(&mut self, text: &str) -> io::Result<()> {
        let record = format_record(Local::now(), text);
        self.file.write_all(record.as_bytes()).await?;
        // tokio buffers file writes; flush so the record lands before the next read
        self.file.flush().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// File name for a client's log, keyed by IP only.
pub fn log_path(dir: &Path, ip: IpAddr) -> PathBuf {
    dir.join(format!("{ip}.log"))
}

/// Render `[<RFC3339>] <text>\n`.
pub fn format_record(at: DateTime<Local>, text: &str) -> String {
    format!(
        "[{}] {}\n",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        text
    )
}

/// Errors setting up a client's log sink
#[derive(Debug)]
pub enum SinkError {
    CreateDir(PathBuf, io::Error),
    Open(PathBuf, io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::CreateDir(path, e) => {
                write!(f, "Could not create log directory '{}': {}", path.display(), e)
            }
            SinkError::Open(path, e) => {
                write!(f, "Could not open log file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::CreateDir(_, e) | SinkError::Open(_, e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_log_path_uses_ip_only() {
        let dir = Path::new("logs");
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(log_path(dir, ip), PathBuf::from("logs/192.168.1.7.log"));

        let ip = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(log_path(dir, ip), PathBuf::from("logs/::1.log"));
    }

    #[test]
    fn test_format_record() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 8, 7, 6).unwrap();
        let record = format_record(at, "hi there");
        let expected = format!("[{}] hi there\n", at.to_rfc3339_opts(SecondsFormat::Secs, true));
        assert_eq!(record, expected);
        assert!(record.starts_with("[2024-03-09T08:07:06"));
        assert!(record.ends_with("] hi there\n"));
    }

    #[tokio::test]
    async fn test_open_creates_directory_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let mut sink = LogSink::open(&dir, ip).await.unwrap();
        sink.append("first").await.unwrap();
        drop(sink);

        // A second session from the same IP appends to the same file
        let mut sink = LogSink::open(&dir, ip).await.unwrap();
        sink.append("second").await.unwrap();
        assert_eq!(sink.path(), dir.join("127.0.0.1.log"));

        let contents = std::fs::read_to_string(dir.join("127.0.0.1.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[tokio::test]
    async fn test_concurrent_handles_interleave_by_line() {
        let tmp = tempfile::tempdir().unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        let mut a = LogSink::open(tmp.path(), ip).await.unwrap();
        let mut b = LogSink::open(tmp.path(), ip).await.unwrap();
        for i in 0..10 {
            a.append(&format!("a{i}")).await.unwrap();
            b.append(&format!("b{i}")).await.unwrap();
        }

        let contents = std::fs::read_to_string(log_path(tmp.path(), ip)).unwrap();
        assert_eq!(contents.lines().count(), 20);
        assert!(contents.lines().all(|line| line.starts_with('[')));
    }

    #[tokio::test]
    async fn test_open_fails_when_dir_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("logs");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = LogSink::open(&blocker, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::CreateDir(..)));
    }
}
