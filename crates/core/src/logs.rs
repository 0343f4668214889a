use crate::ring::RingBuffer;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

pub const LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: i64,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
}

/// In-memory log ring with an optional debug-file mirror.
///
/// The control API can toggle the mirror at runtime; entries are appended
/// to a timestamped file under the proxy logs directory while enabled.
pub struct LogStore {
    ring: RingBuffer<LogEntry>,
    logs_dir: PathBuf,
    debug_file: Mutex<Option<File>>,
}

impl LogStore {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            ring: RingBuffer::new(LOG_CAPACITY),
            logs_dir,
            debug_file: Mutex::new(None),
        }
    }

    pub fn log(&self, level: LogLevel, component: &str, message: impl Into<String>) {
        let entry = LogEntry {
            ts: chrono::Utc::now().timestamp_millis(),
            level,
            component: component.to_string(),
            message: message.into(),
        };
        if let Ok(mut guard) = self.debug_file.lock()
            && let Some(file) = guard.as_mut()
        {
            let _ = writeln!(
                file,
                "{} [{}] {}: {}",
                entry.ts,
                entry.level.as_str(),
                entry.component,
                entry.message
            );
        }
        self.ring.push(entry);
    }

    pub fn info(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, component, message);
    }

    pub fn warn(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, component, message);
    }

    pub fn error(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, component, message);
    }

    pub fn debug(&self, component: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, component, message);
    }

    /// Enable or disable the debug-file mirror. Returns the active file
    /// path when enabling succeeds.
    pub fn set_debug_file(&self, enabled: bool) -> std::io::Result<Option<PathBuf>> {
        let mut guard = self.debug_file.lock().expect("debug file lock");
        if !enabled {
            *guard = None;
            return Ok(None);
        }
        if guard.is_some() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.logs_dir)?;
        let name = format!("debug-{}.log", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        let path = self.logs_dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        *guard = Some(file);
        Ok(Some(path))
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_file.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn query(&self, limit: usize, offset: usize, filter: Option<&str>, since: Option<i64>) -> Vec<LogEntry> {
        match (filter, since) {
            (None, None) => self.ring.recent(limit, offset),
            _ => self.ring.recent_filtered(limit, |e| {
                if let Some(f) = filter
                    && !e.message.contains(f)
                    && !e.component.contains(f)
                {
                    return false;
                }
                if let Some(s) = since
                    && e.ts < s
                {
                    return false;
                }
                true
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&self) {
        self.ring.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path().to_path_buf());
        store.info("dispatcher", "tunnel opened to claude.ai");
        store.warn("oauth", "refresh failed");
        store.info("dispatcher", "tunnel closed");

        let all = store.query(10, 0, None, None);
        assert_eq!(all.len(), 3);

        let oauth = store.query(10, 0, Some("oauth"), None);
        assert_eq!(oauth.len(), 1);
        assert_eq!(oauth[0].level, LogLevel::Warn);
    }

    #[test]
    fn test_debug_file_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path().join("logs"));
        let path = store.set_debug_file(true).unwrap().unwrap();
        store.info("test", "hello");
        store.set_debug_file(false).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("hello"));
    }
}
