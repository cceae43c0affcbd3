//! Event-log entries, the tail abstraction, and the human-readable
//! formatter (spec §4.8, §4.8.1).
//!
//! There is no broker in this crate, so `flux_job_event_watch` is realized
//! as polling reads over an append-only NDJSON file under the state root
//! (`job.<dotted>/eventlog`, `.../exec-eventlog`, `.../output-eventlog`).
//! A sibling `<key>.closed` marker file stands in for the RPC stream's
//! terminal `ENODATA`, so callers can tell "no more data right now" apart
//! from "this log is done forever."

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FluxError, FluxResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub timestamp: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl Entry {
    pub fn new(timestamp: f64, name: impl Into<String>, context: Option<Value>) -> Self {
        Entry {
            timestamp,
            name: name.into(),
            context,
        }
    }

    pub fn decode(line: &str) -> FluxResult<Self> {
        serde_json::from_str(line).map_err(|e| FluxError::invalid(format!("eventlog entry decode: {e}")))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("entry always serializes")
    }
}

/// Append-only writer. `close()` drops a terminal marker so tailers observe
/// `ENODATA` instead of blocking forever.
pub struct Appender {
    path: PathBuf,
}

impl Appender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Appender { path: path.into() }
    }

    pub fn append(&self, entry: &Entry) -> FluxResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", entry.encode())?;
        Ok(())
    }

    pub fn close(&self) -> FluxResult<()> {
        std::fs::write(self.closed_marker(), b"")?;
        Ok(())
    }

    fn closed_marker(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_owned();
        s.push(".closed");
        PathBuf::from(s)
    }
}

/// A polling cursor over one eventlog file.
pub struct Tail {
    path: PathBuf,
    offset: u64,
}

impl Tail {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Tail {
            path: path.into(),
            offset: 0,
        }
    }

    fn closed_marker(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_owned();
        s.push(".closed");
        PathBuf::from(s)
    }

    /// Read any complete lines appended since the last call. Returns
    /// `(entries, done)`: `done` is true once the close marker is observed
    /// *and* every already-written line has been consumed — the ENODATA
    /// equivalent.
    pub fn poll(&mut self) -> FluxResult<(Vec<Entry>, bool)> {
        let mut entries = Vec::new();
        if let Ok(file) = std::fs::File::open(&self.path) {
            use std::io::Seek;
            let mut file = file;
            file.seek(std::io::SeekFrom::Start(self.offset))?;
            let mut reader = std::io::BufReader::new(file);
            let mut consumed: u64 = 0;
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line)?;
                if n == 0 {
                    break;
                }
                if !line.ends_with('\n') {
                    // partial write in progress; stop here, retry next poll.
                    break;
                }
                consumed += n as u64;
                entries.push(Entry::decode(line.trim_end())?);
            }
            self.offset += consumed;
        }
        let done = self.closed_marker().exists() && self.at_eof()?;
        Ok((entries, done))
    }

    fn at_eof(&self) -> FluxResult<bool> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() <= self.offset),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

/// `<elapsed>s: <name> <k=v ...>` (libeventlog/formatter.c contract).
pub fn format_entry(entry: &Entry, t0: f64) -> String {
    let elapsed = entry.timestamp - t0;
    let mut line = format!("{elapsed:.6}s: {}", entry.name);
    if let Some(Value::Object(ctx)) = &entry.context {
        let mut keys: Vec<&String> = ctx.keys().collect();
        keys.sort();
        for k in keys {
            let v = &ctx[k];
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            line.push(' ');
            line.push_str(&format!("{k}={rendered}"));
        }
    }
    line
}

pub fn eventlog_path(root: &Path, dotted: &str, name: &str) -> PathBuf {
    root.join("job").join(dotted.replace('.', "/")).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_tail_observes_entries_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eventlog");
        let appender = Appender::new(&path);
        appender.append(&Entry::new(1.0, "submit", None)).unwrap();
        appender
            .append(&Entry::new(1.5, "validate", None))
            .unwrap();

        let mut tail = Tail::open(&path);
        let (entries, done) = tail.poll().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "submit");
        assert!(!done);
    }

    #[test]
    fn close_marks_tail_done_once_drained() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eventlog");
        let appender = Appender::new(&path);
        appender.append(&Entry::new(1.0, "submit", None)).unwrap();
        appender.close().unwrap();

        let mut tail = Tail::open(&path);
        let (entries, done) = tail.poll().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(done);
    }

    #[test]
    fn formatter_renders_elapsed_and_context() {
        let entry = Entry::new(
            10.5,
            "exception",
            Some(serde_json::json!({"type": "cancel", "severity": 0, "note": "user"})),
        );
        let line = format_entry(&entry, 10.0);
        assert!(line.starts_with("0.500000s: exception"));
        assert!(line.contains("note=user"));
        assert!(line.contains("severity=0"));
        assert!(line.contains("type=cancel"));
    }
}
