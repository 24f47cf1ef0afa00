//! Bounded capture of daemon and helper output.
//!
//! Lines live in memory (newest `max_lines`) and are mirrored to an append-only
//! file that is compacted back to the retained lines once it grows past twice
//! the cap. Readers only ever receive copies, so viewing or scanning the log
//! never holds up output capture for longer than a push.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Local;
use log::{debug, error, info};

use crate::config::write_atomically;

const TIMESTAMP_FORMAT: &str = "%b %d %H:%M:%S%.3f";
const SEPARATOR_WIDTH: usize = 60;

/// Position in the stream of appended lines; survives clears and compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogCursor(u64);

struct SinkState {
    file: File,
    lines: VecDeque<String>,
    /// Sequence number the next appended line receives.
    next_seq: u64,
    lines_on_disk: usize,
}

pub struct LogSink {
    path: PathBuf,
    max_lines: usize,
    state: Mutex<SinkState>,
}

impl LogSink {
    /// Open (or create) the log file, keeping its newest lines, and write a
    /// session header.
    pub fn open(path: impl Into<PathBuf>, max_lines: usize) -> io::Result<Self> {
        let path = path.into();
        let max_lines = max_lines.max(1);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut lines = VecDeque::with_capacity(max_lines.min(1024));
        let mut lines_on_disk = 0;
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf)? == 0 {
                    break;
                }
                let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
                lines.push_back(String::from_utf8_lossy(raw).into_owned());
                lines_on_disk += 1;
                if lines.len() > max_lines {
                    lines.pop_front();
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let sink = Self {
            path,
            max_lines,
            state: Mutex::new(SinkState {
                file,
                next_seq: lines.len() as u64,
                lines,
                lines_on_disk,
            }),
        };

        let rule = "=".repeat(SEPARATOR_WIDTH);
        {
            let mut state = sink.lock();
            sink.push_raw(&mut state, String::new());
            sink.push_raw(&mut state, rule.clone());
            sink.push_raw(
                &mut state,
                format!(
                    "TorTray Session Started: {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                ),
            );
            sink.push_raw(&mut state, rule);
        }
        info!("Capturing process output in {:?}", sink.path);
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line; the oldest line is discarded once the cap
    /// is reached. Disk failures are logged, never propagated to the reader
    /// thread that captured the line.
    pub fn append(&self, line: &str) {
        let stamped = format!("{} {}", Local::now().format(TIMESTAMP_FORMAT), line);
        let mut state = self.lock();
        self.push_raw(&mut state, stamped);
    }

    /// Append a line captured from a named process, e.g. `[obfs4] ...`.
    pub fn append_from(&self, origin: &str, line: &str) {
        self.append(&format!("[{origin}] {line}"));
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn read(&self) -> Vec<String> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Cursor pointing just past the newest line.
    pub fn cursor(&self) -> LogCursor {
        LogCursor(self.lock().next_seq)
    }

    /// Lines appended since `cursor` that are still retained, plus the cursor
    /// to pass next time.
    pub fn read_since(&self, cursor: LogCursor) -> (Vec<String>, LogCursor) {
        let state = self.lock();
        let first_seq = state.next_seq - state.lines.len() as u64;
        let start = cursor.0.max(first_seq);
        let skip = (start - first_seq) as usize;
        let lines = state.lines.iter().skip(skip).cloned().collect();
        (lines, LogCursor(state.next_seq))
    }

    /// Drop the retained content. Appends racing with the clear land after it.
    pub fn clear(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.lines.clear();
        state.file.set_len(0)?;
        state.lines_on_disk = 0;
        let marker = format!(
            "Logs cleared: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.push_raw(&mut state, marker);
        info!("Cleared log {:?}", self.path);
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.file.flush()?;
        state.file.sync_all()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_raw(&self, state: &mut SinkState, line: String) {
        if let Err(e) = writeln!(state.file, "{line}") {
            error!("Failed to write to log {:?}: {}", self.path, e);
        } else {
            state.lines_on_disk += 1;
        }
        state.lines.push_back(line);
        state.next_seq += 1;
        while state.lines.len() > self.max_lines {
            state.lines.pop_front();
        }
        if state.lines_on_disk > self.max_lines * 2 {
            self.compact(state);
        }
    }

    fn compact(&self, state: &mut SinkState) {
        let mut content = state.lines.iter().fold(String::new(), |mut acc, line| {
            acc.push_str(line);
            acc.push('\n');
            acc
        });
        if content.is_empty() {
            content.push('\n');
        }
        let reopened = write_atomically(&self.path, content.as_bytes())
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|()| OpenOptions::new().append(true).open(&self.path));
        match reopened {
            Ok(file) => {
                state.file = file;
                state.lines_on_disk = state.lines.len();
                debug!("Compacted log {:?} to {} lines", self.path, state.lines.len());
            }
            Err(e) => error!("Failed to compact log {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn sink_in(dir: &tempfile::TempDir, max_lines: usize) -> LogSink {
        LogSink::open(dir.path().join("logs").join("tor.log"), max_lines).expect("open sink")
    }

    #[test]
    fn open_writes_session_header() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sink = sink_in(&dir, 100);
        let lines = sink.read();
        assert!(lines.iter().any(|l| l.starts_with("TorTray Session Started: ")));
        let on_disk = fs::read_to_string(sink.path()).expect("read file");
        assert!(on_disk.contains("TorTray Session Started: "));
    }

    #[test]
    fn append_keeps_only_the_newest_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sink = sink_in(&dir, 10);
        for i in 0..25 {
            sink.append(&format!("line {i}"));
        }
        let lines = sink.read();
        assert_eq!(lines.len(), 10);
        assert!(lines[0].ends_with("line 15"), "{:?}", lines[0]);
        assert!(lines[9].ends_with("line 24"), "{:?}", lines[9]);

        let on_disk = fs::read_to_string(sink.path()).expect("read file");
        assert!(on_disk.lines().count() <= 20, "file was not compacted");
        assert!(on_disk.contains("line 24"));
    }

    #[test]
    fn read_since_returns_only_new_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sink = sink_in(&dir, 100);
        sink.append("before");
        let cursor = sink.cursor();
        sink.append("after one");
        sink.append("after two");

        let (lines, next) = sink.read_since(cursor);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("after one"));
        let (lines, _) = sink.read_since(next);
        assert!(lines.is_empty());
    }

    #[test]
    fn clear_truncates_and_keeps_later_appends() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sink = sink_in(&dir, 100);
        sink.append("old");
        let cursor = sink.cursor();
        sink.clear().expect("clear");
        sink.append("new");

        let lines = sink.read();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Logs cleared: "));
        assert!(lines[1].ends_with("new"));
        let (since, _) = sink.read_since(cursor);
        assert_eq!(since.len(), 2);

        let on_disk = fs::read_to_string(sink.path()).expect("read file");
        assert!(!on_disk.contains("old"));
        assert!(on_disk.contains("new"));
    }

    #[test]
    fn concurrent_clear_never_drops_appends() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sink = Arc::new(sink_in(&dir, 10_000));
        let cursor = sink.cursor();

        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for i in 0..500 {
                    sink.append(&format!("captured {i}"));
                }
            })
        };
        for _ in 0..20 {
            sink.clear().expect("clear");
        }
        writer.join().expect("writer thread");
        sink.append("captured last");

        let (lines, _) = sink.read_since(cursor);
        assert!(lines.last().expect("lines").ends_with("captured last"));
        let retained = sink.read();
        let numbers: Vec<u32> = retained
            .iter()
            .filter_map(|l| l.rsplit("captured ").next()?.parse().ok())
            .collect();
        assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1), "gap in {numbers:?}");
    }

    #[test]
    fn reopen_keeps_previous_session_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let sink = sink_in(&dir, 100);
            sink.append("from the first session");
            sink.flush().expect("flush");
        }
        let sink = sink_in(&dir, 100);
        assert!(sink.read().iter().any(|l| l.ends_with("from the first session")));
    }

    #[test]
    fn reopen_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("logs").join("tor.log");
        fs::create_dir_all(path.parent().expect("parent")).expect("log dir");
        fs::write(&path, b"ok line\n\xff\xfe truncated\n").expect("seed log");

        let sink = LogSink::open(&path, 100).expect("open sink");
        let lines = sink.read();
        assert_eq!(lines[0], "ok line");
        assert!(lines[1].ends_with(" truncated"), "{:?}", lines[1]);
        assert!(lines.iter().any(|l| l.starts_with("TorTray Session Started: ")));
    }
}
