use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use super::SpoolEntry;

/// Durable backing for the spool queue.
///
/// Entries are only ever appended at the back and removed from the front,
/// so removal is expressed as a cursor: every entry with `seq` below it is
/// gone.
pub trait SpoolStore: Send {
    /// Live entries in FIFO order and the lowest sequence number a new
    /// entry may use.
    fn load(&mut self) -> Result<(Vec<SpoolEntry>, u64)>;

    /// Durably append one entry.
    fn append(&mut self, entry: &SpoolEntry) -> Result<()>;

    /// Durably drop every entry with `seq < cursor`. `remaining` is the
    /// live queue after the removal.
    fn remove_before(&mut self, cursor: u64, remaining: &VecDeque<SpoolEntry>) -> Result<()>;

    /// Replace everything stored with exactly `live`, after earlier writes
    /// were lost. `next_seq` becomes the cursor when `live` is empty.
    fn rewrite(&mut self, live: &VecDeque<SpoolEntry>, next_seq: u64) -> Result<()>;

    /// Whether anything written here outlives the process.
    fn is_persistent(&self) -> bool {
        true
    }
}

/// Non-durable store; the in-memory queue is the only copy.
#[derive(Debug, Default)]
pub struct MemoryStore;

impl SpoolStore for MemoryStore {
    fn load(&mut self) -> Result<(Vec<SpoolEntry>, u64)> {
        Ok((Vec::new(), 0))
    }

    fn append(&mut self, _entry: &SpoolEntry) -> Result<()> {
        Ok(())
    }

    fn remove_before(&mut self, _cursor: u64, _remaining: &VecDeque<SpoolEntry>) -> Result<()> {
        Ok(())
    }

    fn rewrite(&mut self, _live: &VecDeque<SpoolEntry>, _next_seq: u64) -> Result<()> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// Append-only JSON Lines log plus a cursor file.
///
/// Layout next to `path` (e.g. `spool.jsonl`):
/// - `spool.jsonl`: one [`SpoolEntry`] per line, appended and fsynced.
/// - `spool.jsonl.ack`: the cursor, replaced via write-temp + rename.
///
/// A trailing line without a newline is a torn write and is dropped on
/// load. Compaction rewrites the log with only live entries through the
/// same temp + rename path, so the live set is identical before and after.
pub struct FileStore {
    path: PathBuf,
    ack_path: PathBuf,
    log: Option<File>,
    cursor: u64,
    dead: usize,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ack_path = sibling(&path, "ack");
        Self {
            path,
            ack_path,
            log: None,
            cursor: 0,
            dead: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the live entries of a spool file without modifying it.
    pub fn inspect(path: &Path) -> Result<Vec<SpoolEntry>> {
        let cursor = read_cursor(&sibling(path, "ack"))?;
        let scan = scan_log(path)?;
        Ok(scan
            .entries
            .into_iter()
            .filter(|e| e.seq >= cursor)
            .collect())
    }

    fn log(&mut self) -> Result<&mut File> {
        if self.log.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("opening spool log {}", self.path.display()))?;
            self.log = Some(file);
        }

        self.log
            .as_mut()
            .context("spool log handle unavailable")
    }

    fn compact(&mut self, remaining: &VecDeque<SpoolEntry>) -> Result<()> {
        let tmp = sibling(&self.path, "tmp");

        {
            let file = File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            let mut w = BufWriter::new(file);
            for entry in remaining {
                serde_json::to_writer(&mut w, entry).context("serializing spool entry")?;
                w.write_all(b"\n")?;
            }
            let file = w.into_inner().context("flushing compacted spool")?;
            file.sync_all().context("syncing compacted spool")?;
        }

        // Drop the append handle before the old inode is replaced.
        self.log = None;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        sync_parent(&self.path);

        debug!(live = remaining.len(), dropped = self.dead, "compacted spool log");
        self.dead = 0;

        Ok(())
    }
}

impl SpoolStore for FileStore {
    fn load(&mut self) -> Result<(Vec<SpoolEntry>, u64)> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating spool directory {}", parent.display()))?;
            }
        }

        self.cursor = read_cursor(&self.ack_path)?;
        let scan = scan_log(&self.path)?;

        if scan.torn_bytes > 0 {
            warn!(
                path = %self.path.display(),
                bytes = scan.torn_bytes,
                "dropping torn trailing spool record",
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .with_context(|| format!("opening {} for repair", self.path.display()))?;
            file.set_len(scan.valid_len)
                .context("truncating torn spool record")?;
            file.sync_all().context("syncing repaired spool")?;
        }

        let total = scan.entries.len();
        let live: Vec<SpoolEntry> = scan
            .entries
            .into_iter()
            .filter(|e| e.seq >= self.cursor)
            .collect();
        self.dead = total - live.len();

        let next_seq = scan.max_seq.map_or(0, |s| s + 1).max(self.cursor);

        Ok((live, next_seq))
    }

    fn append(&mut self, entry: &SpoolEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("serializing spool entry")?;
        line.push(b'\n');

        let log = self.log()?;
        log.write_all(&line).context("appending spool entry")?;
        log.sync_data().context("syncing spool log")?;

        Ok(())
    }

    fn remove_before(&mut self, cursor: u64, remaining: &VecDeque<SpoolEntry>) -> Result<()> {
        if cursor <= self.cursor {
            return Ok(());
        }

        write_atomic(&self.ack_path, cursor.to_string().as_bytes())?;

        self.dead = self
            .dead
            .saturating_add(usize::try_from(cursor - self.cursor).unwrap_or(usize::MAX));
        self.cursor = cursor;

        if remaining.is_empty() || self.dead > remaining.len() {
            self.compact(remaining)?;
        }

        Ok(())
    }

    fn rewrite(&mut self, live: &VecDeque<SpoolEntry>, next_seq: u64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating spool directory {}", parent.display()))?;
            }
        }

        // Log first: every rewritten entry is at or past the old cursor,
        // so a crash before the cursor lands still loads exactly `live`.
        self.compact(live)?;

        let cursor = live.front().map_or(next_seq, |e| e.seq);
        write_atomic(&self.ack_path, cursor.to_string().as_bytes())?;
        self.cursor = cursor;

        Ok(())
    }
}

struct LogScan {
    entries: Vec<SpoolEntry>,
    max_seq: Option<u64>,
    valid_len: u64,
    torn_bytes: u64,
}

fn scan_log(path: &Path) -> Result<LogScan> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("reading spool log {}", path.display()));
        }
    };

    let valid_len = data
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);

    let mut entries = Vec::new();
    let mut max_seq = None;

    for (lineno, raw) in data[..valid_len].split(|b| *b == b'\n').enumerate() {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<SpoolEntry>(raw) {
            Ok(entry) => {
                max_seq = max_seq.max(Some(entry.seq));
                entries.push(entry);
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable spool record",
                );
            }
        }
    }

    Ok(LogScan {
        entries,
        max_seq,
        valid_len: valid_len as u64,
        torn_bytes: (data.len() - valid_len) as u64,
    })
}

/// A cursor that cannot be parsed reads as 0, so every record in the log
/// is replayed again rather than lost.
fn read_cursor(path: &Path) -> Result<u64> {
    match fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse() {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                error!(
                    path = %path.display(),
                    content = raw.trim(),
                    error = %e,
                    "unreadable spool cursor, replaying the whole log",
                );
                Ok(0)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("reading spool cursor {}", path.display())),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = sibling(path, "tmp");

    {
        let mut file =
            File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(data)?;
        file.sync_all()
            .with_context(|| format!("syncing {}", tmp.display()))?;
    }

    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    sync_parent(path);

    Ok(())
}

/// `spool.jsonl` -> `spool.jsonl.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    // Directory fsync is unsupported on some filesystems.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
}
