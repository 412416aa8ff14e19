use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::limits::MAX_EVENT_BYTES;
use crate::model::Event;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_EVENT_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large"));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A truncated or corrupt tail was found and ignored.
    pub discarded_tail: bool,
    /// Bytes of intact records before any discarded tail.
    pub valid_len: u64,
}

/// Storage under a `Wal`.
pub trait LogFile: Write {
    /// Make everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the file back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Replace the whole contents with `bytes` in one step.
    fn replace(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }

    /// Temp file, fsync, rename over, reopen for appending.
    fn replace(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        *self = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }
}

/// Append-only write-ahead log of booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// A torn final entry (crash mid-write) fails the length or CRC check and is
/// dropped on replay; everything before it is kept.
///
/// Appends go in batches. A batch that fails to write or sync is cut off the
/// file again, so a caller told "failed" never finds its events on replay.
pub struct Wal<F: LogFile = File> {
    file: F,
    path: PathBuf,
    /// File length after the last successful batch.
    durable_len: u64,
    /// Set when a failed batch could not be cut off. Appends are refused
    /// until a compaction rewrites the file.
    broken: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::with_file(file, path, len))
    }

    /// Open `path` for appending after its first `valid_len` bytes; anything
    /// beyond them (a torn tail found by `replay`) is cut off first.
    pub fn open_at(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self::with_file(file, path, valid_len))
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        match File::open(path) {
            Ok(f) => Self::replay_from(BufReader::new(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Replay::default()),
            Err(e) => Err(e),
        }
    }

    pub fn replay_from(mut reader: impl Read) -> io::Result<Replay> {
        let mut replay = Replay::default();

        loop {
            let mut len_buf = [0u8; 4];
            match read_exact_or_eof(&mut reader, &mut len_buf)? {
                ReadOutcome::Full => {}
                ReadOutcome::CleanEof => break,
                ReadOutcome::Partial => {
                    replay.discarded_tail = true;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            // No writer produces a record this large: the prefix is garbage.
            if len > MAX_EVENT_BYTES {
                replay.discarded_tail = true;
                break;
            }

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            if read_exact_or_eof(&mut reader, &mut payload)? != ReadOutcome::Full
                || read_exact_or_eof(&mut reader, &mut crc_buf)? != ReadOutcome::Full
            {
                replay.discarded_tail = true;
                break;
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                replay.discarded_tail = true;
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    replay.events.push(event);
                    replay.valid_len += 8 + len as u64;
                }
                Err(_) => {
                    replay.discarded_tail = true;
                    break;
                }
            }
        }

        Ok(replay)
    }
}

impl<F: LogFile> Wal<F> {
    /// Wrap `file`, which already holds `len` bytes of intact log.
    pub fn with_file(file: F, path: &Path, len: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            durable_len: len,
            broken: false,
            appends_since_compact: 0,
        }
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::iter::once(event))
    }

    /// Write and fsync `events` as one unit: all of them or none.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::other("event log needs compaction after a failed rollback"));
        }
        let mut buf = Vec::new();
        let mut count = 0;
        for event in events {
            encode_event(&mut buf, event)?;
            count += 1;
        }
        if buf.is_empty() {
            return Ok(());
        }

        let written = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        if let Err(e) = written {
            if let Err(cut) = self.file.truncate(self.durable_len) {
                error!(path = %self.path.display(), "could not cut failed batch off the log: {cut}");
                self.broken = true;
            }
            return Err(e);
        }
        self.durable_len += buf.len() as u64;
        self.appends_since_compact += count;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `events`.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let mut buf = Vec::new();
        for event in events {
            encode_event(&mut buf, event)?;
        }
        self.file.replace(&self.path, &buf)?;
        self.durable_len = buf.len() as u64;
        self.broken = false;
        self.appends_since_compact = 0;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Full,
    CleanEof,
    Partial,
}

/// Like `read_exact`, but tells a clean end-of-file apart from a torn read.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::CleanEof),
            Ok(0) => return Ok(ReadOutcome::Partial),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

/// In-memory `LogFile` whose writes or syncs fail while a flag is set.
/// Clones share state, so a test can flip flags on a file the writer owns.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct FlakyFile {
    data: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    pub fail_writes: std::sync::Arc<std::sync::atomic::AtomicBool>,
    pub fail_sync: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl FlakyFile {
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Write for FlakyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            // The device fills up partway through the record.
            data.extend_from_slice(&buf[..buf.len() / 2]);
            return Err(io::Error::other("no space left on device"));
        }
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl LogFile for FlakyFile {
    fn sync(&mut self) -> io::Result<()> {
        if self.fail_sync.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(io::Error::other("fsync failed"));
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.data.lock().unwrap().truncate(len as usize);
        Ok(())
    }

    fn replace(&mut self, _path: &Path, bytes: &[u8]) -> io::Result<()> {
        *self.data.lock().unwrap() = bytes.to_vec();
        Ok(())
    }
}
