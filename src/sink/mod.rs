//! Byte sinks for the record writer.
//!
//! A sink is an append-only byte destination with an optional rewind used
//! to rewrite the header at shutdown, and a fork hook used by follow-fork
//! to give the child its own destination.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::TcpStream;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::TrackerResult;
use crate::util::size::round_up;

/// Capture files grow in chunks of this size; the tail past the last
/// written byte stays zeroed.
const FILE_GROWTH_CHUNK: usize = 4096;

/// Destination for the encoded record stream.
pub trait Sink: Send {
    /// Append (or overwrite, after a rewind) `data` in full.
    fn write_all(&mut self, data: &[u8]) -> TrackerResult<()>;

    /// Push buffered bytes to the underlying destination.
    fn flush(&mut self) -> TrackerResult<()>;

    /// Move the write position back to offset 0 so the header can be
    /// rewritten. Returns false when the sink cannot seek (sockets).
    fn seek_to_start(&mut self) -> TrackerResult<bool>;

    /// Produce the sink the forked child should write to, or `None` when
    /// the sink cannot follow a fork.
    fn clone_in_child_process(&self) -> TrackerResult<Option<Box<dyn Sink>>>;
}

/// Sink writing to a pre-grown file with positioned writes.
pub struct FileSink {
    file: File,
    path: PathBuf,
    /// Next write offset.
    cursor: u64,
    /// Current on-disk length (always chunk-aligned).
    allocated: u64,
    /// Highest offset ever written; the file is trimmed back to this on
    /// drop so a clean shutdown leaves no padding.
    high_water: u64,
}

impl FileSink {
    /// Create (or truncate, when `overwrite` is set) the capture file.
    pub fn create(path: impl AsRef<Path>, overwrite: bool) -> TrackerResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(&path)?;
        Ok(Self {
            file,
            path,
            cursor: 0,
            allocated: 0,
            high_water: 0,
        })
    }

    fn ensure_capacity(&mut self, end: u64) -> TrackerResult<()> {
        if end > self.allocated {
            let grown = round_up(end as usize, FILE_GROWTH_CHUNK) as u64;
            self.file.set_len(grown)?;
            self.allocated = grown;
        }
        Ok(())
    }
}

impl Sink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> TrackerResult<()> {
        let end = self.cursor + data.len() as u64;
        self.ensure_capacity(end)?;
        self.file.write_all_at(data, self.cursor)?;
        self.cursor = end;
        self.high_water = self.high_water.max(end);
        Ok(())
    }

    fn flush(&mut self) -> TrackerResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn seek_to_start(&mut self) -> TrackerResult<bool> {
        self.cursor = 0;
        Ok(true)
    }

    fn clone_in_child_process(&self) -> TrackerResult<Option<Box<dyn Sink>>> {
        let pid = unsafe { libc::getpid() };
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{pid}"));
        let child = FileSink::create(PathBuf::from(name), true)?;
        Ok(Some(Box::new(child)))
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Trim the zero padding; harmless to skip if it fails.
        let _ = self.file.set_len(self.high_water);
    }
}

/// Sink streaming records over a TCP connection.
///
/// Sockets cannot rewind, so the header is never rewritten, and they
/// cannot be cloned across a fork; follow-fork disables tracking in the
/// child instead.
pub struct SocketSink {
    stream: TcpStream,
}

impl SocketSink {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connect to a listening reader.
    pub fn connect(addr: &str) -> TrackerResult<Self> {
        Ok(Self::new(TcpStream::connect(addr)?))
    }
}

impl Sink for SocketSink {
    fn write_all(&mut self, data: &[u8]) -> TrackerResult<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> TrackerResult<()> {
        self.stream.flush()?;
        Ok(())
    }

    fn seek_to_start(&mut self) -> TrackerResult<bool> {
        Ok(false)
    }

    fn clone_in_child_process(&self) -> TrackerResult<Option<Box<dyn Sink>>> {
        Ok(None)
    }
}

/// Sink that discards everything. Used to time the tracking overhead
/// without I/O and as a stand-in in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn new() -> Self {
        NullSink
    }
}

impl Sink for NullSink {
    fn write_all(&mut self, _data: &[u8]) -> TrackerResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> TrackerResult<()> {
        Ok(())
    }

    fn seek_to_start(&mut self) -> TrackerResult<bool> {
        Ok(true)
    }

    fn clone_in_child_process(&self) -> TrackerResult<Option<Box<dyn Sink>>> {
        Ok(Some(Box::new(NullSink)))
    }
}

/// In-memory sink for unit tests and the aggregation converter.
#[derive(Debug, Default)]
pub struct VecSink {
    buffer: Vec<u8>,
    cursor: usize,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Sink for VecSink {
    fn write_all(&mut self, data: &[u8]) -> TrackerResult<()> {
        let end = self.cursor + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.cursor..end].copy_from_slice(data);
        self.cursor = end;
        Ok(())
    }

    fn flush(&mut self) -> TrackerResult<()> {
        Ok(())
    }

    fn seek_to_start(&mut self) -> TrackerResult<bool> {
        self.cursor = 0;
        Ok(true)
    }

    fn clone_in_child_process(&self) -> TrackerResult<Option<Box<dyn Sink>>> {
        Ok(Some(Box::new(VecSink::new())))
    }
}
