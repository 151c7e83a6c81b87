use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_FRAME_LEN;
use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("event of {} bytes exceeds frame limit", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Intact events and the byte length of the prefix holding them.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_frame_part(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        // A corrupt prefix must not drive the allocation.
        let remaining = file_len.saturating_sub(offset + 8);
        if len > MAX_FRAME_LEN || len as u64 > remaining {
            break;
        }
        let mut payload = vec![0u8; len];
        if !read_frame_part(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_frame_part(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        offset += 8 + len as u64;
    }

    Ok((events, offset))
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Append-only booking journal.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn or corrupt tail (crash mid-write) is dropped on replay and cut off
/// when the journal is reopened for writing.
///
/// A failed append or flush rolls the file back to the end of the last
/// synced batch. If that rollback fails too the journal is poisoned and
/// refuses every later append.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful `flush_sync`.
    durable_len: u64,
    /// Appends buffered since the last successful `flush_sync`.
    pending: u64,
    appends_since_compact: u64,
    poisoned: bool,
    #[cfg(test)]
    fail_after: Option<u32>,
}

impl Journal {
    /// Open (or create) the journal at `path`, truncating any torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let (events, intact) = scan(path)?;
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
        if file.metadata()?.len() != intact {
            tracing::warn!(path = %path.display(), intact, "truncating torn journal tail");
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: open_append(path)?,
            path: path.to_path_buf(),
            durable_len: intact,
            pending: 0,
            // Events already on disk count too, so a restarted process still
            // compacts a long journal.
            appends_since_compact: events.len() as u64,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Append and fsync one event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Lets `n` more appends through, then makes the next one write half a
    /// frame to disk and fail.
    #[cfg(test)]
    pub(crate) fn fail_after_appends(&mut self, n: u32) {
        self.fail_after = Some(n);
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("journal poisoned by an earlier failed rollback"));
        }
        Ok(())
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.ensure_writable()?;
        #[cfg(test)]
        if let Some(n) = self.fail_after {
            if n == 0 {
                self.fail_after = None;
                let mut frame = Vec::new();
                encode_event(&mut frame, event)?;
                self.writer.write_all(&frame[..frame.len() / 2])?;
                self.writer.flush()?;
                return Err(io::Error::other("injected append failure"));
            }
            self.fail_after = Some(n - 1);
        }
        encode_event(&mut self.writer, event)?;
        self.pending += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.ensure_writable()?;
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.durable_len = file.metadata()?.len();
        self.pending = 0;
        Ok(())
    }

    /// Discards everything written since the last successful `flush_sync`,
    /// buffered or already on disk.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_durable();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        // into_parts drops the unflushed buffer instead of writing it out.
        let stale = std::mem::replace(&mut self.writer, open_append(&self.path)?);
        let _ = stale.into_parts();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending);
        self.pending = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".compact");
        PathBuf::from(name)
    }

    /// Write snapshot events to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the journal and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.ensure_writable()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.durable_len = fs::metadata(&self.path)?.len();
        self.pending = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in file order. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }
}
