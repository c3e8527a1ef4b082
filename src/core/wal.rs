use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::page::checksum;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

#[derive(Debug, Clone, PartialEq)]
pub struct WalEntryHeader {
    pub length: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl WalEntryHeader {
    fn serialize_into(&self, data: &mut [u8]) {
        data[0..4].copy_from_slice(&self.length.to_be_bytes());
        data[4..WAL_ENTRY_HEADER_SIZE].copy_from_slice(&self.checksum);
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&data[4..WAL_ENTRY_HEADER_SIZE]);
        Ok(Self {
            length: u32::from_be_bytes(data[0..4].try_into()?),
            checksum,
        })
    }
}

struct WalInner {
    file: File,
    /// Offset one past the last complete entry; the next append lands here.
    end: u64,
}

/// Append-only log of `[length][sha256][payload]` entries.
///
/// The byte offset returned by `append` is the entry's identity. Existing bytes
/// are never rewritten; the only truncation is of an incomplete trailing entry
/// found at open time.
pub struct WriteAheadLog {
    inner: Mutex<WalInner>,
    path: PathBuf,
    checkpoint_path: PathBuf,
    sync_on_append: bool,
}

impl WriteAheadLog {
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(path: &Path, permissions: u32, sync_on_append: bool) -> Result<Self> {
        #[cfg(unix)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(permissions)
            .open(path)?;

        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut inner = WalInner { file, end: 0 };
        let file_len = inner.file.metadata()?.len();
        let end = inner.scan_complete_entries(file_len)?;
        if end < file_len {
            log::warn!(
                "truncating incomplete WAL tail at {}: {} trailing bytes",
                end,
                file_len - end
            );
            inner.file.set_len(end)?;
            inner.file.sync_all()?;
        }
        inner.end = end;

        let mut checkpoint_path = path.as_os_str().to_owned();
        checkpoint_path.push(".checkpoint");

        Ok(Self {
            inner: Mutex::new(inner),
            path: path.to_path_buf(),
            checkpoint_path: PathBuf::from(checkpoint_path),
            sync_on_append,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry and returns the offset it starts at. The entry is on
    /// stable storage before this returns unless `sync_on_append` is off.
    pub fn append(&self, entry: &[u8]) -> Result<WalPosition> {
        let length = u32::try_from(entry.len()).map_err(|_| Error::RecordTooLarge {
            size: entry.len(),
            max: u32::MAX as usize,
        })?;

        let header = WalEntryHeader {
            length,
            checksum: checksum(entry),
        };
        let mut data = vec![0u8; WAL_ENTRY_HEADER_SIZE + entry.len()];
        header.serialize_into(&mut data);
        data[WAL_ENTRY_HEADER_SIZE..].copy_from_slice(entry);

        let mut inner = self.inner.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "wal.inner".to_string() })?;

        let position = inner.end;
        inner.file.seek(SeekFrom::Start(position))?;
        inner.file.write_all(&data)?;
        if self.sync_on_append {
            inner.file.sync_data()?;
        }
        inner.end = position + data.len() as u64;

        log::debug!("wal append: position={}, length={}", position, length);

        Ok(position)
    }

    /// Reads the entry at `position`. `None` means the log ends there.
    pub fn read_entry(&self, position: WalPosition) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "wal.inner".to_string() })?;
        inner.read_entry_at(position)
    }

    /// Invokes `callback` for every entry from the start of the log, in append order.
    pub fn replay<F>(&self, mut callback: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        self.replay_from(0, |_, entry| callback(entry))
    }

    /// Like `replay`, starting at `position` and passing each entry's position.
    pub fn replay_from<F>(&self, position: WalPosition, mut callback: F) -> Result<usize>
    where
        F: FnMut(WalPosition, &[u8]) -> Result<()>,
    {
        let mut position = position;
        let mut count = 0;

        while let Some(entry) = self.read_entry(position)? {
            callback(position, &entry)?;
            position += (WAL_ENTRY_HEADER_SIZE + entry.len()) as u64;
            count += 1;
        }

        Ok(count)
    }

    /// Persists a recovery watermark; the log itself is left untouched.
    pub fn checkpoint(&self, position: WalPosition) -> Result<()> {
        let mut tmp_path = self.checkpoint_path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&position.to_be_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.checkpoint_path)?;

        log::debug!("wal checkpoint recorded at {}", position);

        Ok(())
    }

    /// The last recorded watermark, or 0 when none was ever written.
    pub fn checkpoint_position(&self) -> Result<WalPosition> {
        let data = match fs::read(&self.checkpoint_path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        if data.len() != 8 {
            return Err(Error::DataCorruption {
                details: format!("checkpoint file holds {} bytes, expected 8", data.len()),
            });
        }

        Ok(u64::from_be_bytes(data[..].try_into()?))
    }

    pub fn end_position(&self) -> u64 {
        self.inner.lock()
            .map(|inner| inner.end)
            .unwrap_or(0)
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "wal.inner".to_string() })?;
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

impl WalInner {
    fn read_entry_at(&mut self, position: u64) -> Result<Option<Vec<u8>>> {
        self.file.seek(SeekFrom::Start(position))?;

        let mut header_buf = [0u8; WAL_ENTRY_HEADER_SIZE];
        if !read_fully(&mut self.file, &mut header_buf)? {
            return Ok(None);
        }
        let header = WalEntryHeader::parse(&header_buf)?;

        let mut payload = vec![0u8; header.length as usize];
        if !read_fully(&mut self.file, &mut payload)? {
            return Ok(None);
        }

        if checksum(&payload) != header.checksum {
            return Err(Error::ChecksumMismatch {
                component: "wal".to_string(),
                position,
            });
        }

        Ok(Some(payload))
    }

    /// Walks entry headers to find where the last complete entry ends.
    fn scan_complete_entries(&mut self, file_len: u64) -> Result<u64> {
        let mut position = 0u64;
        let mut header_buf = [0u8; WAL_ENTRY_HEADER_SIZE];

        loop {
            if position + WAL_ENTRY_HEADER_SIZE as u64 > file_len {
                return Ok(position);
            }
            self.file.seek(SeekFrom::Start(position))?;
            self.file.read_exact(&mut header_buf)?;
            let header = WalEntryHeader::parse(&header_buf)?;

            let next = position + WAL_ENTRY_HEADER_SIZE as u64 + header.length as u64;
            if next > file_len {
                if let Some(found) = self.find_entry_after(position, file_len)? {
                    return Err(Error::DataCorruption {
                        details: format!(
                            "wal entry at {} claims {} bytes past the end of the log, \
                             but a complete entry follows at {}",
                            position, header.length, found
                        ),
                    });
                }
                return Ok(position);
            }
            position = next;
        }
    }

    /// Looks for a complete, checksum-valid entry starting anywhere after
    /// `position`. A torn append is a prefix of the last entry and holds none.
    fn find_entry_after(&mut self, position: u64, file_len: u64) -> Result<Option<u64>> {
        let mut tail = vec![0u8; (file_len - position) as usize];
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(&mut tail)?;

        for start in 1..tail.len() {
            let rest = &tail[start..];
            if rest.len() < WAL_ENTRY_HEADER_SIZE {
                break;
            }
            let header = WalEntryHeader::parse(&rest[..WAL_ENTRY_HEADER_SIZE])?;
            let end = WAL_ENTRY_HEADER_SIZE + header.length as usize;
            if end <= rest.len() && checksum(&rest[WAL_ENTRY_HEADER_SIZE..end]) == header.checksum {
                return Ok(Some(position + start as u64));
            }
        }

        Ok(None)
    }
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn read_fully(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
