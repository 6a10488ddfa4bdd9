use crate::error::{EngineError, Result as EngineResult};
use crate::log::{AppendLog, MemoryAppendLog};
use crate::types::{HostId, LogIndex};
use anyhow::{anyhow, bail, Context as _, Result};
use fs_err::{File, OpenOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, trace, warn};

/// Upper bound on the encoded header; anything larger is corruption.
const MAX_HEADER_LEN: u32 = 4096;
/// Upper bound on one encoded record.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Log file header to identify format and version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub host_id: HostId,
    pub created_at: i64,
}

impl LogHeader {
    const MAGIC: [u8; 4] = *b"AKVQ";
    const VERSION: u32 = 1;

    pub fn new(host_id: HostId) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            host_id,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }
}

/// One stored log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: LogIndex,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl LogRecord {
    pub fn new(index: LogIndex, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(index, &payload);
        Self {
            index,
            payload,
            checksum,
        }
    }

    fn compute_checksum(index: LogIndex, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&index.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn verify_checksum(&self) -> bool {
        Self::compute_checksum(self.index, &self.payload) == self.checksum
    }
}

/// Append log persisted to a single file.
///
/// Every entry is written and fsynced before it becomes visible to readers.
/// Reads are served from an in-memory copy rebuilt from the file on open.
pub struct FileAppendLog {
    file_path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    cache: MemoryAppendLog,
}

impl FileAppendLog {
    /// Create or open a log file
    pub fn open<P: AsRef<Path>>(file_path: P, host_id: HostId) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let file_exists = file_path.exists();
        let cache = MemoryAppendLog::new(0);

        if file_exists {
            let (recovered, valid_len) = Self::recover(&file_path, host_id, &cache)?;
            let file_len = fs_err::metadata(&file_path)?.len();
            if valid_len < file_len {
                warn!(
                    "Truncating {} trailing bytes of {:?}",
                    file_len - valid_len,
                    file_path
                );
                OpenOptions::new()
                    .write(true)
                    .open(&file_path)?
                    .set_len(valid_len)?;
            }
            info!(
                "Opened existing log file: {:?}, {} entries, last index: {:?}",
                file_path,
                recovered,
                cache.last_index_appended()
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        let mut writer = BufWriter::new(file);

        if !file_exists {
            let header = LogHeader::new(host_id);
            let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())?;
            let header_len = header_bytes.len() as u32;

            writer.write_all(&header_len.to_le_bytes())?;
            writer.write_all(&header_bytes)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;

            info!("Created new log file: {:?}", file_path);
        }

        Ok(Self {
            file_path,
            writer: Mutex::new(Some(writer)),
            cache,
        })
    }

    /// Reads the header and returns it with its on-disk size.
    fn read_header<R: Read>(reader: &mut R) -> Result<(LogHeader, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let header_len = u32::from_le_bytes(len_bytes);
        if header_len > MAX_HEADER_LEN {
            bail!("Header length {header_len} exceeds {MAX_HEADER_LEN}");
        }

        let mut header_bytes = vec![0u8; header_len as usize];
        reader.read_exact(&mut header_bytes)?;

        let (header, _): (LogHeader, _) =
            bincode::serde::decode_from_slice(&header_bytes, bincode::config::standard())?;
        Ok((header, 4 + header_len as u64))
    }

    /// Replays every intact record into `cache` and returns the record count
    /// and the length of the intact prefix. A truncated tail is tolerated; a
    /// checksum mismatch is not.
    fn recover(file_path: &Path, host_id: HostId, cache: &MemoryAppendLog) -> Result<(usize, u64)> {
        let mut reader = BufReader::new(File::open(file_path)?);
        let (header, mut valid_len) =
            Self::read_header(&mut reader).context("Failed to read log header")?;
        if !header.is_valid() {
            bail!("Invalid log file header");
        }
        if header.host_id != host_id {
            warn!(
                "Log file host_id mismatch: expected {}, found {}",
                host_id, header.host_id
            );
        }

        let mut count = 0;
        loop {
            let mut len_bytes = [0u8; 4];
            let record_len = match reader.read_exact(&mut len_bytes) {
                Ok(_) => u32::from_le_bytes(len_bytes),
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => Err(err).context("Failed to read log record length")?,
            };
            if record_len > MAX_RECORD_LEN {
                bail!("Log record length {record_len} exceeds {MAX_RECORD_LEN}");
            }

            let mut record_bytes = vec![0u8; record_len as usize];
            match reader.read_exact(&mut record_bytes) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    warn!(
                        "Encountered truncated log record (expected {} bytes); stopping replay",
                        record_len
                    );
                    break;
                }
                Err(err) => Err(err).context("Failed to read log record")?,
            }

            let (record, _) = bincode::serde::decode_from_slice::<LogRecord, _>(
                &record_bytes,
                bincode::config::standard(),
            )
            .context("Failed to deserialize log record")?;
            if !record.verify_checksum() {
                bail!("Log record {} corrupted", record.index);
            }
            cache
                .write_at(record.index, &record.payload)
                .map_err(|e| anyhow!("{e}"))
                .context("Log records out of order")?;
            valid_len += 4 + record_len as u64;
            count += 1;
        }
        Ok((count, valid_len))
    }

    /// Appends at `index`, or after the last entry when `index` is `None`.
    /// The writer lock is held across index allocation so records stay
    /// ordered on disk.
    fn append(&self, index: Option<LogIndex>, payload: &[u8]) -> EngineResult<LogIndex> {
        let mut guard = self.writer.lock();
        let last = self.cache.last_index_appended();
        let index = match (index, last) {
            (Some(index), Some(last)) if index <= last => {
                return Err(EngineError::Log(anyhow!(
                    "index {index} is not after last index {last}"
                )));
            }
            (Some(index), _) => index,
            (None, last) => last.map_or(1, |last| last + 1),
        };
        let writer = guard
            .as_mut()
            .ok_or_else(|| EngineError::Log(anyhow!("log writer is closed")))?;
        Self::write_record(writer, &LogRecord::new(index, payload.to_vec()))
            .map_err(EngineError::Log)?;
        self.cache.write_at(index, payload)?;
        Ok(index)
    }

    fn write_record(writer: &mut BufWriter<File>, record: &LogRecord) -> Result<()> {
        let record_bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        let record_len = u32::try_from(record_bytes.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| anyhow!("Log record of {} bytes is too large", record_bytes.len()))?;

        writer.write_all(&record_len.to_le_bytes())?;
        writer.write_all(&record_bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        trace!(index = record.index, "Wrote log record");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn close_writer(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            info!("Closed log: {:?}", self.file_path);
        }
        Ok(())
    }
}

impl AppendLog for FileAppendLog {
    fn last_index_appended(&self) -> Option<LogIndex> {
        self.cache.last_index_appended()
    }

    fn write_bytes(&self, payload: &[u8]) -> EngineResult<LogIndex> {
        self.append(None, payload)
    }

    fn write_at(&self, index: LogIndex, payload: &[u8]) -> EngineResult<()> {
        self.append(Some(index), payload).map(|_| ())
    }

    fn read_from(&self, index: LogIndex) -> Option<(LogIndex, Vec<u8>)> {
        self.cache.read_from(index)
    }

    fn len(&self) -> usize {
        self.cache.len()
    }

    fn close(&self) {
        if let Err(e) = self.close_writer() {
            error!("Error closing log {:?}: {e}", self.file_path);
        }
    }
}

impl Drop for FileAppendLog {
    fn drop(&mut self) {
        if let Err(e) = self.close_writer() {
            error!("Error closing log in drop: {e}");
        }
    }
}
