use crate::Measurement;
use chrono::Utc;
use std::{
    ffi::OsString,
    io::{
        self,
        SeekFrom,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::{
        PoisonError,
        RwLock,
    },
    time::Duration,
};
use tokio::{
    fs::{
        self,
        File,
        OpenOptions,
    },
    io::{
        AsyncBufReadExt as _,
        AsyncReadExt as _,
        AsyncSeekExt as _,
        AsyncWriteExt as _,
        BufReader,
    },
    sync::Mutex,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("measurement log {path:?} is not accessible: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("measurement log {path:?} has a malformed record at line {line}: {content:?}")]
    Corrupt { path: PathBuf, line: usize, content: String },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only, time-ordered log of measurements in a plain text file.
///
/// Writers are serialized by an internal lock. Readers open their own handle and
/// only ever see complete lines: a record becomes visible once its terminating
/// newline is on disk, and purges replace the file through a rename.
#[derive(Debug)]
pub struct MeasurementStore {
    location: RwLock<PathBuf>,
    retention: Duration,
    writer: Mutex<()>,
}

impl MeasurementStore {
    pub fn open(location: impl Into<PathBuf>, retention: Duration) -> Self {
        let location = location.into();
        debug!(?location, ?retention, "Opening measurement store");
        Self {
            location: RwLock::new(location),
            retention,
            writer: Mutex::new(()),
        }
    }

    pub fn location(&self) -> PathBuf {
        self.location.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Switches to another log file. Existing records are not migrated.
    pub fn set_location(&self, location: impl Into<PathBuf>) {
        let location = location.into();
        info!(?location, "Switching measurement store location");
        *self.location.write().unwrap_or_else(PoisonError::into_inner) = location;
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Records a new measurement stamped with the current time. Expired records at
    /// the head of the log are dropped first.
    #[instrument(level = "debug", skip(self, note))]
    pub async fn append(&self, throughput: u64, note: &str) -> Result<Measurement, StoreError> {
        let _writer = self.writer.lock().await;
        let path = self.location();
        let measurement = Measurement::new(Utc::now().timestamp_millis(), throughput, note);

        drop_torn_tail(&path).await?;
        if self.oldest_expired(&path, measurement.timestamp).await? {
            self.purge_and_append(&path, &measurement).await?;
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(StoreError::io(&path))?;
            // A single write with the newline as its last byte.
            file.write_all(measurement.to_line().as_bytes())
                .await
                .map_err(StoreError::io(&path))?;
            file.flush().await.map_err(StoreError::io(&path))?;
        }

        trace!(?measurement, "Measurement appended");
        Ok(measurement)
    }

    /// Measurements with `from <= timestamp <= to`, oldest first. Reading stops at the
    /// first record past `to`.
    pub async fn range_query(&self, from: i64, to: i64) -> Result<Vec<Measurement>, StoreError> {
        let path = self.location();
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&path)(err)),
        };

        let mut reader = BufReader::new(file);
        let mut buffer = String::new();
        let mut records = Vec::new();
        for index in 0usize.. {
            buffer.clear();
            reader
                .read_line(&mut buffer)
                .await
                .map_err(StoreError::io(&path))?;
            // End of file, or a trailing fragment that is still being written.
            let Some(line) = buffer.strip_suffix('\n') else {
                break;
            };
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let measurement = parse(&path, index, line)?;
            if measurement.timestamp > to {
                break;
            }
            if measurement.timestamp >= from {
                records.push(measurement);
            }
        }
        Ok(records)
    }

    /// Everything recorded from `from` up to now.
    pub async fn query_since(&self, from: i64) -> Result<Vec<Measurement>, StoreError> {
        self.range_query(from, Utc::now().timestamp_millis()).await
    }

    async fn oldest_expired(&self, path: &Path, now: i64) -> Result<bool, StoreError> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(StoreError::io(path)(err)),
        };
        let mut first = String::new();
        BufReader::new(file)
            .read_line(&mut first)
            .await
            .map_err(StoreError::io(path))?;

        let Some(line) = first.strip_suffix('\n') else {
            return Ok(false);
        };
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            // Rewriting drops the blank line.
            return Ok(true);
        }
        let oldest = parse(path, 0, line)?;
        Ok(self.is_expired(&oldest, now))
    }

    async fn purge_and_append(&self, path: &Path, measurement: &Measurement) -> Result<(), StoreError> {
        let content = fs::read_to_string(path).await.map_err(StoreError::io(path))?;

        let mut kept = String::with_capacity(content.len());
        let mut evicted = 0usize;
        let mut expiring = true;
        for (index, line) in complete_lines(&content).enumerate() {
            if line.is_empty() {
                continue;
            }
            if expiring {
                let record = parse(path, index, line)?;
                if self.is_expired(&record, measurement.timestamp) {
                    evicted += 1;
                    continue;
                }
                expiring = false;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        kept.push_str(&measurement.to_line());

        let staging = staging_path(path);
        let mut staged = File::create(&staging).await.map_err(StoreError::io(&staging))?;
        staged
            .write_all(kept.as_bytes())
            .await
            .map_err(StoreError::io(&staging))?;
        staged.sync_all().await.map_err(StoreError::io(&staging))?;
        drop(staged);
        fs::rename(&staging, path).await.map_err(StoreError::io(path))?;

        debug!(evicted, ?path, "Purged expired measurements");
        Ok(())
    }

    fn is_expired(&self, record: &Measurement, now: i64) -> bool {
        let retention = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(record.timestamp) > retention
    }
}

/// A write interrupted by a crash leaves a line without its terminator. Appending after
/// it would fuse two records, so the fragment is cut off first.
async fn drop_torn_tail(path: &Path) -> Result<(), StoreError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(StoreError::io(path)(err)),
    };
    let len = file.metadata().await.map_err(StoreError::io(path))?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).await.map_err(StoreError::io(path))?;
    file.read_exact(&mut last).await.map_err(StoreError::io(path))?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let content = fs::read(path).await.map_err(StoreError::io(path))?;
    let keep = content.iter().rposition(|byte| *byte == b'\n').map_or(0, |index| index + 1) as u64;
    file.set_len(keep).await.map_err(StoreError::io(path))?;
    warn!(?path, dropped_bytes = len - keep, "Dropped an incomplete record at the end of the log");
    Ok(())
}

/// Lines that carry their terminator. A trailing fragment is a write still in progress.
fn complete_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .split_inclusive('\n')
        .filter_map(|line| line.strip_suffix('\n'))
        .map(|line| line.trim_end_matches('\r'))
}

fn parse(path: &Path, index: usize, line: &str) -> Result<Measurement, StoreError> {
    Measurement::parse_line(line).ok_or_else(|| StoreError::Corrupt {
        path: path.to_path_buf(),
        line: index + 1,
        content: line.to_string(),
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
