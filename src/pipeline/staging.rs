//! Staging handoff between computation workers and the importer
//!
//! Two backends share the same producer/consumer traits:
//!
//! - **File**: each flush becomes one self-describing JSON batch file in the
//!   staging directory. Written to a hidden temp name and renamed into place,
//!   so the importer never sees a partial file. Survives restarts.
//! - **Channel**: bounded in-memory channel. Leftover files from an earlier
//!   run are still drained, and batches the importer cannot fully apply are
//!   spilled to the staging directory for inspection.
//!
//! Workers only ever create batches; only the importer removes them, and only
//! once every row was applied.

use super::config::HandoffBackend;
use super::error::HandoffError;
use super::types::StagedBatch;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

pub const BATCH_EXTENSION: &str = "batch";

/// Producer side, used from blocking worker threads
pub trait StagingSink: Send {
    /// Hand over one batch
    fn stage(&mut self, batch: StagedBatch) -> Result<(), HandoffError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Where a pending batch came from, and so how to release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOrigin {
    File(PathBuf),
    Memory,
}

#[derive(Debug)]
pub struct PendingBatch {
    pub batch: StagedBatch,
    pub origin: BatchOrigin,
}

/// Consumer side, owned by the importer
#[async_trait]
pub trait StagingSource: Send {
    /// Collect available batches, waiting up to the poll interval when none are ready
    async fn poll(&mut self) -> Result<Vec<PendingBatch>, HandoffError>;

    /// Every row of the batch is durable; release it
    fn acknowledge(&mut self, pending: PendingBatch) -> Result<(), HandoffError>;

    /// Some rows failed; keep the batch on disk and stop offering it
    fn retain(&mut self, pending: PendingBatch) -> Result<(), HandoffError>;

    /// Batches still waiting to be offered (retained ones excluded)
    fn pending(&self) -> usize;

    /// Batches kept on disk after a partial failure
    fn retained(&self) -> usize;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Writes batches as `<prefix>_<entity>_<attempt>.batch` files
pub struct FileStagingSink {
    dir: PathBuf,
    prefix: String,
    attempt: u64,
}

impl FileStagingSink {
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>) -> Result<Self, HandoffError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            attempt: 0,
        })
    }

    /// Sink for worker `index`
    pub fn for_worker(dir: impl AsRef<Path>, index: usize) -> Result<Self, HandoffError> {
        Self::new(dir, format!("w{:02}", index))
    }

    /// Write one batch file and return its final path
    pub fn write(&mut self, batch: &StagedBatch) -> Result<PathBuf, HandoffError> {
        self.attempt += 1;

        let mut stem = format!("{}_{:05}_{:06}", self.prefix, batch.entity_id, self.attempt);
        let mut target = self.dir.join(format!("{}.{}", stem, BATCH_EXTENSION));
        while target.exists() {
            log::warn!("⚠️  Staging name {} taken, retrying", target.display());
            stem.push('_');
            target = self.dir.join(format!("{}.{}", stem, BATCH_EXTENSION));
        }

        let temp = self.dir.join(format!(".{}.tmp", stem));
        {
            let file = fs::File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, batch)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp, &target)?;

        log::debug!(
            "📦 Staged {} rows of entity {} → {}",
            batch.len(),
            batch.entity_id,
            target.display()
        );
        Ok(target)
    }
}

impl StagingSink for FileStagingSink {
    fn stage(&mut self, batch: StagedBatch) -> Result<(), HandoffError> {
        self.write(&batch).map(|_| ())
    }

    fn backend_type(&self) -> &'static str {
        "File"
    }
}

/// Batch files in the staging dir that are complete (renamed into place)
pub fn list_batch_files(dir: &Path) -> Result<Vec<PathBuf>, HandoffError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_batch = path.extension().map_or(false, |ext| ext == BATCH_EXTENSION);
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if is_batch && !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads batch files from the staging dir
pub struct FileStagingSource {
    dir: PathBuf,
    poll_interval: Duration,
    retained: HashSet<PathBuf>,
}

impl FileStagingSource {
    pub fn new(dir: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, HandoffError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            poll_interval,
            retained: HashSet::new(),
        })
    }

    fn available(&self) -> Result<Vec<PathBuf>, HandoffError> {
        Ok(list_batch_files(&self.dir)?
            .into_iter()
            .filter(|p| !self.retained.contains(p))
            .collect())
    }

    /// Read every available batch without waiting
    pub async fn drain_now(&mut self) -> Result<Vec<PendingBatch>, HandoffError> {
        let mut batches = Vec::new();
        for path in self.available()? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Raced with another consumer or manual cleanup
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<StagedBatch>(&bytes) {
                Ok(batch) => batches.push(PendingBatch {
                    batch,
                    origin: BatchOrigin::File(path),
                }),
                Err(e) => {
                    log::error!("❌ Unreadable batch {}: {}", path.display(), e);
                    self.retained.insert(path);
                }
            }
        }
        Ok(batches)
    }

    /// Mark a file so it is never offered again
    pub fn hold(&mut self, path: PathBuf) {
        self.retained.insert(path);
    }
}

#[async_trait]
impl StagingSource for FileStagingSource {
    async fn poll(&mut self) -> Result<Vec<PendingBatch>, HandoffError> {
        let batches = self.drain_now().await?;
        if !batches.is_empty() {
            return Ok(batches);
        }
        tokio::time::sleep(self.poll_interval).await;
        self.drain_now().await
    }

    fn acknowledge(&mut self, pending: PendingBatch) -> Result<(), HandoffError> {
        if let BatchOrigin::File(path) = pending.origin {
            if let Err(e) = fs::remove_file(&path) {
                // Applied but still on disk: never offer it again this run
                self.retained.insert(path);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn retain(&mut self, pending: PendingBatch) -> Result<(), HandoffError> {
        if let BatchOrigin::File(path) = pending.origin {
            log::warn!("⚠️  Keeping {} for inspection", path.display());
            self.retained.insert(path);
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        match self.available() {
            Ok(files) => files.len(),
            Err(e) => {
                log::warn!("⚠️  Could not list staging dir: {}", e);
                0
            }
        }
    }

    fn retained(&self) -> usize {
        self.retained.len()
    }

    fn backend_type(&self) -> &'static str {
        "File"
    }
}

/// Producer end of the bounded channel
pub struct ChannelStagingSink {
    tx: mpsc::Sender<StagedBatch>,
}

impl StagingSink for ChannelStagingSink {
    /// Blocks while the channel is full. Must run off the async runtime.
    fn stage(&mut self, batch: StagedBatch) -> Result<(), HandoffError> {
        self.tx
            .blocking_send(batch)
            .map_err(|_| HandoffError::ChannelClosed)
    }

    fn backend_type(&self) -> &'static str {
        "Channel"
    }
}

/// Consumer end of the bounded channel, plus leftover and spilled files
pub struct ChannelStagingSource {
    rx: mpsc::Receiver<StagedBatch>,
    files: FileStagingSource,
    spill: FileStagingSink,
    poll_interval: Duration,
    closed: bool,
}

impl ChannelStagingSource {
    pub fn new(
        rx: mpsc::Receiver<StagedBatch>,
        dir: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> Result<Self, HandoffError> {
        Ok(Self {
            rx,
            files: FileStagingSource::new(dir.as_ref(), poll_interval)?,
            spill: FileStagingSink::new(dir.as_ref(), "rejected")?,
            poll_interval,
            closed: false,
        })
    }

    fn drain_channel(&mut self, into: &mut Vec<PendingBatch>) {
        loop {
            match self.rx.try_recv() {
                Ok(batch) => into.push(PendingBatch {
                    batch,
                    origin: BatchOrigin::Memory,
                }),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StagingSource for ChannelStagingSource {
    async fn poll(&mut self) -> Result<Vec<PendingBatch>, HandoffError> {
        let mut batches = self.files.drain_now().await?;
        self.drain_channel(&mut batches);
        if !batches.is_empty() {
            return Ok(batches);
        }

        if self.closed {
            tokio::time::sleep(self.poll_interval).await;
            return Ok(batches);
        }

        match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
            Ok(Some(batch)) => {
                batches.push(PendingBatch {
                    batch,
                    origin: BatchOrigin::Memory,
                });
                self.drain_channel(&mut batches);
            }
            Ok(None) => self.closed = true,
            Err(_) => {}
        }
        Ok(batches)
    }

    fn acknowledge(&mut self, pending: PendingBatch) -> Result<(), HandoffError> {
        self.files.acknowledge(pending)
    }

    fn retain(&mut self, pending: PendingBatch) -> Result<(), HandoffError> {
        match pending.origin {
            BatchOrigin::Memory => {
                let path = self.spill.write(&pending.batch)?;
                log::warn!("⚠️  Spilled rejected batch to {}", path.display());
                self.files.hold(path);
                Ok(())
            }
            BatchOrigin::File(_) => self.files.retain(pending),
        }
    }

    fn pending(&self) -> usize {
        self.rx.len() + self.files.pending()
    }

    fn retained(&self) -> usize {
        self.files.retained()
    }

    fn backend_type(&self) -> &'static str {
        "Channel"
    }
}

/// One sink per worker plus the importer's source
pub struct Handoff {
    pub sinks: Vec<Box<dyn StagingSink>>,
    pub source: Box<dyn StagingSource>,
}

pub fn build_handoff(
    backend: HandoffBackend,
    dir: impl AsRef<Path>,
    workers: usize,
    channel_capacity: usize,
    poll_interval: Duration,
) -> Result<Handoff, HandoffError> {
    let dir = dir.as_ref();
    match backend {
        HandoffBackend::File => {
            let sinks = (0..workers)
                .map(|index| {
                    FileStagingSink::for_worker(dir, index).map(|s| Box::new(s) as Box<dyn StagingSink>)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let source = FileStagingSource::new(dir, poll_interval)?;
            Ok(Handoff {
                sinks,
                source: Box::new(source),
            })
        }
        HandoffBackend::Channel => {
            let (tx, rx) = mpsc::channel(channel_capacity.max(1));
            let sinks = (0..workers)
                .map(|_| Box::new(ChannelStagingSink { tx: tx.clone() }) as Box<dyn StagingSink>)
                .collect();
            let source = ChannelStagingSource::new(rx, dir, poll_interval)?;
            Ok(Handoff {
                sinks,
                source: Box::new(source),
            })
        }
    }
}
