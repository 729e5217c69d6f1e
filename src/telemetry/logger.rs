//! JSONL telemetry logger with file rotation

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::types::{decode_telemetry, TelemetryEvent};
use crate::config::TelemetryConfig;
use crate::crsf::protocol::CrsfFrame;
use crate::error::Result;
use crate::link::FrameObserver;

const FILE_PREFIX: &str = "telemetry_";
const FILE_EXTENSION: &str = "jsonl";

#[derive(Serialize)]
struct TelemetryRecord<'a> {
    timestamp: String,
    event: &'a TelemetryEvent,
}

#[derive(Default)]
struct LogFile {
    writer: Option<BufWriter<File>>,
    records: usize,
    sequence: u64,
}

/// Writes telemetry events as JSON Lines, one object per line
///
/// A new file is started after `max_records_per_file` records, and only the
/// newest `max_files_to_keep` files are kept in `log_dir`. File I/O is
/// blocking; attach it to a link through [`TelemetryLogger::spawn`].
pub struct TelemetryLogger {
    log_dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    file: LogFile,
}

impl TelemetryLogger {
    /// Create a logger writing into `config.log_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the log directory cannot be created
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        fs::create_dir_all(&config.log_dir)?;
        info!("Telemetry logging to {}", config.log_dir);

        Ok(Self {
            log_dir: PathBuf::from(&config.log_dir),
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            file: LogFile::default(),
        })
    }

    /// Append one event, rotating first if the current file is full
    ///
    /// # Errors
    ///
    /// Returns error if serialization or any file operation fails
    pub fn log_event(&mut self, event: &TelemetryEvent) -> Result<()> {
        let record = TelemetryRecord {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        let line = serde_json::to_string(&record)?;

        if self.file.writer.is_none() || self.file.records >= self.max_records_per_file {
            self.rotate()?;
        }

        if let Some(writer) = self.file.writer.as_mut() {
            writeln!(writer, "{}", line)?;
            writer.flush()?;
        }
        self.file.records += 1;

        Ok(())
    }

    /// Move the logger onto a blocking writer task
    ///
    /// Returns the [`TelemetrySink`] to register as a link observer and the
    /// writer's handle. The writer drains queued events and exits once every
    /// sink clone has been dropped.
    pub fn spawn(mut self) -> (TelemetrySink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryEvent>();

        let writer = tokio::task::spawn_blocking(move || {
            while let Some(event) = rx.blocking_recv() {
                if let Err(e) = self.log_event(&event) {
                    warn!("Failed to write telemetry: {}", e);
                }
            }
            debug!("Telemetry writer stopped");
        });

        (TelemetrySink { tx }, writer)
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.file.writer.take() {
            writer.flush()?;
        }

        self.file.sequence += 1;
        let name = format!(
            "{}{}_{:04}.{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.file.sequence,
            FILE_EXTENSION
        );
        let path = self.log_dir.join(name);

        self.file.writer = Some(BufWriter::new(File::create(&path)?));
        self.file.records = 0;
        debug!("Opened telemetry file {}", path.display());

        self.prune_old_files()
    }

    /// Delete the oldest log files beyond `max_files_to_keep`
    fn prune_old_files(&self) -> Result<()> {
        let mut files = list_log_files(&self.log_dir)?;
        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        files.sort();
        let excess = files.len() - self.max_files_to_keep;
        for path in files.into_iter().take(excess) {
            fs::remove_file(&path)?;
            debug!("Removed old telemetry file {}", path.display());
        }

        Ok(())
    }
}

/// Telemetry files in `dir`, in no particular order
fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(FILE_PREFIX))
            && path.extension().and_then(|ext| ext.to_str()) == Some(FILE_EXTENSION);
        if is_log {
            files.push(path);
        }
    }
    Ok(files)
}

/// Link observer that decodes telemetry frames and queues them for the writer
#[derive(Clone)]
pub struct TelemetrySink {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl FrameObserver for TelemetrySink {
    fn on_frame(&self, frame: &CrsfFrame) {
        match decode_telemetry(frame) {
            Ok(Some(event)) => {
                if self.tx.send(event).is_err() {
                    warn!("Telemetry writer has stopped, dropping event");
                }
            }
            Ok(None) => trace!("Ignoring frame type 0x{:02X}", frame.frame_type),
            Err(e) => warn!("Malformed telemetry frame: {}", e),
        }
    }
}
