//! CSV telemetry log

use parking_lot::Mutex;
use portguard_core::{EventLog, EventLogError, StatsRecord};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only CSV file, one row per sample
pub struct CsvEventLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CsvEventLog {
    /// Open for appending, creating the file and its directory as needed.
    /// The header is written only when the file is new or empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{}", StatsRecord::csv_header())?;
            writer.flush()?;
        }

        tracing::info!(path = %path.display(), new = is_new, "telemetry log opened");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// Log file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLog for CsvEventLog {
    fn append(&self, records: &[StatsRecord]) -> Result<(), EventLogError> {
        let mut writer = self.writer.lock();
        for record in records {
            writeln!(writer, "{}", record.to_csv_row())?;
        }
        writer.flush()?;
        Ok(())
    }
}
