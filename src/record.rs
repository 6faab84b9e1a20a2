use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ::time::{format_description::well_known, OffsetDateTime};

use crate::error::StoreError;
use crate::store::{ResultMap, ScanSink};
use crate::types::ScanRecord;

/// Header of the full-scan log.
pub const LOG_HEADER: [&str; 4] = ["Host IP", "Port number scanned", "Timestamp", "Y/N response"];

/// Append-only CSV log with one row per probe attempt.
pub struct ScanLog<W: Write> {
    wtr: csv::Writer<W>,
    path: PathBuf,
    rows: u64,
}

impl ScanLog<File> {
    /// Open `path` for appending, writing the header if the file is new or empty.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        let empty = file
            .metadata()
            .map_err(|e| StoreError::io(path, e))?
            .len()
            == 0;
        let mut log = ScanLog::from_writer(file, empty)?;
        log.path = path.to_path_buf();
        Ok(log)
    }
}

impl<W: Write> ScanLog<W> {
    pub fn from_writer(w: W, write_header: bool) -> Result<Self, StoreError> {
        let mut wtr = csv::Writer::from_writer(w);
        if write_header {
            wtr.write_record(LOG_HEADER)
                .map_err(|e| StoreError::csv("<log>", e))?;
        }
        Ok(Self {
            wtr,
            path: PathBuf::from("<log>"),
            rows: 0,
        })
    }

    pub fn write(&mut self, rec: &ScanRecord) -> Result<(), StoreError> {
        let port = rec.port.to_string();
        self.wtr
            .write_record([
                rec.target.as_str(),
                port.as_str(),
                rec.timestamp.as_str(),
                rec.response.as_str(),
            ])
            .map_err(|e| StoreError::csv(&self.path, e))?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.wtr.flush().map_err(|e| StoreError::io(&self.path, e))
    }

    /// Rows written by this handle (the header excluded).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> Result<W, StoreError> {
        let path = self.path;
        self.wtr
            .into_inner()
            .map_err(|e| StoreError::io(path, e.into_error()))
    }
}

impl<W: Write + Send> ScanSink for ScanLog<W> {
    fn record(&mut self, record: &ScanRecord) -> Result<(), StoreError> {
        self.write(record)
    }

    // The log has no map to persist; a checkpoint just pushes buffered rows out.
    fn checkpoint(&mut self, _map: &ResultMap) -> Result<(), StoreError> {
        self.flush()
    }
}

/// RFC 3339 UTC timestamp for log rows.
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
