use super::{Sink, SinkError};
use crate::reading::{Field, Reading};
use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LEADING_COLUMNS: [&str; 5] = ["ts", "ts_iso", "topic", "device_type", "device_id"];
const TRAILING_COLUMN: &str = "raw_payload";

/// Fixed column order: identity columns, every canonical field, raw payload.
pub fn header() -> Vec<&'static str> {
    let mut columns = Vec::with_capacity(LEADING_COLUMNS.len() + Field::ALL.len() + 1);
    columns.extend_from_slice(&LEADING_COLUMNS);
    columns.extend(Field::ALL.iter().map(|field| field.name()));
    columns.push(TRAILING_COLUMN);
    columns
}

fn row(reading: &Reading) -> Vec<String> {
    let mut record = Vec::with_capacity(LEADING_COLUMNS.len() + Field::ALL.len() + 1);
    record.push(reading.received_at_ms.to_string());
    record.push(reading.received_at_iso.clone());
    record.push(reading.topic.clone());
    record.push(reading.device_type.clone());
    record.push(reading.device_id.clone());
    for field in Field::ALL {
        record.push(
            reading
                .field(field)
                .map(|value| value.to_string())
                .unwrap_or_default(),
        );
    }
    record.push(reading.raw_payload.clone());
    record
}

/// Append-only CSV file. The handle stays open; every row is flushed before
/// `append` returns.
pub struct TabularSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl TabularSink {
    /// Creates the file with a header row if it is missing or empty. An
    /// existing file is never truncated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let existing_len = file.metadata()?.len();
        if existing_len > 0 && !ends_with_newline(&path)? {
            file.write_all(b"\n")?;
            tracing::warn!(path=%path.display(), "existing CSV output ended mid-line; terminated it");
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if existing_len == 0 {
            writer.write_record(header())?;
            writer.flush()?;
            tracing::info!(path=%path.display(), "created CSV output with header");
        } else {
            warn_on_header_drift(&path);
            tracing::info!(path=%path.display(), bytes = existing_len, "appending to existing CSV output");
        }

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn warn_on_header_drift(path: &Path) {
    let mut reader = match csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
    {
        Ok(reader) => reader,
        Err(err) => {
            tracing::warn!(path=%path.display(), error=%err, "could not read existing CSV header");
            return;
        }
    };
    let Some(Ok(existing)) = reader.records().next() else {
        return;
    };
    let expected = header();
    if existing.iter().ne(expected.iter().copied()) {
        tracing::warn!(
            path=%path.display(),
            existing_columns = existing.len(),
            expected_columns = expected.len(),
            "existing CSV header differs from current schema; rows will use the current column order"
        );
    }
}

#[async_trait]
impl Sink for TabularSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn append(&self, reading: &Reading) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        writer.write_record(row(reading))?;
        writer.flush()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        writer.flush()?;
        Ok(())
    }
}
