use std::path::{Path, PathBuf};

use fq_common::{FqError, Result};
use tracing::warn;

use crate::record::FireRecord;

/// AND-composed predicate applied while loading a partition.
#[derive(Debug, Clone)]
pub struct LoadFilter {
    /// Keep only this pollutant tag when set.
    pub pollutant: Option<String>,
    /// Minimum latitude, inclusive.
    pub lat_min: f64,
    /// Maximum latitude, inclusive.
    pub lat_max: f64,
    /// Minimum longitude, inclusive.
    pub lon_min: f64,
    /// Maximum longitude, inclusive.
    pub lon_max: f64,
    /// Truncate the result to this many records when positive.
    pub max_records: i32,
}

impl Default for LoadFilter {
    fn default() -> Self {
        Self {
            pollutant: None,
            lat_min: -90.0,
            lat_max: 90.0,
            lon_min: -180.0,
            lon_max: 180.0,
            max_records: -1,
        }
    }
}

impl LoadFilter {
    fn matches(&self, record: &FireRecord) -> bool {
        if let Some(pollutant) = &self.pollutant {
            if !pollutant.is_empty() && record.pollutant != *pollutant {
                return false;
            }
        }
        record.latitude >= self.lat_min
            && record.latitude <= self.lat_max
            && record.longitude >= self.lon_min
            && record.longitude <= self.lon_max
    }

    fn is_full(&self, loaded: usize) -> bool {
        self.max_records > 0 && loaded >= self.max_records as usize
    }
}

/// Reads date-partitioned CSV files under a single data root.
///
/// Layout: `<root>/<YYYYMMDD>/*.csv`, headerless rows in [`FireRecord`]
/// field order. Missing date directories and malformed rows are skipped
/// with a warning; only a missing root is an error.
#[derive(Debug, Clone)]
pub struct FireDataLoader {
    data_path: PathBuf,
}

impl FireDataLoader {
    /// Binds the loader to a data root, verifying it exists.
    pub fn new(data_path: impl Into<PathBuf>) -> Result<FireDataLoader> {
        let data_path = data_path.into();
        if !data_path.is_dir() {
            return Err(FqError::Data(format!(
                "data path does not exist: {}",
                data_path.display()
            )));
        }
        Ok(FireDataLoader { data_path })
    }

    /// Loads all records for the given dates matching `filter`.
    ///
    /// The sequence is finite and non-restartable; when
    /// `filter.max_records > 0` the result is truncated to that length.
    pub fn load(&self, dates: &[String], filter: &LoadFilter) -> Result<Vec<FireRecord>> {
        let mut results = Vec::new();

        for date in dates {
            let date_dir = self.data_path.join(date);
            if !date_dir.is_dir() {
                warn!(date = %date, dir = %date_dir.display(), "date directory not found, skipping");
                continue;
            }

            let mut csv_files = csv_files_in(&date_dir)?;
            csv_files.sort();
            for csv_path in csv_files {
                self.load_csv(&csv_path, filter, &mut results);
                if filter.is_full(results.len()) {
                    results.truncate(filter.max_records as usize);
                    return Ok(results);
                }
            }
        }

        Ok(results)
    }

    /// Date directories present under the data root, sorted.
    pub fn available_dates(&self) -> Result<Vec<String>> {
        let mut dates = Vec::new();
        for entry in std::fs::read_dir(&self.data_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dates.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        dates.sort();
        Ok(dates)
    }

    fn load_csv(&self, path: &Path, filter: &LoadFilter, results: &mut Vec<FireRecord>) {
        let mut reader = match csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(false)
            .from_path(path)
        {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open CSV, skipping");
                return;
            }
        };

        for row in reader.deserialize::<FireRecord>() {
            if filter.is_full(results.len()) {
                return;
            }
            match row {
                Ok(record) => {
                    if filter.matches(&record) {
                        results.push(record);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed row");
                }
            }
        }
    }
}

fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "csv") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Splits records into ordered chunks of `chunk_size` (last may be short).
pub fn chunk_records(records: Vec<FireRecord>, chunk_size: usize) -> Vec<Vec<FireRecord>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(records.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size.min(records.len()));
    for record in records {
        current.push(record);
        if current.len() == chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
