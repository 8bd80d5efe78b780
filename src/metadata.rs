//! Per-frame timing metadata and its persistence.
//!
//! The metadata file is a CSV with header `frameNumber,timeStamp`: one row per
//! grabbed frame in frame-number order, timestamps in seconds relative to the
//! first frame with nanosecond precision.

use std::fs::{self, File};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{CameraParameters, Error, Result};

pub const HEADER: [&str; 2] = ["frameNumber", "timeStamp"];

/// Timing entry for one grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrabRecord {
    /// 1-based, assigned at grab time.
    #[serde(rename = "frameNumber")]
    pub frame_number: u64,
    /// Seconds since the first grabbed frame.
    #[serde(rename = "timeStamp")]
    pub timestamp: f64,
}

/// Persists the records of a finished session.
pub trait MetadataRecorder: Send {
    /// Write `records` and return the path of the metadata file.
    fn persist(&self, params: &CameraParameters, records: &[GrabRecord]) -> Result<PathBuf>;
}

/// Writes `metadata<stem>.csv` and a `params<stem>.toml` sidecar into the
/// camera's video folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRecorder;

impl MetadataRecorder for CsvRecorder {
    #[instrument(skip_all, fields(camera = %params.name))]
    fn persist(&self, params: &CameraParameters, records: &[GrabRecord]) -> Result<PathBuf> {
        fs::create_dir_all(&params.video_folder).map_err(|source| Error::Metadata {
            path: params.video_folder.clone(),
            source,
        })?;

        let path = params.metadata_path();
        let file = File::create(&path).map_err(|source| Error::Metadata {
            path: path.clone(),
            source,
        })?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER)?;
        for record in records {
            writer.write_record([
                record.frame_number.to_string(),
                format!("{:.9}", record.timestamp),
            ])?;
        }
        writer.flush().map_err(|source| Error::Metadata {
            path: path.clone(),
            source,
        })?;

        let params_path = params.params_path();
        fs::write(&params_path, toml::to_string(params)?).map_err(|source| Error::Metadata {
            path: params_path,
            source,
        })?;

        info!(
            "Saved metadata for {} frames from {} serial# {} to {}",
            records.len(),
            params.name,
            params.serial,
            path.display()
        );
        Ok(path)
    }
}
