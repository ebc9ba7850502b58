//! Output file naming

use super::state::{PipelineConfig, RecorderSettings};
use crate::utils::error::RecorderResult;
use chrono::{DateTime, Local};
use std::path::PathBuf;

/// `VID_<yyyyMMdd_HHmmss>.<ext>`
pub fn timestamped_file_name(at: DateTime<Local>, extension: &str) -> String {
    format!("VID_{}.{}", at.format("%Y%m%d_%H%M%S"), extension)
}

/// Pick the output path for a recording, creating its parent directory.
///
/// An explicit path in the config wins; otherwise a timestamped name inside
/// the settings' output directory.
pub fn resolve_output_path(
    config: &PipelineConfig,
    settings: &RecorderSettings,
    extension: &str,
) -> RecorderResult<PathBuf> {
    let path = match &config.output_path {
        Some(path) => path.clone(),
        None => settings
            .output_dir
            .join(timestamped_file_name(Local::now(), extension)),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}
