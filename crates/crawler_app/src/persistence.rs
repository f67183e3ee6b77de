use std::fs;
use std::path::{Path, PathBuf};

use crawler_engine::{AtomicFileWriter, FailedImageRecord};
use engine_logging::{engine_error, engine_info, engine_warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedState {
    /// RFC 3339 time of the last save.
    #[serde(default)]
    saved_at: Option<String>,
    failed: Vec<FailedImageRecord>,
}

/// Failed-image records from an earlier run. Missing or unreadable files yield none.
pub fn load_failed_images(path: &Path) -> Vec<FailedImageRecord> {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Vec::new();
        }
        Err(err) => {
            engine_warn!("Failed to read failed images from {:?}: {}", path, err);
            return Vec::new();
        }
    };

    let state: PersistedState = match ron::from_str(&content) {
        Ok(state) => state,
        Err(err) => {
            engine_warn!("Failed to parse failed images from {:?}: {}", path, err);
            return Vec::new();
        }
    };

    engine_info!(
        "Loaded {} failed images from {:?}",
        state.failed.len(),
        path
    );
    state.failed
}

pub fn save_failed_images(path: &Path, records: &[FailedImageRecord]) -> bool {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
        engine_error!("Invalid failed images path {:?}", path);
        return false;
    };

    let mut failed = records.to_vec();
    failed.sort_by_key(|record| (record.task_id.clone(), record.order, record.id));
    let state = PersistedState {
        saved_at: Some(chrono::Local::now().to_rfc3339()),
        failed,
    };

    let pretty = ron::ser::PrettyConfig::new();
    let content = match ron::ser::to_string_pretty(&state, pretty) {
        Ok(text) => text,
        Err(err) => {
            engine_error!("Failed to serialize failed images: {}", err);
            return false;
        }
    };

    let writer = AtomicFileWriter::new(dir);
    match writer.write(filename, &content) {
        Ok(_) => true,
        Err(err) => {
            engine_error!("Failed to write failed images to {:?}: {}", path, err);
            false
        }
    }
}
