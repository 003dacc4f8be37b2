use std::path::{Path, PathBuf};

use tracing::info;

use crate::scan_types::{ExamSlot, WatchError};

/// Default snapshot file name.
pub const SNAPSHOT_FILE: &str = "places_disponibles.json";

/// Writes the latest scan's available slots to a JSON file.
///
/// The file is a plain array of slots, overwritten wholesale; cycles that
/// find nothing leave the previous snapshot in place.
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    /// Create a writer persisting into `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SNAPSHOT_FILE),
        }
    }

    /// Overwrite the snapshot with the given slots.
    pub async fn write(&self, slots: &[ExamSlot]) -> Result<(), WatchError> {
        let json = serde_json::to_vec_pretty(slots)
            .map_err(|e| WatchError::DataFormat(format!("Snapshot not serializable: {}", e)))?;
        tokio::fs::write(&self.path, json).await?;

        info!(
            "Snapshot written: {} slot(s) at {}",
            slots.len(),
            self.path.display()
        );
        Ok(())
    }
}
