use buffet_shared::errors::{BuffetError, BuffetResult};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use crate::runtime::constants::filenames;

/// Directory structure constants
pub mod dirs {
    /// Base directory name for buffet data
    pub const BUFFET_DIR: &str = ".buffet";

    pub const DB_DIR: &str = "db";

    /// Boot images, `index.json` and logos
    pub const IMAGES_DIR: &str = "iso";

    /// Logo assets referenced by the catalogue
    pub const LOGOS_DIR: &str = "logos";

    /// Subdirectory for log files and traffic captures
    pub const LOGS_DIR: &str = "logs";

    /// Hypervisor and proxy stdout/stderr, under the logs directory
    pub const PROCESS_LOGS_DIR: &str = "processes";

    /// Subdirectory for QMP control sockets
    pub const RUN_DIR: &str = "run";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Paths the runtime reads and writes.
///
/// ```text
/// ~/.buffet/
/// ├── .lock
/// ├── db/buffet.db
/// ├── iso/
/// │   ├── index.json
/// │   ├── <image>.iso
/// │   └── logos/
/// ├── logs/
/// │   ├── buffet.log.<date>
/// │   ├── processes/<session>-{hypervisor,proxy}.log
/// │   └── <date>/<owner>/<time>-<image>.pcap
/// └── run/qmp-<slot>.sock
/// ```
///
/// The images and logs directories default to children of the home
/// directory but may be relocated through options.
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
    images_dir: PathBuf,
    logs_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self {
            images_dir: home_dir.join(dirs::IMAGES_DIR),
            logs_dir: home_dir.join(dirs::LOGS_DIR),
            home_dir,
        }
    }

    pub fn with_images_dir(mut self, images_dir: PathBuf) -> Self {
        self.images_dir = images_dir;
        self
    }

    pub fn with_logs_dir(mut self, logs_dir: PathBuf) -> Self {
        self.logs_dir = logs_dir;
        self
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::DB_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join(filenames::DB_FILE)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.images_dir.clone()
    }

    /// Image catalogue: ~/.buffet/iso/index.json
    pub fn catalogue_path(&self) -> PathBuf {
        self.images_dir.join(filenames::CATALOGUE_INDEX)
    }

    pub fn logos_dir(&self) -> PathBuf {
        self.images_dir.join(dirs::LOGOS_DIR)
    }

    /// Boot image file for a catalogue entry.
    pub fn image_path(&self, image_ref: &str) -> PathBuf {
        self.images_dir.join(image_ref)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir.clone()
    }

    pub fn process_logs_dir(&self) -> PathBuf {
        self.logs_dir.join(dirs::PROCESS_LOGS_DIR)
    }

    /// stdout/stderr sink for one supervised process.
    pub fn process_log(&self, session_id: &str, kind: &str) -> PathBuf {
        self.process_logs_dir()
            .join(format!("{}-{}.log", session_id, kind))
    }

    /// Per-user, per-day capture directory: ~/.buffet/logs/<date>/<owner>
    pub fn traffic_dir(&self, owner: &str, at: DateTime<Local>) -> PathBuf {
        self.logs_dir
            .join(at.format("%Y-%m-%d").to_string())
            .join(owner)
    }

    /// Packet capture file for a session started at `at`.
    pub fn traffic_log(&self, owner: &str, image_ref: &str, at: DateTime<Local>) -> PathBuf {
        self.traffic_dir(owner, at)
            .join(format!("{}-{}.pcap", at.format("%H-%M-%S"), image_ref))
    }

    /// Control sockets directory: ~/.buffet/run
    pub fn run_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::RUN_DIR)
    }

    pub fn control_socket(&self, slot: u16) -> PathBuf {
        self.run_dir().join(filenames::control_socket(slot))
    }

    /// Initialize the filesystem structure.
    ///
    /// Creates the directories and seeds an empty catalogue if none exists.
    pub fn prepare(&self) -> BuffetResult<()> {
        std::fs::create_dir_all(&self.home_dir)
            .map_err(|e| BuffetError::Storage(format!("failed to create home: {e}")))?;

        std::fs::create_dir_all(self.db_dir())
            .map_err(|e| BuffetError::Storage(format!("failed to create db dir: {e}")))?;

        std::fs::create_dir_all(self.logos_dir())
            .map_err(|e| BuffetError::Storage(format!("failed to create images dir: {e}")))?;

        std::fs::create_dir_all(self.process_logs_dir())
            .map_err(|e| BuffetError::Storage(format!("failed to create logs dir: {e}")))?;

        std::fs::create_dir_all(self.run_dir())
            .map_err(|e| BuffetError::Storage(format!("failed to create run dir: {e}")))?;

        let catalogue = self.catalogue_path();
        if !catalogue.exists() {
            std::fs::write(&catalogue, "[]").map_err(|e| {
                BuffetError::Storage(format!(
                    "failed to seed catalogue {}: {e}",
                    catalogue.display()
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_tree_and_empty_catalogue() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().to_path_buf());
        layout.prepare().unwrap();

        assert!(layout.db_dir().is_dir());
        assert!(layout.logos_dir().is_dir());
        assert!(layout.run_dir().is_dir());
        assert!(layout.process_logs_dir().is_dir());
        assert_eq!(
            std::fs::read_to_string(layout.catalogue_path()).unwrap(),
            "[]"
        );
    }

    #[test]
    fn test_prepare_keeps_existing_catalogue() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().to_path_buf());
        std::fs::create_dir_all(layout.images_dir()).unwrap();
        std::fs::write(layout.catalogue_path(), r#"[{"iso":"a.iso"}]"#).unwrap();

        layout.prepare().unwrap();

        assert!(
            std::fs::read_to_string(layout.catalogue_path())
                .unwrap()
                .contains("a.iso")
        );
    }

    #[test]
    fn test_traffic_log_is_per_day_and_owner() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/buffet"));
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        assert_eq!(
            layout.traffic_log("u1", "ubuntu.iso", at),
            PathBuf::from("/srv/buffet/logs/2024-03-09/u1/14-05-07-ubuntu.iso.pcap")
        );
    }

    #[test]
    fn test_relocated_dirs() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/buffet"))
            .with_images_dir(PathBuf::from("/data/iso"))
            .with_logs_dir(PathBuf::from("/var/log/buffet"));

        assert_eq!(layout.catalogue_path(), PathBuf::from("/data/iso/index.json"));
        assert_eq!(
            layout.control_socket(3),
            PathBuf::from("/srv/buffet/run/qmp-3.sock")
        );
        assert!(layout.process_log("01ABC", "proxy").starts_with("/var/log/buffet"));
    }
}
