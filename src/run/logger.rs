//! Scoped per-instance log file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

/// Append-only log for one instance's evaluation, flushed on drop.
///
/// Logging must never abort an evaluation, so write failures are reported
/// through `tracing` and swallowed.
pub struct FileLogger {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl FileLogger {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped entry.
    pub fn log(&mut self, message: impl AsRef<str>) {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if let Err(e) = writeln!(self.writer, "{stamp} {}", message.as_ref()) {
            warn!(path = %self.path.display(), "failed to write instance log: {e}");
        }
    }
}

impl Drop for FileLogger {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), "failed to flush instance log: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_creates_parents_and_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model/instance/run_instance.log");

        {
            let mut logger = FileLogger::create(&path).unwrap();
            logger.log("container created");
            logger.log("patch applied");
        }

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("container created"));
        assert!(contents.contains("patch applied"));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_logger_appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_instance.log");

        FileLogger::create(&path).unwrap().log("first");
        FileLogger::create(&path).unwrap().log("second");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }
}
