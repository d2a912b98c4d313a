//! Writes a dump of the process state for a [`CapturedException`] into a
//! uniquely named file.
//!
//! Files are named `{plugin}-v{version}-{YYYY.MM.DD-HH.MM.SS}.dmp` and are
//! always created new, so two dumps in the same second for the same plugin
//! means the second one fails rather than overwriting the first.

mod errors;
mod minidump;
mod referenced;

pub use errors::Error;
pub use minidump::MinidumpBackend;

use chrono::{DateTime, Local};
use fault_bridge::CapturedException;
use std::{fs::File, path::PathBuf};

/// Where dumps are written, and what they are named after
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpConfig {
    pub directory: PathBuf,
    pub plugin_name: String,
    pub plugin_version: String,
}

impl DumpConfig {
    pub fn new(
        directory: impl Into<PathBuf>,
        plugin_name: impl Into<String>,
        plugin_version: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            plugin_name: plugin_name.into(),
            plugin_version: plugin_version.into(),
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// The name of a dump written at `time`
    pub fn file_name(&self, time: &DateTime<Local>) -> String {
        format!(
            "{}-v{}-{}.dmp",
            self.plugin_name,
            self.plugin_version,
            time.format("%Y.%m.%d-%H.%M.%S")
        )
    }
}

/// Serializes the process state into an already opened file
pub trait DumpBackend: Send + Sync {
    fn write_dump(&self, file: &mut File, exception: &CapturedException) -> Result<(), Error>;
}

pub struct CrashDumper {
    config: DumpConfig,
    backend: Box<dyn DumpBackend>,
}

impl CrashDumper {
    pub fn new(config: DumpConfig, backend: Box<dyn DumpBackend>) -> Self {
        Self { config, backend }
    }

    /// Creates a dumper that writes minidumps
    pub fn minidump(config: DumpConfig) -> Self {
        Self::new(config, Box::new(MinidumpBackend::new()))
    }

    #[inline]
    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    /// Writes a dump for `exception`, named after the current local time.
    pub fn write(&self, exception: &CapturedException) -> Result<PathBuf, Error> {
        self.write_at(exception, Local::now())
    }

    /// Writes a dump for `exception`, named after `time`.
    ///
    /// Fails with [`std::io::ErrorKind::AlreadyExists`] if a dump with the same
    /// name exists. A file that the backend failed to fill is removed.
    pub fn write_at(
        &self,
        exception: &CapturedException,
        time: DateTime<Local>,
    ) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(&self.config.directory)?;

        let path = self.config.directory.join(self.config.file_name(&time));

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        if let Err(err) = self.backend.write_dump(&mut file, exception) {
            drop(file);
            if let Err(rm_err) = std::fs::remove_file(&path) {
                log::warn!("failed to remove incomplete dump {}: {rm_err}", path.display());
            }
            return Err(err);
        }

        log::debug!("wrote dump for '{exception}' to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn names_files() {
        let config = DumpConfig::new("/tmp/dumps", "overlay", "1.4.0");
        let time = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();

        assert_eq!(config.file_name(&time), "overlay-v1.4.0-2024.03.09-07.05.01.dmp");

        let later = Local.with_ymd_and_hms(2024, 11, 29, 23, 59, 59).unwrap();
        assert_eq!(config.file_name(&later), "overlay-v1.4.0-2024.11.29-23.59.59.dmp");
    }
}
