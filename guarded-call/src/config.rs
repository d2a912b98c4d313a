use stack_symbols::WalkOptions;
use std::path::PathBuf;

/// Configuration of a [`crate::GuardedCall`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardConfig {
    /// Name of the plugin, used in dump file names
    pub plugin_name: String,
    pub plugin_version: String,
    /// Where crash dumps are written
    pub dump_directory: PathBuf,
    /// Whether a crash dump is written for every contained fault
    pub write_dumps: bool,
    /// Searched for separate debug information before anything else
    pub symbol_path: Option<PathBuf>,
    pub walk: WalkOptions,
}

impl GuardConfig {
    pub fn new(plugin_name: impl Into<String>, plugin_version: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            plugin_version: plugin_version.into(),
            dump_directory: std::env::temp_dir().join("crash-dumps"),
            write_dumps: true,
            symbol_path: None,
            walk: WalkOptions::default(),
        }
    }

    pub fn with_dump_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_directory = dir.into();
        self
    }

    pub fn with_dumps(mut self, write_dumps: bool) -> Self {
        self.write_dumps = write_dumps;
        self
    }

    pub fn with_symbol_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.symbol_path = Some(path.into());
        self
    }

    pub fn with_walk_options(mut self, walk: WalkOptions) -> Self {
        self.walk = walk;
        self
    }
}
