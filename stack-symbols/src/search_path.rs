use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

/// Extra directories, in the same format as `PATH`
pub const SEARCH_PATH_VAR: &str = "SYMBOL_SEARCH_PATH";
/// Alternate extra directories, searched after [`SEARCH_PATH_VAR`]
pub const ALT_SEARCH_PATH_VAR: &str = "SYMBOL_ALT_SEARCH_PATH";
/// Where distributions install separate debug information
pub const SYSTEM_DEBUG_DIR: &str = "/usr/lib/debug";

/// The ordered list of directories searched for separate debug information
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Builds the search path from the process environment
    pub fn from_env(explicit: Option<&Path>) -> Self {
        Self::build(explicit, |var| std::env::var_os(var))
    }

    /// Builds the search path, in order, from the explicit path, the current
    /// directory, the directory of the executable, the directories listed in
    /// [`SEARCH_PATH_VAR`] and [`ALT_SEARCH_PATH_VAR`], and finally
    /// [`SYSTEM_DEBUG_DIR`]. Only directories that exist are included.
    pub fn build(explicit: Option<&Path>, env: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut candidates = Vec::new();

        candidates.extend(explicit.map(Path::to_owned));
        candidates.extend(std::env::current_dir().ok());
        candidates.extend(
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_owned)),
        );

        for var in [SEARCH_PATH_VAR, ALT_SEARCH_PATH_VAR] {
            if let Some(value) = env(var) {
                candidates.extend(std::env::split_paths(&value));
            }
        }

        candidates.push(PathBuf::from(SYSTEM_DEBUG_DIR));

        Self {
            dirs: candidates.into_iter().filter(|dir| dir.is_dir()).collect(),
        }
    }

    #[inline]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl fmt::Display for SearchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dir) in self.dirs.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{}", dir.display())?;
        }

        Ok(())
    }
}
