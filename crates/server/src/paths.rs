//! Central path resolution for all Cowork data files.
//!
//! Resolved once at startup from: CLI `--data-dir` (or `COWORK_DATA_DIR`) > `~/.cowork`.
//! Callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub const LOG_FILE: &'static str = "server.log";

    /// Priority: `explicit` arg > `~/.cowork` default.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = match explicit {
            Some(p) => p.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("HOME directory not found; pass --data-dir"))?
                .join(".cowork"),
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("cowork.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir().join(Self::LOG_FILE)
    }

    /// Saved settings overrides.
    pub fn settings_path(&self) -> PathBuf {
        self.root.join("cowork-settings.json")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

/// The Claude Code config directory (`~/.claude`), if a home directory exists.
pub fn claude_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::resolve(Some(dir.path())).expect("resolve");
        assert_eq!(paths.root(), dir.path());
        assert_eq!(paths.db_path(), dir.path().join("cowork.db"));
        assert_eq!(
            paths.settings_path(),
            dir.path().join("cowork-settings.json")
        );
    }

    #[test]
    fn ensure_dirs_creates_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DataPaths::resolve(Some(&dir.path().join("nested"))).expect("resolve");
        paths.ensure_dirs().expect("ensure dirs");
        assert!(paths.log_dir().is_dir());
        assert_eq!(paths.log_path(), paths.log_dir().join("server.log"));
    }
}
