//! On-disk layout under the hub's data directory.
//!
//! ```text
//! <root>/tables/<ns>/<path>.db      per-table sqlite store
//! <root>/registry/<ns>/<path>.bin   one blob per registry
//! <root>/security/tokens.sqlite     app token store
//! <root>/permissions/permissions.db granted permission sets
//! <root>/assets/...                 files served by /asset
//! ```

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Directories {
    root: PathBuf,
}

impl Directories {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Default root under the platform data directory.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("apphub")
    }

    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.tables(),
            self.registry(),
            self.security(),
            self.permissions(),
            self.assets(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tables(&self) -> PathBuf {
        self.root.join("tables")
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn security(&self) -> PathBuf {
        self.root.join("security")
    }

    pub fn permissions(&self) -> PathBuf {
        self.root.join("permissions")
    }

    pub fn assets(&self) -> PathBuf {
        self.root.join("assets")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_the_full_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = Directories::new(tmp.path().join("data"));
        dirs.ensure().unwrap();
        assert!(dirs.tables().is_dir());
        assert!(dirs.registry().is_dir());
        assert!(dirs.security().is_dir());
        assert!(dirs.permissions().is_dir());
        assert!(dirs.assets().is_dir());
    }
}
