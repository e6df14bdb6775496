pub mod history;

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub history_db_path: PathBuf,
}

impl DbConfig {
    pub fn new(history_db_path: impl Into<PathBuf>) -> Self {
        Self {
            history_db_path: history_db_path.into(),
        }
    }

    /// Relative paths resolve against `app_root`.
    pub fn resolve(configured: &Path, app_root: &Path) -> Self {
        Self::new(select_history_db_path(configured, app_root))
    }

    pub fn history_db_path(&self) -> &Path {
        self.history_db_path.as_path()
    }
}

fn select_history_db_path(configured: &Path, app_root: &Path) -> PathBuf {
    if configured.as_os_str().is_empty() {
        return app_root.join("catalog.sqlite");
    }
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        app_root.join(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_history_path_resolves_under_app_root() {
        let cfg = DbConfig::resolve(Path::new("catalog.sqlite"), Path::new("/tmp/app"));
        assert_eq!(cfg.history_db_path(), Path::new("/tmp/app/catalog.sqlite"));
    }

    #[test]
    fn absolute_history_path_is_kept() {
        let cfg = DbConfig::resolve(Path::new("/var/db/h.sqlite"), Path::new("/tmp/app"));
        assert_eq!(cfg.history_db_path(), Path::new("/var/db/h.sqlite"));
    }

    #[test]
    fn empty_history_path_falls_back_to_default_name() {
        let cfg = DbConfig::resolve(Path::new(""), Path::new("/tmp/app"));
        assert_eq!(cfg.history_db_path(), Path::new("/tmp/app/catalog.sqlite"));
    }
}
