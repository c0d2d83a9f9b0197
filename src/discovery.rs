use crate::constants::ENABLED_DIR_ENV;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Pick the discovery directory: an explicit setting wins, otherwise `$HEARTBEAT_ENABLED_DIR`.
pub fn resolve_enabled_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_enabled_dir_with(explicit, |k| std::env::var_os(k))
}

fn resolve_enabled_dir_with<F>(explicit: Option<&Path>, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<OsString>,
{
    match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => lookup(ENABLED_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
    }
}

/// Empty file `<dir>/<id>` whose existence tells outside tooling that a monitor is live.
/// The file is deleted on [`MarkerFile::remove`] or on drop.
#[derive(Debug)]
pub struct MarkerFile {
    path: Option<PathBuf>,
}

impl MarkerFile {
    pub fn create(dir: &Path, id: u32) -> std::io::Result<MarkerFile> {
        let path = dir.join(id.to_string());
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        tracing::debug!("Created marker file {}", path.display());
        Ok(MarkerFile { path: Some(path) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn remove(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Unable to remove marker file {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for MarkerFile {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let got = resolve_enabled_dir_with(Some(Path::new("/a")), |_| Some("/b".into()));
        assert_eq!(got, Some(PathBuf::from("/a")));
    }

    #[test]
    fn falls_back_to_env() {
        let got = resolve_enabled_dir_with(None, |k| {
            assert_eq!(k, ENABLED_DIR_ENV);
            Some("/b".into())
        });
        assert_eq!(got, Some(PathBuf::from("/b")));
        assert_eq!(resolve_enabled_dir_with(None, |_| None), None);
        assert_eq!(resolve_enabled_dir_with(None, |_| Some("".into())), None);
    }

    #[test]
    fn marker_lifecycle() {
        let dir = std::env::temp_dir();
        let id = 3_900_000_101;
        let mut m = MarkerFile::create(&dir, id).unwrap();
        let path = m.path().unwrap().to_path_buf();
        assert_eq!(path, dir.join(id.to_string()));
        assert!(path.exists());
        m.remove();
        assert!(!path.exists());
        // second remove is a no-op
        m.remove();

        let m = MarkerFile::create(&dir, id).unwrap();
        drop(m);
        assert!(!path.exists());
    }
}
