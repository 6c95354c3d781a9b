use std::collections::HashSet;
use std::fs::{self, Metadata};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use crate::error::InitError;

/// De-duplication key for one file arrival
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchedFile {
    pub file_name: String,
    pub modified: SystemTime,
    pub size_bytes: u64,
}

impl WatchedFile {
    pub fn from_metadata(file_name: impl Into<String>, metadata: &Metadata) -> Self {
        Self {
            file_name: file_name.into(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size_bytes: metadata.len(),
        }
    }

    /// Identity of the regular file at `path`, if there is one
    pub fn probe(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_string_lossy();
        let metadata = fs::metadata(path).ok()?;
        metadata
            .is_file()
            .then(|| Self::from_metadata(file_name.into_owned(), &metadata))
    }
}

/// Every identity handled during the process lifetime, plus the names of
/// files that were present before watching started
#[derive(Debug, Default)]
pub struct SeenFiles {
    preexisting: HashSet<String>,
    handled: HashSet<WatchedFile>,
}

impl SeenFiles {
    pub fn seed(&mut self, file_name: impl Into<String>) {
        self.preexisting.insert(file_name.into());
    }

    pub fn is_preexisting(&self, file_name: &str) -> bool {
        self.preexisting.contains(file_name)
    }

    /// Record `identity`; `false` if it is preexisting or was already handled
    pub fn admit(&mut self, identity: &WatchedFile) -> bool {
        if self.is_preexisting(&identity.file_name) {
            return false;
        }
        self.handled.insert(identity.clone())
    }

    pub fn contains(&self, identity: &WatchedFile) -> bool {
        self.handled.contains(identity)
    }

    pub fn handled_count(&self) -> usize {
        self.handled.len()
    }
}

/// [`SeenFiles`] shared between the supervisor and the pipeline
#[derive(Debug, Clone, Default)]
pub struct SeenRegistry {
    inner: Arc<Mutex<SeenFiles>>,
}

impl SeenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SeenFiles> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit(&self, identity: &WatchedFile) -> bool {
        self.lock().admit(identity)
    }

    pub fn contains(&self, identity: &WatchedFile) -> bool {
        self.lock().contains(identity)
    }

    pub fn is_preexisting(&self, file_name: &str) -> bool {
        self.lock().is_preexisting(file_name)
    }

    pub fn handled_count(&self) -> usize {
        self.lock().handled_count()
    }

    /// Record the names of regular files already in `dir`
    pub fn seed_from_dir(&self, dir: &Path) -> Result<Vec<String>, InitError> {
        let entries = fs::read_dir(dir).map_err(|source| InitError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                || entry.metadata().map(|m| m.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        let mut seen = self.lock();
        for name in &names {
            seen.seed(name.clone());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn identity(name: &str, secs: u64, size: u64) -> WatchedFile {
        WatchedFile {
            file_name: name.to_string(),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            size_bytes: size,
        }
    }

    #[test]
    fn test_identical_triples_are_admitted_once() {
        let mut seen = SeenFiles::default();
        assert!(seen.admit(&identity("a.txt", 10, 5)));
        assert!(!seen.admit(&identity("a.txt", 10, 5)));

        assert!(seen.admit(&identity("a.txt", 11, 5)));
        assert!(seen.admit(&identity("a.txt", 11, 6)));
        assert_eq!(seen.handled_count(), 3);
    }

    #[test]
    fn test_preexisting_names_are_never_admitted() {
        let mut seen = SeenFiles::default();
        seen.seed("old.txt");
        assert!(!seen.admit(&identity("old.txt", 99, 1)));
        assert!(seen.admit(&identity("new.txt", 99, 1)));
    }

    #[test]
    fn test_seed_from_dir_skips_directories() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.pdf"), "a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let registry = SeenRegistry::new();
        let names = registry.seed_from_dir(dir.path()).unwrap();

        assert_eq!(names, vec!["a.pdf", "b.txt"]);
        assert!(registry.is_preexisting("b.txt"));
        assert!(!registry.is_preexisting("sub"));
    }

    #[test]
    fn test_probe_ignores_directories_and_missing_paths() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x.log");
        fs::write(&file, "12345").unwrap();

        let probed = WatchedFile::probe(&file).unwrap();
        assert_eq!(probed.file_name, "x.log");
        assert_eq!(probed.size_bytes, 5);
        assert!(WatchedFile::probe(dir.path()).is_none());
        assert!(WatchedFile::probe(&dir.path().join("missing")).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_names_get_an_identity() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        let file = dir.path().join(OsStr::from_bytes(b"caf\xe9.txt"));
        fs::write(&file, "bonjour").unwrap();

        let probed = WatchedFile::probe(&file).unwrap();
        assert_eq!(probed.file_name, "caf\u{FFFD}.txt");
        assert_eq!(probed.size_bytes, 7);

        let registry = SeenRegistry::new();
        assert_eq!(registry.seed_from_dir(dir.path()).unwrap(), vec![probed.file_name.clone()]);
    }
}
