//! Crash-safe single-file store.
//!
//! Every durable write the agent makes goes through [`DiskStore::save`]:
//! create `<target>.tmp` → write → fsync → rename onto `<target>` → chmod.
//! A reader of `<target>` sees either the complete old content or the complete
//! new content, including right after a crash. A `.tmp` sibling may survive a
//! crash; the next save truncates and reuses it.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::StorageError;

/// Unencrypted store for one file on disk.
///
/// The store knows nothing about what it holds. Two saves to the same target
/// must be serialised by the owner of that target; saves to different targets
/// are independent.
#[derive(Debug, Clone)]
pub struct DiskStore {
    target: PathBuf,
    mode: u32,
}

impl DiskStore {
    /// Create a store for `target`, whose permission bits are kept at `mode`.
    pub fn new(target: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            target: target.into(),
            mode,
        }
    }

    /// The file this store manages.
    pub fn path(&self) -> &Path {
        &self.target
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.target.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Whether a regular file is present at the target.
    ///
    /// Absence is `Ok(false)`; anything else that prevents the check is an error.
    pub fn exists(&self) -> Result<bool, StorageError> {
        match fs::metadata(&self.target) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::fs("could not stat", &self.target, e)),
        }
    }

    /// Remove the target file. Removing a file that is already gone succeeds.
    pub fn delete(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::fs("could not delete", &self.target, e)),
        }
    }

    /// Atomically replace the target with everything read from `content`.
    ///
    /// On failure before the rename the target still holds its previous
    /// content. A failure while re-applying permissions happens after the
    /// rename, so the target already holds the new content.
    pub fn save<R: Read>(&self, mut content: R) -> Result<(), StorageError> {
        let tmp = self.tmp_path();

        if let Some(parent) = self.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::fs("could not create directory", parent, e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.mode)
            .open(&tmp)
            .map_err(|e| StorageError::fs("could not save to", &tmp, e))?;

        // Removes the temp file on every exit path, including after the rename
        // when there is nothing left to remove.
        let _cleanup = RemoveOnDrop(&tmp);

        let written = io::copy(&mut content, &mut file)
            .map_err(|e| StorageError::fs("could not save content on disk", &tmp, e))?;

        file.sync_all()
            .map_err(|e| StorageError::fs("could not sync temporary file", &tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.target)
            .map_err(|e| StorageError::fs("could not replace target file", &self.target, e))?;

        // rename does not carry permissions over reliably, so set them again.
        fs::set_permissions(&self.target, Permissions::from_mode(self.mode)).map_err(|e| {
            StorageError::fs("could not set permissions on target file", &self.target, e)
        })?;

        sync_parent_dir(&self.target);

        debug!(
            path = %self.target.display(),
            bytes = written,
            "Saved file atomically"
        );

        Ok(())
    }

    /// Open the target for reading.
    ///
    /// A missing target is created empty with the configured mode first, so
    /// loading before anything was ever saved yields an empty stream. The
    /// returned handle closes when dropped.
    pub fn load(&self) -> Result<File, StorageError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(self.mode)
            .open(&self.target)
        {
            Ok(_) => {
                fs::set_permissions(&self.target, Permissions::from_mode(self.mode))
                    .map_err(|e| StorageError::fs("could not set permissions on", &self.target, e))?;
                debug!(path = %self.target.display(), "Created empty store file");
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(StorageError::fs("could not create", &self.target, e)),
        }

        File::open(&self.target).map_err(|e| StorageError::fs("could not open", &self.target, e))
    }
}

struct RemoveOnDrop<'a>(&'a Path);

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.0);
    }
}

/// Make the rename itself durable. Best effort: not every filesystem allows
/// opening or syncing a directory.
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!(path = %parent.display(), error = %e, "Could not sync parent directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn read_all(store: &DiskStore) -> String {
        let mut out = String::new();
        store.load().unwrap().read_to_string(&mut out).unwrap();
        out
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    /// Reader that yields some bytes and then fails, like a broken pipe
    /// halfway through serialisation.
    struct FailingReader {
        sent: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::other("source went away"));
            }
            self.sent = true;
            let chunk = b"partial";
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("state.json"), 0o600);

        store.save(Cursor::new("hello")).unwrap();

        assert_eq!(read_all(&store), "hello");
        assert_eq!(mode_of(store.path()), 0o600);
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_first_load_creates_empty_file() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("nested").join("state.json"), 0o600);
        fs::create_dir_all(dir.path().join("nested")).unwrap();

        assert!(!store.exists().unwrap());
        assert_eq!(read_all(&store), "");
        assert!(store.exists().unwrap());
        assert_eq!(mode_of(store.path()), 0o600);
    }

    #[test]
    fn test_save_overwrites_stale_tmp() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("state.json"), 0o600);
        fs::write(store.tmp_path(), "leftover from a crash, much longer than new content").unwrap();

        store.save(Cursor::new("first")).unwrap();
        fs::write(store.tmp_path(), "another leftover").unwrap();
        store.save(Cursor::new("second")).unwrap();

        assert_eq!(read_all(&store), "second");
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_crash_before_rename_keeps_old_content() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("state.json"), 0o600);
        store.save(Cursor::new("old")).unwrap();

        // Temp file written and synced, process died before the rename.
        fs::write(store.tmp_path(), "new but never renamed").unwrap();

        assert_eq!(read_all(&store), "old");
    }

    #[test]
    fn test_crash_after_rename_before_chmod() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("state.json"), 0o600);
        store.save(Cursor::new("old")).unwrap();

        fs::write(store.tmp_path(), "new").unwrap();
        fs::set_permissions(store.tmp_path(), Permissions::from_mode(0o644)).unwrap();
        fs::rename(store.tmp_path(), store.path()).unwrap();

        assert_eq!(read_all(&store), "new");

        store.save(Cursor::new("newer")).unwrap();
        assert_eq!(mode_of(store.path()), 0o600);
    }

    #[test]
    fn test_failed_write_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("state.json"), 0o600);
        store.save(Cursor::new("old")).unwrap();

        let err = store.save(FailingReader { sent: false }).unwrap_err();

        assert_eq!(err.path(), Some(store.tmp_path().as_path()));
        assert_eq!(read_all(&store), "old");
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_failed_rename_reports_target_and_cleans_tmp() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("state.json");
        // A non-empty directory cannot be replaced by a file.
        fs::create_dir(&target).unwrap();
        fs::write(target.join("occupied"), "x").unwrap();
        let store = DiskStore::new(&target, 0o600);

        let err = store.save(Cursor::new("content")).unwrap_err();

        assert!(matches!(
            err,
            StorageError::Filesystem { context: "could not replace target file", .. }
        ));
        assert_eq!(err.path(), Some(target.as_path()));
        assert!(!store.tmp_path().exists());
        assert!(!store.exists().unwrap());
    }

    #[rstest]
    #[case(0o600)]
    #[case(0o400)]
    fn test_mode_reapplied_over_existing_file(#[case] mode: u32) {
        let dir = tempdir().unwrap();
        let target = dir.path().join("state.json");
        fs::write(&target, "old").unwrap();
        fs::set_permissions(&target, Permissions::from_mode(0o644)).unwrap();

        DiskStore::new(&target, mode).save(Cursor::new("new")).unwrap();

        assert_eq!(mode_of(&target), mode);
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path().join("state.json"), 0o600);

        store.delete().unwrap();

        store.save(Cursor::new("x")).unwrap();
        assert!(store.exists().unwrap());
        store.delete().unwrap();
        assert!(!store.exists().unwrap());
    }

    #[test]
    fn test_exists_is_false_for_directory() {
        let dir = tempdir().unwrap();
        let store = DiskStore::new(dir.path(), 0o600);
        assert!(!store.exists().unwrap());
    }
}
