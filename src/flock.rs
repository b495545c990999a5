use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An advisory exclusive lock on a file, used to guarantee single-process
/// access to a database directory. The lock file records the owning process
/// id for debugging. The OS releases the lock when the file handle is
/// dropped, so a crashed process never leaves the directory locked.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and acquires an exclusive lock,
    /// failing immediately if another process holds it.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; allow the open.
        Ok(())
    }

    /// Releases the lock. The lock file itself is left in place to avoid
    /// unlink races with a concurrent opener.
    pub fn unlock(self) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_records_pid() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("emberdb.lock");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");

        assert!(lock_path.exists());
        let content = std::fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));

        lock.unlock().expect("Failed to release lock");
    }

    #[test]
    fn test_second_lock_fails() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("emberdb.lock");

        let _first = FileLock::lock(&lock_path).expect("Failed to acquire first lock");
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[test]
    fn test_reacquire_after_drop() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("emberdb.lock");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        }

        // Dropping the handle released the lock even though the file remains.
        let _again = FileLock::lock(&lock_path).expect("Failed to reacquire lock");
    }
}
