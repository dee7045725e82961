//! Advisory file locking around an index directory.
//!
//! The index directory itself is swapped out by renames on every save, so
//! the lock file lives next to it: `<parent>/.<name>.lock`. Writers take the
//! lock exclusively, readers take it shared, so a load never observes a
//! half-finished swap.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

/// RAII guard over an index lock. The lock is released on drop.
pub struct IndexLockGuard {
    file: File,
}

impl IndexLockGuard {
    /// Acquire an exclusive lock, blocking while any other holder exists.
    pub fn acquire(index_path: &Path) -> Result<Self> {
        let file = open_lock_file(index_path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    /// Acquire a shared lock, blocking while an exclusive holder exists.
    pub fn acquire_shared(index_path: &Path) -> Result<Self> {
        let file = open_lock_file(index_path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }

    /// Try to acquire an exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` if the lock is currently held elsewhere.
    pub fn try_acquire(index_path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(index_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for IndexLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Path of the lock file guarding `index_path`.
pub fn lock_path(index_path: &Path) -> Result<PathBuf> {
    let name = index_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Config(format!(
                "index path '{}' has no usable directory name",
                index_path.display()
            ))
        })?;
    let parent = match index_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.join(format!(".{}.lock", name)))
}

fn open_lock_file(index_path: &Path) -> Result<File> {
    let path = lock_path(index_path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lock_file_lives_beside_index() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("corpus");

        let guard = IndexLockGuard::acquire(&index).unwrap();
        assert!(dir.path().join(".corpus.lock").exists());
        assert!(!index.exists());
        drop(guard);

        let _again = IndexLockGuard::acquire(&index).unwrap();
    }

    #[test]
    fn test_try_acquire_when_locked() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("idx");

        let guard = IndexLockGuard::acquire(&index).unwrap();
        assert!(IndexLockGuard::try_acquire(&index).unwrap().is_none());
        drop(guard);
        assert!(IndexLockGuard::try_acquire(&index).unwrap().is_some());
    }

    #[test]
    fn test_shared_locks_coexist_but_block_writers() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("idx");

        let a = IndexLockGuard::acquire_shared(&index).unwrap();
        let b = IndexLockGuard::acquire_shared(&index).unwrap();
        assert!(IndexLockGuard::try_acquire(&index).unwrap().is_none());

        drop(a);
        drop(b);
        assert!(IndexLockGuard::try_acquire(&index).unwrap().is_some());
    }

    #[test]
    fn test_exclusive_lock_serializes_threads() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("idx");

        let barrier = Arc::new(Barrier::new(2));
        let events = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..2)
            .map(|t| {
                let index = index.clone();
                let barrier = Arc::clone(&barrier);
                let events = Arc::clone(&events);
                thread::spawn(move || {
                    barrier.wait();
                    let _guard = IndexLockGuard::acquire(&index).unwrap();
                    events.lock().unwrap().push((t, "enter"));
                    thread::sleep(Duration::from_millis(30));
                    events.lock().unwrap().push((t, "leave"));
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        // Critical sections never interleave
        assert_eq!(events[0].0, events[1].0);
        assert_eq!(events[1].1, "leave");
        assert_eq!(events[2].0, events[3].0);
    }

    #[test]
    fn test_lock_path_without_parent() {
        assert_eq!(
            lock_path(Path::new("idx")).unwrap(),
            PathBuf::from(".").join(".idx.lock")
        );
    }
}
