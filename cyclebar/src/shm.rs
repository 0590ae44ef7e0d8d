use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::{self, NonNull};

use crate::state::SharedState;

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_SHARED | libc::MAP_POPULATE;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_SHARED;

/// Device and inode of a backing file, used to check that a path still
/// names the barrier this process mapped.
pub(crate) type FileId = (u64, u64);

pub(crate) fn file_id_of(path: &Path) -> io::Result<FileId> {
    let meta = fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

/// A file-backed `MAP_SHARED` mapping holding one [`SharedState`].
///
/// The descriptor is closed right after mapping; the mapping keeps the
/// memory alive until it is unmapped on drop.
pub(crate) struct SharedRegion {
    ptr: NonNull<SharedState>,
    file_id: FileId,
}

// The region only exposes `SharedState`, whose mutable parts are guarded by
// a process-shared mutex or are atomics.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates `path` (which must not exist), sizes it and maps it. The new
    /// memory is zero-filled.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.set_len(SharedState::SIZE as u64)?;
        Self::map(&file)
    }

    /// Maps an existing file. Fails with `NotFound` when `path` is absent and
    /// with `InvalidData` when it is too small to hold a barrier.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < SharedState::SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} bytes, need {}", len, SharedState::SIZE),
            ));
        }
        Self::map(&file)
    }

    fn map(file: &File) -> io::Result<Self> {
        let meta = file.metadata()?;
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SharedState::SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                std::os::unix::io::AsRawFd::as_raw_fd(file),
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(p as *mut SharedState)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self {
            ptr,
            file_id: (meta.dev(), meta.ino()),
        })
    }

    pub fn state(&self) -> &SharedState {
        unsafe { self.ptr.as_ref() }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, SharedState::SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_open_same_memory() {
        let temp_dir = tempfile::Builder::new()
            .prefix("shm_region_test")
            .tempdir()
            .unwrap();
        let path = temp_dir.path().join("region");

        let created = SharedRegion::create(&path).unwrap();
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            SharedState::SIZE as u64
        );
        assert!(created.state().validate().is_err());

        let opened = SharedRegion::open(&path).unwrap();
        assert_eq!(created.file_id(), opened.file_id());
        assert_eq!(file_id_of(&path).unwrap(), created.file_id());

        // second create on the same path must not clobber it
        let err = SharedRegion::create(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_open_rejects_missing_and_short_files() {
        let temp_dir = tempfile::Builder::new()
            .prefix("shm_region_test")
            .tempdir()
            .unwrap();
        let missing = temp_dir.path().join("missing");
        assert_eq!(
            SharedRegion::open(&missing).err().unwrap().kind(),
            io::ErrorKind::NotFound
        );

        let short = temp_dir.path().join("short");
        fs::write(&short, b"not a barrier").unwrap();
        assert_eq!(
            SharedRegion::open(&short).err().unwrap().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
