//! Shared coordination segment: creation, attachment, locked access

use crate::block::{BLOCK_LEN, CoordinationBlock};
use crate::error::{CoordError, CoordResult};
use crate::platform::{lock_file, shm_dir, unlock_file};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

/// Backoff between attach attempts while a creator is still sizing the
/// backing file, in milliseconds
const ATTACH_RETRY_MS: u64 = 10;

/// How long a wrong-length or vanished segment file is treated as
/// mid-creation before attachment fails for good
const ATTACH_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// How a process came to hold its segment handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOrigin {
    /// This process created and initialized the segment
    Created,
    /// The segment already existed; this process attached to it
    Attached,
}

/// Outcome of a consistency-checked block read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistentRead {
    /// Stored checksum matches the block contents
    Valid(CoordinationBlock),
    /// Checksum mismatch: a writer died mid-update, or one is racing us
    Inconsistent,
}

/// Handle on the shared coordination segment.
///
/// Exactly one segment exists per application identifier on the host; every
/// cooperating process holds its own handle. All field access goes through
/// [`lock`](Self::lock), whose guard holds the cross-process advisory lock on
/// the backing file for its lifetime.
pub struct CoordinationSegment {
    name: String,
    path: PathBuf,
    file: File,
    mmap: MmapMut,
}

impl CoordinationSegment {
    /// Create the named segment, or attach to it if it already exists.
    ///
    /// The creator zero-initializes the block (valid checksum, no primary)
    /// under the lock before returning. An attacher can observe the backing
    /// file between the creator's exclusive create and its sizing of the
    /// file; such a segment is treated as mid-creation and the attach is
    /// retried within a bounded window. Fails with
    /// [`CoordError::StorageUnavailable`] only when neither creation nor
    /// attachment works; there is no fallback mode.
    pub fn open_or_create(name: &str) -> CoordResult<(Self, SegmentOrigin)> {
        Self::open_or_create_within(name, ATTACH_RETRY_WINDOW)
    }

    fn open_or_create_within(
        name: &str,
        retry_window: Duration,
    ) -> CoordResult<(Self, SegmentOrigin)> {
        let path = shm_dir().join(name);
        let deadline = Instant::now() + retry_window;

        loop {
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => {
                    let mut segment = Self::map(name, path.clone(), file, true)?;
                    {
                        let mut guard = segment.lock()?;
                        guard.reinitialize();
                    }
                    tracing::debug!(segment = name, "created coordination segment");
                    return Ok((segment, SegmentOrigin::Created));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match Self::attach(name, path.clone()) {
                        Ok(segment) => {
                            tracing::debug!(segment = name, "attached to coordination segment");
                            return Ok((segment, SegmentOrigin::Attached));
                        }
                        // Wrong length or vanished: the creator is still
                        // between create and set_len, or gave up and
                        // unlinked; wait it out or take over the create
                        Err(err) if attach_transient(&err) && Instant::now() < deadline => {
                            std::thread::sleep(Duration::from_millis(ATTACH_RETRY_MS));
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(source) => {
                    return Err(CoordError::StorageUnavailable {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
    }

    fn attach(name: &str, path: PathBuf) -> CoordResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| CoordError::StorageUnavailable {
                name: name.to_string(),
                source,
            })?;
        Self::map(name, path, file, false)
    }

    fn map(name: &str, path: PathBuf, file: File, fresh: bool) -> CoordResult<Self> {
        let storage_err = |source: io::Error| CoordError::StorageUnavailable {
            name: name.to_string(),
            source,
        };

        if fresh {
            file.set_len(BLOCK_LEN as u64).map_err(storage_err)?;
        } else {
            // An attach to a segment of the wrong shape is as fatal as no
            // segment at all
            let len = file.metadata().map_err(storage_err)?.len();
            if len != BLOCK_LEN as u64 {
                return Err(storage_err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("segment is {} bytes, expected {}", len, BLOCK_LEN),
                )));
            }
        }

        let mmap = unsafe { memmap2::MmapOptions::new().map_mut(&file) }.map_err(storage_err)?;

        Ok(Self {
            name: name.to_string(),
            path,
            file,
            mmap,
        })
    }

    /// Acquire the cross-process lock, returning a scoped access guard.
    ///
    /// Critical sections must stay short: field reads and writes only, never
    /// socket I/O.
    pub fn lock(&mut self) -> CoordResult<LockedBlock<'_>> {
        lock_file(self.file.as_raw_fd())?;
        Ok(LockedBlock { segment: self })
    }

    /// Segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path of the backing file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Scoped access to the coordination block while holding the segment lock.
///
/// Dropping the guard releases the lock; a process that dies while holding it
/// has the lock released by the kernel, but may leave the block checksum
/// inconsistent, which is exactly the crash signal the election loop watches
/// for.
pub struct LockedBlock<'a> {
    segment: &'a mut CoordinationSegment,
}

impl LockedBlock<'_> {
    /// Read the block and judge its consistency against the stored checksum
    pub fn read(&self) -> ConsistentRead {
        let mut buf = [0u8; BLOCK_LEN];
        buf.copy_from_slice(&self.segment.mmap[..BLOCK_LEN]);
        let (block, stored, computed) = CoordinationBlock::decode(&buf);
        if stored == computed {
            ConsistentRead::Valid(block)
        } else {
            ConsistentRead::Inconsistent
        }
    }

    /// Write the block fields and recompute the checksum
    pub fn commit(&mut self, block: &CoordinationBlock) {
        let buf = block.encode();
        self.segment.mmap[..BLOCK_LEN].copy_from_slice(&buf);
        fence(Ordering::Release);
    }

    /// Reset the block to "no primary, zero secondaries"
    pub fn reinitialize(&mut self) {
        self.commit(&CoordinationBlock::empty());
    }
}

/// Whether an attach failure may resolve itself once the creator finishes
fn attach_transient(err: &CoordError) -> bool {
    match err {
        CoordError::StorageUnavailable { source, .. } => matches!(
            source.kind(),
            io::ErrorKind::InvalidData | io::ErrorKind::NotFound
        ),
        _ => false,
    }
}

impl Drop for LockedBlock<'_> {
    fn drop(&mut self) {
        if let Err(err) = unlock_file(self.segment.file.as_raw_fd()) {
            tracing::warn!(segment = %self.segment.name, %err, "failed to release segment lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::OFF_CHECKSUM;
    use std::io::{Seek, SeekFrom, Write};

    fn unique_name(tag: &str) -> String {
        format!("uniproc-test-{}-{}", tag, std::process::id())
    }

    fn cleanup(name: &str) {
        let _ = std::fs::remove_file(shm_dir().join(name));
    }

    #[test]
    fn test_create_then_attach() {
        let name = unique_name("create-attach");
        cleanup(&name);

        let (mut creator, origin) = CoordinationSegment::open_or_create(&name).unwrap();
        assert_eq!(origin, SegmentOrigin::Created);

        let (mut joiner, origin) = CoordinationSegment::open_or_create(&name).unwrap();
        assert_eq!(origin, SegmentOrigin::Attached);

        // Freshly created block reads consistent and empty on both handles
        for segment in [&mut creator, &mut joiner] {
            let guard = segment.lock().unwrap();
            match guard.read() {
                ConsistentRead::Valid(block) => {
                    assert!(!block.primary_alive);
                    assert_eq!(block.secondary_count, 0);
                }
                ConsistentRead::Inconsistent => panic!("fresh block must be consistent"),
            }
        }

        cleanup(&name);
    }

    #[test]
    fn test_commit_visible_across_handles() {
        let name = unique_name("commit");
        cleanup(&name);

        let (mut writer, _) = CoordinationSegment::open_or_create(&name).unwrap();
        let (mut reader, _) = CoordinationSegment::open_or_create(&name).unwrap();

        {
            let mut guard = writer.lock().unwrap();
            let mut block = CoordinationBlock::empty();
            block.set_primary(777, "tester");
            block.secondary_count = 3;
            guard.commit(&block);
        }

        let guard = reader.lock().unwrap();
        match guard.read() {
            ConsistentRead::Valid(block) => {
                assert!(block.primary_alive);
                assert_eq!(block.primary_pid, 777);
                assert_eq!(block.primary_user, "tester");
                assert_eq!(block.secondary_count, 3);
            }
            ConsistentRead::Inconsistent => panic!("committed block must be consistent"),
        }
        drop(guard);

        cleanup(&name);
    }

    #[test]
    fn test_corruption_reads_inconsistent_and_reinitializes() {
        let name = unique_name("corrupt");
        cleanup(&name);

        let (mut segment, _) = CoordinationSegment::open_or_create(&name).unwrap();

        // Corrupt the stored checksum out-of-band, as a crashed writer would
        let mut file = OpenOptions::new()
            .write(true)
            .open(shm_dir().join(&name))
            .unwrap();
        file.seek(SeekFrom::Start(OFF_CHECKSUM as u64)).unwrap();
        file.write_all(&[0x5A, 0x5A]).unwrap();
        drop(file);

        let mut guard = segment.lock().unwrap();
        assert_eq!(guard.read(), ConsistentRead::Inconsistent);

        guard.reinitialize();
        assert!(matches!(guard.read(), ConsistentRead::Valid(_)));
        drop(guard);

        cleanup(&name);
    }

    #[test]
    fn test_attach_waits_for_creator_to_size_the_file() {
        let name = unique_name("mid-creation");
        cleanup(&name);

        // The state a racing attacher can observe: the backing file exists
        // but has not been sized yet
        std::fs::File::create(shm_dir().join(&name)).unwrap();

        let writer_name = name.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            std::fs::write(
                shm_dir().join(&writer_name),
                CoordinationBlock::empty().encode(),
            )
            .unwrap();
        });

        let (mut segment, origin) = CoordinationSegment::open_or_create(&name).unwrap();
        assert_eq!(origin, SegmentOrigin::Attached);
        let guard = segment.lock().unwrap();
        assert!(matches!(guard.read(), ConsistentRead::Valid(_)));
        drop(guard);

        writer.join().unwrap();
        cleanup(&name);
    }

    #[test]
    fn test_attach_gives_up_when_segment_never_sized() {
        let name = unique_name("never-sized");
        cleanup(&name);

        std::fs::File::create(shm_dir().join(&name)).unwrap();

        let window = Duration::from_millis(200);
        let started = Instant::now();
        let result = CoordinationSegment::open_or_create_within(&name, window);
        assert!(matches!(
            result,
            Err(CoordError::StorageUnavailable { .. })
        ));
        assert!(started.elapsed() >= window);

        cleanup(&name);
    }
}
