//! External collaborators of the buffer pool: page I/O, the encryption
//! hook, scratch buffers for encrypted writes, and the LSN source.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::{PoolError, Result};
use crate::page::{Lsn, Page, PageId, SpaceId, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TRAILER_SIZE};

/// Synchronous one-page I/O. An async backend drives the same pool logic by
/// calling `read_page` from its completion handler.
pub trait PageIo: Send + Sync {
    fn read_page(&self, id: PageId, frame: &mut Page) -> Result<()>;
    fn write_page(&self, id: PageId, frame: &Page, lsn: Lsn) -> Result<()>;
    fn space_exists(&self, space_id: SpaceId) -> bool;
}

/// Encryption/compression hook applied around page I/O. The frame returned
/// by `encrypt_for_write` is what lands on disk; it may alias `src` when
/// encryption is off, or point at the caller's scratch buffer.
pub trait PageCipher: Send + Sync {
    fn encrypt_for_write<'a>(&self, id: PageId, src: &'a Page, scratch: &'a mut Page) -> &'a Page;
    fn decrypt_after_read(&self, id: PageId, frame: &mut Page) -> Result<()>;
}

/// Publishes the current durable LSN; flushing progress and checkpoint
/// targets are expressed against it.
pub trait LsnSource: Send + Sync {
    fn current_lsn(&self) -> Lsn;
}

pub struct AtomicLsn {
    lsn: AtomicU64,
}

impl AtomicLsn {
    pub fn new(lsn: Lsn) -> Self {
        AtomicLsn {
            lsn: AtomicU64::new(lsn),
        }
    }

    pub fn advance(&self, lsn: Lsn) {
        self.lsn.fetch_max(lsn, Ordering::Release);
    }

    /// Allocates the next LSN. Convenience for tests and demos; a real redo
    /// log hands out LSNs itself.
    pub fn next(&self) -> Lsn {
        self.lsn.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl LsnSource for AtomicLsn {
    fn current_lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }
}

// ───── ciphers ──────────────────────────────────────────────────────────────

/// Encryption disabled: writes alias the source frame, reads are untouched.
pub struct NoopCipher;

impl PageCipher for NoopCipher {
    fn encrypt_for_write<'a>(&self, _id: PageId, src: &'a Page, _scratch: &'a mut Page) -> &'a Page {
        src
    }

    fn decrypt_after_read(&self, _id: PageId, _frame: &mut Page) -> Result<()> {
        Ok(())
    }
}

/// Toy cipher for tests: XORs the payload, leaving header and trailer (and
/// therefore the plaintext checksum fields) in place. The on-disk image
/// fails plain validation until decrypted.
pub struct XorCipher {
    pub key: u8,
}

impl XorCipher {
    fn apply(&self, frame: &mut Page) {
        for b in &mut frame[PAGE_HEADER_SIZE..PAGE_SIZE - PAGE_TRAILER_SIZE] {
            *b ^= self.key;
        }
    }
}

impl PageCipher for XorCipher {
    fn encrypt_for_write<'a>(&self, _id: PageId, src: &'a Page, scratch: &'a mut Page) -> &'a Page {
        scratch.clone_from(src);
        self.apply(scratch);
        scratch
    }

    fn decrypt_after_read(&self, _id: PageId, frame: &mut Page) -> Result<()> {
        self.apply(frame);
        Ok(())
    }
}

// ───── scratch slots ────────────────────────────────────────────────────────

struct ScratchBuffers {
    crypt: Box<Page>,
    comp: Box<Page>,
}

struct ScratchEntry {
    reserved: AtomicBool,
    buffers: std::cell::UnsafeCell<ScratchBuffers>,
}

// SAFETY: `buffers` is only accessed through a `ScratchSlot`, whose
// existence implies exclusive ownership of the entry via `reserved`.
unsafe impl Sync for ScratchEntry {}

/// Fixed array of scratch buffers for encrypted/compressed writes. A page
/// can be concurrently read by one thread and written out encrypted by a
/// flusher, so the two operations need independent buffers.
pub struct ScratchPool {
    slots: Box<[ScratchEntry]>,
}

impl ScratchPool {
    pub fn new(n_slots: usize) -> Self {
        let slots = (0..n_slots.max(1))
            .map(|_| ScratchEntry {
                reserved: AtomicBool::new(false),
                buffers: std::cell::UnsafeCell::new(ScratchBuffers {
                    crypt: Box::new(Page::new_empty()),
                    comp: Box::new(Page::new_empty()),
                }),
            })
            .collect();
        ScratchPool { slots }
    }

    /// Test-and-set scan for a free slot. Returns None when every slot is
    /// in flight; callers fall back to a transient allocation.
    pub fn acquire(&self) -> Option<ScratchSlot<'_>> {
        for entry in self.slots.iter() {
            if entry
                .reserved
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(ScratchSlot { entry });
            }
        }
        None
    }

    #[cfg(test)]
    pub fn reserved_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.reserved.load(Ordering::Acquire))
            .count()
    }
}

pub struct ScratchSlot<'a> {
    entry: &'a ScratchEntry,
}

impl ScratchSlot<'_> {
    pub fn crypt_buf(&mut self) -> &mut Page {
        // SAFETY: the slot is reserved by us; see ScratchEntry.
        unsafe { &mut (*self.entry.buffers.get()).crypt }
    }

    pub fn comp_buf(&mut self) -> &mut Page {
        // SAFETY: as above.
        unsafe { &mut (*self.entry.buffers.get()).comp }
    }

    /// Both buffers at once, for the copy-stamp-encrypt pipeline.
    pub fn pair(&mut self) -> (&mut Page, &mut Page) {
        // SAFETY: as above; the two boxes are disjoint.
        let buffers = unsafe { &mut *self.entry.buffers.get() };
        (&mut buffers.comp, &mut buffers.crypt)
    }
}

impl Drop for ScratchSlot<'_> {
    fn drop(&mut self) {
        self.entry.reserved.store(false, Ordering::Release);
    }
}

// ───── file-backed I/O ──────────────────────────────────────────────────────

mod file_io {
    use super::*;
    use libc::{c_void, pread, pwrite};
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::path::PathBuf;

    struct SpaceFile {
        _file: File, // Owns the descriptor; `fd` dies with it.
        fd: i32,
    }

    /// One file per tablespace under a base directory, accessed with
    /// positioned reads and writes.
    pub struct FilePageIo {
        base_dir: PathBuf,
        spaces: DashMap<SpaceId, SpaceFile>,
        n_reads: AtomicU64,
        n_writes: AtomicU64,
    }

    impl FilePageIo {
        pub fn new<P: AsRef<std::path::Path>>(base_dir: P) -> Result<Self> {
            std::fs::create_dir_all(&base_dir)?;
            let io = FilePageIo {
                base_dir: base_dir.as_ref().to_path_buf(),
                spaces: DashMap::new(),
                n_reads: AtomicU64::new(0),
                n_writes: AtomicU64::new(0),
            };
            for entry in std::fs::read_dir(&io.base_dir)? {
                let path = entry?.path();
                if let Some(space_id) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse().ok())
                {
                    io.open_space(space_id, &path)?;
                }
            }
            Ok(io)
        }

        fn open_space(&self, space_id: SpaceId, path: &std::path::Path) -> Result<()> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            let fd = file.as_raw_fd();
            self.spaces.insert(space_id, SpaceFile { _file: file, fd });
            Ok(())
        }

        pub fn create_space(&self, space_id: SpaceId) -> Result<()> {
            if self.spaces.contains_key(&space_id) {
                return Ok(());
            }
            let path = self.base_dir.join(space_id.to_string());
            self.open_space(space_id, &path)
        }

        pub fn drop_space(&self, space_id: SpaceId) -> Result<()> {
            if self.spaces.remove(&space_id).is_some() {
                std::fs::remove_file(self.base_dir.join(space_id.to_string()))?;
            }
            Ok(())
        }

        pub fn io_counts(&self) -> (u64, u64) {
            (
                self.n_reads.load(Ordering::Relaxed),
                self.n_writes.load(Ordering::Relaxed),
            )
        }
    }

    impl PageIo for FilePageIo {
        fn read_page(&self, id: PageId, frame: &mut Page) -> Result<()> {
            let space = self
                .spaces
                .get(&id.space_id)
                .ok_or(PoolError::TablespaceDeleted(id.space_id))?;
            let offset = id.page_no as i64 * PAGE_SIZE as i64;
            let n = unsafe {
                pread(
                    space.fd,
                    frame.as_mut_ptr() as *mut c_void,
                    PAGE_SIZE,
                    offset,
                )
            };
            if n < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            // A short read past EOF yields a never-written page.
            frame[n as usize..].fill(0);
            self.n_reads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn write_page(&self, id: PageId, frame: &Page, _lsn: Lsn) -> Result<()> {
            let space = self
                .spaces
                .get(&id.space_id)
                .ok_or(PoolError::TablespaceDeleted(id.space_id))?;
            let offset = id.page_no as i64 * PAGE_SIZE as i64;
            let n = unsafe {
                pwrite(
                    space.fd,
                    frame.as_ptr() as *const c_void,
                    PAGE_SIZE,
                    offset,
                )
            };
            if n != PAGE_SIZE as isize {
                return Err(std::io::Error::last_os_error().into());
            }
            self.n_writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn space_exists(&self, space_id: SpaceId) -> bool {
            self.spaces.contains_key(&space_id)
        }
    }
}

pub use file_io::FilePageIo;

// ───── in-memory I/O (tests) ────────────────────────────────────────────────

/// In-memory page store with fault injection, for unit tests.
pub struct MemPageIo {
    pages: DashMap<PageId, Box<Page>>,
    spaces: DashMap<SpaceId, ()>,
    fail_next_read: AtomicBool,
    corrupt_next_read: AtomicBool,
    n_reads: AtomicU64,
    n_writes: AtomicU64,
    write_log: std::sync::Mutex<Vec<PageId>>,
}

impl Default for MemPageIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPageIo {
    pub fn new() -> Self {
        MemPageIo {
            pages: DashMap::new(),
            spaces: DashMap::new(),
            fail_next_read: AtomicBool::new(false),
            corrupt_next_read: AtomicBool::new(false),
            n_reads: AtomicU64::new(0),
            n_writes: AtomicU64::new(0),
            write_log: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn create_space(&self, space_id: SpaceId) {
        self.spaces.insert(space_id, ());
    }

    pub fn drop_space(&self, space_id: SpaceId) {
        self.spaces.remove(&space_id);
        self.pages.retain(|id, _| id.space_id != space_id);
    }

    /// Stores a raw page image, bypassing the checksum stamping the pool
    /// performs on writes. For corruption tests.
    pub fn store_raw(&self, id: PageId, frame: &Page) {
        self.create_space(id.space_id);
        self.pages.insert(id, Box::new(frame.clone()));
    }

    pub fn fail_next_read(&self) {
        self.fail_next_read.store(true, Ordering::Release);
    }

    pub fn corrupt_next_read(&self) {
        self.corrupt_next_read.store(true, Ordering::Release);
    }

    pub fn io_counts(&self) -> (u64, u64) {
        (
            self.n_reads.load(Ordering::Relaxed),
            self.n_writes.load(Ordering::Relaxed),
        )
    }

    /// Every page id written, in arrival order.
    pub fn write_order(&self) -> Vec<PageId> {
        self.write_log.lock().unwrap().clone()
    }
}

impl PageIo for MemPageIo {
    fn read_page(&self, id: PageId, frame: &mut Page) -> Result<()> {
        if self.fail_next_read.swap(false, Ordering::AcqRel) {
            return Err(std::io::Error::other("injected read failure").into());
        }
        if !self.space_exists(id.space_id) {
            return Err(PoolError::TablespaceDeleted(id.space_id));
        }
        match self.pages.get(&id) {
            Some(stored) => frame.clone_from(stored.value()),
            None => frame.zero(),
        }
        if self.corrupt_next_read.swap(false, Ordering::AcqRel) {
            frame.write_u32(crate::page::FIELD_CHECKSUM, 0xBAAD_F00D);
            frame.set_lsn(1); // keep the torn-write check from masking it
        }
        self.n_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&self, id: PageId, frame: &Page, _lsn: Lsn) -> Result<()> {
        if !self.space_exists(id.space_id) {
            return Err(PoolError::TablespaceDeleted(id.space_id));
        }
        self.pages.insert(id, Box::new(frame.clone()));
        self.n_writes.fetch_add(1, Ordering::Relaxed);
        self.write_log.lock().unwrap().push(id);
        Ok(())
    }

    fn space_exists(&self, space_id: SpaceId) -> bool {
        self.spaces.contains_key(&space_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{self, ChecksumAlgorithm};
    use tempfile::TempDir;

    #[test]
    fn test_file_io_roundtrip() {
        let dir = TempDir::new().unwrap();
        let io = FilePageIo::new(dir.path()).unwrap();
        io.create_space(7).unwrap();

        let id = PageId::new(7, 3);
        let mut page = Page::new_empty();
        page.set_id(id);
        page[100] = 0x42;
        io.write_page(id, &page, 10).unwrap();

        let mut out = Page::new_empty();
        io.read_page(id, &mut out).unwrap();
        assert_eq!(out.id(), id);
        assert_eq!(out[100], 0x42);
        assert_eq!(io.io_counts(), (1, 1));
    }

    #[test]
    fn test_file_io_short_read_zero_fills() {
        let dir = TempDir::new().unwrap();
        let io = FilePageIo::new(dir.path()).unwrap();
        io.create_space(1).unwrap();
        let mut out = Page::new_empty();
        out[5] = 9;
        io.read_page(PageId::new(1, 100), &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_io_missing_space() {
        let dir = TempDir::new().unwrap();
        let io = FilePageIo::new(dir.path()).unwrap();
        let mut out = Page::new_empty();
        assert!(matches!(
            io.read_page(PageId::new(9, 0), &mut out),
            Err(PoolError::TablespaceDeleted(9))
        ));
    }

    #[test]
    fn test_xor_cipher_roundtrip() {
        let cipher = XorCipher { key: 0x5A };
        let id = PageId::new(1, 1);
        let mut page = Page::new_empty();
        page.set_id(id);
        page[1000] = 0x11;
        checksum::stamp(&mut page, ChecksumAlgorithm::Crc32, 5);

        let mut scratch = Page::new_empty();
        let on_disk = cipher.encrypt_for_write(id, &page, &mut scratch).clone();
        // The encrypted image must not validate as plaintext.
        assert!(!checksum::validate(&on_disk, ChecksumAlgorithm::Crc32));

        let mut read_back = on_disk;
        cipher.decrypt_after_read(id, &mut read_back).unwrap();
        assert!(checksum::validate(&read_back, ChecksumAlgorithm::Crc32));
        assert_eq!(read_back[1000], 0x11);
    }

    #[test]
    fn test_noop_cipher_aliases_source() {
        let cipher = NoopCipher;
        let page = Page::new_empty();
        let mut scratch = Page::new_empty();
        let out = cipher.encrypt_for_write(PageId::new(0, 0), &page, &mut scratch);
        assert!(std::ptr::eq(out, &page));
    }

    #[test]
    fn test_scratch_pool_exhaustion() {
        let pool = ScratchPool::new(2);
        let mut a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.reserved_count(), 2);
        a.crypt_buf()[0] = 1;
        drop(a);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_mem_io_fault_injection() {
        let io = MemPageIo::new();
        io.create_space(1);
        io.fail_next_read();
        let mut out = Page::new_empty();
        assert!(io.read_page(PageId::new(1, 0), &mut out).is_err());
        // The failure is one-shot.
        assert!(io.read_page(PageId::new(1, 0), &mut out).is_ok());
    }
}
