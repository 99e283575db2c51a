#![forbid(unsafe_code)]
//! Block storage collaborator for agfs.
//!
//! Provides byte- and block-addressed device traits, a file-backed and an
//! in-memory device, and [`BufCache`], the metadata buffer service the
//! transaction engine reads through and writes back to.
//!
//! `BufCache` offers three things beyond plain caching:
//!
//! - **buffer locks**: one owner (`TxnId`) per block between "join to a
//!   transaction" and "transaction finished"; a second transaction blocks
//!   until the first commits or cancels.
//! - **pinning** (`hold`/`release`): a held buffer is never evicted, so the
//!   image a transaction joined cannot be reused underneath it.
//! - **per-buffer LSN**: the log sequence number of the last committed
//!   change written through the cache.

use agfs_error::{AgfsError, Result};
use agfs_types::{BlockNumber, Lsn, ParseError, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Map a decode failure of a live metadata block to `Corruption`.
pub fn corrupt_at(block: BlockNumber) -> impl FnOnce(ParseError) -> AgfsError {
    move |err| AgfsError::corruption(block.0, err.to_string())
}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

// ── Devices ─────────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| AgfsError::InvalidArgument(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(AgfsError::InvalidArgument(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positional I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, falling back to read-only access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(AgfsError::ReadOnly);
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device with write-failure injection.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the whole device image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| AgfsError::InvalidArgument("offset overflow".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AgfsError::Io(std::io::Error::other("injected write failure")));
        }
        let mut bytes = self.bytes.lock();
        checked_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| AgfsError::InvalidArgument("offset overflow".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(AgfsError::InvalidGeometry(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(AgfsError::InvalidGeometry(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(AgfsError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| AgfsError::InvalidArgument("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(AgfsError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Zero-filled in-memory block device.
pub type MemBlockDevice = ByteBlockDevice<MemByteDevice>;

impl MemBlockDevice {
    pub fn zeroed(block_size: u32, block_count: u64) -> Result<Self> {
        let len = usize::try_from(block_count * u64::from(block_size))
            .map_err(|_| AgfsError::InvalidGeometry("device too large for memory".to_owned()))?;
        Self::new(MemByteDevice::new(len), block_size)
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CachedBuf {
    data: Option<Arc<Vec<u8>>>,
    lsn: Lsn,
    holds: u32,
    owner: Option<TxnId>,
}

impl CachedBuf {
    fn empty() -> Self {
        Self {
            data: None,
            lsn: Lsn::ZERO,
            holds: 0,
            owner: None,
        }
    }

    fn pinned(&self) -> bool {
        self.holds > 0 || self.owner.is_some()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    bufs: HashMap<BlockNumber, CachedBuf>,
    /// Residency order, least recently used first.
    lru: VecDeque<BlockNumber>,
}

impl CacheState {
    fn touch(&mut self, block: BlockNumber) {
        if let Some(pos) = self.lru.iter().position(|b| *b == block) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_back(block);
    }

    /// Drop unpinned images beyond `capacity`, oldest first.
    fn evict(&mut self, capacity: usize) {
        let mut scanned = 0;
        while self.lru.len() > capacity && scanned < self.lru.len() {
            let Some(victim) = self.lru.pop_front() else {
                break;
            };
            let pinned = self.bufs.get(&victim).is_some_and(CachedBuf::pinned);
            if pinned {
                self.lru.push_back(victim);
                scanned += 1;
            } else {
                let _ = self.bufs.remove(&victim);
            }
        }
    }
}

/// Snapshot of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub resident: usize,
}

/// Metadata buffer service: write-through cache with buffer locks, pins and
/// per-buffer LSNs.
pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    capacity: usize,
    state: Mutex<CacheState>,
    unlocked: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl std::fmt::Debug for BufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("block_size", &self.dev.block_size())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl BufCache {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        Self {
            dev,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
            unlocked: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Current committed image of `block`.
    pub fn read(&self, block: BlockNumber) -> Result<Arc<Vec<u8>>> {
        {
            let mut state = self.state.lock();
            if let Some(data) = state.bufs.get(&block).and_then(|b| b.data.clone()) {
                state.touch(block);
                drop(state);
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(block = block.0, "buf_cache_hit");
                return Ok(data);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = Arc::new(self.dev.read_block(block)?.into_inner());
        let mut state = self.state.lock();
        let entry = state.bufs.entry(block).or_insert_with(CachedBuf::empty);
        // A concurrent write-back may have installed a newer image meanwhile.
        let data = entry.data.get_or_insert_with(|| Arc::clone(&data)).clone();
        state.touch(block);
        state.evict(self.capacity);
        drop(state);
        trace!(block = block.0, "buf_cache_miss");
        Ok(data)
    }

    /// Zeroed buffer for a block about to be initialised (no device read).
    #[must_use]
    pub fn get_uncached(&self, block: BlockNumber) -> Vec<u8> {
        trace!(block = block.0, "buf_get_uncached");
        vec![0_u8; self.dev.block_size() as usize]
    }

    /// Write a committed image through to the device and stamp its LSN.
    pub fn write_back(&self, block: BlockNumber, data: Vec<u8>, lsn: Lsn) -> Result<()> {
        self.dev.write_block(block, &data)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let entry = state.bufs.entry(block).or_insert_with(CachedBuf::empty);
        entry.data = Some(Arc::new(data));
        if lsn > entry.lsn {
            entry.lsn = lsn;
        }
        state.touch(block);
        state.evict(self.capacity);
        drop(state);
        Ok(())
    }

    /// LSN of the last committed change written through the cache.
    #[must_use]
    pub fn lsn(&self, block: BlockNumber) -> Option<Lsn> {
        self.state.lock().bufs.get(&block).map(|b| b.lsn)
    }

    /// Lock `block` for `owner`, blocking while another owner holds it.
    ///
    /// Returns `false` if `owner` already held the lock.
    pub fn lock(&self, block: BlockNumber, owner: TxnId) -> bool {
        let mut state = self.state.lock();
        loop {
            let entry = state.bufs.entry(block).or_insert_with(CachedBuf::empty);
            match entry.owner {
                None => {
                    entry.owner = Some(owner);
                    trace!(block = block.0, txn = owner.0, "buf_lock");
                    return true;
                }
                Some(current) if current == owner => return false,
                Some(current) => {
                    debug!(block = block.0, txn = owner.0, holder = current.0, "buf_lock_wait");
                    self.unlocked.wait(&mut state);
                }
            }
        }
    }

    /// Non-blocking variant of [`BufCache::lock`]; `None` when contended.
    pub fn try_lock(&self, block: BlockNumber, owner: TxnId) -> Option<bool> {
        let mut state = self.state.lock();
        let entry = state.bufs.entry(block).or_insert_with(CachedBuf::empty);
        match entry.owner {
            None => {
                entry.owner = Some(owner);
                Some(true)
            }
            Some(current) if current == owner => Some(false),
            Some(_) => None,
        }
    }

    pub fn unlock(&self, block: BlockNumber, owner: TxnId) {
        let mut state = self.state.lock();
        match state.bufs.get_mut(&block) {
            Some(entry) if entry.owner == Some(owner) => {
                entry.owner = None;
                if entry.data.is_none() && entry.holds == 0 {
                    let _ = state.bufs.remove(&block);
                }
            }
            _ => warn!(block = block.0, txn = owner.0, "buf_unlock_not_owner"),
        }
        drop(state);
        self.unlocked.notify_all();
    }

    #[must_use]
    pub fn lock_owner(&self, block: BlockNumber) -> Option<TxnId> {
        self.state.lock().bufs.get(&block).and_then(|b| b.owner)
    }

    /// Pin `block` so its image stays resident.
    pub fn hold(&self, block: BlockNumber) {
        let mut state = self.state.lock();
        state.bufs.entry(block).or_insert_with(CachedBuf::empty).holds += 1;
    }

    pub fn release(&self, block: BlockNumber) {
        let mut state = self.state.lock();
        if let Some(entry) = state.bufs.get_mut(&block) {
            entry.holds = entry.holds.saturating_sub(1);
        }
        state.evict(self.capacity);
    }

    #[must_use]
    pub fn is_held(&self, block: BlockNumber) -> bool {
        self.state
            .lock()
            .bufs
            .get(&block)
            .is_some_and(|b| b.holds > 0)
    }

    pub fn sync(&self) -> Result<()> {
        debug!(writes = self.writes.load(Ordering::Relaxed), "buf_cache_sync");
        self.dev.sync()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            resident: self.state.lock().lru.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn cache(blocks: u64, capacity: usize) -> (MemByteDevice, BufCache) {
        let mem = MemByteDevice::new(usize::try_from(blocks * 512).unwrap());
        let dev = ByteBlockDevice::new(mem.clone(), 512).unwrap();
        (mem, BufCache::new(Arc::new(dev), capacity))
    }

    #[test]
    fn byte_block_device_round_trips() {
        let dev = MemBlockDevice::zeroed(4096, 4).unwrap();
        dev.write_block(BlockNumber(2), &[7_u8; 4096]).unwrap();
        assert_eq!(dev.read_block(BlockNumber(2)).unwrap().as_slice(), &[7_u8; 4096]);
        assert!(dev.read_block(BlockNumber(4)).is_err());
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 100]).is_err());
    }

    #[test]
    fn unaligned_image_rejected() {
        assert!(ByteBlockDevice::new(MemByteDevice::new(1000), 512).is_err());
        assert!(ByteBlockDevice::new(MemByteDevice::new(1024), 500).is_err());
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image");
        let file = FileByteDevice::create(&path, 8 * 512).unwrap();
        let dev = ByteBlockDevice::new(file, 512).unwrap();
        dev.write_block(BlockNumber(3), &[0x5A; 512]).unwrap();
        dev.sync().unwrap();
        drop(dev);

        let reopened = ByteBlockDevice::new(FileByteDevice::open(&path).unwrap(), 512).unwrap();
        assert_eq!(reopened.block_count(), 8);
        assert_eq!(reopened.read_block(BlockNumber(3)).unwrap().as_slice(), &[0x5A; 512]);
    }

    #[test]
    fn write_back_updates_device_cache_and_lsn() {
        let (mem, cache) = cache(8, 4);
        cache.write_back(BlockNumber(1), vec![9; 512], Lsn(5)).unwrap();
        assert_eq!(cache.lsn(BlockNumber(1)), Some(Lsn(5)));
        assert_eq!(&mem.snapshot()[512..1024], &[9; 512]);
        assert_eq!(cache.read(BlockNumber(1)).unwrap().as_slice(), &[9; 512]);
        assert_eq!(cache.stats().hits, 1);

        // LSN never moves backwards.
        cache.write_back(BlockNumber(1), vec![8; 512], Lsn(3)).unwrap();
        assert_eq!(cache.lsn(BlockNumber(1)), Some(Lsn(5)));
    }

    #[test]
    fn failed_write_leaves_cached_image_alone() {
        let (mem, cache) = cache(8, 4);
        cache.write_back(BlockNumber(2), vec![1; 512], Lsn(1)).unwrap();
        mem.set_fail_writes(true);
        assert!(cache.write_back(BlockNumber(2), vec![2; 512], Lsn(2)).is_err());
        assert_eq!(cache.read(BlockNumber(2)).unwrap().as_slice(), &[1; 512]);
    }

    #[test]
    fn held_buffers_survive_eviction() {
        let (_mem, cache) = cache(16, 2);
        cache.read(BlockNumber(0)).unwrap();
        cache.hold(BlockNumber(0));
        for b in 1..6 {
            cache.read(BlockNumber(b)).unwrap();
        }
        assert!(cache.is_held(BlockNumber(0)));
        let misses = cache.stats().misses;
        cache.read(BlockNumber(0)).unwrap();
        assert_eq!(cache.stats().misses, misses, "held block stayed resident");
        cache.release(BlockNumber(0));
        assert!(!cache.is_held(BlockNumber(0)));
    }

    #[test]
    fn lock_is_reentrant_for_owner_and_exclusive_otherwise() {
        let (_mem, cache) = cache(8, 4);
        assert!(cache.lock(BlockNumber(3), TxnId(1)));
        assert!(!cache.lock(BlockNumber(3), TxnId(1)));
        assert_eq!(cache.try_lock(BlockNumber(3), TxnId(2)), None);
        cache.unlock(BlockNumber(3), TxnId(1));
        assert_eq!(cache.try_lock(BlockNumber(3), TxnId(2)), Some(true));
        assert_eq!(cache.lock_owner(BlockNumber(3)), Some(TxnId(2)));
    }

    #[test]
    fn lock_waiter_wakes_on_unlock() {
        let (_mem, cache) = cache(8, 4);
        let cache = Arc::new(cache);
        assert!(cache.lock(BlockNumber(4), TxnId(1)));
        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.lock(BlockNumber(4), TxnId(2)))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.lock_owner(BlockNumber(4)), Some(TxnId(1)));
        cache.unlock(BlockNumber(4), TxnId(1));
        assert!(waiter.join().unwrap());
        assert_eq!(cache.lock_owner(BlockNumber(4)), Some(TxnId(2)));
    }

    #[test]
    fn corrupt_at_names_the_block() {
        let err = corrupt_at(BlockNumber(77))(ParseError::InvalidField {
            field: "magic",
            reason: "bad",
        });
        assert!(err.is_corruption());
        assert!(err.to_string().contains("block 77"));
    }
}
