//! Write-back block buffer cache.
//!
//! A fixed arena of 4 KiB buffers keyed by (device, block), with an
//! open-chained hash table for lookup and one global LRU list for
//! eviction. Links are arena indices; every buffer is on the LRU list
//! exactly once, and a buffer with a non-zero reference count is never
//! evicted. Single-CPU: callers run in thread context and every public
//! operation completes without a suspension point.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::storage::{BlockDevice, BlockError};

pub const BLOCK_SIZE: usize = 4096;
pub const SECTORS_PER_BLOCK: u32 = 8;

const NIL: usize = usize::MAX;
const DEFAULT_BUFFERS: usize = 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub dirty: u64,
    pub sync_calls: u64,
}

/// Handle to a pinned buffer; stays valid until the matching `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(usize);

struct Buffer {
    dev: Option<Arc<BlockDevice>>,
    block_no: u64,
    refcnt: u32,
    valid: bool,
    dirty: bool,
    data: Box<[u8; BLOCK_SIZE]>,
    hash_next: usize,
    lru_prev: usize,
    lru_next: usize,
}

pub struct BufferCache {
    bufs: Vec<Buffer>,
    hash: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,
    stats: CacheStats,
}

impl BufferCache {
    pub fn new(num_bufs: usize) -> Self {
        let n = if num_bufs == 0 { DEFAULT_BUFFERS } else { num_bufs };
        let mut cache = BufferCache {
            bufs: Vec::with_capacity(n),
            hash: alloc::vec![NIL; 2 * n + 1],
            lru_head: NIL,
            lru_tail: NIL,
            stats: CacheStats { total: n as u64, ..CacheStats::default() },
        };
        for i in 0..n {
            cache.bufs.push(Buffer {
                dev: None,
                block_no: 0,
                refcnt: 0,
                valid: false,
                dirty: false,
                data: Box::new([0; BLOCK_SIZE]),
                hash_next: NIL,
                lru_prev: NIL,
                lru_next: NIL,
            });
            cache.lru_push_front(i);
        }
        cache
    }

    fn bucket(&self, dev: &Arc<BlockDevice>, block_no: u64) -> usize {
        let mut x = dev.id() as u64 ^ block_no.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        x ^= x >> 33;
        x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        x ^= x >> 33;
        (x % self.hash.len() as u64) as usize
    }

    // ----- intrusive LRU (head = most recent) -----

    fn lru_remove(&mut self, i: usize) {
        let (prev, next) = (self.bufs[i].lru_prev, self.bufs[i].lru_next);
        if prev != NIL {
            self.bufs[prev].lru_next = next;
        }
        if next != NIL {
            self.bufs[next].lru_prev = prev;
        }
        if self.lru_head == i {
            self.lru_head = next;
        }
        if self.lru_tail == i {
            self.lru_tail = prev;
        }
        self.bufs[i].lru_prev = NIL;
        self.bufs[i].lru_next = NIL;
    }

    fn lru_push_front(&mut self, i: usize) {
        self.bufs[i].lru_prev = NIL;
        self.bufs[i].lru_next = self.lru_head;
        if self.lru_head != NIL {
            self.bufs[self.lru_head].lru_prev = i;
        }
        self.lru_head = i;
        if self.lru_tail == NIL {
            self.lru_tail = i;
        }
    }

    fn lru_touch(&mut self, i: usize) {
        self.lru_remove(i);
        self.lru_push_front(i);
    }

    // ----- hash chains -----

    fn ht_insert(&mut self, i: usize) {
        let Some(bucket) = self.bucket_of(i) else { return };
        self.bufs[i].hash_next = self.hash[bucket];
        self.hash[bucket] = i;
    }

    fn bucket_of(&self, i: usize) -> Option<usize> {
        let buf = &self.bufs[i];
        buf.dev.as_ref().map(|dev| self.bucket(dev, buf.block_no))
    }

    fn ht_remove(&mut self, i: usize) {
        let Some(bucket) = self.bucket_of(i) else { return };
        let mut cur = self.hash[bucket];
        if cur == i {
            self.hash[bucket] = self.bufs[i].hash_next;
        } else {
            while cur != NIL {
                let next = self.bufs[cur].hash_next;
                if next == i {
                    self.bufs[cur].hash_next = self.bufs[i].hash_next;
                    break;
                }
                cur = next;
            }
        }
        self.bufs[i].hash_next = NIL;
    }

    fn ht_lookup(&self, dev: &Arc<BlockDevice>, block_no: u64) -> Option<usize> {
        let mut cur = self.hash[self.bucket(dev, block_no)];
        while cur != NIL {
            let buf = &self.bufs[cur];
            if buf.valid
                && buf.block_no == block_no
                && buf.dev.as_ref().is_some_and(|d| d.id() == dev.id())
            {
                return Some(cur);
            }
            cur = buf.hash_next;
        }
        None
    }

    /// Least recently used buffer that nothing has pinned.
    fn find_evictable(&self) -> Option<usize> {
        let mut cur = self.lru_tail;
        while cur != NIL {
            if self.bufs[cur].refcnt == 0 {
                return Some(cur);
            }
            cur = self.bufs[cur].lru_prev;
        }
        None
    }

    fn writeback(&mut self, i: usize) -> Result<(), BlockError> {
        let (dev, block_no) = {
            let buf = &self.bufs[i];
            if !buf.valid || !buf.dirty {
                return Ok(());
            }
            (Arc::clone(buf.dev.as_ref().ok_or(BlockError::InvalidArgument)?), buf.block_no)
        };

        let lba = block_no * SECTORS_PER_BLOCK as u64;
        if let Err(e) = dev.write(lba, SECTORS_PER_BLOCK, &self.bufs[i].data[..]) {
            log_error!("bcache", "writeback failed dev={} block={:#x} ({})", dev.name(), block_no, e);
            return Err(e);
        }

        self.bufs[i].dirty = false;
        self.stats.dirty -= 1;
        self.stats.writebacks += 1;
        Ok(())
    }

    /// Pin the buffer for (dev, block), filling it from disk on a miss.
    /// Eviction picks the LRU-tail buffer with no references; a dirty
    /// victim is written back first, and a failed writeback leaves the
    /// victim untouched in the cache.
    pub fn get(&mut self, dev: &Arc<BlockDevice>, block_no: u64) -> Result<BufId, BlockError> {
        if let Some(i) = self.ht_lookup(dev, block_no) {
            self.stats.hits += 1;
            self.bufs[i].refcnt += 1;
            self.lru_touch(i);
            return Ok(BufId(i));
        }

        self.stats.misses += 1;

        let victim = self.find_evictable().ok_or_else(|| {
            log_error!("bcache", "no evictable buffers (all pinned)");
            BlockError::OutOfMemory
        })?;

        if self.bufs[victim].valid {
            self.writeback(victim)?;
            self.ht_remove(victim);
            self.stats.evictions += 1;
        }

        {
            let buf = &mut self.bufs[victim];
            buf.dev = Some(Arc::clone(dev));
            buf.block_no = block_no;
            buf.valid = true;
            buf.dirty = false;
        }

        let lba = block_no * SECTORS_PER_BLOCK as u64;
        if let Err(e) = dev.read(lba, SECTORS_PER_BLOCK, &mut self.bufs[victim].data[..]) {
            log_error!("bcache", "read failed dev={} block={:#x} ({})", dev.name(), block_no, e);
            let buf = &mut self.bufs[victim];
            buf.valid = false;
            buf.dev = None;
            buf.block_no = 0;
            return Err(e);
        }

        self.bufs[victim].refcnt = 1;
        self.ht_insert(victim);
        self.lru_touch(victim);
        Ok(BufId(victim))
    }

    /// Release one pin. The buffer stays cached.
    pub fn put(&mut self, id: BufId) {
        let buf = &mut self.bufs[id.0];
        if buf.refcnt > 0 {
            buf.refcnt -= 1;
        }
    }

    pub fn mark_dirty(&mut self, id: BufId) {
        let buf = &mut self.bufs[id.0];
        if buf.valid && !buf.dirty {
            buf.dirty = true;
            self.stats.dirty += 1;
        }
    }

    pub fn data(&self, id: BufId) -> &[u8; BLOCK_SIZE] {
        &self.bufs[id.0].data
    }

    /// Mutable view of the payload; pair writes with `mark_dirty`.
    pub fn data_mut(&mut self, id: BufId) -> &mut [u8; BLOCK_SIZE] {
        &mut self.bufs[id.0].data
    }

    /// Write back every dirty buffer of `dev`, then flush the device.
    pub fn sync_dev(&mut self, dev: &Arc<BlockDevice>) -> Result<(), BlockError> {
        self.stats.sync_calls += 1;
        let mut result = Ok(());

        for i in 0..self.bufs.len() {
            let matches = {
                let buf = &self.bufs[i];
                buf.valid && buf.dirty && buf.dev.as_ref().is_some_and(|d| d.id() == dev.id())
            };
            if matches {
                if let Err(e) = self.writeback(i) {
                    result = Err(e);
                }
            }
        }

        if let Err(e) = dev.flush() {
            result = Err(e);
        }
        result
    }

    /// Device-agnostic writeback sweep; callers issue flushes explicitly.
    pub fn sync_all(&mut self) -> Result<(), BlockError> {
        self.stats.sync_calls += 1;
        let mut result = Ok(());
        for i in 0..self.bufs.len() {
            if self.bufs[i].valid && self.bufs[i].dirty {
                if let Err(e) = self.writeback(i) {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

static BCACHE: Once<Mutex<BufferCache>> = Once::new();

pub fn init(num_bufs: usize) {
    BCACHE.call_once(|| Mutex::new(BufferCache::new(num_bufs)));
    let stats = BCACHE.get().map(|c| c.lock().stats()).unwrap_or_default();
    log_ok!(
        "bcache",
        "initialized {} buffers ({} KiB cached), hash={}",
        stats.total,
        stats.total as usize * BLOCK_SIZE / 1024,
        2 * stats.total + 1
    );
}

/// Run `f` against the global cache; `None` before `init`.
pub fn with_cache<R>(f: impl FnOnce(&mut BufferCache) -> R) -> Option<R> {
    BCACHE.get().map(|cache| f(&mut cache.lock()))
}
