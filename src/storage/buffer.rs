// Buffer pool manager with LRU-K replacement.
//
// The pool owns its frames (a fixed arena with stable indices); pages are
// borrowed views through per-frame RwLock latches, and the replacer holds
// frame indices only. One mutex guards the frame table, free list and
// replacer; it is always released before a page latch is taken, so I/O and
// latch waits never block table lookups.
//
// WAL-before-data: a dirty victim is written out only after the log has
// been forced up to the victim's page LSN.

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::disk::DiskManager;
use crate::storage::page::Page;
use crate::transaction::wal::WalManager;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub type FrameId = usize;

/// How many access timestamps the replacer keeps per frame.
const LRU_K: usize = 2;

/// One pooled frame. The latch protects the page image; pin counts and the
/// dirty flag live in the pool's metadata table.
#[derive(Debug)]
pub struct Frame {
    pub page: RwLock<Page>,
}

#[derive(Default)]
struct FrameMeta {
    resident: Option<PageId>,
    pin_count: u32,
    dirty: bool,
}

/// LRU-K replacement over frame indices. The victim is the evictable frame
/// whose K-th most recent access is oldest; frames with fewer than K
/// accesses are preferred, tie-broken by their first access.
struct LruKReplacer {
    k: usize,
    history: Vec<VecDeque<u64>>,
    evictable: Vec<bool>,
}

impl LruKReplacer {
    fn new(k: usize, frames: usize) -> Self {
        Self {
            k,
            history: (0..frames).map(|_| VecDeque::new()).collect(),
            evictable: vec![false; frames],
        }
    }

    fn record_access(&mut self, frame: FrameId, now: u64) {
        let h = &mut self.history[frame];
        h.push_back(now);
        while h.len() > self.k {
            h.pop_front();
        }
    }

    fn set_evictable(&mut self, frame: FrameId, evictable: bool) {
        self.evictable[frame] = evictable;
    }

    fn forget(&mut self, frame: FrameId) {
        self.history[frame].clear();
        self.evictable[frame] = false;
    }

    fn victim(&mut self) -> Option<FrameId> {
        let mut best: Option<(FrameId, (bool, u64))> = None;
        for frame in 0..self.history.len() {
            if !self.evictable[frame] {
                continue;
            }
            let h = &self.history[frame];
            // (has K accesses, ranking timestamp); frames still short of K
            // accesses sort first, by earliest first access.
            let key = if h.len() < self.k {
                (false, h.front().copied().unwrap_or(0))
            } else {
                (true, h[h.len() - self.k])
            };
            match &best {
                Some((_, best_key)) if *best_key <= key => {}
                _ => best = Some((frame, key)),
            }
        }
        let frame = best?.0;
        self.forget(frame);
        Some(frame)
    }
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    /// Pages in transition: being loaded into, or flushed out of, a frame.
    /// Fetchers of these page ids wait on the pool condvar.
    in_flight: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    meta: Vec<FrameMeta>,
    replacer: LruKReplacer,
    clock: u64,
}

/// The buffer pool.
pub struct BufferPoolManager {
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PoolInner>,
    cond: Condvar,
    disk: Arc<DiskManager>,
    wal: Arc<WalManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, wal: Arc<WalManager>) -> Self {
        let frames = (0..pool_size)
            .map(|_| {
                Arc::new(Frame {
                    page: RwLock::new(Page::new(0)),
                })
            })
            .collect();
        Self {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                in_flight: HashMap::new(),
                free_list: (0..pool_size).rev().collect(),
                meta: (0..pool_size).map(|_| FrameMeta::default()).collect(),
                replacer: LruKReplacer::new(LRU_K, pool_size),
                clock: 0,
            }),
            cond: Condvar::new(),
            disk,
            wal,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Pins the page and returns its frame. Loads from disk when absent,
    /// evicting an unpinned victim (flushing it first if dirty).
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Frame>> {
        self.acquire(page_id, false)
    }

    /// Allocates a fresh page and pins it dirty.
    pub fn new_page(&self) -> Result<(PageId, Arc<Frame>)> {
        let page_id = self.disk.allocate_page();
        let frame = self.acquire(page_id, true)?;
        Ok((page_id, frame))
    }

    fn acquire(&self, page_id: PageId, initialize: bool) -> Result<Arc<Frame>> {
        loop {
            let mut inner = self.inner.lock();
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                inner.meta[frame_id].pin_count += 1;
                inner.replacer.set_evictable(frame_id, false);
                inner.clock += 1;
                let now = inner.clock;
                inner.replacer.record_access(frame_id, now);
                return Ok(self.frames[frame_id].clone());
            }
            if inner.in_flight.contains_key(&page_id) {
                self.cond.wait(&mut inner);
                continue;
            }

            // Reserve a frame: free list first, then the replacer.
            let frame_id = match inner.free_list.pop() {
                Some(f) => f,
                None => inner.replacer.victim().ok_or_else(|| {
                    DbError::ResourceExhausted("all buffer frames are pinned".to_string())
                })?,
            };
            let evicted = inner.meta[frame_id].resident.take();
            let evicted_dirty = inner.meta[frame_id].dirty;
            if let Some(old_pid) = evicted {
                inner.page_table.remove(&old_pid);
                inner.in_flight.insert(old_pid, frame_id);
            }
            inner.meta[frame_id] = FrameMeta {
                resident: None,
                pin_count: 1,
                dirty: initialize,
            };
            inner.in_flight.insert(page_id, frame_id);
            drop(inner);

            let frame = self.frames[frame_id].clone();
            let io_result = (|| -> Result<()> {
                let mut page = frame.page.write();
                if let Some(old_pid) = evicted {
                    if evicted_dirty {
                        self.wal.flush(page.lsn())?;
                        self.disk.write_page(old_pid, &page.data)?;
                    }
                }
                if initialize {
                    page.init(page_id);
                } else {
                    self.disk.read_page(page_id, &mut page.data)?;
                }
                Ok(())
            })();

            let mut inner = self.inner.lock();
            inner.in_flight.remove(&page_id);
            if let Some(old_pid) = evicted {
                inner.in_flight.remove(&old_pid);
            }
            match io_result {
                Ok(()) => {
                    inner.page_table.insert(page_id, frame_id);
                    inner.meta[frame_id].resident = Some(page_id);
                    inner.clock += 1;
                    let now = inner.clock;
                    inner.replacer.record_access(frame_id, now);
                    self.cond.notify_all();
                    return Ok(frame);
                }
                Err(e) => {
                    inner.meta[frame_id] = FrameMeta::default();
                    inner.free_list.push(frame_id);
                    self.cond.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Drops one pin; the dirty flag is OR-ed in. A frame whose pin count
    /// reaches zero becomes an eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) {
        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let meta = &mut inner.meta[frame_id];
            meta.pin_count = meta.pin_count.saturating_sub(1);
            meta.dirty |= is_dirty;
            if meta.pin_count == 0 {
                inner.replacer.set_evictable(frame_id, true);
            }
        }
    }

    /// Writes one resident page to disk (forcing the WAL first) and clears
    /// its dirty flag.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let frame = {
            let mut inner = self.inner.lock();
            match inner.page_table.get(&page_id).copied() {
                Some(frame_id) => {
                    inner.meta[frame_id].pin_count += 1;
                    inner.replacer.set_evictable(frame_id, false);
                    self.frames[frame_id].clone()
                }
                None => return Ok(()),
            }
        };
        let result = (|| -> Result<()> {
            let page = frame.page.read();
            self.wal.flush(page.lsn())?;
            self.disk.write_page(page_id, &page.data)?;
            Ok(())
        })();
        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let meta = &mut inner.meta[frame_id];
            meta.pin_count = meta.pin_count.saturating_sub(1);
            if result.is_ok() {
                meta.dirty = false;
            }
            if meta.pin_count == 0 {
                inner.replacer.set_evictable(frame_id, true);
            }
        }
        result
    }

    /// Flushes every resident dirty page.
    pub fn flush_all(&self) -> Result<()> {
        let resident: Vec<PageId> = {
            let inner = self.inner.lock();
            inner
                .page_table
                .iter()
                .filter(|(_, &f)| inner.meta[f].dirty)
                .map(|(&pid, _)| pid)
                .collect()
        };
        for pid in resident {
            self.flush_page(pid)?;
        }
        Ok(())
    }

    /// Dirty page table snapshot for checkpointing: resident dirty pages
    /// with their current page LSN as the recovery LSN approximation.
    pub fn dirty_pages(&self) -> Vec<(PageId, u64)> {
        let resident: Vec<(PageId, Arc<Frame>)> = {
            let inner = self.inner.lock();
            inner
                .page_table
                .iter()
                .filter(|(_, &f)| inner.meta[f].dirty)
                .map(|(&pid, &f)| (pid, self.frames[f].clone()))
                .collect()
        };
        resident
            .into_iter()
            .map(|(pid, frame)| {
                let lsn = frame.page.read().lsn();
                (pid, lsn)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool(frames: usize) -> (tempfile::TempDir, BufferPoolManager) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path().join("data.db")).unwrap());
        let wal = Arc::new(WalManager::open(dir.path().join("wal.log")).unwrap());
        let bp = BufferPoolManager::new(frames, disk, wal);
        (dir, bp)
    }

    #[test]
    fn test_new_page_is_pinned_and_dirty() {
        let (_dir, bp) = pool(4);
        let (pid, frame) = bp.new_page().unwrap();
        assert_eq!(frame.page.read().page_id(), pid);
        bp.unpin_page(pid, true);
        bp.flush_page(pid).unwrap();
    }

    #[test]
    fn test_eviction_under_pressure_preserves_data() {
        let (_dir, bp) = pool(4);
        let mut pids = Vec::new();
        for i in 0..100u8 {
            let (pid, frame) = bp.new_page().unwrap();
            {
                let mut page = frame.page.write();
                let slot = page.insert_tuple(&[i; 16]).unwrap();
                assert_eq!(slot, 0);
            }
            bp.unpin_page(pid, true);
            pids.push((pid, i));
        }
        // Two full scans; contents must be identical both times.
        for _ in 0..2 {
            for &(pid, i) in &pids {
                let frame = bp.fetch_page(pid).unwrap();
                {
                    let page = frame.page.read();
                    assert_eq!(page.page_id(), pid);
                    assert_eq!(page.get_tuple(0), Some(&[i; 16][..]));
                }
                bp.unpin_page(pid, false);
            }
        }
    }

    #[test]
    fn test_all_frames_pinned_fails() {
        let (_dir, bp) = pool(2);
        let (a, _fa) = bp.new_page().unwrap();
        let (b, _fb) = bp.new_page().unwrap();
        let err = bp.new_page().unwrap_err();
        assert!(matches!(err, DbError::ResourceExhausted(_)));
        bp.unpin_page(a, false);
        bp.unpin_page(b, false);
        assert!(bp.new_page().is_ok());
    }

    #[test]
    fn test_lru_k_prefers_oldest_kth_access() {
        let mut replacer = LruKReplacer::new(2, 3);
        // Frame 0: accesses at 1, 4. Frame 1: accesses at 2, 3.
        replacer.record_access(0, 1);
        replacer.record_access(1, 2);
        replacer.record_access(1, 3);
        replacer.record_access(0, 4);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        // Frame 0's 2nd most recent access (1) is older than frame 1's (2).
        assert_eq!(replacer.victim(), Some(0));
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_lru_k_prefers_frames_below_k_accesses() {
        let mut replacer = LruKReplacer::new(2, 2);
        replacer.record_access(0, 1);
        replacer.record_access(0, 2);
        replacer.record_access(1, 3);
        replacer.set_evictable(0, true);
        replacer.set_evictable(1, true);
        // Frame 1 has only one access and is preferred.
        assert_eq!(replacer.victim(), Some(1));
    }
}
