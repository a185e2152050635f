//! Asynchronous I/O batching over tier-2 blocks.
//!
//! An [`IoBatch`] coalesces page operations into the fewest device requests
//! that respect device boundaries and the scatter-gather ceiling. Pages added
//! in order stay in order within a request; requests split off by a boundary
//! or the ceiling are ordered only by submission time.
//!
//! Lifetime is reference counted: the caller holds one reference, each
//! in-flight request holds one, and whichever thread drops the count to zero
//! fires the final completion (or wakes a waiting `end`) — exactly once.
//! Batch-time errors are recorded last-wins and surface at `end`; nothing is
//! thrown mid-batch, and pages already submitted are never rolled back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::device::{BlockIoRequest, IoDirection, MAX_IO_VECTS};
use crate::error::{StorageError, StorageResult};
use crate::page::Page;
use crate::set::DeviceSet;

/// Per-request progress callback plus the final notification.
///
/// Invoked with `Some(request)` as each device request completes, and once
/// with `(None, true)` when the whole batch is done.
pub type IoDoneFn = Box<dyn Fn(Option<&BlockIoRequest>, bool) + Send + Sync>;

/// Options for [`IoBatch::begin`].
#[derive(Default)]
pub struct BatchOptions {
    /// Pages per request before an eager flush; 0 means 1, clamped to
    /// [`MAX_IO_VECTS`].
    pub n_vects: usize,
    /// Queue completed requests and submit them as a burst at `end`, trading
    /// latency for cross-source batching.
    pub delay_submit: bool,
    /// Completion callback.
    pub done: Option<IoDoneFn>,
}

struct BatchShared {
    set: Arc<DeviceSet>,
    dir: IoDirection,
    done: Option<IoDoneFn>,
    refcount: AtomicUsize,
    err: Mutex<Option<StorageError>>,
    waiting: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl BatchShared {
    fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. The thread that reaches zero wakes the waiter or
    /// fires the final callback; returns true when this call was the last.
    fn put(&self) -> bool {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        if self.waiting.load(Ordering::Acquire) {
            let _guard = self.lock.lock();
            self.cv.notify_all();
        } else if let Some(done) = &self.done {
            done(None, true);
        }
        true
    }

    fn record_err(&self, e: StorageError) {
        *self.err.lock() = Some(e);
    }
}

/// One logical asynchronous read or write call in progress.
pub struct IoBatch {
    shared: Arc<BatchShared>,
    cur: Option<BlockIoRequest>,
    last_local: Option<u64>,
    n_vects: usize,
    delay: bool,
    delayed: Vec<BlockIoRequest>,
    ended: bool,
}

impl IoBatch {
    /// Starts a batch against `set` in direction `dir`.
    pub fn begin(set: Arc<DeviceSet>, dir: IoDirection, opts: BatchOptions) -> Self {
        let n_vects = opts.n_vects.clamp(1, MAX_IO_VECTS);
        debug!(
            "begin {} n_vects={} delay={}",
            dir.as_str(),
            n_vects,
            opts.delay_submit
        );
        Self {
            shared: Arc::new(BatchShared {
                set,
                dir,
                done: opts.done,
                refcount: AtomicUsize::new(1),
                err: Mutex::new(None),
                waiting: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
            }),
            cur: None,
            last_local: None,
            n_vects,
            delay: opts.delay_submit,
            delayed: Vec::new(),
            ended: false,
        }
    }

    /// Transfer direction of this batch.
    #[inline]
    pub fn direction(&self) -> IoDirection {
        self.shared.dir
    }

    /// The device set this batch runs against.
    #[inline]
    pub fn device_set(&self) -> &Arc<DeviceSet> {
        &self.shared.set
    }

    /// Flushes any current request, then pre-allocates an empty one at the
    /// new ceiling so the next [`IoBatch::add`] skips allocation.
    ///
    /// Allocation failure here is recorded but not fatal; `add` retries.
    pub fn prealloc(&mut self, n_vects: usize) -> StorageResult<()> {
        // A previously recorded allocation failure is stale once the caller
        // re-arms the batch; completion errors stay.
        {
            let mut err = self.shared.err.lock();
            if matches!(*err, Some(StorageError::AllocationFailure)) {
                *err = None;
            }
        }
        self.submit_or_queue(true, false);
        self.n_vects = n_vects.clamp(1, MAX_IO_VECTS);
        debug!(
            "prealloc n_vects={} have_cur={}",
            self.n_vects,
            self.cur.is_some()
        );
        if self.cur.is_none() {
            self.alloc_request(None)?;
        }
        Ok(())
    }

    /// Adds `page` at tier-2 block `bn`.
    ///
    /// A new device request starts when none is open, when `bn` is not
    /// contiguous with the previous add, or when the owning device changes;
    /// otherwise the page joins the current request. Hitting the ceiling
    /// flushes eagerly (unless the ceiling is 1). Once this returns `Ok` the
    /// page is committed for submission; there is no cancellation.
    pub fn add(&mut self, bn: u64, page: &Page) -> StorageResult<()> {
        let (dev_ord, local) = {
            let set = &self.shared.set;
            (set.t2_device_for_block(bn).index(), set.t2_local_bn(bn))
        };

        let not_contiguous = self.last_local.map_or(false, |last| local != last + 1);
        let device_changed = self
            .cur
            .as_ref()
            .and_then(|r| r.dev_index())
            .map_or(false, |d| d != dev_ord);
        if not_contiguous || device_changed {
            self.submit_or_queue(false, false);
        }

        let mut retried = false;
        loop {
            if self.cur.is_none() {
                self.alloc_request(Some(dev_ord))?;
            }
            let accepted = match self.cur.as_mut() {
                Some(req) => {
                    if req.dev_index().is_none() {
                        // Request came from prealloc; bind it now.
                        req.set_device(dev_ord);
                    }
                    if self.last_local.is_none() {
                        req.set_local_bn(local);
                    }
                    req.push_page(page.clone())
                }
                None => false,
            };
            if accepted {
                break;
            }
            if retried {
                return Err(StorageError::PageRejected {
                    device: dev_ord,
                    bn,
                });
            }
            // The device refused the page (vector limit): flush and retry
            // exactly once with a fresh request.
            retried = true;
            self.submit_or_queue(false, false);
        }

        // Eager submit at the ceiling bounds latency instead of accumulating
        // until a caller-driven flush.
        if self.n_vects != 1
            && self
                .cur
                .as_ref()
                .map_or(false, |r| r.page_count() == self.n_vects)
        {
            self.submit_or_queue(false, false);
        }

        self.last_local = Some(local);
        Ok(())
    }

    /// Flushes the current request (and, in delayed mode, every queued one),
    /// then releases the caller's reference.
    ///
    /// With `wait`, blocks until every outstanding request completes, fires
    /// the callback with the final indicator exactly once, and returns the
    /// last recorded error. Without `wait`, returns `Ok(())` immediately; the
    /// callback is then the only completion signal. A second call is a no-op.
    pub fn end(&mut self, wait: bool) -> StorageResult<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        debug!("end {} wait={}", self.shared.dir.as_str(), wait);

        self.submit_or_queue(true, true);

        if wait {
            self.shared.waiting.store(true, Ordering::Release);
        }
        self.shared.put();

        if wait {
            {
                let mut guard = self.shared.lock.lock();
                while self.shared.refcount.load(Ordering::Acquire) != 0 {
                    self.shared.cv.wait(&mut guard);
                }
            }
            let err = self.shared.err.lock().take();
            if let Some(done) = &self.shared.done {
                done(None, true);
            }
            return match err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        Ok(())
    }

    /// Allocates a fresh current request, taking one batch reference for it.
    fn alloc_request(&mut self, dev: Option<u16>) -> StorageResult<()> {
        debug_assert!(self.cur.is_none());
        let mut req = match BlockIoRequest::with_capacity(self.shared.dir, self.n_vects) {
            Ok(req) => req,
            Err(e) => {
                if !self.delay {
                    warn!("failed to allocate I/O request");
                }
                self.shared.record_err(StorageError::AllocationFailure);
                return Err(e);
            }
        };
        if let Some(d) = dev {
            req.set_device(d);
        }
        self.last_local = None;
        self.shared.get();
        self.cur = Some(req);
        debug!("new request n_vects={}", self.n_vects);
        Ok(())
    }

    /// Moves finished requests onward. With `flush`, the current request goes
    /// out even mid-fill (delayed ones too); with `done`, an empty leftover
    /// request is dropped. Otherwise a completed request is submitted, or
    /// queued in delayed mode.
    fn submit_or_queue(&mut self, flush: bool, done: bool) {
        if flush || done {
            if self.delay {
                let delayed = std::mem::take(&mut self.delayed);
                for req in delayed {
                    debug!("submit delayed request [{} pages]", req.page_count());
                    self.submit_one(req);
                }
            }

            let Some(req) = self.cur.take() else {
                return;
            };
            if !req.is_empty() {
                self.submit_one(req);
            } else if done {
                // Preallocated but never used: drop it and its reference.
                debug!("dropping empty request");
                drop(req);
                if self.shared.put() {
                    warn!("empty request held the last batch reference");
                }
            } else {
                // Flushing regular progress keeps an empty preallocation.
                self.cur = Some(req);
            }
        } else if self.cur.as_ref().map_or(false, |r| !r.is_empty()) {
            if let Some(req) = self.cur.take() {
                if self.delay {
                    debug!("queue request [{} pages]", req.page_count());
                    self.delayed.push(req);
                } else {
                    self.submit_one(req);
                }
            }
        }
    }

    /// Hands one request to its device with the completion wiring installed.
    fn submit_one(&self, mut req: BlockIoRequest) {
        let Some(dev_ord) = req.dev_index() else {
            drop(req);
            self.shared.put();
            return;
        };
        debug!(
            "submit request dev={} local_bn={:#x} [{} pages] max_v={}",
            dev_ord,
            req.local_bn().unwrap_or(0),
            req.page_count(),
            self.n_vects
        );

        let dev = Arc::clone(self.shared.set.device_info(dev_ord).device());
        let shared = Arc::clone(&self.shared);
        req.set_completion(Box::new(move |req, res| {
            let mdi = shared.set.device_info(dev_ord);
            match res {
                Err(e) => {
                    // Log loudly once per device and direction; re-armed by
                    // an intervening success.
                    if mdi.note_io_error(req.dir()) {
                        error!("{} failed on {}: {}", req.dir().as_str(), mdi.name(), e);
                    } else {
                        debug!("{}: err={} on {}", req.dir().as_str(), e, mdi.name());
                    }
                    shared.record_err(StorageError::IoCompletion {
                        device: dev_ord,
                        source: e,
                    });
                }
                Ok(()) => mdi.note_io_success(req.dir()),
            }
            if let Some(done) = &shared.done {
                done(Some(req), false);
            }
            shared.put();
        }));
        dev.submit(req);
    }
}

impl Drop for IoBatch {
    fn drop(&mut self) {
        if !self.ended {
            self.ended = true;
            self.submit_or_queue(true, true);
            self.shared.put();
        }
    }
}

/// Writes one page at tier-2 block `bn`, blocking until it completes.
pub fn write_page(set: &Arc<DeviceSet>, bn: u64, page: &Page) -> StorageResult<()> {
    sync_io_page(set, IoDirection::Write, bn, page)
}

/// Reads one page at tier-2 block `bn`, blocking until it completes.
pub fn read_page(set: &Arc<DeviceSet>, bn: u64, page: &Page) -> StorageResult<()> {
    sync_io_page(set, IoDirection::Read, bn, page)
}

fn sync_io_page(
    set: &Arc<DeviceSet>,
    dir: IoDirection,
    bn: u64,
    page: &Page,
) -> StorageResult<()> {
    let mut batch = IoBatch::begin(Arc::clone(set), dir, BatchOptions::default());
    debug!("sync {} bn={:#x}", dir.as_str(), bn);
    batch.add(bn, page)?;
    let res = batch.end(true);
    if let Err(ref e) = res {
        error!("io-error bn={:#x} => {}", bn, e);
    }
    res
}
