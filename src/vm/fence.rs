//! Completion fences.
//!
//! A small userspace rendition of the dma-fence contract: one-shot
//! signaling with an optional error, waiters with timeouts, callbacks that
//! run exactly once, and composition into arrays. The TLB invalidation
//! fence is built on top: it signals only after both the page-table job
//! and the invalidation acknowledgment have landed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::debug;

use crate::error::{IovError, IovResult};

type FenceCallback = Box<dyn FnOnce(&Fence) + Send>;

struct FenceState {
    signaled: bool,
    error: i32,
    callbacks: Vec<FenceCallback>,
}

struct FenceShared {
    state: Mutex<FenceState>,
    cv: Condvar,
}

#[derive(Clone)]
pub struct Fence {
    shared: Arc<FenceShared>,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .field("error", &self.error())
            .finish()
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FenceShared {
                state: Mutex::new(FenceState {
                    signaled: false,
                    error: 0,
                    callbacks: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// An already-signaled fence, used where an op turns out to be a no-op.
    #[must_use]
    pub fn signaled_stub() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        self.finish(0);
    }

    /// Record `error` (a positive errno) and signal.
    pub fn signal_with_error(&self, error: i32) {
        debug_assert!(error > 0);
        self.finish(error);
    }

    /// Record an error without signaling; later signals keep it.
    fn set_error(&self, error: i32) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.signaled && state.error == 0 {
            state.error = error;
        }
    }

    fn finish(&self, error: i32) {
        let callbacks = {
            let mut state = self.shared.state.lock().unwrap();
            if state.signaled {
                return;
            }
            state.signaled = true;
            if state.error == 0 {
                state.error = error;
            }
            std::mem::take(&mut state.callbacks)
        };
        self.shared.cv.notify_all();
        for cb in callbacks {
            cb(self);
        }
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.shared.state.lock().unwrap().signaled
    }

    /// Positive errno recorded at signal time, 0 if none.
    #[must_use]
    pub fn error(&self) -> i32 {
        self.shared.state.lock().unwrap().error
    }

    /// Register a callback to run on signal. If the fence is already
    /// signaled the callback is NOT run and an error is returned; the
    /// caller decides whether to run the work inline.
    pub fn add_callback(&self, cb: impl FnOnce(&Fence) + Send + 'static) -> Result<(), ()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.signaled {
            return Err(());
        }
        state.callbacks.push(Box::new(cb));
        Ok(())
    }

    pub fn wait(&self) {
        let state = self.shared.state.lock().unwrap();
        let _unused = self
            .shared
            .cv
            .wait_while(state, |s| !s.signaled)
            .unwrap();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> IovResult<()> {
        let state = self.shared.state.lock().unwrap();
        let (state, res) = self
            .shared
            .cv
            .wait_timeout_while(state, timeout, |s| !s.signaled)
            .unwrap();
        drop(state);
        if res.timed_out() {
            return Err(IovError::Timeout);
        }
        Ok(())
    }

    /// Compose fences into one that signals once all of them have, carrying
    /// the first error observed.
    #[must_use]
    pub fn array(fences: Vec<Fence>) -> Fence {
        if fences.is_empty() {
            return Fence::signaled_stub();
        }
        let composed = Fence::new();
        let remaining = Arc::new(AtomicUsize::new(fences.len()));
        for fence in fences {
            let composed = composed.clone();
            let remaining = remaining.clone();
            let arm = move |signaled: &Fence| {
                let err = signaled.error();
                if err != 0 {
                    composed.set_error(err);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    composed.signal();
                }
            };
            if fence.add_callback(arm.clone()).is_err() {
                // Already signaled: account for it inline.
                arm(&fence);
            }
        }
        composed
    }
}

/// Issues ranged TLB invalidations towards one GT; the returned fence
/// signals when the hardware acknowledges the flush.
pub trait TlbInvalidator: Send + Sync {
    fn invalidate_range(&self, start: u64, last: u64, asid: u32) -> Fence;
}

/// Build the composed invalidation fence for one GT: when `upstream` (the
/// PT-update job) signals cleanly, a worker issues the TLB invalidation and
/// the returned fence signals on its acknowledgment. Errors on the job
/// propagate immediately without a TLB round trip.
#[must_use]
pub fn invalidation_fence(
    tlb: Arc<dyn TlbInvalidator>,
    upstream: &Fence,
    start: u64,
    last: u64,
    asid: u32,
) -> Fence {
    let base = Fence::new();

    let run = {
        let base = base.clone();
        move |job: &Fence| {
            let err = job.error();
            if err != 0 {
                base.signal_with_error(err);
                return;
            }
            // Deferred work item: the flush request must not run from the
            // signaling context.
            std::thread::spawn(move || {
                debug!("tlb invalidate [{start:#x}..{last:#x}]");
                let ack = tlb.invalidate_range(start, last, asid);
                ack.wait();
                match ack.error() {
                    0 => base.signal(),
                    err => base.signal_with_error(err),
                }
            });
        }
    };

    let upstream = upstream.clone();
    if upstream.add_callback(run.clone()).is_err() {
        run(&upstream);
    }
    base
}
