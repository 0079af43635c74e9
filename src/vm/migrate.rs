//! Migration engine queue.
//!
//! PT-update jobs flow through one ordered queue per tile; their fences
//! therefore form a total order, which is what makes commit N observable
//! before commit N+1 on the same tile. Each job waits for its collected
//! dependencies, writes its qwords into the target page-table pages and
//! signals.

use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::thread::JoinHandle;

use log::debug;

use crate::vm::fence::Fence;
use crate::vm::pt::BoBuffer;

pub struct PtWrite {
    pub bo: Arc<BoBuffer>,
    pub ofs: usize,
    pub values: Vec<u64>,
}

#[derive(Default)]
pub struct MigrateJob {
    pub writes: Vec<PtWrite>,
    pub deps: Vec<Fence>,
}

struct QueueInner {
    tx: Sender<(MigrateJob, Fence)>,
    handle: Option<JoinHandle<()>>,
}

/// One tile's migration queue.
pub struct Migrator {
    inner: std::sync::Mutex<QueueInner>,
}

impl Migrator {
    #[must_use]
    pub fn new(tile_id: u8) -> Arc<Self> {
        let (tx, rx) = channel::<(MigrateJob, Fence)>();
        let handle = std::thread::Builder::new()
            .name(format!("migrate-{tile_id}"))
            .spawn(move || {
                while let Ok((job, fence)) = rx.recv() {
                    for dep in &job.deps {
                        dep.wait();
                    }
                    let qwords: usize = job.writes.iter().map(|w| w.values.len()).sum();
                    debug!("pt job: {} writes, {} qwords", job.writes.len(), qwords);
                    for write in &job.writes {
                        for (i, &value) in write.values.iter().enumerate() {
                            write.bo.write(write.ofs + i, value);
                        }
                    }
                    fence.signal();
                }
            })
            .expect("failed to spawn migrate thread");
        Arc::new(Self {
            inner: std::sync::Mutex::new(QueueInner {
                tx,
                handle: Some(handle),
            }),
        })
    }

    /// Queue a job; the returned fence signals once its writes are
    /// observable.
    pub fn submit(&self, job: MigrateJob) -> Fence {
        let fence = Fence::new();
        let inner = self.inner.lock().unwrap();
        inner
            .tx
            .send((job, fence.clone()))
            .expect("migrate queue gone");
        fence
    }

    /// Tear the queue down after draining it.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        let (tx, _) = channel();
        inner.tx = tx;
        if let Some(handle) = inner.handle.take() {
            let _ = handle.join();
        }
    }
}
