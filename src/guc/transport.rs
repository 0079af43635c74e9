//! Synchronous GuC send primitive.
//!
//! The GuC itself is an external collaborator; the driver only needs a
//! handle that can push a request blob and hand back the 28-bit result of a
//! `RESPONSE_SUCCESS`, plus a way to allocate memory the firmware can see.

use std::sync::{Arc, Mutex};

use crate::error::{IovError, IovResult};
use crate::guc::hxg;

/// GuC-visible scratch memory, addressed by its GGTT offset.
///
/// KLV pushes and save/restore traffic go through buffers like this one:
/// the CPU fills `data`, the request carries `gpu_addr`, and the firmware
/// reads or writes the same dwords.
#[derive(Debug, Clone)]
pub struct GucBuffer {
    pub gpu_addr: u64,
    pub data: Arc<Mutex<Vec<u32>>>,
}

impl GucBuffer {
    pub fn write(&self, words: &[u32]) {
        let mut data = self.data.lock().unwrap();
        data[..words.len()].copy_from_slice(words);
    }

    #[must_use]
    pub fn read(&self, dwords: usize) -> Vec<u32> {
        let data = self.data.lock().unwrap();
        data[..dwords.min(data.len())].to_vec()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to the GuC CT channel.
///
/// `send` blocks for the reply and returns the per-action `data0` count.
/// `send_nb` only queues; a congested channel surfaces as [`IovError::Busy`]
/// without queueing anything.
pub trait GucTransport: Send + Sync {
    fn send(&self, msg: &[u32]) -> IovResult<u32>;

    fn send_nb(&self, msg: &[u32]) -> IovResult<()>;

    /// Allocate `dwords` of zeroed GuC-visible memory.
    fn alloc_buf(&self, dwords: usize) -> IovResult<GucBuffer>;
}

/// Map a raw reply header onto the transport result convention.
///
/// Wire error codes stay positive: they are wrapped into
/// [`IovError::Guc`] here and nowhere else.
pub fn decode_reply(msg0: u32) -> IovResult<u32> {
    match hxg::type_of(msg0)? {
        hxg::HxgType::ResponseSuccess => Ok(hxg::response_data0(msg0)),
        hxg::HxgType::NoResponseBusy => Err(IovError::Busy),
        hxg::HxgType::NoResponseRetry => Err(IovError::Retry),
        hxg::HxgType::ResponseFailure => Err(IovError::Guc {
            code: hxg::failure_error(msg0),
            hint: hxg::failure_hint(msg0),
        }),
        _ => Err(IovError::Proto),
    }
}

/// Retry-from-the-beginning loop around [`GucTransport::send`].
///
/// `Retry` means resubmit after yielding; `Busy` is passed through so the
/// caller can decide between spinning and rescheduling a worker.
pub fn send_looped(guc: &dyn GucTransport, msg: &[u32]) -> IovResult<u32> {
    loop {
        match guc.send(msg) {
            Err(IovError::Retry) => std::thread::yield_now(),
            other => return other,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport used across the crate's unit tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use super::{GucBuffer, GucTransport};
    use crate::error::{IovError, IovResult};
    use crate::guc::{actions, hxg, klv};

    const SCRIPT_BUF_BASE: u64 = 0x100_0000;

    #[derive(Default)]
    struct Inner {
        sent: Vec<Vec<u32>>,
        replies: VecDeque<IovResult<u32>>,
        buffers: HashMap<u64, Arc<Mutex<Vec<u32>>>>,
        next_addr: u64,
        fail_all: Option<u16>,
    }

    /// Behaves like a well-behaved firmware unless told otherwise: config
    /// pushes are answered with the number of KLVs found in the referenced
    /// buffer, control requests with 0.
    #[derive(Default)]
    pub struct ScriptedGuc {
        inner: Mutex<Inner>,
    }

    impl ScriptedGuc {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue an explicit reply for the next `send`.
        pub fn push_reply(&self, reply: IovResult<u32>) {
            self.inner.lock().unwrap().replies.push_back(reply);
        }

        /// Make every subsequent request fail with the given wire code.
        pub fn fail_with(&self, code: u16) {
            self.inner.lock().unwrap().fail_all = Some(code);
        }

        pub fn recover(&self) {
            self.inner.lock().unwrap().fail_all = None;
        }

        pub fn sent(&self) -> Vec<Vec<u32>> {
            self.inner.lock().unwrap().sent.clone()
        }

        pub fn sent_actions(&self) -> Vec<u16> {
            self.sent().iter().map(|m| hxg::action(m[0])).collect()
        }

        pub fn clear_sent(&self) {
            self.inner.lock().unwrap().sent.clear();
        }

        /// KLV blobs pushed for `vfid` via UPDATE_VF_CFG, oldest first.
        pub fn pushed_cfg_blobs(&self, vfid: u32) -> Vec<Vec<u32>> {
            let inner = self.inner.lock().unwrap();
            inner
                .sent
                .iter()
                .filter(|m| hxg::action(m[0]) == actions::PF2GUC_UPDATE_VF_CFG && m[1] == vfid)
                .map(|m| {
                    let addr = hxg::make_u64(m[3], m[2]);
                    let len = m[4] as usize;
                    match inner.buffers.get(&addr) {
                        Some(buf) => buf.lock().unwrap()[..len].to_vec(),
                        None => Vec::new(),
                    }
                })
                .collect()
        }

        fn default_reply(inner: &Inner, msg: &[u32]) -> IovResult<u32> {
            match hxg::action(msg[0]) {
                actions::PF2GUC_UPDATE_VF_CFG => {
                    let addr = hxg::make_u64(msg[3], msg[2]);
                    let len = msg[4] as usize;
                    if len == 0 {
                        return Ok(0);
                    }
                    let buf = inner.buffers.get(&addr).ok_or(IovError::Proto)?;
                    let words = buf.lock().unwrap()[..len].to_vec();
                    klv::count_klvs(&words)
                }
                actions::PF2GUC_UPDATE_VGT_POLICY => {
                    let addr = hxg::make_u64(msg[2], msg[1]);
                    let len = msg[3] as usize;
                    let buf = inner.buffers.get(&addr).ok_or(IovError::Proto)?;
                    let words = buf.lock().unwrap()[..len].to_vec();
                    klv::count_klvs(&words)
                }
                actions::PF2GUC_SAVE_RESTORE_VF => Ok(msg[4].max(1024)),
                _ => Ok(0),
            }
        }
    }

    impl GucTransport for ScriptedGuc {
        fn send(&self, msg: &[u32]) -> IovResult<u32> {
            let mut inner = self.inner.lock().unwrap();
            inner.sent.push(msg.to_vec());
            if let Some(code) = inner.fail_all {
                return Err(IovError::Guc { code, hint: 0 });
            }
            match inner.replies.pop_front() {
                Some(reply) => reply,
                None => Self::default_reply(&inner, msg),
            }
        }

        fn send_nb(&self, msg: &[u32]) -> IovResult<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(code) = inner.fail_all {
                return Err(IovError::Guc { code, hint: 0 });
            }
            inner.sent.push(msg.to_vec());
            Ok(())
        }

        fn alloc_buf(&self, dwords: usize) -> IovResult<GucBuffer> {
            let mut inner = self.inner.lock().unwrap();
            let gpu_addr = SCRIPT_BUF_BASE + inner.next_addr;
            inner.next_addr += (dwords as u64 * 4).next_multiple_of(0x1000);
            let data = Arc::new(Mutex::new(vec![0u32; dwords]));
            inner.buffers.insert(gpu_addr, data.clone());
            Ok(GucBuffer { gpu_addr, data })
        }
    }
}
