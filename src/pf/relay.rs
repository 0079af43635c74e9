//! VF <-> PF message relay.
//!
//! Transports opaque HXG messages between VF drivers and the PF through the
//! GuC. Outbound requests get a fresh non-zero relay id and a pending
//! record; inbound traffic is matched back by (origin, relay id), never by
//! list position, because replies may arrive out of order.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, error};

use crate::error::{IovError, IovResult};
use crate::guc::actions::{
    GUC2PF_RELAY_FROM_VF, GUC2VF_RELAY_FROM_PF, PF2GUC_RELAY_TO_VF, RELAY_PAYLOAD_MAX_LEN,
    VF2GUC_RELAY_TO_PF,
};
use crate::guc::hxg::{self, HxgOrigin, HxgType};
use crate::guc::transport::GucTransport;
use crate::pf::service::RelayService;

/// How long to wait for a relay response; matches the CT heartbeat.
pub const RELAY_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotStatus {
    Waiting,
    Done(Vec<u32>),
    Failed(u16),
    NoBufs,
    Busy,
    Again,
}

struct Pending {
    target: u32,
    fence: u32,
    buf_size: usize,
    slot: Mutex<SlotStatus>,
    cv: Condvar,
}

#[derive(Default)]
struct RelayInner {
    last_fence: u32,
    // List ordering does not need to match fence ordering.
    pending: Vec<Arc<Pending>>,
}

pub struct Relay {
    guc: Arc<dyn GucTransport>,
    service: Mutex<Option<Arc<dyn RelayService>>>,
    total_vfs: u32,
    /// PF->VF failure replies normally disclose nothing about the error.
    disclose_errors: std::sync::atomic::AtomicBool,
    inner: Mutex<RelayInner>,
}

impl Relay {
    #[must_use]
    pub fn new(guc: Arc<dyn GucTransport>, total_vfs: u32) -> Self {
        Self {
            guc,
            service: Mutex::new(None),
            total_vfs,
            disclose_errors: std::sync::atomic::AtomicBool::new(false),
            inner: Mutex::new(RelayInner::default()),
        }
    }

    pub fn set_service(&self, service: Arc<dyn RelayService>) {
        *self.service.lock().unwrap() = Some(service);
    }

    /// Disclose real error codes in failure replies instead of sanitizing
    /// them to `UNDISCLOSED`. Meant for loopback testing only.
    pub fn set_disclose_errors(&self, on: bool) {
        self.disclose_errors
            .store(on, std::sync::atomic::Ordering::Relaxed);
    }

    fn sanitize_error(&self, error: u16) -> u16 {
        if self.disclose_errors.load(std::sync::atomic::Ordering::Relaxed) {
            error
        } else {
            crate::error::IOV_ERROR_UNDISCLOSED
        }
    }

    fn sanitize_hint(&self, hint: u16) -> u16 {
        if self.disclose_errors.load(std::sync::atomic::Ordering::Relaxed) {
            hint
        } else {
            0
        }
    }

    fn next_fence(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.last_fence = inner.last_fence.wrapping_add(1);
        if inner.last_fence == 0 {
            inner.last_fence = 1;
        }
        inner.last_fence
    }

    // =====================================================================
    // Outbound
    // =====================================================================

    fn relay_send(&self, target: u32, relay_id: u32, msg: &[u32]) -> IovResult<()> {
        assert!(!msg.is_empty());
        assert!(msg.len() <= RELAY_PAYLOAD_MAX_LEN, "relay payload too long");
        debug!(
            "sending {}.{} to {}",
            hxg::type_of(msg[0])?.as_str(),
            relay_id,
            target
        );

        let mut frame = if target != 0 {
            vec![hxg::request(PF2GUC_RELAY_TO_VF, 0), target, relay_id]
        } else {
            vec![hxg::request(VF2GUC_RELAY_TO_PF, 0), relay_id]
        };
        frame.extend_from_slice(msg);

        loop {
            match self.guc.send_nb(&frame) {
                Ok(()) => return Ok(()),
                Err(IovError::Busy) => std::thread::yield_now(),
                Err(err) => {
                    error!(
                        "Failed to send {}.{} to {} ({})",
                        hxg::type_of(msg[0])?.as_str(),
                        relay_id,
                        target,
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    fn unlink(&self, pending: &Arc<Pending>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|p| !Arc::ptr_eq(p, pending));
    }

    fn send_and_wait(
        &self,
        target: u32,
        relay_id: u32,
        msg: &[u32],
        buf_size: usize,
    ) -> IovResult<Vec<u32>> {
        assert_eq!(hxg::origin(msg[0]), HxgOrigin::Host);
        assert_eq!(hxg::type_of(msg[0])?, HxgType::Request);

        let pending = Arc::new(Pending {
            target,
            fence: relay_id,
            buf_size,
            slot: Mutex::new(SlotStatus::Waiting),
            cv: Condvar::new(),
        });
        self.inner.lock().unwrap().pending.push(pending.clone());

        let res = self.send_and_wait_pending(target, relay_id, msg, &pending);
        self.unlink(&pending);

        if let Err(err) = &res {
            error!(
                "Unsuccessful request.{} {:#x} to {} ({})",
                relay_id,
                hxg::action(msg[0]),
                target,
                err
            );
        }
        res
    }

    fn send_and_wait_pending(
        &self,
        target: u32,
        relay_id: u32,
        msg: &[u32],
        pending: &Arc<Pending>,
    ) -> IovResult<Vec<u32>> {
        'retry: loop {
            self.relay_send(target, relay_id, msg)?;

            loop {
                let slot = pending.slot.lock().unwrap();
                let (mut slot, timeout) = pending
                    .cv
                    .wait_timeout_while(slot, RELAY_TIMEOUT, |s| *s == SlotStatus::Waiting)
                    .unwrap();
                if *slot == SlotStatus::Waiting {
                    debug_assert!(timeout.timed_out());
                    return Err(IovError::Timeout);
                }

                debug!("{}.{} reply={:?}", target, relay_id, *slot);
                match std::mem::replace(&mut *slot, SlotStatus::Waiting) {
                    SlotStatus::Done(data) => return Ok(data),
                    SlotStatus::NoBufs => return Err(IovError::NoBufs),
                    SlotStatus::Failed(0) => {
                        return Err(IovError::Guc { code: 0, hint: 0 });
                    }
                    SlotStatus::Failed(code) => return Err(IovError::Errno(code as i32)),
                    // Busy: the far end re-arms us, keep waiting.
                    SlotStatus::Busy => {}
                    // Again: resubmit from the top with the same fence.
                    SlotStatus::Again => continue 'retry,
                    SlotStatus::Waiting => unreachable!(),
                }
            }
        }
    }

    /// Send a message to a VF. Requests wait for the matching reply and
    /// return it (first dword is the response data0); events return
    /// immediately with an empty reply.
    pub fn send_to_vf(&self, target: u32, msg: &[u32], buf_size: usize) -> IovResult<Vec<u32>> {
        assert!(msg.len() >= hxg::HXG_MSG_MIN_LEN);
        assert_eq!(hxg::origin(msg[0]), HxgOrigin::Host);
        assert!(buf_size <= RELAY_PAYLOAD_MAX_LEN);

        let relay_id = self.next_fence();
        match hxg::type_of(msg[0])? {
            HxgType::Event => {
                self.relay_send(target, relay_id, msg)?;
                Ok(Vec::new())
            }
            HxgType::Request => self.send_and_wait(target, relay_id, msg, buf_size),
            _ => Err(IovError::Proto),
        }
    }

    /// VF-side transmit path towards the PF.
    pub fn send_to_pf(&self, msg: &[u32], buf_size: usize) -> IovResult<Vec<u32>> {
        assert!(msg.len() >= hxg::HXG_MSG_MIN_LEN);
        assert_eq!(hxg::origin(msg[0]), HxgOrigin::Host);

        let relay_id = self.next_fence();
        match hxg::type_of(msg[0])? {
            HxgType::Event => {
                self.relay_send(0, relay_id, msg)?;
                Ok(Vec::new())
            }
            HxgType::Request => self.send_and_wait(0, relay_id, msg, buf_size),
            _ => Err(IovError::Proto),
        }
    }

    /// Send a fully formed response message back to a VF.
    pub fn reply_to_vf(&self, target: u32, relay_id: u32, msg: &[u32]) -> IovResult<()> {
        let type_ = hxg::type_of(msg[0])?;
        assert!(type_ != HxgType::Request && type_ != HxgType::Event);
        self.relay_send(target, relay_id, msg)
    }

    /// Success response with a small piece of return data.
    pub fn reply_ack_to_vf(&self, target: u32, relay_id: u32, data: u32) -> IovResult<()> {
        self.relay_send(target, relay_id, &[hxg::response_success(data)])
    }

    /// Failure response derived from a driver error.
    pub fn reply_err_to_vf(&self, target: u32, relay_id: u32, err: &IovError) -> IovResult<()> {
        let error = self.sanitize_error(err.to_wire_code());
        self.relay_send(target, relay_id, &[hxg::response_failure(error, 0)])
    }

    /// Failure response with an explicit error and hint.
    pub fn reply_error_to_vf(
        &self,
        target: u32,
        relay_id: u32,
        error: u16,
        hint: u16,
    ) -> IovResult<()> {
        let error = self.sanitize_error(error);
        let hint = self.sanitize_hint(hint);
        self.relay_send(target, relay_id, &[hxg::response_failure(error, hint)])
    }

    // =====================================================================
    // Inbound
    // =====================================================================

    fn handle_request(&self, origin: u32, relay_id: u32, msg: &[u32]) -> IovResult<()> {
        let service = self.service.lock().unwrap().clone();
        let res = match service {
            Some(service) => service.process_msg(origin, relay_id, msg),
            None => Err(IovError::NotSupported),
        };

        match res {
            Ok(response) => self.reply_to_vf(origin, relay_id, &response),
            Err(err) => {
                error!("Failed to handle request.{relay_id} from {origin} ({err})");
                let code = if origin != 0 {
                    self.sanitize_error(err.to_wire_code())
                } else {
                    err.to_wire_code()
                };
                self.relay_send(origin, relay_id, &[hxg::response_failure(code, 0)])
            }
        }
    }

    fn handle_reply(
        &self,
        origin: u32,
        relay_id: u32,
        status: SlotStatus,
        msg: &[u32],
    ) -> IovResult<()> {
        let pending = {
            let inner = self.inner.lock().unwrap();
            inner
                .pending
                .iter()
                .find(|p| p.target == origin && p.fence == relay_id)
                .cloned()
        };

        // Unknown relay ids are transport races; drop them quietly.
        let Some(pending) = pending else {
            debug!("{origin}.{relay_id} does not match any pending relay");
            return Ok(());
        };

        let mut slot = pending.slot.lock().unwrap();
        let mut ret = Ok(());
        *slot = match status {
            SlotStatus::Done(_) => {
                if msg.len() > pending.buf_size.max(1) {
                    ret = Err(IovError::NoBufs);
                    SlotStatus::NoBufs
                } else {
                    let mut data = Vec::with_capacity(msg.len());
                    data.push(hxg::response_data0(msg[0]));
                    data.extend_from_slice(&msg[1..]);
                    SlotStatus::Done(data)
                }
            }
            other => other,
        };
        pending.cv.notify_all();
        ret
    }

    fn process_msg(&self, origin: u32, relay_id: u32, msg: &[u32]) -> IovResult<()> {
        if msg.len() < hxg::HXG_MSG_MIN_LEN {
            return Err(IovError::Proto);
        }
        if hxg::origin(msg[0]) != HxgOrigin::Host {
            return Err(IovError::Proto);
        }

        let type_ = hxg::type_of(msg[0])?;
        debug!(
            "received {}.{} from {}",
            type_.as_str(),
            relay_id,
            origin
        );

        let res = match type_ {
            HxgType::Request => self.handle_request(origin, relay_id, msg),
            HxgType::Event => Err(IovError::NotSupported),
            HxgType::ResponseSuccess => {
                self.handle_reply(origin, relay_id, SlotStatus::Done(Vec::new()), msg)
            }
            HxgType::NoResponseBusy => self.handle_reply(origin, relay_id, SlotStatus::Busy, msg),
            HxgType::NoResponseRetry => self.handle_reply(origin, relay_id, SlotStatus::Again, msg),
            HxgType::ResponseFailure => {
                let error = hxg::failure_error(msg[0]);
                debug!(
                    "{}.{} error {:#x} hint {}",
                    origin,
                    relay_id,
                    error,
                    hxg::failure_hint(msg[0])
                );
                self.handle_reply(origin, relay_id, SlotStatus::Failed(error), msg)
            }
            HxgType::FastRequest => Err(IovError::errno(libc::EBADRQC)),
        };

        if let Err(err) = &res {
            error!(
                "Failed to process {}.{} from {} ({})",
                type_.as_str(),
                relay_id,
                origin,
                err
            );
        }
        res
    }

    /// Handle a relay frame delivered to the PF. The frame must carry a
    /// valid non-zero VFID.
    pub fn process_guc2pf(&self, msg: &[u32]) -> IovResult<()> {
        const HDR: usize = 3; // action, vfid, relay_id

        if msg.len() < HDR {
            return Err(IovError::Proto);
        }
        if msg.len() > HDR + RELAY_PAYLOAD_MAX_LEN {
            return Err(IovError::MsgSize);
        }
        debug_assert_eq!(hxg::origin(msg[0]), HxgOrigin::Guc);
        debug_assert_eq!(hxg::type_of(msg[0])?, HxgType::Event);
        debug_assert_eq!(hxg::action(msg[0]), GUC2PF_RELAY_FROM_VF);
        if hxg::data0(msg[0]) != 0 {
            return Err(IovError::FirmwareIncompatible("relay event data0"));
        }

        let origin = msg[1];
        let relay_id = msg[2];
        if origin == 0 || origin > self.total_vfs {
            return Err(IovError::Proto);
        }

        self.process_msg(origin, relay_id, &msg[HDR..])
    }

    /// Handle a relay frame delivered to a VF (or looped back to the PF).
    pub fn process_guc2vf(&self, msg: &[u32]) -> IovResult<()> {
        const HDR: usize = 2; // action, relay_id

        if msg.len() < HDR {
            return Err(IovError::Proto);
        }
        if msg.len() > HDR + RELAY_PAYLOAD_MAX_LEN {
            return Err(IovError::MsgSize);
        }
        debug_assert_eq!(hxg::origin(msg[0]), HxgOrigin::Guc);
        debug_assert_eq!(hxg::type_of(msg[0])?, HxgType::Event);
        debug_assert_eq!(hxg::action(msg[0]), GUC2VF_RELAY_FROM_PF);
        if hxg::data0(msg[0]) != 0 {
            return Err(IovError::FirmwareIncompatible("relay event data0"));
        }

        let relay_id = msg[1];
        self.process_msg(0, relay_id, &msg[HDR..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guc::transport::GucBuffer;
    use crate::guc::transport::testing::ScriptedGuc;
    use crate::pf::service::{
        IOV_ACTION_SELFTEST_RELAY, PfService, SELFTEST_OPCODE_ECHO, SELFTEST_OPCODE_FAIL,
        SELFTEST_OPCODE_NOP,
    };
    use std::sync::Weak;

    /// Feeds every outbound relay frame straight back into the relay, the
    /// way the firmware would for a self-addressed message.
    struct LoopbackGuc {
        relay: Mutex<Weak<Relay>>,
    }

    impl LoopbackGuc {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                relay: Mutex::new(Weak::new()),
            })
        }

        fn attach(&self, relay: &Arc<Relay>) {
            *self.relay.lock().unwrap() = Arc::downgrade(relay);
        }
    }

    impl GucTransport for LoopbackGuc {
        fn send(&self, _msg: &[u32]) -> IovResult<u32> {
            Ok(0)
        }

        fn send_nb(&self, msg: &[u32]) -> IovResult<()> {
            let relay = self.relay.lock().unwrap().upgrade().unwrap();
            match hxg::action(msg[0]) {
                PF2GUC_RELAY_TO_VF => {
                    // target is msg[1]; loopback ignores it.
                    let mut frame = vec![
                        hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2VF_RELAY_FROM_PF),
                        msg[2],
                    ];
                    frame.extend_from_slice(&msg[3..]);
                    let _ = relay.process_guc2vf(&frame);
                    Ok(())
                }
                VF2GUC_RELAY_TO_PF => {
                    let mut frame = vec![
                        hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_RELAY_FROM_VF),
                        1, // report origin VF1
                        msg[1],
                    ];
                    frame.extend_from_slice(&msg[2..]);
                    let _ = relay.process_guc2pf(&frame);
                    Ok(())
                }
                _ => Err(IovError::Proto),
            }
        }

        fn alloc_buf(&self, dwords: usize) -> IovResult<GucBuffer> {
            Ok(GucBuffer {
                gpu_addr: 0,
                data: Arc::new(Mutex::new(vec![0; dwords])),
            })
        }
    }

    fn loopback_relay() -> (Arc<Relay>, Arc<LoopbackGuc>) {
        let guc = LoopbackGuc::new();
        let relay = Arc::new(Relay::new(guc.clone(), 4));
        relay.set_service(Arc::new(PfService::new()));
        relay.set_disclose_errors(true);
        guc.attach(&relay);
        (relay, guc)
    }

    fn selftest_request(opcode: u32, payload: &[u32]) -> Vec<u32> {
        let mut msg = vec![hxg::request(IOV_ACTION_SELFTEST_RELAY, opcode)];
        msg.extend_from_slice(payload);
        msg
    }

    #[test]
    fn loopback_echo_returns_payload() {
        let (relay, _guc) = loopback_relay();
        let payload = [0xdead_beef, 0xcafe_f00d, 7];
        let reply = relay
            .send_to_vf(0, &selftest_request(SELFTEST_OPCODE_ECHO, &payload), 16)
            .unwrap();
        assert_eq!(reply[0], 0); // data0 MBZ
        assert_eq!(&reply[1..], &payload);
    }

    #[test]
    fn loopback_nop_returns_no_data() {
        let (relay, _guc) = loopback_relay();
        let reply = relay
            .send_to_vf(0, &selftest_request(SELFTEST_OPCODE_NOP, &[]), 16)
            .unwrap();
        assert_eq!(reply, vec![0]);
    }

    #[test]
    fn loopback_fail_surfaces_error() {
        let (relay, _guc) = loopback_relay();
        let err = relay
            .send_to_vf(0, &selftest_request(SELFTEST_OPCODE_FAIL, &[]), 16)
            .unwrap_err();
        assert!(matches!(err, IovError::Errno(code) if code == libc::EINVAL));
    }

    #[test]
    fn vf_to_pf_request_round_trip() {
        let (relay, _guc) = loopback_relay();
        let payload = [1, 2, 3];
        let reply = relay
            .send_to_pf(&selftest_request(SELFTEST_OPCODE_ECHO, &payload), 16)
            .unwrap();
        assert_eq!(&reply[1..], &payload);
    }

    #[test]
    fn undisclosed_failure_without_selftest_mode() {
        let (relay, _guc) = loopback_relay();
        relay.set_disclose_errors(false);
        let err = relay
            .send_to_vf(0, &selftest_request(SELFTEST_OPCODE_FAIL, &[]), 16)
            .unwrap_err();
        assert!(matches!(err, IovError::Guc { code: 0, hint: 0 }));
    }

    #[test]
    fn reply_too_large_for_buffer() {
        let (relay, _guc) = loopback_relay();
        let payload = [9; 8];
        let err = relay
            .send_to_vf(0, &selftest_request(SELFTEST_OPCODE_ECHO, &payload), 4)
            .unwrap_err();
        assert!(matches!(err, IovError::NoBufs));
    }

    #[test]
    fn failure_reply_unlinks_pending() {
        let guc = ScriptedGuc::new();
        let relay = Arc::new(Relay::new(guc.clone(), 4));
        let relay2 = relay.clone();

        let sender = std::thread::spawn(move || {
            relay2.send_to_vf(1, &[hxg::request(0x1234, 0)], 8)
        });

        // Give the sender time to register its pending record; the first
        // fence id handed out is always 1.
        std::thread::sleep(Duration::from_millis(50));
        let frame = [
            hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_RELAY_FROM_VF),
            1, // origin VF1
            1, // relay_id
            hxg::response_failure(61, 0),
        ];
        relay.process_guc2pf(&frame).unwrap();

        let err = sender.join().unwrap().unwrap_err();
        assert!(matches!(err, IovError::Errno(61)));
        assert!(relay.inner.lock().unwrap().pending.is_empty());
    }

    #[test]
    fn busy_then_success_reply() {
        let guc = ScriptedGuc::new();
        let relay = Arc::new(Relay::new(guc.clone(), 4));
        let relay2 = relay.clone();

        let sender =
            std::thread::spawn(move || relay2.send_to_vf(2, &[hxg::request(0x1234, 0)], 8));

        std::thread::sleep(Duration::from_millis(50));
        let busy = [
            hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_RELAY_FROM_VF),
            2,
            1,
            hxg::header(HxgOrigin::Host, HxgType::NoResponseBusy, 0, 0),
        ];
        relay.process_guc2pf(&busy).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let done = [
            hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_RELAY_FROM_VF),
            2,
            1,
            hxg::response_success(5),
            77,
        ];
        relay.process_guc2pf(&done).unwrap();

        let reply = sender.join().unwrap().unwrap();
        assert_eq!(reply, vec![5, 77]);
    }

    #[test]
    fn unknown_relay_id_is_dropped() {
        let (relay, _guc) = loopback_relay();
        let frame = [
            hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_RELAY_FROM_VF),
            1,
            0xdead,
            hxg::response_success(0),
        ];
        relay.process_guc2pf(&frame).unwrap();
    }

    #[test]
    fn guc2pf_rejects_zero_or_out_of_range_vfid() {
        let (relay, _guc) = loopback_relay();
        let mk = |vfid| {
            [
                hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_RELAY_FROM_VF),
                vfid,
                1,
                hxg::response_success(0),
            ]
        };
        assert!(matches!(relay.process_guc2pf(&mk(0)), Err(IovError::Proto)));
        assert!(matches!(relay.process_guc2pf(&mk(99)), Err(IovError::Proto)));
    }

    #[test]
    fn fence_ids_skip_zero_on_wrap() {
        let (relay, _guc) = loopback_relay();
        relay.inner.lock().unwrap().last_fence = u32::MAX;
        assert_eq!(relay.next_fence(), 1);
    }
}
