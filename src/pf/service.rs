//! PF-resident service answering relayed VF requests.

use log::debug;

use crate::error::{IovError, IovResult};
use crate::guc::hxg;

/// ABI version negotiation between VF and PF drivers.
pub const IOV_ACTION_VF2PF_HANDSHAKE: u16 = 0x0001;

/// Relay plumbing self-test; only honored on debug-enabled services.
pub const IOV_ACTION_SELFTEST_RELAY: u16 = 0xDEB1;
pub const SELFTEST_OPCODE_NOP: u32 = 0x0;
pub const SELFTEST_OPCODE_ECHO: u32 = 0xE;
pub const SELFTEST_OPCODE_FAIL: u32 = 0xF;

pub const IOV_VERSION_MAJOR: u16 = 1;
pub const IOV_VERSION_MINOR: u16 = 0;

/// Handles one relayed request and produces the full HXG response message.
/// Errors are turned into sanitized failure replies by the relay.
pub trait RelayService: Send + Sync {
    fn process_msg(&self, origin: u32, relay_id: u32, msg: &[u32]) -> IovResult<Vec<u32>>;
}

#[derive(Debug, Default)]
pub struct PfService;

impl PfService {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn handshake(&self, origin: u32, msg: &[u32]) -> IovResult<Vec<u32>> {
        let &[_, version] = msg else {
            return Err(IovError::MsgSize);
        };
        let major = (version >> 16) as u16;
        let minor = version as u16;

        // Major 0.0 asks for the latest; anything else must match us.
        let wants_latest = major == 0 && minor == 0;
        if !wants_latest && major != IOV_VERSION_MAJOR {
            return Err(IovError::errno(libc::EINVAL));
        }

        debug!(
            "VF{} handshake {}.{} -> {}.{}",
            origin, major, minor, IOV_VERSION_MAJOR, IOV_VERSION_MINOR
        );
        Ok(vec![
            hxg::response_success(0),
            (u32::from(IOV_VERSION_MAJOR) << 16) | u32::from(IOV_VERSION_MINOR),
        ])
    }

    fn selftest_relay(&self, msg: &[u32]) -> IovResult<Vec<u32>> {
        match hxg::data0(msg[0]) {
            SELFTEST_OPCODE_NOP => Ok(vec![hxg::response_success(0)]),
            SELFTEST_OPCODE_ECHO => {
                let mut response = vec![hxg::response_success(0)];
                response.extend_from_slice(&msg[1..]);
                Ok(response)
            }
            SELFTEST_OPCODE_FAIL => Err(IovError::errno(libc::EINVAL)),
            _ => Err(IovError::errno(libc::EBADRQC)),
        }
    }
}

impl RelayService for PfService {
    fn process_msg(&self, origin: u32, _relay_id: u32, msg: &[u32]) -> IovResult<Vec<u32>> {
        match hxg::action(msg[0]) {
            IOV_ACTION_VF2PF_HANDSHAKE => self.handshake(origin, msg),
            IOV_ACTION_SELFTEST_RELAY => self.selftest_relay(msg),
            _ => Err(IovError::errno(libc::EOPNOTSUPP)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_latest() {
        let service = PfService::new();
        let msg = [hxg::request(IOV_ACTION_VF2PF_HANDSHAKE, 0), 0];
        let reply = service.process_msg(1, 1, &msg).unwrap();
        assert_eq!(reply[1], 0x0001_0000);
    }

    #[test]
    fn handshake_wrong_major_rejected() {
        let service = PfService::new();
        let msg = [hxg::request(IOV_ACTION_VF2PF_HANDSHAKE, 0), 0x0002_0000];
        assert!(service.process_msg(1, 1, &msg).is_err());
    }

    #[test]
    fn unknown_action_not_supported() {
        let service = PfService::new();
        let msg = [hxg::request(0x7777, 0)];
        assert!(matches!(
            service.process_msg(1, 1, &msg),
            Err(IovError::Errno(code)) if code == libc::EOPNOTSUPP
        ));
    }
}
