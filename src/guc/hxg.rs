//! HXG message envelope.
//!
//! Every host<->GuC message starts with one 32-bit header dword:
//!
//! ```text
//!  [31]    origin   HOST=0, GUC=1
//!  [30:28] type     see `HxgType`
//!  [27:16] data0    per-type payload (action data, error code, ...)
//!  [15:0]  action   per-origin action number
//! ```

use crate::error::{IovError, IovResult};

pub const HXG_MSG_MIN_LEN: usize = 1;

const HXG_ORIGIN_SHIFT: u32 = 31;
const HXG_TYPE_SHIFT: u32 = 28;
const HXG_TYPE_MASK: u32 = 0x7;
const HXG_DATA0_SHIFT: u32 = 16;
const HXG_DATA0_MASK: u32 = 0xfff;
const HXG_ACTION_MASK: u32 = 0xffff;

/// Failure responses split data0 into an error code and a hint:
/// `[27:16] hint` in the upper dword half, `[15:0] error` in the action
/// field position.
const HXG_FAILURE_HINT_SHIFT: u32 = 16;
const HXG_FAILURE_HINT_MASK: u32 = 0xfff;
const HXG_FAILURE_ERROR_MASK: u32 = 0xffff;

/// Success responses carry a 28-bit data0 `[27:0]`.
const HXG_RESPONSE_DATA0_MASK: u32 = 0x0fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HxgOrigin {
    Host = 0,
    Guc = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HxgType {
    Request = 0,
    FastRequest = 1,
    ResponseSuccess = 2,
    NoResponseBusy = 3,
    ResponseFailure = 4,
    NoResponseRetry = 5,
    Event = 6,
}

impl HxgType {
    #[must_use]
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Request),
            1 => Some(Self::FastRequest),
            2 => Some(Self::ResponseSuccess),
            3 => Some(Self::NoResponseBusy),
            4 => Some(Self::ResponseFailure),
            5 => Some(Self::NoResponseRetry),
            6 => Some(Self::Event),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::FastRequest => "fast-request",
            Self::ResponseSuccess => "response",
            Self::NoResponseBusy => "busy",
            Self::ResponseFailure => "failure",
            Self::NoResponseRetry => "retry",
            Self::Event => "event",
        }
    }
}

#[must_use]
pub const fn header(origin: HxgOrigin, type_: HxgType, data0: u32, action: u16) -> u32 {
    ((origin as u32) << HXG_ORIGIN_SHIFT)
        | ((type_ as u32) << HXG_TYPE_SHIFT)
        | ((data0 & HXG_DATA0_MASK) << HXG_DATA0_SHIFT)
        | (action as u32 & HXG_ACTION_MASK)
}

#[must_use]
pub const fn request(action: u16, data0: u32) -> u32 {
    header(HxgOrigin::Host, HxgType::Request, data0, action)
}

#[must_use]
pub const fn event(action: u16, data0: u32) -> u32 {
    header(HxgOrigin::Host, HxgType::Event, data0, action)
}

#[must_use]
pub const fn response_success(data0: u32) -> u32 {
    ((HxgOrigin::Host as u32) << HXG_ORIGIN_SHIFT)
        | ((HxgType::ResponseSuccess as u32) << HXG_TYPE_SHIFT)
        | (data0 & HXG_RESPONSE_DATA0_MASK)
}

#[must_use]
pub const fn response_failure(error: u16, hint: u16) -> u32 {
    ((HxgOrigin::Host as u32) << HXG_ORIGIN_SHIFT)
        | ((HxgType::ResponseFailure as u32) << HXG_TYPE_SHIFT)
        | ((hint as u32 & HXG_FAILURE_HINT_MASK) << HXG_FAILURE_HINT_SHIFT)
        | (error as u32 & HXG_FAILURE_ERROR_MASK)
}

#[must_use]
pub const fn origin(msg0: u32) -> HxgOrigin {
    if msg0 >> HXG_ORIGIN_SHIFT == 0 {
        HxgOrigin::Host
    } else {
        HxgOrigin::Guc
    }
}

pub fn type_of(msg0: u32) -> IovResult<HxgType> {
    HxgType::from_bits((msg0 >> HXG_TYPE_SHIFT) & HXG_TYPE_MASK).ok_or(IovError::Proto)
}

#[must_use]
pub const fn action(msg0: u32) -> u16 {
    (msg0 & HXG_ACTION_MASK) as u16
}

#[must_use]
pub const fn data0(msg0: u32) -> u32 {
    (msg0 >> HXG_DATA0_SHIFT) & HXG_DATA0_MASK
}

#[must_use]
pub const fn response_data0(msg0: u32) -> u32 {
    msg0 & HXG_RESPONSE_DATA0_MASK
}

#[must_use]
pub const fn failure_error(msg0: u32) -> u16 {
    (msg0 & HXG_FAILURE_ERROR_MASK) as u16
}

#[must_use]
pub const fn failure_hint(msg0: u32) -> u16 {
    ((msg0 >> HXG_FAILURE_HINT_SHIFT) & HXG_FAILURE_HINT_MASK) as u16
}

#[must_use]
pub const fn lower_32_bits(v: u64) -> u32 {
    v as u32
}

#[must_use]
pub const fn upper_32_bits(v: u64) -> u32 {
    (v >> 32) as u32
}

#[must_use]
pub const fn make_u64(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

const _: () = assert!(header(HxgOrigin::Guc, HxgType::Event, 0, 0x5106) == 0xE000_5106);
const _: () = assert!(response_failure(0xffff, 0) == 0x4000_FFFF);
