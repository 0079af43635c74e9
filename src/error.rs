use thiserror::Error;

#[derive(Error, Debug)]
pub enum IovError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is momentarily congested; the caller may retry in place.
    #[error("GuC busy")]
    Busy,

    /// GuC asked us to back off and resubmit from the beginning.
    #[error("GuC retry requested")]
    Retry,

    /// A previous reply asked the waiter to re-arm and wait again.
    #[error("Try again")]
    Again,

    #[error("Operation timed out")]
    Timeout,

    #[error("Malformed wire message")]
    Proto,

    #[error("Message too long")]
    MsgSize,

    #[error("Malformed KLV blob")]
    MalformedBlob,

    #[error("Out of {0} space")]
    OutOfSpace(&'static str),

    #[error("Quota exceeded")]
    Quota,

    /// GuC rejected a request. `code` is the positive IOV wire error code,
    /// `hint` is optional extra data disclosed by the firmware.
    #[error("GuC error {code} (hint {hint})")]
    Guc { code: u16, hint: u16 },

    /// An errno-style failure raised by this driver, carried as a positive
    /// errno value so it can cross the relay wire unchanged.
    #[error("Error {0}")]
    Errno(i32),

    #[error("No reply matched the request")]
    NoMessage,

    #[error("Reply does not fit the caller's buffer")]
    NoBufs,

    #[error("VF{0} is wedged")]
    Wedged(u32),

    #[error("VF{0} FLR failed")]
    FlrFailed(u32),

    #[error("VM is killed")]
    VmKilled,

    #[error("Unsupported operation")]
    NotSupported,

    #[error("Firmware incompatibility: {0}")]
    FirmwareIncompatible(&'static str),
}

// A convenient alias
pub type IovResult<T> = Result<T, IovError>;

/// IOV wire error codes mostly match errno values; `0` deliberately
/// discloses nothing.
pub const IOV_ERROR_UNDISCLOSED: u16 = 0;

impl IovError {
    /// Positive wire code for a failure response. Errors without an errno
    /// identity are reported as undisclosed.
    #[must_use]
    pub fn to_wire_code(&self) -> u16 {
        match self {
            Self::Errno(e) => *e as u16,
            Self::Guc { code, .. } => *code,
            Self::Busy | Self::Again => libc::EBUSY as u16,
            Self::Retry => libc::EAGAIN as u16,
            Self::Timeout => libc::ETIMEDOUT as u16,
            Self::Proto => libc::EPROTO as u16,
            Self::MsgSize | Self::MalformedBlob => libc::EMSGSIZE as u16,
            Self::NoMessage => libc::ENODATA as u16,
            Self::NotSupported => libc::EOPNOTSUPP as u16,
            Self::OutOfSpace(_) | Self::Quota => libc::ENOSPC as u16,
            _ => IOV_ERROR_UNDISCLOSED,
        }
    }

    #[must_use]
    pub fn errno(code: i32) -> Self {
        debug_assert!(code > 0);
        Self::Errno(code)
    }
}
