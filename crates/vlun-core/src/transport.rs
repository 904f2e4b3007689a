//! The kernel transport client and the trait seam the runtime is written
//! against.
//!
//! Every operation is one blocking ioctl on the control device. The handle is
//! shared across dispatcher workers; concurrent transact on one handle is
//! part of the kernel contract.

use crate::sys;
use nix::errno::Errno;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;
use vlun_proto::{Btl, StorageUnitParams, TransactReq, TransactRsp};
use zerocopy::FromZeros;

/// Control device node exposed by the kernel driver.
pub const DEVICE_PATH: &str = "/dev/vlun";

pub type TransportResult<T> = Result<T, TransportError>;

/// Failure categories for transport operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Device node or LUN does not exist.
    NotFound,
    /// Caller lacks the privilege to open or drive the device.
    AccessDenied,
    /// The kernel rejected the provisioning parameters.
    InvalidParameter,
    /// No free LUN slot or no resources.
    Exhausted,
    /// A live LUN already carries this identity.
    AlreadyExists,
    /// The call was interrupted by unprovision or device close.
    Cancelled,
    /// The kernel abandoned the paired request before the response arrived.
    TimedOut,
    /// Transient refusal; retrying may succeed.
    Busy,
    /// Anything else the kernel reported.
    Io,
}

/// Error surfaced by [`Transport`] implementations.
#[derive(Clone, Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: Option<String>,
}

impl TransportError {
    pub const fn new(kind: TransportErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for TransportError {}

/// Blocking channel to the kernel driver for one control handle.
///
/// `transact` is the only call that blocks for unbounded time; it is
/// interrupted by `unprovision` (kind [`TransportErrorKind::Cancelled`]) and
/// fails permanently once the transport is torn down.
pub trait Transport: Send + Sync {
    /// Create a virtual LUN with the given parameters.
    fn provision(&self, params: &StorageUnitParams) -> TransportResult<Btl>;

    /// Destroy a LUN. Unknown `btl` reports [`TransportErrorKind::NotFound`].
    fn unprovision(&self, btl: Btl) -> TransportResult<()>;

    /// Enumerate live LUNs owned by this handle.
    fn list(&self) -> TransportResult<Vec<Btl>>;

    /// Submit `response` (if any), then block until the next request.
    ///
    /// Read payloads leave through `data` alongside the response; write
    /// payloads and unmap descriptor arrays arrive through `data` with the
    /// request. With `request == None` the call is the one-shot submission
    /// used by deferred completion and returns as soon as the response is
    /// accepted. A returned request with `hint == 0` is a spurious wakeup.
    fn transact(
        &self,
        btl: Btl,
        response: Option<&TransactRsp>,
        request: Option<&mut TransactReq>,
        data: &mut [u8],
    ) -> TransportResult<()>;

    /// Set the per-LUN in-flight timeout enforced by the kernel.
    fn set_transact_timeout(&self, btl: Btl, timeout: Duration) -> TransportResult<()>;
}

/// [`Transport`] over the kernel control device.
#[derive(Debug)]
pub struct DeviceTransport {
    device: File,
}

impl DeviceTransport {
    /// Open the default control device node.
    pub fn open_default() -> TransportResult<Self> {
        Self::open(DEVICE_PATH)
    }

    pub fn open(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| open_error(path, err))?;
        Ok(Self { device })
    }

    fn fd(&self) -> i32 {
        self.device.as_raw_fd()
    }
}

impl Transport for DeviceTransport {
    fn provision(&self, params: &StorageUnitParams) -> TransportResult<Btl> {
        let mut msg = sys::ProvisionMsg {
            params: *params,
            btl: 0,
            reserved: 0,
        };
        unsafe { sys::vlun_provision(self.fd(), &mut msg) }.map_err(errno_error)?;
        Ok(Btl::from_raw(msg.btl))
    }

    fn unprovision(&self, btl: Btl) -> TransportResult<()> {
        let msg = sys::UnprovisionMsg {
            btl: btl.raw(),
            reserved: 0,
        };
        unsafe { sys::vlun_unprovision(self.fd(), &msg) }.map_err(errno_error)?;
        Ok(())
    }

    fn list(&self) -> TransportResult<Vec<Btl>> {
        let mut msg = sys::ListMsg::new_zeroed();
        unsafe { sys::vlun_list(self.fd(), &mut msg) }.map_err(errno_error)?;
        let count = (msg.count as usize).min(sys::LIST_MAX);
        Ok(msg.btls[..count].iter().map(|&raw| Btl::from_raw(raw)).collect())
    }

    fn transact(
        &self,
        btl: Btl,
        response: Option<&TransactRsp>,
        request: Option<&mut TransactReq>,
        data: &mut [u8],
    ) -> TransportResult<()> {
        let mut msg = sys::TransactMsg::new_zeroed();
        msg.btl = btl.raw();
        msg.data_buffer = data.as_mut_ptr() as u64;
        msg.data_length = data.len() as u32;
        if let Some(response) = response {
            msg.flags |= sys::TRANSACT_RSP_VALID;
            msg.response = *response;
        }
        if request.is_some() {
            msg.flags |= sys::TRANSACT_REQ_VALID;
        }
        unsafe { sys::vlun_transact(self.fd(), &mut msg) }.map_err(errno_error)?;
        if let Some(request) = request {
            *request = msg.request;
        }
        Ok(())
    }

    fn set_transact_timeout(&self, btl: Btl, timeout: Duration) -> TransportResult<()> {
        let msg = sys::SetTransactTimeoutMsg {
            btl: btl.raw(),
            timeout_ms: timeout.as_millis().min(u32::MAX as u128) as u32,
        };
        unsafe { sys::vlun_set_transact_timeout(self.fd(), &msg) }.map_err(errno_error)?;
        Ok(())
    }
}

fn open_error(path: &Path, err: io::Error) -> TransportError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => TransportErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => TransportErrorKind::AccessDenied,
        _ => TransportErrorKind::Io,
    };
    TransportError::with_message(kind, format!("open {}: {}", path.display(), err))
}

fn errno_error(errno: Errno) -> TransportError {
    let kind = match errno {
        Errno::ENOENT | Errno::ENXIO => TransportErrorKind::NotFound,
        Errno::EACCES | Errno::EPERM => TransportErrorKind::AccessDenied,
        Errno::EINVAL => TransportErrorKind::InvalidParameter,
        Errno::ENOSPC | Errno::ENOMEM | Errno::EMFILE => TransportErrorKind::Exhausted,
        Errno::EEXIST => TransportErrorKind::AlreadyExists,
        Errno::ECANCELED | Errno::EINTR | Errno::ENODEV | Errno::ESHUTDOWN => {
            TransportErrorKind::Cancelled
        }
        Errno::ETIMEDOUT | Errno::ETIME => TransportErrorKind::TimedOut,
        Errno::EBUSY | Errno::EAGAIN => TransportErrorKind::Busy,
        _ => TransportErrorKind::Io,
    };
    TransportError::with_message(kind, errno.desc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_the_contract() {
        assert_eq!(errno_error(Errno::ENOENT).kind(), TransportErrorKind::NotFound);
        assert_eq!(
            errno_error(Errno::EACCES).kind(),
            TransportErrorKind::AccessDenied
        );
        assert_eq!(
            errno_error(Errno::EINVAL).kind(),
            TransportErrorKind::InvalidParameter
        );
        assert_eq!(
            errno_error(Errno::ENOSPC).kind(),
            TransportErrorKind::Exhausted
        );
        assert_eq!(
            errno_error(Errno::EEXIST).kind(),
            TransportErrorKind::AlreadyExists
        );
        assert_eq!(
            errno_error(Errno::ECANCELED).kind(),
            TransportErrorKind::Cancelled
        );
        assert_eq!(errno_error(Errno::EIO).kind(), TransportErrorKind::Io);
    }

    #[test]
    fn open_missing_device_reports_not_found() {
        let err = DeviceTransport::open("/nonexistent/vlun").unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::NotFound);
    }
}
