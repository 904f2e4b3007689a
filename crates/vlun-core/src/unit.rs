//! The storage unit object: one provisioned LUN, its handler table, and the
//! state shared with the dispatcher pool.

use crate::transport::{DeviceTransport, Transport, TransportError, TransportErrorKind};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;
use vlun_proto::{
    Btl, Guid, ProtoError, StorageStatus, StorageUnitParams, TransactReq, TransactRsp,
    UnmapDescriptor, TRANSACT_KIND_COUNT,
};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failure categories for storage unit operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceErrorKind {
    InvalidParameter,
    AlreadyStarted,
    NotStarted,
    /// Thread spawn or allocation failure.
    Resource,
    NotFound,
    AccessDenied,
    Exhausted,
    AlreadyExists,
    Cancelled,
    TimedOut,
    /// Transport failure not covered by a more specific kind.
    Transport,
}

/// Errors surfaced by [`StorageUnit`] operations and latched by the
/// dispatcher.
#[derive(Clone, Debug)]
pub struct ServiceError {
    kind: ServiceErrorKind,
    message: Option<String>,
}

impl ServiceError {
    pub const fn new(kind: ServiceErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<TransportError> for ServiceError {
    fn from(err: TransportError) -> Self {
        let kind = match err.kind() {
            TransportErrorKind::NotFound => ServiceErrorKind::NotFound,
            TransportErrorKind::AccessDenied => ServiceErrorKind::AccessDenied,
            TransportErrorKind::InvalidParameter => ServiceErrorKind::InvalidParameter,
            TransportErrorKind::Exhausted => ServiceErrorKind::Exhausted,
            TransportErrorKind::AlreadyExists => ServiceErrorKind::AlreadyExists,
            TransportErrorKind::Cancelled => ServiceErrorKind::Cancelled,
            TransportErrorKind::TimedOut => ServiceErrorKind::TimedOut,
            TransportErrorKind::Busy | TransportErrorKind::Io => ServiceErrorKind::Transport,
        };
        ServiceError::with_message(kind, err.to_string())
    }
}

impl From<ProtoError> for ServiceError {
    fn from(err: ProtoError) -> Self {
        ServiceError::with_message(ServiceErrorKind::InvalidParameter, err.to_string())
    }
}

/// What a handler did with the request it was given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Respond now with the status the handler filled in.
    Complete,
    /// The handler stashed the hint and will answer later through
    /// [`StorageUnit::send_response`]; the worker submits nothing.
    Pending,
    /// No handler for this kind; the dispatcher answers
    /// CHECK CONDITION / ILLEGAL REQUEST / invalid command operation code.
    Unhandled,
}

/// Handler table for one storage unit. All methods default to
/// [`HandlerOutcome::Unhandled`], so an implementation only overrides the
/// operations its backing store supports.
///
/// Request payloads are slices of the worker's transfer buffer, sized to the
/// request (`block_count * block_length`, never above the unit's
/// `max_transfer_length`). Buffers must not escape the call; a handler that
/// needs to answer later returns [`HandlerOutcome::Pending`] after copying
/// what it needs, including the hint from [`crate::operation_context`].
#[allow(unused_variables)]
pub trait StorageUnitInterface: Send + Sync {
    /// Fill `buffer` with `block_count` blocks starting at `block_address`.
    fn read(
        &self,
        unit: &StorageUnit,
        block_address: u64,
        buffer: &mut [u8],
        block_count: u32,
        status: &mut StorageStatus,
    ) -> HandlerOutcome {
        HandlerOutcome::Unhandled
    }

    /// Persist `block_count` blocks from `buffer` starting at
    /// `block_address`.
    fn write(
        &self,
        unit: &StorageUnit,
        block_address: u64,
        buffer: &[u8],
        block_count: u32,
        status: &mut StorageStatus,
    ) -> HandlerOutcome {
        HandlerOutcome::Unhandled
    }

    fn flush(
        &self,
        unit: &StorageUnit,
        block_address: u64,
        block_count: u32,
        status: &mut StorageStatus,
    ) -> HandlerOutcome {
        HandlerOutcome::Unhandled
    }

    fn unmap(
        &self,
        unit: &StorageUnit,
        descriptors: &[UnmapDescriptor],
        status: &mut StorageStatus,
    ) -> HandlerOutcome {
        HandlerOutcome::Unhandled
    }
}

/// Handler table with every entry absent; used when the client passes no
/// interface, turning every request into an illegal-request response.
struct NullInterface;

impl StorageUnitInterface for NullInterface {}

pub(crate) struct DispatcherState {
    pub(crate) primary: Option<JoinHandle<()>>,
}

/// One provisioned virtual storage unit.
///
/// Owns the transport handle exclusively; the LUN is unprovisioned and the
/// handle closed when the last reference drops. The dispatcher must be
/// joined (via [`StorageUnit::wait_dispatcher`] or
/// [`StorageUnit::stop_dispatcher`]) before that can happen, since every
/// worker holds a reference.
pub struct StorageUnit {
    transport: Box<dyn Transport>,
    params: StorageUnitParams,
    btl: Btl,
    interface: Arc<dyn StorageUnitInterface>,
    user_context: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    debug_log: AtomicU32,
    pub(crate) dispatcher: Mutex<DispatcherState>,
    pub(crate) remaining_workers: AtomicU32,
    dispatcher_error: OnceLock<ServiceError>,
    shut_down: AtomicBool,
}

impl StorageUnit {
    /// Open the kernel transport, provision a LUN, and build the unit.
    ///
    /// A `None` interface installs a table of absent handlers: every request
    /// is answered with illegal-request sense.
    pub fn create(
        params: StorageUnitParams,
        interface: Option<Arc<dyn StorageUnitInterface>>,
    ) -> ServiceResult<Arc<Self>> {
        let transport = DeviceTransport::open_default()?;
        Self::with_transport(Box::new(transport), params, interface)
    }

    /// Build the unit over an already-open transport. This is the seam used
    /// by tests and by clients carrying their own transport.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        params: StorageUnitParams,
        interface: Option<Arc<dyn StorageUnitInterface>>,
    ) -> ServiceResult<Arc<Self>> {
        params.validate()?;
        let interface = interface.unwrap_or_else(|| Arc::new(NullInterface));
        let btl = transport.provision(&params)?;
        Ok(Arc::new(Self {
            transport,
            params,
            btl,
            interface,
            user_context: RwLock::new(None),
            debug_log: AtomicU32::new(0),
            dispatcher: Mutex::new(DispatcherState { primary: None }),
            remaining_workers: AtomicU32::new(0),
            dispatcher_error: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn btl(&self) -> Btl {
        self.btl
    }

    pub fn guid(&self) -> Guid {
        self.params.guid
    }

    pub fn params(&self) -> &StorageUnitParams {
        &self.params
    }

    pub fn interface(&self) -> Arc<dyn StorageUnitInterface> {
        Arc::clone(&self.interface)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Bit i set enables request/response debug events for kind i.
    pub fn set_debug_log(&self, mask: u32) {
        self.debug_log.store(mask, Ordering::Relaxed);
    }

    pub fn debug_log(&self) -> u32 {
        self.debug_log.load(Ordering::Relaxed)
    }

    /// Install a client context, returning the previous one. The runtime
    /// never looks inside it.
    pub fn set_user_context(
        &self,
        context: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut slot = self.user_context.write().unwrap();
        std::mem::replace(&mut *slot, context)
    }

    pub fn user_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_context.read().unwrap().clone()
    }

    /// Set the kernel-enforced in-flight timeout for this LUN.
    pub fn set_transact_timeout(&self, timeout: Duration) -> ServiceResult<()> {
        self.transport.set_transact_timeout(self.btl, timeout)?;
        Ok(())
    }

    /// The first error any worker observed, if the dispatcher has failed.
    pub fn dispatcher_error(&self) -> Option<ServiceError> {
        self.dispatcher_error.get().cloned()
    }

    /// Latch `err` if no worker latched before. First writer wins.
    pub(crate) fn latch_error(&self, err: ServiceError) {
        let _ = self.dispatcher_error.set(err);
    }

    /// Ask the dispatcher to exit: blocked transacts return `Cancelled` and
    /// new ones fail. Idempotent, and safe to invoke from a signal or
    /// console-handler context through [`crate::Guard::execute`], since it
    /// performs a single transport operation.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.transport.unprovision(self.btl) {
            if err.kind() != TransportErrorKind::NotFound {
                debug!(btl = %self.btl, error = %err, "shutdown unprovision failed");
            }
        }
    }

    pub(crate) fn log_request(&self, request: &TransactReq) {
        let mask = self.debug_log();
        if mask == 0 {
            return;
        }
        if request.kind < TRANSACT_KIND_COUNT && mask & (1 << request.kind) == 0 {
            return;
        }
        debug!(
            btl = %self.btl,
            hint = request.hint,
            kind = request.kind,
            "request"
        );
    }

    pub(crate) fn log_response(&self, response: &TransactRsp) {
        let mask = self.debug_log();
        if mask == 0 {
            return;
        }
        if response.kind < TRANSACT_KIND_COUNT && mask & (1 << response.kind) == 0 {
            return;
        }
        debug!(
            btl = %self.btl,
            hint = response.hint,
            kind = response.kind,
            scsi_status = response.status.scsi_status,
            sense_key = response.status.sense_data.sense_key,
            "response"
        );
    }
}

impl Drop for StorageUnit {
    fn drop(&mut self) {
        // shutdown() already unprovisioned; otherwise release the LUN here.
        // The transport handle closes with the box.
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            let _ = self.transport.unprovision(self.btl);
        }
    }
}

impl fmt::Debug for StorageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageUnit")
            .field("guid", &self.params.guid.to_string())
            .field("btl", &self.btl.to_string())
            .field("block_count", &self.params.block_count)
            .field("block_length", &self.params.block_length)
            .finish()
    }
}
