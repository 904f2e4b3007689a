//! User-mode storage unit runtime.
//!
//! A [`StorageUnit`] owns one provisioned virtual LUN on the kernel transport
//! and a pool of dispatcher workers that pull requests out of the kernel,
//! invoke the client's [`StorageUnitInterface`] handlers, and push SCSI
//! status/sense responses back. Handlers may complete synchronously or defer
//! by returning [`HandlerOutcome::Pending`] and answering later through
//! [`StorageUnit::send_response`].

pub mod context;
pub mod guard;
pub mod transport;
pub mod unit;

mod dispatch;
mod sys;

pub use context::{operation_context, OperationContext};
pub use guard::Guard;
pub use transport::{
    DeviceTransport, Transport, TransportError, TransportErrorKind, TransportResult, DEVICE_PATH,
};
pub use unit::{
    HandlerOutcome, ServiceError, ServiceErrorKind, ServiceResult, StorageUnit,
    StorageUnitInterface,
};
