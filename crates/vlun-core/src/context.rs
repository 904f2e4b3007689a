//! Per-worker operation context and the deferred completion path.
//!
//! While a dispatcher worker is inside a handler, a copy of the in-flight
//! request sits in thread-local storage. Handlers that answer later stash
//! the hint from here, return [`crate::HandlerOutcome::Pending`], and
//! eventually call [`StorageUnit::send_response`] from any thread.

use crate::unit::StorageUnit;
use std::cell::Cell;
use vlun_proto::{TransactReq, TransactRsp};

thread_local! {
    static OPERATION_CONTEXT: Cell<Option<OperationContext>> = const { Cell::new(None) };
}

/// Snapshot of the request a dispatcher worker is currently servicing.
#[derive(Clone, Copy, Debug)]
pub struct OperationContext {
    request: TransactReq,
}

impl OperationContext {
    /// The hint pairing this request with its eventual response.
    pub fn hint(&self) -> u64 {
        self.request.hint
    }

    pub fn kind(&self) -> u32 {
        self.request.kind
    }

    pub fn request(&self) -> &TransactReq {
        &self.request
    }

    pub(crate) fn set(request: &TransactReq) {
        OPERATION_CONTEXT.with(|slot| slot.set(Some(Self { request: *request })));
    }

    pub(crate) fn clear() {
        OPERATION_CONTEXT.with(|slot| slot.set(None));
    }
}

/// The operation context of the calling thread. `Some` only on a dispatcher
/// worker between request arrival and worker exit; `None` everywhere else.
pub fn operation_context() -> Option<OperationContext> {
    OPERATION_CONTEXT.with(|slot| slot.get())
}

impl StorageUnit {
    /// Complete a request whose handler returned
    /// [`crate::HandlerOutcome::Pending`].
    ///
    /// `response` must echo the original hint and kind; `data` carries the
    /// payload for deferred reads (empty otherwise). Callable from any
    /// thread. Submission failures latch the dispatcher error exactly like a
    /// worker-loop failure; there is nothing for the caller to handle, which
    /// is why nothing is returned.
    pub fn send_response(&self, response: &TransactRsp, data: &[u8]) {
        self.log_response(response);
        let mut buf = data.to_vec();
        if let Err(err) = self
            .transport()
            .transact(self.btl(), Some(response), None, &mut buf)
        {
            self.latch_error(err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlun_proto::FlushOp;

    #[test]
    fn context_is_thread_local() {
        assert!(operation_context().is_none());

        let req = TransactReq::flush(
            77,
            FlushOp {
                block_address: 0,
                block_count: 1,
                reserved: 0,
            },
        );
        OperationContext::set(&req);
        let ctx = operation_context().expect("context installed");
        assert_eq!(ctx.hint(), 77);
        assert_eq!(ctx.request(), &req);

        std::thread::spawn(|| assert!(operation_context().is_none()))
            .join()
            .unwrap();

        OperationContext::clear();
        assert!(operation_context().is_none());
    }
}
