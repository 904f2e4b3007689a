//! The dispatcher pool: worker threads coupling the kernel transport to the
//! handler table.
//!
//! Workers share nothing but the storage unit itself. Each one blocks in
//! `transact`, carrying the previous response in and the next request out of
//! the kernel in a single call. Fan-out is a spawn chain: every worker that
//! observes the remaining-worker counter above one spawns a single sibling
//! before its first transact, and joins that sibling on the way out.

use crate::context::OperationContext;
use crate::transport::TransportErrorKind;
use crate::unit::{HandlerOutcome, ServiceError, ServiceErrorKind, ServiceResult, StorageUnit};
use nix::sched::{sched_getaffinity, CpuSet};
use nix::unistd::Pid;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};
use vlun_proto::{
    scsi, Operation, StorageStatus, TransactReq, TransactRsp, UnmapDescriptor,
    UNMAP_DESCRIPTOR_LEN,
};
use zerocopy::FromBytes;

impl StorageUnit {
    /// Start `thread_count` dispatcher workers. Zero means one per CPU in
    /// the process affinity mask, floor 1.
    ///
    /// Fails with [`ServiceErrorKind::AlreadyStarted`] while a dispatcher is
    /// running or unjoined, and with [`ServiceErrorKind::Resource`] if the
    /// first worker cannot be spawned.
    pub fn start_dispatcher(self: &Arc<Self>, thread_count: u32) -> ServiceResult<()> {
        let mut state = self.dispatcher.lock().unwrap();
        if state.primary.is_some() {
            return Err(ServiceError::new(ServiceErrorKind::AlreadyStarted));
        }

        let thread_count = if thread_count == 0 {
            default_thread_count()
        } else {
            thread_count
        };
        self.remaining_workers.store(thread_count, Ordering::SeqCst);

        let unit = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("vlun-dispatch-0".into())
            .spawn(move || worker_main(unit, 0))
            .map_err(|err| {
                ServiceError::with_message(
                    ServiceErrorKind::Resource,
                    format!("spawn dispatcher worker: {err}"),
                )
            })?;
        state.primary = Some(handle);
        debug!(btl = %self.btl(), workers = thread_count, "dispatcher started");
        Ok(())
    }

    /// Block until every worker has exited, then report the first error the
    /// pool observed (if any). Cancellation from [`StorageUnit::shutdown`]
    /// surfaces as [`ServiceErrorKind::Cancelled`].
    pub fn wait_dispatcher(&self) -> ServiceResult<()> {
        let handle = { self.dispatcher.lock().unwrap().primary.take() };
        let Some(handle) = handle else {
            return Err(ServiceError::new(ServiceErrorKind::NotStarted));
        };
        if handle.join().is_err() {
            self.latch_error(ServiceError::with_message(
                ServiceErrorKind::Resource,
                "dispatcher worker panicked",
            ));
        }
        match self.dispatcher_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Shut the transport down and join the pool. No-op when the dispatcher
    /// was never started.
    pub fn stop_dispatcher(&self) {
        self.shutdown();
        let _ = self.wait_dispatcher();
    }
}

/// One worker: spawn the next link of the chain if workers are still owed,
/// run the transact loop, then unwind in reverse.
fn worker_main(unit: Arc<StorageUnit>, index: u32) {
    let mut sibling = None;
    let owed = unit
        .remaining_workers
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n > 1).then(|| n - 1)
        })
        .is_ok();
    if owed {
        let clone = Arc::clone(&unit);
        match thread::Builder::new()
            .name(format!("vlun-dispatch-{}", index + 1))
            .spawn(move || worker_main(clone, index + 1))
        {
            Ok(handle) => sibling = Some(handle),
            Err(err) => {
                unit.latch_error(ServiceError::with_message(
                    ServiceErrorKind::Resource,
                    format!("spawn dispatcher worker: {err}"),
                ));
                return;
            }
        }
    }

    trace!(btl = %unit.btl(), worker = index, "dispatcher worker running");
    let exit = run_worker(&unit);
    OperationContext::clear();
    debug!(btl = %unit.btl(), worker = index, error = %exit, "dispatcher worker exiting");
    unit.latch_error(exit);

    if let Some(handle) = sibling {
        let _ = handle.join();
    }
}

/// The transact loop. Only a fatal transport error ends it; the returned
/// error is latched by the caller.
fn run_worker(unit: &StorageUnit) -> ServiceError {
    let mut data = vec![0u8; unit.params().max_transfer_length as usize];
    let mut request = TransactReq::zeroed();
    let mut response: Option<TransactRsp> = None;

    loop {
        let submitting = response.is_some();
        match unit
            .transport()
            .transact(unit.btl(), response.as_ref(), Some(&mut request), &mut data)
        {
            Ok(()) => {}
            Err(err)
                if submitting
                    && matches!(
                        err.kind(),
                        TransportErrorKind::TimedOut | TransportErrorKind::Busy
                    ) =>
            {
                // The kernel abandoned the paired request before our answer
                // arrived; the response is lost but the worker lives on.
                debug!(btl = %unit.btl(), error = %err, "response refused for abandoned request");
                response = None;
                continue;
            }
            Err(err) => return err.into(),
        }
        response = None;

        if request.is_spurious() {
            continue;
        }

        unit.log_request(&request);
        response = dispatch_request(unit, &request, &mut data);
        if let Some(rsp) = &response {
            unit.log_response(rsp);
        }
    }
}

/// Invoke the handler for one request and build its response, or `None` when
/// the handler deferred completion.
fn dispatch_request(
    unit: &StorageUnit,
    request: &TransactReq,
    data: &mut [u8],
) -> Option<TransactRsp> {
    OperationContext::set(request);

    let interface = unit.interface();
    let block_length = unit.params().block_length as u64;
    let mut status = StorageStatus::good();

    let outcome = match request.operation() {
        Ok(Operation::Read(op)) => match payload_len(data, op.block_count, block_length) {
            Some(len) => interface.read(
                unit,
                op.block_address,
                &mut data[..len],
                op.block_count,
                &mut status,
            ),
            None => HandlerOutcome::Unhandled,
        },
        Ok(Operation::Write(op)) => match payload_len(data, op.block_count, block_length) {
            Some(len) => interface.write(
                unit,
                op.block_address,
                &data[..len],
                op.block_count,
                &mut status,
            ),
            None => HandlerOutcome::Unhandled,
        },
        Ok(Operation::Flush(op)) => {
            interface.flush(unit, op.block_address, op.block_count, &mut status)
        }
        Ok(Operation::Unmap(op)) => match unmap_descriptors(unit, data, op.count) {
            Some(descriptors) => interface.unmap(unit, &descriptors, &mut status),
            None => HandlerOutcome::Unhandled,
        },
        // Unknown kinds are answered like a missing handler.
        Err(_) => HandlerOutcome::Unhandled,
    };

    match outcome {
        HandlerOutcome::Pending => None,
        // The status-byte sentinel is honored too, for handlers that fill
        // the wire status directly.
        HandlerOutcome::Complete if status.scsi_status == scsi::STATUS_PENDING => None,
        HandlerOutcome::Complete => Some(TransactRsp::new(request.hint, request.kind, status)),
        HandlerOutcome::Unhandled => Some(TransactRsp::new(
            request.hint,
            request.kind,
            StorageStatus::check(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_INVALID_CDB, 0),
        )),
    }
}

fn payload_len(data: &[u8], block_count: u32, block_length: u64) -> Option<usize> {
    let len = block_count as u64 * block_length;
    if len <= data.len() as u64 {
        Some(len as usize)
    } else {
        None
    }
}

fn unmap_descriptors(
    unit: &StorageUnit,
    data: &[u8],
    count: u32,
) -> Option<Vec<UnmapDescriptor>> {
    let count = count.min(unit.params().max_unmap_descriptor_count) as usize;
    let bytes = count.checked_mul(UNMAP_DESCRIPTOR_LEN)?;
    if bytes > data.len() {
        return None;
    }
    Some(
        data[..bytes]
            .chunks_exact(UNMAP_DESCRIPTOR_LEN)
            .filter_map(|chunk| UnmapDescriptor::read_from_bytes(chunk).ok())
            .collect(),
    )
}

/// Workers to run when the caller asks for zero: the popcount of the process
/// CPU affinity mask, floor 1.
fn default_thread_count() -> u32 {
    let Ok(set) = sched_getaffinity(Pid::from_raw(0)) else {
        return 1;
    };
    let cpus = (0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .count() as u32;
    cpus.max(1)
}
