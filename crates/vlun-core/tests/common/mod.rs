//! In-memory transport for exercising the dispatcher without a kernel.
//!
//! Tests script requests into a queue; workers block on a condvar until one
//! arrives or the transport is cancelled. Responses are recorded together
//! with their read payloads and checked off against the requests that
//! produced them, so hint pairing violations surface as `unmatched`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use vlun_core::{Transport, TransportError, TransportErrorKind, TransportResult};
use vlun_proto::{
    Btl, Operation, StorageUnitParams, TransactKind, TransactReq, TransactRsp,
};

const FAKE_BTL: Btl = Btl::new(1, 2, 3);

struct Outstanding {
    kind: u32,
    read_len: usize,
}

#[derive(Default)]
struct State {
    params: Option<StorageUnitParams>,
    btl: Option<Btl>,
    queue: VecDeque<(TransactReq, Vec<u8>)>,
    responses: Vec<(TransactRsp, Vec<u8>)>,
    outstanding: HashMap<u64, Outstanding>,
    answered: Vec<u64>,
    unmatched: usize,
    cancelled: bool,
    drain_error: Option<TransportErrorKind>,
    forced_error: Option<TransportErrorKind>,
    provision_calls: usize,
    unprovision_calls: usize,
    transact_threads: HashSet<ThreadId>,
    transact_timeout: Option<Duration>,
}

pub struct FakeTransport {
    state: Mutex<State>,
    cond: Condvar,
}

/// Shared handle to a [`FakeTransport`]. A thin `Arc` newtype so that
/// [`Transport`] (foreign to this test crate) can be implemented on it
/// without running afoul of the orphan rules.
#[derive(Clone)]
pub struct FakeTransportHandle(Arc<FakeTransport>);

impl std::ops::Deref for FakeTransportHandle {
    type Target = FakeTransport;

    fn deref(&self) -> &FakeTransport {
        &self.0
    }
}

impl FakeTransport {
    pub fn new() -> FakeTransportHandle {
        FakeTransportHandle(Arc::new(Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }))
    }

    /// Queue a request; a blocked worker picks it up immediately.
    pub fn push_request(&self, request: TransactReq, payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back((request, payload.to_vec()));
        self.cond.notify_all();
    }

    /// Queue a transport wakeup that carries no request.
    pub fn push_spurious(&self) {
        self.push_request(TransactReq::zeroed(), &[]);
    }

    /// Once the request queue drains, fail transacts with `kind` instead of
    /// blocking.
    pub fn fail_when_drained(&self, kind: TransportErrorKind) {
        let mut state = self.state.lock().unwrap();
        state.drain_error = Some(kind);
        self.cond.notify_all();
    }

    /// Fail every transact with `kind`, before any recording happens.
    pub fn force_error(&self, kind: TransportErrorKind) {
        let mut state = self.state.lock().unwrap();
        state.forced_error = Some(kind);
        self.cond.notify_all();
    }

    pub fn responses(&self) -> Vec<(TransactRsp, Vec<u8>)> {
        self.state.lock().unwrap().responses.clone()
    }

    /// Hints answered, in completion order. Duplicates mean a request was
    /// completed more than once.
    pub fn answered(&self) -> Vec<u64> {
        self.state.lock().unwrap().answered.clone()
    }

    /// Responses whose hint/kind did not pair with an outstanding request.
    pub fn unmatched(&self) -> usize {
        self.state.lock().unwrap().unmatched
    }

    pub fn provision_calls(&self) -> usize {
        self.state.lock().unwrap().provision_calls
    }

    pub fn unprovision_calls(&self) -> usize {
        self.state.lock().unwrap().unprovision_calls
    }

    /// Distinct threads that have entered transact.
    pub fn worker_count(&self) -> usize {
        self.state.lock().unwrap().transact_threads.len()
    }

    pub fn transact_timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().transact_timeout
    }

    /// Block until `count` responses are recorded.
    pub fn wait_responses(&self, count: usize, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (_state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.responses.len() < count)
            .unwrap();
        !result.timed_out()
    }

    /// Block until `count` distinct threads have entered transact.
    pub fn wait_workers(&self, count: usize, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (_state, result) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.transact_threads.len() < count)
            .unwrap();
        !result.timed_out()
    }

    fn transact_impl(
        &self,
        btl: Btl,
        response: Option<&TransactRsp>,
        request: Option<&mut TransactReq>,
        data: &mut [u8],
    ) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.transact_threads.insert(thread::current().id());
        self.cond.notify_all();

        if let Some(kind) = state.forced_error {
            return Err(TransportError::new(kind));
        }
        if state.cancelled {
            return Err(TransportError::new(TransportErrorKind::Cancelled));
        }
        if state.btl != Some(btl) {
            return Err(TransportError::new(TransportErrorKind::NotFound));
        }

        if let Some(rsp) = response {
            let payload = match state.outstanding.remove(&rsp.hint) {
                Some(out) if out.kind == rsp.kind => {
                    // Deferred completions may carry a shorter buffer than
                    // the worker's transfer buffer.
                    data[..out.read_len.min(data.len())].to_vec()
                }
                _ => {
                    state.unmatched += 1;
                    Vec::new()
                }
            };
            state.answered.push(rsp.hint);
            state.responses.push((*rsp, payload));
            self.cond.notify_all();
        }

        let Some(request_out) = request else {
            return Ok(());
        };

        loop {
            if state.cancelled {
                return Err(TransportError::new(TransportErrorKind::Cancelled));
            }
            if let Some((req, payload)) = state.queue.pop_front() {
                data[..payload.len()].copy_from_slice(&payload);
                if req.hint != 0 {
                    let read_len = match req.operation() {
                        Ok(Operation::Read(op)) => {
                            let block_length =
                                state.params.map(|p| p.block_length).unwrap_or(512);
                            op.block_count as usize * block_length as usize
                        }
                        _ => 0,
                    };
                    state.outstanding.insert(
                        req.hint,
                        Outstanding {
                            kind: req.kind,
                            read_len,
                        },
                    );
                }
                *request_out = req;
                return Ok(());
            }
            if let Some(kind) = state.drain_error {
                return Err(TransportError::new(kind));
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

impl Transport for FakeTransportHandle {
    fn provision(&self, params: &StorageUnitParams) -> TransportResult<Btl> {
        let mut state = self.state.lock().unwrap();
        state.provision_calls += 1;
        if state.btl.is_some() {
            return Err(TransportError::new(TransportErrorKind::Exhausted));
        }
        state.params = Some(*params);
        state.btl = Some(FAKE_BTL);
        Ok(FAKE_BTL)
    }

    fn unprovision(&self, btl: Btl) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.unprovision_calls += 1;
        if state.btl != Some(btl) {
            return Err(TransportError::new(TransportErrorKind::NotFound));
        }
        state.btl = None;
        state.cancelled = true;
        self.cond.notify_all();
        Ok(())
    }

    fn list(&self) -> TransportResult<Vec<Btl>> {
        Ok(self.state.lock().unwrap().btl.into_iter().collect())
    }

    fn transact(
        &self,
        btl: Btl,
        response: Option<&TransactRsp>,
        request: Option<&mut TransactReq>,
        data: &mut [u8],
    ) -> TransportResult<()> {
        self.transact_impl(btl, response, request, data)
    }

    fn set_transact_timeout(&self, btl: Btl, timeout: Duration) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.btl != Some(btl) {
            return Err(TransportError::new(TransportErrorKind::NotFound));
        }
        state.transact_timeout = Some(timeout);
        Ok(())
    }
}

/// Baseline provisioning parameters shared by the dispatcher tests.
pub fn test_params() -> StorageUnitParams {
    StorageUnitParams {
        guid: vlun_proto::Guid::from_bytes(*b"fake-transport-1"),
        block_count: 8,
        block_length: 512,
        max_transfer_length: 64 * 1024,
        max_unmap_descriptor_count: 16,
        write_protected: 0,
        cache_supported: 0,
        unmap_supported: 1,
        eject_disabled: 0,
        product_id: *b"vlun test disk  ",
        product_revision_level: *b"0.1 ",
        reserved: [0; 4],
    }
}

/// Shorthand for asserting a response kind.
pub fn kind_of(rsp: &TransactRsp) -> TransactKind {
    TransactKind::try_from(rsp.kind).expect("response kind")
}
