use crate::pipeline::manifold::ManifoldInstance;
use crate::pipeline::{SegmentAddress, SegmentBody};
use crate::utils::{LiveFlag, StopToken};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// `Created → Running → Stopping → Joined → Removed`, driven only by
/// the owning pipeline instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SegmentState {
    Created,
    Running,
    Stopping,
    Joined,
    Removed,
}

/// Everything a segment body can reach at run time.
pub struct SegmentContext {
    pub address: SegmentAddress,
    pub partition_id: u32,
    pub stop: StopToken,
    pub ingress: Vec<Arc<ManifoldInstance>>,
    pub egress: Vec<Arc<ManifoldInstance>>,
}

/// Live segment handle: worker thread join handle, stop token, live
/// flag and the explicit state machine.
///
/// A body that returns on its own (source exhaustion) drops the live
/// flag, but the handle stays owned by the pipeline instance until the
/// controller explicitly requests removal, so observed state always
/// matches controller-approved state.
pub struct SegmentInstance {
    address: SegmentAddress,
    partition_id: u32,
    name: String,
    state: SegmentState,
    stop: StopToken,
    live: LiveFlag,
    handle: Option<JoinHandle<()>>,
    body: Option<SegmentBody>,
    ingress: Vec<Arc<ManifoldInstance>>,
    egress: Vec<Arc<ManifoldInstance>>,
}

impl SegmentInstance {
    pub(super) fn new(
        address: SegmentAddress,
        partition_id: u32,
        name: String,
        body: SegmentBody,
        ingress: Vec<Arc<ManifoldInstance>>,
        egress: Vec<Arc<ManifoldInstance>>,
        stop: StopToken,
    ) -> Self {
        Self {
            address,
            partition_id,
            name,
            state: SegmentState::Created,
            stop,
            live: LiveFlag::new(false),
            handle: None,
            body: Some(body),
            ingress,
            egress,
        }
    }

    #[inline]
    pub fn address(&self) -> SegmentAddress {
        self.address
    }

    #[inline]
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// False once the body returned, whether stopped or exhausted.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.is_up()
    }

    pub(super) fn manifolds(&self) -> Vec<Arc<ManifoldInstance>> {
        self.ingress.iter().chain(self.egress.iter()).cloned().collect()
    }

    /// `Created → Running`: spawn the worker thread. No-op in any
    /// other state.
    pub(super) fn start(&mut self) {
        if self.state != SegmentState::Created {
            return;
        }
        let Some(body) = self.body.take() else {
            return;
        };
        let ctx = SegmentContext {
            address: self.address,
            partition_id: self.partition_id,
            stop: self.stop.child(),
            ingress: self.ingress.clone(),
            egress: self.egress.clone(),
        };
        let live = self.live.clone();
        live.up();
        self.handle = Some(thread::spawn(move || {
            body(ctx);
            live.down();
        }));
        self.state = SegmentState::Running;
        tracing::debug!("[SegmentInstance] {} ({}) running", self.address, self.name);
    }

    /// Signal cooperative shutdown. `Running → Stopping`.
    pub(super) fn request_stop(&mut self) {
        if self.state == SegmentState::Running {
            self.stop.stop();
            self.state = SegmentState::Stopping;
            tracing::debug!("[SegmentInstance] {} ({}) stopping", self.address, self.name);
        }
    }

    /// Take the worker handle so the caller can wait for quiescence
    /// without holding the reconciler lock.
    pub(super) fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }

    pub(super) fn mark_joined(&mut self) {
        if self.state != SegmentState::Removed {
            self.state = SegmentState::Joined;
        }
    }

    pub(super) fn mark_removed(&mut self) {
        self.state = SegmentState::Removed;
    }
}

impl Drop for SegmentInstance {
    fn drop(&mut self) {
        // never leave a worker spinning without its owner
        self.stop.stop();
    }
}
