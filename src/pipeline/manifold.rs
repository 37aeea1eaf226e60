use crate::pipeline::SegmentAddress;
use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ManifoldState {
    Created,
    Connected,
    Draining,
    Closed,
}

/// Named connector between segments; the data-plane substrate for one
/// logical port.
///
/// Shared via `Arc` by every segment whose ports reference it. The set
/// of connected segment addresses doubles as the reference count: the
/// manifold drains once the last segment disconnects and closes only
/// when its owner tears the pipeline down.
pub struct ManifoldInstance {
    port: String,
    inner: Mutex<Inner>,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

struct Inner {
    state: ManifoldState,
    connected: BTreeSet<SegmentAddress>,
}

impl ManifoldInstance {
    pub fn new(port: impl Into<String>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            port: port.into(),
            inner: Mutex::new(Inner {
                state: ManifoldState::Created,
                connected: BTreeSet::new(),
            }),
            tx,
            rx,
        }
    }

    #[inline]
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> ManifoldState {
        self.inner.lock().state
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().connected.len()
    }

    pub fn connect(&self, address: SegmentAddress) {
        let mut inner = self.inner.lock();
        if inner.state == ManifoldState::Closed {
            tracing::warn!(
                "[ManifoldInstance] segment {address} connecting to closed port {:?}",
                self.port
            );
            return;
        }
        inner.connected.insert(address);
        inner.state = ManifoldState::Connected;
    }

    pub fn disconnect(&self, address: SegmentAddress) {
        let mut inner = self.inner.lock();
        inner.connected.remove(&address);
        if inner.connected.is_empty() && inner.state == ManifoldState::Connected {
            inner.state = ManifoldState::Draining;
        }
    }

    pub fn close(&self) {
        self.inner.lock().state = ManifoldState::Closed;
    }

    /// Producer handle into the substrate.
    pub fn input(&self) -> Sender<Bytes> {
        self.tx.clone()
    }

    /// Consumer handle out of the substrate.
    pub fn output(&self) -> Receiver<Bytes> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(segment_id: u16, rank: u16) -> SegmentAddress {
        SegmentAddress { segment_id, rank }
    }

    #[test]
    fn lifecycle_follows_connection_count() {
        let manifold = ManifoldInstance::new("p");
        assert_eq!(manifold.state(), ManifoldState::Created);

        manifold.connect(addr(1, 0));
        manifold.connect(addr(2, 0));
        assert_eq!(manifold.state(), ManifoldState::Connected);
        assert_eq!(manifold.connected_count(), 2);

        manifold.disconnect(addr(1, 0));
        assert_eq!(manifold.state(), ManifoldState::Connected);

        manifold.disconnect(addr(2, 0));
        assert_eq!(manifold.state(), ManifoldState::Draining);

        manifold.close();
        assert_eq!(manifold.state(), ManifoldState::Closed);
    }

    #[test]
    fn substrate_is_shared_between_handles() {
        let manifold = ManifoldInstance::new("p");
        let tx = manifold.input();
        let rx = manifold.output();

        tx.send(Bytes::from_static(b"chunk")).unwrap();
        assert_eq!(rx.recv().unwrap(), Bytes::from_static(b"chunk"));
    }
}
