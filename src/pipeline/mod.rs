use crate::utils::{SnapshotCell, StopToken};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod manifold;
pub mod segment;

pub use manifold::{ManifoldInstance, ManifoldState};
pub use segment::{SegmentContext, SegmentInstance, SegmentState};

/// Address of one segment placement: the definition's segment id plus
/// the rank of this placement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentAddress {
    pub segment_id: u16,
    pub rank: u16,
}

impl SegmentAddress {
    pub fn new(segment_id: u16, rank: u16) -> Self {
        Self { segment_id, rank }
    }
}

impl fmt::Display for SegmentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg{}.{}", self.segment_id, self.rank)
    }
}

pub type PortName = String;

/// Work a segment performs. The default body idles cooperatively on
/// its stop token; real deployments install data-plane pumps here.
pub type SegmentBody = Arc<dyn Fn(SegmentContext) + Send + Sync + 'static>;

/// Static description of one segment kind.
#[derive(Clone)]
pub struct SegmentDef {
    pub name: String,
    pub ingress_ports: Vec<PortName>,
    pub egress_ports: Vec<PortName>,
    pub body: Option<SegmentBody>,
}

impl SegmentDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ingress_ports: Vec::new(),
            egress_ports: Vec::new(),
            body: None,
        }
    }

    pub fn with_ingress(mut self, port: impl Into<PortName>) -> Self {
        self.ingress_ports.push(port.into());
        self
    }

    pub fn with_egress(mut self, port: impl Into<PortName>) -> Self {
        self.egress_ports.push(port.into());
        self
    }

    pub fn with_body(mut self, body: SegmentBody) -> Self {
        self.body = Some(body);
        self
    }
}

/// Segments a pipeline can instantiate, keyed by segment id.
pub struct PipelineDefinition {
    name: String,
    segments: BTreeMap<u16, SegmentDef>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segments: BTreeMap::new(),
        }
    }

    pub fn with_segment(mut self, segment_id: u16, def: SegmentDef) -> Self {
        self.segments.insert(segment_id, def);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment(&self, segment_id: u16) -> Option<&SegmentDef> {
        self.segments.get(&segment_id)
    }
}

/// Target state snapshot pushed by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineTarget {
    pub segments: Vec<TargetSegment>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSegment {
    pub address: SegmentAddress,
    pub partition_id: u32,
}

impl PipelineTarget {
    pub fn with(mut self, address: SegmentAddress, partition_id: u32) -> Self {
        self.segments.push(TargetSegment {
            address,
            partition_id,
        });
        self
    }
}

struct Maps {
    segments: BTreeMap<SegmentAddress, SegmentInstance>,
    manifolds: BTreeMap<PortName, Arc<ManifoldInstance>>,
}

struct Joinable {
    done: Mutex<bool>,
    cv: Condvar,
}

/// Client-side pipeline instance: converges the live set of segments
/// and manifolds to the control plane's declarative target.
///
/// One mutex guards both maps. It is never held across a join wait:
/// `join_segment` takes the worker handle out under the lock and waits
/// with it released. `update` is two-phase (stage everything first,
/// mass-start only after every staged segment's manifolds exist)
/// because manifold resolution between two segments requires both
/// endpoints before data can flow.
pub struct PipelineInstance {
    instance_id: u64,
    definition: Arc<PipelineDefinition>,
    maps: Mutex<Maps>,
    joinable: Joinable,
    stop: StopToken,
}

impl PipelineInstance {
    pub fn new(instance_id: u64, definition: Arc<PipelineDefinition>) -> Self {
        Self {
            instance_id,
            definition,
            maps: Mutex::new(Maps {
                segments: BTreeMap::new(),
                manifolds: BTreeMap::new(),
            }),
            joinable: Joinable {
                done: Mutex::new(false),
                cv: Condvar::new(),
            },
            stop: StopToken::new_root(),
        }
    }

    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Instantiate a segment for `address`. Idempotent: an existing
    /// instance is left alone. The segment is created and its
    /// manifolds resolved, but it is not started here.
    pub fn create_segment(&self, address: SegmentAddress, partition_id: u32) -> anyhow::Result<()> {
        let mut maps = self.maps.lock();
        self.create_segment_locked(&mut maps, address, partition_id)
    }

    fn create_segment_locked(
        &self,
        maps: &mut Maps,
        address: SegmentAddress,
        partition_id: u32,
    ) -> anyhow::Result<()> {
        if maps.segments.contains_key(&address) {
            return Ok(());
        }
        let def = self
            .definition
            .segment(address.segment_id)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "pipeline {:?} has no segment id {}",
                    self.definition.name(),
                    address.segment_id
                )
            })?
            .clone();

        let connect_ports = |maps: &mut Maps, ports: &[PortName]| -> Vec<Arc<ManifoldInstance>> {
            ports
                .iter()
                .map(|port| {
                    let manifold = Self::manifold_locked(maps, port);
                    manifold.connect(address);
                    manifold
                })
                .collect()
        };
        let ingress = connect_ports(maps, &def.ingress_ports);
        let egress = connect_ports(maps, &def.egress_ports);

        let body = def.body.clone().unwrap_or_else(default_body);
        let segment = SegmentInstance::new(
            address,
            partition_id,
            def.name.clone(),
            body,
            ingress,
            egress,
            self.stop.child(),
        );
        tracing::debug!(
            "[PipelineInstance] {} created segment {} ({}) on partition {}",
            self.instance_id,
            address,
            def.name,
            partition_id
        );
        maps.segments.insert(address, segment);
        Ok(())
    }

    fn manifold_locked(maps: &mut Maps, port: &str) -> Arc<ManifoldInstance> {
        maps.manifolds
            .entry(port.to_string())
            .or_insert_with(|| Arc::new(ManifoldInstance::new(port)))
            .clone()
    }

    /// Shared manifold for `port_name`; constructed lazily under the
    /// reconciler lock.
    pub fn get_manifold(&self, port_name: &str) -> Arc<ManifoldInstance> {
        let mut maps = self.maps.lock();
        Self::manifold_locked(&mut maps, port_name)
    }

    /// Signal cooperative shutdown of one segment.
    pub fn stop_segment(&self, address: SegmentAddress) -> anyhow::Result<()> {
        let mut maps = self.maps.lock();
        let segment = maps
            .segments
            .get_mut(&address)
            .ok_or_else(|| anyhow::anyhow!("unknown segment {address}"))?;
        segment.request_stop();
        Ok(())
    }

    /// Wait until the segment's worker quiesced. The maps lock is
    /// released for the duration of the wait.
    pub fn join_segment(&self, address: SegmentAddress) -> anyhow::Result<()> {
        let handle = {
            let mut maps = self.maps.lock();
            let segment = maps
                .segments
                .get_mut(&address)
                .ok_or_else(|| anyhow::anyhow!("unknown segment {address}"))?;
            segment.take_handle()
        };
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::warn!("[PipelineInstance] segment {address} worker panicked");
        }
        let mut maps = self.maps.lock();
        if let Some(segment) = maps.segments.get_mut(&address) {
            segment.mark_joined();
        }
        Ok(())
    }

    /// Remove a joined segment and release its manifold connections.
    pub fn remove_segment(&self, address: SegmentAddress) -> anyhow::Result<()> {
        let mut maps = self.maps.lock();
        match maps.segments.get(&address) {
            None => anyhow::bail!("unknown segment {address}"),
            Some(segment) if segment.state() != SegmentState::Joined => {
                anyhow::bail!("segment {address} is not joined")
            }
            Some(_) => {}
        }
        if let Some(mut segment) = maps.segments.remove(&address) {
            for manifold in segment.manifolds() {
                manifold.disconnect(address);
            }
            segment.mark_removed();
            tracing::debug!(
                "[PipelineInstance] {} removed segment {address}",
                self.instance_id
            );
        }
        Ok(())
    }

    /// Converge the live set to `target`. Idempotent.
    ///
    /// 1. Stage every target segment absent locally (created, not
    ///    started; manifolds resolved during creation).
    /// 2. Retire every local segment absent from the target:
    ///    stop → join → remove.
    /// 3. Mass-start the staged segments; every manifold they
    ///    reference already exists.
    pub fn update(&self, target: &PipelineTarget) -> anyhow::Result<()> {
        let (staged, retired) = {
            let mut maps = self.maps.lock();
            let mut staged = Vec::new();
            for ts in &target.segments {
                if !maps.segments.contains_key(&ts.address) {
                    self.create_segment_locked(&mut maps, ts.address, ts.partition_id)?;
                    staged.push(ts.address);
                }
            }
            let wanted: BTreeSet<SegmentAddress> =
                target.segments.iter().map(|t| t.address).collect();
            let retired: Vec<SegmentAddress> = maps
                .segments
                .keys()
                .copied()
                .filter(|address| !wanted.contains(address))
                .collect();
            (staged, retired)
        };

        for address in &retired {
            self.stop_segment(*address)?;
        }
        for address in retired {
            self.join_segment(address)?;
            self.remove_segment(address)?;
        }

        let mut maps = self.maps.lock();
        for address in staged {
            if let Some(segment) = maps.segments.get_mut(&address) {
                segment.start();
            }
        }
        Ok(())
    }

    /// Terminal transition: fulfil the joinable latch exactly once.
    pub fn mark_joinable(&self) {
        let mut done = self.joinable.done.lock();
        if !*done {
            *done = true;
            self.joinable.cv.notify_all();
            tracing::debug!("[PipelineInstance] {} is joinable", self.instance_id);
        }
    }

    pub fn await_joinable(&self) {
        let mut done = self.joinable.done.lock();
        while !*done {
            self.joinable.cv.wait(&mut done);
        }
    }

    pub fn await_joinable_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.joinable.done.lock();
        if *done {
            return true;
        }
        self.joinable.cv.wait_for(&mut done, timeout);
        *done
    }

    /// Reconcile against published target snapshots until stopped.
    pub fn drive(&self, targets: &SnapshotCell<PipelineTarget>, stop: &StopToken) {
        let mut seq = 0;
        while !stop.is_stopped() {
            if let Some(target) = targets.load_if_changed(&mut seq)
                && let Err(e) = self.update(&target)
            {
                tracing::warn!(
                    "[PipelineInstance] {} update failed: {e}",
                    self.instance_id
                );
            }
            stop.sleep_while_running(Duration::from_millis(5));
        }
    }

    /// Stop, join and remove every owned segment, then close all
    /// manifolds. The instance is destroyed once this returns.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let addresses: Vec<SegmentAddress> = self.maps.lock().segments.keys().copied().collect();
        for address in addresses {
            self.stop_segment(address)?;
            self.join_segment(address)?;
            self.remove_segment(address)?;
        }
        let mut maps = self.maps.lock();
        for manifold in maps.manifolds.values() {
            manifold.close();
        }
        maps.manifolds.clear();
        Ok(())
    }

    pub fn segment_state(&self, address: SegmentAddress) -> Option<SegmentState> {
        self.maps.lock().segments.get(&address).map(|s| s.state())
    }

    pub fn segment_addresses(&self) -> Vec<SegmentAddress> {
        self.maps.lock().segments.keys().copied().collect()
    }

    pub fn manifold_ports(&self) -> Vec<PortName> {
        self.maps.lock().manifolds.keys().cloned().collect()
    }

    pub fn manifold_state(&self, port: &str) -> Option<ManifoldState> {
        self.maps.lock().manifolds.get(port).map(|m| m.state())
    }
}

fn default_body() -> SegmentBody {
    Arc::new(|ctx: SegmentContext| {
        while !ctx.stop.is_stopped() {
            std::thread::sleep(Duration::from_millis(2));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const A: SegmentAddress = SegmentAddress {
        segment_id: 1,
        rank: 0,
    };
    const B: SegmentAddress = SegmentAddress {
        segment_id: 2,
        rank: 0,
    };

    fn counting_body(starts: Arc<AtomicUsize>) -> SegmentBody {
        Arc::new(move |ctx: SegmentContext| {
            starts.fetch_add(1, Ordering::SeqCst);
            while !ctx.stop.is_stopped() {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    }

    fn two_segment_definition(starts: &Arc<AtomicUsize>) -> Arc<PipelineDefinition> {
        Arc::new(
            PipelineDefinition::new("test")
                .with_segment(
                    1,
                    SegmentDef::new("A")
                        .with_egress("p")
                        .with_body(counting_body(starts.clone())),
                )
                .with_segment(
                    2,
                    SegmentDef::new("B")
                        .with_ingress("p")
                        .with_body(counting_body(starts.clone())),
                ),
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn update_converges_and_is_idempotent() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineInstance::new(1, two_segment_definition(&starts));

        let target = PipelineTarget::default().with(A, 0).with(B, 0);
        pipeline.update(&target).unwrap();

        assert_eq!(pipeline.segment_state(A), Some(SegmentState::Running));
        assert_eq!(pipeline.segment_state(B), Some(SegmentState::Running));
        assert_eq!(pipeline.manifold_state("p"), Some(ManifoldState::Connected));
        assert!(wait_for(
            || starts.load(Ordering::SeqCst) == 2,
            Duration::from_secs(1)
        ));

        // same target again: no new starts, no transitions
        pipeline.update(&target).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.segment_state(A), Some(SegmentState::Running));
        assert_eq!(pipeline.segment_state(B), Some(SegmentState::Running));

        // shrink the target: B is stopped, joined and removed
        let shrunk = PipelineTarget::default().with(A, 0);
        pipeline.update(&shrunk).unwrap();
        assert_eq!(pipeline.segment_state(B), None);
        assert_eq!(pipeline.segment_state(A), Some(SegmentState::Running));
        assert_eq!(pipeline.segment_addresses(), vec![A]);
        // A's egress still holds the manifold
        assert_eq!(pipeline.manifold_state("p"), Some(ManifoldState::Connected));

        pipeline.shutdown().unwrap();
        assert!(pipeline.segment_addresses().is_empty());
    }

    #[test]
    fn retiring_the_last_segment_drains_the_manifold() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineInstance::new(1, two_segment_definition(&starts));

        pipeline
            .update(&PipelineTarget::default().with(A, 0))
            .unwrap();
        assert_eq!(pipeline.manifold_state("p"), Some(ManifoldState::Connected));

        pipeline.update(&PipelineTarget::default()).unwrap();
        assert_eq!(pipeline.manifold_state("p"), Some(ManifoldState::Draining));
    }

    #[test]
    fn manifolds_exist_before_any_segment_runs() {
        // the body snapshots its manifold handles at start; staging
        // guarantees they are resolved beforehand
        let saw_manifold = Arc::new(AtomicUsize::new(0));
        let saw = saw_manifold.clone();
        let definition = Arc::new(
            PipelineDefinition::new("test").with_segment(
                1,
                SegmentDef::new("A").with_egress("p").with_body(Arc::new(
                    move |ctx: SegmentContext| {
                        if ctx.egress.len() == 1 && ctx.egress[0].state() == ManifoldState::Connected
                        {
                            saw.fetch_add(1, Ordering::SeqCst);
                        }
                    },
                )),
            ),
        );
        let pipeline = PipelineInstance::new(1, definition);
        pipeline
            .update(&PipelineTarget::default().with(A, 0))
            .unwrap();
        assert!(wait_for(
            || saw_manifold.load(Ordering::SeqCst) == 1,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn exhausted_segment_stays_owned_until_removal() {
        let definition = Arc::new(PipelineDefinition::new("test").with_segment(
            1,
            SegmentDef::new("A").with_body(Arc::new(|_ctx: SegmentContext| {
                // source exhaustion: return immediately
            })),
        ));
        let pipeline = PipelineInstance::new(1, definition);
        pipeline
            .update(&PipelineTarget::default().with(A, 0))
            .unwrap();

        // the body has long returned, but the controller has not
        // approved removal: the instance stays in the map as Running
        let pipeline_ref = &pipeline;
        assert!(wait_for(
            || {
                pipeline_ref
                    .maps
                    .lock()
                    .segments
                    .get(&A)
                    .is_some_and(|s| !s.is_live())
            },
            Duration::from_secs(1)
        ));
        assert_eq!(pipeline.segment_state(A), Some(SegmentState::Running));

        pipeline.update(&PipelineTarget::default()).unwrap();
        assert_eq!(pipeline.segment_state(A), None);
    }

    #[test]
    fn create_segment_is_idempotent_and_checks_definition() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineInstance::new(1, two_segment_definition(&starts));

        pipeline.create_segment(A, 0).unwrap();
        pipeline.create_segment(A, 0).unwrap();
        assert_eq!(pipeline.segment_addresses(), vec![A]);
        assert_eq!(pipeline.segment_state(A), Some(SegmentState::Created));

        assert!(pipeline.create_segment(SegmentAddress::new(9, 0), 0).is_err());
    }

    #[test]
    fn remove_requires_joined() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineInstance::new(1, two_segment_definition(&starts));
        pipeline
            .update(&PipelineTarget::default().with(A, 0))
            .unwrap();

        assert!(pipeline.remove_segment(A).is_err());
        pipeline.stop_segment(A).unwrap();
        pipeline.join_segment(A).unwrap();
        assert_eq!(pipeline.segment_state(A), Some(SegmentState::Joined));
        pipeline.remove_segment(A).unwrap();
    }

    #[test]
    fn mark_joinable_fulfils_exactly_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(PipelineInstance::new(1, two_segment_definition(&starts)));

        assert!(!pipeline.await_joinable_timeout(Duration::from_millis(10)));

        let remote = pipeline.clone();
        let waiter = std::thread::spawn(move || remote.await_joinable());
        pipeline.mark_joinable();
        pipeline.mark_joinable();
        waiter.join().expect("waiter finished");
        assert!(pipeline.await_joinable_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn drive_reconciles_published_targets() {
        let starts = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(PipelineInstance::new(1, two_segment_definition(&starts)));
        let targets = SnapshotCell::new_arc(PipelineTarget::default());
        let stop = StopToken::new_root();

        let driver = {
            let pipeline = pipeline.clone();
            let targets = targets.clone();
            let stop = stop.clone();
            std::thread::spawn(move || pipeline.drive(&targets, &stop))
        };

        targets.publish(PipelineTarget::default().with(A, 0).with(B, 0));
        assert!(wait_for(
            || pipeline.segment_addresses().len() == 2,
            Duration::from_secs(1)
        ));

        targets.publish(PipelineTarget::default().with(A, 0));
        assert!(wait_for(
            || pipeline.segment_addresses() == vec![A],
            Duration::from_secs(1)
        ));

        stop.stop();
        driver.join().expect("driver finished");
        pipeline.shutdown().unwrap();
    }
}
