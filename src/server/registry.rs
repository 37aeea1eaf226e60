use crate::error::{ControlError, ControlResult, ErrorCode};
use crate::protocol::{InstanceId, StreamId, Tag};
use crate::transport::EventWriter;
use std::collections::{BTreeMap, BTreeSet};

/// A registered worker endpoint.
///
/// Owned exclusively by the [`Registry`]; subscription roles refer to
/// instances by id only and resolve through the registry when they
/// need the writer.
pub struct ClientInstance {
    instance_id: InstanceId,
    stream_id: StreamId,
    writer: EventWriter,
    worker_address: String,
    update_seq: u64,
}

impl ClientInstance {
    #[inline]
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[inline]
    pub fn writer(&self) -> &EventWriter {
        &self.writer
    }

    #[inline]
    pub fn worker_address(&self) -> &str {
        &self.worker_address
    }

    /// Fresh server-chosen tag for the next update envelope sent to
    /// this instance. The cursor only advances, so receivers can use
    /// it to deduplicate replayed updates.
    pub fn next_update_tag(&mut self) -> Tag {
        self.update_seq += 1;
        self.update_seq
    }
}

/// Connection tables of the control plane. All mutation happens on the
/// server event-loop thread; every operation is in-memory, so the
/// drop-stream cascade cannot partially fail.
pub struct Registry {
    streams: BTreeMap<StreamId, EventWriter>,
    instances: BTreeMap<InstanceId, ClientInstance>,
    instances_by_stream: BTreeMap<StreamId, Vec<InstanceId>>,
    worker_addresses: BTreeSet<String>,
    next_instance_id: InstanceId,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            streams: BTreeMap::new(),
            instances: BTreeMap::new(),
            instances_by_stream: BTreeMap::new(),
            worker_addresses: BTreeSet::new(),
            next_instance_id: 1,
        }
    }

    pub fn add_stream(&mut self, stream_id: StreamId, writer: EventWriter) {
        self.streams.insert(stream_id, writer);
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_writer(&self, stream_id: StreamId) -> Option<&EventWriter> {
        self.streams.get(&stream_id)
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Bind one instance per address to `stream_id`, in request order.
    /// Validation runs before any mutation: either every address is
    /// claimed or none is.
    pub fn register_workers(
        &mut self,
        stream_id: StreamId,
        addresses: &[String],
    ) -> ControlResult<Vec<InstanceId>> {
        let writer = self
            .streams
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| ControlError::instance(format!("unknown stream {stream_id}")))?;

        for address in addresses {
            if self.worker_addresses.contains(address) {
                return Err(ControlError::new(
                    ErrorCode::DuplicateUcxAddress,
                    address.clone(),
                ));
            }
        }

        let mut instance_ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            let instance_id = self.next_instance_id;
            self.next_instance_id += 1;

            self.worker_addresses.insert(address.clone());
            self.instances.insert(
                instance_id,
                ClientInstance {
                    instance_id,
                    stream_id,
                    writer: writer.clone(),
                    worker_address: address.clone(),
                    update_seq: 0,
                },
            );
            self.instances_by_stream
                .entry(stream_id)
                .or_default()
                .push(instance_id);
            instance_ids.push(instance_id);
        }
        Ok(instance_ids)
    }

    pub fn instance(&self, instance_id: InstanceId) -> Option<&ClientInstance> {
        self.instances.get(&instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: InstanceId) -> Option<&mut ClientInstance> {
        self.instances.get_mut(&instance_id)
    }

    /// The instance must exist and belong to the requesting stream.
    pub fn validate_instance(
        &self,
        instance_id: InstanceId,
        stream_id: StreamId,
    ) -> ControlResult<&ClientInstance> {
        let instance = self
            .instances
            .get(&instance_id)
            .ok_or_else(|| ControlError::instance(format!("unknown instance {instance_id}")))?;
        if instance.stream_id != stream_id {
            return Err(ControlError::instance(format!(
                "instance {instance_id} does not belong to stream {stream_id}"
            )));
        }
        Ok(instance)
    }

    pub fn instances_of_stream(&self, stream_id: StreamId) -> Vec<InstanceId> {
        self.instances_by_stream
            .get(&stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove one instance and release its worker address.
    pub fn remove_instance(&mut self, instance_id: InstanceId) {
        if let Some(instance) = self.instances.remove(&instance_id) {
            self.worker_addresses.remove(&instance.worker_address);
            if let Some(ids) = self.instances_by_stream.get_mut(&instance.stream_id) {
                ids.retain(|id| *id != instance_id);
                if ids.is_empty() {
                    self.instances_by_stream.remove(&instance.stream_id);
                }
            }
        }
    }

    /// Remove the stream record itself. Instance cleanup is driven by
    /// the server cascade before this is called.
    pub fn remove_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.instances_by_stream.remove(&stream_id);
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.worker_addresses.contains(address)
    }

    pub fn worker_address_count(&self) -> usize {
        self.worker_addresses.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry_with_stream(stream_id: StreamId) -> Registry {
        let mut registry = Registry::new();
        let (writer, rx) = EventWriter::pair(stream_id, 8, Duration::from_millis(10));
        // keep the far end alive for the duration of the test
        std::mem::forget(rx);
        registry.add_stream(stream_id, writer);
        registry
    }

    #[test]
    fn instance_ids_are_allocated_in_request_order() {
        let mut registry = registry_with_stream(1);
        let ids = registry
            .register_workers(1, &["ucx://a".into(), "ucx://b".into()])
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert!(registry.contains_address("ucx://a"));
        assert!(registry.contains_address("ucx://b"));
    }

    #[test]
    fn duplicate_address_rejected_without_partial_claim() {
        let mut registry = registry_with_stream(1);
        registry.register_workers(1, &["ucx://a".into()]).unwrap();

        let err = registry
            .register_workers(1, &["ucx://fresh".into(), "ucx://a".into()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateUcxAddress);
        assert_eq!(err.message, "ucx://a");
        // the fresh address must not have been claimed by the failed call
        assert!(!registry.contains_address("ucx://fresh"));
        assert_eq!(registry.worker_address_count(), 1);
    }

    #[test]
    fn validate_instance_checks_stream_ownership() {
        let mut registry = registry_with_stream(1);
        let (writer, rx) = EventWriter::pair(2, 8, Duration::from_millis(10));
        std::mem::forget(rx);
        registry.add_stream(2, writer);

        let ids = registry.register_workers(1, &["ucx://a".into()]).unwrap();
        assert!(registry.validate_instance(ids[0], 1).is_ok());
        assert!(registry.validate_instance(ids[0], 2).is_err());
        assert!(registry.validate_instance(999, 1).is_err());
    }

    #[test]
    fn remove_instance_releases_address() {
        let mut registry = registry_with_stream(1);
        let ids = registry
            .register_workers(1, &["ucx://a".into(), "ucx://b".into()])
            .unwrap();

        registry.remove_instance(ids[0]);
        assert!(!registry.contains_address("ucx://a"));
        assert!(registry.contains_address("ucx://b"));
        assert_eq!(registry.instances_of_stream(1), vec![ids[1]]);
    }
}
