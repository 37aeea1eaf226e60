use crate::error::{ControlError, ControlResult};
use crate::protocol::{
    Event, InstanceId, Message, StreamId, SubscriptionServiceUpdate, Tag, UpdateEntry,
};
use crate::server::registry::Registry;
use crate::server::tagged::{Tagged, TaggedService};
use crate::utils::StopToken;
use std::collections::{BTreeMap, BTreeSet};

/// One participation mode within a subscription service.
///
/// Members are the diffused side; subscribers receive the diffusion.
/// Every membership mutation bumps `nonce`; an update is emitted iff
/// `last_update < nonce` and leaves the two equal, which makes the
/// update sequence observed by any subscriber strictly monotone.
pub struct Role {
    service_name: String,
    role_name: String,
    members: BTreeMap<Tag, InstanceId>,
    subscribers: BTreeMap<Tag, InstanceId>,
    nonce: u64,
    last_update: u64,
}

impl Role {
    fn new(service_name: &str, role_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            role_name: role_name.to_string(),
            members: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            nonce: 0,
            last_update: 0,
        }
    }

    pub fn add_member(&mut self, tag: Tag, instance_id: InstanceId) {
        if self.members.insert(tag, instance_id).is_none() {
            self.nonce += 1;
        }
    }

    pub fn add_subscriber(&mut self, tag: Tag, instance_id: InstanceId) {
        if self.subscribers.insert(tag, instance_id).is_none() {
            self.nonce += 1;
        }
    }

    /// Remove `tag` from both sides; any removal counts as one
    /// membership mutation.
    pub fn drop_tag(&mut self, tag: Tag) {
        let removed =
            self.members.remove(&tag).is_some() | self.subscribers.remove(&tag).is_some();
        if removed {
            self.nonce += 1;
        }
    }

    /// Diffuse the member list to every subscriber if the role is
    /// dirty. A write failure is logged and scheduled for cleanup via
    /// `failed`, never aborting diffusion to the remaining subscribers.
    pub fn issue_update(
        &mut self,
        registry: &mut Registry,
        stop: &StopToken,
        failed: &mut Vec<StreamId>,
    ) {
        if self.last_update == self.nonce {
            return;
        }

        let update = SubscriptionServiceUpdate {
            service_name: self.service_name.clone(),
            role: self.role_name.clone(),
            nonce: self.nonce,
            entries: self
                .members
                .iter()
                .map(|(&tag, &instance_id)| UpdateEntry { tag, instance_id })
                .collect(),
        };

        for (&tag, &instance_id) in &self.subscribers {
            let Some(instance) = registry.instance_mut(instance_id) else {
                tracing::warn!(
                    "[SubscriptionService] subscriber {} of {}/{} (tag {}) missing from registry",
                    instance_id,
                    self.service_name,
                    self.role_name,
                    tag
                );
                continue;
            };

            let envelope = Event::update(
                instance.next_update_tag(),
                Message::SubscriptionServiceUpdate(update.clone()),
            );
            if let Err(err) = instance.writer().write(envelope, stop) {
                let stream_id = instance.stream_id();
                tracing::warn!(
                    "[SubscriptionService] update write to instance {} (stream {}) failed: {}; scheduling cleanup",
                    instance_id,
                    stream_id,
                    err
                );
                failed.push(stream_id);
            }
        }

        self.last_update = self.nonce;
    }

    #[inline]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    #[inline]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Named collection of roles forming a many-to-many discovery
/// mechanism. The role set is fixed at construction; services are
/// never deleted within a server lifetime.
pub struct SubscriptionService {
    name: String,
    tagged: Tagged,
    roles: BTreeMap<String, Role>,
}

impl SubscriptionService {
    pub fn new(name: impl Into<String>, role_names: &BTreeSet<String>) -> ControlResult<Self> {
        let name = name.into();
        if role_names.is_empty() {
            return Err(ControlError::instance(format!(
                "subscription service {name:?} requires at least one role"
            )));
        }
        let roles = role_names
            .iter()
            .map(|role| (role.clone(), Role::new(&name, role)))
            .collect();
        Ok(Self {
            name,
            tagged: Tagged::new()?,
            roles,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `instance_id` as a member of `role` and a subscriber
    /// of each role in `subscribe_to`, under a single fresh tag.
    pub fn register_instance(
        &mut self,
        instance_id: InstanceId,
        role: &str,
        subscribe_to: &BTreeSet<String>,
    ) -> ControlResult<Tag> {
        if !self.has_role(role) {
            return Err(ControlError::invalid_role(&self.name, role));
        }
        for sub_role in subscribe_to {
            if !self.has_role(sub_role) {
                return Err(ControlError::invalid_role(&self.name, sub_role));
            }
        }

        let tag = self.tagged.register_instance_id(instance_id)?;
        if let Some(member_role) = self.roles.get_mut(role) {
            member_role.add_member(tag, instance_id);
        }
        for sub_role in subscribe_to {
            if let Some(r) = self.roles.get_mut(sub_role) {
                r.add_subscriber(tag, instance_id);
            }
        }
        Ok(tag)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    /// Exact role-set equality; used to decide whether a redeclaration
    /// of the same service name is acceptable.
    pub fn compare_roles(&self, roles: &BTreeSet<String>) -> bool {
        self.roles.len() == roles.len() && roles.iter().all(|r| self.roles.contains_key(r))
    }

    pub fn role(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }
}

impl TaggedService for SubscriptionService {
    fn tagged(&self) -> &Tagged {
        &self.tagged
    }

    fn tagged_mut(&mut self) -> &mut Tagged {
        &mut self.tagged
    }

    fn do_drop_tag(&mut self, tag: Tag) {
        for role in self.roles.values_mut() {
            role.drop_tag(tag);
        }
    }

    fn do_issue_update(
        &mut self,
        registry: &mut Registry,
        stop: &StopToken,
        failed: &mut Vec<StreamId>,
    ) {
        for role in self.roles.values_mut() {
            role.issue_update(registry, stop, failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::EventKind;
    use crate::transport::EventWriter;
    use crossbeam::channel::Receiver;
    use std::time::Duration;

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn registry_with_instances(count: usize) -> (Registry, Vec<Receiver<Event>>) {
        let mut registry = Registry::new();
        let mut inboxes = Vec::new();
        for i in 0..count {
            let stream_id = (i + 1) as u64;
            let (writer, rx) = EventWriter::pair(stream_id, 32, Duration::from_millis(20));
            registry.add_stream(stream_id, writer);
            registry
                .register_workers(stream_id, &[format!("ucx://worker-{stream_id}")])
                .unwrap();
            inboxes.push(rx);
        }
        (registry, inboxes)
    }

    fn take_update(rx: &Receiver<Event>) -> Option<SubscriptionServiceUpdate> {
        while let Ok(event) = rx.try_recv() {
            if event.kind == EventKind::Update
                && let crate::protocol::Body::Message(Message::SubscriptionServiceUpdate(u)) =
                    event.body
            {
                return Some(u);
            }
        }
        None
    }

    #[test]
    fn construction_rejects_empty_role_set() {
        assert!(SubscriptionService::new("x", &BTreeSet::new()).is_err());
    }

    #[test]
    fn register_rejects_unknown_roles() {
        let mut service = SubscriptionService::new("demo", &roles(&["pub", "sub"])).unwrap();

        let err = service
            .register_instance(1, "nope", &BTreeSet::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRole);

        let err = service
            .register_instance(1, "pub", &roles(&["nope"]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRole);

        // failed registrations must not leak tags
        assert_eq!(service.tagged().tag_count(), 0);
    }

    #[test]
    fn compare_roles_is_exact() {
        let service = SubscriptionService::new("x", &roles(&["a", "b"])).unwrap();
        assert!(service.compare_roles(&roles(&["a", "b"])));
        assert!(!service.compare_roles(&roles(&["a", "c"])));
        assert!(!service.compare_roles(&roles(&["a"])));
        assert!(!service.compare_roles(&roles(&["a", "b", "c"])));
    }

    #[test]
    fn diffusion_fires_once_per_dirty_state() {
        let (mut registry, inboxes) = registry_with_instances(2);
        let mut service = SubscriptionService::new("demo", &roles(&["pub", "sub"])).unwrap();
        let stop = StopToken::new_root();
        let mut failed = Vec::new();

        // instance 1: member of pub, subscriber of sub
        let t1 = service
            .register_instance(1, "pub", &roles(&["sub"]))
            .unwrap();
        // instance 2: member of sub
        let t2 = service.register_instance(2, "sub", &BTreeSet::new()).unwrap();
        assert_ne!(t1, t2);

        service.issue_update(&mut registry, &stop, &mut failed);
        assert!(failed.is_empty());

        let update = take_update(&inboxes[0]).expect("instance 1 got an update");
        assert_eq!(update.service_name, "demo");
        assert_eq!(update.role, "sub");
        assert_eq!(update.nonce, 2);
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].tag, t2);
        assert_eq!(update.entries[0].instance_id, 2);

        // instance 2 subscribed to nothing
        assert!(take_update(&inboxes[1]).is_none());

        // clean roles: a second pass emits nothing
        service.issue_update(&mut registry, &stop, &mut failed);
        assert!(take_update(&inboxes[0]).is_none());
    }

    #[test]
    fn drop_tag_triggers_an_empty_diffusion() {
        let (mut registry, inboxes) = registry_with_instances(2);
        let mut service = SubscriptionService::new("demo", &roles(&["pub", "sub"])).unwrap();
        let stop = StopToken::new_root();
        let mut failed = Vec::new();

        service
            .register_instance(1, "pub", &roles(&["sub"]))
            .unwrap();
        let t2 = service.register_instance(2, "sub", &BTreeSet::new()).unwrap();
        service.issue_update(&mut registry, &stop, &mut failed);
        take_update(&inboxes[0]).expect("first update");

        service.drop_tag(t2);
        service.issue_update(&mut registry, &stop, &mut failed);

        let update = take_update(&inboxes[0]).expect("removal update");
        assert_eq!(update.nonce, 3);
        assert!(update.entries.is_empty());
        assert_eq!(service.tagged().owner_of(t2), None);
    }

    #[test]
    fn update_tags_are_monotone_per_instance() {
        let (mut registry, inboxes) = registry_with_instances(1);
        let mut service = SubscriptionService::new("demo", &roles(&["pub"])).unwrap();
        let stop = StopToken::new_root();
        let mut failed = Vec::new();

        service
            .register_instance(1, "pub", &roles(&["pub"]))
            .unwrap();
        service.issue_update(&mut registry, &stop, &mut failed);
        service.register_instance(1, "pub", &BTreeSet::new()).unwrap();
        service.issue_update(&mut registry, &stop, &mut failed);

        let mut last_tag = 0;
        let mut seen = 0;
        while let Ok(event) = inboxes[0].try_recv() {
            assert!(event.tag > last_tag, "update tags must advance");
            last_tag = event.tag;
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn drop_all_clears_every_role_and_tag() {
        let (mut registry, inboxes) = registry_with_instances(2);
        let mut service = SubscriptionService::new("demo", &roles(&["pub", "sub"])).unwrap();
        let stop = StopToken::new_root();
        let mut failed = Vec::new();

        service
            .register_instance(1, "pub", &roles(&["sub"]))
            .unwrap();
        service.register_instance(2, "sub", &BTreeSet::new()).unwrap();
        assert_eq!(service.tagged().tag_count(), 2);
        assert_eq!(service.tagged().tag_count_for_instance_id(1), 1);

        service.drop_all();
        assert_eq!(service.tagged().tag_count(), 0);
        assert_eq!(service.role("pub").map(|r| r.member_count()), Some(0));
        assert_eq!(service.role("sub").map(|r| r.subscriber_count()), Some(0));

        // the wipe dirtied the roles; the next pass diffuses emptiness
        service.issue_update(&mut registry, &stop, &mut failed);
        let update = take_update(&inboxes[0]);
        assert!(update.is_none(), "instance 1's subscription was dropped too");
    }

    #[test]
    fn failed_subscriber_write_does_not_abort_diffusion() {
        let mut registry = Registry::new();
        // stream 1: tiny full queue → write fails; stream 2: healthy
        let (w1, rx1) = EventWriter::pair(1, 1, Duration::from_millis(5));
        w1.try_write(Event::disconnect()).unwrap();
        let (w2, rx2) = EventWriter::pair(2, 32, Duration::from_millis(5));
        registry.add_stream(1, w1);
        registry.add_stream(2, w2);
        registry.register_workers(1, &["ucx://a".into()]).unwrap();
        registry.register_workers(2, &["ucx://b".into()]).unwrap();

        let mut service = SubscriptionService::new("demo", &roles(&["r"])).unwrap();
        let stop = StopToken::new_root();
        let mut failed = Vec::new();

        service.register_instance(1, "r", &roles(&["r"])).unwrap();
        service.register_instance(2, "r", &roles(&["r"])).unwrap();
        service.issue_update(&mut registry, &stop, &mut failed);

        assert_eq!(failed, vec![1]);
        // the healthy subscriber still received the diffusion
        let update = take_update(&rx2).expect("stream 2 update");
        assert_eq!(update.entries.len(), 2);
        drop(rx1);
    }
}
