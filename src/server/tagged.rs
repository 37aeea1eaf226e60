use crate::error::{ControlError, ControlResult};
use crate::protocol::{InstanceId, StreamId, Tag};
use crate::server::registry::Registry;
use crate::utils::StopToken;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Tag layout, from the MSB: 32-bit service id, 16 reserved zero bits,
/// 16-bit per-service uid. uid 0 is never issued, so a zero low word
/// always marks an invalid tag.
const SERVICE_SHIFT: u32 = 32;
const UID_MASK: u64 = 0xFFFF;

static NEXT_SERVICE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the process-global service id for a new tagged object.
/// The id space never wraps; running it out is a fatal condition the
/// server surfaces instead of aborting.
fn next_service_id() -> ControlResult<u32> {
    NEXT_SERVICE_ID
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1))
        .map_err(|_| ControlError::instance("service id space exhausted").into_fatal())
}

#[inline]
pub fn tag_of(service_id: u32, uid: u16) -> Tag {
    ((service_id as u64) << SERVICE_SHIFT) | uid as u64
}

/// Base state for a tagged server-side service: the service id, the
/// per-service uid counter, and the instance ↔ tag relation.
///
/// Deliberately not synchronized. The server event loop is the single
/// owner of every tagged service; no separate lock exists.
pub struct Tagged {
    service_id: u32,
    // u32 so the first uid past 0xFFFF is representable and rejected
    next_uid: u32,
    instance_tags: BTreeMap<InstanceId, Vec<Tag>>,
    tag_owners: BTreeMap<Tag, InstanceId>,
}

impl Tagged {
    pub fn new() -> ControlResult<Self> {
        Ok(Self {
            service_id: next_service_id()?,
            next_uid: 1,
            instance_tags: BTreeMap::new(),
            tag_owners: BTreeMap::new(),
        })
    }

    #[inline]
    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// A valid tag carries this service's id in the high word and a
    /// nonzero uid in the low word.
    #[inline]
    pub fn valid_tag(&self, tag: Tag) -> bool {
        (tag >> SERVICE_SHIFT) == self.service_id as u64 && (tag & UID_MASK) != 0
    }

    fn next_tag(&mut self) -> ControlResult<Tag> {
        if self.next_uid > UID_MASK as u32 {
            return Err(ControlError::tag_exhausted(self.service_id));
        }
        let uid = self.next_uid as u16;
        self.next_uid += 1;
        Ok(tag_of(self.service_id, uid))
    }

    /// Allocate a fresh tag and record it against `instance_id`.
    pub fn register_instance_id(&mut self, instance_id: InstanceId) -> ControlResult<Tag> {
        let tag = self.next_tag()?;
        self.instance_tags.entry(instance_id).or_default().push(tag);
        self.tag_owners.insert(tag, instance_id);
        Ok(tag)
    }

    pub fn owner_of(&self, tag: Tag) -> Option<InstanceId> {
        self.tag_owners.get(&tag).copied()
    }

    pub fn tag_count(&self) -> usize {
        self.tag_owners.len()
    }

    pub fn tag_count_for_instance_id(&self, instance_id: InstanceId) -> usize {
        self.instance_tags
            .get(&instance_id)
            .map_or(0, |tags| tags.len())
    }

    fn remove_tag(&mut self, tag: Tag) {
        if let Some(instance_id) = self.tag_owners.remove(&tag)
            && let Some(tags) = self.instance_tags.get_mut(&instance_id)
        {
            tags.retain(|t| *t != tag);
            if tags.is_empty() {
                self.instance_tags.remove(&instance_id);
            }
        }
    }

    fn take_tags_of(&mut self, instance_id: InstanceId) -> Vec<Tag> {
        let tags = self.instance_tags.remove(&instance_id).unwrap_or_default();
        for tag in &tags {
            self.tag_owners.remove(tag);
        }
        tags
    }

    fn take_all(&mut self) -> Vec<Tag> {
        self.instance_tags.clear();
        std::mem::take(&mut self.tag_owners).into_keys().collect()
    }

    #[cfg(test)]
    pub(crate) fn set_next_uid(&mut self, uid: u32) {
        self.next_uid = uid;
    }
}

/// Server-side stateful service whose registrations are tracked by
/// tag. An implementor exposes its [`Tagged`] base plus the drop and
/// update hooks, and inherits the lifecycle verbs below.
pub trait TaggedService {
    fn tagged(&self) -> &Tagged;
    fn tagged_mut(&mut self) -> &mut Tagged;

    /// Subclass cleanup for one dropped tag.
    fn do_drop_tag(&mut self, tag: Tag);

    /// Subclass diffusion pass. Streams whose writes failed are pushed
    /// onto `failed` for deferred cleanup.
    fn do_issue_update(
        &mut self,
        registry: &mut Registry,
        stop: &StopToken,
        failed: &mut Vec<StreamId>,
    );

    fn register_instance_id(&mut self, instance_id: InstanceId) -> ControlResult<Tag> {
        self.tagged_mut().register_instance_id(instance_id)
    }

    fn drop_tag(&mut self, tag: Tag) {
        self.do_drop_tag(tag);
        self.tagged_mut().remove_tag(tag);
    }

    fn drop_instance(&mut self, instance_id: InstanceId) {
        for tag in self.tagged_mut().take_tags_of(instance_id) {
            self.do_drop_tag(tag);
        }
    }

    fn drop_all(&mut self) {
        for tag in self.tagged_mut().take_all() {
            self.do_drop_tag(tag);
        }
    }

    fn issue_update(
        &mut self,
        registry: &mut Registry,
        stop: &StopToken,
        failed: &mut Vec<StreamId>,
    ) {
        self.do_issue_update(registry, stop, failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_layout_and_validity() {
        let mut tagged = Tagged::new().unwrap();
        let tag = tagged.register_instance_id(42).unwrap();

        assert_eq!(tag >> SERVICE_SHIFT, tagged.service_id() as u64);
        assert_eq!(tag & UID_MASK, 1);
        // reserved middle bits stay zero
        assert_eq!(tag & 0xFFFF_0000, 0);
        assert!(tagged.valid_tag(tag));
        assert!(!tagged.valid_tag(tag_of(tagged.service_id(), 0)));
        assert!(!tagged.valid_tag(tag_of(tagged.service_id() + 1, 1)));
    }

    #[test]
    fn uids_are_unique_per_service() {
        let mut tagged = Tagged::new().unwrap();
        let a = tagged.register_instance_id(1).unwrap();
        let b = tagged.register_instance_id(1).unwrap();
        let c = tagged.register_instance_id(2).unwrap();

        assert_ne!(a & UID_MASK, b & UID_MASK);
        assert_ne!(b & UID_MASK, c & UID_MASK);
        assert_eq!(tagged.tag_count(), 3);
        assert_eq!(tagged.tag_count_for_instance_id(1), 2);
    }

    #[test]
    fn distinct_services_get_distinct_ids() {
        let a = Tagged::new().unwrap();
        let b = Tagged::new().unwrap();
        assert_ne!(a.service_id(), b.service_id());
    }

    #[test]
    fn uid_exhaustion_is_an_error_not_a_wraparound() {
        let mut tagged = Tagged::new().unwrap();
        tagged.set_next_uid(UID_MASK as u32);

        let last = tagged.register_instance_id(1).unwrap();
        assert_eq!(last & UID_MASK, UID_MASK);

        let err = tagged.register_instance_id(1).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TagExhausted);
        assert!(err.is_fatal());
        // the counter stays pegged; no wrap back to uid 1
        assert!(tagged.register_instance_id(2).is_err());
    }

    #[test]
    fn remove_and_take_keep_both_indexes_in_sync() {
        let mut tagged = Tagged::new().unwrap();
        let a = tagged.register_instance_id(1).unwrap();
        let _b = tagged.register_instance_id(1).unwrap();
        let c = tagged.register_instance_id(2).unwrap();

        tagged.remove_tag(a);
        assert_eq!(tagged.owner_of(a), None);
        assert_eq!(tagged.tag_count_for_instance_id(1), 1);

        let taken = tagged.take_tags_of(1);
        assert_eq!(taken.len(), 1);
        assert_eq!(tagged.tag_count(), 1);
        assert_eq!(tagged.owner_of(c), Some(2));
    }
}
