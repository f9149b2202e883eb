//! Destination-side identity and presence for migrated objects.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::batch::{ObjectSpec, Operation, TransferAction};
use crate::client::BatchApi;
use crate::{Oid, Result};

type Slot = Arc<Mutex<Option<bool>>>;

/// Slot key: the destination that answered plus the oid.
type Key = (String, Oid);

/// Memo of destination presence checks.
///
/// Answers are keyed by destination scope as well as oid: an object stored
/// under one repository's endpoint says nothing about another's.
///
/// Each key owns a slot; a caller probing an oid holds its slot lock for the
/// duration of the request, so concurrent callers for the same oid wait for
/// that answer instead of asking the destination again.
#[derive(Default)]
pub struct PresenceCache {
    slots: Mutex<HashMap<Key, Slot>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, scope: &str, oid: &Oid) -> Slot {
        self.slots
            .lock()
            .entry((scope.to_string(), oid.clone()))
            .or_default()
            .clone()
    }

    /// Known presence at `scope`, without waiting on an in-flight lookup.
    pub fn get(&self, scope: &str, oid: &Oid) -> Option<bool> {
        let slot = self.slots.lock().get(&(scope.to_string(), oid.clone())).cloned()?;
        let known = slot.try_lock().and_then(|guard| *guard);
        known
    }

    pub fn record(&self, scope: &str, oid: &Oid, present: bool) {
        *self.slot(scope, oid).lock() = Some(present);
    }

    /// Drop negative answers.
    ///
    /// Absence is only trustworthy for the run that observed it; presence of
    /// immutable content stays true.
    pub fn forget_absent(&self) {
        self.slots.lock().retain(|_, slot| match slot.try_lock() {
            Some(guard) => *guard == Some(true),
            None => true,
        });
    }
}

/// Decides what each source object becomes at the destination.
pub struct OidMapper<'a> {
    destination: &'a dyn BatchApi,
    scope: String,
    cache: Arc<PresenceCache>,
}

impl<'a> OidMapper<'a> {
    pub fn new(destination: &'a dyn BatchApi, cache: Arc<PresenceCache>) -> Self {
        OidMapper {
            scope: destination.describe(),
            destination,
            cache,
        }
    }

    /// Destination identity for a source object.
    ///
    /// Both sides hash with SHA-256, so the identity is preserved.
    pub fn map(&self, object: &ObjectSpec) -> ObjectSpec {
        object.clone()
    }

    /// Look up every object whose presence is not yet known, in one logical batch.
    pub fn check_presence(&self, objects: &[ObjectSpec]) -> Result<()> {
        let mut unknown: Vec<ObjectSpec> = objects
            .iter()
            .map(|o| self.map(o))
            .filter(|o| self.cache.get(&self.scope, &o.oid).is_none())
            .collect();
        unknown.sort_by(|a, b| a.oid.cmp(&b.oid));
        unknown.dedup_by(|a, b| a.oid == b.oid);
        if unknown.is_empty() {
            return Ok(());
        }

        // Lock in oid order so two bulk lookups cannot deadlock.
        let slots: Vec<Slot> = unknown.iter().map(|o| self.cache.slot(&self.scope, &o.oid)).collect();
        let mut guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();

        let pending: Vec<(usize, ObjectSpec)> = unknown
            .into_iter()
            .enumerate()
            .filter(|(i, _)| guards[*i].is_none())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let specs: Vec<ObjectSpec> = pending.iter().map(|(_, o)| o.clone()).collect();
        let actions = self.destination.request_actions(Operation::Download, &specs)?;
        let mut present = 0usize;
        for (i, object) in &pending {
            if let Some(answer) = actions.get(&object.hex()).and_then(presence_of) {
                *guards[*i] = Some(answer);
                present += answer as usize;
            }
        }
        tracing::debug!(
            destination = %self.scope,
            checked = pending.len(),
            present,
            "checked destination presence"
        );
        Ok(())
    }

    /// Whether the destination already stores the object.
    pub fn is_present(&self, object: &ObjectSpec) -> Result<bool> {
        let mapped = self.map(object);
        let slot = self.cache.slot(&self.scope, &mapped.oid);
        let mut guard = slot.lock();
        if let Some(known) = *guard {
            return Ok(known);
        }

        let actions = self
            .destination
            .request_actions(Operation::Download, std::slice::from_ref(&mapped))?;
        let answer = actions.get(&mapped.hex()).and_then(presence_of);
        *guard = answer;
        Ok(answer.unwrap_or(false))
    }

    pub fn mark_present(&self, object: &ObjectSpec) {
        self.cache.record(&self.scope, &self.map(object).oid, true);
    }

    pub fn cached(&self, object: &ObjectSpec) -> Option<bool> {
        self.cache.get(&self.scope, &self.map(object).oid)
    }
}

/// Presence implied by a download batch answer; `None` when the answer says nothing.
fn presence_of(action: &TransferAction) -> Option<bool> {
    match action {
        TransferAction::Ready { .. } | TransferAction::Present { .. } => Some(true),
        rejected if rejected.is_not_found() => Some(false),
        TransferAction::Rejected { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryEndpoint;
    use std::thread;

    fn spec(content: &[u8]) -> ObjectSpec {
        ObjectSpec::new(Oid::from_content(content), content.len() as u64)
    }

    #[test]
    fn test_identity_mapping() {
        let dest = MemoryEndpoint::new("dest");
        let mapper = OidMapper::new(&dest, Arc::new(PresenceCache::new()));
        let object = spec(b"same bytes");
        assert_eq!(mapper.map(&object), object);
    }

    #[test]
    fn test_presence_lookup_is_memoized() {
        let dest = MemoryEndpoint::new("dest");
        let stored = spec(b"stored");
        let missing = spec(b"missing");
        dest.insert(b"stored");

        let mapper = OidMapper::new(&dest, Arc::new(PresenceCache::new()));
        mapper.check_presence(&[stored.clone(), missing.clone()]).unwrap();
        assert_eq!(dest.batch_calls(), 1);

        assert!(mapper.is_present(&stored).unwrap());
        assert!(!mapper.is_present(&missing).unwrap());
        mapper.check_presence(&[stored, missing]).unwrap();
        assert_eq!(dest.batch_calls(), 1);
    }

    #[test]
    fn test_mark_present_overrides_absence() {
        let dest = MemoryEndpoint::new("dest");
        let object = spec(b"uploaded later");
        let mapper = OidMapper::new(&dest, Arc::new(PresenceCache::new()));
        assert!(!mapper.is_present(&object).unwrap());
        mapper.mark_present(&object);
        assert_eq!(mapper.cached(&object), Some(true));
    }

    #[test]
    fn test_concurrent_lookups_are_coalesced() {
        let dest = MemoryEndpoint::new("dest").with_latency_ms(50);
        let object = spec(b"hot object");
        dest.insert(b"hot object");
        let cache = Arc::new(PresenceCache::new());

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mapper = OidMapper::new(&dest, cache.clone());
                    assert!(mapper.is_present(&object).unwrap());
                });
            }
        });
        assert_eq!(dest.batch_calls(), 1);
    }

    #[test]
    fn test_forget_absent_keeps_positive_answers() {
        let cache = PresenceCache::new();
        let yes = Oid::from_content(b"yes");
        let no = Oid::from_content(b"no");
        cache.record("dest", &yes, true);
        cache.record("dest", &no, false);
        cache.forget_absent();
        assert_eq!(cache.get("dest", &yes), Some(true));
        assert_eq!(cache.get("dest", &no), None);
    }

    #[test]
    fn test_presence_is_per_destination() {
        let first = MemoryEndpoint::new("first");
        let second = MemoryEndpoint::new("second");
        let object = spec(b"uploaded to first only");
        first.insert(b"uploaded to first only");
        let cache = Arc::new(PresenceCache::new());

        let a = OidMapper::new(&first, cache.clone());
        a.mark_present(&object);
        assert_eq!(a.cached(&object), Some(true));

        let b = OidMapper::new(&second, cache.clone());
        assert_eq!(b.cached(&object), None);
        assert!(!b.is_present(&object).unwrap());
        assert_eq!(second.batch_calls(), 1);
    }
}
