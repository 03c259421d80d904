//! # Usage handles
//!
//! Usages live in a slot table owned by the dialog usage manager. A
//! [`Handle`] is a slot index plus the generation the slot had when the usage
//! was inserted; removing a usage bumps the slot's generation, so every
//! handle taken to it stops resolving. Handles are `Copy` and can be kept by
//! the application indefinitely: using a dead one yields
//! [`DumError::StaleHandle`] instead of touching a recycled slot.
//!
//! ```text
//! slot 3: gen 7 ── ServerSubscription        Handle{3, 7} ✓
//!          remove ▼
//! slot 3: gen 8 ── (free)                    Handle{3, 7} ✗ stale
//!          insert ▼
//! slot 3: gen 8 ── ClientRegistration        Handle{3, 8} ✓   Handle{3, 7} ✗
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::errors::{DumError, DumResult};
use crate::manager::DialogUsageManager;

use super::Usage;

/// Untyped identity of a usage slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsageId {
    index: u32,
    generation: u32,
}

impl fmt::Display for UsageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Implemented by every usage type stored in the registry
pub trait UsageKind: Sized + 'static {
    const NAME: &'static str;

    fn from_usage(usage: &Usage) -> Option<&Self>;
    fn from_usage_mut(usage: &mut Usage) -> Option<&mut Self>;
    fn into_usage(self) -> Usage;
}

/// Typed, validity-checked reference to a usage
pub struct Handle<K> {
    id: UsageId,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    pub(crate) fn from_id(id: UsageId) -> Self {
        Self {
            id,
            _kind: PhantomData,
        }
    }

    pub fn id(&self) -> UsageId {
        self.id
    }
}

impl<K: UsageKind> Handle<K> {
    /// `true` while the usage exists
    pub fn is_valid(&self, dum: &DialogUsageManager) -> bool {
        dum.registry.get(*self).is_ok()
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K: UsageKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Handle({})", K::NAME, self.id)
    }
}

struct Slot {
    generation: u32,
    usage: Option<Usage>,
}

/// Generation-counted slot table of live usages
#[derive(Default)]
pub struct UsageRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl UsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a usage built from its own id
    pub fn insert_with<K, F>(&mut self, build: F) -> Handle<K>
    where
        K: UsageKind,
        F: FnOnce(UsageId) -> K,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    usage: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = UsageId {
            index,
            generation: slot.generation,
        };
        slot.usage = Some(build(id).into_usage());
        self.live += 1;
        Handle::from_id(id)
    }

    fn slot(&self, id: UsageId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn contains(&self, id: UsageId) -> bool {
        self.get_any(id).is_some()
    }

    pub fn get_any(&self, id: UsageId) -> Option<&Usage> {
        self.slot(id).and_then(|slot| slot.usage.as_ref())
    }

    pub fn get_any_mut(&mut self, id: UsageId) -> Option<&mut Usage> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.usage.as_mut())
    }

    pub fn get<K: UsageKind>(&self, handle: Handle<K>) -> DumResult<&K> {
        self.get_any(handle.id)
            .and_then(K::from_usage)
            .ok_or(DumError::StaleHandle { id: handle.id })
    }

    pub fn get_mut<K: UsageKind>(&mut self, handle: Handle<K>) -> DumResult<&mut K> {
        self.get_any_mut(handle.id)
            .and_then(K::from_usage_mut)
            .ok_or(DumError::StaleHandle { id: handle.id })
    }

    /// Remove a usage, invalidating all handles to it
    pub fn remove(&mut self, id: UsageId) -> Option<Usage> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let usage = slot.usage.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(usage)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn ids(&self) -> Vec<UsageId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.usage.is_some())
            .map(|(index, slot)| UsageId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::DialogSetId;
    use crate::usage::out_of_dialog::ServerOutOfDialogReq;
    use sipdum_message::{Method, Request};

    fn ood(id: UsageId) -> ServerOutOfDialogReq {
        let request = Request::new(Method::Options, "sip:bob@biloxi.example.com".parse().unwrap());
        ServerOutOfDialogReq::new(id, DialogSetId::new("call", "tag"), request)
    }

    #[test]
    fn test_removed_handle_goes_stale() {
        let mut registry = UsageRegistry::new();
        let handle = registry.insert_with(ood);
        assert!(registry.get(handle).is_ok());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(handle.id()).is_some());
        assert!(matches!(registry.get(handle), Err(DumError::StaleHandle { .. })));
        assert!(registry.remove(handle.id()).is_none());

        // The slot is reused under a new generation
        let reused = registry.insert_with(ood);
        assert_ne!(reused, handle);
        assert!(registry.get(handle).is_err());
        assert!(registry.get(reused).is_ok());
        assert_eq!(registry.ids(), vec![reused.id()]);
    }

    #[test]
    fn test_wrong_kind_is_stale() {
        use crate::usage::ClientRegistration;

        let mut registry = UsageRegistry::new();
        let handle = registry.insert_with(ood);
        let wrong: Handle<ClientRegistration> = Handle::from_id(handle.id());
        assert!(registry.get(wrong).is_err());
    }
}
