//! Module set handles
//!
//! Maps caller-facing [`ModuleSetHandle`]s to the engine's native ids. Each
//! handle carries the generation of the slot it was issued for; removing a
//! set bumps the generation, so a handle can never reach a later occupant of
//! its slot.

use std::fmt;

/// Opaque token for a registered module set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleSetHandle {
    slot: u32,
    generation: u32,
}

impl ModuleSetHandle {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ModuleSetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    occupant: Option<T>,
}

/// Slot map from handles to native module set ids.
pub struct ModuleSetRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    active: usize,
}

impl<T: Copy> ModuleSetRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            active: 0,
        }
    }

    pub fn insert(&mut self, native: T) -> ModuleSetHandle {
        self.active += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.occupant = Some(native);
            return ModuleSetHandle {
                slot,
                generation: entry.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            occupant: Some(native),
        });
        ModuleSetHandle {
            slot,
            generation: 0,
        }
    }

    /// Native id of an active handle.
    pub fn get(&self, handle: ModuleSetHandle) -> Option<T> {
        self.slots
            .get(handle.slot as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.occupant)
    }

    /// Deactivate `handle`, returning its native id. `None` if it was not active.
    pub fn remove(&mut self, handle: ModuleSetHandle) -> Option<T> {
        let entry = self.slots.get_mut(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let native = entry.occupant.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot);
        self.active -= 1;
        Some(native)
    }

    pub fn contains(&self, handle: ModuleSetHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Active handles, by slot.
    pub fn handles(&self) -> Vec<ModuleSetHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.occupant.is_some())
            .map(|(slot, entry)| ModuleSetHandle {
                slot: slot as u32,
                generation: entry.generation,
            })
            .collect()
    }
}

impl<T: Copy> Default for ModuleSetRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut registry = ModuleSetRegistry::new();
        let a = registry.insert(10u64);
        let b = registry.insert(20u64);
        assert_ne!(a, b);
        assert_eq!(registry.get(a), Some(10));
        assert_eq!(registry.get(b), Some(20));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_removed_handle_is_stale() {
        let mut registry = ModuleSetRegistry::new();
        let a = registry.insert(1u64);
        assert_eq!(registry.remove(a), Some(1));
        assert_eq!(registry.get(a), None);
        assert_eq!(registry.remove(a), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let mut registry = ModuleSetRegistry::new();
        let old = registry.insert(1u64);
        registry.remove(old);

        let new = registry.insert(2u64);
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new.generation(), old.generation());
        assert_ne!(new, old);
        assert_eq!(registry.get(old), None);
        assert_eq!(registry.get(new), Some(2));
    }

    #[test]
    fn test_handles_lists_active_only() {
        let mut registry = ModuleSetRegistry::new();
        let a = registry.insert(1u64);
        let b = registry.insert(2u64);
        let c = registry.insert(3u64);
        registry.remove(b);
        assert_eq!(registry.handles(), vec![a, c]);
    }

    #[test]
    fn test_display() {
        let mut registry = ModuleSetRegistry::new();
        let h = registry.insert(0u64);
        assert_eq!(h.to_string(), "#0.0");
    }
}
