//! Seat management for the participants of a session
//!
//! This module tracks who occupies which player index:
//! - Admission of joining clients into the lowest free slot
//! - Idempotent eviction, so a timeout and an explicit leave may race freely
//! - Binding of the simulated vehicle that represents each participant
//! - Liveness tracking so the master reclaims slots whose leave was lost
//!
//! On the master the slots are filled by `admit`. A client mirrors the
//! master's assignment with `occupy`, and keeps the master's own player in a
//! dedicated host slot.

use crate::error::{Result, SessionError};
use crate::transport::TransportHandle;
use log::info;
use shared::PlayerIndex;

/// Opaque handle of an entity owned by the simulation collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(pub u32);

/// One occupied seat
#[derive(Debug, Clone)]
pub struct ClientSlot {
    /// Stable index of this seat
    pub index: PlayerIndex,
    /// Connection the participant's traffic arrives on
    pub handle: TransportHandle,
    pub name: String,
    /// Stable id handed out by the master. Survives index reuse; 0 until
    /// the master's announcement names it.
    pub player_id: u32,
    pub craft_model: u8,
    /// Vehicle bound once the simulation instantiated it
    pub character: Option<EntityHandle>,
    /// Session uptime of the last message received from this participant
    pub last_seen: i64,
}

impl ClientSlot {
    pub fn new(index: PlayerIndex, handle: TransportHandle, name: &str, now: i64) -> Self {
        Self {
            index,
            handle,
            name: name.to_string(),
            player_id: 0,
            craft_model: 0,
            character: None,
            last_seen: now,
        }
    }

    pub fn touch(&mut self, now: i64) {
        self.last_seen = self.last_seen.max(now);
    }

    /// Returns true if nothing was heard from this participant for longer
    /// than `timeout` milliseconds.
    pub fn is_timed_out(&self, now: i64, timeout: i64) -> bool {
        now - self.last_seen > timeout
    }
}

/// Fixed-capacity slot map indexed by player index
///
/// Capacity never changes after creation, so an index handed out stays valid
/// for as long as its participant is admitted, and is reused (lowest first)
/// once they leave.
#[derive(Debug)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientSlot>>,
    host: Option<ClientSlot>,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        let capacity = max_clients.min(PlayerIndex::HOST.as_usize());
        Self {
            slots: vec![None; capacity],
            host: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Seats a joining participant in the lowest free slot.
    pub fn admit(
        &mut self,
        handle: TransportHandle,
        name: &str,
        player_id: u32,
        now: i64,
    ) -> Result<PlayerIndex> {
        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SessionError::SessionFull(self.slots.len()))?;

        let index = PlayerIndex(free as u8);
        let mut slot = ClientSlot::new(index, handle, name, now);
        slot.player_id = player_id;
        info!("Admitted {} '{}' on {}", index, name, handle);
        self.slots[free] = Some(slot);

        Ok(index)
    }

    /// Seats a participant at an index chosen elsewhere (the master's
    /// assignment, as mirrored by a client). An existing occupant is replaced.
    pub fn occupy(
        &mut self,
        index: PlayerIndex,
        handle: TransportHandle,
        name: &str,
        player_id: u32,
        now: i64,
    ) -> Result<()> {
        let mut slot = ClientSlot::new(index, handle, name, now);
        slot.player_id = player_id;
        if index.is_host() {
            self.host = Some(slot);
            return Ok(());
        }

        let entry = self
            .slots
            .get_mut(index.as_usize())
            .ok_or(SessionError::UnknownSlot(index))?;
        *entry = Some(slot);
        Ok(())
    }

    /// Frees a slot and hands back what it held. Evicting a free slot is a
    /// no-op returning `None`.
    pub fn evict(&mut self, index: PlayerIndex) -> Option<ClientSlot> {
        let removed = if index.is_host() {
            self.host.take()
        } else {
            self.slots.get_mut(index.as_usize()).and_then(Option::take)
        };

        if let Some(slot) = &removed {
            info!("Evicted {} '{}'", slot.index, slot.name);
        }
        removed
    }

    pub fn bind_character(&mut self, index: PlayerIndex, entity: EntityHandle) -> Result<()> {
        let slot = self
            .get_mut(index)
            .ok_or(SessionError::UnknownSlot(index))?;
        slot.character = Some(entity);
        Ok(())
    }

    pub fn get(&self, index: PlayerIndex) -> Option<&ClientSlot> {
        if index.is_host() {
            self.host.as_ref()
        } else {
            self.slots.get(index.as_usize()).and_then(Option::as_ref)
        }
    }

    pub fn get_mut(&mut self, index: PlayerIndex) -> Option<&mut ClientSlot> {
        if index.is_host() {
            self.host.as_mut()
        } else {
            self.slots.get_mut(index.as_usize()).and_then(Option::as_mut)
        }
    }

    pub fn is_admitted(&self, index: PlayerIndex) -> bool {
        self.get(index).is_some()
    }

    pub fn find_by_handle(&self, handle: TransportHandle) -> Option<PlayerIndex> {
        self.active()
            .find(|slot| slot.handle == handle)
            .map(|slot| slot.index)
    }

    pub fn find_by_player_id(&self, player_id: u32) -> Option<PlayerIndex> {
        self.active()
            .find(|slot| slot.player_id == player_id)
            .map(|slot| slot.index)
    }

    pub fn touch(&mut self, index: PlayerIndex, now: i64) {
        if let Some(slot) = self.get_mut(index) {
            slot.touch(now);
        }
    }

    /// Lists the participants that went silent for longer than `timeout`.
    /// The caller evicts them so it can announce the departure.
    pub fn timed_out(&self, now: i64, timeout: i64) -> Vec<PlayerIndex> {
        self.active()
            .filter(|slot| slot.is_timed_out(now, timeout))
            .map(|slot| slot.index)
            .collect()
    }

    /// Occupied slots in index order, the host slot last.
    pub fn active(&self) -> impl Iterator<Item = &ClientSlot> {
        self.slots.iter().flatten().chain(self.host.iter())
    }

    pub fn len(&self) -> usize {
        self.active().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u32) -> TransportHandle {
        TransportHandle(n)
    }

    #[test]
    fn test_client_slot_creation() {
        let slot = ClientSlot::new(PlayerIndex(2), handle(7), "Ace", 100);

        assert_eq!(slot.index, PlayerIndex(2));
        assert_eq!(slot.handle, handle(7));
        assert_eq!(slot.name, "Ace");
        assert!(slot.character.is_none());
        assert_eq!(slot.last_seen, 100);
    }

    #[test]
    fn test_client_slot_timeout() {
        let mut slot = ClientSlot::new(PlayerIndex(0), handle(1), "Ace", 0);

        assert!(!slot.is_timed_out(1000, 5000));
        assert!(slot.is_timed_out(5001, 5000));

        slot.touch(4000);
        assert!(!slot.is_timed_out(5001, 5000));
    }

    #[test]
    fn test_registry_creation() {
        let registry = ClientRegistry::new(5);
        assert_eq!(registry.capacity(), 5);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_admit() {
        let mut registry = ClientRegistry::new(2);

        let index = registry.admit(handle(1), "Ace", 101, 0).unwrap();
        assert_eq!(index, PlayerIndex(0));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_admitted(index));
    }

    #[test]
    fn test_admit_multiple() {
        let mut registry = ClientRegistry::new(3);

        let first = registry.admit(handle(1), "Ace", 102, 0).unwrap();
        let second = registry.admit(handle(2), "Bee", 103, 0).unwrap();

        assert_eq!(first, PlayerIndex(0));
        assert_eq!(second, PlayerIndex(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_admit_max_capacity() {
        let mut registry = ClientRegistry::new(1);

        assert!(registry.admit(handle(1), "Ace", 104, 0).is_ok());
        let refused = registry.admit(handle(2), "Bee", 105, 0);
        assert!(matches!(refused, Err(SessionError::SessionFull(1))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_evicted_slot_is_reused_lowest_first() {
        let mut registry = ClientRegistry::new(4);
        for n in 0..4 {
            registry.admit(handle(n), "p", 106, 0).unwrap();
        }

        registry.evict(PlayerIndex(2));
        registry.evict(PlayerIndex(1));

        assert_eq!(registry.admit(handle(10), "p", 107, 0).unwrap(), PlayerIndex(1));
        assert_eq!(registry.admit(handle(11), "p", 108, 0).unwrap(), PlayerIndex(2));
    }

    #[test]
    fn test_no_shared_index_across_admit_evict_sequences() {
        let mut registry = ClientRegistry::new(4);
        let mut next_handle = 0;

        // Deterministic mix of admissions and evictions
        for step in 0..200u32 {
            if step % 3 == 2 {
                registry.evict(PlayerIndex(((step * 7) % 4) as u8));
            } else {
                next_handle += 1;
                let _ = registry.admit(handle(next_handle), "p", 109, 0);
            }

            let mut seen: Vec<PlayerIndex> = registry.active().map(|slot| slot.index).collect();
            let count = seen.len();
            seen.dedup();
            assert_eq!(seen.len(), count);

            // Every free index below an occupied one would have been taken
            if let Some(free) = (0..4u8).find(|i| !registry.is_admitted(PlayerIndex(*i))) {
                next_handle += 1;
                let admitted = registry.admit(handle(next_handle), "p", 110, 0).unwrap();
                assert_eq!(admitted, PlayerIndex(free));
            }
        }
    }

    #[test]
    fn test_evict_is_idempotent() {
        let mut registry = ClientRegistry::new(3);
        registry.admit(handle(1), "Ace", 111, 0).unwrap();
        registry.admit(handle(2), "Bee", 112, 0).unwrap();

        assert!(registry.evict(PlayerIndex(0)).is_some());
        let after_once: Vec<PlayerIndex> = registry.active().map(|s| s.index).collect();

        assert!(registry.evict(PlayerIndex(0)).is_none());
        let after_twice: Vec<PlayerIndex> = registry.active().map(|s| s.index).collect();

        assert_eq!(after_once, after_twice);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_evict_out_of_range_is_noop() {
        let mut registry = ClientRegistry::new(2);
        assert!(registry.evict(PlayerIndex(9)).is_none());
    }

    #[test]
    fn test_evict_returns_bound_character() {
        let mut registry = ClientRegistry::new(2);
        let index = registry.admit(handle(1), "Ace", 113, 0).unwrap();
        registry.bind_character(index, EntityHandle(42)).unwrap();

        let removed = registry.evict(index).unwrap();
        assert_eq!(removed.character, Some(EntityHandle(42)));
    }

    #[test]
    fn test_bind_character_unknown_slot() {
        let mut registry = ClientRegistry::new(2);
        let result = registry.bind_character(PlayerIndex(1), EntityHandle(3));
        assert!(matches!(result, Err(SessionError::UnknownSlot(PlayerIndex(1)))));
    }

    #[test]
    fn test_occupy_host_slot() {
        let mut registry = ClientRegistry::new(2);
        registry.occupy(PlayerIndex::HOST, handle(0), "Master", 9, 0).unwrap();
        registry.occupy(PlayerIndex(1), handle(0), "Bee", 4, 0).unwrap();

        assert_eq!(registry.len(), 2);
        let order: Vec<PlayerIndex> = registry.active().map(|s| s.index).collect();
        assert_eq!(order, vec![PlayerIndex(1), PlayerIndex::HOST]);
        assert!(registry.occupy(PlayerIndex(5), handle(0), "x", 5, 0).is_err());
    }

    #[test]
    fn test_find_by_handle_and_player_id() {
        let mut registry = ClientRegistry::new(3);
        let first = registry.admit(handle(10), "Ace", 77, 0).unwrap();
        let second = registry.admit(handle(20), "Bee", 114, 0).unwrap();

        assert_eq!(registry.find_by_handle(handle(20)), Some(second));
        assert_eq!(registry.find_by_handle(handle(99)), None);
        assert_eq!(registry.find_by_player_id(77), Some(first));
        assert_eq!(registry.find_by_player_id(78), None);
    }

    #[test]
    fn test_timed_out() {
        let mut registry = ClientRegistry::new(3);
        let quiet = registry.admit(handle(1), "Ace", 115, 0).unwrap();
        let chatty = registry.admit(handle(2), "Bee", 116, 0).unwrap();

        registry.touch(chatty, 5500);

        assert_eq!(registry.timed_out(6000, 5000), vec![quiet]);
    }
}
