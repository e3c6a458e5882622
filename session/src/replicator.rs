//! Element replication bookkeeping.
//!
//! Creation messages are remembered so they go out once and can be replayed
//! to anyone who joins later. State snapshots pass through a per-element
//! throttle: an unchanged snapshot is never resent, and a change arriving
//! within the minimum interval waits until the interval has passed, only the
//! latest one surviving.

use shared::{AutoElementCreation, MainElementCreation, MainElementState, PermElementState, PlayerIndex};
use std::collections::BTreeMap;

#[derive(Debug)]
struct StateThrottle<T> {
    last_sent_at: Option<i64>,
    last_sent: Option<T>,
    pending: Option<T>,
}

impl<T> Default for StateThrottle<T> {
    fn default() -> Self {
        Self {
            last_sent_at: None,
            last_sent: None,
            pending: None,
        }
    }
}

impl<T: Clone + PartialEq> StateThrottle<T> {
    fn offer(&mut self, state: T) {
        if self.last_sent.as_ref() == Some(&state) {
            self.pending = None;
        } else {
            self.pending = Some(state);
        }
    }

    fn poll(&mut self, now: i64, min_interval: i64) -> Option<T> {
        self.pending.as_ref()?;
        if let Some(sent_at) = self.last_sent_at {
            if now - sent_at < min_interval {
                return None;
            }
        }

        let state = self.pending.take()?;
        self.last_sent = Some(state.clone());
        self.last_sent_at = Some(now);
        Some(state)
    }
}

#[derive(Debug)]
pub struct Replicator {
    min_interval: i64,
    main_creations: BTreeMap<PlayerIndex, MainElementCreation>,
    auto_creations: BTreeMap<(PlayerIndex, u32), AutoElementCreation>,
    main_states: BTreeMap<PlayerIndex, StateThrottle<MainElementState>>,
    perm_states: BTreeMap<u32, StateThrottle<PermElementState>>,
    /// Last participant that changed each permanent element
    perm_origins: BTreeMap<u32, PlayerIndex>,
}

impl Replicator {
    pub fn new(min_interval: i64) -> Self {
        Self {
            min_interval: min_interval.max(0),
            main_creations: BTreeMap::new(),
            auto_creations: BTreeMap::new(),
            main_states: BTreeMap::new(),
            perm_states: BTreeMap::new(),
            perm_origins: BTreeMap::new(),
        }
    }

    /// Remembers the creation of `player`'s vehicle. Returns false if one was
    /// already recorded, in which case nothing changes.
    pub fn record_main_creation(&mut self, player: PlayerIndex, creation: MainElementCreation) -> bool {
        if self.main_creations.contains_key(&player) {
            return false;
        }
        self.main_creations.insert(player, creation);
        true
    }

    pub fn record_auto_creation(&mut self, origin: PlayerIndex, creation: AutoElementCreation) -> bool {
        let key = (origin, creation.element);
        if self.auto_creations.contains_key(&key) {
            return false;
        }
        self.auto_creations.insert(key, creation);
        true
    }

    pub fn main_creations(&self) -> impl Iterator<Item = (PlayerIndex, &MainElementCreation)> {
        self.main_creations.iter().map(|(player, creation)| (*player, creation))
    }

    pub fn auto_creations(&self) -> impl Iterator<Item = (PlayerIndex, &AutoElementCreation)> {
        self.auto_creations.iter().map(|((origin, _), creation)| (*origin, creation))
    }

    pub fn offer_main_state(&mut self, player: PlayerIndex, state: MainElementState) {
        self.main_states.entry(player).or_default().offer(state);
    }

    pub fn offer_perm_state(&mut self, origin: PlayerIndex, state: PermElementState) {
        self.perm_origins.insert(state.perm_id, origin);
        self.perm_states.entry(state.perm_id).or_default().offer(state);
    }

    pub fn due_main_states(&mut self, now: i64) -> Vec<(PlayerIndex, MainElementState)> {
        let min_interval = self.min_interval;
        self.main_states
            .iter_mut()
            .filter_map(|(player, throttle)| throttle.poll(now, min_interval).map(|state| (*player, state)))
            .collect()
    }

    /// Permanent element states due now, each with the participant whose
    /// change it carries.
    pub fn due_perm_states(&mut self, now: i64) -> Vec<(PlayerIndex, PermElementState)> {
        let min_interval = self.min_interval;
        let origins = &self.perm_origins;
        self.perm_states
            .iter_mut()
            .filter_map(|(perm_id, throttle)| {
                let origin = *origins.get(perm_id)?;
                throttle.poll(now, min_interval).map(|state| (origin, state))
            })
            .collect()
    }

    /// Forgets everything `player` created, so a reused index starts clean.
    pub fn forget_player(&mut self, player: PlayerIndex) {
        self.main_creations.remove(&player);
        self.main_states.remove(&player);
        self.auto_creations.retain(|(origin, _), _| *origin != player);
    }
}
