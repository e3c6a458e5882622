//! Race results and hit statistics.
//!
//! Results stay sorted at all times: finishers first by finish time, then
//! everyone still racing by laps completed. Ties break on best lap, player
//! index and finally player id, so every participant computes the same order.
//!
//! Entries outlive their participant. When someone leaves, their entries are
//! marked disconnected and detached from the player index, which the registry
//! may hand to a newcomer; the newcomer starts with a clean record.

use shared::PlayerIndex;
use std::cmp::Reverse;

/// Who a ledger entry belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub player: PlayerIndex,
    /// Stable id assigned by the master; 0 when not known yet
    pub player_id: u32,
    pub name: String,
}

impl Identity {
    pub fn new(player: PlayerIndex, player_id: u32, name: &str) -> Self {
        Self {
            player,
            player_id,
            name: name.to_string(),
        }
    }
}

/// Whether an existing entry describes the same participant as `identity`.
/// A departed entry only matches through its stable id.
fn belongs_to(player: PlayerIndex, player_id: u32, connected: bool, identity: &Identity) -> bool {
    (player_id != 0 && player_id == identity.player_id) || (connected && player == identity.player)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    pub player: PlayerIndex,
    pub player_id: u32,
    pub name: String,
    pub craft_model: u8,
    /// The entry belongs to the local player
    pub local: bool,
    /// The participant is still in the session
    pub connected: bool,
    pub laps: i32,
    pub finish_time: i64,
    pub best_lap: i64,
}

impl ResultEntry {
    pub fn new(identity: Identity, finish_time: i64, best_lap: i64, laps: i32) -> Self {
        Self {
            player: identity.player,
            player_id: identity.player_id,
            name: identity.name,
            craft_model: 0,
            local: false,
            connected: true,
            laps,
            finish_time,
            best_lap,
        }
    }

    fn identity(&self) -> Identity {
        Identity::new(self.player, self.player_id, &self.name)
    }
}

type OrderKey = (bool, Reverse<i32>, i64, i64, PlayerIndex, u32);

#[derive(Debug)]
pub struct ResultLedger {
    race_laps: i32,
    entries: Vec<ResultEntry>,
}

impl ResultLedger {
    pub fn new(race_laps: u8) -> Self {
        Self {
            race_laps: i32::from(race_laps.max(1)),
            entries: Vec::new(),
        }
    }

    pub fn set_race_laps(&mut self, race_laps: u8) {
        self.race_laps = i32::from(race_laps.max(1));
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|entry| self.order_key(entry));
        self.entries = entries;
    }

    fn order_key(&self, entry: &ResultEntry) -> OrderKey {
        let finished = entry.laps >= self.race_laps;
        // Finishers compare on time only; overshooting the lap count is noise
        let laps = if finished { self.race_laps } else { entry.laps };
        (
            !finished,
            Reverse(laps),
            entry.finish_time,
            entry.best_lap,
            entry.player,
            entry.player_id,
        )
    }

    /// Inserts or replaces the entry of `entry`'s participant and returns its
    /// rank.
    pub fn record(&mut self, entry: ResultEntry) -> usize {
        let identity = entry.identity();
        self.entries.retain(|existing| {
            !belongs_to(existing.player, existing.player_id, existing.connected, &identity)
        });

        let key = self.order_key(&entry);
        let rank = self
            .entries
            .partition_point(|other| self.order_key(other) < key);
        self.entries.insert(rank, entry);
        rank
    }

    /// Detaches `player`'s entry from its index. The entry keeps its rank.
    pub fn mark_departed(&mut self, player: PlayerIndex) {
        for entry in self.entries.iter_mut() {
            if entry.connected && entry.player == player {
                entry.connected = false;
                entry.local = false;
            }
        }
    }

    /// Rank of the participant currently seated at `player`.
    pub fn rank_of(&self, player: PlayerIndex) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.connected && entry.player == player)
    }

    pub fn query_by_rank(&self, rank: usize) -> Option<&ResultEntry> {
        self.entries.get(rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitEntry {
    pub player: PlayerIndex,
    pub player_id: u32,
    pub name: String,
    pub connected: bool,
    pub hits_landed: u32,
    pub times_hit: u32,
}

/// Every report counts, duplicates included.
#[derive(Debug, Default)]
pub struct HitLedger {
    entries: Vec<HitEntry>,
}

impl HitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_mut(&mut self, identity: &Identity) -> &mut HitEntry {
        let found = self
            .entries
            .iter()
            .position(|e| belongs_to(e.player, e.player_id, e.connected, identity));
        let position = match found {
            Some(position) => position,
            None => {
                self.entries.push(HitEntry {
                    player: identity.player,
                    player_id: identity.player_id,
                    name: identity.name.clone(),
                    connected: true,
                    hits_landed: 0,
                    times_hit: 0,
                });
                self.entries.len() - 1
            }
        };

        // A participant back under its stable id takes its tally along
        let entry = &mut self.entries[position];
        entry.player = identity.player;
        entry.connected = true;
        if identity.player_id != 0 {
            entry.player_id = identity.player_id;
        }
        if !identity.name.is_empty() {
            entry.name.clone_from(&identity.name);
        }
        entry
    }

    /// A self-inflicted hit counts against the victim only.
    pub fn record_hit(&mut self, attacker: &Identity, victim: &Identity) {
        self.entry_mut(victim).times_hit += 1;
        if attacker.player != victim.player {
            self.entry_mut(attacker).hits_landed += 1;
        }
    }

    /// Puts back a tally replayed by the master, replacing whatever this
    /// ledger held for the same participant.
    pub fn restore(&mut self, entry: HitEntry) {
        let identity = Identity::new(entry.player, entry.player_id, &entry.name);
        if entry.connected {
            self.entries
                .retain(|e| !belongs_to(e.player, e.player_id, e.connected, &identity));
        } else {
            self.entries
                .retain(|e| entry.player_id == 0 || e.player_id != entry.player_id);
        }
        self.entries.push(entry);
    }

    pub fn mark_departed(&mut self, player: PlayerIndex) {
        for entry in self.entries.iter_mut() {
            if entry.connected && entry.player == player {
                entry.connected = false;
            }
        }
    }

    pub fn query_hits(&self, player: PlayerIndex) -> Option<&HitEntry> {
        self.entries
            .iter()
            .find(|e| e.connected && e.player == player)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HitEntry> {
        self.entries.iter()
    }
}
