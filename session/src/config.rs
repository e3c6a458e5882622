use crate::rules::RaceRules;
use shared::{MAX_CLIENTS, RACE_COUNTDOWN_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Client,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// Game instance id. Assigned by the master; a client must leave it unset.
    pub major_id: Option<u32>,
    /// Sub-instance id, used to recognise a reconnecting player.
    pub minor_id: Option<u32>,
    pub player_name: String,
    pub craft_model: u8,
    pub rules: RaceRules,
    pub max_clients: usize,
    pub countdown_ms: i64,
    pub max_inbound_per_tick: usize,
    pub state_min_interval_ms: i64,
    pub chat_flush_interval_ms: i64,
    pub chat_capacity_chars: usize,
    pub max_correction_per_tick_ms: i64,
    pub correction_tolerance_ms: i64,
    pub client_timeout_ms: i64,
    /// A client that sent nothing for this long echoes its clock to the
    /// master so its slot is not reclaimed.
    pub keepalive_interval_ms: i64,
    pub join_grace_ms: i64,
    pub violation_threshold: u32,
}

impl SessionConfig {
    pub fn master(major_id: u32, minor_id: u32) -> Self {
        Self {
            role: Role::Master,
            major_id: Some(major_id),
            minor_id: Some(minor_id),
            ..Self::default()
        }
    }

    pub fn client() -> Self {
        Self::default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            major_id: None,
            minor_id: None,
            player_name: "Player".to_string(),
            craft_model: 0,
            rules: RaceRules::default(),
            max_clients: MAX_CLIENTS,
            countdown_ms: RACE_COUNTDOWN_MS,
            max_inbound_per_tick: 256,
            state_min_interval_ms: 100,
            chat_flush_interval_ms: 250,
            chat_capacity_chars: 2000,
            max_correction_per_tick_ms: 20,
            correction_tolerance_ms: 5,
            client_timeout_ms: 5000,
            keepalive_interval_ms: 1000,
            join_grace_ms: 20_000,
            violation_threshold: 5,
        }
    }
}
