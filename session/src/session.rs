use crate::chat::{ChatBuffer, ChatComposer, ChatLine};
use crate::clock::{AnchorSchedule, ClockSync};
use crate::config::{Role, SessionConfig};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::ledger::{HitEntry, HitLedger, Identity, ResultEntry, ResultLedger};
use crate::registry::{ClientRegistry, ClientSlot, EntityHandle};
use crate::replicator::Replicator;
use crate::rules::RaceRules;
use crate::transport::{Inbound, NetworkInterface, Target, TransportHandle};
use log::{debug, error, info, warn};
use shared::{
    AutoElementCreation, ChatText, HitReport, JoinMessage, MainElementCreation, MainElementState,
    MainElementStats, MessageKind, Packet, Payload, PermElementState, PlayerIndex, TimeAnchor,
    FINE_ANCHOR_PERIOD_MS, MAX_CHAT_BYTES, PROTOCOL_VERSION,
};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Join request sent, no answer yet
    Joining,
    Joined,
    Failed,
    Closed,
}

#[derive(Debug)]
struct OutgoingChat {
    origin: PlayerIndex,
    text: String,
    except: Option<TransportHandle>,
}

/// One participant's view of a race session
///
/// The session owns every piece of session state and the network it talks
/// through. Nothing happens between calls: the host drives it by calling
/// [`Session::tick`] once per frame and acts on the events it returns.
pub struct Session<N: NetworkInterface> {
    config: SessionConfig,
    network: N,
    state: ConnectionState,
    major_id: Option<u32>,
    /// Own stable player id. A client learns it from the master.
    minor_id: Option<u32>,
    own_index: Option<PlayerIndex>,
    /// Next player id the master hands out
    next_player_id: u32,
    /// Connection the master speaks on, as seen by a client
    master_handle: Option<TransportHandle>,
    uptime: i64,
    sim_time: i64,
    last_heard: i64,
    last_sent: i64,
    registry: ClientRegistry,
    replicator: Replicator,
    results: ResultLedger,
    hits: HitLedger,
    clock: ClockSync,
    anchors: AnchorSchedule,
    chat: ChatBuffer,
    composer: ChatComposer,
    outgoing_chat: Vec<OutgoingChat>,
    last_chat_flush: Option<i64>,
    violations: HashMap<TransportHandle, u32>,
    local_creation: Option<MainElementCreation>,
    local_character: Option<EntityHandle>,
    events: Vec<SessionEvent>,
}

impl<N: NetworkInterface> Session<N> {
    /// Creates a session in the configured role. A client sends its join
    /// request right away.
    pub fn new(config: SessionConfig, network: N) -> Result<Self> {
        match (config.role, config.major_id) {
            (Role::Client, Some(major_id)) => {
                return Err(SessionError::InvalidRole(format!(
                    "a client cannot assign itself major id {:08x}",
                    major_id
                )))
            }
            (Role::Master, None) => {
                return Err(SessionError::InvalidRole(
                    "a master needs a major id".to_string(),
                ))
            }
            _ => {}
        }

        let (state, own_index, capacity) = match config.role {
            Role::Master => (
                ConnectionState::Joined,
                Some(PlayerIndex::HOST),
                config.max_clients,
            ),
            // A client mirrors whatever indices the master hands out
            Role::Client => (ConnectionState::Joining, None, PlayerIndex::HOST.as_usize()),
        };

        let mut session = Self {
            state,
            major_id: config.major_id,
            minor_id: config.minor_id,
            own_index,
            next_player_id: config.minor_id.unwrap_or_default().wrapping_add(1),
            master_handle: None,
            uptime: 0,
            sim_time: -config.countdown_ms,
            last_heard: 0,
            last_sent: 0,
            registry: ClientRegistry::new(capacity),
            replicator: Replicator::new(config.state_min_interval_ms),
            results: ResultLedger::new(config.rules.laps),
            hits: HitLedger::new(),
            clock: ClockSync::new(
                config.max_correction_per_tick_ms,
                config.correction_tolerance_ms,
            ),
            anchors: AnchorSchedule::new(),
            chat: ChatBuffer::new(config.chat_capacity_chars),
            composer: ChatComposer::default(),
            outgoing_chat: Vec::new(),
            last_chat_flush: None,
            violations: HashMap::new(),
            local_creation: None,
            local_character: None,
            events: Vec::new(),
            network,
            config,
        };

        match session.config.role {
            Role::Master => info!(
                "Hosting session {:08x} as '{}': {}",
                session.major_id.unwrap_or_default(),
                session.config.player_name,
                session.config.rules.describe()
            ),
            Role::Client => {
                let request = JoinMessage::Request {
                    protocol_version: PROTOCOL_VERSION,
                    name: session.config.player_name.clone(),
                    minor_id: session.config.minor_id,
                    craft_model: session.config.craft_model,
                };
                session.send(&request, None, Target::All)?;
                info!("Requested to join as '{}'", session.config.player_name);
            }
        }

        Ok(session)
    }

    /// Runs one frame: drains a bounded batch of inbound messages, advances
    /// the clock by `delta_ms` and performs the periodic broadcasts.
    pub fn tick(&mut self, delta_ms: i64) -> Vec<SessionEvent> {
        let inbound = self.network.poll_inbound(self.config.max_inbound_per_tick);
        for Inbound { handle, packet } in inbound {
            self.dispatch(handle, packet);
        }

        let delta = delta_ms.max(0);
        self.uptime += delta;
        self.sim_time += delta;

        let duties = match self.config.role {
            Role::Master => self.master_duties(),
            Role::Client => self.client_duties(),
        };
        if let Err(e) = duties.and_then(|_| self.flush_states()) {
            error!("Session upkeep failed: {}", e);
        }
        self.flush_chat();

        std::mem::take(&mut self.events)
    }

    fn master_duties(&mut self) -> Result<()> {
        if let Some(cadence) = self.anchors.poll(self.uptime) {
            debug!("{:?} time anchor at {} ms", cadence, self.sim_time);
            let anchor = TimeAnchor {
                sim_time: wire_time(self.sim_time),
            };
            self.send(&anchor, Some(PlayerIndex::HOST), Target::All)?;
        }

        for player in self
            .registry
            .timed_out(self.uptime, self.config.client_timeout_ms)
        {
            warn!("{} timed out", player);
            self.evict(player);
        }
        Ok(())
    }

    fn client_duties(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Joining => {
                if self.uptime > self.config.join_grace_ms {
                    self.fail_connection("no answer from the master".to_string());
                }
            }
            ConnectionState::Joined => {
                self.sim_time += self.clock.correction();

                // The master anchors at least once per fine period
                let silence_limit = self.config.client_timeout_ms + FINE_ANCHOR_PERIOD_MS;
                if self.uptime - self.last_heard > silence_limit {
                    self.lose_connection();
                } else if self.uptime - self.last_sent >= self.config.keepalive_interval_ms {
                    let echo = TimeAnchor {
                        sim_time: wire_time(self.sim_time),
                    };
                    self.send(&echo, self.own_index, Target::All)?;
                }
            }
            ConnectionState::Failed | ConnectionState::Closed => {}
        }
        Ok(())
    }

    fn flush_states(&mut self) -> Result<()> {
        if self.state != ConnectionState::Joined {
            return Ok(());
        }

        for (player, state) in self.replicator.due_main_states(self.uptime) {
            let target = match self.registry.get(player) {
                Some(slot) if self.is_master() => Target::AllExcept(slot.handle),
                _ => Target::All,
            };
            self.send(&state, Some(player), target)?;
        }

        for (origin, state) in self.replicator.due_perm_states(self.uptime) {
            let target = match self.registry.get(origin) {
                Some(slot) if self.is_master() => Target::AllExcept(slot.handle),
                _ => Target::All,
            };
            self.send(&state, Some(origin), target)?;
        }
        Ok(())
    }

    fn flush_chat(&mut self) {
        if self.outgoing_chat.is_empty() || self.state != ConnectionState::Joined {
            return;
        }
        if let Some(flushed_at) = self.last_chat_flush {
            if self.uptime - flushed_at < self.config.chat_flush_interval_ms {
                return;
            }
        }

        self.last_chat_flush = Some(self.uptime);
        for line in std::mem::take(&mut self.outgoing_chat) {
            let target = line.except.map_or(Target::All, Target::AllExcept);
            if let Err(e) = self.send(&ChatText { text: line.text }, Some(line.origin), target) {
                warn!("Dropped a chat line from {}: {}", line.origin, e);
            }
        }
    }

    fn send<P: Payload>(
        &mut self,
        payload: &P,
        origin: Option<PlayerIndex>,
        target: Target,
    ) -> Result<()> {
        let bytes = payload.encode()?;
        self.network.send(Packet::new(P::KIND, origin, bytes), target);
        self.last_sent = self.uptime;
        Ok(())
    }

    /// Forwards a validated client message to every other client.
    fn relay(&mut self, origin: PlayerIndex, from: TransportHandle, packet: &Packet) {
        let forwarded = Packet::new(packet.kind, Some(origin), packet.payload.clone());
        self.network.send(forwarded, Target::AllExcept(from));
    }

    fn dispatch(&mut self, handle: TransportHandle, packet: Packet) {
        let kind = packet.kind;
        let result = match self.config.role {
            Role::Master => self.dispatch_master(handle, &packet),
            Role::Client => self.dispatch_client(handle, &packet),
        };

        match result {
            Ok(()) => {}
            Err(SessionError::StaleEvent(player)) => {
                debug!("Dropped {:?} referencing departed {}", kind, player)
            }
            Err(SessionError::ProtocolViolation(reason)) => self.violation(handle, reason),
            Err(e) => warn!("Failed to handle {:?} from {}: {}", kind, handle, e),
        }
    }

    fn dispatch_master(&mut self, handle: TransportHandle, packet: &Packet) -> Result<()> {
        let origin = match self.registry.find_by_handle(handle) {
            Some(index) => index,
            None if packet.kind == MessageKind::Join => {
                return self.handle_join_request(handle, packet)
            }
            None => {
                return Err(SessionError::ProtocolViolation(format!(
                    "{:?} from a peer that has not joined",
                    packet.kind
                )))
            }
        };

        if let Some(claimed) = packet.origin {
            if claimed != origin {
                return Err(SessionError::ProtocolViolation(format!(
                    "{} claims to speak for {}",
                    origin, claimed
                )));
            }
        }
        self.registry.touch(origin, self.uptime);

        match packet.kind {
            MessageKind::Join => self.handle_join_request(handle, packet),
            MessageKind::Leave => {
                info!("{} left the session", origin);
                self.evict(origin);
                Ok(())
            }
            MessageKind::TimeAnchor => {
                let echo: TimeAnchor = decode(packet)?;
                debug!(
                    "{} runs {} ms off the master clock",
                    origin,
                    i64::from(echo.sim_time) - self.sim_time
                );
                Ok(())
            }
            MessageKind::MainElementCreate => {
                if self.apply_main_creation(origin, decode(packet)?)? {
                    self.relay(origin, handle, packet);
                }
                Ok(())
            }
            MessageKind::AutoElementCreate => {
                if self.apply_auto_creation(origin, decode(packet)?) {
                    self.relay(origin, handle, packet);
                }
                Ok(())
            }
            MessageKind::PermElementState => {
                let state: PermElementState = decode(packet)?;
                self.replicator.offer_perm_state(origin, state.clone());
                self.events.push(SessionEvent::UpdatePermElement { state });
                Ok(())
            }
            MessageKind::MainElementState => {
                let state: MainElementState = decode(packet)?;
                self.replicator.offer_main_state(origin, state.clone());
                self.apply_main_state(origin, state)
            }
            MessageKind::MainElementStats => {
                self.apply_stats(origin, decode(packet)?)?;
                self.relay(origin, handle, packet);
                Ok(())
            }
            MessageKind::Hit => {
                self.apply_hit(origin, decode(packet)?)?;
                self.relay(origin, handle, packet);
                Ok(())
            }
            MessageKind::Chat => {
                let chat: ChatText = decode(packet)?;
                self.apply_chat(origin, &chat.text);
                self.outgoing_chat.push(OutgoingChat {
                    origin,
                    text: chat.text,
                    except: Some(handle),
                });
                Ok(())
            }
        }
    }

    fn dispatch_client(&mut self, handle: TransportHandle, packet: &Packet) -> Result<()> {
        if let Some(master) = self.master_handle {
            if handle != master {
                return Err(SessionError::ProtocolViolation(format!(
                    "{:?} from a peer other than the master",
                    packet.kind
                )));
            }
        }
        self.last_heard = self.uptime;

        if packet.kind == MessageKind::Join {
            return self.handle_join_reply(handle, packet);
        }
        if self.state != ConnectionState::Joined {
            debug!("Ignoring {:?} outside of a joined session", packet.kind);
            return Ok(());
        }

        let origin = packet.origin.ok_or_else(|| {
            SessionError::ProtocolViolation(format!("{:?} without an origin", packet.kind))
        })?;

        match packet.kind {
            MessageKind::Join => Ok(()),
            MessageKind::Leave => {
                if origin.is_host() {
                    info!("The master closed the session");
                    self.lose_connection();
                } else if Some(origin) == self.own_index {
                    info!("The master removed us from the session");
                    self.lose_connection();
                } else {
                    self.evict(origin);
                }
                Ok(())
            }
            MessageKind::TimeAnchor => {
                let anchor: TimeAnchor = decode(packet)?;
                self.clock.on_anchor(i64::from(anchor.sim_time), self.sim_time);
                debug!(
                    "Time anchor {} ms, correcting by {} ms",
                    anchor.sim_time,
                    self.clock.pending_offset()
                );
                Ok(())
            }
            MessageKind::MainElementCreate => {
                self.apply_main_creation(origin, decode(packet)?)?;
                Ok(())
            }
            MessageKind::AutoElementCreate => {
                self.apply_auto_creation(origin, decode(packet)?);
                Ok(())
            }
            MessageKind::PermElementState => {
                let state: PermElementState = decode(packet)?;
                self.events.push(SessionEvent::UpdatePermElement { state });
                Ok(())
            }
            MessageKind::MainElementState => self.apply_main_state(origin, decode(packet)?),
            MessageKind::MainElementStats => {
                self.apply_stats(origin, decode(packet)?)?;
                Ok(())
            }
            MessageKind::Hit => self.apply_hit(origin, decode(packet)?),
            MessageKind::Chat => {
                let chat: ChatText = decode(packet)?;
                self.apply_chat(origin, &chat.text);
                Ok(())
            }
        }
    }

    fn handle_join_request(&mut self, handle: TransportHandle, packet: &Packet) -> Result<()> {
        let (protocol_version, name, minor_id, craft_model) = match decode::<JoinMessage>(packet)? {
            JoinMessage::Request {
                protocol_version,
                name,
                minor_id,
                craft_model,
            } => (protocol_version, name, minor_id, craft_model),
            other => {
                return Err(SessionError::ProtocolViolation(format!(
                    "unexpected join message from a client: {:?}",
                    other
                )))
            }
        };

        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Refusing '{}' on {}: protocol version {} (expected {})",
                name, handle, protocol_version, PROTOCOL_VERSION
            );
            let refusal = JoinMessage::Refused {
                reason: format!(
                    "Protocol version {} is not supported (expected {})",
                    protocol_version, PROTOCOL_VERSION
                ),
            };
            return self.send(&refusal, None, Target::One(handle));
        }

        // A reconnect replaces the stale seat before a new one is handed out
        if let Some(previous) = self.registry.find_by_handle(handle) {
            info!("{} rejoined on {}", previous, handle);
            self.evict(previous);
        }
        let reclaimed = minor_id.filter(|id| *id != 0 && Some(*id) != self.minor_id);
        if let Some(previous) = reclaimed.and_then(|id| self.registry.find_by_player_id(id)) {
            info!("{} reconnected on {}", previous, handle);
            self.evict(previous);
        }

        let player_id = match reclaimed {
            Some(id) => id,
            None => self.allocate_player_id(),
        };
        let player = match self.registry.admit(handle, &name, player_id, self.uptime) {
            Ok(player) => player,
            Err(SessionError::SessionFull(capacity)) => {
                warn!("Refusing '{}' on {}: session full", name, handle);
                let refusal = JoinMessage::Refused {
                    reason: format!("Session full ({} players)", capacity),
                };
                return self.send(&refusal, None, Target::One(handle));
            }
            Err(e) => return Err(e),
        };
        if let Some(slot) = self.registry.get_mut(player) {
            slot.craft_model = craft_model;
        }

        let accepted = JoinMessage::Accepted {
            player,
            player_id,
            major_id: self.major_id.unwrap_or_default(),
            sim_time: self.sim_time,
            laps: self.config.rules.laps,
        };
        self.send(&accepted, None, Target::One(handle))?;
        self.replay_to(handle, player)?;

        let announce = JoinMessage::Announce {
            player,
            player_id,
            name: name.clone(),
        };
        self.send(&announce, None, Target::AllExcept(handle))?;
        self.events.push(SessionEvent::PlayerJoined { player, name });
        Ok(())
    }

    /// Hands out a player id no one in the session holds. Ids are never 0.
    fn allocate_player_id(&mut self) -> u32 {
        loop {
            let id = self.next_player_id;
            self.next_player_id = self.next_player_id.wrapping_add(1);
            if id != 0 && Some(id) != self.minor_id && self.registry.find_by_player_id(id).is_none()
            {
                return id;
            }
        }
    }

    /// Brings a newly admitted client up to date: who is here, what they
    /// spawned and how the race stands.
    fn replay_to(&mut self, handle: TransportHandle, newcomer: PlayerIndex) -> Result<()> {
        let mut packets = Vec::new();

        let host = JoinMessage::Announce {
            player: PlayerIndex::HOST,
            player_id: self.minor_id.unwrap_or_default(),
            name: self.config.player_name.clone(),
        };
        packets.push(Packet::new(MessageKind::Join, None, host.encode()?));

        for slot in self.registry.active().filter(|slot| slot.index != newcomer) {
            let announce = JoinMessage::Announce {
                player: slot.index,
                player_id: slot.player_id,
                name: slot.name.clone(),
            };
            packets.push(Packet::new(MessageKind::Join, None, announce.encode()?));
        }

        for (player, creation) in self.replicator.main_creations() {
            packets.push(Packet::new(
                MessageKind::MainElementCreate,
                Some(player),
                creation.encode()?,
            ));
        }

        for (origin, creation) in self.replicator.auto_creations() {
            packets.push(Packet::new(
                MessageKind::AutoElementCreate,
                Some(origin),
                creation.encode()?,
            ));
        }

        for entry in self.results.iter() {
            let standing = JoinMessage::Standing {
                player: entry.player,
                player_id: entry.player_id,
                name: entry.name.clone(),
                craft_model: entry.craft_model,
                connected: entry.connected,
                finish_time: wire_time(entry.finish_time),
                best_lap: wire_time(entry.best_lap),
                laps: entry.laps,
            };
            packets.push(Packet::new(MessageKind::Join, None, standing.encode()?));
        }

        for entry in self.hits.iter() {
            let tally = JoinMessage::HitTally {
                player: entry.player,
                player_id: entry.player_id,
                name: entry.name.clone(),
                connected: entry.connected,
                hits_landed: entry.hits_landed,
                times_hit: entry.times_hit,
            };
            packets.push(Packet::new(MessageKind::Join, None, tally.encode()?));
        }

        debug!("Replaying {} messages to {}", packets.len(), newcomer);
        for packet in packets {
            self.network.send(packet, Target::One(handle));
        }
        Ok(())
    }

    fn handle_join_reply(&mut self, handle: TransportHandle, packet: &Packet) -> Result<()> {
        match decode::<JoinMessage>(packet)? {
            JoinMessage::Accepted {
                player,
                player_id,
                major_id,
                sim_time,
                laps,
            } => {
                if self.state != ConnectionState::Joining {
                    debug!("Ignoring join acceptance in state {:?}", self.state);
                    return Ok(());
                }

                self.state = ConnectionState::Joined;
                self.own_index = Some(player);
                self.major_id = Some(major_id);
                self.minor_id = Some(player_id);
                self.master_handle = Some(handle);
                self.last_heard = self.uptime;

                // The race has not started; adopt the master's clock outright
                self.sim_time = sim_time;
                self.clock.reset();
                self.config.rules.laps = laps.max(1);
                self.results.set_race_laps(laps);

                info!(
                    "Joined session {:08x} as {} ({} laps)",
                    major_id, player, self.config.rules.laps
                );
                self.events.push(SessionEvent::Joined { player });

                if let Some(creation) = self.local_creation.clone() {
                    self.announce_local_creation(creation)?;
                }
                Ok(())
            }
            JoinMessage::Refused { reason } => {
                if self.state == ConnectionState::Joining {
                    self.fail_connection(reason);
                }
                Ok(())
            }
            JoinMessage::Announce {
                player,
                player_id,
                name,
            } => {
                if Some(player) == self.own_index {
                    return Ok(());
                }
                match self.registry.get_mut(player) {
                    Some(slot) if slot.name.is_empty() => {
                        slot.name = name.clone();
                        slot.player_id = player_id;
                        self.events.push(SessionEvent::PlayerJoined { player, name });
                    }
                    Some(slot) => {
                        slot.name = name;
                        slot.player_id = player_id;
                    }
                    None => {
                        self.registry
                            .occupy(player, handle, &name, player_id, self.uptime)?;
                        self.events.push(SessionEvent::PlayerJoined { player, name });
                    }
                }
                Ok(())
            }
            JoinMessage::Standing {
                player,
                player_id,
                name,
                craft_model,
                connected,
                finish_time,
                best_lap,
                laps,
            } => {
                let mut entry = ResultEntry::new(
                    Identity::new(player, player_id, &name),
                    i64::from(finish_time),
                    i64::from(best_lap),
                    laps,
                );
                entry.craft_model = craft_model;
                entry.connected = connected;
                entry.local = connected && Some(player) == self.own_index;

                let rank = self.results.record(entry);
                if connected {
                    self.events
                        .push(SessionEvent::ResultUpdated { player, rank });
                }
                Ok(())
            }
            JoinMessage::HitTally {
                player,
                player_id,
                name,
                connected,
                hits_landed,
                times_hit,
            } => {
                self.hits.restore(HitEntry {
                    player,
                    player_id,
                    name,
                    connected,
                    hits_landed,
                    times_hit,
                });
                Ok(())
            }
            JoinMessage::Request { .. } => Err(SessionError::ProtocolViolation(
                "join request sent to a client".to_string(),
            )),
        }
    }

    fn apply_main_creation(
        &mut self,
        origin: PlayerIndex,
        creation: MainElementCreation,
    ) -> Result<bool> {
        if Some(origin) == self.own_index {
            return Ok(false);
        }
        if !self.registry.is_admitted(origin) {
            // A client may hear of a vehicle before its owner's announcement
            match self.master_handle {
                Some(master) if !self.is_master() => {
                    self.registry.occupy(origin, master, "", 0, self.uptime)?
                }
                _ => return Err(SessionError::StaleEvent(origin)),
            }
        }

        if !self.replicator.record_main_creation(origin, creation.clone()) {
            debug!("Duplicate main element creation from {}", origin);
            return Ok(false);
        }
        if let Some(slot) = self.registry.get_mut(origin) {
            slot.craft_model = creation.craft_model;
        }

        self.events.push(SessionEvent::SpawnMainElement {
            player: origin,
            creation,
        });
        Ok(true)
    }

    fn apply_auto_creation(&mut self, origin: PlayerIndex, creation: AutoElementCreation) -> bool {
        if !self.replicator.record_auto_creation(origin, creation.clone()) {
            return false;
        }
        self.events
            .push(SessionEvent::SpawnAutoElement { origin, creation });
        true
    }

    fn apply_main_state(&mut self, origin: PlayerIndex, state: MainElementState) -> Result<()> {
        let slot = self
            .registry
            .get(origin)
            .ok_or(SessionError::StaleEvent(origin))?;

        self.events.push(SessionEvent::UpdateMainElement {
            player: origin,
            character: slot.character,
            state,
        });
        Ok(())
    }

    /// Records a stats report in the local ledger. The local player's own
    /// reports take the same path as everyone else's.
    fn apply_stats(&mut self, player: PlayerIndex, stats: MainElementStats) -> Result<usize> {
        let identity = self.identity(player).ok_or(SessionError::StaleEvent(player))?;
        let local = Some(player) == self.own_index;
        let craft_model = if local {
            self.config.craft_model
        } else {
            self.registry
                .get(player)
                .map_or(0, |slot| slot.craft_model)
        };

        let mut entry = ResultEntry::new(
            identity,
            i64::from(stats.finish_time),
            i64::from(stats.best_lap),
            stats.laps,
        );
        entry.craft_model = craft_model;
        entry.local = local;

        let rank = self.results.record(entry);
        debug!("{} now ranks {} ({} laps)", player, rank, stats.laps);
        self.events
            .push(SessionEvent::ResultUpdated { player, rank });
        Ok(rank)
    }

    fn apply_hit(&mut self, origin: PlayerIndex, hit: HitReport) -> Result<()> {
        if hit.victim != origin {
            return Err(SessionError::ProtocolViolation(format!(
                "{} reported a hit on {}",
                origin, hit.victim
            )));
        }
        let attacker = self
            .identity(hit.attacker)
            .ok_or(SessionError::StaleEvent(hit.attacker))?;
        let victim = self
            .identity(hit.victim)
            .ok_or(SessionError::StaleEvent(hit.victim))?;

        self.hits.record_hit(&attacker, &victim);
        self.events.push(SessionEvent::HitRecorded {
            attacker: hit.attacker,
            victim: hit.victim,
        });
        Ok(())
    }

    fn apply_chat(&mut self, origin: PlayerIndex, text: &str) {
        let name = self.player_name(origin).unwrap_or_default().to_string();
        self.chat.push(ChatLine::new(origin, &name, text));
        self.events.push(SessionEvent::ChatReceived {
            from: origin,
            text: text.to_string(),
        });
    }

    /// Frees `player`'s slot. Evicting an empty slot does nothing.
    fn evict(&mut self, player: PlayerIndex) {
        let slot = match self.registry.evict(player) {
            Some(slot) => slot,
            None => return,
        };

        self.replicator.forget_player(player);
        self.results.mark_departed(player);
        self.hits.mark_departed(player);
        if let Some(entity) = slot.character {
            self.events
                .push(SessionEvent::RemoveEntity { player, entity });
        }
        if self.is_master() {
            self.violations.remove(&slot.handle);
            // The departed peer hears it too, in case it was removed
            let leave = Packet::new(MessageKind::Leave, Some(player), Vec::new());
            self.network.send(leave, Target::All);
        }
        self.events.push(SessionEvent::PlayerLeft {
            player,
            name: slot.name,
        });
    }

    fn violation(&mut self, handle: TransportHandle, reason: String) {
        let player = match self.config.role {
            Role::Master => self.registry.find_by_handle(handle),
            Role::Client => None,
        };
        warn!("Protocol violation from {}: {}", handle, reason);

        let count = self.violations.entry(handle).or_insert(0);
        *count += 1;
        let count = *count;

        self.events.push(SessionEvent::ProtocolViolation {
            handle,
            player,
            reason,
        });
        if count % self.config.violation_threshold.max(1) == 0 {
            warn!("{} sent {} malformed messages", handle, count);
            self.events.push(SessionEvent::RepeatedViolations {
                handle,
                player,
                count,
            });
        }
    }

    fn fail_connection(&mut self, reason: String) {
        warn!("Could not join the session: {}", reason);
        self.state = ConnectionState::Failed;
        self.events.push(SessionEvent::ConnectionFailed { reason });
    }

    fn lose_connection(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!("Lost the connection to the master");
        self.state = ConnectionState::Closed;

        let remaining: Vec<PlayerIndex> = self.registry.active().map(|slot| slot.index).collect();
        for player in remaining {
            self.evict(player);
        }
        self.events.push(SessionEvent::ConnectionLost);
    }

    fn announce_local_creation(&mut self, creation: MainElementCreation) -> Result<()> {
        let own = self.require_joined()?;
        if self.replicator.record_main_creation(own, creation.clone()) {
            self.send(&creation, Some(own), Target::All)?;
        }
        Ok(())
    }

    fn require_joined(&self) -> Result<PlayerIndex> {
        match (self.state, self.own_index) {
            (ConnectionState::Joined, Some(own)) => Ok(own),
            _ => Err(SessionError::NotJoined),
        }
    }

    /// Who sits at `player` right now, as the ledgers record them.
    fn identity(&self, player: PlayerIndex) -> Option<Identity> {
        if Some(player) == self.own_index {
            return Some(Identity::new(
                player,
                self.minor_id.unwrap_or_default(),
                &self.config.player_name,
            ));
        }
        self.registry
            .get(player)
            .map(|slot| Identity::new(player, slot.player_id, &slot.name))
    }

    fn is_present(&self, player: PlayerIndex) -> bool {
        Some(player) == self.own_index || self.registry.is_admitted(player)
    }

    fn is_master(&self) -> bool {
        self.config.role == Role::Master
    }

    /// Declares the local vehicle. Its creation goes out once, as soon as
    /// the session is joined.
    pub fn create_main_character(
        &mut self,
        creation: MainElementCreation,
        entity: EntityHandle,
    ) -> Result<()> {
        self.local_character = Some(entity);
        if self.local_creation.is_some() {
            debug!("Main character already created");
            return Ok(());
        }

        self.local_creation = Some(creation.clone());
        if self.state == ConnectionState::Joined {
            self.announce_local_creation(creation)?;
        }
        Ok(())
    }

    pub fn spawn_auto_element(&mut self, creation: AutoElementCreation) -> Result<()> {
        let own = self.require_joined()?;
        if self.replicator.record_auto_creation(own, creation.clone()) {
            self.send(&creation, Some(own), Target::All)?;
        }
        Ok(())
    }

    /// Queues a permanent element's state; sent on the next tick the
    /// element's throttle allows.
    pub fn update_perm_element(&mut self, state: PermElementState) -> Result<()> {
        let own = self.require_joined()?;
        self.replicator.offer_perm_state(own, state);
        Ok(())
    }

    pub fn update_main_state(&mut self, snapshot: Vec<u8>) -> Result<()> {
        let own = self.require_joined()?;
        self.replicator
            .offer_main_state(own, MainElementState { snapshot });
        Ok(())
    }

    /// Broadcasts the local player's race stats and returns their rank.
    pub fn report_stats(&mut self, finish_time: i32, best_lap: i32, laps: i32) -> Result<usize> {
        let own = self.require_joined()?;
        let stats = MainElementStats {
            finish_time,
            best_lap,
            laps,
        };
        let rank = self.apply_stats(own, stats)?;
        self.send(&stats, Some(own), Target::All)?;
        Ok(rank)
    }

    /// Reports that the local player was hit by `attacker`.
    pub fn report_hit(&mut self, attacker: PlayerIndex) -> Result<()> {
        let own = self.require_joined()?;
        let hit = HitReport {
            attacker,
            victim: own,
        };
        self.apply_hit(own, hit)?;
        self.send(&hit, Some(own), Target::All)
    }

    /// Queues a chat line for everyone. Lines longer than a datagram allows
    /// are cut at a character boundary.
    pub fn add_chat_message(&mut self, text: &str) -> Result<()> {
        let own = self.require_joined()?;
        let text = truncate_utf8(text, MAX_CHAT_BYTES);
        self.chat
            .push(ChatLine::new(own, &self.config.player_name, text));
        self.outgoing_chat.push(OutgoingChat {
            origin: own,
            text: text.to_string(),
            except: None,
        });
        Ok(())
    }

    /// Feeds a keystroke to the chat line editor; Enter sends the line.
    pub fn chat_key(&mut self, key: char) -> Result<()> {
        if let Some(line) = self.composer.key(key) {
            self.add_chat_message(&line)?;
        }
        Ok(())
    }

    pub fn current_message(&self) -> &str {
        self.composer.current()
    }

    pub fn chat_lines(&self) -> impl Iterator<Item = &ChatLine> {
        self.chat.lines()
    }

    pub fn leave(&mut self) -> Result<()> {
        if let Ok(own) = self.require_joined() {
            let leave = Packet::new(MessageKind::Leave, Some(own), Vec::new());
            self.network.send(leave, Target::All);
            info!("Left the session");
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Removes a remote participant, announcing the departure to everyone
    /// else. Only the master seats players, so only the master can remove
    /// them.
    pub fn kick(&mut self, player: PlayerIndex) -> Result<()> {
        if !self.is_master() {
            return Err(SessionError::InvalidRole(
                "only the master can remove players".to_string(),
            ));
        }
        if !self.registry.is_admitted(player) {
            return Err(SessionError::UnknownSlot(player));
        }
        info!("Removing {} from the session", player);
        self.evict(player);
        Ok(())
    }

    pub fn bind_character(&mut self, player: PlayerIndex, entity: EntityHandle) -> Result<()> {
        if Some(player) == self.own_index {
            self.local_character = Some(entity);
            return Ok(());
        }
        self.registry.bind_character(player, entity)
    }

    pub fn get_rank(&self, player: PlayerIndex) -> Option<usize> {
        self.results.rank_of(player)
    }

    pub fn get_result(&self, rank: usize) -> Option<&ResultEntry> {
        self.results.query_by_rank(rank)
    }

    pub fn get_hit_result(&self, player: PlayerIndex) -> Option<&HitEntry> {
        self.hits.query_hits(player)
    }

    /// Every hit tally, departed participants included.
    pub fn hit_results(&self) -> impl Iterator<Item = &HitEntry> {
        self.hits.iter()
    }

    pub fn results_available(&self) -> usize {
        self.results.len()
    }

    /// Participants including the local player.
    pub fn get_nb_players(&self) -> usize {
        self.registry.len() + usize::from(self.own_index.is_some())
    }

    pub fn simulation_time(&self) -> i64 {
        self.sim_time
    }

    pub fn set_simulation_time(&mut self, sim_time: i64) {
        self.sim_time = sim_time;
        self.clock.reset();
    }

    pub fn active_players(&self) -> impl Iterator<Item = &ClientSlot> {
        self.registry.active()
    }

    pub fn player_name(&self, player: PlayerIndex) -> Option<&str> {
        if Some(player) == self.own_index {
            return Some(&self.config.player_name);
        }
        self.registry.get(player).map(|slot| slot.name.as_str())
    }

    pub fn is_connected(&self, player: PlayerIndex) -> bool {
        self.is_present(player)
    }

    pub fn local_character(&self) -> Option<EntityHandle> {
        self.local_character
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn own_index(&self) -> Option<PlayerIndex> {
        self.own_index
    }

    pub fn major_id(&self) -> Option<u32> {
        self.major_id
    }

    pub fn minor_id(&self) -> Option<u32> {
        self.minor_id
    }

    pub fn rules(&self) -> &RaceRules {
        &self.config.rules
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn uptime(&self) -> i64 {
        self.uptime
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }
}

fn decode<P: Payload>(packet: &Packet) -> Result<P> {
    P::decode(&packet.payload).map_err(|e| {
        SessionError::ProtocolViolation(format!("malformed {:?} payload: {}", P::KIND, e))
    })
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn wire_time(ms: i64) -> i32 {
    ms.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryNetwork};
    use shared::FactoryId;

    fn master(hub: &MemoryHub) -> Session<MemoryNetwork> {
        let mut config = SessionConfig::master(0xBEEF, 1);
        config.player_name = "Host".to_string();
        Session::new(config, hub.master()).unwrap()
    }

    fn client(hub: &MemoryHub, name: &str) -> Session<MemoryNetwork> {
        let mut config = SessionConfig::client();
        config.player_name = name.to_string();
        Session::new(config, hub.connect()).unwrap()
    }

    fn creation() -> MainElementCreation {
        MainElementCreation {
            factory: FactoryId { dll: 1, class: 1 },
            room: 0,
            craft_model: 2,
            snapshot: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_client_with_major_id_is_invalid() {
        let hub = MemoryHub::new();
        let mut config = SessionConfig::client();
        config.major_id = Some(7);

        let result = Session::new(config, hub.connect());
        assert!(matches!(result, Err(SessionError::InvalidRole(_))));
    }

    #[test]
    fn test_master_without_major_id_is_invalid() {
        let hub = MemoryHub::new();
        let mut config = SessionConfig::master(1, 1);
        config.major_id = None;

        let result = Session::new(config, hub.master());
        assert!(matches!(result, Err(SessionError::InvalidRole(_))));
    }

    #[test]
    fn test_clock_starts_before_the_race() {
        let hub = MemoryHub::new();
        let session = master(&hub);
        assert_eq!(session.simulation_time(), -13_000);
        assert_eq!(session.get_nb_players(), 1);
        assert_eq!(session.own_index(), Some(PlayerIndex::HOST));
    }

    #[test]
    fn test_client_queues_join_request() {
        let hub = MemoryHub::new();
        let master_net = hub.master();
        let session = client(&hub, "Ace");

        assert_eq!(session.state(), ConnectionState::Joining);
        assert_eq!(master_net.pending(), 1);
    }

    #[test]
    fn test_join_handshake() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");

        let events = host.tick(16);
        assert!(events.contains(&SessionEvent::PlayerJoined {
            player: PlayerIndex(0),
            name: "Ace".to_string()
        }));

        let events = ace.tick(16);
        assert!(events.contains(&SessionEvent::Joined {
            player: PlayerIndex(0)
        }));
        assert!(events.contains(&SessionEvent::PlayerJoined {
            player: PlayerIndex::HOST,
            name: "Host".to_string()
        }));
        assert_eq!(ace.state(), ConnectionState::Joined);
        assert_eq!(ace.major_id(), Some(0xBEEF));
        assert_eq!(ace.get_nb_players(), 2);
        assert_eq!(host.get_nb_players(), 2);
        assert_eq!(ace.player_name(PlayerIndex::HOST), Some("Host"));
    }

    #[test]
    fn test_client_adopts_master_clock_on_join() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        for _ in 0..10 {
            host.tick(100);
        }
        let mut ace = client(&hub, "Ace");

        host.tick(0);
        ace.tick(0);
        assert_eq!(ace.simulation_time(), host.simulation_time());
    }

    #[test]
    fn test_session_full_is_refused() {
        let hub = MemoryHub::new();
        let mut config = SessionConfig::master(1, 1);
        config.max_clients = 1;
        let mut host = Session::new(config, hub.master()).unwrap();
        let mut ace = client(&hub, "Ace");
        let mut bee = client(&hub, "Bee");

        host.tick(16);
        ace.tick(16);
        let events = bee.tick(16);

        assert_eq!(ace.state(), ConnectionState::Joined);
        assert_eq!(bee.state(), ConnectionState::Failed);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ConnectionFailed { reason } if reason.contains("full"))));
    }

    #[test]
    fn test_protocol_version_mismatch_is_refused() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut raw = hub.connect();
        let request = JoinMessage::Request {
            protocol_version: PROTOCOL_VERSION + 1,
            name: "Old".to_string(),
            minor_id: None,
            craft_model: 0,
        };
        raw.send(
            Packet::new(MessageKind::Join, None, request.encode().unwrap()),
            Target::All,
        );

        host.tick(16);
        let reply = raw.poll_inbound(10);
        assert_eq!(reply.len(), 1);
        let message = JoinMessage::decode(&reply[0].packet.payload).unwrap();
        assert!(matches!(message, JoinMessage::Refused { .. }));
        assert_eq!(host.get_nb_players(), 1);
    }

    #[test]
    fn test_join_grace_expires() {
        let hub = MemoryHub::new();
        let mut ace = client(&hub, "Ace");

        let mut failed = false;
        for _ in 0..30 {
            failed |= ace
                .tick(1000)
                .iter()
                .any(|e| matches!(e, SessionEvent::ConnectionFailed { .. }));
        }
        assert!(failed);
        assert_eq!(ace.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_operations_require_join() {
        let hub = MemoryHub::new();
        let mut ace = client(&hub, "Ace");

        assert!(matches!(ace.report_stats(1, 1, 1), Err(SessionError::NotJoined)));
        assert!(matches!(ace.add_chat_message("hi"), Err(SessionError::NotJoined)));
        assert!(matches!(ace.update_main_state(vec![1]), Err(SessionError::NotJoined)));
        // The vehicle may be declared early; it is announced after joining
        assert!(ace.create_main_character(creation(), EntityHandle(1)).is_ok());
    }

    #[test]
    fn test_early_character_is_announced_after_join() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        ace.create_main_character(creation(), EntityHandle(5)).unwrap();

        host.tick(16);
        ace.tick(16);
        let events = host.tick(16);

        assert!(events.contains(&SessionEvent::SpawnMainElement {
            player: PlayerIndex(0),
            creation: creation()
        }));
    }

    #[test]
    fn test_unjoined_peer_is_a_violation() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut raw = hub.connect();
        raw.send(Packet::new(MessageKind::Chat, None, vec![0]), Target::All);

        let events = host.tick(16);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ProtocolViolation { player: None, .. })));
    }

    #[test]
    fn test_stale_hit_is_dropped() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let result = host.report_hit(PlayerIndex(4));

        assert!(matches!(result, Err(SessionError::StaleEvent(PlayerIndex(4)))));
        assert!(host.get_hit_result(PlayerIndex(4)).is_none());
    }

    #[test]
    fn test_master_reports_own_stats() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);

        assert_eq!(host.report_stats(1000, 300, 5).unwrap(), 0);
        let entry = host.get_result(0).unwrap();
        assert!(entry.local);
        assert_eq!(entry.player, PlayerIndex::HOST);
        assert_eq!(host.results_available(), 1);
    }

    #[test]
    fn test_master_anchors_clock() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        host.tick(0);
        ace.tick(0);

        // Push the client 500 ms ahead, then let an anchor pull it back
        ace.set_simulation_time(ace.simulation_time() + 500);
        for _ in 0..(8_000 / 100) {
            host.tick(100);
            ace.tick(100);
        }
        assert!(ace.clock().anchors_received() >= 1);
        for _ in 0..40 {
            host.tick(100);
            ace.tick(100);
        }
        let drift = (ace.simulation_time() - host.simulation_time()).abs();
        assert!(drift <= 5 + 100, "drift {}", drift);
        assert!(ace.clock().is_synchronized());
    }

    #[test]
    fn test_chat_composer_sends_line() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        host.tick(16);
        ace.tick(16);

        for key in "gg\r".chars() {
            host.chat_key(key).unwrap();
        }
        assert_eq!(host.current_message(), "");
        host.tick(16);
        let events = ace.tick(16);

        assert!(events.contains(&SessionEvent::ChatReceived {
            from: PlayerIndex::HOST,
            text: "gg".to_string()
        }));
        let line = ace.chat_lines().last().unwrap();
        assert_eq!(line.name, "Host");
    }

    #[test]
    fn test_kicked_client_is_told() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        host.tick(16);
        ace.tick(16);

        host.kick(PlayerIndex(0)).unwrap();
        let events = ace.tick(16);
        assert!(events.contains(&SessionEvent::ConnectionLost));
        assert_eq!(ace.state(), ConnectionState::Closed);

        // A removed client falls silent instead of piling up violations
        let mut violations = 0;
        for _ in 0..30 {
            violations += host
                .tick(1000)
                .iter()
                .filter(|e| matches!(e, SessionEvent::ProtocolViolation { .. }))
                .count();
            ace.tick(1000);
        }
        assert_eq!(violations, 0);
    }

    #[test]
    fn test_kick_is_master_only() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        host.tick(16);
        ace.tick(16);

        assert!(matches!(ace.kick(PlayerIndex::HOST), Err(SessionError::InvalidRole(_))));
        assert!(matches!(
            host.kick(PlayerIndex(3)),
            Err(SessionError::UnknownSlot(PlayerIndex(3)))
        ));
    }

    #[test]
    fn test_oversized_chat_line_is_cut() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        host.tick(16);
        ace.tick(16);

        ace.add_chat_message(&"é".repeat(3000)).unwrap();
        ace.add_chat_message("hello").unwrap();
        ace.tick(16);
        let events = host.tick(16);

        let received: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ChatReceived { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 2);
        assert!(received[0].len() <= MAX_CHAT_BYTES);
        assert!(received[0].chars().all(|c| c == 'é'));
        assert_eq!(received[1], "hello");
    }

    #[test]
    fn test_perm_state_is_not_echoed_to_its_sender() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        let mut bee = client(&hub, "Bee");
        host.tick(16);
        ace.tick(16);
        bee.tick(16);

        let door = PermElementState {
            perm_id: 3,
            room: 1,
            snapshot: vec![1],
        };
        ace.update_perm_element(door.clone()).unwrap();
        ace.tick(16);
        host.tick(16);

        let update = SessionEvent::UpdatePermElement { state: door };
        assert!(!ace.tick(16).contains(&update));
        assert!(bee.tick(16).contains(&update));
    }

    #[test]
    fn test_player_ids_are_assigned_by_the_master() {
        let hub = MemoryHub::new();
        let mut host = master(&hub);
        let mut ace = client(&hub, "Ace");
        host.tick(16);
        ace.tick(16);

        let id = ace.minor_id().unwrap();
        assert_ne!(id, 0);
        assert_ne!(Some(id), host.minor_id());
        let slot = host.active_players().next().unwrap();
        assert_eq!(slot.player_id, id);
    }
}
