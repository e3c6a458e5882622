//! Tick loop driving the master session

use crate::network::UdpTransport;
use log::{debug, error, info, warn};
use session::{Session, SessionConfig, SessionEvent};
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};

pub struct MasterHost {
    session: Session<UdpTransport>,
    tick_duration: Duration,
    ticks: u64,
}

impl MasterHost {
    pub fn new(
        config: SessionConfig,
        transport: UdpTransport,
        tick_duration: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let session = Session::new(config, transport)?;
        Ok(MasterHost {
            session,
            tick_duration,
            ticks: 0,
        })
    }

    pub fn session(&self) -> &Session<UdpTransport> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<UdpTransport> {
        &mut self.session
    }

    /// Runs one session tick and reacts to what it reports.
    pub fn step(&mut self, delta_ms: i64) {
        for event in self.session.tick(delta_ms) {
            self.handle_event(event);
        }
        self.ticks += 1;

        if self.ticks % 600 == 0 {
            debug!(
                "Tick {}: {} players, race clock {} ms, {} peers",
                self.ticks,
                self.session.get_nb_players(),
                self.session.simulation_time(),
                self.session.network().peer_count()
            );
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PlayerJoined { player, name } => {
                info!("{} '{}' joined", player, name)
            }
            SessionEvent::PlayerLeft { player, name } => info!("{} '{}' left", player, name),
            SessionEvent::ResultUpdated { player, rank } => {
                info!("{} is now ranked {}", player, rank + 1)
            }
            SessionEvent::HitRecorded { attacker, victim } => {
                debug!("{} hit {}", attacker, victim)
            }
            SessionEvent::ChatReceived { from, text } => {
                let name = self.session.player_name(from).unwrap_or("?");
                info!("<{}> {}", name, text);
            }
            SessionEvent::RepeatedViolations {
                handle,
                player: Some(player),
                count,
            } => {
                warn!(
                    "Removing {} after {} malformed messages on {}",
                    player, count, handle
                );
                if let Err(e) = self.session.kick(player) {
                    error!("Failed to remove {}: {}", player, e);
                }
            }
            other => debug!("{:?}", other),
        }
    }

    /// Logs the final standings.
    pub fn log_results(&self) {
        if self.session.results_available() == 0 {
            info!("No results recorded");
            return;
        }
        for rank in 0..self.session.results_available() {
            if let Some(entry) = self.session.get_result(rank) {
                let hits = self
                    .session
                    .hit_results()
                    .find(|h| h.player_id == entry.player_id && h.player == entry.player);
                info!(
                    "{}. {} '{}'{}: {} {} laps, finish {} ms, best lap {} ms, hits {}/{}",
                    rank + 1,
                    entry.player,
                    entry.name,
                    if entry.connected { "" } else { " (left)" },
                    if self.session.rules().is_finished(entry.laps) {
                        "finished"
                    } else {
                        "racing"
                    },
                    entry.laps,
                    entry.finish_time,
                    entry.best_lap,
                    hits.map_or(0, |h| h.hits_landed),
                    hits.map_or(0, |h| h.times_hit),
                );
            }
        }
    }

    /// Main loop: ticks at the configured rate until Ctrl-C.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = Instant::now();
        let mut elapsed_ms: i64 = 0;

        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        info!("Master started");

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now_ms = started.elapsed().as_millis() as i64;
                    let delta = now_ms - elapsed_ms;
                    elapsed_ms = now_ms;
                    self.step(delta);
                },
                _ = &mut shutdown => {
                    info!("Master shutting down");
                    break;
                }
            }
        }

        self.session.leave()?;
        // Let the sender task flush the goodbye
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.log_results();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_master_host_steps() {
        let transport = assert_ok!(UdpTransport::bind("127.0.0.1:0").await);
        let mut host = assert_ok!(MasterHost::new(
            SessionConfig::master(1, 2),
            transport,
            Duration::from_millis(16),
        ));

        host.step(16);
        assert_eq!(host.session().simulation_time(), -13_000 + 16);
        assert_eq!(host.session().get_nb_players(), 1);
    }

    #[tokio::test]
    async fn test_master_host_records_own_stats() {
        let transport = assert_ok!(UdpTransport::bind("127.0.0.1:0").await);
        let mut host = assert_ok!(MasterHost::new(
            SessionConfig::master(1, 2),
            transport,
            Duration::from_millis(16),
        ));

        assert_ok!(host.session_mut().report_stats(1000, 320, 5));
        host.step(16);
        assert_eq!(host.session().results_available(), 1);
        host.log_results();
    }
}
