//! Tick loop driving a client session from the console

use crate::input::{parse_command, Command};
use crate::network::ClientTransport;
use log::{debug, error, info, warn};
use session::{EntityHandle, Session, SessionConfig, SessionEvent};
use shared::{FactoryId, MainElementCreation};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Factory of the player-controlled craft.
const CRAFT_FACTORY: FactoryId = FactoryId { dll: 1, class: 1 };
const LOCAL_CRAFT: EntityHandle = EntityHandle(1);

pub struct ClientHost {
    session: Session<ClientTransport>,
    tick_duration: Duration,
    running: bool,
}

impl ClientHost {
    pub fn new(
        config: SessionConfig,
        transport: ClientTransport,
        tick_duration: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let session = Session::new(config, transport)?;
        Ok(ClientHost {
            session,
            tick_duration,
            running: true,
        })
    }

    pub fn session(&self) -> &Session<ClientTransport> {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Runs one session tick and reacts to what it reports.
    pub fn step(&mut self, delta_ms: i64) {
        for event in self.session.tick(delta_ms) {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Joined { player } => {
                info!("Joined as {}, race: {}", player, self.session.rules().describe())
            }
            SessionEvent::PlayerJoined { player, name } => {
                info!("{} '{}' joined", player, name)
            }
            SessionEvent::PlayerLeft { player, name } => info!("{} '{}' left", player, name),
            SessionEvent::SpawnMainElement { player, creation } => {
                info!("{} drives craft model {}", player, creation.craft_model)
            }
            SessionEvent::ChatReceived { from, text } => {
                let name = self.session.player_name(from).unwrap_or("?");
                info!("<{}> {}", name, text);
            }
            SessionEvent::ResultUpdated { player, rank } => {
                info!("{} is now ranked {}", player, rank + 1)
            }
            SessionEvent::ConnectionFailed { reason } => {
                error!("Could not join: {}", reason);
                self.running = false;
            }
            SessionEvent::ConnectionLost => {
                warn!("The session is over");
                self.running = false;
            }
            other => debug!("{:?}", other),
        }
    }

    /// Carries out one console command.
    pub fn execute(&mut self, command: Command) {
        let result = match command {
            Command::Chat(text) if text.is_empty() => Ok(()),
            Command::Chat(text) => self.session.add_chat_message(&text),
            Command::Spawn { craft_model } => {
                let creation = MainElementCreation {
                    factory: CRAFT_FACTORY,
                    room: 0,
                    craft_model,
                    snapshot: Vec::new(),
                };
                self.session.create_main_character(creation, LOCAL_CRAFT)
            }
            Command::State(snapshot) => self.session.update_main_state(snapshot),
            Command::Stats {
                finish_time,
                best_lap,
                laps,
            } => self
                .session
                .report_stats(finish_time, best_lap, laps)
                .map(|rank| info!("You are ranked {}", rank + 1)),
            Command::Hit(attacker) => self.session.report_hit(attacker),
            Command::Players => {
                self.log_players();
                Ok(())
            }
            Command::Results => {
                self.log_results();
                Ok(())
            }
            Command::Quit => {
                self.running = false;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("{}", e);
        }
    }

    pub fn log_players(&self) {
        info!("{} players in the session", self.session.get_nb_players());
        for slot in self.session.active_players() {
            info!("  {} '{}'", slot.index, slot.name);
        }
    }

    pub fn log_results(&self) {
        for rank in 0..self.session.results_available() {
            if let Some(entry) = self.session.get_result(rank) {
                let status = if entry.local {
                    " (you)"
                } else if !entry.connected {
                    " (left)"
                } else {
                    ""
                };
                info!(
                    "{}. {}{}: {} laps{}, finish {} ms, best lap {} ms",
                    rank + 1,
                    entry.name,
                    status,
                    entry.laps,
                    if self.session.rules().is_finished(entry.laps) {
                        " (finished)"
                    } else {
                        ""
                    },
                    entry.finish_time,
                    entry.best_lap,
                );
            }
        }
    }

    /// Main loop: ticks at the configured rate, reads console lines, stops
    /// on `/quit`, Ctrl-C or when the session ends.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = Instant::now();
        let mut elapsed_ms: i64 = 0;

        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        while self.running {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now_ms = started.elapsed().as_millis() as i64;
                    let delta = now_ms - elapsed_ms;
                    elapsed_ms = now_ms;
                    self.step(delta);
                },
                Some(line) = line_rx.recv() => {
                    match parse_command(&line) {
                        Ok(command) => self.execute(command),
                        Err(e) => warn!("{}", e),
                    }
                },
                _ = &mut shutdown => {
                    info!("Client shutting down");
                    break;
                }
            }
        }

        self.session.leave()?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.log_results();
        Ok(())
    }
}
