//! Console commands typed by the player
//!
//! Lines starting with `/` are commands; anything else is chat.

use shared::PlayerIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    /// Declare the local vehicle
    Spawn { craft_model: u8 },
    /// Publish a new state snapshot of the local vehicle
    State(Vec<u8>),
    Stats {
        finish_time: i32,
        best_lap: i32,
        laps: i32,
    },
    /// The local player was hit by this player
    Hit(PlayerIndex),
    Players,
    Results,
    Quit,
}

pub const HELP: &str = "/spawn [craft] | /state <text> | /stats <finish> <best> <laps> | /hit <player> | /players | /results | /quit";

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let rest = match line.strip_prefix('/') {
        Some(rest) => rest,
        None => return Ok(Command::Chat(line.to_string())),
    };

    let mut words = rest.split_whitespace();
    let command = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    match (command, args.as_slice()) {
        ("spawn", []) => Ok(Command::Spawn { craft_model: 0 }),
        ("spawn", [craft]) => Ok(Command::Spawn {
            craft_model: number(craft)?,
        }),
        ("state", [_, ..]) => Ok(Command::State(args.join(" ").into_bytes())),
        ("stats", [finish, best, laps]) => Ok(Command::Stats {
            finish_time: number(finish)?,
            best_lap: number(best)?,
            laps: number(laps)?,
        }),
        ("hit", [player]) => Ok(Command::Hit(PlayerIndex(number(player)?))),
        ("players", []) => Ok(Command::Players),
        ("results", []) => Ok(Command::Results),
        ("quit", []) => Ok(Command::Quit),
        _ => Err(format!("Unknown command '/{}'. Try: {}", rest, HELP)),
    }
}

fn number<T: std::str::FromStr>(word: &str) -> Result<T, String> {
    word.parse()
        .map_err(|_| format!("'{}' is not a valid number", word))
}
