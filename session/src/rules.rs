//! Race rules and the game name a master advertises them under.
//!
//! The advertised name packs the rules into a single line, for example
//! `"Steeplechase 3 laps; options W_C, B2CE"`. Clients recover the lap count
//! and options by reading the fields from the end, so track names may contain
//! spaces.

use bitflags::bitflags;
use shared::DEFAULT_LAPS;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GameOptions: u8 {
        const WEAPONS = 0b0000_0001;
        const MINES = 0b0000_0010;
        const CANS = 0b0000_0100;
        const BASIC_CRAFT = 0b0001_0000;
        const BI_CRAFT = 0b0010_0000;
        const CX_CRAFT = 0b0100_0000;
        const EON_CRAFT = 0b1000_0000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceRules {
    pub track: String,
    pub laps: u8,
    pub options: GameOptions,
}

impl Default for RaceRules {
    fn default() -> Self {
        Self {
            track: "ClassicH".to_string(),
            laps: DEFAULT_LAPS,
            options: GameOptions::all(),
        }
    }
}

impl RaceRules {
    pub fn new(track: &str, laps: u8, options: GameOptions) -> Self {
        Self {
            track: track.to_string(),
            laps: laps.max(1),
            options,
        }
    }

    pub fn is_finished(&self, laps_completed: i32) -> bool {
        laps_completed >= i32::from(self.laps)
    }

    pub fn describe(&self) -> String {
        let flag = |option: GameOptions, c: char| {
            if self.options.contains(option) {
                c
            } else {
                '_'
            }
        };

        format!(
            "{} {} {}; options {}{}{}, {}{}{}{}",
            self.track,
            self.laps,
            if self.laps > 1 { "laps" } else { "lap" },
            flag(GameOptions::WEAPONS, 'W'),
            flag(GameOptions::MINES, 'M'),
            flag(GameOptions::CANS, 'C'),
            flag(GameOptions::BASIC_CRAFT, 'B'),
            flag(GameOptions::BI_CRAFT, '2'),
            flag(GameOptions::CX_CRAFT, 'C'),
            flag(GameOptions::EON_CRAFT, 'E'),
        )
    }

    /// Recovers the rules from an advertised game name. Missing fields leave
    /// the track name whole and the lap count at its default.
    pub fn parse(descriptor: &str) -> Self {
        let fields: Vec<&str> = descriptor.rsplitn(6, ' ').collect();
        let mut options = GameOptions::empty();

        if fields.len() >= 2 {
            let crafts = fields[0].as_bytes();
            let marks = [
                (GameOptions::BASIC_CRAFT, b'B'),
                (GameOptions::BI_CRAFT, b'2'),
                (GameOptions::CX_CRAFT, b'C'),
                (GameOptions::EON_CRAFT, b'E'),
            ];
            for (i, (option, mark)) in marks.iter().enumerate() {
                if crafts.get(i) == Some(mark) {
                    options |= *option;
                }
            }
        }

        if fields.len() >= 3 {
            let weapons = fields[1].as_bytes();
            let marks = [
                (GameOptions::WEAPONS, b'W'),
                (GameOptions::MINES, b'M'),
                (GameOptions::CANS, b'C'),
            ];
            for (i, (option, mark)) in marks.iter().enumerate() {
                if weapons.get(i) == Some(mark) {
                    options |= *option;
                }
            }
        }

        if fields.len() == 6 {
            let laps = fields[4]
                .parse::<i32>()
                .ok()
                .filter(|laps| *laps >= 1)
                .map(|laps| laps.min(i32::from(u8::MAX)) as u8)
                .unwrap_or(DEFAULT_LAPS);
            Self {
                track: fields[5].to_string(),
                laps,
                options,
            }
        } else {
            Self {
                track: descriptor.to_string(),
                laps: DEFAULT_LAPS,
                options,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_all_options() {
        let rules = RaceRules::new("ClassicH", 5, GameOptions::all());
        assert_eq!(rules.describe(), "ClassicH 5 laps; options WMC, B2CE");
    }

    #[test]
    fn test_describe_single_lap_and_missing_options() {
        let options = GameOptions::WEAPONS | GameOptions::CANS | GameOptions::EON_CRAFT;
        let rules = RaceRules::new("Steeple", 1, options);
        assert_eq!(rules.describe(), "Steeple 1 lap; options W_C, ___E");
    }

    #[test]
    fn test_parse_recovers_described_rules() {
        let rules = RaceRules::new(
            "The Big Loop",
            3,
            GameOptions::MINES | GameOptions::BI_CRAFT,
        );
        assert_eq!(RaceRules::parse(&rules.describe()), rules);
    }

    #[test]
    fn test_parse_invalid_lap_count_defaults() {
        let rules = RaceRules::parse("Track 0 laps; options WMC, B2CE");
        assert_eq!(rules.laps, DEFAULT_LAPS);
        assert_eq!(rules.track, "Track");
        assert_eq!(rules.options, GameOptions::all());
    }

    #[test]
    fn test_parse_bare_track_name() {
        let rules = RaceRules::parse("Meadow");
        assert_eq!(rules.track, "Meadow");
        assert_eq!(rules.laps, DEFAULT_LAPS);
        assert!(rules.options.is_empty());
    }

    #[test]
    fn test_is_finished() {
        let rules = RaceRules::new("Meadow", 3, GameOptions::empty());
        assert!(!rules.is_finished(2));
        assert!(rules.is_finished(3));
        assert!(rules.is_finished(4));
    }

    #[test]
    fn test_zero_laps_clamped() {
        assert_eq!(RaceRules::new("Meadow", 0, GameOptions::empty()).laps, 1);
    }
}
