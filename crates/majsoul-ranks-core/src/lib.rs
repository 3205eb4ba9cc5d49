//! Game-record model and the pure normalization rules shared by the fetcher,
//! the store and the report commands.
//!
//! Raw API payloads are decoded strictly into [`RawGame`] and then validated by
//! [`RawGame::normalize`]; nothing downstream ever sees an untyped record.

use std::fmt::{Display, Formatter};

use serde::Deserialize;
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

/// Number of player slots in every stored game.
pub const PLAYER_SLOTS: usize = 4;

/// Values at or above this are treated as milliseconds, below as seconds.
pub const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Column order of the `games` table. Inserts and migrations use this order.
pub const GAME_COLUMNS: [&str; 19] = [
    "id",
    "mode",
    "startTime",
    "player1_level",
    "player1_score",
    "player1_gradingScore",
    "player1_rank",
    "player2_level",
    "player2_score",
    "player2_gradingScore",
    "player2_rank",
    "player3_level",
    "player3_score",
    "player3_gradingScore",
    "player3_rank",
    "player4_level",
    "player4_score",
    "player4_gradingScore",
    "player4_rank",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RanksError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("time error: {0}")]
    Time(String),
}

/// Why a raw record was not turned into a [`GameRecord`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RejectReason {
    #[error("no id")]
    MissingId,
    #[error("no modeId and no override")]
    MissingMode,
    #[error("unknown modeId {0}")]
    UnknownMode(i64),
    #[error("no startTime or endTime")]
    MissingStartTime,
    #[error("players missing or not a list")]
    MissingPlayers,
    #[error("players count != 4 (got {0})")]
    PlayerCount(usize),
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Mode {
    GoldSouth,
    JadeSouth,
    ThroneSouth,
}

impl Mode {
    pub const ALL: [Self; 3] = [Self::GoldSouth, Self::JadeSouth, Self::ThroneSouth];

    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::GoldSouth => 9,
            Self::JadeSouth => 12,
            Self::ThroneSouth => 16,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            9 => Some(Self::GoldSouth),
            12 => Some(Self::JadeSouth),
            16 => Some(Self::ThroneSouth),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::GoldSouth => "Gold South",
            Self::JadeSouth => "Jade South",
            Self::ThroneSouth => "Throne South",
        }
    }

    /// Parses a mode code as typed on the command line.
    ///
    /// # Errors
    /// Returns [`RanksError::Validation`] for anything other than 9, 12 or 16.
    pub fn parse(raw: &str) -> Result<Self, RanksError> {
        let code: i64 = raw
            .trim()
            .parse()
            .map_err(|_| RanksError::Validation(format!("mode must be an integer, got '{raw}'")))?;
        Self::from_code(code).ok_or_else(|| {
            RanksError::Validation(format!("mode must be one of 9, 12, 16, got {code}"))
        })
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// How player levels are grouped in the level reports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum LevelBin {
    #[default]
    Exact,
    Tens,
}

impl LevelBin {
    #[must_use]
    pub fn bucket(self, level: i64) -> i64 {
        match self {
            Self::Exact => level,
            Self::Tens => level.div_euclid(10) * 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PlayerResult {
    pub level: i64,
    pub score: i64,
    pub grading_score: i64,
    pub rank: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GameRecord {
    pub id: String,
    pub mode: Mode,
    /// Seconds since the epoch.
    pub start_time: i64,
    pub players: [PlayerResult; PLAYER_SLOTS],
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RawPlayer {
    pub level: Option<i64>,
    pub score: Option<i64>,
    #[serde(rename = "gradingScore")]
    pub grading_score: Option<i64>,
}

/// One game exactly as the API may send it; every field is optional so the
/// decision to reject lives in [`RawGame::normalize`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RawGame {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub uuid: Option<String>,
    #[serde(rename = "modeId")]
    pub mode_id: Option<i64>,
    #[serde(rename = "startTime")]
    pub start_time: Option<i64>,
    #[serde(rename = "endTime")]
    pub end_time: Option<i64>,
    pub players: Option<Vec<RawPlayer>>,
}

impl RawGame {
    /// Decodes one element of an API page.
    ///
    /// # Errors
    /// Returns [`RejectReason::Malformed`] when a field has the wrong type.
    pub fn decode(value: &Value) -> Result<Self, RejectReason> {
        Self::deserialize(value).map_err(|err| RejectReason::Malformed(err.to_string()))
    }

    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        [self.id.as_deref(), self.uuid.as_deref()]
            .into_iter()
            .flatten()
            .find(|candidate| !candidate.is_empty())
    }

    /// Validates the payload and computes placement ranks.
    ///
    /// `mode_override` is used only when the payload carries no `modeId`.
    ///
    /// # Errors
    /// Returns the first [`RejectReason`] that applies.
    pub fn normalize(&self, mode_override: Option<Mode>) -> Result<GameRecord, RejectReason> {
        let id = self.identifier().ok_or(RejectReason::MissingId)?.to_string();

        let mode = match self.mode_id {
            Some(code) => Mode::from_code(code).ok_or(RejectReason::UnknownMode(code))?,
            None => mode_override.ok_or(RejectReason::MissingMode)?,
        };

        let start_time = self
            .start_time
            .or(self.end_time)
            .ok_or(RejectReason::MissingStartTime)?;

        let players = self.players.as_ref().ok_or(RejectReason::MissingPlayers)?;
        if players.len() != PLAYER_SLOTS {
            return Err(RejectReason::PlayerCount(players.len()));
        }

        let mut scores = [0_i64; PLAYER_SLOTS];
        for (slot, player) in players.iter().enumerate() {
            scores[slot] = player.score.unwrap_or(0);
        }
        let ranks = compute_ranks(scores);

        let mut results = [PlayerResult {
            level: 0,
            score: 0,
            grading_score: 0,
            rank: 0,
        }; PLAYER_SLOTS];
        for (slot, player) in players.iter().enumerate() {
            results[slot] = PlayerResult {
                level: player.level.unwrap_or(0),
                score: scores[slot],
                grading_score: player.grading_score.unwrap_or(0),
                rank: ranks[slot],
            };
        }

        Ok(GameRecord {
            id,
            mode,
            start_time,
            players: results,
        })
    }
}

/// Decodes and normalizes one page element in a single step.
///
/// # Errors
/// Returns the [`RejectReason`] of whichever step failed.
pub fn normalize_game(value: &Value, mode_override: Option<Mode>) -> Result<GameRecord, RejectReason> {
    RawGame::decode(value)?.normalize(mode_override)
}

/// Placement ranks 1..=4 by descending score; equal scores go to the earlier slot.
#[must_use]
pub fn compute_ranks(scores: [i64; PLAYER_SLOTS]) -> [u8; PLAYER_SLOTS] {
    let mut order: [usize; PLAYER_SLOTS] = [0, 1, 2, 3];
    order.sort_by_key(|&slot| (std::cmp::Reverse(scores[slot]), slot));

    let mut ranks = [0_u8; PLAYER_SLOTS];
    for (position, slot) in (1_u8..).zip(order) {
        ranks[slot] = position;
    }
    ranks
}

/// Best-effort identifier of a page element, for log lines about rejected records.
#[must_use]
pub fn raw_identifier(value: &Value) -> Option<&str> {
    ["_id", "uuid"]
        .into_iter()
        .filter_map(|key| value.get(key).and_then(Value::as_str))
        .find(|candidate| !candidate.is_empty())
}

/// Pagination boundary of a page element: `startTime`, else `endTime`, else 0.
/// Non-object elements and times that are not integers have no boundary.
#[must_use]
pub fn boundary_seconds(value: &Value) -> Option<i64> {
    let object = value.as_object()?;
    for key in ["startTime", "endTime"] {
        match object.get(key) {
            None | Some(Value::Null) => {}
            Some(time) => return time.as_i64(),
        }
    }
    Some(0)
}

#[must_use]
pub fn to_millis(value: i64) -> i64 {
    if value >= MILLIS_THRESHOLD {
        value
    } else {
        value.saturating_mul(1000)
    }
}

#[must_use]
pub fn to_seconds(value: i64) -> i64 {
    if value >= MILLIS_THRESHOLD {
        value / 1000
    } else {
        value
    }
}

/// Converts a millisecond filter bound to the seconds stored in `startTime`.
#[must_use]
pub fn filter_seconds(millis: i64) -> i64 {
    millis / 1000
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn now_ms() -> i64 {
    let millis = now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(i64::MAX)
}

/// `[now - days, now]` in milliseconds.
#[must_use]
pub fn trailing_window_ms(days: i64) -> (i64, i64) {
    let end = now_ms();
    (end - days * MILLIS_PER_DAY, end)
}

/// # Errors
/// Returns [`RanksError::Time`] when the timestamp cannot be rendered.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, RanksError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RanksError::Time(format!("failed to format RFC3339 timestamp: {err}")))
}
