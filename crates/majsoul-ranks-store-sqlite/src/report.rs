//! Read-only aggregates over stored games.
//!
//! Rows are loaded once per filter and aggregated in memory; every report is a
//! pure function over `&[GameRecord]` so it can be tested without a database.
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use majsoul_ranks_core::{filter_seconds, GameRecord, LevelBin, Mode, PlayerResult, PLAYER_SLOTS};
use rusqlite::types::Value as SqlValue;

use crate::SqliteGameStore;

pub const SUMMARY_HEADER: &str = "rank,count,percent,avg_score,avg_grade,avg_level";
pub const CORRELATION_HEADER: &str = "level,count,p1%,p2%,p3%,p4%,avg_place,avg_score,avg_grade";
pub const COMPARISON_HEADER: &str =
    "level_a,level_b,instances,a_better,b_better,avg_rank_diff,avg_score_diff,avg_grade_diff";
pub const INSTANCE_HEADER: &str = "id,startTime,playerA,levelA,rankA,scoreA,gradeA,playerB,levelB,rankB,scoreB,gradeB,diff_rank,diff_score,diff_grade";
pub const COMPARE_ALL_HEADER: &str =
    "level_a,level_b,mode,instances,a_better,b_better,avg_rank_diff,avg_score_diff,avg_grade_diff";
pub const EXPORT_HEADER: &str = "id,mode,startTime,player,rank,level,score,gradingScore";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportFilter {
    pub mode: Option<Mode>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl ReportFilter {
    #[must_use]
    pub fn with_mode(self, mode: Mode) -> Self {
        Self {
            mode: Some(mode),
            ..self
        }
    }

    fn conditions(&self) -> (Vec<String>, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(mode) = self.mode {
            params.push(SqlValue::Integer(mode.code()));
            clauses.push(format!("mode = ?{}", params.len()));
        }
        if let Some(start_ms) = self.start_ms {
            params.push(SqlValue::Integer(filter_seconds(start_ms)));
            clauses.push(format!("startTime >= ?{}", params.len()));
        }
        if let Some(end_ms) = self.end_ms {
            params.push(SqlValue::Integer(filter_seconds(end_ms)));
            clauses.push(format!("startTime <= ?{}", params.len()));
        }

        (clauses, params)
    }
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn known_mode_list() -> String {
    Mode::ALL
        .iter()
        .map(|mode| mode.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One player slot of one game, flattened for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerObservation {
    pub rank: u8,
    pub level: i64,
    pub score: i64,
    pub grade: i64,
}

pub fn observations(games: &[GameRecord]) -> impl Iterator<Item = PlayerObservation> + '_ {
    games.iter().flat_map(|game| {
        game.players.iter().map(|player| PlayerObservation {
            rank: player.rank,
            level: player.level,
            score: player.score,
            grade: player.grading_score,
        })
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankSummaryRow {
    pub rank: u8,
    pub count: usize,
    pub percent: f64,
    pub avg_score: f64,
    pub avg_grade: f64,
    pub avg_level: f64,
}

impl RankSummaryRow {
    #[must_use]
    pub fn csv_record(&self) -> String {
        format!(
            "{},{},{:.2},{:.2},{:.2},{:.2}",
            self.rank, self.count, self.percent, self.avg_score, self.avg_grade, self.avg_level
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Sums {
    count: usize,
    score: i64,
    grade: i64,
    level: i64,
    place: i64,
    placements: [usize; PLAYER_SLOTS],
}

impl Sums {
    fn add(&mut self, observation: PlayerObservation) {
        self.count += 1;
        self.score += observation.score;
        self.grade += observation.grade;
        self.level += observation.level;
        self.place += i64::from(observation.rank);
        if let Some(slot) = usize::from(observation.rank)
            .checked_sub(1)
            .and_then(|index| self.placements.get_mut(index))
        {
            *slot += 1;
        }
    }

    fn mean(&self, total: i64) -> f64 {
        total as f64 / self.count as f64
    }
}

#[must_use]
pub fn summarize_by_rank(games: &[GameRecord]) -> Vec<RankSummaryRow> {
    let mut by_rank: BTreeMap<u8, Sums> = BTreeMap::new();
    let mut total = 0_usize;
    for observation in observations(games) {
        by_rank.entry(observation.rank).or_default().add(observation);
        total += 1;
    }

    by_rank
        .into_iter()
        .map(|(rank, sums)| RankSummaryRow {
            rank,
            count: sums.count,
            percent: sums.count as f64 / total as f64 * 100.0,
            avg_score: sums.mean(sums.score),
            avg_grade: sums.mean(sums.grade),
            avg_level: sums.mean(sums.level),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelCorrelationRow {
    pub level: i64,
    pub count: usize,
    pub placement_percent: [f64; PLAYER_SLOTS],
    pub avg_place: f64,
    pub avg_score: f64,
    pub avg_grade: f64,
}

impl LevelCorrelationRow {
    #[must_use]
    pub fn csv_record(&self) -> String {
        let [p1, p2, p3, p4] = self.placement_percent;
        format!(
            "{},{},{p1:.2},{p2:.2},{p3:.2},{p4:.2},{:.3},{:.2},{:.2}",
            self.level, self.count, self.avg_place, self.avg_score, self.avg_grade
        )
    }
}

#[must_use]
pub fn correlate_levels(games: &[GameRecord], bin: LevelBin) -> Vec<LevelCorrelationRow> {
    let mut by_bucket: BTreeMap<i64, Sums> = BTreeMap::new();
    for observation in observations(games) {
        by_bucket
            .entry(bin.bucket(observation.level))
            .or_default()
            .add(observation);
    }

    by_bucket
        .into_iter()
        .map(|(level, sums)| LevelCorrelationRow {
            level,
            count: sums.count,
            placement_percent: sums
                .placements
                .map(|placed| placed as f64 / sums.count as f64 * 100.0),
            avg_place: sums.mean(sums.place),
            avg_score: sums.mean(sums.score),
            avg_grade: sums.mean(sums.grade),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    /// 1-based player slot.
    pub player: usize,
    pub level: i64,
    pub rank: u8,
    pub score: i64,
    pub grade: i64,
}

impl SlotView {
    fn new(slot: usize, player: &PlayerResult) -> Self {
        Self {
            player: slot + 1,
            level: player.level,
            rank: player.rank,
            score: player.score,
            grade: player.grading_score,
        }
    }
}

/// One A-bucket player paired with one B-bucket player of the same game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadToHead {
    pub id: String,
    pub start_time: i64,
    pub a: SlotView,
    pub b: SlotView,
}

impl HeadToHead {
    #[must_use]
    pub fn diff_rank(&self) -> i64 {
        i64::from(self.a.rank) - i64::from(self.b.rank)
    }

    #[must_use]
    pub fn diff_score(&self) -> i64 {
        self.a.score - self.b.score
    }

    #[must_use]
    pub fn diff_grade(&self) -> i64 {
        self.a.grade - self.b.grade
    }

    #[must_use]
    pub fn csv_record(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            csv_field(&self.id),
            self.start_time,
            self.a.player,
            self.a.level,
            self.a.rank,
            self.a.score,
            self.a.grade,
            self.b.player,
            self.b.level,
            self.b.rank,
            self.b.score,
            self.b.grade,
            self.diff_rank(),
            self.diff_score(),
            self.diff_grade()
        )
    }
}

#[must_use]
pub fn head_to_head(
    games: &[GameRecord],
    bin: LevelBin,
    level_a: i64,
    level_b: i64,
) -> Vec<HeadToHead> {
    let mut instances = Vec::new();
    for game in games {
        let in_bucket = |bucket: i64| {
            game.players
                .iter()
                .enumerate()
                .filter(move |(_, player)| bin.bucket(player.level) == bucket)
                .map(|(slot, player)| SlotView::new(slot, player))
        };

        for a in in_bucket(level_a) {
            for b in in_bucket(level_b) {
                instances.push(HeadToHead {
                    id: game.id.clone(),
                    start_time: game.start_time,
                    a,
                    b,
                });
            }
        }
    }
    instances
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonSummary {
    pub level_a: i64,
    pub level_b: i64,
    pub instances: usize,
    pub a_better: usize,
    pub b_better: usize,
    pub avg_rank_diff: f64,
    pub avg_score_diff: f64,
    pub avg_grade_diff: f64,
}

impl ComparisonSummary {
    #[must_use]
    pub fn csv_record(&self) -> String {
        format!(
            "{},{},{},{},{},{:.4},{:.2},{:.2}",
            self.level_a,
            self.level_b,
            self.instances,
            self.a_better,
            self.b_better,
            self.avg_rank_diff,
            self.avg_score_diff,
            self.avg_grade_diff
        )
    }
}

/// `None` when there are no instances.
#[must_use]
pub fn summarize_head_to_head(
    level_a: i64,
    level_b: i64,
    instances: &[HeadToHead],
) -> Option<ComparisonSummary> {
    if instances.is_empty() {
        return None;
    }

    let count = instances.len() as f64;
    let sum = |diff: fn(&HeadToHead) -> i64| instances.iter().map(diff).sum::<i64>() as f64;

    Some(ComparisonSummary {
        level_a,
        level_b,
        instances: instances.len(),
        a_better: instances.iter().filter(|pair| pair.diff_rank() < 0).count(),
        b_better: instances.iter().filter(|pair| pair.diff_rank() > 0).count(),
        avg_rank_diff: sum(HeadToHead::diff_rank) / count,
        avg_score_diff: sum(HeadToHead::diff_score) / count,
        avg_grade_diff: sum(HeadToHead::diff_grade) / count,
    })
}

/// One block of the `compare-all` sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetSweep {
    pub mode: Mode,
    pub levels_a: Vec<i64>,
    pub levels_b: Vec<i64>,
}

/// Gold vs Gold+Master, Master vs Master+Saint, Saint vs Saint+Celestial,
/// Celestial vs Celestial.
#[must_use]
pub fn preset_sweeps() -> Vec<PresetSweep> {
    let gold: Vec<i64> = (10301..=10303).collect();
    let master: Vec<i64> = (10401..=10403).collect();
    let saint: Vec<i64> = (10501..=10503).collect();

    vec![
        PresetSweep {
            mode: Mode::GoldSouth,
            levels_a: gold.clone(),
            levels_b: [gold, master.clone()].concat(),
        },
        PresetSweep {
            mode: Mode::JadeSouth,
            levels_a: master.clone(),
            levels_b: [master, saint.clone()].concat(),
        },
        PresetSweep {
            mode: Mode::ThroneSouth,
            levels_a: saint.clone(),
            levels_b: [saint, vec![10701]].concat(),
        },
        PresetSweep {
            mode: Mode::ThroneSouth,
            levels_a: vec![10701],
            levels_b: (10701..=10720).collect(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareAllRow {
    pub mode: Mode,
    pub summary: ComparisonSummary,
}

impl CompareAllRow {
    #[must_use]
    pub fn csv_record(&self) -> String {
        let summary = &self.summary;
        format!(
            "{},{},{},{},{},{},{:.4},{:.2},{:.2}",
            summary.level_a,
            summary.level_b,
            self.mode,
            summary.instances,
            summary.a_better,
            summary.b_better,
            summary.avg_rank_diff,
            summary.avg_score_diff,
            summary.avg_grade_diff
        )
    }
}

/// Runs every pair `a < b` of one sweep over already-loaded games.
#[must_use]
pub fn sweep_pairs(games: &[GameRecord], sweep: &PresetSweep, bin: LevelBin) -> Vec<CompareAllRow> {
    let mut rows = Vec::new();
    for &level_a in &sweep.levels_a {
        for &level_b in &sweep.levels_b {
            if level_a >= level_b {
                continue;
            }
            let instances = head_to_head(games, bin, level_a, level_b);
            if let Some(summary) = summarize_head_to_head(level_a, level_b, &instances) {
                rows.push(CompareAllRow {
                    mode: sweep.mode,
                    summary,
                });
            }
        }
    }
    rows
}

/// Four export lines per game, one per player slot.
#[must_use]
pub fn export_records(game: &GameRecord) -> Vec<String> {
    game.players
        .iter()
        .enumerate()
        .map(|(slot, player)| {
            format!(
                "{},{},{},{},{},{},{},{}",
                csv_field(&game.id),
                game.mode,
                game.start_time,
                slot + 1,
                player.rank,
                player.level,
                player.score,
                player.grading_score
            )
        })
        .collect()
}

/// Quotes a CSV field when it contains a separator, quote or newline.
#[must_use]
pub fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

impl SqliteGameStore {
    /// Games matching `filter`. Rows with a mode other than 9, 12 or 16 are
    /// skipped and counted in a warning.
    pub fn load_games(&self, filter: &ReportFilter) -> Result<Vec<GameRecord>> {
        if filter.mode.is_none() {
            let skipped = self.count_unknown_mode_games(filter)?;
            if skipped > 0 {
                tracing::warn!(skipped, "ignoring stored games with an unknown mode");
            }
        }

        let (mut clauses, params) = filter.conditions();
        clauses.push(format!("mode IN ({})", known_mode_list()));
        let sql = format!(
            "SELECT {} FROM games{} ORDER BY startTime ASC, id ASC",
            crate::migration::column_list(),
            where_sql(&clauses)
        );

        let mut stmt = self
            .connection()
            .prepare(&sql)
            .context("failed to prepare games query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), parse_game_row)
            .context("failed to query games")?;

        let mut games = Vec::new();
        for row in rows {
            games.push(row.context("failed to decode stored game")?);
        }
        Ok(games)
    }

    /// Rows inside the time window of `filter` whose mode is not 9, 12 or 16.
    pub fn count_unknown_mode_games(&self, filter: &ReportFilter) -> Result<usize> {
        let (mut clauses, params) = ReportFilter {
            mode: None,
            ..*filter
        }
        .conditions();
        clauses.push(format!("(mode IS NULL OR mode NOT IN ({}))", known_mode_list()));
        let sql = format!("SELECT COUNT(*) FROM games{}", where_sql(&clauses));

        let count: i64 = self
            .connection()
            .query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))
            .context("failed to count games with unknown modes")?;
        usize::try_from(count).with_context(|| format!("invalid games count {count}"))
    }

    /// The full `compare-all` sweep; each sweep's mode replaces `filter.mode`.
    pub fn compare_all(&self, filter: &ReportFilter, bin: LevelBin) -> Result<Vec<CompareAllRow>> {
        let mut rows = Vec::new();
        for sweep in preset_sweeps() {
            tracing::info!(
                mode = %sweep.mode,
                levels_a = ?sweep.levels_a,
                levels_b = ?sweep.levels_b,
                "comparing level sweep"
            );
            let games = self.load_games(&filter.with_mode(sweep.mode))?;
            rows.extend(sweep_pairs(&games, &sweep, bin));
        }
        Ok(rows)
    }
}

fn parse_game_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameRecord> {
    let mode_code: i64 = row.get(1)?;
    let mode = Mode::from_code(mode_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown mode {mode_code}"),
            )),
        )
    })?;

    let mut players = [PlayerResult {
        level: 0,
        score: 0,
        grading_score: 0,
        rank: 0,
    }; PLAYER_SLOTS];
    for (slot, player) in players.iter_mut().enumerate() {
        let base = 3 + slot * 4;
        *player = PlayerResult {
            level: row.get::<_, Option<i64>>(base)?.unwrap_or(0),
            score: row.get::<_, Option<i64>>(base + 1)?.unwrap_or(0),
            grading_score: row.get::<_, Option<i64>>(base + 2)?.unwrap_or(0),
            rank: row.get(base + 3)?,
        };
    }

    Ok(GameRecord {
        id: row.get(0)?,
        mode,
        start_time: row.get(2)?,
        players,
    })
}
