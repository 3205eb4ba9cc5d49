//! Keeps the `games` table in the fixed column layout of [`GAME_COLUMNS`].
//!
//! A legacy table is rewritten through a [`MigrationPlan`]: every target
//! column is either copied from an existing column or derived from the four
//! score columns. The plan is pure; [`ensure_games_schema`] executes it inside
//! one transaction and swaps the shadow table in with a rename.

use anyhow::{anyhow, Context, Result};
use majsoul_ranks_core::{format_rfc3339, now_utc, GAME_COLUMNS, PLAYER_SLOTS};
use rusqlite::{params, Connection, OptionalExtension};

pub const GAMES_TABLE: &str = "games";
const SHADOW_TABLE: &str = "games_new";

pub const LAYOUT_VERSION: i64 = 1;
const LAYOUT_NAME: &str = "games_ranked_layout";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SchemaError {
    #[error("cannot migrate games: column {0} is missing and cannot be derived")]
    MissingColumn(&'static str),
}

/// Where one target column gets its value from during a migration.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnSource {
    Copy(&'static str),
    /// Older layouts kept the end time under `endTime`.
    Rename {
        from: &'static str,
        to: &'static str,
    },
    DeriveRank {
        slot: usize,
    },
}

impl ColumnSource {
    fn select_expr(self) -> String {
        match self {
            Self::Copy(column) => quote_ident(column),
            Self::Rename { from, .. } => quote_ident(from),
            Self::DeriveRank { slot } => rank_expression(slot),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MigrationPlan {
    sources: Vec<ColumnSource>,
}

impl MigrationPlan {
    /// Maps an existing column list onto the target layout.
    ///
    /// # Errors
    /// Returns [`SchemaError::MissingColumn`] when a target column is absent
    /// and cannot be derived from what is there.
    pub fn for_columns(existing: &[String]) -> Result<Self, SchemaError> {
        let has = |column: &str| existing.iter().any(|candidate| candidate == column);

        let mut sources = Vec::with_capacity(GAME_COLUMNS.len());
        for column in GAME_COLUMNS {
            if has(column) {
                sources.push(ColumnSource::Copy(column));
                continue;
            }

            if column == "startTime" && has("endTime") {
                sources.push(ColumnSource::Rename {
                    from: "endTime",
                    to: "startTime",
                });
                continue;
            }

            match rank_slot(column) {
                Some(slot) => {
                    if let Some(missing) = score_columns().into_iter().find(|score| !has(*score)) {
                        return Err(SchemaError::MissingColumn(missing));
                    }
                    sources.push(ColumnSource::DeriveRank { slot });
                }
                None => return Err(SchemaError::MissingColumn(column)),
            }
        }

        Ok(Self { sources })
    }

    #[must_use]
    pub fn sources(&self) -> &[ColumnSource] {
        &self.sources
    }

    #[must_use]
    pub fn derived_rank_slots(&self) -> Vec<usize> {
        self.sources
            .iter()
            .filter_map(|source| match source {
                ColumnSource::DeriveRank { slot } => Some(*slot),
                _ => None,
            })
            .collect()
    }

    /// `INSERT INTO {target} (...) SELECT ... FROM {source}` for this plan.
    #[must_use]
    pub fn copy_sql(&self, source: &str, target: &str) -> String {
        let select_list = self
            .sources
            .iter()
            .map(|source| source.select_expr())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) SELECT {select_list} FROM {}",
            quote_ident(target),
            column_list(),
            quote_ident(source)
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SchemaState {
    Missing,
    Current,
    Legacy(Vec<String>),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MigrationOutcome {
    Created,
    UpToDate,
    Migrated {
        rows: usize,
        derived_rank_slots: Vec<usize>,
    },
}

/// SQL expression for the rank of `slot` (0-based) from the score columns:
/// one plus the players with a strictly greater score plus the earlier
/// players with an equal score. NULL scores count as 0.
#[must_use]
pub fn rank_expression(slot: usize) -> String {
    let scores = score_columns().map(score_operand);
    let own = &scores[slot];

    let mut terms = Vec::new();
    for (other, column) in scores.iter().enumerate() {
        if other != slot {
            terms.push(format!("(CASE WHEN {column} > {own} THEN 1 ELSE 0 END)"));
        }
    }
    for column in &scores[..slot] {
        terms.push(format!("(CASE WHEN {column} = {own} THEN 1 ELSE 0 END)"));
    }

    format!("(1 + {})", terms.join(" + "))
}

#[must_use]
pub fn create_games_sql(table: &str) -> String {
    let columns = GAME_COLUMNS
        .iter()
        .map(|column| {
            if *column == "id" {
                format!("  {} TEXT PRIMARY KEY", quote_ident(column))
            } else {
                format!("  {} INTEGER", quote_ident(column))
            }
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE {} (\n{columns}\n)", quote_ident(table))
}

pub fn inspect(conn: &Connection) -> Result<SchemaState> {
    if !table_exists(conn, GAMES_TABLE)? {
        return Ok(SchemaState::Missing);
    }

    let columns = table_columns(conn, GAMES_TABLE)?;
    if columns.iter().map(String::as_str).eq(GAME_COLUMNS) {
        Ok(SchemaState::Current)
    } else {
        Ok(SchemaState::Legacy(columns))
    }
}

/// Creates or migrates the `games` table. Safe to call on every start.
///
/// # Errors
/// Fails when the legacy layout cannot be mapped onto the target layout, when
/// the copy does not preserve the row count, or on any SQL error. The existing
/// table is untouched in all of those cases.
pub fn ensure_games_schema(conn: &mut Connection) -> Result<MigrationOutcome> {
    let state = inspect(conn)?;
    let tx = conn
        .transaction()
        .context("failed to start schema transaction")?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    let outcome = match state {
        SchemaState::Current => MigrationOutcome::UpToDate,
        SchemaState::Missing => {
            tx.execute_batch(&create_games_sql(GAMES_TABLE))
                .context("failed to create games table")?;
            MigrationOutcome::Created
        }
        SchemaState::Legacy(columns) => {
            let plan = MigrationPlan::for_columns(&columns)?;
            let rows_before = count_rows(&tx, GAMES_TABLE)?;

            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {shadow};\n{create};",
                shadow = quote_ident(SHADOW_TABLE),
                create = create_games_sql(SHADOW_TABLE),
            ))
            .context("failed to create shadow games table")?;
            tx.execute(&plan.copy_sql(GAMES_TABLE, SHADOW_TABLE), [])
                .context("failed to copy games into shadow table")?;

            let rows_after = count_rows(&tx, SHADOW_TABLE)?;
            if rows_after != rows_before {
                return Err(anyhow!(
                    "games migration lost rows: {rows_before} before, {rows_after} after"
                ));
            }

            tx.execute_batch(&format!(
                "DROP TABLE {games};\nALTER TABLE {shadow} RENAME TO {games};",
                games = quote_ident(GAMES_TABLE),
                shadow = quote_ident(SHADOW_TABLE),
            ))
            .context("failed to swap migrated games table")?;

            MigrationOutcome::Migrated {
                rows: rows_after,
                derived_rank_slots: plan.derived_rank_slots(),
            }
        }
    };

    let applied_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![LAYOUT_VERSION, LAYOUT_NAME, applied_at],
    )
    .context("failed to register games layout migration")?;

    tx.commit().context("failed to commit schema transaction")?;
    Ok(outcome)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

pub(crate) fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }

    Ok(columns)
}

fn count_rows(conn: &Connection, table_name: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table_name)),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count rows in {table_name}"))?;
    usize::try_from(count).with_context(|| format!("invalid row count {count}"))
}

pub(crate) fn column_list() -> String {
    GAME_COLUMNS
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ")
}

fn score_columns() -> [&'static str; PLAYER_SLOTS] {
    [
        "player1_score",
        "player2_score",
        "player3_score",
        "player4_score",
    ]
}

fn score_operand(column: &str) -> String {
    format!("COALESCE({}, 0)", quote_ident(column))
}

fn rank_slot(column: &str) -> Option<usize> {
    match column {
        "player1_rank" => Some(0),
        "player2_rank" => Some(1),
        "player3_rank" => Some(2),
        "player4_rank" => Some(3),
        _ => None,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use majsoul_ranks_core::compute_ranks;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn memory_conn() -> Connection {
        match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open in-memory sqlite: {err}"),
        }
    }

    fn owned(columns: &[&str]) -> Vec<String> {
        columns.iter().map(ToString::to_string).collect()
    }

    const UNRANKED_LAYOUT: &str = "CREATE TABLE games (
        id TEXT PRIMARY KEY,
        mode INTEGER,
        startTime INTEGER,
        player1_level INTEGER, player1_score INTEGER, player1_gradingScore INTEGER,
        player2_level INTEGER, player2_score INTEGER, player2_gradingScore INTEGER,
        player3_level INTEGER, player3_score INTEGER, player3_gradingScore INTEGER,
        player4_level INTEGER, player4_score INTEGER, player4_gradingScore INTEGER
    );";

    fn seed_unranked(conn: &Connection, id: &str, scores: [i64; 4]) {
        let result = conn.execute(
            "INSERT INTO games VALUES (?1, 12, 1700000000, 10301, ?2, 10, 10302, ?3, 20, 10303, ?4, 30, 10401, ?5, 40)",
            params![id, scores[0], scores[1], scores[2], scores[3]],
        );
        if let Err(err) = result {
            panic!("test setup failed: {err}");
        }
    }

    fn stored_ranks(conn: &Connection, id: &str) -> [u8; 4] {
        let result = conn.query_row(
            "SELECT player1_rank, player2_rank, player3_rank, player4_rank FROM games WHERE id = ?1",
            params![id],
            |row| Ok([row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?]),
        );
        match result {
            Ok(ranks) => ranks,
            Err(err) => panic!("failed to read ranks for {id}: {err}"),
        }
    }

    #[test]
    fn current_layout_needs_only_copies() {
        let plan = match MigrationPlan::for_columns(&owned(&GAME_COLUMNS)) {
            Ok(plan) => plan,
            Err(err) => panic!("unexpected plan error: {err}"),
        };
        assert!(plan.derived_rank_slots().is_empty());
        assert!(plan
            .sources()
            .iter()
            .all(|source| matches!(source, ColumnSource::Copy(_))));
    }

    #[test]
    fn missing_ranks_are_derived_and_missing_levels_fail() {
        let without_ranks: Vec<&str> = GAME_COLUMNS
            .iter()
            .copied()
            .filter(|column| !column.ends_with("_rank"))
            .collect();
        let plan = match MigrationPlan::for_columns(&owned(&without_ranks)) {
            Ok(plan) => plan,
            Err(err) => panic!("unexpected plan error: {err}"),
        };
        assert_eq!(plan.derived_rank_slots(), vec![0, 1, 2, 3]);

        let without_score: Vec<&str> = without_ranks
            .iter()
            .copied()
            .filter(|column| *column != "player3_score")
            .collect();
        assert_eq!(
            MigrationPlan::for_columns(&owned(&without_score)),
            Err(SchemaError::MissingColumn("player3_score"))
        );

        let without_level: Vec<&str> = GAME_COLUMNS
            .iter()
            .copied()
            .filter(|column| *column != "player2_level")
            .collect();
        assert_eq!(
            MigrationPlan::for_columns(&owned(&without_level)),
            Err(SchemaError::MissingColumn("player2_level"))
        );
    }

    #[test]
    fn end_time_layout_maps_onto_start_time() {
        let legacy: Vec<&str> = GAME_COLUMNS
            .iter()
            .map(|column| if *column == "startTime" { "endTime" } else { column })
            .collect();
        let plan = match MigrationPlan::for_columns(&owned(&legacy)) {
            Ok(plan) => plan,
            Err(err) => panic!("unexpected plan error: {err}"),
        };
        assert_eq!(
            plan.sources()[2],
            ColumnSource::Rename {
                from: "endTime",
                to: "startTime"
            }
        );
    }

    #[test]
    fn rank_expression_counts_greater_and_earlier_equal() {
        assert_eq!(
            rank_expression(0),
            "(1 + (CASE WHEN COALESCE(\"player2_score\", 0) > COALESCE(\"player1_score\", 0) THEN 1 ELSE 0 END) + \
             (CASE WHEN COALESCE(\"player3_score\", 0) > COALESCE(\"player1_score\", 0) THEN 1 ELSE 0 END) + \
             (CASE WHEN COALESCE(\"player4_score\", 0) > COALESCE(\"player1_score\", 0) THEN 1 ELSE 0 END))"
        );
        assert!(rank_expression(3)
            .contains("COALESCE(\"player3_score\", 0) = COALESCE(\"player4_score\", 0)"));
    }

    #[test]
    fn fresh_database_gets_target_layout() {
        let mut conn = memory_conn();
        assert_eq!(must(ensure_games_schema(&mut conn)), MigrationOutcome::Created);
        assert_eq!(must(inspect(&conn)), SchemaState::Current);
        assert_eq!(must(ensure_games_schema(&mut conn)), MigrationOutcome::UpToDate);

        let recorded: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![LAYOUT_VERSION],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to read schema_migrations: {err}"),
        };
        assert_eq!(recorded, 1);
    }

    #[test]
    fn unranked_table_is_migrated_with_normalizer_ranks() {
        let mut conn = memory_conn();
        if let Err(err) = conn.execute_batch(UNRANKED_LAYOUT) {
            panic!("test setup failed: {err}");
        }

        let fixtures: [(&str, [i64; 4]); 4] = [
            ("a", [25_000, 41_000, 8_000, 26_000]),
            ("b", [25_000, 25_000, 25_000, 25_000]),
            ("c", [10_000, 30_000, 10_000, 30_000]),
            ("d", [-3_000, 52_000, 40_100, 10_900]),
        ];
        for (id, scores) in fixtures {
            seed_unranked(&conn, id, scores);
        }

        let outcome = must(ensure_games_schema(&mut conn));
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                rows: 4,
                derived_rank_slots: vec![0, 1, 2, 3],
            }
        );
        assert_eq!(must(inspect(&conn)), SchemaState::Current);
        assert!(!must(table_exists(&conn, SHADOW_TABLE)));

        for (id, scores) in fixtures {
            assert_eq!(stored_ranks(&conn, id), compute_ranks(scores), "game {id}");
        }
    }

    #[test]
    fn null_scores_rank_as_zero() {
        let mut conn = memory_conn();
        if let Err(err) = conn.execute_batch(UNRANKED_LAYOUT) {
            panic!("test setup failed: {err}");
        }
        let seeded = conn.execute(
            "INSERT INTO games VALUES ('n', 12, 1700000000, 10301, NULL, 0, 10302, NULL, 0, 10303, NULL, 0, 10401, 500, 0)",
            [],
        );
        if let Err(err) = seeded {
            panic!("test setup failed: {err}");
        }

        let _ = must(ensure_games_schema(&mut conn));
        assert_eq!(stored_ranks(&conn, "n"), compute_ranks([0, 0, 0, 500]));
        assert_eq!(stored_ranks(&conn, "n"), [2, 3, 4, 1]);
    }

    #[test]
    fn reordered_table_keeps_existing_ranks() {
        let mut conn = memory_conn();
        let setup = conn.execute_batch(
            "CREATE TABLE games (
                id TEXT PRIMARY KEY, mode INTEGER, startTime INTEGER,
                player1_level INTEGER, player1_score INTEGER, player1_gradingScore INTEGER,
                player2_level INTEGER, player2_score INTEGER, player2_gradingScore INTEGER,
                player3_level INTEGER, player3_score INTEGER, player3_gradingScore INTEGER,
                player4_level INTEGER, player4_score INTEGER, player4_gradingScore INTEGER,
                player1_rank INTEGER, player2_rank INTEGER, player3_rank INTEGER, player4_rank INTEGER,
                nickname TEXT
             );
             INSERT INTO games VALUES ('x', 16, 1700000000,
                10701, 30000, 1, 10702, 30000, 2, 10703, 20000, 3, 10704, 20000, 4,
                2, 1, 4, 3, 'kept-out');",
        );
        if let Err(err) = setup {
            panic!("test setup failed: {err}");
        }

        let outcome = must(ensure_games_schema(&mut conn));
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                rows: 1,
                derived_rank_slots: Vec::new(),
            }
        );
        assert_eq!(stored_ranks(&conn, "x"), [2, 1, 4, 3]);
        assert_eq!(must(inspect(&conn)), SchemaState::Current);
    }

    #[test]
    fn underivable_layout_fails_and_leaves_table_intact() {
        let mut conn = memory_conn();
        let setup = conn.execute_batch(
            "CREATE TABLE games (id TEXT PRIMARY KEY, mode INTEGER, startTime INTEGER);
             INSERT INTO games VALUES ('only', 12, 1700000000);",
        );
        if let Err(err) = setup {
            panic!("test setup failed: {err}");
        }

        let err = match ensure_games_schema(&mut conn) {
            Ok(outcome) => panic!("migration should fail, got {outcome:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("player1_level"));
        assert_eq!(must(count_rows(&conn, GAMES_TABLE)), 1);
        assert!(!must(table_exists(&conn, SHADOW_TABLE)));
    }
}
