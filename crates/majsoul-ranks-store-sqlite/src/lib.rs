#![allow(clippy::missing_errors_doc)]

pub mod migration;
pub mod report;

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use majsoul_ranks_core::{GameRecord, RejectReason, GAME_COLUMNS};
use rusqlite::{params, Connection, OpenFlags};

pub use migration::{MigrationOutcome, SchemaError};

pub struct SqliteGameStore {
    conn: Connection,
}

/// Run-wide state of a "stop after N new rows" ingestion.
#[derive(Debug, Clone)]
pub struct InsertCap {
    remaining: usize,
    seen: HashSet<String>,
}

impl InsertCap {
    #[must_use]
    pub fn new(target: usize) -> Self {
        Self {
            remaining: target,
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    #[must_use]
    pub fn is_reached(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Batch entries consumed; less than the batch length when a cap stopped it.
    pub processed: usize,
    pub reached_cap: bool,
}

impl InsertReport {
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.duplicates + self.rejected + self.failed
    }
}

impl SqliteGameStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Like [`Self::open`], but a missing database file is an error.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open existing sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Ok(Self { conn })
    }

    /// Brings the `games` table to the current layout.
    pub fn migrate(&mut self) -> Result<MigrationOutcome> {
        let outcome = migration::ensure_games_schema(&mut self.conn)?;
        match &outcome {
            MigrationOutcome::Created => tracing::info!("created games table"),
            MigrationOutcome::UpToDate => tracing::debug!("games table already in target layout"),
            MigrationOutcome::Migrated {
                rows,
                derived_rank_slots,
            } => tracing::info!(
                rows,
                derived_rank_slots = ?derived_rank_slots,
                "migrated games table to target layout"
            ),
        }
        Ok(outcome)
    }

    /// Inserts one page worth of normalized records in a single transaction.
    ///
    /// Existing ids are skipped, rejected entries are counted, and a failing
    /// row never aborts the batch. With a `cap`, ids seen earlier in the run are
    /// skipped and the batch stops as soon as the cap is reached.
    pub fn insert_batch(
        &mut self,
        batch: &[Result<GameRecord, RejectReason>],
        mut cap: Option<&mut InsertCap>,
    ) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        let insert_sql = format!(
            "INSERT OR IGNORE INTO games ({}) VALUES ({})",
            migration::column_list(),
            (1..=GAME_COLUMNS.len())
                .map(|index| format!("?{index}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(&insert_sql)
                .context("failed to prepare games insert")?;

            for (index, entry) in batch.iter().enumerate() {
                if cap.as_ref().is_some_and(|cap| cap.is_reached()) {
                    report.reached_cap = true;
                    break;
                }
                report.processed += 1;

                let record = match entry {
                    Ok(record) => record,
                    Err(reason) => {
                        tracing::debug!(record = index + 1, %reason, "skip: invalid row");
                        report.rejected += 1;
                        continue;
                    }
                };

                if let Some(cap) = cap.as_deref() {
                    if cap.seen.contains(&record.id) {
                        tracing::debug!(record = index + 1, id = %record.id, "skip: already seen in this run");
                        report.duplicates += 1;
                        continue;
                    }
                }

                let p = &record.players;
                let result = stmt.execute(params![
                    record.id,
                    record.mode.code(),
                    record.start_time,
                    p[0].level,
                    p[0].score,
                    p[0].grading_score,
                    i64::from(p[0].rank),
                    p[1].level,
                    p[1].score,
                    p[1].grading_score,
                    i64::from(p[1].rank),
                    p[2].level,
                    p[2].score,
                    p[2].grading_score,
                    i64::from(p[2].rank),
                    p[3].level,
                    p[3].score,
                    p[3].grading_score,
                    i64::from(p[3].rank),
                ]);

                match result {
                    Ok(changed) => {
                        if let Some(cap) = cap.as_deref_mut() {
                            cap.seen.insert(record.id.clone());
                        }
                        if changed > 0 {
                            report.inserted += 1;
                            if let Some(cap) = cap.as_deref_mut() {
                                cap.remaining -= 1;
                                if cap.is_reached() {
                                    report.reached_cap = true;
                                    break;
                                }
                            }
                        } else {
                            tracing::debug!(record = index + 1, id = %record.id, "skip: duplicate");
                            report.duplicates += 1;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(record = index + 1, id = %record.id, error = %err, "skip: insert failed");
                        report.failed += 1;
                    }
                }
            }
        }
        tx.commit().context("failed to commit insert transaction")?;

        Ok(report)
    }

    pub fn count_games(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))
            .context("failed to count games")?;
        usize::try_from(count).with_context(|| format!("invalid games count {count}"))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
