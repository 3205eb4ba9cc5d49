#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use majsoul_ranks_core::{boundary_seconds, normalize_game, raw_identifier, to_millis, to_seconds, Mode};
use majsoul_ranks_store_sqlite::{InsertCap, SqliteGameStore};
use serde_json::Value;

pub const DEFAULT_API_BASE: &str = "https://5-data.amae-koromo.com/api/v2/pl4/games";
pub const API_BASE_ENV: &str = "MAJSOUL_RANKS_API_BASE";
pub const DEFAULT_USER_AGENT: &str = concat!("majsoul-ranks/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_PAUSE_CAP: Duration = Duration::from_secs(2);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ApiConfig {
    /// Defaults, with the base URL taken from `MAJSOUL_RANKS_API_BASE` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var(API_BASE_ENV) {
            let base = base.trim().trim_end_matches('/');
            if !base.is_empty() {
                config.base_url = base.to_string();
            }
        }
        config
    }
}

/// One page request; the window runs backwards from `end_ms` to `start_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub end_ms: i64,
    pub start_ms: i64,
    pub limit: usize,
    pub mode: Mode,
}

impl PageRequest {
    #[must_use]
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{base_url}/{}/{}?limit={}&descending=true&mode={}",
            self.end_ms, self.start_ms, self.limit, self.mode
        )
    }
}

pub trait GameSource {
    fn source_name(&self) -> &'static str;

    /// Returns the decoded JSON body of one page.
    #[allow(clippy::missing_errors_doc)]
    fn fetch_page(&self, request: &PageRequest) -> Result<Value>;
}

#[derive(Debug)]
pub struct HttpGameSource {
    config: ApiConfig,
    agent: ureq::Agent,
}

impl HttpGameSource {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build();
        Self { config, agent }
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }
}

impl GameSource for HttpGameSource {
    fn source_name(&self) -> &'static str {
        "amae_koromo"
    }

    fn fetch_page(&self, request: &PageRequest) -> Result<Value> {
        let url = request.url(&self.config.base_url);
        tracing::debug!(%url, "requesting page");

        match self
            .agent
            .get(&url)
            .set("accept", "application/json")
            .call()
        {
            Ok(response) => response
                .into_json::<Value>()
                .with_context(|| format!("invalid json body from {url}")),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!("http status {code} from {url}")),
            Err(ureq::Error::Transport(err)) => Err(anyhow!("http transport failure: {err}")),
        }
    }
}

/// Parameters of one backward pagination run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub start_ms: i64,
    pub end_ms: i64,
    pub mode: Mode,
    pub limit: usize,
    /// Stop after this many new rows ("recent N").
    pub target: Option<usize>,
    pub max_pages: Option<usize>,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ReachedStart,
    EmptyPage,
    NoBoundary,
    TargetReached,
    MaxPages,
    RequestFailed,
    Interrupted,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReachedStart => "reached_start",
            Self::EmptyPage => "empty_page",
            Self::NoBoundary => "no_boundary",
            Self::TargetReached => "target_reached",
            Self::MaxPages => "max_pages",
            Self::RequestFailed => "request_failed",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub pages: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed: usize,
    pub stop: StopReason,
}

/// Walks the window from newest to oldest, inserting one page at a time.
pub struct PaginationEngine<'a, S: GameSource> {
    source: &'a S,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a, S: GameSource> PaginationEngine<'a, S> {
    #[must_use]
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            interrupt: None,
        }
    }

    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Runs until one of the [`StopReason`]s applies.
    ///
    /// # Errors
    /// Only store failures (a failed commit) are errors; network trouble ends
    /// the run with [`StopReason::RequestFailed`].
    pub fn run(&self, store: &mut SqliteGameStore, plan: &FetchPlan) -> Result<FetchReport> {
        let mut report = FetchReport {
            pages: 0,
            inserted: 0,
            duplicates: 0,
            rejected: 0,
            failed: 0,
            stop: StopReason::ReachedStart,
        };
        let mut cap = plan.target.map(InsertCap::new);
        let mut cursor = plan.end_ms;

        tracing::info!(
            source = self.source.source_name(),
            mode = %plan.mode,
            start_ms = plan.start_ms,
            end_ms = plan.end_ms,
            target = ?plan.target,
            "starting fetch"
        );

        while cursor >= plan.start_ms {
            let mut limit = plan.limit;
            if let Some(cap) = &cap {
                if cap.is_reached() {
                    report.stop = StopReason::TargetReached;
                    return Ok(report);
                }
                limit = limit.min(cap.remaining());
            }

            let request = PageRequest {
                end_ms: cursor,
                start_ms: plan.start_ms,
                limit,
                mode: plan.mode,
            };
            let Some(body) = self.fetch_with_retry(&request, plan.delay) else {
                report.stop = if self.interrupted() {
                    StopReason::Interrupted
                } else {
                    StopReason::RequestFailed
                };
                return Ok(report);
            };

            if self.interrupted() {
                tracing::warn!(cursor_ms = cursor, "interrupted, discarding in-flight page");
                report.stop = StopReason::Interrupted;
                return Ok(report);
            }

            let items = match body.as_array() {
                Some(items) if !items.is_empty() => items,
                _ => {
                    tracing::info!(cursor_ms = cursor, "no more records");
                    report.stop = StopReason::EmptyPage;
                    return Ok(report);
                }
            };

            let batch: Vec<_> = items
                .iter()
                .map(|item| {
                    normalize_game(item, Some(plan.mode)).inspect_err(|reason| {
                        tracing::debug!(id = ?raw_identifier(item), %reason, "rejected record");
                    })
                })
                .collect();
            let inserted = store.insert_batch(&batch, cap.as_mut())?;

            report.pages += 1;
            report.inserted += inserted.inserted;
            report.duplicates += inserted.duplicates;
            report.rejected += inserted.rejected;
            report.failed += inserted.failed;
            tracing::info!(
                page = report.pages,
                cursor_ms = cursor,
                records = items.len(),
                inserted = inserted.inserted,
                skipped = inserted.skipped(),
                total_inserted = report.inserted,
                "page stored"
            );

            if inserted.reached_cap {
                report.stop = StopReason::TargetReached;
                return Ok(report);
            }

            let Some(oldest) = items.iter().filter_map(boundary_seconds).min() else {
                tracing::warn!(cursor_ms = cursor, "page has no usable timestamps");
                report.stop = StopReason::NoBoundary;
                return Ok(report);
            };

            let next = next_cursor(cursor, oldest);
            tracing::debug!(oldest, next_cursor_ms = next, "advancing cursor");
            if next < plan.start_ms {
                report.stop = StopReason::ReachedStart;
                return Ok(report);
            }
            if plan.max_pages.is_some_and(|max| report.pages >= max) {
                report.stop = StopReason::MaxPages;
                return Ok(report);
            }

            cursor = next;
            if !self.pause(plan.delay) {
                report.stop = StopReason::Interrupted;
                return Ok(report);
            }
        }

        Ok(report)
    }

    fn fetch_with_retry(&self, request: &PageRequest, delay: Duration) -> Option<Value> {
        match self.source.fetch_page(request) {
            Ok(body) => return Some(body),
            Err(err) => {
                tracing::warn!(cursor_ms = request.end_ms, error = %format!("{err:#}"), "request failed, retrying once");
            }
        }

        if !self.pause(delay.min(RETRY_PAUSE_CAP)) {
            return None;
        }

        match self.source.fetch_page(request) {
            Ok(body) => Some(body),
            Err(err) => {
                tracing::error!(cursor_ms = request.end_ms, error = %format!("{err:#}"), "retry failed, stopping");
                None
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Sleeps for `duration`; returns false if interrupted first.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Next upper bound after a page whose oldest boundary is `oldest`.
///
/// Always strictly below `cursor`, even when every record on the page shares
/// the cursor's second.
#[must_use]
pub fn next_cursor(cursor: i64, oldest: i64) -> i64 {
    let mut next = to_millis(oldest).saturating_sub(1);
    if to_seconds(next) >= to_seconds(cursor) {
        next = to_seconds(cursor).saturating_mul(1000).saturating_sub(1000);
        if next >= cursor {
            next = cursor.saturating_sub(1000);
        }
    }
    next
}
