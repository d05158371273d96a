//! Point-spread snapshot exporter for The Odds API.
//!
//! Fetches spreads for one sport, either the current board or a historical
//! backfill over a date range, and writes each snapshot as a dated CSV:
//! one row per game, one column block per bookmaker. The bookmaker set
//! varies day to day, so the column layout is discovered per snapshot and
//! ordered deterministically.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::env;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The Odds API event structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiEvent {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Market {
    pub key: String,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Outcome {
    pub name: String,
    pub point: Option<f64>,
    pub price: Option<f64>,
}

/// Failure taxonomy for one fetch-flatten-write cycle.
///
/// In backfill mode everything except `MalformedGame` and `Io` is logged
/// and the date is skipped; in single-shot mode every variant aborts.
#[derive(Debug, Error)]
pub enum OddsError {
    #[error("odds request failed (status {status}): {body}")]
    RequestFailed {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("failed to reach odds endpoint: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response body is not valid odds JSON: {0}")]
    DecodeFailed(#[from] serde_json::Error),

    #[error("expected a JSON array of events, got {0}")]
    UnexpectedShape(String),

    #[error("malformed event {0}: missing id or team name")]
    MalformedGame(String),

    #[error("failed to write snapshot file: {0}")]
    Io(#[from] std::io::Error),
}

impl OddsError {
    /// True for errors that must abort a backfill instead of skipping the date.
    fn is_fatal(&self) -> bool {
        matches!(self, OddsError::MalformedGame(_) | OddsError::Io(_))
    }
}

/// Whether output captures the home side only or both sides of the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidePolicy {
    HomeOnly,
    HomeAndAway,
}

impl SidePolicy {
    fn cells_per_book(self) -> usize {
        match self {
            SidePolicy::HomeOnly => 2,
            SidePolicy::HomeAndAway => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One query against the current-odds endpoint, then exit.
    Current,
    /// One query per calendar day against the historical endpoint.
    Backfill { start: NaiveDate, end: NaiveDate },
}

/// Configuration
#[derive(Clone)]
pub struct Config {
    pub odds_api_key: String,
    pub sport_key: String,
    pub regions: String,
    pub markets: String,
    pub odds_format: String,
    pub side_policy: SidePolicy,
    pub output_dir: String,
    pub mode: RunMode,
    /// Fixed snapshot hour for backfill instants (22:00 UTC is 4pm Central).
    pub snapshot_hour_utc: u32,
    pub throttle_seconds: u64,
    /// Manually triggered run; only selects the filename suffix.
    pub manual_run: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // API key
        let odds_api_key = match env::var("THE_ODDS_API_KEY") {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            Ok(_) => return Err(anyhow!("THE_ODDS_API_KEY is set but empty")),
            Err(_) => return Err(anyhow!("THE_ODDS_API_KEY is not set")),
        };

        // Prevent accidental use of sample/placeholder keys
        let key_lower = odds_api_key.to_lowercase();
        if key_lower.contains("change_me")
            || key_lower.contains("your_")
            || key_lower.starts_with("sample")
        {
            return Err(anyhow!(
                "THE_ODDS_API_KEY appears to be a placeholder value; replace with your real key"
            ));
        }

        let side_policy = match env::var("SIDE_POLICY")
            .unwrap_or_else(|_| "both".to_string())
            .to_lowercase()
            .as_str()
        {
            "home" => SidePolicy::HomeOnly,
            "both" => SidePolicy::HomeAndAway,
            other => {
                return Err(anyhow!(
                    "SIDE_POLICY must be \"home\" or \"both\", got {:?}",
                    other
                ))
            }
        };

        let snapshot_hour_utc: u32 = env::var("SNAPSHOT_HOUR_UTC")
            .unwrap_or_else(|_| "22".to_string())
            .parse()
            .context("SNAPSHOT_HOUR_UTC must be an hour between 0 and 23")?;
        if snapshot_hour_utc > 23 {
            return Err(anyhow!(
                "SNAPSHOT_HOUR_UTC must be between 0 and 23, got {}",
                snapshot_hour_utc
            ));
        }

        let historical = env::var("HISTORICAL")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";
        let mode = if historical {
            let start = parse_env_date("START_DATE")?;
            let end = parse_env_date("END_DATE")?;
            if end < start {
                return Err(anyhow!("END_DATE {} is before START_DATE {}", end, start));
            }
            RunMode::Backfill { start, end }
        } else {
            RunMode::Current
        };

        Ok(Self {
            odds_api_key,
            sport_key: env::var("SPORT_KEY").unwrap_or_else(|_| "basketball_nba".to_string()),
            regions: env::var("REGIONS").unwrap_or_else(|_| "us".to_string()),
            markets: env::var("MARKETS").unwrap_or_else(|_| "spreads".to_string()),
            odds_format: env::var("ODDS_FORMAT").unwrap_or_else(|_| "american".to_string()),
            side_policy,
            output_dir: env::var("OUTPUT_DIR").unwrap_or_else(|_| "data".to_string()),
            mode,
            snapshot_hour_utc,
            throttle_seconds: env::var("THROTTLE_SECONDS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            manual_run: env::var("MANUAL_RUN")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
        })
    }

    /// Short sport label for filenames ("basketball_nba" -> "nba").
    fn sport_label(&self) -> &str {
        self.sport_key.rsplit('_').next().unwrap_or(&self.sport_key)
    }
}

fn parse_env_date(name: &str) -> Result<NaiveDate> {
    let raw = env::var(name).map_err(|_| anyhow!("{} is required when HISTORICAL=true", name))?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("{} must be a YYYY-MM-DD date, got {:?}", name, raw))
}

/// Canonical bookmaker identity used for column naming: the display title,
/// falling back to the key when the feed omits the title.
fn book_identity(book: &Bookmaker) -> &str {
    if !book.title.is_empty() {
        &book.title
    } else {
        &book.key
    }
}

/// Map a bookmaker identity to a column-safe token.
fn column_token(identity: &str) -> String {
    identity
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

#[derive(Debug, Clone)]
struct BookColumns {
    identity: String,
    /// Index of this bookmaker's first cell within a row's quote cells.
    offset: usize,
}

/// Column layout derived from one snapshot: built once, reused for every row.
#[derive(Debug, Clone)]
pub struct TableSchema {
    policy: SidePolicy,
    header: Vec<String>,
    books: Vec<BookColumns>,
}

impl TableSchema {
    fn quote_cell_count(&self) -> usize {
        self.books.len() * self.policy.cells_per_book()
    }
}

/// Discovery pass: collect the distinct bookmaker identities present
/// anywhere in the snapshot, order them lexicographically, and lay out the
/// header. Identities that sanitize to an already-taken token get a numeric
/// suffix so two distinct bookmakers never share a column block.
pub fn discover_schema(events: &[OddsApiEvent], policy: SidePolicy) -> TableSchema {
    let mut identities: BTreeSet<&str> = BTreeSet::new();
    for event in events {
        for book in &event.bookmakers {
            let identity = book_identity(book);
            if !identity.is_empty() {
                identities.insert(identity);
            }
        }
    }

    let mut header: Vec<String> = ["date", "game_id", "home_team", "away_team"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut books = Vec::with_capacity(identities.len());
    let mut taken: HashSet<String> = HashSet::new();

    for identity in identities {
        let base = column_token(identity);
        let mut token = base.clone();
        let mut n = 2;
        while !taken.insert(token.clone()) {
            token = format!("{}_{}", base, n);
            n += 1;
        }
        if token != base {
            warn!(
                "Bookmaker {:?} sanitizes to an already-used column token; using {:?}",
                identity, token
            );
        }

        match policy {
            SidePolicy::HomeOnly => {
                header.push(format!("{}_point", token));
                header.push(format!("{}_price", token));
            }
            SidePolicy::HomeAndAway => {
                header.push(format!("{}_home_point", token));
                header.push(format!("{}_home_price", token));
                header.push(format!("{}_away_point", token));
                header.push(format!("{}_away_price", token));
            }
        }

        let offset = books.len() * policy.cells_per_book();
        books.push(BookColumns {
            identity: identity.to_string(),
            offset,
        });
    }

    TableSchema {
        policy,
        header,
        books,
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    date: String,
    game_id: String,
    home_team: String,
    away_team: String,
    /// One cell per schema quote column; `None` is the missing marker and
    /// becomes an empty field only when the CSV is rendered.
    cells: Vec<Option<f64>>,
}

#[derive(Debug, Clone)]
pub struct SnapshotTable {
    header: Vec<String>,
    rows: Vec<SnapshotRow>,
}

impl SnapshotTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        push_csv_row(&mut out, self.header.iter().map(|s| s.as_str()));
        for row in &self.rows {
            let mut fields = vec![
                row.date.clone(),
                row.game_id.clone(),
                row.home_team.clone(),
                row.away_team.clone(),
            ];
            fields.extend(row.cells.iter().map(|c| format_cell(*c)));
            push_csv_row(&mut out, fields.iter().map(|s| s.as_str()));
        }
        out
    }
}

/// Flatten one snapshot against a schema already discovered from it.
/// Every row gets the full cell block for every bookmaker in the schema;
/// bookmakers that did not quote a game contribute only missing markers.
pub fn flatten_snapshot(
    date_label: &str,
    events: &[OddsApiEvent],
    schema: &TableSchema,
) -> Result<SnapshotTable, OddsError> {
    let offsets: HashMap<&str, usize> = schema
        .books
        .iter()
        .map(|b| (b.identity.as_str(), b.offset))
        .collect();

    let mut rows = Vec::with_capacity(events.len());
    for event in events {
        if event.id.is_empty() || event.home_team.is_empty() || event.away_team.is_empty() {
            let label = if event.id.is_empty() {
                format!("{:?} vs {:?}", event.home_team, event.away_team)
            } else {
                event.id.clone()
            };
            return Err(OddsError::MalformedGame(label));
        }

        let mut cells: Vec<Option<f64>> = vec![None; schema.quote_cell_count()];
        for book in &event.bookmakers {
            let Some(&offset) = offsets.get(book_identity(book)) else {
                continue;
            };
            let Some(market) = book.markets.iter().find(|m| m.key == "spreads") else {
                continue;
            };
            for outcome in &market.outcomes {
                if outcome.name == event.home_team {
                    cells[offset] = outcome.point;
                    cells[offset + 1] = outcome.price;
                } else if schema.policy == SidePolicy::HomeAndAway
                    && outcome.name == event.away_team
                {
                    cells[offset + 2] = outcome.point;
                    cells[offset + 3] = outcome.price;
                }
                // Outcomes matching neither team are ignored.
            }
        }

        rows.push(SnapshotRow {
            date: date_label.to_string(),
            game_id: event.id.clone(),
            home_team: event.home_team.clone(),
            away_team: event.away_team.clone(),
            cells,
        });
    }

    Ok(SnapshotTable {
        header: schema.header.clone(),
        rows,
    })
}

/// Render a numeric cell; integral values print without a trailing ".0".
fn format_cell(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{}", v),
    }
}

/// Append one CSV row, quoting only fields that need it.
fn push_csv_row<'a, I>(out: &mut String, fields: I)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        } else {
            first = false;
        }
        if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
        {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

/// Decode a response body into the event list. The current endpoint returns
/// a bare array; the historical endpoint wraps it in an object whose `data`
/// field holds the array. Anything else is an unexpected shape.
fn decode_snapshot(body: &str) -> Result<Vec<OddsApiEvent>, OddsError> {
    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(OddsError::UnexpectedShape(
                    "an object without a data array".to_string(),
                ))
            }
        },
        other => return Err(OddsError::UnexpectedShape(json_kind(&other).to_string())),
    };
    Ok(serde_json::from_value(Value::Array(items))?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One line of the body for error messages and debug logs.
fn snippet(body: &str) -> String {
    body.trim()
        .replace('\n', " ")
        .replace('\r', " ")
        .chars()
        .take(220)
        .collect()
}

fn snapshot_instant(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, 0, 0)
        .expect("snapshot hour validated at startup")
        .and_utc()
}

/// Inclusive, lazy, forward-only calendar range.
fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

/// Snapshot exporter service
pub struct SnapshotService {
    config: Config,
    http_client: reqwest::Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl SnapshotService {
    pub fn new(config: Config) -> Result<Self> {
        // Rate limiter: stay inside The Odds API per-minute allowance
        let rate_limiter = RateLimiter::direct(Quota::per_minute(NonZeroU32::new(30).unwrap()));

        // HTTP client with timeouts
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            http_client,
            rate_limiter,
        })
    }

    /// Fetch the current odds board.
    pub async fn fetch_current(&self) -> Result<Vec<OddsApiEvent>, OddsError> {
        let url = format!(
            "https://api.the-odds-api.com/v4/sports/{}/odds",
            self.config.sport_key
        );

        self.request_events(
            &url,
            &[
                ("apiKey", self.config.odds_api_key.as_str()),
                ("regions", self.config.regions.as_str()),
                ("markets", self.config.markets.as_str()),
                ("oddsFormat", self.config.odds_format.as_str()),
            ],
        )
        .await
    }

    /// Fetch the board as it stood at a historical instant.
    pub async fn fetch_historical(
        &self,
        instant: DateTime<Utc>,
    ) -> Result<Vec<OddsApiEvent>, OddsError> {
        let url = format!(
            "https://api.the-odds-api.com/v4/historical/sports/{}/odds",
            self.config.sport_key
        );
        let date = instant.to_rfc3339_opts(SecondsFormat::Secs, true);

        self.request_events(
            &url,
            &[
                ("apiKey", self.config.odds_api_key.as_str()),
                ("regions", self.config.regions.as_str()),
                ("markets", self.config.markets.as_str()),
                ("date", date.as_str()),
            ],
        )
        .await
    }

    async fn request_events(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<OddsApiEvent>, OddsError> {
        // Wait for rate limit
        self.rate_limiter.until_ready().await;

        let response = self.http_client.get(url).query(query).send().await?;

        // Log API usage from headers
        if let Some(remaining) = response.headers().get("x-requests-remaining") {
            info!(
                "API requests remaining: {}",
                remaining.to_str().unwrap_or("?")
            );
        }

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(OddsError::RequestFailed {
                status,
                body: snippet(&body),
            });
        }

        debug!("Raw response ({} bytes): {}", body.len(), snippet(&body));

        decode_snapshot(&body)
    }

    /// Single-shot mode: fetch now, write one file, fail on any error.
    pub async fn run_once(&self) -> Result<PathBuf> {
        let events = self.fetch_current().await?;
        info!("Fetched {} events from The Odds API", events.len());

        let date_label = Utc::now().format("%Y-%m-%d").to_string();
        let schema = discover_schema(&events, self.config.side_policy);
        let table = flatten_snapshot(&date_label, &events, &schema)?;
        let path = self.write_table(&date_label, &table)?;

        println!("Saved {}", path.display());
        Ok(path)
    }

    /// Backfill mode: one snapshot per calendar day, skipping days whose
    /// fetch fails and pacing unconditionally between days.
    pub async fn run_backfill(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PathBuf>> {
        info!(
            "Backfilling {} through {} (snapshot hour {:02}:00 UTC)",
            start, end, self.config.snapshot_hour_utc
        );
        let pacing = Duration::from_secs(self.config.throttle_seconds);
        let mut written = Vec::new();

        for date in date_range(start, end) {
            match self.ingest_date(date).await {
                Ok(Some(path)) => {
                    println!("Saved {}", path.display());
                    written.push(path);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    return Err(e).with_context(|| format!("backfill aborted at {}", date));
                }
                Err(e) => warn!("[{}] skipped: {}", date, e),
            }

            // Pacing applies after every date, whatever the outcome.
            tokio::time::sleep(pacing).await;
        }

        info!("Backfill complete: {} file(s) written", written.len());
        Ok(written)
    }

    /// One fetch-flatten-write cycle for a historical date. Returns the
    /// written path, or `None` when the day had no odds.
    async fn ingest_date(&self, date: NaiveDate) -> Result<Option<PathBuf>, OddsError> {
        let instant = snapshot_instant(date, self.config.snapshot_hour_utc);
        info!(
            "Fetching historical odds for {}",
            instant.to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let events = self.fetch_historical(instant).await?;
        if events.is_empty() {
            info!("[{}] no odds available", date);
            return Ok(None);
        }

        let date_label = date.format("%Y-%m-%d").to_string();
        let schema = discover_schema(&events, self.config.side_policy);
        let table = flatten_snapshot(&date_label, &events, &schema)?;
        let path = self.write_table(&date_label, &table)?;
        Ok(Some(path))
    }

    fn write_table(&self, date_label: &str, table: &SnapshotTable) -> Result<PathBuf, OddsError> {
        fs::create_dir_all(&self.config.output_dir)?;

        let suffix = if self.config.manual_run { "_manual" } else { "" };
        let filename = format!(
            "{}_{}_{}{}.csv",
            self.config.sport_label(),
            self.config.markets,
            date_label,
            suffix
        );
        let path = Path::new(&self.config.output_dir).join(filename);
        fs::write(&path, table.to_csv())?;

        info!("Wrote {} row(s) to {}", table.row_count(), path.display());
        Ok(path)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("odds_snapshots=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env()?;
    let mode = config.mode;
    let service = SnapshotService::new(config)?;

    match mode {
        RunMode::Current => {
            service.run_once().await?;
        }
        RunMode::Backfill { start, end } => {
            service.run_backfill(start, end).await?;
        }
    }

    Ok(())
}
