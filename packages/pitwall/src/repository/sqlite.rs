//! SQLite repository.
//!
//! Timestamps are RFC 3339 text, dates `YYYY-MM-DD`, source lists JSON
//! arrays. Foreign keys are enforced by SQLite and also checked up front for
//! results, so a missing reference defers the row instead of failing the
//! whole batch.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{PersistBatch, Repository, UpsertReport};
use crate::error::{StorageError, StorageResult};
use crate::types::alias::CrossSourceAlias;
use crate::types::canonical::{
    CanonicalEntity, CanonicalKey, Competitor, Event, EventResult, KnownEntity, Team,
};
use crate::types::family::{EntityFamily, SourceId};
use crate::types::run::{FailureReason, RunCounts, RunOutcome, RunRecord, Trigger};

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.run_migrations().await?;
        Ok(repo)
    }

    /// In-memory database (for testing).
    ///
    /// Each SQLite connection to `:memory:` is its own database, so the pool
    /// holds exactly one connection and never recycles it.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.run_migrations().await?;
        Ok(repo)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS teams (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                nationality TEXT,
                base TEXT,
                power_unit TEXT,
                points REAL,
                standing INTEGER,
                wins INTEGER,
                championships INTEGER,
                sources TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS competitors (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                code TEXT,
                nationality TEXT,
                date_of_birth TEXT,
                number INTEGER,
                team_name TEXT,
                team_key TEXT,
                points REAL,
                standing INTEGER,
                wins INTEGER,
                podiums INTEGER,
                championships INTEGER,
                sources TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                season INTEGER NOT NULL,
                round INTEGER NOT NULL,
                circuit TEXT,
                country TEXT,
                date TEXT,
                laps INTEGER,
                sources TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_season ON events(season, round);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_results (
                key TEXT PRIMARY KEY,
                event_key TEXT NOT NULL REFERENCES events(key),
                competitor_key TEXT NOT NULL REFERENCES competitors(key),
                team_key TEXT REFERENCES teams(key),
                position INTEGER,
                number INTEGER,
                laps INTEGER,
                time TEXT,
                status TEXT,
                points REAL,
                sources TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_event_results_event ON event_results(event_key);
            CREATE INDEX IF NOT EXISTS idx_event_results_competitor ON event_results(competitor_key);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cross_source_aliases (
                family TEXT NOT NULL,
                source_id TEXT NOT NULL,
                raw_name TEXT NOT NULL,
                canonical_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (family, source_id, raw_name)
            );

            CREATE TABLE IF NOT EXISTS run_history (
                run_id TEXT PRIMARY KEY,
                family TEXT NOT NULL,
                trigger TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                outcome TEXT NOT NULL,
                fetched INTEGER NOT NULL DEFAULT 0,
                extracted INTEGER NOT NULL DEFAULT 0,
                normalized INTEGER NOT NULL DEFAULT 0,
                persisted INTEGER NOT NULL DEFAULT 0,
                errored INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0,
                deferred INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_run_history_family ON run_history(family, started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Value conversion
// =============================================================================

fn opt_int(value: Option<u32>) -> Option<i64> {
    value.map(i64::from)
}

fn to_u32(value: Option<i64>, column: &str) -> StorageResult<Option<u32>> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| StorageError::Corrupt(format!("{} out of range: {}", column, v)))
        })
        .transpose()
}

fn to_usize(value: i64, column: &str) -> StorageResult<usize> {
    usize::try_from(value).map_err(|_| StorageError::Corrupt(format!("{} out of range: {}", column, value)))
}

fn sources_json(sources: &[SourceId]) -> StorageResult<String> {
    serde_json::to_string(sources).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn parse_sources(json: &str) -> StorageResult<Vec<SourceId>> {
    serde_json::from_str(json).map_err(|e| StorageError::Corrupt(format!("invalid sources JSON: {}", e)))
}

fn parse_time(text: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("invalid timestamp {:?}: {}", text, e)))
}

fn parse_date(text: Option<String>) -> StorageResult<Option<NaiveDate>> {
    text.map(|t| {
        NaiveDate::parse_from_str(&t, "%Y-%m-%d")
            .map_err(|e| StorageError::Corrupt(format!("invalid date {:?}: {}", t, e)))
    })
    .transpose()
}

fn parse_family(text: &str) -> StorageResult<EntityFamily> {
    text.parse()
        .map_err(|_| StorageError::Corrupt(format!("unknown family: {}", text)))
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, FromRow)]
struct CompetitorRow {
    key: String,
    name: String,
    code: Option<String>,
    nationality: Option<String>,
    date_of_birth: Option<String>,
    number: Option<i64>,
    team_name: Option<String>,
    team_key: Option<String>,
    points: Option<f64>,
    standing: Option<i64>,
    wins: Option<i64>,
    podiums: Option<i64>,
    championships: Option<i64>,
    sources: String,
}

impl CompetitorRow {
    fn into_entity(self) -> StorageResult<CanonicalEntity> {
        Ok(CanonicalEntity::Competitor(Competitor {
            key: CanonicalKey::new(self.key),
            name: self.name,
            code: self.code,
            nationality: self.nationality,
            date_of_birth: parse_date(self.date_of_birth)?,
            number: to_u32(self.number, "number")?,
            team_name: self.team_name,
            team_key: self.team_key.map(CanonicalKey::new),
            points: self.points,
            standing: to_u32(self.standing, "standing")?,
            wins: to_u32(self.wins, "wins")?,
            podiums: to_u32(self.podiums, "podiums")?,
            championships: to_u32(self.championships, "championships")?,
            sources: parse_sources(&self.sources)?,
        }))
    }
}

#[derive(Debug, FromRow)]
struct TeamRow {
    key: String,
    name: String,
    nationality: Option<String>,
    base: Option<String>,
    power_unit: Option<String>,
    points: Option<f64>,
    standing: Option<i64>,
    wins: Option<i64>,
    championships: Option<i64>,
    sources: String,
}

impl TeamRow {
    fn into_entity(self) -> StorageResult<CanonicalEntity> {
        Ok(CanonicalEntity::Team(Team {
            key: CanonicalKey::new(self.key),
            name: self.name,
            nationality: self.nationality,
            base: self.base,
            power_unit: self.power_unit,
            points: self.points,
            standing: to_u32(self.standing, "standing")?,
            wins: to_u32(self.wins, "wins")?,
            championships: to_u32(self.championships, "championships")?,
            sources: parse_sources(&self.sources)?,
        }))
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    key: String,
    name: String,
    season: i64,
    round: i64,
    circuit: Option<String>,
    country: Option<String>,
    date: Option<String>,
    laps: Option<i64>,
    sources: String,
}

impl EventRow {
    fn into_entity(self) -> StorageResult<CanonicalEntity> {
        let season = i32::try_from(self.season)
            .map_err(|_| StorageError::Corrupt(format!("season out of range: {}", self.season)))?;
        Ok(CanonicalEntity::Event(Event {
            key: CanonicalKey::new(self.key),
            name: self.name,
            season,
            round: to_u32(Some(self.round), "round")?.unwrap_or_default(),
            circuit: self.circuit,
            country: self.country,
            date: parse_date(self.date)?,
            laps: to_u32(self.laps, "laps")?,
            sources: parse_sources(&self.sources)?,
        }))
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    key: String,
    event_key: String,
    competitor_key: String,
    team_key: Option<String>,
    position: Option<i64>,
    number: Option<i64>,
    laps: Option<i64>,
    time: Option<String>,
    status: Option<String>,
    points: Option<f64>,
    sources: String,
}

impl ResultRow {
    fn into_entity(self) -> StorageResult<CanonicalEntity> {
        Ok(CanonicalEntity::Result(EventResult {
            key: CanonicalKey::new(self.key),
            event_key: CanonicalKey::new(self.event_key),
            competitor_key: CanonicalKey::new(self.competitor_key),
            team_key: self.team_key.map(CanonicalKey::new),
            position: to_u32(self.position, "position")?,
            number: to_u32(self.number, "number")?,
            laps: to_u32(self.laps, "laps")?,
            time: self.time,
            status: self.status,
            points: self.points,
            sources: parse_sources(&self.sources)?,
        }))
    }
}

#[derive(Debug, FromRow)]
struct AliasRow {
    source_id: String,
    raw_name: String,
    canonical_key: String,
    created_at: String,
}

#[derive(Debug, FromRow)]
struct RunRow {
    run_id: String,
    family: String,
    trigger: String,
    started_at: String,
    finished_at: Option<String>,
    outcome: String,
    fetched: i64,
    extracted: i64,
    normalized: i64,
    persisted: i64,
    errored: i64,
    rejected: i64,
    deferred: i64,
}

impl RunRow {
    fn into_record(self) -> StorageResult<RunRecord> {
        Ok(RunRecord {
            run_id: Uuid::parse_str(&self.run_id)
                .map_err(|e| StorageError::Corrupt(format!("invalid run id: {}", e)))?,
            family: parse_family(&self.family)?,
            trigger: self.trigger.parse::<Trigger>()?,
            started_at: parse_time(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            outcome: self.outcome.parse::<RunOutcome>()?,
            counts: RunCounts {
                fetched: to_usize(self.fetched, "fetched")?,
                extracted: to_usize(self.extracted, "extracted")?,
                normalized: to_usize(self.normalized, "normalized")?,
                persisted: to_usize(self.persisted, "persisted")?,
                errored: to_usize(self.errored, "errored")?,
                rejected: to_usize(self.rejected, "rejected")?,
                deferred: to_usize(self.deferred, "deferred")?,
            },
        })
    }
}

const RUN_COLUMNS: &str = "run_id, family, trigger, started_at, finished_at, outcome, \
     fetched, extracted, normalized, persisted, errored, rejected, deferred";

// =============================================================================
// Writes
// =============================================================================

/// Insert an alias unless the pair is already mapped. An existing mapping to
/// another key means the batch was resolved against stale aliases.
async fn insert_alias(conn: &mut SqliteConnection, alias: &CrossSourceAlias) -> StorageResult<()> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO cross_source_aliases (family, source_id, raw_name, canonical_key, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(family, source_id, raw_name) DO NOTHING
        "#,
    )
    .bind(alias.family.as_str())
    .bind(alias.source.as_str())
    .bind(&alias.raw_name)
    .bind(alias.canonical_key.as_str())
    .bind(alias.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted > 0 {
        return Ok(());
    }

    let existing: String = sqlx::query_scalar(
        "SELECT canonical_key FROM cross_source_aliases WHERE family = ? AND source_id = ? AND raw_name = ?",
    )
    .bind(alias.family.as_str())
    .bind(alias.source.as_str())
    .bind(&alias.raw_name)
    .fetch_one(&mut *conn)
    .await?;

    if existing != alias.canonical_key.as_str() {
        return Err(StorageError::AliasConflict {
            family: alias.family,
            source_id: alias.source.clone(),
            raw_name: alias.raw_name.clone(),
            existing: CanonicalKey::new(existing),
            proposed: alias.canonical_key.clone(),
        });
    }
    Ok(())
}

async fn upsert_team(conn: &mut SqliteConnection, team: &Team, now: &str) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO teams (key, name, nationality, base, power_unit, points, standing, wins, championships, sources, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            nationality = excluded.nationality,
            base = excluded.base,
            power_unit = excluded.power_unit,
            points = excluded.points,
            standing = excluded.standing,
            wins = excluded.wins,
            championships = excluded.championships,
            sources = excluded.sources,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(team.key.as_str())
    .bind(&team.name)
    .bind(&team.nationality)
    .bind(&team.base)
    .bind(&team.power_unit)
    .bind(team.points)
    .bind(opt_int(team.standing))
    .bind(opt_int(team.wins))
    .bind(opt_int(team.championships))
    .bind(sources_json(&team.sources)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_competitor(
    conn: &mut SqliteConnection,
    competitor: &Competitor,
    now: &str,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO competitors (key, name, code, nationality, date_of_birth, number, team_name, team_key,
                                 points, standing, wins, podiums, championships, sources, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            code = excluded.code,
            nationality = excluded.nationality,
            date_of_birth = excluded.date_of_birth,
            number = excluded.number,
            team_name = excluded.team_name,
            team_key = excluded.team_key,
            points = excluded.points,
            standing = excluded.standing,
            wins = excluded.wins,
            podiums = excluded.podiums,
            championships = excluded.championships,
            sources = excluded.sources,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(competitor.key.as_str())
    .bind(&competitor.name)
    .bind(&competitor.code)
    .bind(&competitor.nationality)
    .bind(competitor.date_of_birth.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(opt_int(competitor.number))
    .bind(&competitor.team_name)
    .bind(competitor.team_key.as_ref().map(|k| k.as_str().to_string()))
    .bind(competitor.points)
    .bind(opt_int(competitor.standing))
    .bind(opt_int(competitor.wins))
    .bind(opt_int(competitor.podiums))
    .bind(opt_int(competitor.championships))
    .bind(sources_json(&competitor.sources)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_event(conn: &mut SqliteConnection, event: &Event, now: &str) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO events (key, name, season, round, circuit, country, date, laps, sources, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            season = excluded.season,
            round = excluded.round,
            circuit = excluded.circuit,
            country = excluded.country,
            date = excluded.date,
            laps = excluded.laps,
            sources = excluded.sources,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(event.key.as_str())
    .bind(&event.name)
    .bind(i64::from(event.season))
    .bind(i64::from(event.round))
    .bind(&event.circuit)
    .bind(&event.country)
    .bind(event.date.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(opt_int(event.laps))
    .bind(sources_json(&event.sources)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_result(conn: &mut SqliteConnection, result: &EventResult, now: &str) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO event_results (key, event_key, competitor_key, team_key, position, number, laps,
                                   time, status, points, sources, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            event_key = excluded.event_key,
            competitor_key = excluded.competitor_key,
            team_key = excluded.team_key,
            position = excluded.position,
            number = excluded.number,
            laps = excluded.laps,
            time = excluded.time,
            status = excluded.status,
            points = excluded.points,
            sources = excluded.sources,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(result.key.as_str())
    .bind(result.event_key.as_str())
    .bind(result.competitor_key.as_str())
    .bind(result.team_key.as_ref().map(|k| k.as_str().to_string()))
    .bind(opt_int(result.position))
    .bind(opt_int(result.number))
    .bind(opt_int(result.laps))
    .bind(&result.time)
    .bind(&result.status)
    .bind(result.points)
    .bind(sources_json(&result.sources)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn exists(conn: &mut SqliteConnection, family: EntityFamily, key: &CanonicalKey) -> StorageResult<bool> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE key = ?", family.table());
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(key.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

/// Whether every row a result points at is already stored.
async fn references_resolve(conn: &mut SqliteConnection, result: &EventResult) -> StorageResult<bool> {
    if !exists(conn, EntityFamily::Events, &result.event_key).await? {
        return Ok(false);
    }
    if !exists(conn, EntityFamily::Competitors, &result.competitor_key).await? {
        return Ok(false);
    }
    match &result.team_key {
        Some(team) => exists(conn, EntityFamily::Teams, team).await,
        None => Ok(true),
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn upsert(&self, batch: &PersistBatch) -> StorageResult<UpsertReport> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();

        for record in &batch.records {
            if record.family() != batch.family {
                // dropping `tx` rolls back
                return Err(StorageError::Corrupt(format!(
                    "{} record {} in a {} batch",
                    record.family(),
                    record.key(),
                    batch.family
                )));
            }

            match record {
                CanonicalEntity::Team(team) => upsert_team(&mut tx, team, &now).await?,
                CanonicalEntity::Competitor(c) => upsert_competitor(&mut tx, c, &now).await?,
                CanonicalEntity::Event(event) => upsert_event(&mut tx, event, &now).await?,
                CanonicalEntity::Result(result) => {
                    if !references_resolve(&mut tx, result).await? {
                        report.deferred.push(record.clone());
                        continue;
                    }
                    upsert_result(&mut tx, result, &now).await?
                }
            }
            report.persisted += 1;
        }

        for alias in &batch.aliases {
            insert_alias(&mut tx, alias).await?;
        }

        tx.commit().await?;
        debug!(
            family = %batch.family,
            persisted = report.persisted,
            deferred = report.deferred.len(),
            aliases = batch.aliases.len(),
            "Batch committed"
        );
        Ok(report)
    }

    async fn begin_run(&self, run: &RunRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO run_history (run_id, family, trigger, started_at, finished_at, outcome)
            VALUES (?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.family.as_str())
        .bind(run.trigger.as_str())
        .bind(run.started_at.to_rfc3339())
        .bind(RunOutcome::Running.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> StorageResult<()> {
        let finished_at = run.finished_at.unwrap_or_else(Utc::now);
        let c = &run.counts;
        let result = sqlx::query(
            r#"
            UPDATE run_history SET
                finished_at = ?, outcome = ?,
                fetched = ?, extracted = ?, normalized = ?, persisted = ?,
                errored = ?, rejected = ?, deferred = ?
            WHERE run_id = ? AND finished_at IS NULL
            "#,
        )
        .bind(finished_at.to_rfc3339())
        .bind(run.outcome.to_string())
        .bind(c.fetched as i64)
        .bind(c.extracted as i64)
        .bind(c.normalized as i64)
        .bind(c.persisted as i64)
        .bind(c.errored as i64)
        .bind(c.rejected as i64)
        .bind(c.deferred as i64)
        .bind(run.run_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_history WHERE run_id = ?")
            .bind(run.run_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        if known > 0 {
            Err(StorageError::AlreadyFinalized { run_id: run.run_id })
        } else {
            Err(StorageError::UnknownRun { run_id: run.run_id })
        }
    }

    async fn get_aliases(&self, family: EntityFamily) -> StorageResult<Vec<CrossSourceAlias>> {
        let rows = sqlx::query_as::<_, AliasRow>(
            r#"
            SELECT source_id, raw_name, canonical_key, created_at
            FROM cross_source_aliases
            WHERE family = ?
            ORDER BY source_id, raw_name
            "#,
        )
        .bind(family.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(CrossSourceAlias {
                    family,
                    source: SourceId::new(row.source_id),
                    raw_name: row.raw_name,
                    canonical_key: CanonicalKey::new(row.canonical_key),
                    created_at: parse_time(&row.created_at)?,
                })
            })
            .collect()
    }

    async fn known_entities(&self, family: EntityFamily) -> StorageResult<Vec<KnownEntity>> {
        let sql = match family {
            EntityFamily::Events => "SELECT key, CAST(season AS TEXT) || ' ' || name FROM events ORDER BY key",
            EntityFamily::Results => "SELECT key, key FROM event_results ORDER BY key",
            EntityFamily::Competitors => "SELECT key, name FROM competitors ORDER BY key",
            EntityFamily::Teams => "SELECT key, name FROM teams ORDER BY key",
        };
        let rows: Vec<(String, String)> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(key, name)| KnownEntity::new(CanonicalKey::new(key), name))
            .collect())
    }

    async fn get(
        &self,
        family: EntityFamily,
        key: &CanonicalKey,
    ) -> StorageResult<Option<CanonicalEntity>> {
        let entity = match family {
            EntityFamily::Competitors => sqlx::query_as::<_, CompetitorRow>(
                "SELECT key, name, code, nationality, date_of_birth, number, team_name, team_key, \
                 points, standing, wins, podiums, championships, sources FROM competitors WHERE key = ?",
            )
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(CompetitorRow::into_entity),
            EntityFamily::Teams => sqlx::query_as::<_, TeamRow>(
                "SELECT key, name, nationality, base, power_unit, points, standing, wins, \
                 championships, sources FROM teams WHERE key = ?",
            )
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(TeamRow::into_entity),
            EntityFamily::Events => sqlx::query_as::<_, EventRow>(
                "SELECT key, name, season, round, circuit, country, date, laps, sources \
                 FROM events WHERE key = ?",
            )
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(EventRow::into_entity),
            EntityFamily::Results => sqlx::query_as::<_, ResultRow>(
                "SELECT key, event_key, competitor_key, team_key, position, number, laps, time, \
                 status, points, sources FROM event_results WHERE key = ?",
            )
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(ResultRow::into_entity),
        };
        entity.transpose()
    }

    async fn count(&self, family: EntityFamily) -> StorageResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", family.table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn alias_count(&self, family: EntityFamily) -> StorageResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cross_source_aliases WHERE family = ?")
                .bind(family.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn run_history(
        &self,
        family: Option<EntityFamily>,
        limit: usize,
    ) -> StorageResult<Vec<RunRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match family {
            Some(family) => {
                let sql = format!(
                    "SELECT {} FROM run_history WHERE family = ? ORDER BY started_at DESC, run_id DESC LIMIT ?",
                    RUN_COLUMNS
                );
                sqlx::query_as::<_, RunRow>(&sql)
                    .bind(family.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM run_history ORDER BY started_at DESC, run_id DESC LIMIT ?",
                    RUN_COLUMNS
                );
                sqlx::query_as::<_, RunRow>(&sql)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(RunRow::into_record).collect()
    }

    async fn finalize_interrupted_runs(&self) -> StorageResult<usize> {
        let result = sqlx::query(
            "UPDATE run_history SET finished_at = ?, outcome = ? WHERE finished_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(RunOutcome::Failed(FailureReason::Interrupted).to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::run::RunOutcome;

    async fn test_repo() -> SqliteRepository {
        SqliteRepository::in_memory().await.unwrap()
    }

    fn team(key: &str, name: &str) -> CanonicalEntity {
        CanonicalEntity::Team(Team {
            key: CanonicalKey::new(key),
            name: name.to_string(),
            nationality: None,
            base: None,
            power_unit: None,
            points: Some(589.0),
            standing: Some(1),
            wins: None,
            championships: None,
            sources: vec![SourceId::formula1()],
        })
    }

    fn competitor(key: &str, name: &str, team_key: Option<&str>) -> CanonicalEntity {
        CanonicalEntity::Competitor(Competitor {
            key: CanonicalKey::new(key),
            name: name.to_string(),
            code: Some("VER".into()),
            nationality: Some("NED".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1997, 9, 30),
            number: Some(1),
            team_name: Some("Red Bull Racing".into()),
            team_key: team_key.map(CanonicalKey::new),
            points: Some(437.0),
            standing: Some(1),
            wins: Some(63),
            podiums: None,
            championships: Some(4),
            sources: vec![SourceId::formula1(), SourceId::wikipedia()],
        })
    }

    fn event(season: i32, round: u32, name: &str) -> CanonicalEntity {
        CanonicalEntity::Event(Event {
            key: CanonicalKey::for_event(season, round),
            name: name.to_string(),
            season,
            round,
            circuit: None,
            country: None,
            date: NaiveDate::from_ymd_opt(2024, 3, 2),
            laps: Some(57),
            sources: vec![SourceId::formula1()],
        })
    }

    fn result(event_key: &str, competitor_key: &str) -> CanonicalEntity {
        let event_key = CanonicalKey::new(event_key);
        let competitor_key = CanonicalKey::new(competitor_key);
        CanonicalEntity::Result(EventResult {
            key: CanonicalKey::for_result(&event_key, &competitor_key),
            event_key,
            competitor_key,
            team_key: None,
            position: Some(1),
            number: Some(1),
            laps: Some(57),
            time: Some("1:31:44.742".into()),
            status: None,
            points: Some(26.0),
            sources: vec![SourceId::formula1()],
        })
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let repo = test_repo().await;
        let batch = PersistBatch::new(
            EntityFamily::Teams,
            vec![team("red-bull", "Red Bull Racing"), team("mclaren", "McLaren")],
        );

        assert_eq!(repo.upsert(&batch).await.unwrap().persisted, 2);
        assert_eq!(repo.upsert(&batch).await.unwrap().persisted, 2);
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_round_trip_competitor() {
        let repo = test_repo().await;
        repo.upsert(&PersistBatch::new(EntityFamily::Teams, vec![team("red-bull", "Red Bull Racing")]))
            .await
            .unwrap();
        let stored = competitor("max-verstappen", "Max Verstappen", Some("red-bull"));
        repo.upsert(&PersistBatch::new(EntityFamily::Competitors, vec![stored.clone()]))
            .await
            .unwrap();

        let loaded = repo
            .get(EntityFamily::Competitors, &CanonicalKey::new("max-verstappen"))
            .await
            .unwrap();
        assert_eq!(loaded, Some(stored));

        let known = repo.known_entities(EntityFamily::Competitors).await.unwrap();
        assert_eq!(known, vec![KnownEntity::new(CanonicalKey::new("max-verstappen"), "Max Verstappen")]);
    }

    #[tokio::test]
    async fn test_results_with_missing_references_are_deferred() {
        let repo = test_repo().await;
        repo.upsert(&PersistBatch::new(EntityFamily::Events, vec![event(2024, 1, "Bahrain")]))
            .await
            .unwrap();
        repo.upsert(&PersistBatch::new(
            EntityFamily::Competitors,
            vec![competitor("max-verstappen", "Max Verstappen", None)],
        ))
        .await
        .unwrap();

        let report = repo
            .upsert(&PersistBatch::new(
                EntityFamily::Results,
                vec![
                    result("2024-01", "max-verstappen"),
                    result("2024-01", "oliver-bearman"),
                    result("2024-02", "max-verstappen"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(report.persisted, 1);
        assert_eq!(report.deferred.len(), 2);
        assert_eq!(repo.count(EntityFamily::Results).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mixed_family_batch_rolls_back() {
        let repo = test_repo().await;
        let batch = PersistBatch::new(
            EntityFamily::Teams,
            vec![team("red-bull", "Red Bull Racing"), event(2024, 1, "Bahrain")],
        );

        assert!(matches!(repo.upsert(&batch).await, Err(StorageError::Corrupt(_))));
        assert_eq!(repo.count(EntityFamily::Teams).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aliases_are_never_replaced() {
        let repo = test_repo().await;
        repo.upsert(&PersistBatch::new(EntityFamily::Teams, vec![team("red-bull", "Red Bull Racing")]))
            .await
            .unwrap();
        let first = CrossSourceAlias::new(
            EntityFamily::Competitors,
            SourceId::formula1(),
            "Max Verstappen",
            CanonicalKey::new("max-verstappen"),
        );
        let second = CrossSourceAlias::new(
            EntityFamily::Competitors,
            SourceId::formula1(),
            "Max Verstappen",
            CanonicalKey::new("someone-else"),
        );

        repo.upsert(&PersistBatch::new(EntityFamily::Competitors, Vec::new()).with_aliases(vec![first.clone()]))
            .await
            .unwrap();
        // re-sending the same mapping is fine
        repo.upsert(&PersistBatch::new(EntityFamily::Competitors, Vec::new()).with_aliases(vec![first]))
            .await
            .unwrap();

        let stale = PersistBatch::new(
            EntityFamily::Competitors,
            vec![competitor("someone-else", "Max Verstappen", Some("red-bull"))],
        )
        .with_aliases(vec![second]);
        let err = repo.upsert(&stale).await.unwrap_err();
        assert!(
            matches!(&err, StorageError::AliasConflict { existing, .. } if existing.as_str() == "max-verstappen"),
            "{:?}",
            err
        );
        assert_eq!(repo.count(EntityFamily::Competitors).await.unwrap(), 0);

        let aliases = repo.get_aliases(EntityFamily::Competitors).await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].canonical_key.as_str(), "max-verstappen");
        assert!(repo.get_aliases(EntityFamily::Teams).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_finalized_once() {
        let repo = test_repo().await;
        let run = RunRecord::start(EntityFamily::Teams, Trigger::Manual);
        repo.begin_run(&run).await.unwrap();

        let mut finished = run.clone().finish(RunOutcome::Success);
        finished.counts.persisted = 10;
        repo.record_run(&finished).await.unwrap();

        let again = run.clone().finish(RunOutcome::Partial);
        assert!(matches!(
            repo.record_run(&again).await,
            Err(StorageError::AlreadyFinalized { .. })
        ));

        let history = repo.run_history(Some(EntityFamily::Teams), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RunOutcome::Success);
        assert_eq!(history[0].counts.persisted, 10);

        let never_started = RunRecord::start(EntityFamily::Teams, Trigger::Manual).finish(RunOutcome::Success);
        assert!(matches!(
            repo.record_run(&never_started).await,
            Err(StorageError::UnknownRun { .. })
        ));
    }

    #[tokio::test]
    async fn test_interrupted_runs_finalized_once() {
        let repo = test_repo().await;
        repo.begin_run(&RunRecord::start(EntityFamily::Events, Trigger::Cadence))
            .await
            .unwrap();
        repo.begin_run(&RunRecord::start(EntityFamily::Teams, Trigger::Manual))
            .await
            .unwrap();

        assert_eq!(repo.finalize_interrupted_runs().await.unwrap(), 2);
        assert_eq!(repo.finalize_interrupted_runs().await.unwrap(), 0);

        let history = repo.run_history(None, 10).await.unwrap();
        assert!(history
            .iter()
            .all(|r| r.outcome == RunOutcome::Failed(FailureReason::Interrupted)));
    }
}
