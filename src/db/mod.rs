use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod models;
use models::*;

/// Thread-safe SQLite connection (single connection with mutex), matching
/// the storage shape used throughout the engine.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    /// Run `f` with exclusive access to the raw connection, inside one
    /// transaction. Used by the orchestrator to commit an entire ingestion
    /// or detection session atomically.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ── Games ─────────────────────────────────────────────────────────

    pub fn upsert_game(&self, game: &Game) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO games (event_id, sport_key, commence_time, home_team, away_team)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(event_id) DO UPDATE SET
                sport_key=excluded.sport_key,
                commence_time=excluded.commence_time,
                home_team=excluded.home_team,
                away_team=excluded.away_team",
            params![
                game.event_id,
                game.sport_key,
                game.commence_time,
                game.home_team,
                game.away_team,
            ],
        )?;
        Ok(())
    }

    pub fn get_game(&self, event_id: &str) -> Result<Option<Game>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT event_id, sport_key, commence_time, home_team, away_team
             FROM games WHERE event_id=?1",
            params![event_id],
            map_game,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    /// Games whose commence_time is within a window of "now" (used to pick
    /// the candidate event_ids for a cycle and to drive adaptive polling).
    pub fn list_active_games(&self, now: DateTime<Utc>, lookback_hours: i64) -> Result<Vec<Game>> {
        let conn = self.conn.lock().unwrap();
        let earliest = now - chrono::Duration::hours(lookback_hours);
        let mut stmt = conn.prepare(
            "SELECT event_id, sport_key, commence_time, home_team, away_team
             FROM games WHERE commence_time >= ?1 ORDER BY commence_time ASC",
        )?;
        let rows = stmt
            .query_map(params![earliest], map_game)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Odds snapshots (C1) ──────────────────────────────────────────

    pub fn insert_odds_snapshot(&self, s: &OddsSnapshot) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO odds_snapshots
                (event_id, sport_key, sportsbook_key, market, outcome_name, line, price, fetched_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                s.event_id,
                s.sport_key,
                s.sportsbook_key,
                s.market,
                s.outcome_name,
                s.line,
                s.price,
                s.fetched_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest snapshot per `(sportsbook_key, outcome_name)` within the lookback
    /// window, for one `(event_id, market)`. Feeds the consensus engine.
    pub fn latest_snapshots_in_window(
        &self,
        event_id: &str,
        market: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.event_id, s.sport_key, s.sportsbook_key, s.market,
                    s.outcome_name, s.line, s.price, s.fetched_at
             FROM odds_snapshots s
             INNER JOIN (
                SELECT sportsbook_key, outcome_name, MAX(fetched_at) AS max_fetched
                FROM odds_snapshots
                WHERE event_id=?1 AND market=?2 AND fetched_at >= ?3
                GROUP BY sportsbook_key, outcome_name
             ) latest
             ON s.sportsbook_key = latest.sportsbook_key
                AND s.outcome_name = latest.outcome_name
                AND s.fetched_at = latest.max_fetched
             WHERE s.event_id=?1 AND s.market=?2 AND s.fetched_at >= ?3",
        )?;
        let rows = stmt
            .query_map(params![event_id, market, since], map_odds_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All raw snapshot rows for `(event_id, market)` since `since`, in
    /// fetched_at order. Unlike `latest_snapshots_in_window`, this is not
    /// collapsed to one row per book — callers that need an outcome's
    /// earliest-in-window value (MOVE/KEY_CROSS, STEAM) use this.
    pub fn list_odds_snapshots_in_window(
        &self,
        event_id: &str,
        market: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, sport_key, sportsbook_key, market, outcome_name,
                    line, price, fetched_at
             FROM odds_snapshots
             WHERE event_id=?1 AND market=?2 AND fetched_at >= ?3
             ORDER BY fetched_at ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id, market, since], map_odds_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The single prior snapshot for a `(event,book,market,outcome)` key, used
    /// by quote-move detection and KV-free dedupe fallback.
    pub fn last_snapshot_for_key(
        &self,
        event_id: &str,
        sportsbook_key: &str,
        market: &str,
        outcome_name: &str,
    ) -> Result<Option<OddsSnapshot>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, event_id, sport_key, sportsbook_key, market, outcome_name,
                    line, price, fetched_at
             FROM odds_snapshots
             WHERE event_id=?1 AND sportsbook_key=?2 AND market=?3 AND outcome_name=?4
             ORDER BY fetched_at DESC LIMIT 1",
            params![event_id, sportsbook_key, market, outcome_name],
            map_odds_snapshot,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    pub fn delete_expired_odds_snapshots(&self, before: DateTime<Utc>, batch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM odds_snapshots WHERE id IN
                (SELECT id FROM odds_snapshots WHERE fetched_at < ?1 LIMIT ?2)",
            params![before, batch],
        )?;
        Ok(n as i64)
    }

    // ── Consensus (C3) ───────────────────────────────────────────────
    //
    // Append-only: one row per cycle per (event, market, outcome), matching
    // the odds-snapshot ledger rather than a single mutable "current" row.
    // Closing-line selection (C8) needs to pick the latest row at-or-before
    // commence_time, which only makes sense if history survives past the
    // cycle that wrote it; CONSENSUS_RETENTION_DAYS sweeps it out later.

    pub fn insert_consensus_snapshot(&self, c: &MarketConsensusSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO market_consensus_snapshots
                (event_id, market, outcome_name, consensus_line, consensus_price,
                 dispersion, books_count, fetched_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                c.event_id,
                c.market,
                c.outcome_name,
                c.consensus_line,
                c.consensus_price,
                c.dispersion,
                c.books_count,
                c.fetched_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_latest_consensus(
        &self,
        event_id: &str,
        market: &str,
        outcome_name: &str,
    ) -> Result<Option<MarketConsensusSnapshot>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT event_id, market, outcome_name, consensus_line, consensus_price,
                    dispersion, books_count, fetched_at
             FROM market_consensus_snapshots
             WHERE event_id=?1 AND market=?2 AND outcome_name=?3
             ORDER BY fetched_at DESC LIMIT 1",
            params![event_id, market, outcome_name],
            map_consensus,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    /// The latest consensus snapshot for a given outcome whose `fetched_at`
    /// does not exceed `cutoff`. Used by closing-line selection, which must
    /// not pick a consensus struck after tipoff.
    pub fn latest_consensus_before(
        &self,
        event_id: &str,
        market: &str,
        outcome_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<MarketConsensusSnapshot>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT event_id, market, outcome_name, consensus_line, consensus_price,
                    dispersion, books_count, fetched_at
             FROM market_consensus_snapshots
             WHERE event_id=?1 AND market=?2 AND outcome_name=?3 AND fetched_at <= ?4
             ORDER BY fetched_at DESC LIMIT 1",
            params![event_id, market, outcome_name, cutoff],
            map_consensus,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    /// One row per outcome — the most recently struck consensus for each
    /// outcome of `(event_id, market)`. Used by detectors that compare a
    /// book's latest quote against the current consensus, never history.
    pub fn list_latest_consensus_per_outcome(
        &self,
        event_id: &str,
        market: &str,
    ) -> Result<Vec<MarketConsensusSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.event_id, m.market, m.outcome_name, m.consensus_line, m.consensus_price,
                    m.dispersion, m.books_count, m.fetched_at
             FROM market_consensus_snapshots m
             WHERE m.event_id=?1 AND m.market=?2
               AND m.fetched_at = (
                   SELECT MAX(m2.fetched_at) FROM market_consensus_snapshots m2
                   WHERE m2.event_id=m.event_id AND m2.market=m.market
                     AND m2.outcome_name=m.outcome_name
               )",
        )?;
        let rows = stmt
            .query_map(params![event_id, market], map_consensus)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Full consensus history for one event (optionally filtered to one
    /// market), oldest first. Used by the read API's per-event listing.
    pub fn list_consensus(
        &self,
        event_id: &str,
        market: Option<&str>,
        sport_key: Option<&str>,
    ) -> Result<Vec<MarketConsensusSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT m.event_id, m.market, m.outcome_name, m.consensus_line, m.consensus_price,
                    m.dispersion, m.books_count, m.fetched_at
             FROM market_consensus_snapshots m",
        );
        if sport_key.is_some() {
            sql.push_str(" JOIN games g ON g.event_id = m.event_id");
        }
        sql.push_str(" WHERE m.event_id=?");
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&event_id];
        if let Some(market) = &market {
            sql.push_str(" AND m.market=?");
            args.push(market);
        }
        if let Some(sport_key) = &sport_key {
            sql.push_str(" AND g.sport_key=?");
            args.push(sport_key);
        }
        sql.push_str(" ORDER BY m.fetched_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), map_consensus)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent consensus row per `(event_id, market, outcome_name)`
    /// across all events, newest first. Backs `/intel/consensus/latest`.
    pub fn list_latest_consensus_global(
        &self,
        market: Option<&str>,
        sport_key: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MarketConsensusSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT m.event_id, m.market, m.outcome_name, m.consensus_line, m.consensus_price,
                    m.dispersion, m.books_count, m.fetched_at
             FROM market_consensus_snapshots m",
        );
        if sport_key.is_some() {
            sql.push_str(" JOIN games g ON g.event_id = m.event_id");
        }
        sql.push_str(
            " WHERE m.fetched_at = (
                 SELECT MAX(m2.fetched_at) FROM market_consensus_snapshots m2
                 WHERE m2.event_id=m.event_id AND m2.market=m.market AND m2.outcome_name=m.outcome_name
             )",
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(market) = &market {
            sql.push_str(" AND m.market=?");
            args.push(market);
        }
        if let Some(sport_key) = &sport_key {
            sql.push_str(" AND g.sport_key=?");
            args.push(sport_key);
        }
        sql.push_str(" ORDER BY m.fetched_at DESC LIMIT ? OFFSET ?");
        args.push(&limit);
        args.push(&offset);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), map_consensus)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_expired_consensus(&self, before: DateTime<Utc>, batch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM market_consensus_snapshots WHERE rowid IN
                (SELECT rowid FROM market_consensus_snapshots WHERE fetched_at < ?1 LIMIT ?2)",
            params![before, batch],
        )?;
        Ok(n as i64)
    }

    // ── Quote moves (C4) ─────────────────────────────────────────────

    pub fn insert_quote_move_event(&self, m: &QuoteMoveEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO quote_move_events
                (event_id, market_key, outcome_name, venue, venue_tier, old_line, new_line,
                 delta, old_price, new_price, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                m.event_id,
                m.market_key,
                m.outcome_name,
                m.venue,
                m.venue_tier.as_str(),
                m.old_line,
                m.new_line,
                m.delta,
                m.old_price,
                m.new_price,
                m.timestamp,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_quote_moves(
        &self,
        event_id: &str,
        market_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuoteMoveEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, market_key, outcome_name, venue, venue_tier, old_line,
                    new_line, delta, old_price, new_price, timestamp
             FROM quote_move_events
             WHERE event_id=?1 AND market_key=?2 AND timestamp >= ?3
             ORDER BY timestamp ASC, venue ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id, market_key, since], map_quote_move)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Structural events (C6) ────────────────────────────────────────

    /// Upsert by identity `(event_id, market_key, outcome_name, threshold_value,
    /// break_direction)`. Returns the row id.
    pub fn upsert_structural_event(&self, e: &StructuralEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO structural_events
                (event_id, market_key, outcome_name, threshold_value, threshold_type,
                 break_direction, origin_venue, origin_venue_tier, origin_timestamp,
                 confirmation_timestamp, adoption_percentage, adoption_count,
                 active_venue_count, time_to_consensus_seconds, dispersion_pre,
                 dispersion_post, break_hold_minutes, reversal_detected, reversal_timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
             ON CONFLICT(event_id, market_key, outcome_name, threshold_value, break_direction)
             DO UPDATE SET
                confirmation_timestamp=excluded.confirmation_timestamp,
                adoption_percentage=excluded.adoption_percentage,
                adoption_count=excluded.adoption_count,
                active_venue_count=excluded.active_venue_count,
                time_to_consensus_seconds=excluded.time_to_consensus_seconds,
                dispersion_pre=excluded.dispersion_pre,
                dispersion_post=excluded.dispersion_post,
                break_hold_minutes=excluded.break_hold_minutes,
                reversal_detected=excluded.reversal_detected,
                reversal_timestamp=excluded.reversal_timestamp",
            params![
                e.event_id,
                e.market_key,
                e.outcome_name,
                e.threshold_value,
                e.threshold_type.as_str(),
                e.break_direction.as_str(),
                e.origin_venue,
                e.origin_venue_tier.as_str(),
                e.origin_timestamp,
                e.confirmation_timestamp,
                e.adoption_percentage,
                e.adoption_count,
                e.active_venue_count,
                e.time_to_consensus_seconds,
                e.dispersion_pre,
                e.dispersion_post,
                e.break_hold_minutes,
                e.reversal_detected,
                e.reversal_timestamp,
            ],
        )?;
        conn.query_row(
            "SELECT id FROM structural_events
             WHERE event_id=?1 AND market_key=?2 AND outcome_name=?3
                AND threshold_value=?4 AND break_direction=?5",
            params![
                e.event_id,
                e.market_key,
                e.outcome_name,
                e.threshold_value,
                e.break_direction.as_str(),
            ],
            |row| row.get(0),
        )
        .context("structural event id lookup after upsert")
    }

    pub fn insert_participation(&self, p: &StructuralEventVenueParticipation) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO structural_event_venue_participation
                (structural_event_id, venue, venue_tier, crossed_at, line_before, line_after, delta)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(structural_event_id, venue) DO NOTHING",
            params![
                p.structural_event_id,
                p.venue,
                p.venue_tier.as_str(),
                p.crossed_at,
                p.line_before,
                p.line_after,
                p.delta,
            ],
        )?;
        Ok(())
    }

    pub fn list_structural_events(&self, event_id: &str) -> Result<Vec<StructuralEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, market_key, outcome_name, threshold_value, threshold_type,
                    break_direction, origin_venue, origin_venue_tier, origin_timestamp,
                    confirmation_timestamp, adoption_percentage, adoption_count,
                    active_venue_count, time_to_consensus_seconds, dispersion_pre,
                    dispersion_post, break_hold_minutes, reversal_detected, reversal_timestamp
             FROM structural_events WHERE event_id=?1 ORDER BY confirmation_timestamp DESC",
        )?;
        let rows = stmt
            .query_map(params![event_id], map_structural_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Signals (C5) ───────────────────────────────────────────────────

    pub fn insert_signal(&self, s: &Signal) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let metadata = serde_json::to_string(&s.metadata)?;
        conn.execute(
            "INSERT INTO signals
                (event_id, market, signal_type, direction, from_value, to_value,
                 from_price, to_price, window_minutes, books_affected, velocity_minutes,
                 time_bucket, strength_score, created_at, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                s.event_id,
                s.market,
                s.signal_type.as_str(),
                s.direction.as_str(),
                s.from_value,
                s.to_value,
                s.from_price,
                s.to_price,
                s.window_minutes,
                s.books_affected,
                s.velocity_minutes,
                s.time_bucket.as_str(),
                s.strength_score,
                s.created_at,
                metadata,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_signal(&self, id: i64) -> Result<Option<Signal>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, event_id, market, signal_type, direction, from_value, to_value,
                    from_price, to_price, window_minutes, books_affected, velocity_minutes,
                    time_bucket, strength_score, created_at, metadata
             FROM signals WHERE id=?1",
            params![id],
            map_signal,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    pub fn list_signals(
        &self,
        signal_type: Option<&str>,
        event_id: Option<&str>,
        sport_key: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Signal>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT s.id, s.event_id, s.market, s.signal_type, s.direction, s.from_value, s.to_value,
                    s.from_price, s.to_price, s.window_minutes, s.books_affected, s.velocity_minutes,
                    s.time_bucket, s.strength_score, s.created_at, s.metadata
             FROM signals s",
        );
        if sport_key.is_some() {
            sql.push_str(" JOIN games g ON g.event_id = s.event_id");
        }
        sql.push_str(" WHERE 1=1");
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(t) = &signal_type {
            sql.push_str(" AND s.signal_type=?");
            args.push(t);
        }
        if let Some(e) = &event_id {
            sql.push_str(" AND s.event_id=?");
            args.push(e);
        }
        if let Some(sk) = &sport_key {
            sql.push_str(" AND g.sport_key=?");
            args.push(sk);
        }
        sql.push_str(" ORDER BY s.created_at DESC LIMIT ? OFFSET ?");
        args.push(&limit);
        args.push(&offset);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), map_signal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Signals whose game has already commenced (by at least
    /// `CLV_MINUTES_AFTER_COMMENCE`) and that have no `ClvRecord` yet.
    /// Drives the C8 CLV job; re-running it is a no-op once every eligible
    /// signal has a row (the `NOT EXISTS` guard, not just the unique
    /// constraint on insert, keeps the candidate set small).
    pub fn list_signals_awaiting_clv(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Signal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.event_id, s.market, s.signal_type, s.direction, s.from_value,
                    s.to_value, s.from_price, s.to_price, s.window_minutes, s.books_affected,
                    s.velocity_minutes, s.time_bucket, s.strength_score, s.created_at, s.metadata
             FROM signals s
             JOIN games g ON g.event_id = s.event_id
             WHERE g.commence_time <= ?1
               AND NOT EXISTS (SELECT 1 FROM clv_records c WHERE c.signal_id = s.id)
             ORDER BY s.created_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit], map_signal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Signals created since `since`, used by CLV eligibility and the alert
    /// dispatcher's per-cycle batch.
    pub fn list_signals_since(&self, since: DateTime<Utc>) -> Result<Vec<Signal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, market, signal_type, direction, from_value, to_value,
                    from_price, to_price, window_minutes, books_affected, velocity_minutes,
                    time_bucket, strength_score, created_at, metadata
             FROM signals WHERE created_at >= ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![since], map_signal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_expired_signals(&self, before: DateTime<Utc>, batch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM signals WHERE id IN
                (SELECT id FROM signals WHERE created_at < ?1 LIMIT ?2)",
            params![before, batch],
        )?;
        Ok(n as i64)
    }

    // ── Canonical alignment + exchange quotes (C2, C7) ────────────────

    pub fn upsert_canonical_alignment(&self, a: &CanonicalEventAlignment) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO canonical_event_alignments
                (canonical_event_key, sport, league, home_team, away_team, start_time,
                 sportsbook_event_id, kalshi_market_id, polymarket_market_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(canonical_event_key) DO UPDATE SET
                kalshi_market_id=excluded.kalshi_market_id,
                polymarket_market_id=excluded.polymarket_market_id",
            params![
                a.canonical_event_key,
                a.sport,
                a.league,
                a.home_team,
                a.away_team,
                a.start_time,
                a.sportsbook_event_id,
                a.kalshi_market_id,
                a.polymarket_market_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_alignment(&self, canonical_event_key: &str) -> Result<Option<CanonicalEventAlignment>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT canonical_event_key, sport, league, home_team, away_team, start_time,
                    sportsbook_event_id, kalshi_market_id, polymarket_market_id
             FROM canonical_event_alignments WHERE canonical_event_key=?1",
            params![canonical_event_key],
            map_alignment,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    pub fn list_alignments(&self) -> Result<Vec<CanonicalEventAlignment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT canonical_event_key, sport, league, home_team, away_team, start_time,
                    sportsbook_event_id, kalshi_market_id, polymarket_market_id
             FROM canonical_event_alignments",
        )?;
        let rows = stmt
            .query_map([], map_alignment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_exchange_quote_event(&self, q: &ExchangeQuoteEvent) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO exchange_quote_events
                (canonical_event_key, source, market_id, outcome_name, probability, price, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(source, market_id, outcome_name, timestamp) DO NOTHING",
            params![
                q.canonical_event_key,
                q.source.as_str(),
                q.market_id,
                q.outcome_name,
                q.probability,
                q.price,
                q.timestamp,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn list_exchange_quotes(
        &self,
        source: &str,
        market_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExchangeQuoteEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, canonical_event_key, source, market_id, outcome_name, probability,
                    price, timestamp
             FROM exchange_quote_events
             WHERE source=?1 AND market_id=?2 AND timestamp >= ?3
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![source, market_id, since], map_exchange_quote)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Cross-market lead/lag + divergence (C7) ───────────────────────

    pub fn insert_lead_lag_event(&self, e: &CrossMarketLeadLagEvent) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO cross_market_lead_lag_events
                (canonical_event_key, threshold_type, sportsbook_threshold_value,
                 exchange_probability_threshold, lead_source, sportsbook_break_timestamp,
                 exchange_break_timestamp, lag_seconds)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(canonical_event_key, sportsbook_threshold_value, exchange_probability_threshold)
             DO NOTHING",
            params![
                e.canonical_event_key,
                e.threshold_type.as_str(),
                e.sportsbook_threshold_value,
                e.exchange_probability_threshold,
                e.lead_source.as_str(),
                e.sportsbook_break_timestamp,
                e.exchange_break_timestamp,
                e.lag_seconds,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn list_lead_lag_events(&self, canonical_event_key: &str) -> Result<Vec<CrossMarketLeadLagEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, canonical_event_key, threshold_type, sportsbook_threshold_value,
                    exchange_probability_threshold, lead_source, sportsbook_break_timestamp,
                    exchange_break_timestamp, lag_seconds
             FROM cross_market_lead_lag_events WHERE canonical_event_key=?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![canonical_event_key], map_lead_lag)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_divergence_event(&self, e: &CrossMarketDivergenceEvent) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO cross_market_divergence_events
                (canonical_event_key, divergence_type, lead_source, sportsbook_threshold_value,
                 exchange_probability_threshold, sportsbook_break_timestamp,
                 exchange_break_timestamp, lag_seconds, resolved, resolved_at, resolution_type,
                 idempotency_key)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                e.canonical_event_key,
                e.divergence_type.as_str(),
                e.lead_source.as_str(),
                e.sportsbook_threshold_value,
                e.exchange_probability_threshold,
                e.sportsbook_break_timestamp,
                e.exchange_break_timestamp,
                e.lag_seconds,
                e.resolved,
                e.resolved_at,
                e.resolution_type,
                e.idempotency_key,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Marks prior unresolved lead/lag-style divergence rows for this event as
    /// resolved, on emission of an ALIGNED or REVERTED row.
    pub fn resolve_prior_unresolved_divergences(
        &self,
        canonical_event_key: &str,
        resolved_at: DateTime<Utc>,
        resolution_type: &str,
        except_idempotency_key: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE cross_market_divergence_events
             SET resolved=1, resolved_at=?1, resolution_type=?2
             WHERE canonical_event_key=?3 AND resolved=0 AND idempotency_key != ?4",
            params![resolved_at, resolution_type, canonical_event_key, except_idempotency_key],
        )?;
        Ok(n as i64)
    }

    pub fn list_divergence_events(&self, canonical_event_key: &str) -> Result<Vec<CrossMarketDivergenceEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, canonical_event_key, divergence_type, lead_source,
                    sportsbook_threshold_value, exchange_probability_threshold,
                    sportsbook_break_timestamp, exchange_break_timestamp, lag_seconds,
                    resolved, resolved_at, resolution_type, idempotency_key
             FROM cross_market_divergence_events
             WHERE canonical_event_key=?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![canonical_event_key], map_divergence)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_unresolved_divergences_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CrossMarketDivergenceEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, canonical_event_key, divergence_type, lead_source,
                    sportsbook_threshold_value, exchange_probability_threshold,
                    sportsbook_break_timestamp, exchange_break_timestamp, lag_seconds,
                    resolved, resolved_at, resolution_type, idempotency_key
             FROM cross_market_divergence_events
             WHERE resolved=0 AND (sportsbook_break_timestamp >= ?1 OR exchange_break_timestamp >= ?1)
             ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![since], map_divergence)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Closing consensus + CLV (C8) ──────────────────────────────────

    pub fn upsert_closing_consensus(&self, c: &ClosingConsensus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO closing_consensus
                (event_id, market, outcome_name, close_line, close_price, close_fetched_at, computed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(event_id, market, outcome_name) DO UPDATE SET
                close_line=excluded.close_line,
                close_price=excluded.close_price,
                close_fetched_at=excluded.close_fetched_at,
                computed_at=excluded.computed_at",
            params![
                c.event_id,
                c.market,
                c.outcome_name,
                c.close_line,
                c.close_price,
                c.close_fetched_at,
                c.computed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_closing_consensus(
        &self,
        event_id: &str,
        market: &str,
        outcome_name: &str,
    ) -> Result<Option<ClosingConsensus>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT event_id, market, outcome_name, close_line, close_price, close_fetched_at, computed_at
             FROM closing_consensus WHERE event_id=?1 AND market=?2 AND outcome_name=?3",
            params![event_id, market, outcome_name],
            map_closing_consensus,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    pub fn events_missing_closing_consensus(
        &self,
        lookback_hours: i64,
        now: DateTime<Utc>,
        max_games: i64,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let earliest = now - chrono::Duration::hours(lookback_hours);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT g.event_id FROM games g
             WHERE g.commence_time >= ?1 AND g.commence_time <= ?2
               AND NOT EXISTS (
                   SELECT 1 FROM closing_consensus c WHERE c.event_id = g.event_id
               )
               AND EXISTS (
                   SELECT 1 FROM odds_snapshots o WHERE o.event_id = g.event_id
               )
             ORDER BY g.commence_time ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![earliest, now, max_games], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_clv_record(&self, c: &ClvRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO clv_records
                (signal_id, event_id, signal_type, market, outcome_name, entry_line,
                 entry_price, close_line, close_price, clv_line, clv_prob, computed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(signal_id) DO NOTHING",
            params![
                c.signal_id,
                c.event_id,
                c.signal_type.as_str(),
                c.market,
                c.outcome_name,
                c.entry_line,
                c.entry_price,
                c.close_line,
                c.close_price,
                c.clv_line,
                c.clv_prob,
                c.computed_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_clv_record(&self, signal_id: i64) -> Result<Option<ClvRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT signal_id, event_id, signal_type, market, outcome_name, entry_line,
                    entry_price, close_line, close_price, clv_line, clv_prob, computed_at
             FROM clv_records WHERE signal_id=?1",
            params![signal_id],
            map_clv_record,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    }

    pub fn list_clv_records(
        &self,
        event_id: Option<&str>,
        sport_key: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ClvRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT c.signal_id, c.event_id, c.signal_type, c.market, c.outcome_name, c.entry_line,
                    c.entry_price, c.close_line, c.close_price, c.clv_line, c.clv_prob, c.computed_at
             FROM clv_records c",
        );
        if sport_key.is_some() {
            sql.push_str(" JOIN games g ON g.event_id = c.event_id");
        }
        sql.push_str(" WHERE 1=1");
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(e) = &event_id {
            sql.push_str(" AND c.event_id=?");
            args.push(e);
        }
        if let Some(sk) = &sport_key {
            sql.push_str(" AND g.sport_key=?");
            args.push(sk);
        }
        sql.push_str(" ORDER BY c.computed_at DESC LIMIT ? OFFSET ?");
        args.push(&limit);
        args.push(&offset);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), map_clv_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_expired_clv_records(&self, before: DateTime<Utc>, batch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM clv_records WHERE signal_id IN
                (SELECT signal_id FROM clv_records WHERE computed_at < ?1 LIMIT ?2)",
            params![before, batch],
        )?;
        Ok(n as i64)
    }

    pub fn delete_expired_closing_consensus(&self, before: DateTime<Utc>, batch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM closing_consensus WHERE rowid IN
                (SELECT rowid FROM closing_consensus WHERE computed_at < ?1 LIMIT ?2)",
            params![before, batch],
        )?;
        Ok(n as i64)
    }

    // ── Cycle KPI (C10, C11) ───────────────────────────────────────────

    pub fn upsert_cycle_kpi(&self, k: &CycleKpi) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let by_type = serde_json::to_string(&k.signals_created_by_type)?;
        conn.execute(
            "INSERT INTO cycle_kpis
                (cycle_id, started_at, completed_at, duration_ms, requests_used_delta,
                 events_processed, snapshots_inserted, consensus_points_written,
                 signals_created_total, signals_created_by_type, alerts_sent, alerts_failed,
                 degraded, notes)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(cycle_id) DO UPDATE SET
                completed_at=excluded.completed_at,
                duration_ms=excluded.duration_ms,
                requests_used_delta=excluded.requests_used_delta,
                events_processed=excluded.events_processed,
                snapshots_inserted=excluded.snapshots_inserted,
                consensus_points_written=excluded.consensus_points_written,
                signals_created_total=excluded.signals_created_total,
                signals_created_by_type=excluded.signals_created_by_type,
                alerts_sent=excluded.alerts_sent,
                alerts_failed=excluded.alerts_failed,
                degraded=excluded.degraded,
                notes=excluded.notes",
            params![
                k.cycle_id,
                k.started_at,
                k.completed_at,
                k.duration_ms,
                k.requests_used_delta,
                k.events_processed,
                k.snapshots_inserted,
                k.consensus_points_written,
                k.signals_created_total,
                by_type,
                k.alerts_sent,
                k.alerts_failed,
                k.degraded,
                k.notes,
            ],
        )?;
        Ok(())
    }

    pub fn list_recent_cycle_kpis(&self, limit: i64) -> Result<Vec<CycleKpi>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cycle_id, started_at, completed_at, duration_ms, requests_used_delta,
                    events_processed, snapshots_inserted, consensus_points_written,
                    signals_created_total, signals_created_by_type, alerts_sent,
                    alerts_failed, degraded, notes
             FROM cycle_kpis ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], map_cycle_kpi)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_expired_cycle_kpis(&self, before: DateTime<Utc>, batch: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM cycle_kpis WHERE cycle_id IN
                (SELECT cycle_id FROM cycle_kpis WHERE started_at < ?1 LIMIT ?2)",
            params![before, batch],
        )?;
        Ok(n as i64)
    }

    // ── Webhook subscribers + delivery log (C9) ───────────────────────

    pub fn list_active_webhook_endpoints(&self) -> Result<Vec<WebhookEndpoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, url, secret, is_active, min_strength, market_gates, cooldown_seconds,
                    discord_webhook_url
             FROM webhook_endpoints WHERE is_active=1",
        )?;
        let rows = stmt
            .query_map([], map_webhook_endpoint)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_webhook_endpoint(&self, e: &WebhookEndpoint) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO webhook_endpoints
                (url, secret, is_active, min_strength, market_gates, cooldown_seconds,
                 discord_webhook_url)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                e.url,
                e.secret,
                e.is_active,
                e.min_strength,
                e.market_gates,
                e.cooldown_seconds,
                e.discord_webhook_url,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_webhook_delivery_log(&self, log: &WebhookDeliveryLog) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO webhook_delivery_logs
                (signal_id, subscriber_id, status, body_preview, duration_ms, error,
                 attempts, delivered_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                log.signal_id,
                log.subscriber_id,
                log.status,
                log.body_preview,
                log.duration_ms,
                log.error,
                log.attempts,
                log.delivered_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

// ── Row-mapping helpers ──────────────────────────────────────────────

fn map_game(row: &rusqlite::Row) -> rusqlite::Result<Game> {
    Ok(Game {
        event_id: row.get(0)?,
        sport_key: row.get(1)?,
        commence_time: row.get(2)?,
        home_team: row.get(3)?,
        away_team: row.get(4)?,
    })
}

fn map_odds_snapshot(row: &rusqlite::Row) -> rusqlite::Result<OddsSnapshot> {
    Ok(OddsSnapshot {
        id: row.get(0)?,
        event_id: row.get(1)?,
        sport_key: row.get(2)?,
        sportsbook_key: row.get(3)?,
        market: row.get(4)?,
        outcome_name: row.get(5)?,
        line: row.get(6)?,
        price: row.get(7)?,
        fetched_at: row.get(8)?,
    })
}

fn map_consensus(row: &rusqlite::Row) -> rusqlite::Result<MarketConsensusSnapshot> {
    Ok(MarketConsensusSnapshot {
        event_id: row.get(0)?,
        market: row.get(1)?,
        outcome_name: row.get(2)?,
        consensus_line: row.get(3)?,
        consensus_price: row.get(4)?,
        dispersion: row.get(5)?,
        books_count: row.get(6)?,
        fetched_at: row.get(7)?,
    })
}

fn map_quote_move(row: &rusqlite::Row) -> rusqlite::Result<QuoteMoveEvent> {
    let tier: String = row.get(5)?;
    Ok(QuoteMoveEvent {
        id: row.get(0)?,
        event_id: row.get(1)?,
        market_key: row.get(2)?,
        outcome_name: row.get(3)?,
        venue: row.get(4)?,
        venue_tier: VenueTier::from_str(&tier),
        old_line: row.get(6)?,
        new_line: row.get(7)?,
        delta: row.get(8)?,
        old_price: row.get(9)?,
        new_price: row.get(10)?,
        timestamp: row.get(11)?,
    })
}

fn map_structural_event(row: &rusqlite::Row) -> rusqlite::Result<StructuralEvent> {
    let threshold_type: String = row.get(5)?;
    let break_direction: String = row.get(6)?;
    let origin_venue_tier: String = row.get(8)?;
    Ok(StructuralEvent {
        id: row.get(0)?,
        event_id: row.get(1)?,
        market_key: row.get(2)?,
        outcome_name: row.get(3)?,
        threshold_value: row.get(4)?,
        threshold_type: if threshold_type == "INTEGER" {
            ThresholdType::Integer
        } else {
            ThresholdType::Half
        },
        break_direction: if break_direction == "UP" {
            BreakDirection::Up
        } else {
            BreakDirection::Down
        },
        origin_venue: row.get(7)?,
        origin_venue_tier: VenueTier::from_str(&origin_venue_tier),
        origin_timestamp: row.get(9)?,
        confirmation_timestamp: row.get(10)?,
        adoption_percentage: row.get(11)?,
        adoption_count: row.get(12)?,
        active_venue_count: row.get(13)?,
        time_to_consensus_seconds: row.get(14)?,
        dispersion_pre: row.get(15)?,
        dispersion_post: row.get(16)?,
        break_hold_minutes: row.get(17)?,
        reversal_detected: row.get(18)?,
        reversal_timestamp: row.get(19)?,
    })
}

fn map_signal(row: &rusqlite::Row) -> rusqlite::Result<Signal> {
    let signal_type: String = row.get(3)?;
    let direction: String = row.get(4)?;
    let time_bucket: String = row.get(12)?;
    let metadata_raw: String = row.get(15)?;
    let metadata: HashMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_raw).unwrap_or_default();
    Ok(Signal {
        id: row.get(0)?,
        event_id: row.get(1)?,
        market: row.get(2)?,
        signal_type: SignalType::from_str(&signal_type).unwrap_or(SignalType::Move),
        direction: match direction.as_str() {
            "UP" => SignalDirection::Up,
            "DOWN" => SignalDirection::Down,
            _ => SignalDirection::Flat,
        },
        from_value: row.get(5)?,
        to_value: row.get(6)?,
        from_price: row.get(7)?,
        to_price: row.get(8)?,
        window_minutes: row.get(9)?,
        books_affected: row.get(10)?,
        velocity_minutes: row.get(11)?,
        time_bucket: match time_bucket.as_str() {
            "OPEN" => TimeBucket::Open,
            "MID" => TimeBucket::Mid,
            "LATE" => TimeBucket::Late,
            "PRETIP" => TimeBucket::Pretip,
            "INPLAY" => TimeBucket::Inplay,
            _ => TimeBucket::Unknown,
        },
        strength_score: row.get(13)?,
        created_at: row.get(14)?,
        metadata,
    })
}

fn map_alignment(row: &rusqlite::Row) -> rusqlite::Result<CanonicalEventAlignment> {
    Ok(CanonicalEventAlignment {
        canonical_event_key: row.get(0)?,
        sport: row.get(1)?,
        league: row.get(2)?,
        home_team: row.get(3)?,
        away_team: row.get(4)?,
        start_time: row.get(5)?,
        sportsbook_event_id: row.get(6)?,
        kalshi_market_id: row.get(7)?,
        polymarket_market_id: row.get(8)?,
    })
}

fn map_exchange_quote(row: &rusqlite::Row) -> rusqlite::Result<ExchangeQuoteEvent> {
    let source: String = row.get(2)?;
    Ok(ExchangeQuoteEvent {
        id: row.get(0)?,
        canonical_event_key: row.get(1)?,
        source: if source == "KALSHI" {
            ExchangeSource::Kalshi
        } else {
            ExchangeSource::Polymarket
        },
        market_id: row.get(3)?,
        outcome_name: row.get(4)?,
        probability: row.get(5)?,
        price: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

fn map_lead_lag(row: &rusqlite::Row) -> rusqlite::Result<CrossMarketLeadLagEvent> {
    let threshold_type: String = row.get(2)?;
    let lead_source: String = row.get(5)?;
    Ok(CrossMarketLeadLagEvent {
        id: row.get(0)?,
        canonical_event_key: row.get(1)?,
        threshold_type: if threshold_type == "INTEGER" {
            ThresholdType::Integer
        } else {
            ThresholdType::Half
        },
        sportsbook_threshold_value: row.get(3)?,
        exchange_probability_threshold: row.get(4)?,
        lead_source: match lead_source.as_str() {
            "EXCHANGE" => LeadSource::Exchange,
            "SPORTSBOOK" => LeadSource::Sportsbook,
            _ => LeadSource::None,
        },
        sportsbook_break_timestamp: row.get(6)?,
        exchange_break_timestamp: row.get(7)?,
        lag_seconds: row.get(8)?,
    })
}

fn map_divergence(row: &rusqlite::Row) -> rusqlite::Result<CrossMarketDivergenceEvent> {
    let divergence_type: String = row.get(2)?;
    let lead_source: String = row.get(3)?;
    Ok(CrossMarketDivergenceEvent {
        id: row.get(0)?,
        canonical_event_key: row.get(1)?,
        divergence_type: match divergence_type.as_str() {
            "ALIGNED" => DivergenceType::Aligned,
            "EXCHANGE_LEADS" => DivergenceType::ExchangeLeads,
            "SPORTSBOOK_LEADS" => DivergenceType::SportsbookLeads,
            "OPPOSED" => DivergenceType::Opposed,
            "REVERTED" => DivergenceType::Reverted,
            _ => DivergenceType::Unconfirmed,
        },
        lead_source: match lead_source.as_str() {
            "EXCHANGE" => LeadSource::Exchange,
            "SPORTSBOOK" => LeadSource::Sportsbook,
            _ => LeadSource::None,
        },
        sportsbook_threshold_value: row.get(4)?,
        exchange_probability_threshold: row.get(5)?,
        sportsbook_break_timestamp: row.get(6)?,
        exchange_break_timestamp: row.get(7)?,
        lag_seconds: row.get(8)?,
        resolved: row.get(9)?,
        resolved_at: row.get(10)?,
        resolution_type: row.get(11)?,
        idempotency_key: row.get(12)?,
    })
}

fn map_closing_consensus(row: &rusqlite::Row) -> rusqlite::Result<ClosingConsensus> {
    Ok(ClosingConsensus {
        event_id: row.get(0)?,
        market: row.get(1)?,
        outcome_name: row.get(2)?,
        close_line: row.get(3)?,
        close_price: row.get(4)?,
        close_fetched_at: row.get(5)?,
        computed_at: row.get(6)?,
    })
}

fn map_clv_record(row: &rusqlite::Row) -> rusqlite::Result<ClvRecord> {
    let signal_type: String = row.get(2)?;
    Ok(ClvRecord {
        signal_id: row.get(0)?,
        event_id: row.get(1)?,
        signal_type: SignalType::from_str(&signal_type).unwrap_or(SignalType::Move),
        market: row.get(3)?,
        outcome_name: row.get(4)?,
        entry_line: row.get(5)?,
        entry_price: row.get(6)?,
        close_line: row.get(7)?,
        close_price: row.get(8)?,
        clv_line: row.get(9)?,
        clv_prob: row.get(10)?,
        computed_at: row.get(11)?,
    })
}

fn map_cycle_kpi(row: &rusqlite::Row) -> rusqlite::Result<CycleKpi> {
    let by_type_raw: String = row.get(9)?;
    let signals_created_by_type: HashMap<String, i64> =
        serde_json::from_str(&by_type_raw).unwrap_or_default();
    Ok(CycleKpi {
        cycle_id: row.get(0)?,
        started_at: row.get(1)?,
        completed_at: row.get(2)?,
        duration_ms: row.get(3)?,
        requests_used_delta: row.get(4)?,
        events_processed: row.get(5)?,
        snapshots_inserted: row.get(6)?,
        consensus_points_written: row.get(7)?,
        signals_created_total: row.get(8)?,
        signals_created_by_type,
        alerts_sent: row.get(10)?,
        alerts_failed: row.get(11)?,
        degraded: row.get(12)?,
        notes: row.get(13)?,
    })
}

fn map_webhook_endpoint(row: &rusqlite::Row) -> rusqlite::Result<WebhookEndpoint> {
    Ok(WebhookEndpoint {
        id: row.get(0)?,
        url: row.get(1)?,
        secret: row.get(2)?,
        is_active: row.get(3)?,
        min_strength: row.get(4)?,
        market_gates: row.get(5)?,
        cooldown_seconds: row.get(6)?,
        discord_webhook_url: row.get(7)?,
    })
}

/// Full engine schema (idempotent `CREATE TABLE IF NOT EXISTS`).
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    event_id       TEXT    PRIMARY KEY,
    sport_key      TEXT    NOT NULL,
    commence_time  TEXT    NOT NULL,
    home_team      TEXT    NOT NULL,
    away_team      TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS odds_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id        TEXT    NOT NULL,
    sport_key       TEXT    NOT NULL,
    sportsbook_key  TEXT    NOT NULL,
    market          TEXT    NOT NULL,
    outcome_name    TEXT    NOT NULL,
    line            REAL,
    price           INTEGER NOT NULL,
    fetched_at      TEXT    NOT NULL,
    FOREIGN KEY (event_id) REFERENCES games(event_id)
);
CREATE INDEX IF NOT EXISTS idx_odds_snapshots_lookup
    ON odds_snapshots(event_id, market, outcome_name, sportsbook_key, fetched_at);

CREATE TABLE IF NOT EXISTS market_consensus_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id        TEXT    NOT NULL,
    market          TEXT    NOT NULL,
    outcome_name    TEXT    NOT NULL,
    consensus_line  REAL,
    consensus_price REAL,
    dispersion      REAL,
    books_count     INTEGER NOT NULL,
    fetched_at      TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_consensus_lookup
    ON market_consensus_snapshots(event_id, market, outcome_name, fetched_at);

CREATE TABLE IF NOT EXISTS quote_move_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id     TEXT    NOT NULL,
    market_key   TEXT    NOT NULL,
    outcome_name TEXT    NOT NULL,
    venue        TEXT    NOT NULL,
    venue_tier   TEXT    NOT NULL,
    old_line     REAL,
    new_line     REAL,
    delta        REAL,
    old_price    INTEGER,
    new_price    INTEGER,
    timestamp    TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quote_moves_lookup
    ON quote_move_events(event_id, market_key, timestamp);

CREATE TABLE IF NOT EXISTS structural_events (
    id                         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id                   TEXT    NOT NULL,
    market_key                 TEXT    NOT NULL,
    outcome_name               TEXT    NOT NULL,
    threshold_value            REAL    NOT NULL,
    threshold_type             TEXT    NOT NULL,
    break_direction            TEXT    NOT NULL,
    origin_venue               TEXT    NOT NULL,
    origin_venue_tier          TEXT    NOT NULL,
    origin_timestamp           TEXT    NOT NULL,
    confirmation_timestamp     TEXT    NOT NULL,
    adoption_percentage        REAL,
    adoption_count             INTEGER NOT NULL,
    active_venue_count         INTEGER NOT NULL,
    time_to_consensus_seconds  INTEGER,
    dispersion_pre             REAL,
    dispersion_post            REAL,
    break_hold_minutes         REAL    NOT NULL,
    reversal_detected          INTEGER NOT NULL DEFAULT 0,
    reversal_timestamp         TEXT,
    UNIQUE (event_id, market_key, outcome_name, threshold_value, break_direction)
);

CREATE TABLE IF NOT EXISTS structural_event_venue_participation (
    structural_event_id INTEGER NOT NULL,
    venue                TEXT    NOT NULL,
    venue_tier           TEXT    NOT NULL,
    crossed_at           TEXT    NOT NULL,
    line_before          REAL,
    line_after           REAL,
    delta                REAL,
    UNIQUE (structural_event_id, venue),
    FOREIGN KEY (structural_event_id) REFERENCES structural_events(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS signals (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id         TEXT    NOT NULL,
    market           TEXT    NOT NULL,
    signal_type      TEXT    NOT NULL,
    direction        TEXT    NOT NULL,
    from_value       REAL,
    to_value         REAL,
    from_price       INTEGER,
    to_price         INTEGER,
    window_minutes   INTEGER NOT NULL,
    books_affected   INTEGER NOT NULL,
    velocity_minutes REAL    NOT NULL,
    time_bucket      TEXT    NOT NULL,
    strength_score   INTEGER NOT NULL,
    created_at       TEXT    NOT NULL,
    metadata         TEXT    NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_signals_event ON signals(event_id);
CREATE INDEX IF NOT EXISTS idx_signals_type_created ON signals(signal_type, created_at);

CREATE TABLE IF NOT EXISTS canonical_event_alignments (
    canonical_event_key   TEXT    PRIMARY KEY,
    sport                 TEXT    NOT NULL,
    league                TEXT    NOT NULL,
    home_team             TEXT    NOT NULL,
    away_team             TEXT    NOT NULL,
    start_time            TEXT    NOT NULL,
    sportsbook_event_id   TEXT    NOT NULL,
    kalshi_market_id      TEXT,
    polymarket_market_id  TEXT
);

CREATE TABLE IF NOT EXISTS exchange_quote_events (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_event_key  TEXT    NOT NULL,
    source               TEXT    NOT NULL,
    market_id            TEXT    NOT NULL,
    outcome_name         TEXT    NOT NULL,
    probability          REAL    NOT NULL,
    price                REAL,
    timestamp            TEXT    NOT NULL,
    UNIQUE (source, market_id, outcome_name, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_exchange_quotes_lookup
    ON exchange_quote_events(source, market_id, timestamp);

CREATE TABLE IF NOT EXISTS cross_market_lead_lag_events (
    id                                INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_event_key               TEXT    NOT NULL,
    threshold_type                    TEXT    NOT NULL,
    sportsbook_threshold_value        REAL    NOT NULL,
    exchange_probability_threshold    REAL    NOT NULL,
    lead_source                       TEXT    NOT NULL,
    sportsbook_break_timestamp        TEXT    NOT NULL,
    exchange_break_timestamp          TEXT    NOT NULL,
    lag_seconds                       INTEGER NOT NULL,
    UNIQUE (canonical_event_key, sportsbook_threshold_value, exchange_probability_threshold)
);

CREATE TABLE IF NOT EXISTS cross_market_divergence_events (
    id                               INTEGER PRIMARY KEY AUTOINCREMENT,
    canonical_event_key              TEXT    NOT NULL,
    divergence_type                 TEXT    NOT NULL,
    lead_source                      TEXT    NOT NULL,
    sportsbook_threshold_value       REAL,
    exchange_probability_threshold   REAL,
    sportsbook_break_timestamp       TEXT,
    exchange_break_timestamp         TEXT,
    lag_seconds                      INTEGER,
    resolved                         INTEGER NOT NULL DEFAULT 0,
    resolved_at                      TEXT,
    resolution_type                  TEXT,
    idempotency_key                  TEXT    NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS closing_consensus (
    event_id         TEXT    NOT NULL,
    market           TEXT    NOT NULL,
    outcome_name     TEXT    NOT NULL,
    close_line       REAL,
    close_price      REAL,
    close_fetched_at TEXT    NOT NULL,
    computed_at      TEXT    NOT NULL,
    PRIMARY KEY (event_id, market, outcome_name)
);

CREATE TABLE IF NOT EXISTS clv_records (
    signal_id     INTEGER PRIMARY KEY,
    event_id      TEXT    NOT NULL,
    signal_type   TEXT    NOT NULL,
    market        TEXT    NOT NULL,
    outcome_name  TEXT    NOT NULL,
    entry_line    REAL,
    entry_price   INTEGER,
    close_line    REAL,
    close_price   REAL,
    clv_line      REAL,
    clv_prob      REAL,
    computed_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS cycle_kpis (
    cycle_id                  TEXT    PRIMARY KEY,
    started_at                TEXT    NOT NULL,
    completed_at              TEXT,
    duration_ms               INTEGER,
    requests_used_delta       INTEGER,
    events_processed          INTEGER NOT NULL DEFAULT 0,
    snapshots_inserted        INTEGER NOT NULL DEFAULT 0,
    consensus_points_written  INTEGER NOT NULL DEFAULT 0,
    signals_created_total     INTEGER NOT NULL DEFAULT 0,
    signals_created_by_type   TEXT    NOT NULL DEFAULT '{}',
    alerts_sent               INTEGER NOT NULL DEFAULT 0,
    alerts_failed             INTEGER NOT NULL DEFAULT 0,
    degraded                  INTEGER NOT NULL DEFAULT 0,
    notes                     TEXT
);

CREATE TABLE IF NOT EXISTS webhook_endpoints (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    url                   TEXT    NOT NULL,
    secret                TEXT    NOT NULL,
    is_active             INTEGER NOT NULL DEFAULT 1,
    min_strength          INTEGER NOT NULL DEFAULT 1,
    market_gates          TEXT    NOT NULL DEFAULT '',
    cooldown_seconds      INTEGER NOT NULL DEFAULT 0,
    discord_webhook_url   TEXT
);

CREATE TABLE IF NOT EXISTS webhook_delivery_logs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    signal_id      INTEGER NOT NULL,
    subscriber_id  INTEGER NOT NULL,
    status         TEXT    NOT NULL,
    body_preview   TEXT    NOT NULL,
    duration_ms    INTEGER NOT NULL,
    error          TEXT,
    attempts       INTEGER NOT NULL,
    delivered_at   TEXT    NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    #[test]
    fn upsert_game_is_idempotent_on_event_id() {
        let db = test_db();
        let game = Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now(),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        };
        db.upsert_game(&game).unwrap();
        db.upsert_game(&game).unwrap();
        let fetched = db.get_game("evt1").unwrap().unwrap();
        assert_eq!(fetched.home_team, "BOS");
    }

    #[test]
    fn consensus_history_accumulates_and_latest_wins() {
        let db = test_db();
        let now = Utc::now();
        let mut snap = MarketConsensusSnapshot {
            event_id: "evt1".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            consensus_line: Some(-3.0),
            consensus_price: Some(-110.0),
            dispersion: Some(0.3),
            books_count: 5,
            fetched_at: now,
        };
        db.insert_consensus_snapshot(&snap).unwrap();
        snap.consensus_line = Some(-3.5);
        snap.books_count = 6;
        snap.fetched_at = now + chrono::Duration::minutes(5);
        db.insert_consensus_snapshot(&snap).unwrap();
        let got = db
            .get_latest_consensus("evt1", "spreads", "BOS")
            .unwrap()
            .unwrap();
        assert_eq!(got.consensus_line, Some(-3.5));
        assert_eq!(got.books_count, 6);
        assert_eq!(db.list_consensus("evt1", Some("spreads"), None).unwrap().len(), 2);
        assert_eq!(
            db.list_latest_consensus_per_outcome("evt1", "spreads")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn list_consensus_filters_by_sport_key_via_game_join() {
        let db = test_db();
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now(),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        let snap = MarketConsensusSnapshot {
            event_id: "evt1".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            consensus_line: Some(-3.0),
            consensus_price: Some(-110.0),
            dispersion: Some(0.3),
            books_count: 5,
            fetched_at: Utc::now(),
        };
        db.insert_consensus_snapshot(&snap).unwrap();
        assert_eq!(
            db.list_consensus("evt1", None, Some("basketball_nba")).unwrap().len(),
            1
        );
        assert_eq!(
            db.list_consensus("evt1", None, Some("americanfootball_nfl"))
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn list_latest_consensus_global_filters_by_sport_key_via_game_join() {
        let db = test_db();
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now(),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        db.insert_consensus_snapshot(&MarketConsensusSnapshot {
            event_id: "evt1".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            consensus_line: Some(-3.0),
            consensus_price: Some(-110.0),
            dispersion: Some(0.3),
            books_count: 5,
            fetched_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(
            db.list_latest_consensus_global(None, Some("basketball_nba"), 100, 0)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            db.list_latest_consensus_global(None, Some("americanfootball_nfl"), 100, 0)
                .unwrap()
                .len(),
            0
        );
        assert_eq!(
            db.list_latest_consensus_global(None, None, 100, 0).unwrap().len(),
            1
        );
    }

    #[test]
    fn list_signals_filters_by_sport_key_via_game_join() {
        let db = test_db();
        db.upsert_game(&Game {
            event_id: "nba1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now(),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        db.upsert_game(&Game {
            event_id: "nfl1".into(),
            sport_key: "americanfootball_nfl".into(),
            commence_time: Utc::now(),
            home_team: "KC".into(),
            away_team: "BUF".into(),
        })
        .unwrap();
        let base = Signal {
            id: None,
            event_id: "nba1".into(),
            market: "spreads".into(),
            signal_type: SignalType::Move,
            direction: SignalDirection::Down,
            from_value: Some(-3.0),
            to_value: Some(-3.5),
            from_price: None,
            to_price: None,
            window_minutes: 30,
            books_affected: 2,
            velocity_minutes: 10.0,
            time_bucket: TimeBucket::Pregame,
            strength_score: 5,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };
        db.insert_signal(&base).unwrap();
        let mut other = base.clone();
        other.event_id = "nfl1".into();
        db.insert_signal(&other).unwrap();

        let nba_only = db.list_signals(None, None, Some("basketball_nba"), 100, 0).unwrap();
        assert_eq!(nba_only.len(), 1);
        assert_eq!(nba_only[0].event_id, "nba1");

        let all = db.list_signals(None, None, None, 100, 0).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn divergence_event_is_idempotent_on_key() {
        let db = test_db();
        let now = Utc::now();
        let e = CrossMarketDivergenceEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            divergence_type: DivergenceType::Aligned,
            lead_source: LeadSource::None,
            sportsbook_threshold_value: Some(-3.5),
            exchange_probability_threshold: Some(0.55),
            sportsbook_break_timestamp: Some(now),
            exchange_break_timestamp: Some(now),
            lag_seconds: Some(0),
            resolved: false,
            resolved_at: None,
            resolution_type: None,
            idempotency_key: "evt1|ALIGNED|t0|t0|-3.5|0.55".into(),
        };
        assert!(db.insert_divergence_event(&e).unwrap());
        assert!(!db.insert_divergence_event(&e).unwrap());
        assert_eq!(db.list_divergence_events("evt1").unwrap().len(), 1);
    }

    #[test]
    fn clv_record_unique_on_signal_id() {
        let db = test_db();
        let now = Utc::now();
        let rec = ClvRecord {
            signal_id: 1,
            event_id: "evt1".into(),
            signal_type: SignalType::Dislocation,
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            entry_line: None,
            entry_price: Some(120),
            close_line: None,
            close_price: Some(-125.0),
            clv_line: None,
            clv_prob: Some(0.1011),
            computed_at: now,
        };
        assert!(db.insert_clv_record(&rec).unwrap());
        assert!(!db.insert_clv_record(&rec).unwrap());
    }

    #[test]
    fn list_clv_records_filters_by_sport_key_via_game_join() {
        let db = test_db();
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now(),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        let rec = ClvRecord {
            signal_id: 1,
            event_id: "evt1".into(),
            signal_type: SignalType::Dislocation,
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            entry_line: None,
            entry_price: Some(120),
            close_line: None,
            close_price: Some(-125.0),
            clv_line: None,
            clv_prob: Some(0.1011),
            computed_at: Utc::now(),
        };
        db.insert_clv_record(&rec).unwrap();
        assert_eq!(
            db.list_clv_records(None, Some("basketball_nba"), 100, 0).unwrap().len(),
            1
        );
        assert_eq!(
            db.list_clv_records(None, Some("basketball_ncaab"), 100, 0)
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn retention_sweep_deletes_only_expired_rows() {
        let db = test_db();
        let now = Utc::now();
        let old = OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "pinnacle".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            line: Some(-3.0),
            price: -110,
            fetched_at: now - Duration::hours(100),
        };
        let fresh = OddsSnapshot {
            fetched_at: now,
            ..old.clone()
        };
        db.insert_odds_snapshot(&old).unwrap();
        db.insert_odds_snapshot(&fresh).unwrap();
        let deleted = db
            .delete_expired_odds_snapshots(now - Duration::hours(48), 1000)
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
