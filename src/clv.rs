//! C8 — closing consensus selection and closing-line-value (CLV)
//! computation, plus idempotent historical backfill for games whose
//! closing consensus was never captured live.

use crate::config::Config;
use crate::db::models::{ClosingConsensus, ClvRecord, Signal};
use crate::db::Database;
use crate::ingestion::odds::{parse_event_quotes, OddsApiClient};
use crate::oddsmath::{implied_probability, median};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Picks, for every outcome of every configured market on a just-finished
/// game, the latest consensus struck at or before `commence_time` and
/// upserts it as that outcome's `ClosingConsensus`. Called once a game's
/// tipoff has passed; safe to re-run (upsert on the unique key).
pub fn select_closing_consensus(db: &Database, config: &Config, event_id: &str) -> Result<usize> {
    let Some(game) = db.get_game(event_id)? else {
        return Ok(0);
    };
    let mut written = 0;
    for market in config.consensus_markets_list() {
        let history = db.list_consensus(event_id, Some(&market), None)?;
        let outcomes: HashSet<String> = history.iter().map(|c| c.outcome_name.clone()).collect();
        for outcome_name in outcomes {
            let Some(closing) =
                db.latest_consensus_before(event_id, &market, &outcome_name, game.commence_time)?
            else {
                continue;
            };
            db.upsert_closing_consensus(&ClosingConsensus {
                event_id: event_id.to_string(),
                market: market.clone(),
                outcome_name,
                close_line: closing.consensus_line,
                close_price: closing.consensus_price,
                close_fetched_at: closing.fetched_at,
                computed_at: Utc::now(),
            })?;
            written += 1;
        }
    }
    Ok(written)
}

/// Resolved entry line/price a signal actually traded at, preferring the
/// metadata fields a detector stashed (`book_line`/`end_line`/`book_price`)
/// over the signal's own `to_value`/`to_price`, since some rules (e.g.
/// DISLOCATION) record the divergence delta in `to_value` but the raw book
/// quote in metadata.
fn resolve_entry(signal: &Signal) -> (Option<f64>, Option<i64>) {
    let meta_f64 = |key: &str| signal.metadata.get(key).and_then(|v| v.as_f64());
    let meta_i64 = |key: &str| signal.metadata.get(key).and_then(|v| v.as_i64());

    let entry_line = meta_f64("book_line")
        .or_else(|| meta_f64("end_line"))
        .or(signal.to_value);
    let entry_price = meta_i64("book_price")
        .or_else(|| meta_f64("to_price").map(|p| p as i64))
        .or(signal.to_price);
    (entry_line, entry_price)
}

/// Inserts one `ClvRecord` per signal returned by
/// [`Database::list_signals_awaiting_clv`], computing `clv_line` and
/// `clv_prob` from the signal's entry value and the game's
/// `ClosingConsensus`. Skips (does not insert) a signal whose market/
/// outcome has no closing consensus yet — it remains a candidate for the
/// next run. Insert is itself idempotent on `signal_id`, so a signal that
/// already has a record is never revisited (the caller's query excludes it).
/// Returns the records actually written, so the caller can fan them out as
/// `signal.clv_finalized` webhooks.
pub fn compute_for_eligible_signals(db: &Database, config: &Config) -> Result<Vec<ClvRecord>> {
    if !config.clv_enabled {
        return Ok(vec![]);
    }
    let cutoff = Utc::now() - Duration::minutes(config.clv_minutes_after_commence);
    let signals = db.list_signals_awaiting_clv(cutoff, 500)?;

    let mut written = Vec::new();
    for signal in signals {
        let outcome_name = signal
            .metadata
            .get("outcome_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let Some(outcome_name) = outcome_name else {
            debug!(signal_id = signal.id, "signal has no outcome_name in metadata, skipping CLV");
            continue;
        };
        let Some(closing) = db.get_closing_consensus(&signal.event_id, &signal.market, &outcome_name)? else {
            continue;
        };

        let (entry_line, entry_price) = resolve_entry(&signal);

        let clv_line = match (closing.close_line, entry_line) {
            (Some(close), Some(entry)) => Some(close - entry),
            _ => None,
        };
        let clv_prob = match (closing.close_price, entry_price) {
            (Some(close_price), Some(entry_price)) => {
                Some(implied_probability(close_price) - implied_probability(entry_price as f64))
            }
            _ => None,
        };

        let record = ClvRecord {
            signal_id: signal.id.unwrap_or_default(),
            event_id: signal.event_id.clone(),
            signal_type: signal.signal_type,
            market: signal.market.clone(),
            outcome_name,
            entry_line,
            entry_price,
            close_line: closing.close_line,
            close_price: closing.close_price,
            clv_line,
            clv_prob,
            computed_at: Utc::now(),
        };
        if db.insert_clv_record(&record)? {
            written.push(record);
        }
    }
    Ok(written)
}

/// Drives C8 on its own timer (`CLV_JOB_INTERVAL_MINUTES`), independent of
/// the ingestion/detection cycle: per spec, closing selection and CLV
/// computation run periodically and on post-tipoff, not once per tick.
/// Newly finalized CLV records are handed to [`crate::alerts::dispatch_clv`].
pub async fn run_forever(
    db: Database,
    config: Config,
    client: std::sync::Arc<OddsApiClient>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(config.clv_job_interval_minutes * 60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_once(&db, &config, &client).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_once(db: &Database, config: &Config, client: &OddsApiClient) {
    let now = Utc::now();
    match db.list_active_games(now, 24) {
        Ok(games) => {
            for game in games {
                if now >= game.commence_time {
                    if let Err(e) = select_closing_consensus(db, config, &game.event_id) {
                        warn!(event_id = %game.event_id, error = %e, "closing consensus selection failed");
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to list games for closing-consensus pass"),
    }

    match compute_for_eligible_signals(db, config) {
        Ok(records) if !records.is_empty() => {
            crate::alerts::dispatch_clv(db.clone(), config.clone(), records).await;
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "CLV computation failed"),
    }

    if let Err(e) = backfill_missing_closes(db, config, client).await {
        warn!(error = %e, "closing-consensus backfill run failed");
    }
}

/// Offsets relative to commence_time at which to sample historical odds,
/// negative before tipoff and positive after, denser the closer to tipoff
/// since that's where the line moves fastest. The post-tipoff entries exist
/// so an event whose historical feed has no pre-tipoff sample (a late add,
/// or a provider gap) still resolves to an inferred close instead of
/// nothing.
const BACKFILL_OFFSETS_MINUTES: &[i64] =
    &[-180, -120, -90, -60, -45, -30, -20, -10, -5, 0, 5, 10, 20, 30, 45, 60];

#[derive(Debug, Default)]
pub struct BackfillOutcome {
    pub events_scanned: usize,
    pub events_closed: usize,
    pub events_inferred: usize,
    pub events_failed: usize,
}

/// `BackfillMissingCloses` — scans recently finished games with some
/// signal/snapshot history but no `ClosingConsensus`, replays historical
/// odds at tip-aware offsets, and derives a closing consensus the same way
/// the live consensus engine would have. One bad event is logged and
/// skipped; it never aborts the run. Commits per event so a partial run
/// still saved progress.
pub async fn backfill_missing_closes(
    db: &Database,
    config: &Config,
    client: &OddsApiClient,
) -> Result<BackfillOutcome> {
    let mut outcome = BackfillOutcome::default();
    if !config.enable_historical_backfill {
        return Ok(outcome);
    }
    let now = Utc::now();
    let event_ids = db.events_missing_closing_consensus(
        config.historical_backfill_lookback_hours,
        now,
        config.historical_backfill_max_games_per_run,
    )?;

    for event_id in event_ids {
        outcome.events_scanned += 1;
        match backfill_one_event(db, config, client, &event_id, now).await {
            Ok(Some(inferred)) => {
                outcome.events_closed += 1;
                if inferred {
                    outcome.events_inferred += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "closing backfill failed for event, skipping");
                outcome.events_failed += 1;
            }
        }
    }
    Ok(outcome)
}

/// Returns `Ok(Some(true))` if a close was written and had to be inferred
/// from the earliest post-tipoff sample (no pre-tipoff sample existed),
/// `Ok(Some(false))` for a normal pre-tipoff close, `Ok(None)` if nothing
/// usable was found.
async fn backfill_one_event(
    db: &Database,
    config: &Config,
    client: &OddsApiClient,
    event_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<bool>> {
    let Some(game) = db.get_game(event_id)? else {
        return Ok(None);
    };

    // (market, outcome) -> samples of (fetched_at, line, price)
    let mut samples: HashMap<(String, String), Vec<(DateTime<Utc>, Option<f64>, f64)>> = HashMap::new();

    for offset_minutes in BACKFILL_OFFSETS_MINUTES {
        let at = game.commence_time + Duration::minutes(*offset_minutes);
        if at > now {
            continue;
        }
        let events = client
            .fetch_historical_odds(config, &game.sport_key, event_id, at)
            .await?;
        let Some(payload) = events.into_iter().find(|e| e.id == event_id) else {
            continue;
        };
        let quotes = parse_event_quotes(&payload, None, &config.consensus_markets_list());
        let mut by_market_outcome: HashMap<(String, String), Vec<(Option<f64>, f64)>> = HashMap::new();
        for q in quotes {
            by_market_outcome
                .entry((q.market.clone(), q.outcome_name.clone()))
                .or_default()
                .push((q.line, q.price as f64));
        }
        for (key, books) in by_market_outcome {
            let lines: Vec<f64> = books.iter().filter_map(|(l, _)| *l).collect();
            let prices: Vec<f64> = books.iter().map(|(_, p)| *p).collect();
            let Some(price) = median(&prices) else { continue };
            let line = median(&lines);
            samples.entry(key).or_default().push((at, line, price));
        }
    }

    if samples.is_empty() {
        return Ok(None);
    }

    let mut any_written = false;
    let mut any_inferred = false;
    for ((market, outcome_name), mut points) in samples {
        points.sort_by_key(|(at, _, _)| *at);
        let pre_tipoff = points.iter().rev().find(|(at, _, _)| *at <= game.commence_time);
        let (chosen, inferred) = match pre_tipoff {
            Some(p) => (*p, false),
            None => (points[0], true),
        };
        let (fetched_at, line, price) = chosen;
        db.upsert_closing_consensus(&ClosingConsensus {
            event_id: event_id.to_string(),
            market,
            outcome_name,
            close_line: line,
            close_price: Some(price),
            close_fetched_at: fetched_at,
            computed_at: now,
        })?;
        any_written = true;
        any_inferred |= inferred;
    }

    if any_inferred {
        debug!(event_id = %event_id, "closing consensus inferred from earliest post-tipoff sample");
    }
    Ok(any_written.then_some(any_inferred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Game, MarketConsensusSnapshot, SignalDirection, SignalType, TimeBucket};
    use clap::Parser;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn setup() -> (Database, Config) {
        let db = Database::open(":memory:").unwrap();
        let config = Config::parse_from(["stratum-engine"]);
        (db, config)
    }

    #[test]
    fn closing_selection_picks_latest_pre_tipoff_consensus() {
        let (db, config) = setup();
        let commence = Utc::now();
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: commence,
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
            dispersion: Some(0.2),
            books_count: 5,
            fetched_at: commence - Duration::minutes(30),
        })
        .unwrap();
        db.insert_consensus_snapshot(&MarketConsensusSnapshot {
            event_id: "evt1".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            consensus_line: Some(-3.5),
            consensus_price: Some(-112.0),
            dispersion: Some(0.2),
            books_count: 5,
            fetched_at: commence - Duration::minutes(2),
        })
        .unwrap();
        // Struck after tipoff: must never be selected as the close.
        db.insert_consensus_snapshot(&MarketConsensusSnapshot {
            event_id: "evt1".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            consensus_line: Some(-5.0),
            consensus_price: Some(-120.0),
            dispersion: Some(0.2),
            books_count: 5,
            fetched_at: commence + Duration::minutes(5),
        })
        .unwrap();

        let written = select_closing_consensus(&db, &config, "evt1").unwrap();
        assert!(written >= 1);
        let closing = db.get_closing_consensus("evt1", "spreads", "BOS").unwrap().unwrap();
        assert_eq!(closing.close_line, Some(-3.5));
    }

    #[test]
    fn clv_is_computed_once_per_signal() {
        let (db, mut config) = setup();
        config.clv_minutes_after_commence = 0;
        let commence = Utc::now() - Duration::hours(3);
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: commence,
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        db.upsert_closing_consensus(&ClosingConsensus {
            event_id: "evt1".into(),
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            close_line: None,
            close_price: Some(-125.0),
            close_fetched_at: commence,
            computed_at: Utc::now(),
        })
        .unwrap();

        let mut metadata = Map::new();
        metadata.insert("outcome_name".to_string(), json!("BOS"));
        let signal = Signal {
            id: None,
            event_id: "evt1".into(),
            market: "h2h".into(),
            signal_type: SignalType::Dislocation,
            direction: SignalDirection::Up,
            from_value: None,
            to_value: None,
            from_price: None,
            to_price: Some(120),
            window_minutes: 10,
            books_affected: 1,
            velocity_minutes: 0.0,
            time_bucket: TimeBucket::Pretip,
            strength_score: 50,
            created_at: commence - Duration::minutes(20),
            metadata,
        };
        let signal_id = db.insert_signal(&signal).unwrap();

        let written = compute_for_eligible_signals(&db, &config).unwrap();
        assert_eq!(written.len(), 1);
        let record = db.get_clv_record(signal_id).unwrap().unwrap();
        assert_eq!(record.clv_line, None);
        assert!((record.clv_prob.unwrap() - (implied_probability(-125.0) - implied_probability(120.0))).abs() < 1e-9);

        // Re-running inserts nothing new: the query excludes already-computed signals.
        let written_again = compute_for_eligible_signals(&db, &config).unwrap();
        assert!(written_again.is_empty());
    }
}
