//! MOVE / KEY_CROSS: per `(event, outcome)` line movement over a rolling
//! window, for `spreads` (10m) and `totals` (15m).

use super::{clamp_score, cooldown_allows, time_bucket_for};
use crate::config::Config;
use crate::db::models::{Signal, SignalDirection, SignalType};
use crate::db::Database;
use crate::kv::KvStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

struct Candidate {
    outcome_name: String,
    from_value: f64,
    to_value: f64,
    from_ts: DateTime<Utc>,
    to_ts: DateTime<Utc>,
    books: usize,
}

fn window_for(market: &str) -> i64 {
    match market {
        "totals" => 15,
        _ => 10,
    }
}

fn threshold_for(market: &str) -> f64 {
    match market {
        "totals" => 1.0,
        _ => 0.5,
    }
}

fn crossed_key_number(from: f64, to: f64, key_numbers: &[f64]) -> bool {
    let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
    key_numbers.iter().any(|k| lo < *k && *k < hi)
}

fn find_candidates(db: &Database, event_id: &str, market: &str, since: DateTime<Utc>) -> Result<Vec<Candidate>> {
    let rows = db.list_odds_snapshots_in_window(event_id, market, since)?;

    let mut earliest: HashMap<String, (f64, DateTime<Utc>)> = HashMap::new();
    let mut latest: HashMap<String, (f64, DateTime<Utc>)> = HashMap::new();
    let mut books: HashMap<String, std::collections::HashSet<String>> = HashMap::new();

    for row in &rows {
        let Some(line) = row.line else { continue };
        books
            .entry(row.outcome_name.clone())
            .or_default()
            .insert(row.sportsbook_key.clone());
        earliest
            .entry(row.outcome_name.clone())
            .and_modify(|(v, ts)| {
                if row.fetched_at < *ts {
                    *v = line;
                    *ts = row.fetched_at;
                }
            })
            .or_insert((line, row.fetched_at));
        latest
            .entry(row.outcome_name.clone())
            .and_modify(|(v, ts)| {
                if row.fetched_at > *ts {
                    *v = line;
                    *ts = row.fetched_at;
                }
            })
            .or_insert((line, row.fetched_at));
    }

    let mut candidates = Vec::new();
    for (outcome_name, (to_value, to_ts)) in latest {
        let Some((from_value, from_ts)) = earliest.remove(&outcome_name) else {
            continue;
        };
        let book_count = books.get(&outcome_name).map(|s| s.len()).unwrap_or(0);
        candidates.push(Candidate {
            outcome_name,
            from_value,
            to_value,
            from_ts,
            to_ts,
            books: book_count,
        });
    }
    Ok(candidates)
}

pub fn detect(db: &Database, kv: &KvStore, config: &Config, event_id: &str, market: &str) -> Result<Vec<i64>> {
    if market != "spreads" && market != "totals" {
        return Ok(vec![]);
    }
    let now = Utc::now();
    let window_minutes = window_for(market);
    let since = now - chrono::Duration::minutes(window_minutes);
    let threshold = threshold_for(market);
    let key_numbers = config.nba_key_numbers_list();

    let game = db.get_game(event_id)?;
    let commence_time = game.map(|g| g.commence_time);

    let mut ids = Vec::new();
    for candidate in find_candidates(db, event_id, market, since)? {
        let delta = candidate.to_value - candidate.from_value;
        if delta.abs() < threshold && !crossed_key_number(candidate.from_value, candidate.to_value, &key_numbers) {
            continue;
        }

        let is_key_cross = market == "spreads"
            && crossed_key_number(candidate.from_value, candidate.to_value, &key_numbers);
        let signal_type = if is_key_cross {
            SignalType::KeyCross
        } else {
            SignalType::Move
        };

        let dedupe_key = format!(
            "cooldown:{event_id}:{}:{market}:{}:{:.1}:{:.1}:{window_minutes}",
            signal_type.as_str(),
            candidate.outcome_name,
            candidate.from_value,
            candidate.to_value,
        );
        if !cooldown_allows(kv, &dedupe_key, config.dislocation_cooldown_seconds.max(1) as u64) {
            continue;
        }

        let velocity_minutes = (candidate.to_ts - candidate.from_ts).num_seconds() as f64 / 60.0;
        let magnitude_score = (delta.abs() / threshold * 40.0).min(60.0);
        let speed_score = if velocity_minutes > 0.0 {
            (window_minutes as f64 / velocity_minutes).min(1.0) * 20.0
        } else {
            20.0
        };
        let books_score = (candidate.books as f64 * 4.0).min(20.0);
        let strength_score = clamp_score(magnitude_score + speed_score + books_score);

        let signal = Signal {
            id: None,
            event_id: event_id.to_string(),
            market: market.to_string(),
            signal_type,
            direction: if delta > 0.0 {
                SignalDirection::Up
            } else if delta < 0.0 {
                SignalDirection::Down
            } else {
                SignalDirection::Flat
            },
            from_value: Some(candidate.from_value),
            to_value: Some(candidate.to_value),
            from_price: None,
            to_price: None,
            window_minutes,
            books_affected: candidate.books as i64,
            velocity_minutes,
            time_bucket: time_bucket_for(now, commence_time),
            strength_score,
            created_at: now,
            metadata: HashMap::from([
                ("outcome_name".to_string(), json!(candidate.outcome_name)),
                ("key_cross".to_string(), json!(is_key_cross)),
                (
                    "components".to_string(),
                    json!({"magnitude": magnitude_score, "speed": speed_score, "books": books_score}),
                ),
            ]),
        };
        let id = db.insert_signal(&signal)?;
        info!(event_id, market, signal_type = signal.signal_type.as_str(), "signal emitted");
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Game, OddsSnapshot};
    use clap::Parser;

    fn setup_game(db: &Database) {
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(3),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
    }

    fn snap(db: &Database, book: &str, line: f64, minutes_ago: i64) {
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: book.into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            line: Some(line),
            price: -110,
            fetched_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        })
        .unwrap();
    }

    #[test]
    fn move_triggers_and_dedupes() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        setup_game(&db);
        snap(&db, "pinnacle", -3.0, 10);
        snap(&db, "circa", -3.0, 10);
        snap(&db, "pinnacle", -3.5, 5);
        snap(&db, "circa", -3.4, 5);
        snap(&db, "pinnacle", -4.0, 1);
        snap(&db, "circa", -4.0, 1);

        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
        let signal = db.get_signal(ids[0]).unwrap().unwrap();
        assert_eq!(signal.signal_type, SignalType::Move);
        assert_eq!(signal.direction, SignalDirection::Down);
        assert_eq!(signal.from_value, Some(-3.0));
        assert_eq!(signal.to_value, Some(-4.0));

        let again = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn key_cross_detected_when_crossing_configured_number() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        setup_game(&db);
        snap(&db, "pinnacle", -2.5, 10);
        snap(&db, "pinnacle", -3.5, 1);

        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
        let signal = db.get_signal(ids[0]).unwrap().unwrap();
        assert_eq!(signal.signal_type, SignalType::KeyCross);
        assert_eq!(signal.metadata.get("key_cross").unwrap(), &json!(true));
    }
}
