//! MULTIBOOK_SYNC: per `(event, market, outcome)`, at least 3 books moving
//! the same direction within a 5-minute window.

use super::{clamp_score, cooldown_allows, time_bucket_for};
use crate::config::Config;
use crate::db::models::{Signal, SignalDirection, SignalType};
use crate::db::Database;
use crate::kv::KvStore;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

const WINDOW_MINUTES: i64 = 5;

pub fn detect(db: &Database, kv: &KvStore, config: &Config, event_id: &str, market: &str) -> Result<Vec<i64>> {
    if market == "h2h" {
        // h2h moves in price, not line; MULTIBOOK_SYNC is a line-movement rule.
        return Ok(vec![]);
    }
    let now = Utc::now();
    let since = now - chrono::Duration::minutes(WINDOW_MINUTES);
    let rows = db.list_odds_snapshots_in_window(event_id, market, since)?;

    let mut per_book: HashMap<(String, String), Vec<(f64, chrono::DateTime<Utc>)>> = HashMap::new();
    for row in &rows {
        let Some(line) = row.line else { continue };
        per_book
            .entry((row.outcome_name.clone(), row.sportsbook_key.clone()))
            .or_default()
            .push((line, row.fetched_at));
    }

    // (outcome, direction) -> list of (from, to)
    let mut grouped: HashMap<(String, SignalDirection), Vec<(f64, f64)>> = HashMap::new();
    for ((outcome, _book), mut points) in per_book {
        points.sort_by_key(|(_, ts)| *ts);
        let Some(&(from, _)) = points.first() else { continue };
        let Some(&(to, _)) = points.last() else { continue };
        if from == to {
            continue;
        }
        let direction = if to > from { SignalDirection::Up } else { SignalDirection::Down };
        grouped.entry((outcome, direction)).or_default().push((from, to));
    }

    let game = db.get_game(event_id)?;
    let commence_time = game.map(|g| g.commence_time);

    let mut ids = Vec::new();
    for ((outcome_name, direction), moves) in grouped {
        if moves.len() < 3 {
            continue;
        }
        let mean_from = moves.iter().map(|(f, _)| f).sum::<f64>() / moves.len() as f64;
        let mean_to = moves.iter().map(|(_, t)| t).sum::<f64>() / moves.len() as f64;

        let dedupe_key = format!(
            "cooldown:{event_id}:MULTIBOOK_SYNC:{market}:{outcome_name}:{}",
            direction.as_str()
        );
        if !cooldown_allows(kv, &dedupe_key, config.dislocation_cooldown_seconds.max(1) as u64) {
            continue;
        }

        let magnitude_score = ((mean_to - mean_from).abs() * 20.0).min(50.0);
        let books_score = (moves.len() as f64 * 6.0).min(40.0);
        let strength_score = clamp_score(magnitude_score + books_score);

        let signal = Signal {
            id: None,
            event_id: event_id.to_string(),
            market: market.to_string(),
            signal_type: SignalType::MultibookSync,
            direction,
            from_value: Some(mean_from),
            to_value: Some(mean_to),
            from_price: None,
            to_price: None,
            window_minutes: WINDOW_MINUTES,
            books_affected: moves.len() as i64,
            velocity_minutes: WINDOW_MINUTES as f64,
            time_bucket: time_bucket_for(now, commence_time),
            strength_score,
            created_at: now,
            metadata: HashMap::from([
                ("outcome_name".to_string(), json!(outcome_name)),
                (
                    "components".to_string(),
                    json!({"magnitude": magnitude_score, "books": books_score}),
                ),
            ]),
        };
        let id = db.insert_signal(&signal)?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Game, OddsSnapshot};
    use clap::Parser;

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
    fn triggers_when_three_books_move_same_direction() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(2),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        for book in ["pinnacle", "circa", "draftkings"] {
            snap(&db, book, -3.0, 4);
            snap(&db, book, -4.0, 1);
        }
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
        let signal = db.get_signal(ids[0]).unwrap().unwrap();
        assert_eq!(signal.books_affected, 3);
        assert_eq!(signal.from_value, Some(-3.0));
        assert_eq!(signal.to_value, Some(-4.0));
    }

    #[test]
    fn does_not_trigger_with_two_books() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(2),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        for book in ["pinnacle", "circa"] {
            snap(&db, book, -3.0, 4);
            snap(&db, book, -4.0, 1);
        }
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert!(ids.is_empty());
    }
}
