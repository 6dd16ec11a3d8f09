//! DISLOCATION: one book's latest quote diverging from the market
//! consensus by more than a market-specific threshold.

use super::{clamp_score, cooldown_allows, time_bucket_for};
use crate::config::Config;
use crate::db::models::{Signal, SignalDirection, SignalType};
use crate::db::Database;
use crate::kv::KvStore;
use crate::oddsmath::implied_probability;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

struct Scored {
    book: String,
    outcome_name: String,
    from_value: f64,
    to_value: f64,
    from_price: Option<i64>,
    to_price: Option<i64>,
    delta: f64,
    strength: f64,
}

fn threshold_for(config: &Config, market: &str) -> f64 {
    match market {
        "totals" => config.dislocation_total_line_delta,
        "h2h" => config.dislocation_ml_implied_prob_delta,
        _ => config.dislocation_spread_line_delta,
    }
}

pub fn detect(db: &Database, kv: &KvStore, config: &Config, event_id: &str, market: &str) -> Result<Vec<i64>> {
    let now = Utc::now();
    let since = now - chrono::Duration::minutes(config.dislocation_lookback_minutes);
    let threshold = threshold_for(config, market);

    let consensus_rows = db.list_latest_consensus_per_outcome(event_id, market)?;
    let snapshots = db.latest_snapshots_in_window(event_id, market, since)?;

    let mut by_outcome_book: HashMap<(String, String), f64> = HashMap::new();
    let mut raw_by_outcome_book: HashMap<(String, String), (f64, f64)> = HashMap::new();
    for row in &snapshots {
        let value = if market == "h2h" {
            implied_probability(row.price as f64)
        } else {
            match row.line {
                Some(l) => l,
                None => continue,
            }
        };
        by_outcome_book.insert((row.outcome_name.clone(), row.sportsbook_key.clone()), value);
        raw_by_outcome_book.insert(
            (row.outcome_name.clone(), row.sportsbook_key.clone()),
            (row.line.unwrap_or(row.price as f64), value),
        );
    }

    let mut scored = Vec::new();
    for consensus in &consensus_rows {
        if consensus.books_count < config.dislocation_min_books {
            continue;
        }
        let consensus_value = if market == "h2h" {
            consensus
                .consensus_price
                .map(implied_probability)
        } else {
            consensus.consensus_line
        };
        let Some(consensus_value) = consensus_value else { continue };

        for ((outcome_name, book), value) in &by_outcome_book {
            if outcome_name != &consensus.outcome_name {
                continue;
            }
            let delta = value - consensus_value;
            if delta.abs() < threshold {
                continue;
            }
            let (from_price, to_price) = if market == "h2h" {
                let raw_book_price = raw_by_outcome_book.get(&(outcome_name.clone(), book.clone())).map(|(p, _)| *p as i64);
                (consensus.consensus_price.map(|p| p as i64), raw_book_price)
            } else {
                (None, None)
            };
            scored.push(Scored {
                book: book.clone(),
                outcome_name: outcome_name.clone(),
                from_value: consensus_value,
                to_value: *value,
                from_price,
                to_price,
                delta,
                strength: clamp_score((delta.abs() / threshold) * 50.0) as f64,
            });
        }
    }

    scored.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap()
            .then(b.delta.abs().partial_cmp(&a.delta.abs()).unwrap())
    });
    scored.truncate(config.dislocation_max_signals_per_event);

    let game = db.get_game(event_id)?;
    let commence_time = game.map(|g| g.commence_time);

    let mut ids = Vec::new();
    for s in scored {
        let dedupe_key = format!("cooldown:{event_id}:DISLOCATION:{market}:{}:{}", s.outcome_name, s.book);
        if !cooldown_allows(kv, &dedupe_key, config.dislocation_cooldown_seconds as u64) {
            continue;
        }

        let signal = Signal {
            id: None,
            event_id: event_id.to_string(),
            market: market.to_string(),
            signal_type: SignalType::Dislocation,
            direction: if s.delta > 0.0 {
                SignalDirection::Up
            } else {
                SignalDirection::Down
            },
            from_value: Some(s.from_value),
            to_value: Some(s.to_value),
            from_price: s.from_price,
            to_price: s.to_price,
            window_minutes: config.dislocation_lookback_minutes,
            books_affected: 1,
            velocity_minutes: 0.0,
            time_bucket: time_bucket_for(now, commence_time),
            strength_score: s.strength.round().clamp(1.0, 100.0) as i64,
            created_at: now,
            metadata: HashMap::from([
                ("outcome_name".to_string(), json!(s.outcome_name)),
                ("book".to_string(), json!(s.book)),
                ("delta".to_string(), json!(s.delta)),
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
    use crate::db::models::{Game, MarketConsensusSnapshot, OddsSnapshot};
    use clap::Parser;

    fn setup(db: &Database) {
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(2),
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
    }

    #[test]
    fn flags_a_book_diverging_from_consensus() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        setup(&db);
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "betmgm".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            line: Some(-4.5),
            price: -110,
            fetched_at: Utc::now(),
        })
        .unwrap();
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
        let signal = db.get_signal(ids[0]).unwrap().unwrap();
        assert_eq!(signal.metadata.get("book").unwrap(), &json!("betmgm"));
    }

    #[test]
    fn caps_signals_per_event() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let mut config = Config::parse_from(["stratum-engine"]);
        config.dislocation_max_signals_per_event = 1;
        setup(&db);
        for (book, line) in [("betmgm", -4.5), ("caesars", -5.0), ("fanduel", -5.5)] {
            db.insert_odds_snapshot(&OddsSnapshot {
                id: None,
                event_id: "evt1".into(),
                sport_key: "basketball_nba".into(),
                sportsbook_key: book.into(),
                market: "spreads".into(),
                outcome_name: "BOS".into(),
                line: Some(line),
                price: -110,
                fetched_at: Utc::now(),
            })
            .unwrap();
        }
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
    }
}
