//! LIVE_SHOCK: a large, fast reprice while an event is in-play. Strength
//! is fixed at 100 regardless of magnitude — see DESIGN.md for why that's
//! preserved as-is rather than folded into the usual additive scoring.

use super::{cooldown_allows, minutes_to_tip, time_bucket_for};
use crate::config::Config;
use crate::db::models::{Signal, SignalDirection, SignalType};
use crate::db::Database;
use crate::kv::KvStore;
use crate::oddsmath::implied_probability;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

const WINDOW_MINUTES: i64 = 5;

fn threshold_for(market: &str) -> f64 {
    match market {
        "totals" => 6.5,
        "h2h" => 0.15,
        _ => 4.5,
    }
}

pub fn detect(db: &Database, kv: &KvStore, config: &Config, event_id: &str, market: &str) -> Result<Vec<i64>> {
    let now = Utc::now();
    let Some(game) = db.get_game(event_id)? else {
        return Ok(vec![]);
    };
    let minutes = minutes_to_tip(now, game.commence_time);
    if !(-240.0..=5.0).contains(&minutes) {
        return Ok(vec![]);
    }

    let since = now - chrono::Duration::minutes(WINDOW_MINUTES);
    let rows = db.list_odds_snapshots_in_window(event_id, market, since)?;
    let threshold = threshold_for(market);

    let mut earliest: HashMap<String, f64> = HashMap::new();
    let mut latest: HashMap<String, (f64, &str)> = HashMap::new();
    let mut first_ts: HashMap<String, chrono::DateTime<Utc>> = HashMap::new();
    let mut last_ts: HashMap<String, chrono::DateTime<Utc>> = HashMap::new();

    for row in &rows {
        let value = if market == "h2h" {
            implied_probability(row.price as f64)
        } else {
            match row.line {
                Some(l) => l,
                None => continue,
            }
        };
        let entry_first = first_ts.entry(row.outcome_name.clone()).or_insert(row.fetched_at);
        if row.fetched_at <= *entry_first {
            *entry_first = row.fetched_at;
            earliest.insert(row.outcome_name.clone(), value);
        }
        let entry_last = last_ts.entry(row.outcome_name.clone()).or_insert(row.fetched_at);
        if row.fetched_at >= *entry_last {
            *entry_last = row.fetched_at;
            latest.insert(row.outcome_name.clone(), (value, row.sportsbook_key.as_str()));
        }
    }

    let mut ids = Vec::new();
    for (outcome_name, from_value) in earliest {
        let Some(&(to_value, _book)) = latest.get(&outcome_name) else { continue };
        let delta = to_value - from_value;
        if delta.abs() < threshold {
            continue;
        }

        let dedupe_key = format!("cooldown:{event_id}:LIVE_SHOCK:{market}:{outcome_name}");
        if !cooldown_allows(kv, &dedupe_key, config.dislocation_cooldown_seconds.max(1) as u64) {
            continue;
        }

        let signal = Signal {
            id: None,
            event_id: event_id.to_string(),
            market: market.to_string(),
            signal_type: SignalType::LiveShock,
            direction: if delta > 0.0 { SignalDirection::Up } else { SignalDirection::Down },
            from_value: Some(from_value),
            to_value: Some(to_value),
            from_price: None,
            to_price: None,
            window_minutes: WINDOW_MINUTES,
            books_affected: 1,
            velocity_minutes: WINDOW_MINUTES as f64,
            time_bucket: time_bucket_for(now, Some(game.commence_time)),
            strength_score: 100,
            created_at: now,
            metadata: HashMap::from([
                ("outcome_name".to_string(), json!(outcome_name)),
                ("minutes_to_tip".to_string(), json!(minutes)),
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

    #[test]
    fn live_shock_always_scores_100() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() - chrono::Duration::minutes(30),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "pinnacle".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            line: Some(-3.0),
            price: -110,
            fetched_at: Utc::now() - chrono::Duration::minutes(4),
        })
        .unwrap();
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "pinnacle".into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            line: Some(-8.0),
            price: -110,
            fetched_at: Utc::now(),
        })
        .unwrap();
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
        let signal = db.get_signal(ids[0]).unwrap().unwrap();
        assert_eq!(signal.strength_score, 100);
    }

    #[test]
    fn skips_events_not_currently_live() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(5),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert!(ids.is_empty());
    }
}
