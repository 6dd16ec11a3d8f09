//! STEAM: a fast, wide move — several books' lines all crossing a
//! meaningful chunk of the market threshold within a short window.

use super::{clamp_score, cooldown_allows, time_bucket_for};
use crate::config::Config;
use crate::db::models::{Signal, SignalDirection, SignalType};
use crate::db::Database;
use crate::kv::KvStore;
use crate::oddsmath::median;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

fn market_threshold(market: &str) -> f64 {
    if market == "totals" {
        1.0
    } else {
        0.5
    }
}

pub fn detect(db: &Database, kv: &KvStore, config: &Config, event_id: &str, market: &str) -> Result<Vec<i64>> {
    if market == "h2h" {
        return Ok(vec![]);
    }
    let now = Utc::now();
    let since = now - chrono::Duration::minutes(config.steam_window_minutes);
    let rows = db.list_odds_snapshots_in_window(event_id, market, since)?;
    let threshold = market_threshold(market);
    let per_book_floor = 0.4 * threshold;

    let mut per_book: HashMap<(String, String), Vec<(f64, chrono::DateTime<Utc>)>> = HashMap::new();
    for row in &rows {
        let Some(line) = row.line else { continue };
        per_book
            .entry((row.outcome_name.clone(), row.sportsbook_key.clone()))
            .or_default()
            .push((line, row.fetched_at));
    }

    // (outcome, direction) -> per-book (start, end)
    let mut grouped: HashMap<(String, SignalDirection), Vec<(f64, f64)>> = HashMap::new();
    for ((outcome, _book), mut points) in per_book {
        points.sort_by_key(|(_, ts)| *ts);
        let Some(&(start, _)) = points.first() else { continue };
        let Some(&(end, _)) = points.last() else { continue };
        let delta = end - start;
        if delta.abs() < per_book_floor {
            continue;
        }
        let direction = if delta > 0.0 { SignalDirection::Up } else { SignalDirection::Down };
        grouped.entry((outcome, direction)).or_default().push((start, end));
    }

    let game = db.get_game(event_id)?;
    let commence_time = game.map(|g| g.commence_time);

    let mut ids = Vec::new();
    let mut emitted = 0usize;
    for ((outcome_name, direction), points) in grouped {
        if emitted >= config.steam_max_signals_per_event {
            break;
        }
        if points.len() < config.steam_min_books as usize {
            continue;
        }
        let starts: Vec<f64> = points.iter().map(|(s, _)| *s).collect();
        let ends: Vec<f64> = points.iter().map(|(_, e)| *e).collect();
        let Some(median_start) = median(&starts) else { continue };
        let Some(median_end) = median(&ends) else { continue };
        if (median_end - median_start).abs() < threshold {
            continue;
        }

        let dedupe_key = format!(
            "cooldown:{event_id}:STEAM:{market}:{outcome_name}:{}",
            direction.as_str()
        );
        if !cooldown_allows(kv, &dedupe_key, config.steam_cooldown_seconds as u64) {
            continue;
        }

        let magnitude_score = ((median_end - median_start).abs() / threshold * 40.0).min(60.0);
        let books_score = (points.len() as f64 * 5.0).min(40.0);
        let strength_score = clamp_score(magnitude_score + books_score);

        let signal = Signal {
            id: None,
            event_id: event_id.to_string(),
            market: market.to_string(),
            signal_type: SignalType::Steam,
            direction,
            from_value: Some(median_start),
            to_value: Some(median_end),
            from_price: None,
            to_price: None,
            window_minutes: config.steam_window_minutes,
            books_affected: points.len() as i64,
            velocity_minutes: config.steam_window_minutes as f64,
            time_bucket: time_bucket_for(now, commence_time),
            strength_score,
            created_at: now,
            metadata: HashMap::from([("outcome_name".to_string(), json!(outcome_name))]),
        };
        let id = db.insert_signal(&signal)?;
        ids.push(id);
        emitted += 1;
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
    fn triggers_on_wide_fast_move_across_books() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let mut config = Config::parse_from(["stratum-engine"]);
        config.steam_min_books = 3;
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(2),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        for book in ["pinnacle", "circa", "draftkings", "fanduel"] {
            snap(&db, book, -3.0, 2);
            snap(&db, book, -4.0, 0);
        }
        let ids = detect(&db, &kv, &config, "evt1", "spreads").unwrap();
        assert_eq!(ids.len(), 1);
    }
}
