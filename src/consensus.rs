//! C3 — consensus engine. Folds the latest per-book odds snapshots for an
//! event/market into one `MarketConsensusSnapshot` per outcome: a median
//! line/price and a dispersion measure, gated on a minimum book count.

use crate::config::Config;
use crate::db::models::{MarketConsensusSnapshot, OddsSnapshot};
use crate::db::Database;
use crate::oddsmath::{implied_probability, median, pstdev};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

/// Computes (without writing) the consensus snapshots for every outcome of
/// `(event_id, market)` observed within the configured lookback window.
/// Outcomes with fewer than `consensus_min_books` distinct books are
/// dropped (any stale snapshot is left in place — the read API surfaces
/// `fetched_at` so callers can judge staleness).
fn compute_market_snapshots(
    db: &Database,
    config: &Config,
    event_id: &str,
    market: &str,
) -> Result<Vec<MarketConsensusSnapshot>> {
    let since = Utc::now() - chrono::Duration::minutes(config.consensus_lookback_minutes);
    let snapshots = db.latest_snapshots_in_window(event_id, market, since)?;

    let mut by_outcome: HashMap<String, Vec<OddsSnapshot>> = HashMap::new();
    for s in snapshots {
        by_outcome.entry(s.outcome_name.clone()).or_default().push(s);
    }

    let mut out = Vec::new();
    for (outcome_name, rows) in by_outcome {
        let books_count = rows.len() as i64;
        if books_count < config.consensus_min_books {
            debug!(
                event_id,
                market, outcome_name, books_count, "skipping consensus: below min book count"
            );
            continue;
        }

        let prices: Vec<f64> = rows.iter().map(|r| r.price as f64).collect();
        let consensus_price = median(&prices);

        let (consensus_line, dispersion) = if market == "h2h" {
            // Moneyline carries no line; dispersion is computed over
            // implied probability, since raw American-odds price is not a
            // linear scale and pstdev over it would be meaningless.
            let implied: Vec<f64> = prices.iter().map(|p| implied_probability(*p)).collect();
            (None, pstdev(&implied))
        } else {
            let lines: Vec<f64> = rows.iter().filter_map(|r| r.line).collect();
            (median(&lines), pstdev(&lines))
        };

        out.push(MarketConsensusSnapshot {
            event_id: event_id.to_string(),
            market: market.to_string(),
            outcome_name,
            consensus_line,
            consensus_price,
            dispersion,
            books_count,
            fetched_at: Utc::now(),
        });
    }

    Ok(out)
}

/// Recomputes and writes consensus for every outcome of `(event_id,
/// market)`. Returns the number of consensus points written.
pub fn recompute_for_market(db: &Database, config: &Config, event_id: &str, market: &str) -> Result<usize> {
    let snapshots = compute_market_snapshots(db, config, event_id, market)?;
    for snapshot in &snapshots {
        db.insert_consensus_snapshot(snapshot)?;
    }
    Ok(snapshots.len())
}

/// Runs consensus recomputation across every configured market for one
/// event. Used by the orchestrator once per cycle per active event.
///
/// Gated on `consensus_min_markets`: markets are computed for the whole
/// event first, and if fewer than `consensus_min_markets` of them have at
/// least one qualifying outcome, nothing is written for the event at all —
/// a single thinly-covered market never gets its own consensus row while
/// the rest of the event's markets stay dark.
pub fn recompute_for_event(db: &Database, config: &Config, event_id: &str) -> Result<usize> {
    let mut per_market = Vec::new();
    for market in config.consensus_markets_list() {
        let snapshots = compute_market_snapshots(db, config, event_id, &market)?;
        if !snapshots.is_empty() {
            per_market.push(snapshots);
        }
    }

    if (per_market.len() as i64) < config.consensus_min_markets {
        debug!(
            event_id,
            eligible_markets = per_market.len(),
            required = config.consensus_min_markets,
            "skipping consensus for event: below min eligible markets"
        );
        return Ok(0);
    }

    let mut total = 0;
    for snapshots in per_market {
        for snapshot in &snapshots {
            db.insert_consensus_snapshot(snapshot)?;
        }
        total += snapshots.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Game;
    use clap::Parser;

    fn setup() -> (Database, Config) {
        let db = Database::open(":memory:").unwrap();
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(2),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
        })
        .unwrap();
        let config = Config::parse_from(["stratum-engine"]);
        (db, config)
    }

    fn insert_snapshot(db: &Database, book: &str, line: f64, price: i64) {
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: book.into(),
            market: "spreads".into(),
            outcome_name: "BOS".into(),
            line: Some(line),
            price,
            fetched_at: Utc::now(),
        })
        .unwrap();
    }

    #[test]
    fn consensus_requires_min_books() {
        let (db, mut config) = setup();
        config.consensus_min_books = 3;
        insert_snapshot(&db, "pinnacle", -3.0, -110);
        insert_snapshot(&db, "circa", -3.5, -108);
        let written = recompute_for_market(&db, &config, "evt1", "spreads").unwrap();
        assert_eq!(written, 0);
        assert!(db
            .get_latest_consensus("evt1", "spreads", "BOS")
            .unwrap()
            .is_none());
    }

    #[test]
    fn consensus_line_is_median_of_qualifying_books() {
        let (db, mut config) = setup();
        config.consensus_min_books = 3;
        insert_snapshot(&db, "pinnacle", -3.0, -110);
        insert_snapshot(&db, "circa", -3.5, -108);
        insert_snapshot(&db, "draftkings", -4.0, -112);
        let written = recompute_for_market(&db, &config, "evt1", "spreads").unwrap();
        assert_eq!(written, 1);
        let snap = db
            .get_latest_consensus("evt1", "spreads", "BOS")
            .unwrap()
            .unwrap();
        assert_eq!(snap.consensus_line, Some(-3.5));
        assert_eq!(snap.books_count, 3);
    }

    #[test]
    fn event_below_min_markets_writes_nothing() {
        let (db, mut config) = setup();
        config.consensus_min_books = 2;
        config.consensus_min_markets = 2;
        // Only spreads has enough books; totals/h2h have none, so only one
        // of the three configured markets is eligible.
        insert_snapshot(&db, "pinnacle", -3.0, -110);
        insert_snapshot(&db, "circa", -3.5, -108);
        let written = recompute_for_event(&db, &config, "evt1").unwrap();
        assert_eq!(written, 0);
        assert!(db
            .get_latest_consensus("evt1", "spreads", "BOS")
            .unwrap()
            .is_none());
    }

    #[test]
    fn event_at_min_markets_writes_all_eligible_markets() {
        let (db, mut config) = setup();
        config.consensus_min_books = 2;
        config.consensus_min_markets = 2;
        insert_snapshot(&db, "pinnacle", -3.0, -110);
        insert_snapshot(&db, "circa", -3.5, -108);
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "pinnacle".into(),
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            line: None,
            price: -150,
            fetched_at: Utc::now(),
        })
        .unwrap();
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "circa".into(),
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            line: None,
            price: -140,
            fetched_at: Utc::now(),
        })
        .unwrap();
        let written = recompute_for_event(&db, &config, "evt1").unwrap();
        assert_eq!(written, 2);
        assert!(db
            .get_latest_consensus("evt1", "spreads", "BOS")
            .unwrap()
            .is_some());
        assert!(db.get_latest_consensus("evt1", "h2h", "BOS").unwrap().is_some());
    }

    #[test]
    fn h2h_consensus_has_no_line() {
        let (db, mut config) = setup();
        config.consensus_min_books = 2;
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "pinnacle".into(),
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            line: None,
            price: -150,
            fetched_at: Utc::now(),
        })
        .unwrap();
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "circa".into(),
            market: "h2h".into(),
            outcome_name: "BOS".into(),
            line: None,
            price: -140,
            fetched_at: Utc::now(),
        })
        .unwrap();
        recompute_for_market(&db, &config, "evt1", "h2h").unwrap();
        let snap = db
            .get_latest_consensus("evt1", "h2h", "BOS")
            .unwrap()
            .unwrap();
        assert_eq!(snap.consensus_line, None);
        assert!(snap.dispersion.is_some());
    }
}
