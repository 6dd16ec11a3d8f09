//! C11 — retention sweeps. The database already knows how to delete its
//! own expired rows in batches (`delete_expired_*`); this module just owns
//! the cadence and cutoff-date arithmetic, and totals what it removed for
//! the orchestrator's logs.

use crate::config::Config;
use crate::db::Database;
use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::info;

/// Row counts removed by one sweep pass, broken down by table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub odds_snapshots: i64,
    pub consensus_snapshots: i64,
    pub signals: i64,
    pub clv_records: i64,
    pub closing_consensus: i64,
    pub cycle_kpis: i64,
}

impl SweepOutcome {
    pub fn total(&self) -> i64 {
        self.odds_snapshots
            + self.consensus_snapshots
            + self.signals
            + self.clv_records
            + self.closing_consensus
            + self.cycle_kpis
    }
}

/// Deletes everything older than each table's configured retention window,
/// one `retention_sweep_batch_size`-row batch at a time per table so a
/// single sweep never holds a long-running write transaction open.
pub fn sweep_once(db: &Database, config: &Config) -> Result<SweepOutcome> {
    let now = Utc::now();
    let batch = config.retention_sweep_batch_size;

    let odds_cutoff = now - Duration::hours(config.snapshot_retention_hours);
    let consensus_cutoff = now - Duration::days(config.consensus_retention_days);
    let signal_cutoff = now - Duration::days(config.signal_retention_days);
    let clv_cutoff = now - Duration::days(config.clv_retention_days);
    let kpi_cutoff = now - Duration::days(config.kpi_retention_days);

    let outcome = SweepOutcome {
        odds_snapshots: sweep_table(db, "odds_snapshots", |b| {
            db.delete_expired_odds_snapshots(odds_cutoff, b)
        }, batch)?,
        consensus_snapshots: sweep_table(db, "market_consensus_snapshots", |b| {
            db.delete_expired_consensus(consensus_cutoff, b)
        }, batch)?,
        signals: sweep_table(db, "signals", |b| db.delete_expired_signals(signal_cutoff, b), batch)?,
        clv_records: sweep_table(db, "clv_records", |b| db.delete_expired_clv_records(clv_cutoff, b), batch)?,
        closing_consensus: sweep_table(db, "closing_consensus", |b| {
            db.delete_expired_closing_consensus(clv_cutoff, b)
        }, batch)?,
        cycle_kpis: sweep_table(db, "cycle_kpis", |b| db.delete_expired_cycle_kpis(kpi_cutoff, b), batch)?,
    };

    if outcome.total() > 0 {
        info!(
            odds_snapshots = outcome.odds_snapshots,
            consensus_snapshots = outcome.consensus_snapshots,
            signals = outcome.signals,
            clv_records = outcome.clv_records,
            closing_consensus = outcome.closing_consensus,
            cycle_kpis = outcome.cycle_kpis,
            "retention sweep complete"
        );
    }
    Ok(outcome)
}

/// Repeatedly deletes `batch`-sized chunks from one table until a pass
/// returns fewer rows than it asked for, so a backlog that built up while
/// the sweep was paused still drains within a single `sweep_once` call.
fn sweep_table(_db: &Database, _name: &str, mut delete_batch: impl FnMut(i64) -> Result<i64>, batch: i64) -> Result<i64> {
    let mut total = 0;
    loop {
        let deleted = delete_batch(batch)?;
        total += deleted;
        if deleted < batch {
            break;
        }
    }
    Ok(total)
}

/// Drives the sweep on its own timer, independent of the odds/signal
/// polling cadence. Intended to run as a detached background task for the
/// lifetime of the process; logs and continues past any single-cycle error
/// rather than letting a transient SQLite busy-lock kill the sweep loop.
pub async fn run_forever(db: Database, config: Config, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        config.retention_sweep_interval_minutes * 60,
    ));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep_once(&db, &config) {
                    tracing::warn!(error = %e, "retention sweep failed, will retry next interval");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Game, OddsSnapshot};
    use clap::Parser;

    #[test]
    fn sweeps_expired_odds_snapshots_only() {
        let db = Database::open(":memory:").unwrap();
        let mut config = Config::parse_from(["stratum-engine"]);
        config.snapshot_retention_hours = 1;
        db.upsert_game(&Game {
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + Duration::hours(3),
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
            fetched_at: now_minus_hours(5),
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
            fetched_at: Utc::now(),
        })
        .unwrap();

        let outcome = sweep_once(&db, &config).unwrap();
        assert_eq!(outcome.odds_snapshots, 1);
        assert_eq!(outcome.signals, 0);
    }

    fn now_minus_hours(h: i64) -> chrono::DateTime<Utc> {
        Utc::now() - Duration::hours(h)
    }
}
