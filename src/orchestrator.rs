//! C10 — cycle orchestrator. Drives one pass of C1 through C9 on a timer,
//! adapting its own interval to how many games are live and how much
//! upstream API credit remains, and tripping a circuit breaker when odds
//! ingestion keeps failing so a dead upstream doesn't spin the loop hot.

use crate::alerts;
use crate::config::Config;
use crate::cross_market;
use crate::db::models::{Game, Signal};
use crate::db::Database;
use crate::ingestion::{exchange, odds, sportsdataio};
use crate::kv::KvStore;
use crate::signals::{dislocation, exchange_divergence, live_shock, move_rules, multibook_sync, steam};
use crate::structural;
use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const ACTIVE_GAME_LOOKBACK_HOURS: i64 = 6;
const STRUCTURAL_LOOKBACK_HOURS: i64 = 4;
const CIRCUIT_FAILURE_KEY: &str = "circuit:odds_api:failures";
const CIRCUIT_OPEN_KEY: &str = "circuit:odds_api:open_until";

/// Long-lived handles shared by every orchestrator tick. Cheap to clone:
/// `Database` wraps an `Arc<Mutex<Connection>>` and `KvStore`/clients are
/// held behind an `Arc` here so the tick function can be `'static`.
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    kv: Arc<KvStore>,
    config: Arc<Config>,
    odds_client: Arc<odds::OddsApiClient>,
    kalshi_client: Arc<exchange::KalshiClient>,
    polymarket_client: Option<Arc<exchange::PolymarketClient>>,
    sportsdataio_client: Arc<sportsdataio::SportsdataioClient>,
}

impl Orchestrator {
    pub fn new(db: Database, kv: Arc<KvStore>, config: Arc<Config>) -> Result<Self> {
        let odds_client = Arc::new(odds::OddsApiClient::new(&config)?);
        let kalshi_client = Arc::new(exchange::KalshiClient::new(&config)?);
        let polymarket_client = if config.enable_polymarket_ingest {
            Some(Arc::new(exchange::PolymarketClient::new(&config)?))
        } else {
            None
        };
        let sportsdataio_client = Arc::new(sportsdataio::SportsdataioClient::new(&config)?);
        Ok(Orchestrator {
            db,
            kv,
            config,
            odds_client,
            kalshi_client,
            polymarket_client,
            sportsdataio_client,
        })
    }

    /// Shared odds-API client handle, reused by the periodic CLV backfill
    /// job so it doesn't open a second HTTP client pool against the same
    /// upstream.
    pub fn odds_client(&self) -> Arc<odds::OddsApiClient> {
        self.odds_client.clone()
    }

    fn circuit_is_open(&self) -> bool {
        match self.kv.get(CIRCUIT_OPEN_KEY) {
            Some(until) => match until.parse::<i64>() {
                Ok(ts) => Utc::now().timestamp() < ts,
                Err(_) => false,
            },
            None => false,
        }
    }

    fn record_odds_failure(&self) {
        let failures: u32 = self
            .kv
            .get(CIRCUIT_FAILURE_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        self.kv
            .set_ex(CIRCUIT_FAILURE_KEY, &failures.to_string(), self.config.circuit_open_seconds * 4);
        if failures >= self.config.circuit_failures_to_open {
            let open_until = Utc::now().timestamp() + self.config.circuit_open_seconds as i64;
            self.kv
                .set_ex(CIRCUIT_OPEN_KEY, &open_until.to_string(), self.config.circuit_open_seconds);
            warn!(failures, "circuit breaker opened for odds ingestion");
        }
    }

    fn record_odds_success(&self) {
        self.kv.delete(CIRCUIT_FAILURE_KEY);
        self.kv.delete(CIRCUIT_OPEN_KEY);
    }

    /// Picks the next poll interval: tight while games are live, relaxed
    /// when nothing is happening, and maximally relaxed once the upstream
    /// odds API's remaining request credit drops below its low-credit
    /// threshold, so a quiet slate doesn't burn through a monthly quota.
    fn next_interval(&self, active_games: usize, requests_remaining: Option<i64>) -> Duration {
        if let Some(remaining) = requests_remaining {
            if remaining <= self.config.odds_api_low_credit_threshold {
                return Duration::from_secs(self.config.odds_poll_interval_low_credit_seconds);
            }
        }
        if active_games == 0 {
            Duration::from_secs(self.config.odds_poll_interval_idle_seconds)
        } else {
            Duration::from_secs(self.config.odds_poll_interval_seconds)
        }
    }

    /// Runs one full cycle: ingest odds + exchange quotes, recompute
    /// consensus, detect signals across every detector, confirm structural
    /// breaks, reconcile cross-market lead/lag and divergence, select
    /// closing consensus for games that just tipped off, compute CLV for
    /// signals old enough to have one, dispatch alerts, and persist the
    /// cycle's KPIs. Returns the interval the caller should sleep before
    /// the next tick.
    pub async fn run_cycle(&self) -> Duration {
        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut kpi = crate::db::models::CycleKpi {
            cycle_id: cycle_id.clone(),
            started_at,
            completed_at: None,
            duration_ms: None,
            requests_used_delta: None,
            events_processed: 0,
            snapshots_inserted: 0,
            consensus_points_written: 0,
            signals_created_total: 0,
            signals_created_by_type: std::collections::HashMap::new(),
            alerts_sent: 0,
            alerts_failed: 0,
            degraded: false,
            notes: None,
        };

        let mut requests_remaining = None;
        let mut active_games = 0usize;

        if self.circuit_is_open() {
            info!(cycle_id, "circuit open, skipping odds ingestion this cycle");
            kpi.degraded = true;
            kpi.notes = Some("circuit breaker open: odds ingestion skipped".to_string());
        } else {
            match odds::ingest_cycle(&self.db, &self.kv, &self.odds_client, &self.config).await {
                Ok(outcome) => {
                    self.record_odds_success();
                    kpi.events_processed = outcome.events_seen as i64;
                    kpi.snapshots_inserted = outcome.snapshots_inserted;
                    requests_remaining = outcome.requests_remaining;
                    if !outcome.failed_sport_keys.is_empty() {
                        warn!(cycle_id, failed = ?outcome.failed_sport_keys, "some sports failed to ingest");
                    }
                }
                Err(e) => {
                    error!(cycle_id, error = %e, "odds ingestion failed");
                    self.record_odds_failure();
                    kpi.degraded = true;
                    kpi.notes = Some(format!("odds ingestion error: {e}"));
                }
            }
        }

        match exchange::ingest_cycle(
            &self.db,
            &self.kalshi_client,
            self.polymarket_client.as_deref(),
            &self.config,
        )
        .await
        {
            Ok(outcome) => {
                for key in &outcome.canonical_event_keys {
                    if let Err(e) = cross_market::run_for_alignment(&self.db, key) {
                        warn!(cycle_id, canonical_event_key = key, error = %e, "cross-market reconciliation failed");
                    }
                }
            }
            Err(e) => warn!(cycle_id, error = %e, "exchange ingestion failed"),
        }

        let games = match self.db.list_active_games(Utc::now(), ACTIVE_GAME_LOOKBACK_HOURS) {
            Ok(g) => g,
            Err(e) => {
                error!(cycle_id, error = %e, "failed to list active games, aborting cycle");
                vec![]
            }
        };
        active_games = games.len();

        self.refresh_injury_context(&games).await;

        let mut fresh_signals: Vec<Signal> = Vec::new();
        for game in &games {
            let event_id = &game.event_id;

            if let Err(e) = crate::consensus::recompute_for_event(&self.db, &self.config, event_id) {
                warn!(cycle_id, event_id, error = %e, "consensus recompute failed");
                continue;
            }

            if let Err(e) = structural::analyse_event(&self.db, event_id, STRUCTURAL_LOOKBACK_HOURS) {
                warn!(cycle_id, event_id, error = %e, "structural analysis failed");
            }

            for market in self.config.consensus_markets_list() {
                let detector_results: [Result<Vec<i64>>; 4] = [
                    move_rules::detect(&self.db, &self.kv, &self.config, event_id, &market),
                    multibook_sync::detect(&self.db, &self.kv, &self.config, event_id, &market),
                    dislocation::detect(&self.db, &self.kv, &self.config, event_id, &market),
                    steam::detect(&self.db, &self.kv, &self.config, event_id, &market),
                ];
                for result in detector_results {
                    match result {
                        Ok(ids) => self.collect_signals(&ids, &mut fresh_signals, &mut kpi),
                        Err(e) => warn!(cycle_id, event_id, market, error = %e, "signal detector failed"),
                    }
                }
                match live_shock::detect(&self.db, &self.kv, &self.config, event_id, &market) {
                    Ok(ids) => self.collect_signals(&ids, &mut fresh_signals, &mut kpi),
                    Err(e) => warn!(cycle_id, event_id, market, error = %e, "live shock detector failed"),
                }
            }
        }

        match self.db.list_alignments() {
            Ok(alignments) => {
                for alignment in alignments {
                    match exchange_divergence::detect(
                        &self.db,
                        &self.kv,
                        &self.config,
                        &alignment.canonical_event_key,
                    ) {
                        Ok(ids) => self.collect_signals(&ids, &mut fresh_signals, &mut kpi),
                        Err(e) => warn!(cycle_id, error = %e, "exchange divergence detector failed"),
                    }
                }
            }
            Err(e) => warn!(cycle_id, error = %e, "failed to list canonical alignments"),
        }

        // C8 (closing consensus + CLV) runs on its own timer via
        // `clv::run_forever`, not once per ingestion/detection tick.

        if !fresh_signals.is_empty() {
            let outcome = alerts::dispatch(self.db.clone(), self.kv.clone(), (*self.config).clone(), fresh_signals).await;
            kpi.alerts_sent = outcome.alerts_sent;
            kpi.alerts_failed = outcome.alerts_failed;
        }

        kpi.completed_at = Some(Utc::now());
        kpi.duration_ms = Some((Utc::now() - started_at).num_milliseconds());
        if let Err(e) = self.db.upsert_cycle_kpi(&kpi) {
            warn!(cycle_id, error = %e, "failed to persist cycle KPI");
        }

        info!(
            cycle_id,
            active_games,
            signals = kpi.signals_created_total,
            degraded = kpi.degraded,
            duration_ms = kpi.duration_ms,
            "cycle complete"
        );

        self.next_interval(active_games, requests_remaining)
    }

    /// Best-effort injury context refresh for every sport with an active
    /// game this cycle. Purely advisory: results are logged, never
    /// persisted or fed into a detector, and a failure here never marks the
    /// cycle degraded — per-sport outages on this feed are expected.
    async fn refresh_injury_context(&self, games: &[Game]) {
        let mut sport_keys: Vec<&str> = games.iter().map(|g| g.sport_key.as_str()).collect();
        sport_keys.sort_unstable();
        sport_keys.dedup();
        for sport_key in sport_keys {
            if let Some(rows) = self.sportsdataio_client.fetch_injuries(sport_key).await {
                info!(sport_key, rows = rows.len(), "refreshed sportsdataio injury context");
            }
        }
    }

    fn collect_signals(&self, ids: &[i64], out: &mut Vec<Signal>, kpi: &mut crate::db::models::CycleKpi) {
        for &id in ids {
            match self.db.get_signal(id) {
                Ok(Some(signal)) => {
                    *kpi.signals_created_by_type
                        .entry(signal.signal_type.as_str().to_string())
                        .or_insert(0) += 1;
                    kpi.signals_created_total += 1;
                    out.push(signal);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to reload freshly inserted signal"),
            }
        }
    }
}

/// Runs cycles back to back, sleeping for whatever interval the previous
/// cycle decided fits current conditions, until `shutdown` fires. A small
/// random jitter is added to each sleep so, in a multi-instance
/// deployment, ticks don't all land on the same wall-clock second.
pub async fn run_forever(orchestrator: Orchestrator, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        let interval = orchestrator.run_cycle().await;
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        let sleep = tokio::time::sleep(interval + Duration::from_millis(jitter_ms));
        tokio::select! {
            _ = sleep => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("orchestrator received shutdown signal, exiting cycle loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn idle_slate_uses_idle_interval() {
        let config = Arc::new(Config::parse_from(["stratum-engine"]));
        let db = Database::open(":memory:").unwrap();
        let kv = Arc::new(KvStore::new());
        let orch = Orchestrator {
            db,
            kv,
            odds_client: Arc::new(odds::OddsApiClient::new(&config).unwrap()),
            kalshi_client: Arc::new(exchange::KalshiClient::new(&config).unwrap()),
            polymarket_client: None,
            sportsdataio_client: Arc::new(sportsdataio::SportsdataioClient::new(&config).unwrap()),
            config: config.clone(),
        };
        assert_eq!(
            orch.next_interval(0, Some(10_000)),
            Duration::from_secs(config.odds_poll_interval_idle_seconds)
        );
        assert_eq!(
            orch.next_interval(3, Some(10_000)),
            Duration::from_secs(config.odds_poll_interval_seconds)
        );
        assert_eq!(
            orch.next_interval(3, Some(config.odds_api_low_credit_threshold)),
            Duration::from_secs(config.odds_poll_interval_low_credit_seconds)
        );
    }

    #[test]
    fn circuit_opens_after_configured_failure_count() {
        let mut config = Config::parse_from(["stratum-engine"]);
        config.circuit_failures_to_open = 2;
        let config = Arc::new(config);
        let db = Database::open(":memory:").unwrap();
        let kv = Arc::new(KvStore::new());
        let orch = Orchestrator {
            db,
            kv,
            odds_client: Arc::new(odds::OddsApiClient::new(&config).unwrap()),
            kalshi_client: Arc::new(exchange::KalshiClient::new(&config).unwrap()),
            polymarket_client: None,
            sportsdataio_client: Arc::new(sportsdataio::SportsdataioClient::new(&config).unwrap()),
            config,
        };
        assert!(!orch.circuit_is_open());
        orch.record_odds_failure();
        assert!(!orch.circuit_is_open());
        orch.record_odds_failure();
        assert!(orch.circuit_is_open());
        orch.record_odds_success();
        assert!(!orch.circuit_is_open());
    }
}
