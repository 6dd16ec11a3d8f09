use clap::Parser;

/// Sportsbook tier lookup. Pinnacle/Circa are Tier-1 ("sharp") books whose
/// lone crossing is sufficient to confirm a structural event; everything
/// else needs a second venue to agree before the event confirms.
pub const BOOK_TIERS: &[(&str, &str)] = &[
    ("pinnacle", "T1"),
    ("circa", "T1"),
    ("betcris", "T2"),
    ("draftkings", "T3"),
    ("fanduel", "T3"),
    ("betmgm", "T3"),
    ("caesars", "T3"),
];

pub const DEFAULT_BOOK_TIER: &str = "T3";

/// Look up a sportsbook's confirmation tier, case-insensitively. Unknown
/// venues default to T3 rather than failing closed.
pub fn venue_tier(venue: &str) -> &'static str {
    let lower = venue.to_lowercase();
    BOOK_TIERS
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, tier)| *tier)
        .unwrap_or(DEFAULT_BOOK_TIER)
}

/// Market intelligence engine configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "stratum-engine", version, about)]
pub struct Config {
    /// Deployment environment; "production" enables strict secret checks.
    #[arg(long, env = "APP_ENV", default_value = "development")]
    pub app_env: String,

    /// Read-API listen address.
    #[arg(long, env = "APP_ADDR", default_value = "0.0.0.0:8000")]
    pub app_addr: String,

    /// SQLite database path.
    #[arg(long, env = "DATABASE_PATH", default_value = "stratum.db")]
    pub database_path: String,

    // ── Odds ingestion (C1) ──────────────────────────────────────────
    /// Odds API key (required in production).
    #[arg(long, env = "ODDS_API_KEY", default_value = "")]
    pub odds_api_key: String,

    #[arg(
        long,
        env = "ODDS_API_BASE_URL",
        default_value = "https://api.the-odds-api.com/v4"
    )]
    pub odds_api_base_url: String,

    /// Baseline polling interval while at least one tracked game is live.
    #[arg(long, env = "ODDS_POLL_INTERVAL_SECONDS", default_value = "60")]
    pub odds_poll_interval_seconds: u64,

    /// Polling interval when no tracked game is within its active window.
    #[arg(long, env = "ODDS_POLL_INTERVAL_IDLE_SECONDS", default_value = "300")]
    pub odds_poll_interval_idle_seconds: u64,

    /// Polling interval once remaining daily quota drops below the threshold.
    #[arg(
        long,
        env = "ODDS_POLL_INTERVAL_LOW_CREDIT_SECONDS",
        default_value = "900"
    )]
    pub odds_poll_interval_low_credit_seconds: u64,

    #[arg(long, env = "ODDS_API_LOW_CREDIT_THRESHOLD", default_value = "200")]
    pub odds_api_low_credit_threshold: i64,

    #[arg(long, env = "ODDS_API_TARGET_DAILY_CREDITS", default_value = "1200")]
    pub odds_api_target_daily_credits: i64,

    #[arg(
        long,
        env = "ODDS_API_SPORT_KEYS",
        default_value = "basketball_nba,basketball_ncaab,americanfootball_nfl"
    )]
    pub odds_api_sport_keys: String,

    #[arg(long, env = "ODDS_API_REGIONS", default_value = "us")]
    pub odds_api_regions: String,

    #[arg(long, env = "ODDS_API_MARKETS", default_value = "spreads,totals,h2h")]
    pub odds_api_markets: String,

    /// Comma-separated bookmaker allowlist; empty means "all returned".
    #[arg(long, env = "ODDS_API_BOOKMAKERS", default_value = "")]
    pub odds_api_bookmakers: String,

    #[arg(long, env = "ODDS_API_TIMEOUT_SECONDS", default_value = "10")]
    pub odds_api_timeout_seconds: u64,

    #[arg(long, env = "ODDS_API_RETRY_ATTEMPTS", default_value = "3")]
    pub odds_api_retry_attempts: u32,

    #[arg(long, env = "ODDS_API_RETRY_BACKOFF_SECONDS", default_value = "1.0")]
    pub odds_api_retry_backoff_seconds: f64,

    #[arg(
        long,
        env = "ODDS_API_RETRY_BACKOFF_MAX_SECONDS",
        default_value = "8.0"
    )]
    pub odds_api_retry_backoff_max_seconds: f64,

    /// Consecutive upstream failures before the provider breaker opens.
    #[arg(long, env = "CIRCUIT_FAILURES_TO_OPEN", default_value = "3")]
    pub circuit_failures_to_open: u32,

    /// How long the breaker stays open before a half-open probe.
    #[arg(long, env = "CIRCUIT_OPEN_SECONDS", default_value = "120")]
    pub circuit_open_seconds: u64,

    /// NBA/NFL key numbers used when classifying a threshold crossing.
    #[arg(long, env = "NBA_KEY_NUMBERS", default_value = "2,3,4,5,6,7,8,10")]
    pub nba_key_numbers: String,

    // ── Consensus (C3) ────────────────────────────────────────────────
    #[arg(long, env = "CONSENSUS_ENABLED", default_value = "true")]
    pub consensus_enabled: bool,

    #[arg(long, env = "CONSENSUS_LOOKBACK_MINUTES", default_value = "10")]
    pub consensus_lookback_minutes: i64,

    /// Minimum distinct books required before a consensus snapshot is struck.
    #[arg(long, env = "CONSENSUS_MIN_BOOKS", default_value = "5")]
    pub consensus_min_books: i64,

    /// Minimum distinct markets (spreads/totals/h2h) that must each clear
    /// CONSENSUS_MIN_BOOKS before the game-level consensus cycle counts as run.
    #[arg(long, env = "CONSENSUS_MIN_MARKETS", default_value = "1")]
    pub consensus_min_markets: i64,

    #[arg(long, env = "CONSENSUS_MARKETS", default_value = "spreads,totals,h2h")]
    pub consensus_markets: String,

    #[arg(long, env = "CONSENSUS_RETENTION_DAYS", default_value = "14")]
    pub consensus_retention_days: i64,

    // ── Dislocation signal ────────────────────────────────────────────
    #[arg(long, env = "DISLOCATION_ENABLED", default_value = "true")]
    pub dislocation_enabled: bool,

    #[arg(long, env = "DISLOCATION_LOOKBACK_MINUTES", default_value = "10")]
    pub dislocation_lookback_minutes: i64,

    #[arg(long, env = "DISLOCATION_MIN_BOOKS", default_value = "5")]
    pub dislocation_min_books: i64,

    #[arg(long, env = "DISLOCATION_SPREAD_LINE_DELTA", default_value = "1.0")]
    pub dislocation_spread_line_delta: f64,

    #[arg(long, env = "DISLOCATION_TOTAL_LINE_DELTA", default_value = "2.0")]
    pub dislocation_total_line_delta: f64,

    #[arg(long, env = "DISLOCATION_ML_IMPLIED_PROB_DELTA", default_value = "0.03")]
    pub dislocation_ml_implied_prob_delta: f64,

    #[arg(long, env = "DISLOCATION_COOLDOWN_SECONDS", default_value = "900")]
    pub dislocation_cooldown_seconds: i64,

    #[arg(long, env = "DISLOCATION_MAX_SIGNALS_PER_EVENT", default_value = "6")]
    pub dislocation_max_signals_per_event: usize,

    // ── Steam signal ──────────────────────────────────────────────────
    #[arg(long, env = "STEAM_ENABLED", default_value = "true")]
    pub steam_enabled: bool,

    #[arg(long, env = "STEAM_WINDOW_MINUTES", default_value = "3")]
    pub steam_window_minutes: i64,

    #[arg(long, env = "STEAM_MIN_BOOKS", default_value = "4")]
    pub steam_min_books: i64,

    #[arg(long, env = "STEAM_MIN_MOVE_SPREAD", default_value = "0.5")]
    pub steam_min_move_spread: f64,

    #[arg(long, env = "STEAM_MIN_MOVE_TOTAL", default_value = "1.0")]
    pub steam_min_move_total: f64,

    #[arg(long, env = "STEAM_COOLDOWN_SECONDS", default_value = "900")]
    pub steam_cooldown_seconds: i64,

    #[arg(long, env = "STEAM_MAX_SIGNALS_PER_EVENT", default_value = "4")]
    pub steam_max_signals_per_event: usize,

    // ── Closing lines / CLV (C8) ──────────────────────────────────────
    #[arg(long, env = "CLV_ENABLED", default_value = "true")]
    pub clv_enabled: bool,

    /// Minutes after commence_time before a game is eligible for closing capture.
    #[arg(long, env = "CLV_MINUTES_AFTER_COMMENCE", default_value = "10")]
    pub clv_minutes_after_commence: i64,

    #[arg(long, env = "CLV_LOOKBACK_DAYS", default_value = "7")]
    pub clv_lookback_days: i64,

    #[arg(long, env = "CLV_RETENTION_DAYS", default_value = "60")]
    pub clv_retention_days: i64,

    #[arg(long, env = "CLV_JOB_INTERVAL_MINUTES", default_value = "60")]
    pub clv_job_interval_minutes: u64,

    #[arg(long, env = "ENABLE_HISTORICAL_BACKFILL", default_value = "true")]
    pub enable_historical_backfill: bool,

    #[arg(
        long,
        env = "HISTORICAL_BACKFILL_LOOKBACK_HOURS",
        default_value = "72"
    )]
    pub historical_backfill_lookback_hours: i64,

    #[arg(
        long,
        env = "HISTORICAL_BACKFILL_INTERVAL_MINUTES",
        default_value = "60"
    )]
    pub historical_backfill_interval_minutes: u64,

    #[arg(
        long,
        env = "HISTORICAL_BACKFILL_MAX_GAMES_PER_RUN",
        default_value = "25"
    )]
    pub historical_backfill_max_games_per_run: i64,

    // ── Retention / KPI (C11) ─────────────────────────────────────────
    #[arg(long, env = "SNAPSHOT_RETENTION_HOURS", default_value = "48")]
    pub snapshot_retention_hours: i64,

    #[arg(long, env = "SIGNAL_RETENTION_DAYS", default_value = "30")]
    pub signal_retention_days: i64,

    #[arg(long, env = "KPI_RETENTION_DAYS", default_value = "30")]
    pub kpi_retention_days: i64,

    #[arg(long, env = "RETENTION_SWEEP_INTERVAL_MINUTES", default_value = "60")]
    pub retention_sweep_interval_minutes: u64,

    #[arg(long, env = "RETENTION_SWEEP_BATCH_SIZE", default_value = "5000")]
    pub retention_sweep_batch_size: i64,

    // ── Exchanges (C2) ────────────────────────────────────────────────
    #[arg(long, env = "KALSHI_API_KEY", default_value = "")]
    pub kalshi_api_key: String,

    #[arg(
        long,
        env = "KALSHI_BASE_URL",
        default_value = "https://api.elections.kalshi.com"
    )]
    pub kalshi_base_url: String,

    #[arg(long, env = "KALSHI_TIMEOUT_SECONDS", default_value = "5.0")]
    pub kalshi_timeout_seconds: f64,

    #[arg(long, env = "KALSHI_MAX_PER_CYCLE", default_value = "10")]
    pub kalshi_max_per_cycle: usize,

    #[arg(long, env = "ENABLE_POLYMARKET_INGEST", default_value = "false")]
    pub enable_polymarket_ingest: bool,

    #[arg(
        long,
        env = "POLYMARKET_BASE_URL",
        default_value = "https://clob.polymarket.com"
    )]
    pub polymarket_base_url: String,

    #[arg(long, env = "POLYMARKET_TIMEOUT_SECONDS", default_value = "5.0")]
    pub polymarket_timeout_seconds: f64,

    #[arg(long, env = "POLYMARKET_MAX_PER_CYCLE", default_value = "10")]
    pub polymarket_max_per_cycle: usize,

    // ── Sportsdataio injury feed (optional, defensive) ────────────────
    #[arg(long, env = "ENABLE_SPORTSDATAIO_INJURIES", default_value = "false")]
    pub enable_sportsdataio_injuries: bool,

    #[arg(long, env = "SPORTSDATAIO_API_KEY", default_value = "")]
    pub sportsdataio_api_key: String,

    #[arg(
        long,
        env = "SPORTSDATAIO_BASE_URL",
        default_value = "https://api.sportsdata.io/v3"
    )]
    pub sportsdataio_base_url: String,

    #[arg(long, env = "SPORTSDATAIO_TIMEOUT_SECONDS", default_value = "5.0")]
    pub sportsdataio_timeout_seconds: f64,

    // ── Exchange divergence signal ────────────────────────────────────
    #[arg(long, env = "EXCHANGE_DIVERGENCE_ENABLED", default_value = "true")]
    pub exchange_divergence_enabled: bool,

    #[arg(
        long,
        env = "EXCHANGE_DIVERGENCE_LOOKBACK_MINUTES",
        default_value = "15"
    )]
    pub exchange_divergence_lookback_minutes: i64,

    #[arg(
        long,
        env = "EXCHANGE_DIVERGENCE_COOLDOWN_SECONDS",
        default_value = "900"
    )]
    pub exchange_divergence_cooldown_seconds: i64,

    #[arg(
        long,
        env = "EXCHANGE_DIVERGENCE_MAX_SIGNALS_PER_EVENT",
        default_value = "2"
    )]
    pub exchange_divergence_max_signals_per_event: usize,

    // ── Webhook dispatch (C9) ─────────────────────────────────────────
    #[arg(long, env = "WEBHOOK_MAX_RETRIES", default_value = "3")]
    pub webhook_max_retries: u32,

    #[arg(long, env = "WEBHOOK_INITIAL_DELAY_SECONDS", default_value = "1.0")]
    pub webhook_initial_delay_seconds: f64,

    #[arg(long, env = "WEBHOOK_BACKOFF_FACTOR", default_value = "2.0")]
    pub webhook_backoff_factor: f64,

    #[arg(long, env = "WEBHOOK_TIMEOUT_SECONDS", default_value = "10")]
    pub webhook_timeout_seconds: u64,

    /// Bound on concurrent fire-and-forget webhook deliveries.
    #[arg(long, env = "WEBHOOK_MAX_CONCURRENCY", default_value = "16")]
    pub webhook_max_concurrency: usize,

    /// Grace period on shutdown for in-flight deliveries to finish.
    #[arg(long, env = "WEBHOOK_DRAIN_TIMEOUT_SECONDS", default_value = "30")]
    pub webhook_drain_timeout_seconds: u64,

    // ── Read API / public surface (C12) ───────────────────────────────
    #[arg(long, env = "PUBLIC_STRUCTURAL_CORE_MODE", default_value = "true")]
    pub public_structural_core_mode: bool,

    #[arg(long, env = "FREE_DELAY_MINUTES", default_value = "10")]
    pub free_delay_minutes: i64,

    #[arg(long, env = "TIME_BUCKET_EXPOSE_INPLAY", default_value = "true")]
    pub time_bucket_expose_inplay: bool,

    #[arg(long, env = "API_LISTING_DEFAULT_LIMIT", default_value = "100")]
    pub api_listing_default_limit: i64,

    #[arg(long, env = "API_LISTING_MAX_LIMIT", default_value = "1000")]
    pub api_listing_max_limit: i64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.app_env == "production" && self.odds_api_key.is_empty() {
            anyhow::bail!("ODDS_API_KEY is required when APP_ENV=production");
        }
        if self.odds_poll_interval_seconds == 0 {
            anyhow::bail!("odds_poll_interval_seconds must be positive");
        }
        if self.odds_poll_interval_idle_seconds < self.odds_poll_interval_seconds {
            anyhow::bail!(
                "odds_poll_interval_idle_seconds must be >= odds_poll_interval_seconds"
            );
        }
        if self.odds_poll_interval_low_credit_seconds < self.odds_poll_interval_idle_seconds {
            anyhow::bail!(
                "odds_poll_interval_low_credit_seconds must be >= odds_poll_interval_idle_seconds"
            );
        }
        if self.odds_api_retry_attempts == 0 || self.odds_api_retry_attempts > 10 {
            anyhow::bail!("odds_api_retry_attempts must be between 1 and 10");
        }
        if self.circuit_failures_to_open == 0 {
            anyhow::bail!("circuit_failures_to_open must be positive");
        }
        if self.circuit_open_seconds == 0 {
            anyhow::bail!("circuit_open_seconds must be positive");
        }

        if self.consensus_min_books < 1 {
            anyhow::bail!("consensus_min_books must be at least 1");
        }
        if self.consensus_min_markets < 1 {
            anyhow::bail!("consensus_min_markets must be at least 1");
        }
        if self.consensus_lookback_minutes <= 0 {
            anyhow::bail!("consensus_lookback_minutes must be positive");
        }
        if self.consensus_retention_days <= 0 {
            anyhow::bail!("consensus_retention_days must be positive");
        }

        if self.dislocation_min_books < 1 {
            anyhow::bail!("dislocation_min_books must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.dislocation_ml_implied_prob_delta) {
            anyhow::bail!("dislocation_ml_implied_prob_delta must be between 0.0 and 1.0");
        }
        if self.dislocation_max_signals_per_event == 0 {
            anyhow::bail!("dislocation_max_signals_per_event must be positive");
        }

        if self.steam_min_books < 1 {
            anyhow::bail!("steam_min_books must be at least 1");
        }
        if self.steam_window_minutes <= 0 {
            anyhow::bail!("steam_window_minutes must be positive");
        }
        if self.steam_max_signals_per_event == 0 {
            anyhow::bail!("steam_max_signals_per_event must be positive");
        }

        if self.clv_minutes_after_commence < 0 {
            anyhow::bail!("clv_minutes_after_commence must not be negative");
        }
        if self.clv_lookback_days <= 0 {
            anyhow::bail!("clv_lookback_days must be positive");
        }
        if self.clv_retention_days <= 0 {
            anyhow::bail!("clv_retention_days must be positive");
        }
        if self.historical_backfill_max_games_per_run <= 0 {
            anyhow::bail!("historical_backfill_max_games_per_run must be positive");
        }

        if self.snapshot_retention_hours <= 0 {
            anyhow::bail!("snapshot_retention_hours must be positive");
        }
        if self.signal_retention_days <= 0 {
            anyhow::bail!("signal_retention_days must be positive");
        }
        if self.kpi_retention_days <= 0 {
            anyhow::bail!("kpi_retention_days must be positive");
        }
        if self.retention_sweep_batch_size <= 0 {
            anyhow::bail!("retention_sweep_batch_size must be positive");
        }

        if self.kalshi_max_per_cycle == 0 {
            anyhow::bail!("kalshi_max_per_cycle must be positive");
        }
        if self.polymarket_max_per_cycle == 0 {
            anyhow::bail!("polymarket_max_per_cycle must be positive");
        }
        if self.sportsdataio_timeout_seconds <= 0.0 {
            anyhow::bail!("sportsdataio_timeout_seconds must be positive");
        }
        if self.exchange_divergence_max_signals_per_event == 0 {
            anyhow::bail!("exchange_divergence_max_signals_per_event must be positive");
        }

        if self.webhook_max_retries > 20 {
            anyhow::bail!("webhook_max_retries must be <= 20");
        }
        if self.webhook_backoff_factor < 1.0 {
            anyhow::bail!("webhook_backoff_factor must be >= 1.0");
        }
        if self.webhook_max_concurrency == 0 {
            anyhow::bail!("webhook_max_concurrency must be positive");
        }

        if self.free_delay_minutes < 0 {
            anyhow::bail!("free_delay_minutes must not be negative");
        }
        if self.api_listing_max_limit <= 0 || self.api_listing_max_limit > 1000 {
            anyhow::bail!("api_listing_max_limit must be between 1 and 1000");
        }
        if self.api_listing_default_limit <= 0
            || self.api_listing_default_limit > self.api_listing_max_limit
        {
            anyhow::bail!("api_listing_default_limit must be between 1 and api_listing_max_limit");
        }

        Ok(())
    }

    pub fn nba_key_numbers_list(&self) -> Vec<f64> {
        self.nba_key_numbers
            .split(',')
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .collect()
    }

    pub fn odds_api_sport_keys_list(&self) -> Vec<String> {
        let values = Self::split_csv(&self.odds_api_sport_keys);
        if values.is_empty() {
            vec!["basketball_nba".to_string()]
        } else {
            values
        }
    }

    pub fn odds_api_markets_list(&self) -> Vec<String> {
        Self::split_csv(&self.odds_api_markets)
    }

    pub fn odds_api_bookmakers_list(&self) -> Option<Vec<String>> {
        let values = Self::split_csv(&self.odds_api_bookmakers);
        if values.is_empty() {
            None
        } else {
            Some(values)
        }
    }

    pub fn consensus_markets_list(&self) -> Vec<String> {
        Self::split_csv(&self.consensus_markets)
    }

    fn split_csv(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_tier_is_case_insensitive() {
        assert_eq!(venue_tier("Pinnacle"), "T1");
        assert_eq!(venue_tier("PINNACLE"), "T1");
        assert_eq!(venue_tier("draftkings"), "T3");
        assert_eq!(venue_tier("unknown_book"), DEFAULT_BOOK_TIER);
    }

    #[test]
    fn key_numbers_parse_from_default() {
        let cfg = Config::parse_from(["stratum-engine"]);
        assert_eq!(
            cfg.nba_key_numbers_list(),
            vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 10.0]
        );
    }

    #[test]
    fn bookmakers_list_is_none_when_unset() {
        let cfg = Config::parse_from(["stratum-engine"]);
        assert_eq!(cfg.odds_api_bookmakers_list(), None);
    }

    #[test]
    fn production_requires_odds_api_key() {
        let mut cfg = Config::parse_from(["stratum-engine"]);
        cfg.app_env = "production".to_string();
        assert!(cfg.validate().is_err());
        cfg.odds_api_key = "key".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sportsdataio_disabled_by_default_and_requires_positive_timeout() {
        let cfg = Config::parse_from(["stratum-engine"]);
        assert!(!cfg.enable_sportsdataio_injuries);
        assert!(cfg.validate().is_ok());

        let mut cfg = Config::parse_from(["stratum-engine"]);
        cfg.sportsdataio_timeout_seconds = 0.0;
        assert!(cfg.validate().is_err());
    }
}
