//! C12 — read API for intel. Every handler here only reads; per the
//! concurrency model only the cycle orchestrator ever mutates ingestion/
//! detection tables. Routed the way the teacher's dashboard router is:
//! a single `AppState`, `State` extractor, `Json` responses, CORS-open.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::db::models::{ClvRecord, Signal, SignalType};
use crate::db::Database;

const MAX_LIMIT: i64 = 1000;
const DEFAULT_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/intel/consensus", get(consensus_handler))
        .route("/api/v1/intel/consensus/latest", get(consensus_latest_handler))
        .route("/api/v1/intel/clv", get(clv_handler))
        .route("/api/v1/intel/clv/summary", get(clv_summary_handler))
        .route("/api/v1/intel/clv/recap", get(clv_recap_handler))
        .route("/api/v1/intel/clv/scorecards", get(clv_scorecards_handler))
        .route("/api/v1/intel/clv/teaser", get(clv_teaser_handler))
        .route("/api/v1/intel/signals/quality", get(signals_quality_handler))
        .route("/api/v1/intel/signals/weekly-summary", get(signals_weekly_summary_handler))
        .route("/api/v1/intel/signals/lifecycle", get(signals_lifecycle_handler))
        .route("/api/v1/intel/books/actionable", get(books_actionable_handler))
        .route("/api/v1/intel/books/actionable/batch", get(books_actionable_batch_handler))
        .route("/api/v1/intel/opportunities", get(opportunities_handler))
        .route("/api/v1/intel/opportunities/teaser", get(opportunities_teaser_handler))
        .route("/api/v1/public/teaser/opportunities", get(public_teaser_opportunities_handler))
        .route("/api/v1/public/teaser/kpis", get(public_teaser_kpis_handler))
        .route("/api/v1/intel/teaser/events", post(teaser_events_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn clamp_pagination(limit: Option<i64>, offset: Option<i64>) -> Result<(i64, i64), ApiError> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    let offset = offset.unwrap_or(0);
    if limit <= 0 || limit > MAX_LIMIT {
        return Err(bad_request(format!("limit must be in 1..={MAX_LIMIT}")));
    }
    if offset < 0 {
        return Err(bad_request("offset must be >= 0"));
    }
    Ok((limit, offset))
}

const VALID_SPORT_KEYS: &[&str] = &["basketball_nba", "basketball_ncaab", "americanfootball_nfl"];

fn validate_sport_key(sport_key: &str) -> Result<(), ApiError> {
    if VALID_SPORT_KEYS.contains(&sport_key) {
        Ok(())
    } else {
        Err(bad_request(format!(
            "sport_key must be one of {VALID_SPORT_KEYS:?}"
        )))
    }
}

fn validate_signal_type(raw: &str) -> Result<SignalType, ApiError> {
    SignalType::from_str(raw).ok_or_else(|| bad_request(format!("unknown signal_type '{raw}'")))
}

/// Subscription tier, read from `X-Stratum-Tier` (defaults to free). The
/// core spec doesn't define an auth scheme; this header is the seam a real
/// deployment would put a JWT/API-key middleware in front of.
#[derive(PartialEq, Eq, Clone, Copy)]
enum Tier {
    Free,
    Pro,
}

fn tier_of(headers: &HeaderMap) -> Tier {
    match headers.get("x-stratum-tier").and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("pro") => Tier::Pro,
        _ => Tier::Free,
    }
}

fn require_pro(tier: Tier) -> Result<(), ApiError> {
    if tier == Tier::Pro {
        Ok(())
    } else {
        Err((StatusCode::PAYMENT_REQUIRED, "this endpoint requires a pro subscription".into()))
    }
}

/// Redacts/delays a free-tier signal feed per `FREE_DELAY_MINUTES` and
/// `PUBLIC_STRUCTURAL_CORE_MODE`: drops signals younger than the delay
/// window, and (in structural-core mode) anything that isn't a structural
/// signal type analogue (STEAM/DISLOCATION survive; everything else is
/// filtered for anonymous teaser consumption).
fn apply_free_gating(config: &Config, signals: Vec<Signal>, public: bool) -> Vec<Signal> {
    let cutoff = Utc::now() - chrono::Duration::minutes(config.free_delay_minutes);
    signals
        .into_iter()
        .filter(|s| s.created_at <= cutoff)
        .filter(|s| {
            if !public || !config.public_structural_core_mode {
                true
            } else {
                matches!(s.signal_type, SignalType::Steam | SignalType::Dislocation | SignalType::KeyCross)
            }
        })
        .filter(|s| config.time_bucket_expose_inplay || !matches!(s.time_bucket, crate::db::models::TimeBucket::Inplay))
        .collect()
}

#[derive(Deserialize)]
struct ConsensusQuery {
    event_id: String,
    market: Option<String>,
    sport_key: Option<String>,
}

async fn consensus_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConsensusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let rows = state
        .db
        .list_consensus(&q.event_id, q.market.as_deref(), q.sport_key.as_deref())
        .map_err(internal)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct ConsensusLatestQuery {
    market: Option<String>,
    sport_key: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn consensus_latest_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ConsensusLatestQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    let rows = state
        .db
        .list_latest_consensus_global(q.market.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct ClvQuery {
    event_id: Option<String>,
    sport_key: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn clv_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ClvQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    let rows = state
        .db
        .list_clv_records(q.event_id.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;
    Ok(Json(rows))
}

#[derive(Serialize)]
struct ClvMarketSummary {
    market: String,
    records: usize,
    avg_clv_line: Option<f64>,
    avg_clv_prob: Option<f64>,
}

fn summarize_clv(records: &[ClvRecord]) -> Vec<ClvMarketSummary> {
    use std::collections::HashMap;
    let mut by_market: HashMap<String, Vec<&ClvRecord>> = HashMap::new();
    for r in records {
        by_market.entry(r.market.clone()).or_default().push(r);
    }
    let mut out: Vec<ClvMarketSummary> = by_market
        .into_iter()
        .map(|(market, rows)| {
            let lines: Vec<f64> = rows.iter().filter_map(|r| r.clv_line).collect();
            let probs: Vec<f64> = rows.iter().filter_map(|r| r.clv_prob).collect();
            ClvMarketSummary {
                market,
                records: rows.len(),
                avg_clv_line: crate::oddsmath::median(&lines),
                avg_clv_prob: crate::oddsmath::median(&probs),
            }
        })
        .collect();
    out.sort_by(|a, b| a.market.cmp(&b.market));
    out
}

async fn clv_summary_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_pro(tier_of(&headers))?;
    let records = state.db.list_clv_records(None, None, MAX_LIMIT, 0).map_err(internal)?;
    Ok(Json(summarize_clv(&records)))
}

async fn clv_recap_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_pro(tier_of(&headers))?;
    let records = state.db.list_clv_records(None, None, 50, 0).map_err(internal)?;
    Ok(Json(records))
}

async fn clv_scorecards_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_pro(tier_of(&headers))?;
    let records = state.db.list_clv_records(None, None, MAX_LIMIT, 0).map_err(internal)?;
    Ok(Json(summarize_clv(&records)))
}

#[derive(Serialize)]
struct ClvTeaser {
    market: String,
    records: usize,
    avg_clv_prob_bucket: &'static str,
}

/// Free teaser: same market grouping as the pro summary, but averages are
/// bucketed ("positive"/"flat"/"negative") rather than exact numbers.
async fn clv_teaser_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let records = state.db.list_clv_records(None, None, MAX_LIMIT, 0).map_err(internal)?;
    let summary = summarize_clv(&records);
    let teaser: Vec<ClvTeaser> = summary
        .into_iter()
        .map(|s| ClvTeaser {
            market: s.market,
            records: s.records,
            avg_clv_prob_bucket: match s.avg_clv_prob {
                Some(p) if p > 0.01 => "positive",
                Some(p) if p < -0.01 => "negative",
                Some(_) => "flat",
                None => "unknown",
            },
        })
        .collect();
    Ok(Json(teaser))
}

#[derive(Deserialize)]
struct SignalsQuery {
    signal_type: Option<String>,
    event_id: Option<String>,
    sport_key: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct SignalQualityBucket {
    signal_type: String,
    count: usize,
    avg_strength: f64,
}

async fn signals_quality_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    if let Some(t) = &q.signal_type {
        validate_signal_type(t)?;
    }
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let rows = state
        .db
        .list_signals(q.signal_type.as_deref(), q.event_id.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;

    use std::collections::HashMap;
    let mut by_type: HashMap<&'static str, Vec<i64>> = HashMap::new();
    for s in &rows {
        by_type.entry(s.signal_type.as_str()).or_default().push(s.strength_score);
    }
    let mut buckets: Vec<SignalQualityBucket> = by_type
        .into_iter()
        .map(|(signal_type, scores)| {
            let avg_strength = scores.iter().sum::<i64>() as f64 / scores.len().max(1) as f64;
            SignalQualityBucket {
                signal_type: signal_type.to_string(),
                count: scores.len(),
                avg_strength,
            }
        })
        .collect();
    buckets.sort_by(|a, b| a.signal_type.cmp(&b.signal_type));
    Ok(Json(buckets))
}

#[derive(Serialize)]
struct WeeklyDayCount {
    date: String,
    count: usize,
}

async fn signals_weekly_summary_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let since = Utc::now() - chrono::Duration::days(7);
    let signals = state.db.list_signals_since(since).map_err(internal)?;

    use std::collections::HashMap;
    let mut by_day: HashMap<String, usize> = HashMap::new();
    for s in &signals {
        *by_day.entry(s.created_at.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
    }
    let mut days: Vec<WeeklyDayCount> = by_day
        .into_iter()
        .map(|(date, count)| WeeklyDayCount { date, count })
        .collect();
    days.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(Json(days))
}

#[derive(Serialize)]
struct SignalLifecycleRow {
    signal_id: i64,
    event_id: String,
    market: String,
    signal_type: String,
    created_at: chrono::DateTime<Utc>,
    clv_computed: bool,
    clv_prob: Option<f64>,
}

async fn signals_lifecycle_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    if let Some(t) = &q.signal_type {
        validate_signal_type(t)?;
    }
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let signals = state
        .db
        .list_signals(q.signal_type.as_deref(), q.event_id.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;

    let mut rows = Vec::with_capacity(signals.len());
    for s in signals {
        let clv = s.id.and_then(|id| state.db.get_clv_record(id).ok().flatten());
        rows.push(SignalLifecycleRow {
            signal_id: s.id.unwrap_or_default(),
            event_id: s.event_id,
            market: s.market,
            signal_type: s.signal_type.as_str().to_string(),
            created_at: s.created_at,
            clv_computed: clv.is_some(),
            clv_prob: clv.and_then(|c| c.clv_prob),
        });
    }
    Ok(Json(rows))
}

#[derive(Serialize)]
struct ActionableBook {
    signal_id: i64,
    event_id: String,
    market: String,
    outcome_name: Option<String>,
    book: Option<String>,
    delta: Option<f64>,
}

fn actionable_book_for(signal: &Signal) -> ActionableBook {
    ActionableBook {
        signal_id: signal.id.unwrap_or_default(),
        event_id: signal.event_id.clone(),
        market: signal.market.clone(),
        outcome_name: signal.metadata.get("outcome_name").and_then(|v| v.as_str()).map(str::to_string),
        book: signal.metadata.get("book").and_then(|v| v.as_str()).map(str::to_string),
        delta: signal.metadata.get("delta").and_then(|v| v.as_f64()),
    }
}

#[derive(Deserialize)]
struct SignalIdQuery {
    signal_id: i64,
    sport_key: Option<String>,
}

/// A signal's own row carries no `sport_key` (that lives on its `Game`), so
/// filtering here means looking the event up and rejecting a mismatch —
/// same semantics as the `JOIN games` predicate the listing endpoints use.
fn signal_matches_sport_key(db: &Database, signal: &Signal, sport_key: Option<&str>) -> Result<bool, ApiError> {
    let Some(sport_key) = sport_key else {
        return Ok(true);
    };
    let game_sport_key = db.get_game(&signal.event_id).map_err(internal)?.map(|g| g.sport_key);
    Ok(game_sport_key.as_deref() == Some(sport_key))
}

async fn books_actionable_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalIdQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let signal = state
        .db
        .get_signal(q.signal_id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "signal not found".to_string()))?;
    if !signal_matches_sport_key(&state.db, &signal, q.sport_key.as_deref())? {
        return Err((StatusCode::NOT_FOUND, "signal not found".to_string()));
    }
    Ok(Json(actionable_book_for(&signal)))
}

#[derive(Deserialize)]
struct SignalIdsQuery {
    signal_ids: String,
    sport_key: Option<String>,
}

async fn books_actionable_batch_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalIdsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let ids: Result<Vec<i64>, _> = q.signal_ids.split(',').map(|s| s.trim().parse::<i64>()).collect();
    let ids = ids.map_err(|_| bad_request("signal_ids must be a comma-separated list of integers"))?;
    if ids.len() > MAX_LIMIT as usize {
        return Err(bad_request(format!("signal_ids must contain at most {MAX_LIMIT} entries")));
    }
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(signal) = state.db.get_signal(id).map_err(internal)? {
            if signal_matches_sport_key(&state.db, &signal, q.sport_key.as_deref())? {
                out.push(actionable_book_for(&signal));
            }
        }
    }
    Ok(Json(out))
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_pro(tier_of(&headers))?;
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    if let Some(t) = &q.signal_type {
        validate_signal_type(t)?;
    }
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let rows = state
        .db
        .list_signals(q.signal_type.as_deref(), q.event_id.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;
    Ok(Json(rows))
}

async fn opportunities_teaser_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    let rows = state
        .db
        .list_signals(q.signal_type.as_deref(), q.event_id.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;
    Ok(Json(apply_free_gating(&state.config, rows, false)))
}

#[derive(Serialize)]
struct PublicOpportunity {
    sport_key: Option<String>,
    market: String,
    signal_type: String,
    direction: String,
    strength_score: i64,
    time_bucket: String,
}

async fn public_teaser_opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SignalsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sk) = &q.sport_key {
        validate_sport_key(sk)?;
    }
    let (limit, offset) = clamp_pagination(q.limit, q.offset)?;
    let rows = state
        .db
        .list_signals(None, q.event_id.as_deref(), q.sport_key.as_deref(), limit, offset)
        .map_err(internal)?;
    let gated = apply_free_gating(&state.config, rows, true);
    let redacted: Vec<PublicOpportunity> = gated
        .into_iter()
        .map(|s| PublicOpportunity {
            sport_key: state.db.get_game(&s.event_id).ok().flatten().map(|g| g.sport_key),
            market: s.market,
            signal_type: s.signal_type.as_str().to_string(),
            direction: s.direction.as_str().to_string(),
            strength_score: s.strength_score,
            time_bucket: s.time_bucket.as_str().to_string(),
        })
        .collect();
    Ok(Json(redacted))
}

#[derive(Serialize)]
struct PublicKpis {
    cycles_sampled: usize,
    avg_duration_ms: f64,
    total_signals_recent: i64,
}

async fn public_teaser_kpis_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let kpis = state.db.list_recent_cycle_kpis(50).map_err(internal)?;
    let durations: Vec<f64> = kpis.iter().filter_map(|k| k.duration_ms).map(|d| d as f64).collect();
    let avg_duration_ms = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    let total_signals_recent = kpis.iter().map(|k| k.signals_created_total).sum();
    Ok(Json(PublicKpis {
        cycles_sampled: kpis.len(),
        avg_duration_ms,
        total_signals_recent,
    }))
}

#[derive(Deserialize)]
struct TeaserEvent {
    event_name: String,
    #[serde(default)]
    properties: serde_json::Value,
}

/// Logs a teaser-surface user interaction. No dedicated table is specified
/// for these; rather than invent persistence for a fire-and-forget
/// analytics ping, this just structured-logs it (consistent with how the
/// rest of the engine treats purely observational events) and
/// acknowledges with 202.
async fn teaser_events_handler(Json(event): Json<TeaserEvent>) -> impl IntoResponse {
    info!(event_name = %event.event_name, properties = %event.properties, "teaser interaction");
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_pagination_rejects_over_max_limit() {
        assert!(clamp_pagination(Some(2000), Some(0)).is_err());
        assert!(clamp_pagination(Some(50), Some(-1)).is_err());
        assert_eq!(clamp_pagination(None, None).unwrap(), (DEFAULT_LIMIT, 0));
    }

    #[test]
    fn validate_sport_key_rejects_unknown() {
        assert!(validate_sport_key("basketball_nba").is_ok());
        assert!(validate_sport_key("basketball_euroleague").is_err());
    }

    #[test]
    fn validate_signal_type_rejects_unknown() {
        assert!(validate_signal_type("STEAM").is_ok());
        assert!(validate_signal_type("NOT_A_TYPE").is_err());
    }

    #[test]
    fn tier_header_defaults_to_free() {
        let headers = HeaderMap::new();
        assert!(matches!(tier_of(&headers), Tier::Free));
    }
}
