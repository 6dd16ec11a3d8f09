use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tracked sporting event. Upserted by `event_id`; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub event_id: String,
    pub sport_key: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
}

/// One sportsbook's quote for one outcome at one point in time. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub id: Option<i64>,
    pub event_id: String,
    pub sport_key: String,
    pub sportsbook_key: String,
    /// "spreads" | "totals" | "h2h"
    pub market: String,
    pub outcome_name: String,
    pub line: Option<f64>,
    pub price: i64,
    pub fetched_at: DateTime<Utc>,
}

/// Computed median/dispersion across qualifying books for one outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConsensusSnapshot {
    pub event_id: String,
    pub market: String,
    pub outcome_name: String,
    pub consensus_line: Option<f64>,
    pub consensus_price: Option<f64>,
    pub dispersion: Option<f64>,
    pub books_count: i64,
    pub fetched_at: DateTime<Utc>,
}

/// Venue confirmation tier used for structural-event confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueTier {
    T1,
    T2,
    T3,
}

impl VenueTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueTier::T1 => "T1",
            VenueTier::T2 => "T2",
            VenueTier::T3 => "T3",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "T1" => VenueTier::T1,
            "T2" => VenueTier::T2,
            _ => VenueTier::T3,
        }
    }
}

/// A per-venue price change for one outcome, feeding structural analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteMoveEvent {
    pub id: Option<i64>,
    pub event_id: String,
    pub market_key: String,
    pub outcome_name: String,
    pub venue: String,
    pub venue_tier: VenueTier,
    pub old_line: Option<f64>,
    pub new_line: Option<f64>,
    pub delta: Option<f64>,
    pub old_price: Option<i64>,
    pub new_price: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdType {
    Integer,
    Half,
}

impl ThresholdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdType::Integer => "INTEGER",
            ThresholdType::Half => "HALF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakDirection {
    Up,
    Down,
}

impl BreakDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakDirection::Up => "UP",
            BreakDirection::Down => "DOWN",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            BreakDirection::Up => BreakDirection::Down,
            BreakDirection::Down => BreakDirection::Up,
        }
    }
}

/// A confirmed crossing of an integer or half-point line threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralEvent {
    pub id: Option<i64>,
    pub event_id: String,
    pub market_key: String,
    pub outcome_name: String,
    pub threshold_value: f64,
    pub threshold_type: ThresholdType,
    pub break_direction: BreakDirection,
    pub origin_venue: String,
    pub origin_venue_tier: VenueTier,
    pub origin_timestamp: DateTime<Utc>,
    pub confirmation_timestamp: DateTime<Utc>,
    pub adoption_percentage: Option<f64>,
    pub adoption_count: i64,
    pub active_venue_count: i64,
    pub time_to_consensus_seconds: Option<i64>,
    pub dispersion_pre: Option<f64>,
    pub dispersion_post: Option<f64>,
    pub break_hold_minutes: f64,
    pub reversal_detected: bool,
    pub reversal_timestamp: Option<DateTime<Utc>>,
}

/// One venue's participation in a confirmed structural event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralEventVenueParticipation {
    pub structural_event_id: i64,
    pub venue: String,
    pub venue_tier: VenueTier,
    pub crossed_at: DateTime<Utc>,
    pub line_before: Option<f64>,
    pub line_after: Option<f64>,
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Move,
    KeyCross,
    MultibookSync,
    Dislocation,
    Steam,
    LiveShock,
    ExchangeDivergence,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Move => "MOVE",
            SignalType::KeyCross => "KEY_CROSS",
            SignalType::MultibookSync => "MULTIBOOK_SYNC",
            SignalType::Dislocation => "DISLOCATION",
            SignalType::Steam => "STEAM",
            SignalType::LiveShock => "LIVE_SHOCK",
            SignalType::ExchangeDivergence => "EXCHANGE_DIVERGENCE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "MOVE" => SignalType::Move,
            "KEY_CROSS" => SignalType::KeyCross,
            "MULTIBOOK_SYNC" => SignalType::MultibookSync,
            "DISLOCATION" => SignalType::Dislocation,
            "STEAM" => SignalType::Steam,
            "LIVE_SHOCK" => SignalType::LiveShock,
            "EXCHANGE_DIVERGENCE" => SignalType::ExchangeDivergence,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    Up,
    Down,
    Flat,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Up => "UP",
            SignalDirection::Down => "DOWN",
            SignalDirection::Flat => "FLAT",
        }
    }
}

/// Coarse classification of a signal's temporal position relative to tipoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeBucket {
    Open,
    Mid,
    Late,
    Pretip,
    Inplay,
    Unknown,
}

impl TimeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Open => "OPEN",
            TimeBucket::Mid => "MID",
            TimeBucket::Late => "LATE",
            TimeBucket::Pretip => "PRETIP",
            TimeBucket::Inplay => "INPLAY",
            TimeBucket::Unknown => "UNKNOWN",
        }
    }

    /// Classify minutes-to-tipoff per spec.md §8: PRETIP<=[0,15], LATE<=(15,60],
    /// MID<=(60,240], OPEN>240, INPLAY<0, UNKNOWN when tipoff unknown.
    pub fn from_minutes_to_tip(minutes_to_tip: Option<f64>) -> Self {
        let Some(m) = minutes_to_tip else {
            return TimeBucket::Unknown;
        };
        if m < 0.0 {
            TimeBucket::Inplay
        } else if m <= 15.0 {
            TimeBucket::Pretip
        } else if m <= 60.0 {
            TimeBucket::Late
        } else if m <= 240.0 {
            TimeBucket::Mid
        } else {
            TimeBucket::Open
        }
    }
}

/// A detected market-intelligence event ready for dispatch and analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub event_id: String,
    pub market: String,
    pub signal_type: SignalType,
    pub direction: SignalDirection,
    pub from_value: Option<f64>,
    pub to_value: Option<f64>,
    pub from_price: Option<i64>,
    pub to_price: Option<i64>,
    pub window_minutes: i64,
    pub books_affected: i64,
    pub velocity_minutes: f64,
    pub time_bucket: TimeBucket,
    pub strength_score: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Bridges a sportsbook event to the exchange markets covering the same
/// real-world game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEventAlignment {
    pub canonical_event_key: String,
    pub sport: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub sportsbook_event_id: String,
    pub kalshi_market_id: Option<String>,
    pub polymarket_market_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeSource {
    Kalshi,
    Polymarket,
}

impl ExchangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeSource::Kalshi => "KALSHI",
            ExchangeSource::Polymarket => "POLYMARKET",
        }
    }
}

/// One exchange's quote for one outcome at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeQuoteEvent {
    pub id: Option<i64>,
    pub canonical_event_key: String,
    pub source: ExchangeSource,
    pub market_id: String,
    /// "YES" | "NO"
    pub outcome_name: String,
    pub probability: f64,
    pub price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadSource {
    Exchange,
    Sportsbook,
    None,
}

impl LeadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadSource::Exchange => "EXCHANGE",
            LeadSource::Sportsbook => "SPORTSBOOK",
            LeadSource::None => "NONE",
        }
    }
}

/// Nearest-match between a sportsbook structural break and an exchange
/// probability-threshold crossing for the same canonical event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossMarketLeadLagEvent {
    pub id: Option<i64>,
    pub canonical_event_key: String,
    pub threshold_type: ThresholdType,
    pub sportsbook_threshold_value: f64,
    pub exchange_probability_threshold: f64,
    pub lead_source: LeadSource,
    pub sportsbook_break_timestamp: DateTime<Utc>,
    pub exchange_break_timestamp: DateTime<Utc>,
    pub lag_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceType {
    Aligned,
    ExchangeLeads,
    SportsbookLeads,
    Opposed,
    Unconfirmed,
    Reverted,
}

impl DivergenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivergenceType::Aligned => "ALIGNED",
            DivergenceType::ExchangeLeads => "EXCHANGE_LEADS",
            DivergenceType::SportsbookLeads => "SPORTSBOOK_LEADS",
            DivergenceType::Opposed => "OPPOSED",
            DivergenceType::Unconfirmed => "UNCONFIRMED",
            DivergenceType::Reverted => "REVERTED",
        }
    }
}

/// One classified cross-market alignment outcome for a canonical event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossMarketDivergenceEvent {
    pub id: Option<i64>,
    pub canonical_event_key: String,
    pub divergence_type: DivergenceType,
    pub lead_source: LeadSource,
    pub sportsbook_threshold_value: Option<f64>,
    pub exchange_probability_threshold: Option<f64>,
    pub sportsbook_break_timestamp: Option<DateTime<Utc>>,
    pub exchange_break_timestamp: Option<DateTime<Utc>>,
    pub lag_seconds: Option<i64>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_type: Option<String>,
    pub idempotency_key: String,
}

/// Last pre-tipoff consensus snapshot for one outcome. Upsert semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingConsensus {
    pub event_id: String,
    pub market: String,
    pub outcome_name: String,
    pub close_line: Option<f64>,
    pub close_price: Option<f64>,
    pub close_fetched_at: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

/// Closing-line-value computation for one signal. Unique on `signal_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClvRecord {
    pub signal_id: i64,
    pub event_id: String,
    pub signal_type: SignalType,
    pub market: String,
    pub outcome_name: String,
    pub entry_line: Option<f64>,
    pub entry_price: Option<i64>,
    pub close_line: Option<f64>,
    pub close_price: Option<f64>,
    pub clv_line: Option<f64>,
    pub clv_prob: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

/// Per-cycle operational metrics. Upsert by `cycle_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleKpi {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub requests_used_delta: Option<i64>,
    pub events_processed: i64,
    pub snapshots_inserted: i64,
    pub consensus_points_written: i64,
    pub signals_created_total: i64,
    pub signals_created_by_type: HashMap<String, i64>,
    pub alerts_sent: i64,
    pub alerts_failed: i64,
    pub degraded: bool,
    pub notes: Option<String>,
}

/// A registered alert destination (external collaborator; engine only reads
/// and appends delivery logs against it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: i64,
    pub url: String,
    pub secret: String,
    pub is_active: bool,
    pub min_strength: i64,
    /// Comma-separated market gate, e.g. "spreads,totals"; empty means all.
    pub market_gates: String,
    pub cooldown_seconds: i64,
    pub discord_webhook_url: Option<String>,
}

/// One attempt (or attempt sequence) of a webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryLog {
    pub id: Option<i64>,
    pub signal_id: i64,
    pub subscriber_id: i64,
    pub status: String,
    pub body_preview: String,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub attempts: i64,
    pub delivered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_bucket_boundaries() {
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(-1.0)), TimeBucket::Inplay);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(0.0)), TimeBucket::Pretip);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(15.0)), TimeBucket::Pretip);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(15.1)), TimeBucket::Late);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(60.0)), TimeBucket::Late);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(60.1)), TimeBucket::Mid);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(240.0)), TimeBucket::Mid);
        assert_eq!(TimeBucket::from_minutes_to_tip(Some(240.1)), TimeBucket::Open);
        assert_eq!(TimeBucket::from_minutes_to_tip(None), TimeBucket::Unknown);
    }

    #[test]
    fn break_direction_opposite() {
        assert_eq!(BreakDirection::Up.opposite(), BreakDirection::Down);
        assert_eq!(BreakDirection::Down.opposite(), BreakDirection::Up);
    }

    #[test]
    fn signal_type_round_trips() {
        for t in [
            SignalType::Move,
            SignalType::KeyCross,
            SignalType::MultibookSync,
            SignalType::Dislocation,
            SignalType::Steam,
            SignalType::LiveShock,
            SignalType::ExchangeDivergence,
        ] {
            assert_eq!(SignalType::from_str(t.as_str()), Some(t));
        }
    }
}
