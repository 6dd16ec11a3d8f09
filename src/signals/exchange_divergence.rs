//! EXCHANGE_DIVERGENCE: surfaces unresolved cross-market divergence
//! classifications (EXCHANGE_LEADS, SPORTSBOOK_LEADS, OPPOSED) as signals.
//! Resolution of the underlying `CrossMarketDivergenceEvent` row bypasses
//! the per-event cooldown (see DESIGN.md); new signal emission here does
//! not.

use super::cooldown_allows;
use crate::config::Config;
use crate::db::models::{DivergenceType, Signal, SignalDirection, SignalType};
use crate::db::Database;
use crate::kv::KvStore;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;

pub fn detect(db: &Database, kv: &KvStore, config: &Config, canonical_event_key: &str) -> Result<Vec<i64>> {
    let now = Utc::now();
    let since = now - chrono::Duration::minutes(config.exchange_divergence_lookback_minutes);
    let rows = db.list_unresolved_divergences_since(since)?;

    let mut ids = Vec::new();
    let mut emitted = 0usize;
    for row in rows {
        if row.canonical_event_key != canonical_event_key {
            continue;
        }
        if emitted >= config.exchange_divergence_max_signals_per_event {
            break;
        }
        if !matches!(
            row.divergence_type,
            DivergenceType::ExchangeLeads | DivergenceType::SportsbookLeads | DivergenceType::Opposed
        ) {
            continue;
        }

        let dedupe_key = format!("cooldown:{canonical_event_key}:EXCHANGE_DIVERGENCE:{}", row.idempotency_key);
        if !cooldown_allows(kv, &dedupe_key, config.exchange_divergence_cooldown_seconds as u64) {
            continue;
        }

        let strength = match row.divergence_type {
            DivergenceType::Opposed => 90,
            DivergenceType::ExchangeLeads | DivergenceType::SportsbookLeads => 70,
            _ => 50,
        };

        let signal = Signal {
            id: None,
            event_id: canonical_event_key.to_string(),
            market: "cross_market".to_string(),
            signal_type: SignalType::ExchangeDivergence,
            direction: SignalDirection::Flat,
            from_value: row.sportsbook_threshold_value,
            to_value: row.exchange_probability_threshold,
            from_price: None,
            to_price: None,
            window_minutes: config.exchange_divergence_lookback_minutes,
            books_affected: 0,
            velocity_minutes: row.lag_seconds.map(|s| s as f64 / 60.0).unwrap_or(0.0),
            time_bucket: crate::db::models::TimeBucket::Unknown,
            strength_score: strength,
            created_at: now,
            metadata: HashMap::from([
                ("divergence_type".to_string(), json!(row.divergence_type.as_str())),
                ("lead_source".to_string(), json!(row.lead_source.as_str())),
                ("idempotency_key".to_string(), json!(row.idempotency_key)),
            ]),
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
    use crate::db::models::{CrossMarketDivergenceEvent, LeadSource};
    use clap::Parser;

    #[test]
    fn emits_one_signal_per_unresolved_divergence() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let config = Config::parse_from(["stratum-engine"]);
        let now = Utc::now();
        db.insert_divergence_event(&CrossMarketDivergenceEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            divergence_type: DivergenceType::ExchangeLeads,
            lead_source: LeadSource::Exchange,
            sportsbook_threshold_value: Some(-3.5),
            exchange_probability_threshold: Some(0.55),
            sportsbook_break_timestamp: Some(now),
            exchange_break_timestamp: Some(now),
            lag_seconds: Some(120),
            resolved: false,
            resolved_at: None,
            resolution_type: None,
            idempotency_key: "evt1|EXCHANGE_LEADS|t0|t0|-3.5|0.55".into(),
        })
        .unwrap();
        let ids = detect(&db, &kv, &config, "evt1").unwrap();
        assert_eq!(ids.len(), 1);
    }
}
