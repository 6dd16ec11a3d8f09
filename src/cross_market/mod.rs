//! C7 — cross-market lead/lag + divergence. Bridges a sportsbook event's
//! confirmed structural breaks (C6) against the exchange's own probability
//! moves (C2) for the same canonical real-world game, using the same
//! decimal-safe grid-crossing technique `structural.rs` uses for line
//! thresholds, scaled down to the exchange's 0.025 probability grid.

pub mod divergence;
pub mod lead_lag;

use crate::db::models::{BreakDirection, ExchangeQuoteEvent, ExchangeSource};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

fn prob_step() -> Decimal {
    Decimal::from_str("0.025").unwrap()
}

fn to_decimal(v: f64) -> Option<Decimal> {
    Decimal::from_str(&format!("{v:.6}")).ok()
}

/// Enumerates every `PROB_STEP`-grid threshold strictly crossed travelling
/// from `old` to `new`, tagged with the direction of travel. Mirrors
/// `structural::enumerate_crossings`, scaled to the exchange's probability
/// grid instead of the sportsbook's half-point line grid.
fn enumerate_prob_crossings(old: f64, new: f64) -> Vec<(Decimal, BreakDirection)> {
    let (Some(old_d), Some(new_d)) = (to_decimal(old), to_decimal(new)) else {
        return vec![];
    };
    if old_d == new_d {
        return vec![];
    }
    let step = prob_step();
    let mut out = Vec::new();
    if new_d > old_d {
        let mut k = (old_d / step).floor() + Decimal::ONE;
        loop {
            let t = k * step;
            if t > new_d {
                break;
            }
            out.push((t, BreakDirection::Up));
            k += Decimal::ONE;
        }
    } else {
        let mut k = (old_d / step).ceil() - Decimal::ONE;
        loop {
            let t = k * step;
            if t < new_d {
                break;
            }
            out.push((t, BreakDirection::Down));
            k -= Decimal::ONE;
        }
    }
    out
}

/// One confirmed probability-grid crossing for one exchange market/outcome.
#[derive(Debug, Clone)]
pub(crate) struct ProbCrossing {
    pub source: ExchangeSource,
    pub market_id: String,
    pub outcome_name: String,
    pub threshold: Decimal,
    pub direction: BreakDirection,
    pub timestamp: DateTime<Utc>,
}

/// Walks a time-sorted series of `ExchangeQuoteEvent` rows, grouped by
/// `(source, market_id, outcome_name)`, and emits one `ProbCrossing` per
/// grid boundary crossed between consecutive observations.
pub(crate) fn detect_prob_crossings(quotes: &[ExchangeQuoteEvent]) -> Vec<ProbCrossing> {
    let mut groups: HashMap<(ExchangeSource, String, String), Vec<&ExchangeQuoteEvent>> = HashMap::new();
    for q in quotes {
        groups
            .entry((q.source, q.market_id.clone(), q.outcome_name.clone()))
            .or_default()
            .push(q);
    }

    let mut out = Vec::new();
    for ((source, market_id, outcome_name), mut series) in groups {
        series.sort_by_key(|q| q.timestamp);
        for pair in series.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            for (threshold, direction) in enumerate_prob_crossings(prev.probability, curr.probability) {
                out.push(ProbCrossing {
                    source,
                    market_id: market_id.clone(),
                    outcome_name: outcome_name.clone(),
                    threshold,
                    direction,
                    timestamp: curr.timestamp,
                });
            }
        }
    }
    out.sort_by_key(|c| c.timestamp);
    out
}

pub(crate) fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_string().parse().unwrap_or(0.0)
}

/// Runs the full C7 pass for one canonical alignment: lead/lag matching
/// followed by divergence classification. Called once per touched
/// alignment per cycle by the orchestrator.
pub fn run_for_alignment(
    db: &crate::db::Database,
    canonical_event_key: &str,
) -> anyhow::Result<()> {
    lead_lag::detect_and_persist(db, canonical_event_key)?;
    divergence::classify_and_persist(db, canonical_event_key)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(source: ExchangeSource, market_id: &str, prob: f64, minutes_ago: i64) -> ExchangeQuoteEvent {
        ExchangeQuoteEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            source,
            market_id: market_id.into(),
            outcome_name: "YES".into(),
            probability: prob,
            price: Some(prob),
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn enumerate_prob_crossings_grid_up() {
        let crossings = enumerate_prob_crossings(0.50, 0.58);
        let thresholds: Vec<String> = crossings.iter().map(|(t, _)| t.to_string()).collect();
        assert_eq!(thresholds, vec!["0.525", "0.550", "0.575"]);
        assert!(crossings.iter().all(|(_, d)| *d == BreakDirection::Up));
    }

    #[test]
    fn detect_prob_crossings_across_series() {
        // 0.60 lands exactly on the grid; per the inclusive-of-new-value rule
        // that endpoint itself is emitted as a crossing alongside 0.525/0.550/0.575.
        let quotes = vec![
            quote(ExchangeSource::Kalshi, "KXNBA-BOS", 0.50, 10),
            quote(ExchangeSource::Kalshi, "KXNBA-BOS", 0.60, 5),
        ];
        let crossings = detect_prob_crossings(&quotes);
        let thresholds: Vec<String> = crossings.iter().map(|c| c.threshold.to_string()).collect();
        assert_eq!(thresholds, vec!["0.525", "0.550", "0.575", "0.600"]);
        assert!(crossings.iter().all(|c| c.market_id == "KXNBA-BOS"));
    }
}
