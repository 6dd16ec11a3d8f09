//! C5 — signal detector. Each submodule implements one stateless rule over
//! the candidate event_ids of a cycle; `orchestrator.rs` calls each rule's
//! `detect` once per event per cycle and persists whatever it returns.
//!
//! Shared here: per-signal `time_bucket` derivation, score clamping, and
//! the cooldown-dedupe helper every rule gates its inserts through.

pub mod dislocation;
pub mod exchange_divergence;
pub mod live_shock;
pub mod move_rules;
pub mod multibook_sync;
pub mod steam;

use crate::db::models::TimeBucket;
use crate::kv::KvStore;
use chrono::{DateTime, Utc};

/// Minutes remaining until `commence_time`. Negative once the game has
/// started.
pub fn minutes_to_tip(now: DateTime<Utc>, commence_time: DateTime<Utc>) -> f64 {
    (commence_time - now).num_seconds() as f64 / 60.0
}

pub fn time_bucket_for(now: DateTime<Utc>, commence_time: Option<DateTime<Utc>>) -> TimeBucket {
    TimeBucket::from_minutes_to_tip(commence_time.map(|c| minutes_to_tip(now, c)))
}

/// Clamps a raw additive score into the signal's `[1, 100]` range.
pub fn clamp_score(raw: f64) -> i64 {
    raw.round().clamp(1.0, 100.0) as i64
}

/// Checks and sets a cooldown key in one step: returns `true` the first
/// time a given key is seen within `cooldown_seconds`, `false` on every
/// subsequent call until it expires. Rules call this immediately before
/// inserting a signal so the insert and the gate can't race apart.
pub fn cooldown_allows(kv: &KvStore, key: &str, cooldown_seconds: u64) -> bool {
    if cooldown_seconds == 0 {
        return true;
    }
    kv.set_nx_ex(key, "1", cooldown_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_to_tip_is_negative_once_live() {
        let now = Utc::now();
        let tip = now - chrono::Duration::minutes(30);
        assert!(minutes_to_tip(now, tip) < 0.0);
    }

    #[test]
    fn cooldown_allows_once_then_blocks() {
        let kv = KvStore::new();
        assert!(cooldown_allows(&kv, "cooldown:evt1:MOVE:spreads:BOS", 900));
        assert!(!cooldown_allows(&kv, "cooldown:evt1:MOVE:spreads:BOS", 900));
    }
}
