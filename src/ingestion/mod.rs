//! C1/C2 — ingestion. `odds` polls the sportsbook odds provider; `exchange`
//! polls Kalshi and (optionally) Polymarket for the same canonical events.
//! `sportsdataio` is a third, purely optional source: an injury feed that
//! never touches signal or structural detection, which only ever reads
//! what's already committed.

pub mod exchange;
pub mod odds;
pub mod sportsdataio;
