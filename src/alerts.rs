//! C9 — alert dispatcher. Evaluates each active subscriber's webhook rule
//! against a batch of freshly persisted signals, delivers signed payloads
//! with bounded retries/backoff, and separately posts a Discord embed when
//! a subscriber has configured one. Runs fire-and-forget from the cycle
//! orchestrator's perspective: the caller spawns [`dispatch`] and moves on,
//! only waiting for it (bounded by `WEBHOOK_DRAIN_TIMEOUT_SECONDS`) on
//! graceful shutdown.

use crate::config::Config;
use crate::db::models::{ClvRecord, Signal, WebhookDeliveryLog, WebhookEndpoint};
use crate::db::Database;
use crate::kv::KvStore;
use crate::signals::cooldown_allows;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const BODY_PREVIEW_MAX: usize = 1000;

/// Outcome of dispatching one cycle's signal batch. Feeds `CycleKpi`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchOutcome {
    pub alerts_sent: i64,
    pub alerts_failed: i64,
}

fn signal_matches_subscriber(signal: &Signal, subscriber: &WebhookEndpoint) -> bool {
    if signal.strength_score < subscriber.min_strength {
        return false;
    }
    if subscriber.market_gates.trim().is_empty() {
        return true;
    }
    subscriber
        .market_gates
        .split(',')
        .any(|m| m.trim().eq_ignore_ascii_case(&signal.market))
}

/// Per-subscriber re-alert cooldown: a subscriber configured for a 300s
/// cooldown hears about at most one signal per (event, market, signal type)
/// in that window, regardless of how many detectors fire in between.
fn subscriber_cooldown_allows(kv: &KvStore, signal: &Signal, subscriber: &WebhookEndpoint) -> bool {
    if subscriber.cooldown_seconds <= 0 {
        return true;
    }
    let key = format!(
        "webhook_cooldown:{}:{}:{}:{}",
        subscriber.id,
        signal.event_id,
        signal.market,
        signal.signal_type.as_str()
    );
    cooldown_allows(kv, &key, subscriber.cooldown_seconds as u64)
}

fn signal_payload(signal: &Signal) -> Value {
    json!({
        "event": "signal.detected",
        "signal_id": signal.id,
        "event_id": signal.event_id,
        "market": signal.market,
        "signal_type": signal.signal_type.as_str(),
        "direction": signal.direction.as_str(),
        "strength_score": signal.strength_score,
        "time_bucket": signal.time_bucket.as_str(),
        "from_value": signal.from_value,
        "to_value": signal.to_value,
        "created_at": signal.created_at,
        "metadata": signal.metadata,
    })
}

fn clv_payload(record: &ClvRecord) -> Value {
    json!({
        "event": "signal.clv_finalized",
        "signal_id": record.signal_id,
        "event_id": record.event_id,
        "market": record.market,
        "signal_type": record.signal_type.as_str(),
        "outcome_name": record.outcome_name,
        "entry_line": record.entry_line,
        "entry_price": record.entry_price,
        "close_line": record.close_line,
        "close_price": record.close_price,
        "clv_line": record.clv_line,
        "clv_prob": record.clv_prob,
        "computed_at": record.computed_at,
    })
}

/// CLV webhooks carry no strength score, so only the subscriber's market
/// gate applies — a subscriber gated to e.g. `spreads,h2h` still hears
/// about closing-line value on those markets even at `min_strength` 0.
fn clv_matches_subscriber(record: &ClvRecord, subscriber: &WebhookEndpoint) -> bool {
    if subscriber.market_gates.trim().is_empty() {
        return true;
    }
    subscriber
        .market_gates
        .split(',')
        .any(|m| m.trim().eq_ignore_ascii_case(&record.market))
}

fn sign_body(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn body_preview(body: &str) -> String {
    if body.len() <= BODY_PREVIEW_MAX {
        body.to_string()
    } else {
        body.chars().take(BODY_PREVIEW_MAX).collect()
    }
}

/// One delivery attempt sequence against a single subscriber webhook.
/// Retries on 5xx/transport errors up to `WEBHOOK_MAX_RETRIES`; a 4xx is
/// terminal. `attempts` never exceeds `WEBHOOK_MAX_RETRIES + 1`.
async fn deliver_with_retry(
    http: &Client,
    config: &Config,
    url: &str,
    body: &str,
    signature: &str,
) -> (bool, u32, Option<String>) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Stratum-Signature", format!("sha256={signature}"))
            .header("User-Agent", "Stratum-Webhook-Engine/1.0")
            .timeout(Duration::from_secs(config.webhook_timeout_seconds))
            .body(body.to_string())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => return (true, attempt, None),
            Ok(resp) if resp.status().is_client_error() => {
                return (false, attempt, Some(format!("terminal {}", resp.status())));
            }
            Ok(resp) => {
                let status = resp.status();
                if attempt > config.webhook_max_retries {
                    return (false, attempt, Some(format!("exhausted retries at {status}")));
                }
                warn!(%status, attempt, url, "webhook delivery transient failure, retrying");
            }
            Err(e) => {
                if attempt > config.webhook_max_retries {
                    return (false, attempt, Some(format!("exhausted retries: {e}")));
                }
                warn!(error = %e, attempt, url, "webhook delivery transport error, retrying");
            }
        }

        let delay = config.webhook_initial_delay_seconds
            * config.webhook_backoff_factor.powi(attempt as i32 - 1);
        tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
    }
}

async fn deliver_payload(
    http: &Client,
    db: &Database,
    config: &Config,
    subscriber: &WebhookEndpoint,
    signal_id: i64,
    payload: &Value,
) -> bool {
    let body = payload.to_string();
    let signature = sign_body(&subscriber.secret, &body);

    let started = std::time::Instant::now();
    let (success, attempts, error) =
        deliver_with_retry(http, config, &subscriber.url, &body, &signature).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let log = WebhookDeliveryLog {
        id: None,
        signal_id,
        subscriber_id: subscriber.id,
        status: if success { "delivered".to_string() } else { "failed".to_string() },
        body_preview: body_preview(&body),
        duration_ms,
        error,
        attempts: attempts as i64,
        delivered_at: Utc::now(),
    };
    if let Err(e) = db.insert_webhook_delivery_log(&log) {
        warn!(error = %e, "failed to persist webhook delivery log");
    }

    success
}

async fn deliver_one(
    http: Client,
    db: Database,
    config: Config,
    signal: Signal,
    subscriber: WebhookEndpoint,
) -> bool {
    let payload = signal_payload(&signal);
    let signal_id = signal.id.unwrap_or_default();
    let success = deliver_payload(&http, &db, &config, &subscriber, signal_id, &payload).await;

    if let Some(discord_url) = &subscriber.discord_webhook_url {
        if let Err(e) = post_discord_embed(&http, &config, discord_url, &signal).await {
            warn!(error = %e, "discord embed delivery failed");
        }
    }

    success
}

async fn deliver_one_clv(
    http: Client,
    db: Database,
    config: Config,
    record: ClvRecord,
    subscriber: WebhookEndpoint,
) -> bool {
    let payload = clv_payload(&record);
    deliver_payload(&http, &db, &config, &subscriber, record.signal_id, &payload).await
}

/// Formats a signal as a "STRATUM"-branded Discord embed and posts it to
/// the subscriber's separately configured Discord webhook URL. Best-effort:
/// failures are logged, never retried, never block the main delivery.
async fn post_discord_embed(
    http: &Client,
    config: &Config,
    discord_url: &str,
    signal: &Signal,
) -> anyhow::Result<()> {
    let embed = json!({
        "username": "STRATUM",
        "embeds": [{
            "title": format!("{} — {}", signal.signal_type.as_str(), signal.market),
            "description": format!(
                "{} {:?} ({} → {:?})",
                signal.event_id, signal.direction, signal.from_value.unwrap_or_default(), signal.to_value
            ),
            "color": 0x6c63ff,
            "fields": [
                { "name": "Strength", "value": signal.strength_score.to_string(), "inline": true },
                { "name": "Time bucket", "value": signal.time_bucket.as_str(), "inline": true },
            ],
            "timestamp": signal.created_at.to_rfc3339(),
        }],
    });
    http.post(discord_url)
        .timeout(Duration::from_secs(config.webhook_timeout_seconds))
        .json(&embed)
        .send()
        .await?;
    Ok(())
}

/// Evaluates every active subscriber against every signal in the batch and
/// delivers the matches, bounded to `WEBHOOK_MAX_CONCURRENCY` deliveries in
/// flight at once. Returns once the whole batch has drained — the caller
/// (the orchestrator) does not await this; it spawns it and moves on.
pub async fn dispatch(db: Database, kv: Arc<KvStore>, config: Config, signals: Vec<Signal>) -> DispatchOutcome {
    if signals.is_empty() {
        return DispatchOutcome::default();
    }
    let subscribers = match db.list_active_webhook_endpoints() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to load active webhook endpoints, skipping dispatch");
            return DispatchOutcome::default();
        }
    };
    if subscribers.is_empty() {
        return DispatchOutcome::default();
    }

    let http = match Client::builder()
        .timeout(Duration::from_secs(config.webhook_timeout_seconds))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build webhook HTTP client");
            return DispatchOutcome::default();
        }
    };

    let mut jobs = Vec::new();
    for signal in &signals {
        for subscriber in &subscribers {
            if signal_matches_subscriber(signal, subscriber) && subscriber_cooldown_allows(&kv, signal, subscriber) {
                jobs.push((signal.clone(), subscriber.clone()));
            }
        }
    }
    debug!(jobs = jobs.len(), "dispatching webhook deliveries");

    let results: Vec<bool> = stream::iter(jobs.into_iter().map(|(signal, subscriber)| {
        let http = http.clone();
        let db = db.clone();
        let config = config.clone();
        async move { deliver_one(http, db, config, signal, subscriber).await }
    }))
    .buffer_unordered(config.webhook_max_concurrency)
    .collect()
    .await;

    let alerts_sent = results.iter().filter(|&&ok| ok).count() as i64;
    let alerts_failed = results.len() as i64 - alerts_sent;
    DispatchOutcome { alerts_sent, alerts_failed }
}

/// Same fan-out as [`dispatch`] but for newly finalized CLV records,
/// posting the `signal.clv_finalized` payload shape instead of
/// `signal.detected`. Runs from the periodic C8 job, not the per-tick
/// ingestion/detection cycle.
pub async fn dispatch_clv(db: Database, config: Config, records: Vec<ClvRecord>) -> DispatchOutcome {
    if records.is_empty() {
        return DispatchOutcome::default();
    }
    let subscribers = match db.list_active_webhook_endpoints() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to load active webhook endpoints, skipping CLV dispatch");
            return DispatchOutcome::default();
        }
    };
    if subscribers.is_empty() {
        return DispatchOutcome::default();
    }

    let http = match Client::builder()
        .timeout(Duration::from_secs(config.webhook_timeout_seconds))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build webhook HTTP client");
            return DispatchOutcome::default();
        }
    };

    let mut jobs = Vec::new();
    for record in &records {
        for subscriber in &subscribers {
            if clv_matches_subscriber(record, subscriber) {
                jobs.push((record.clone(), subscriber.clone()));
            }
        }
    }
    debug!(jobs = jobs.len(), "dispatching CLV webhook deliveries");

    let results: Vec<bool> = stream::iter(jobs.into_iter().map(|(record, subscriber)| {
        let http = http.clone();
        let db = db.clone();
        let config = config.clone();
        async move { deliver_one_clv(http, db, config, record, subscriber).await }
    }))
    .buffer_unordered(config.webhook_max_concurrency)
    .collect()
    .await;

    let alerts_sent = results.iter().filter(|&&ok| ok).count() as i64;
    let alerts_failed = results.len() as i64 - alerts_sent;
    DispatchOutcome { alerts_sent, alerts_failed }
}

/// Spawns [`dispatch`] as a detached task and returns its handle so the
/// caller can optionally await it (bounded) during graceful shutdown.
pub fn spawn_dispatch(
    db: Database,
    kv: Arc<KvStore>,
    config: Config,
    signals: Vec<Signal>,
) -> tokio::task::JoinHandle<DispatchOutcome> {
    tokio::spawn(dispatch(db, kv, config, signals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{SignalDirection, SignalType, TimeBucket};
    use std::collections::HashMap;

    fn sample_signal(strength: i64, market: &str) -> Signal {
        Signal {
            id: Some(1),
            event_id: "evt1".into(),
            market: market.into(),
            signal_type: SignalType::Move,
            direction: SignalDirection::Down,
            from_value: Some(-3.0),
            to_value: Some(-4.0),
            from_price: None,
            to_price: None,
            window_minutes: 10,
            books_affected: 2,
            velocity_minutes: 9.0,
            time_bucket: TimeBucket::Mid,
            strength_score: strength,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn sample_subscriber(min_strength: i64, market_gates: &str) -> WebhookEndpoint {
        WebhookEndpoint {
            id: 1,
            url: "https://example.test/hook".into(),
            secret: "s3cret".into(),
            is_active: true,
            min_strength,
            market_gates: market_gates.into(),
            cooldown_seconds: 0,
            discord_webhook_url: None,
        }
    }

    #[test]
    fn gates_on_minimum_strength() {
        let sub = sample_subscriber(60, "");
        assert!(!signal_matches_subscriber(&sample_signal(40, "spreads"), &sub));
        assert!(signal_matches_subscriber(&sample_signal(80, "spreads"), &sub));
    }

    #[test]
    fn empty_market_gate_allows_all_markets() {
        let sub = sample_subscriber(1, "");
        assert!(signal_matches_subscriber(&sample_signal(50, "totals"), &sub));
    }

    #[test]
    fn market_gate_restricts_to_listed_markets() {
        let sub = sample_subscriber(1, "spreads,h2h");
        assert!(signal_matches_subscriber(&sample_signal(50, "spreads"), &sub));
        assert!(!signal_matches_subscriber(&sample_signal(50, "totals"), &sub));
    }

    #[test]
    fn subscriber_cooldown_blocks_repeat_alerts_within_window() {
        let kv = KvStore::new();
        let mut sub = sample_subscriber(1, "");
        sub.cooldown_seconds = 900;
        let signal = sample_signal(50, "spreads");
        assert!(subscriber_cooldown_allows(&kv, &signal, &sub));
        assert!(!subscriber_cooldown_allows(&kv, &signal, &sub));
    }

    #[test]
    fn zero_cooldown_never_blocks() {
        let kv = KvStore::new();
        let sub = sample_subscriber(1, "");
        let signal = sample_signal(50, "spreads");
        assert!(subscriber_cooldown_allows(&kv, &signal, &sub));
        assert!(subscriber_cooldown_allows(&kv, &signal, &sub));
    }

    #[test]
    fn signature_is_deterministic_hmac_sha256_hex() {
        let sig1 = sign_body("secret", "{\"a\":1}");
        let sig2 = sign_body("secret", "{\"a\":1}");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn body_preview_truncates_at_1000_chars() {
        let long = "x".repeat(2000);
        assert_eq!(body_preview(&long).len(), BODY_PREVIEW_MAX);
        assert_eq!(body_preview("short").len(), 5);
    }
}
