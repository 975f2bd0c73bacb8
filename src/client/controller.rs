//! Client sync controller.
//!
//! Explicit state machine driving the push/poll hybrid: handshake for a
//! stream token, consume the SSE push stream, and on transient failure back
//! off with jitter while polling the plain state endpoint so the UI degrades
//! instead of freezing. An unauthorized response at any layer is terminal —
//! retrying a structurally invalid credential can never succeed.

use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::IssuedToken;
use crate::client::sse::SseParser;
use crate::config::ClientConfig;
use crate::hub::STATE_EVENT;
use crate::snapshot::LiveState;

/// Connection phase. `Unauthorized` and `Closed` are terminal; everything
/// else cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    Connecting,
    Open,
    Backoff { attempt: u32 },
    Unauthorized,
    Closed,
}

/// What the controller hands to its consumer.
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    Snapshot(LiveState),
    Raw { event: String, data: String },
    Phase(SyncPhase),
}

/// Exponential backoff with jitter. Delays stay within
/// `[raw / 2, raw]` where `raw = min(cap, base * factor^attempt)`.
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            attempt: 0,
        }
    }

    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self::new(cfg.backoff_base(), cfg.backoff_factor, cfg.backoff_cap())
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.base.as_millis() as f64 * self.factor.powi(self.attempt as i32);
        let capped = raw.min(self.cap.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_millis((capped * jitter) as u64)
    }
}

/// Outcome classification for one connection attempt.
enum AttemptError {
    /// Proven-bad credential; never retried.
    Unauthorized,
    /// Anything recoverable: network failures, 5xx, stream EOF.
    Transient(String),
}

pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Tear the controller down, cancelling every pending timer.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

pub struct SyncController {
    cfg: ClientConfig,
    http: reqwest::Client,
    identity: Option<String>,
}

impl SyncController {
    pub fn new(cfg: ClientConfig, identity: Option<String>) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
            identity,
        }
    }

    /// Start the controller on its own task, returning the teardown handle
    /// and the update stream.
    pub fn spawn(self) -> (SyncHandle, mpsc::Receiver<SyncUpdate>) {
        let (tx, updates) = mpsc::channel(64);
        let (shutdown, stop) = watch::channel(false);
        let task = tokio::spawn(self.run(tx, stop));
        (SyncHandle { shutdown, task }, updates)
    }

    async fn run(self, tx: mpsc::Sender<SyncUpdate>, mut stop: watch::Receiver<bool>) {
        // No identity material: nothing to authenticate with, stay closed.
        let Some(identity) = self.identity.clone() else {
            let _ = tx.send(SyncUpdate::Phase(SyncPhase::Closed)).await;
            return;
        };

        let mut backoff = Backoff::from_config(&self.cfg);
        let mut token: Option<IssuedToken> = None;

        loop {
            if *stop.borrow() {
                let _ = tx.send(SyncUpdate::Phase(SyncPhase::Closed)).await;
                return;
            }
            let _ = tx.send(SyncUpdate::Phase(SyncPhase::Connecting)).await;

            if token_needs_refresh(token.as_ref(), self.cfg.token_refresh_lead_secs) {
                match self.fetch_token(&identity).await {
                    Ok(t) => {
                        debug!(expires_at = %t.expires_at, "stream token obtained");
                        token = Some(t);
                    }
                    Err(AttemptError::Unauthorized) => {
                        warn!("handshake rejected; credential is invalid, not retrying");
                        let _ = tx.send(SyncUpdate::Phase(SyncPhase::Unauthorized)).await;
                        return;
                    }
                    Err(AttemptError::Transient(reason)) => {
                        debug!(%reason, "handshake failed, backing off");
                        if self
                            .backoff_with_polling(&mut backoff, &tx, &mut stop)
                            .await
                            .is_err()
                        {
                            return;
                        }
                        continue;
                    }
                }
            }

            let Some(current) = token.clone() else {
                continue;
            };
            match self
                .consume_stream(&identity, &current, &mut token, &mut backoff, &tx, &mut stop)
                .await
            {
                Ok(()) => {
                    // Shutdown requested mid-stream.
                    let _ = tx.send(SyncUpdate::Phase(SyncPhase::Closed)).await;
                    return;
                }
                Err(AttemptError::Unauthorized) => {
                    let _ = tx.send(SyncUpdate::Phase(SyncPhase::Unauthorized)).await;
                    return;
                }
                Err(AttemptError::Transient(reason)) => {
                    debug!(%reason, "push stream lost, backing off");
                    if self
                        .backoff_with_polling(&mut backoff, &tx, &mut stop)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    async fn fetch_token(&self, identity: &str) -> Result<IssuedToken, AttemptError> {
        let resp = self
            .http
            .post(format!("{}/stream-auth", self.cfg.server_url))
            .header("x-pulse-identity", identity)
            .send()
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(AttemptError::Unauthorized),
            status if status.is_success() => resp
                .json::<IssuedToken>()
                .await
                .map_err(|e| AttemptError::Transient(e.to_string())),
            status => Err(AttemptError::Transient(format!(
                "handshake returned {}",
                status
            ))),
        }
    }

    /// Consume the push stream until it drops. `Ok(())` means shutdown was
    /// requested; errors classify the failure for the outer loop.
    async fn consume_stream(
        &self,
        identity: &str,
        current: &IssuedToken,
        token: &mut Option<IssuedToken>,
        backoff: &mut Backoff,
        tx: &mpsc::Sender<SyncUpdate>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), AttemptError> {
        let resp = self
            .http
            .get(format!("{}/events", self.cfg.server_url))
            .query(&[("token", current.token.as_str())])
            .send()
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => return Err(AttemptError::Unauthorized),
            status if !status.is_success() => {
                return Err(AttemptError::Transient(format!(
                    "stream returned {}",
                    status
                )));
            }
            _ => {}
        }

        info!("push stream open");
        let _ = tx.send(SyncUpdate::Phase(SyncPhase::Open)).await;
        // A stream that actually opened clears the failure streak; the next
        // drop backs off from the base delay again.
        backoff.reset();

        let mut body = resp.bytes_stream();
        let mut parser = SseParser::new();
        let refresh_at = refresh_instant(current, self.cfg.token_refresh_lead_secs);
        let mut refresh = Box::pin(tokio::time::sleep_until(refresh_at));

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
                // Refresh ahead of expiry so a reconnect never races an
                // expiring token mid-handshake.
                _ = &mut refresh => {
                    match self.fetch_token(identity).await {
                        Ok(t) => {
                            debug!(expires_at = %t.expires_at, "stream token refreshed");
                            refresh = Box::pin(tokio::time::sleep_until(
                                refresh_instant(&t, self.cfg.token_refresh_lead_secs),
                            ));
                            *token = Some(t);
                        }
                        Err(AttemptError::Unauthorized) => return Err(AttemptError::Unauthorized),
                        Err(AttemptError::Transient(reason)) => {
                            // The open stream keeps running; the next
                            // reconnect will retry the handshake.
                            warn!(%reason, "token refresh failed");
                            *token = None;
                            refresh = Box::pin(tokio::time::sleep_until(
                                Instant::now() + Duration::from_secs(30),
                            ));
                        }
                    }
                }
                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for frame in parser.push(&bytes) {
                                let update = if frame.event == STATE_EVENT {
                                    match serde_json::from_str::<LiveState>(&frame.data) {
                                        Ok(live) => SyncUpdate::Snapshot(live),
                                        Err(e) => {
                                            warn!("bad snapshot frame: {}", e);
                                            continue;
                                        }
                                    }
                                } else {
                                    SyncUpdate::Raw {
                                        event: frame.event,
                                        data: frame.data,
                                    }
                                };
                                if tx.send(update).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Err(e)) => {
                            return Err(AttemptError::Transient(e.to_string()));
                        }
                        None => {
                            return Err(AttemptError::Transient("stream ended".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Wait out one backoff delay while polling `/state` so the UI keeps
    /// degrading gracefully instead of freezing. `Err(())` means shutdown.
    async fn backoff_with_polling(
        &self,
        backoff: &mut Backoff,
        tx: &mpsc::Sender<SyncUpdate>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), ()> {
        let delay = backoff.next_delay();
        let _ = tx
            .send(SyncUpdate::Phase(SyncPhase::Backoff {
                attempt: backoff.attempt(),
            }))
            .await;

        // The poll cadence stretches with the backoff attempt, bounded by
        // the backoff cap.
        let poll_every = Duration::from_millis(self.cfg.poll_base_ms)
            .saturating_mul(backoff.attempt().max(1))
            .min(self.cfg.backoff_cap());

        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let step = (deadline - now).min(poll_every);
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        let _ = tx.send(SyncUpdate::Phase(SyncPhase::Closed)).await;
                        return Err(());
                    }
                }
                _ = sleep(step) => {
                    if let Some(live) = self.poll_state().await {
                        if tx.send(SyncUpdate::Snapshot(live)).await.is_err() {
                            return Err(());
                        }
                    }
                }
            }
        }
    }

    async fn poll_state(&self) -> Option<LiveState> {
        let resp = self
            .http
            .get(format!("{}/state", self.cfg.server_url))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<LiveState>().await.ok()
    }
}

fn token_needs_refresh(token: Option<&IssuedToken>, lead_secs: u64) -> bool {
    match token {
        None => true,
        Some(t) => {
            let lead = chrono::Duration::seconds(lead_secs as i64);
            Utc::now() + lead >= t.expires_at
        }
    }
}

fn refresh_instant(token: &IssuedToken, lead_secs: u64) -> Instant {
    let lead = chrono::Duration::seconds(lead_secs as i64);
    let until = (token.expires_at - lead) - Utc::now();
    let until = until.to_std().unwrap_or(Duration::ZERO);
    Instant::now() + until
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(600), 1.7, Duration::from_secs(15));

        let mut previous_raw = 0.0;
        for attempt in 0..20 {
            let delay = backoff.next_delay();
            let raw = (600.0 * 1.7f64.powi(attempt)).min(15_000.0);
            assert!(delay.as_millis() as f64 <= raw + 1.0, "attempt {attempt}");
            assert!(
                delay.as_millis() as f64 >= raw * 0.5 - 1.0,
                "attempt {attempt}"
            );
            assert!(raw >= previous_raw);
            previous_raw = raw;
        }
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(600), 1.7, Duration::from_secs(15));
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(600));
    }

    #[test]
    fn missing_token_needs_refresh() {
        assert!(token_needs_refresh(None, 60));
    }

    #[test]
    fn token_near_expiry_needs_refresh() {
        let soon = IssuedToken {
            token: "t".to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(30),
        };
        assert!(token_needs_refresh(Some(&soon), 60));

        let fresh = IssuedToken {
            token: "t".to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(600),
        };
        assert!(!token_needs_refresh(Some(&fresh), 60));
    }
}
