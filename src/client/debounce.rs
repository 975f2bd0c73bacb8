//! Activity display debouncer.
//!
//! Hysteresis between raw activity signals and what the dashboard renders.
//! Transitions away from idle need a short stability window; reversion into
//! idle needs a longer one, because idle is the noisy resting state and
//! over-eager reversion flickers worse than a briefly stale badge. A shown
//! non-idle value is additionally held for a minimum display duration.
//! Driven entirely by an injected clock, so tests never sleep.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::snapshot::LiveState;
use crate::store::Activity;

#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Stability required before a non-idle value is shown
    pub show_delay: Duration,
    /// Stability required before reverting to idle
    pub idle_delay: Duration,
    /// Minimum time a shown non-idle value stays on screen
    pub min_display: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            show_delay: Duration::milliseconds(240),
            idle_delay: Duration::milliseconds(900),
            min_display: Duration::milliseconds(1100),
        }
    }
}

impl DebounceConfig {
    pub fn from_client_config(cfg: &crate::config::ClientConfig) -> Self {
        Self {
            show_delay: Duration::milliseconds(cfg.show_delay_ms as i64),
            idle_delay: Duration::milliseconds(cfg.idle_delay_ms as i64),
            min_display: Duration::milliseconds(cfg.min_display_ms as i64),
        }
    }
}

/// Latency beats flicker for these; they bypass all debouncing.
fn is_urgent(activity: Activity) -> bool {
    matches!(activity, Activity::Error | Activity::Messaging)
}

#[derive(Debug)]
struct Entry {
    shown: Activity,
    shown_at: DateTime<Utc>,
    /// Non-idle candidate awaiting its stability window
    pending: Option<(Activity, DateTime<Utc>)>,
    /// When the raw signal went idle, if a reversion is brewing
    idle_since: Option<DateTime<Utc>>,
}

pub struct ActivityDebouncer {
    cfg: DebounceConfig,
    entries: HashMap<String, Entry>,
}

impl ActivityDebouncer {
    pub fn new(cfg: DebounceConfig) -> Self {
        Self {
            cfg,
            entries: HashMap::new(),
        }
    }

    /// Feed one raw signal for an agent.
    pub fn observe(&mut self, agent_id: &str, raw: Activity, now: DateTime<Utc>) {
        let entry = self.entries.entry(agent_id.to_string()).or_insert(Entry {
            shown: Activity::Idle,
            shown_at: now,
            pending: None,
            idle_since: None,
        });

        if is_urgent(raw) {
            entry.shown = raw;
            entry.shown_at = now;
            entry.pending = None;
            entry.idle_since = None;
            return;
        }

        if raw.is_idle() {
            if entry.shown.is_idle() && entry.pending.is_none() {
                entry.idle_since = None;
            } else {
                // Something non-idle is on display or about to be; start the
                // reversion clock. A pending candidate survives the idle
                // blip — the reversion runs on its own longer window.
                entry.idle_since.get_or_insert(now);
            }
            return;
        }

        // Non-idle signal: the agent is demonstrably active, cancel any
        // brewing idle reversion.
        entry.idle_since = None;
        if raw == entry.shown {
            entry.pending = None;
            return;
        }
        match entry.pending {
            Some((candidate, _)) if candidate == raw => {}
            _ => entry.pending = Some((raw, now)),
        }
    }

    /// Promote any candidate whose stability window has elapsed. Call on a
    /// render tick.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        for entry in self.entries.values_mut() {
            let held = !entry.shown.is_idle() && now - entry.shown_at < self.cfg.min_display;

            if let Some((candidate, since)) = entry.pending {
                if now - since >= self.cfg.show_delay && !held {
                    entry.shown = candidate;
                    entry.shown_at = now;
                    entry.pending = None;
                    continue;
                }
            }

            if let Some(since) = entry.idle_since {
                if !entry.shown.is_idle() && now - since >= self.cfg.idle_delay && !held {
                    entry.shown = Activity::Idle;
                    entry.shown_at = now;
                    entry.idle_since = None;
                }
            }
        }
    }

    /// Currently displayed value for an agent.
    pub fn shown(&self, agent_id: &str) -> Activity {
        self.entries
            .get(agent_id)
            .map(|e| e.shown)
            .unwrap_or(Activity::Idle)
    }

    /// Apply one snapshot: observe every agent's projected activity and
    /// drop state for agents no longer in the roster, so their pending
    /// transitions cannot fire later.
    pub fn apply_snapshot(&mut self, live: &LiveState, now: DateTime<Utc>) {
        for agent in &live.agents {
            self.observe(&agent.id, agent.activity, now);
        }
        self.retain_roster(live.agents.iter().map(|a| a.id.as_str()), now);
    }

    /// Drop agents absent from the roster.
    pub fn retain_roster<'a>(
        &mut self,
        roster: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) {
        let keep: std::collections::HashSet<&str> = roster.into_iter().collect();
        self.entries.retain(|id, _| keep.contains(id.as_str()));
        self.tick(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + Duration::milliseconds(ms)
    }

    fn debouncer() -> ActivityDebouncer {
        ActivityDebouncer::new(DebounceConfig::default())
    }

    #[test]
    fn non_idle_needs_its_stability_window() {
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Thinking, t0);
        d.tick(at(t0, 100));
        assert_eq!(d.shown("ATLAS"), Activity::Idle);

        d.tick(at(t0, 240));
        assert_eq!(d.shown("ATLAS"), Activity::Thinking);
    }

    #[test]
    fn idle_blip_does_not_cancel_pending_transition() {
        // thinking at t=0, idle at t=0.1: thinking must still be on display
        // at t=1.0, and idle may only take over once both its own window and
        // the minimum display hold have elapsed.
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Thinking, t0);
        d.observe("ATLAS", Activity::Idle, at(t0, 100));

        d.tick(at(t0, 240));
        assert_eq!(d.shown("ATLAS"), Activity::Thinking);

        // Idle became pending at t=100 and is stable by t=1000, but the
        // value shown at t=240 is held for 1100ms.
        d.tick(at(t0, 1000));
        assert_eq!(d.shown("ATLAS"), Activity::Thinking);

        d.tick(at(t0, 1340));
        assert_eq!(d.shown("ATLAS"), Activity::Idle);
    }

    #[test]
    fn idle_reversion_survives_a_pending_candidate() {
        // No tick until late, so the candidate and the reversion both
        // resolve from the same render passes.
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Thinking, t0);
        d.observe("ATLAS", Activity::Idle, at(t0, 100));

        d.tick(at(t0, 2000));
        assert_eq!(d.shown("ATLAS"), Activity::Thinking);

        d.tick(at(t0, 3200));
        assert_eq!(d.shown("ATLAS"), Activity::Idle);
    }

    #[test]
    fn idle_reversion_needs_the_longer_window() {
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Search, t0);
        d.tick(at(t0, 300));
        assert_eq!(d.shown("ATLAS"), Activity::Search);

        d.observe("ATLAS", Activity::Idle, at(t0, 2000));
        d.tick(at(t0, 2500));
        assert_eq!(d.shown("ATLAS"), Activity::Search);

        d.tick(at(t0, 2900));
        assert_eq!(d.shown("ATLAS"), Activity::Idle);
    }

    #[test]
    fn renewed_activity_cancels_idle_reversion() {
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Search, t0);
        d.tick(at(t0, 300));
        d.observe("ATLAS", Activity::Idle, at(t0, 2000));
        d.observe("ATLAS", Activity::Search, at(t0, 2400));

        d.tick(at(t0, 4000));
        assert_eq!(d.shown("ATLAS"), Activity::Search);
    }

    #[test]
    fn urgent_activities_bypass_everything() {
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Error, t0);
        assert_eq!(d.shown("ATLAS"), Activity::Error);

        d.observe("NOVA", Activity::Messaging, t0);
        assert_eq!(d.shown("NOVA"), Activity::Messaging);
    }

    #[test]
    fn min_display_holds_against_a_qualifying_successor() {
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Thinking, t0);
        d.tick(at(t0, 240));
        assert_eq!(d.shown("ATLAS"), Activity::Thinking);

        d.observe("ATLAS", Activity::Search, at(t0, 300));
        // Stable by t=540, but thinking is held until t=1340.
        d.tick(at(t0, 600));
        assert_eq!(d.shown("ATLAS"), Activity::Thinking);

        d.tick(at(t0, 1340));
        assert_eq!(d.shown("ATLAS"), Activity::Search);
    }

    #[test]
    fn removed_agents_lose_their_pending_state() {
        let mut d = debouncer();
        let t0 = Utc::now();

        d.observe("ATLAS", Activity::Thinking, t0);
        d.observe("NOVA", Activity::Search, t0);
        d.retain_roster(["NOVA"], at(t0, 100));

        d.tick(at(t0, 1000));
        assert_eq!(d.shown("ATLAS"), Activity::Idle);
        assert_eq!(d.shown("NOVA"), Activity::Search);
    }
}
