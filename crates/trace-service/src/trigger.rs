//! Trigger state machine: `START_TRACING`, `STOP_TRACING`, and
//! `CLONE_SNAPSHOT` trigger modes. `HIGH_PRIORITY` is accepted as a config
//! value but has no special handling — treated as a forward-compatible
//! value, since it's documented as optional.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{TriggerConfig, TriggerMode};

/// Per-rule 24h admission quota, keyed by rule name.
#[derive(Default)]
pub struct TriggerQuota {
    admitted_at: HashMap<String, Vec<Instant>>,
}

impl TriggerQuota {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `name` if fewer than `max_per_24_h` admissions are recorded
    /// in the trailing 24h window; records the admission if so.
    pub fn try_admit(&mut self, name: &str, max_per_24_h: u32, now: Instant) -> bool {
        let window = Duration::from_secs(24 * 60 * 60);
        let entries = self.admitted_at.entry(name.to_string()).or_default();
        entries.retain(|&t| now.duration_since(t) < window);
        if entries.len() as u32 >= max_per_24_h {
            return false;
        }
        entries.push(now);
        true
    }
}

/// What the engine should do in response to an admitted trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerAction {
    StartTracing { stop_delay_ms: u32 },
    ScheduleFlushAndDisable { stop_delay_ms: u32 },
    CloneSnapshot,
}

/// Evaluates `ActivateTriggers(names)` for one session's trigger config.
/// `skip_probability` is consulted via `skip_roll` (caller supplies a
/// uniform `[0,1)` draw so this stays deterministic under test).
/// `producer_name` is the calling producer's registered name; a rule
/// carrying `producer_name_regex` only admits callers matching it.
pub fn evaluate_trigger(
    config: &TriggerConfig,
    quota: &mut TriggerQuota,
    name: &str,
    producer_name: &str,
    skip_roll: f64,
    now: Instant,
) -> Option<TriggerAction> {
    let rule = config.triggers.iter().find(|r| r.name == name)?;
    if let Some(pattern) = &rule.producer_name_regex {
        let re = regex::Regex::new(pattern).ok()?;
        if !re.is_match(producer_name) {
            return None;
        }
    }
    if skip_roll < rule.skip_probability {
        return None;
    }
    if !quota.try_admit(&rule.name, rule.max_per_24_h, now) {
        return None;
    }
    match config.trigger_mode? {
        TriggerMode::StartTracing => Some(TriggerAction::StartTracing { stop_delay_ms: rule.stop_delay_ms }),
        TriggerMode::StopTracing => Some(TriggerAction::ScheduleFlushAndDisable { stop_delay_ms: rule.stop_delay_ms }),
        TriggerMode::CloneSnapshot => Some(TriggerAction::CloneSnapshot),
        TriggerMode::HighPriority => None,
    }
}
