use crate::break_scheduler::BreakRules;
use crate::error::{OnAirError, Result};
use crate::schedule::{BreakSchedule, BreakTiming};
use crate::stage::UnitTiming;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_BREAKS_PER_SHOW: usize = 4;
pub const MAX_SLOTS_PER_BREAK: usize = 3;

/// Everything tunable about one show. Missing JSON fields take the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowConfig {
    pub show_duration_secs: f64,
    pub breaks_per_show: usize,
    pub slots_per_break: usize,

    /// Seconds before a break at which the player may queue it.
    pub window_secs: f64,
    /// Seconds before a break at which a queued break asks units to wrap up.
    pub grace_secs: f64,
    /// Seconds before a break at which units are asked to wrap up regardless.
    pub imminent_secs: f64,

    pub break_jingle_secs: f64,
    pub ad_slot_secs: f64,
    pub return_jingle_secs: f64,

    /// Mood lost when a break starts without being queued.
    pub unqueued_mood_penalty: f64,
    /// Fraction of listeners lost for the duration of a break.
    pub listener_dip: f64,

    pub line_secs: f64,
    pub penalty_secs: f64,
    pub wait_for_break_secs: f64,
    /// Slack granted to every unit beyond its nominal duration.
    pub safety_margin_secs: f64,

    pub player_pool_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ad_audio_dir: Option<PathBuf>,
}

impl Default for ShowConfig {
    fn default() -> Self {
        ShowConfig {
            show_duration_secs: 600.0,
            breaks_per_show: 2,
            slots_per_break: 2,
            window_secs: 20.0,
            grace_secs: 10.0,
            imminent_secs: 5.0,
            break_jingle_secs: 5.0,
            ad_slot_secs: 18.0,
            return_jingle_secs: 3.0,
            unqueued_mood_penalty: 15.0,
            listener_dip: 0.05,
            line_secs: 4.0,
            penalty_secs: 20.0,
            wait_for_break_secs: 20.0,
            safety_margin_secs: 10.0,
            player_pool_size: 4,
            ad_audio_dir: None,
        }
    }
}

impl ShowConfig {
    /// Read a config file. Fails on unreadable or malformed JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: ShowConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file, or fall back to defaults with a warning.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return ShowConfig::default();
        }
        match ShowConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("unusable config '{}', using defaults: {}", path.display(), e);
                ShowConfig::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("show_duration_secs", self.show_duration_secs),
            ("window_secs", self.window_secs),
            ("grace_secs", self.grace_secs),
            ("imminent_secs", self.imminent_secs),
            ("break_jingle_secs", self.break_jingle_secs),
            ("ad_slot_secs", self.ad_slot_secs),
            ("return_jingle_secs", self.return_jingle_secs),
            ("unqueued_mood_penalty", self.unqueued_mood_penalty),
            ("line_secs", self.line_secs),
            ("penalty_secs", self.penalty_secs),
            ("wait_for_break_secs", self.wait_for_break_secs),
            ("safety_margin_secs", self.safety_margin_secs),
        ] {
            if !value.is_finite() {
                return Err(OnAirError::Config(format!("{} must be a finite number (got {})", name, value)));
            }
        }
        if self.show_duration_secs <= 0.0 {
            return Err(OnAirError::Config("show duration must be positive".into()));
        }
        if self.breaks_per_show > MAX_BREAKS_PER_SHOW {
            return Err(OnAirError::Config(format!(
                "at most {} breaks per show (got {})",
                MAX_BREAKS_PER_SHOW, self.breaks_per_show
            )));
        }
        if self.slots_per_break == 0 || self.slots_per_break > MAX_SLOTS_PER_BREAK {
            return Err(OnAirError::Config(format!(
                "slots per break must be 1..={} (got {})",
                MAX_SLOTS_PER_BREAK, self.slots_per_break
            )));
        }
        if !(0.0..1.0).contains(&self.listener_dip) {
            return Err(OnAirError::Config(format!(
                "listener dip must be in [0, 1) (got {})",
                self.listener_dip
            )));
        }
        if self.player_pool_size == 0 {
            return Err(OnAirError::Config("player pool needs at least one handle".into()));
        }
        for (name, secs) in [
            ("line_secs", self.line_secs),
            ("penalty_secs", self.penalty_secs),
            ("wait_for_break_secs", self.wait_for_break_secs),
            ("ad_slot_secs", self.ad_slot_secs),
        ] {
            if secs <= 0.0 {
                return Err(OnAirError::Config(format!("{} must be positive", name)));
            }
        }
        self.break_timing()?;
        Ok(())
    }

    pub fn show_duration(&self) -> Duration {
        secs(self.show_duration_secs)
    }

    pub fn break_timing(&self) -> Result<BreakTiming> {
        BreakTiming::new(
            secs(self.window_secs),
            secs(self.grace_secs),
            secs(self.imminent_secs),
        )
        .map(|t| {
            t.with_segments(
                secs(self.break_jingle_secs),
                secs(self.ad_slot_secs),
                secs(self.return_jingle_secs),
            )
        })
    }

    pub fn break_rules(&self) -> BreakRules {
        BreakRules {
            unqueued_penalty: self.unqueued_mood_penalty,
            listener_dip: self.listener_dip,
        }
    }

    pub fn unit_timing(&self) -> UnitTiming {
        UnitTiming {
            line: secs(self.line_secs),
            penalty: secs(self.penalty_secs),
            wait_for_break: secs(self.wait_for_break_secs),
            safety_margin: secs(self.safety_margin_secs),
        }
    }

    /// Generate this show's break schedule.
    pub fn schedule(&self) -> Result<BreakSchedule> {
        BreakSchedule::generate(self.show_duration(), self.breaks_per_show, self.slots_per_break)
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
