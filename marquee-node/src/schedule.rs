use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

use crate::model::{Device, Group, ScheduleRule, SchedulingMode};

/// The playlist ids a device must play right now, one per axis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EffectivePlaylists {
    pub visual: Option<String>,
    pub music: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDefect {
    NoDays,
    BadDay(i64),
    BadTime(String),
    EmptyWindow,
}

impl std::fmt::Display for RuleDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleDefect::NoDays => write!(f, "rule has no days"),
            RuleDefect::BadDay(day) => write!(f, "day {} is outside 1..=7", day),
            RuleDefect::BadTime(raw) => write!(f, "unparseable time '{}'", raw),
            RuleDefect::EmptyWindow => write!(f, "start time is not before end time"),
        }
    }
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

impl ScheduleRule {
    pub fn window(&self) -> Result<(NaiveTime, NaiveTime), RuleDefect> {
        if self.days.is_empty() {
            return Err(RuleDefect::NoDays);
        }
        if let Some(day) = self.days.iter().find(|d| !(1..=7).contains(*d)) {
            return Err(RuleDefect::BadDay(*day));
        }
        let start = parse_time_of_day(&self.start_time)
            .ok_or_else(|| RuleDefect::BadTime(self.start_time.clone()))?;
        let end = parse_time_of_day(&self.end_time)
            .ok_or_else(|| RuleDefect::BadTime(self.end_time.clone()))?;
        if start >= end {
            return Err(RuleDefect::EmptyWindow);
        }
        Ok((start, end))
    }

    /// Inclusive start, exclusive end, on any listed ISO weekday (1 = Monday).
    /// Defective rules never match.
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        let (start, end) = match self.window() {
            Ok(window) => window,
            Err(defect) => {
                tracing::warn!(
                    "Ignoring schedule rule {}-{} on {:?}: {}",
                    self.start_time,
                    self.end_time,
                    self.days,
                    defect
                );
                return false;
            }
        };

        let weekday = now.weekday().number_from_monday() as i64;
        let time = now.time();
        self.days.contains(&weekday) && time >= start && time < end
    }
}

/// First rule in stored order that covers `now`.
pub fn first_match(rules: &[ScheduleRule], now: NaiveDateTime) -> Option<&ScheduleRule> {
    rules.iter().find(|rule| rule.matches(now))
}

fn clean(id: &Option<String>) -> Option<String> {
    id.as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Turns the device snapshot (and its group, when the device is group
/// managed and the group is available) into the effective playlist ids.
pub fn resolve(device: &Device, group: Option<&Group>, now: NaiveDateTime) -> EffectivePlaylists {
    if device.managed_by_group {
        // Live group data wins; the device's mirrored fields are only a
        // fallback while the group record is unavailable.
        let (mode, rules, visual, music) = match group {
            Some(g) => (
                g.scheduling_mode,
                &g.schedule_rules,
                &g.playlist_id,
                &g.music_playlist_id,
            ),
            None => (
                device.scheduling_mode,
                &device.schedule_rules,
                &device.playlist_id,
                &device.music_playlist_id,
            ),
        };

        if mode == SchedulingMode::Advanced {
            if let Some(rule) = first_match(rules, now) {
                return EffectivePlaylists {
                    visual: clean(&rule.playlist_id),
                    music: clean(&rule.music_playlist_id),
                };
            }
        }

        return EffectivePlaylists {
            visual: clean(visual),
            music: clean(music),
        };
    }

    let mut visual = clean(&device.playlist_id);
    if device.visual_scheduling_mode == SchedulingMode::Advanced {
        if let Some(rule) = first_match(&device.visual_schedule_rules, now) {
            visual = clean(&rule.playlist_id);
        }
    }

    let mut music = clean(&device.music_playlist_id);
    if device.music_scheduling_mode == SchedulingMode::Advanced {
        if let Some(rule) = first_match(&device.music_schedule_rules, now) {
            music = clean(&rule.music_playlist_id);
        }
    }

    EffectivePlaylists { visual, music }
}

/// Reads the local wall clock the rules are written against.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub struct ScheduleResolver {
    clock: Clock,
}

impl ScheduleResolver {
    pub fn new(timezone: Option<&str>) -> Self {
        let timezone = timezone.and_then(|name| match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                tracing::warn!("Unknown timezone '{}', using the system clock", name);
                None
            }
        });
        let clock: Clock = match timezone {
            Some(tz) => Arc::new(move || Utc::now().with_timezone(&tz).naive_local()),
            None => Arc::new(|| Local::now().naive_local()),
        };
        Self { clock }
    }

    #[cfg(test)]
    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn resolve(&self, device: &Device, group: Option<&Group>) -> EffectivePlaylists {
        resolve(device, group, self.now())
    }
}
