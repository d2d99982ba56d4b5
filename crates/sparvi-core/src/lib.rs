//! Core domain model for Sparvi automation schedules and next-run projections.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "sparvi-core";

pub const VALIDATION_AUTOMATION: &str = "validation_automation";
pub const PROFILE_AUTOMATION: &str = "profile_automation";
pub const SCHEMA_CHANGE_AUTOMATION: &str = "schema_change_automation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Daily,
    Weekly,
}

impl FromStr for ScheduleType {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(ScheduleError::UnknownScheduleType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("unknown schedule type `{0}`")]
    UnknownScheduleType(String),
    #[error("invalid scheduled time `{0}`, expected HH:MM")]
    InvalidTime(String),
    #[error("invalid timezone `{0}`")]
    InvalidTimezone(String),
    #[error("invalid weekday `{0}`")]
    InvalidDay(String),
    #[error("weekly schedule requires at least one day")]
    MissingDays,
    #[error("daily schedule must not list days")]
    UnexpectedDays,
    #[error("invalid schedule expression `{expr}`: {reason}")]
    Expression { expr: String, reason: String },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// One automation type's schedule configuration for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub automation_type: String,
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    pub scheduled_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<String>>,
}

impl ScheduleEntry {
    pub fn daily(automation_type: impl Into<String>, scheduled_time: impl Into<String>) -> Self {
        Self {
            automation_type: automation_type.into(),
            enabled: true,
            schedule_type: ScheduleType::Daily,
            scheduled_time: scheduled_time.into(),
            timezone: default_timezone(),
            days: None,
        }
    }

    pub fn weekly<I, S>(
        automation_type: impl Into<String>,
        scheduled_time: impl Into<String>,
        days: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            automation_type: automation_type.into(),
            enabled: true,
            schedule_type: ScheduleType::Weekly,
            scheduled_time: scheduled_time.into(),
            timezone: default_timezone(),
            days: Some(days.into_iter().map(Into::into).collect()),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn time_of_day(&self) -> Result<NaiveTime, ScheduleError> {
        NaiveTime::parse_from_str(self.scheduled_time.trim(), "%H:%M")
            .map_err(|_| ScheduleError::InvalidTime(self.scheduled_time.clone()))
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz, ScheduleError> {
        self.timezone
            .trim()
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(self.timezone.clone()))
    }

    /// Weekdays in Monday-first order with duplicates removed.
    pub fn weekdays(&self) -> Result<Vec<Weekday>, ScheduleError> {
        let mut out: Vec<Weekday> = Vec::new();
        for day in self.days.iter().flatten() {
            let weekday: Weekday = day
                .trim()
                .parse()
                .map_err(|_| ScheduleError::InvalidDay(day.clone()))?;
            if !out.contains(&weekday) {
                out.push(weekday);
            }
        }
        out.sort_by_key(|d| d.num_days_from_monday());
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.time_of_day()?;
        self.tz()?;
        let days = self.weekdays()?;
        match self.schedule_type {
            ScheduleType::Weekly if days.is_empty() => Err(ScheduleError::MissingDays),
            ScheduleType::Daily if self.days.as_ref().is_some_and(|d| !d.is_empty()) => {
                Err(ScheduleError::UnexpectedDays)
            }
            _ => Ok(()),
        }
    }

    /// Six-field (second-granularity) cron expression equivalent to this entry.
    pub fn cron_expression(&self) -> Result<String, ScheduleError> {
        self.validate()?;
        let time = self.time_of_day()?;
        let dow = match self.schedule_type {
            ScheduleType::Daily => "*".to_string(),
            ScheduleType::Weekly => self
                .weekdays()?
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(","),
        };
        Ok(format!(
            "0 {} {} * * {}",
            chrono::Timelike::minute(&time),
            chrono::Timelike::hour(&time),
            dow
        ))
    }
}

/// Next instant after `from` at which `entry` fires. Disabled entries never fire.
pub fn project_next_run(
    entry: &ScheduleEntry,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    Ok(project_runs(entry, from, 1)?.into_iter().next())
}

pub fn project_runs(
    entry: &ScheduleEntry,
    from: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
    let expr = entry.cron_expression()?;
    if !entry.enabled || count == 0 {
        return Ok(Vec::new());
    }
    let tz = entry.tz()?;
    let schedule = cron::Schedule::from_str(&expr).map_err(|e| ScheduleError::Expression {
        expr: expr.clone(),
        reason: e.to_string(),
    })?;
    let from_local = from.with_timezone(&tz);
    Ok(schedule
        .after(&from_local)
        .take(count)
        .map(|t| t.with_timezone(&Utc))
        .collect())
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

/// Server-computed run-time projection for one (connection, automation type) pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NextRunInfo {
    #[serde(deserialize_with = "null_as_false")]
    pub enabled: bool,
    pub next_run_timestamp: Option<f64>,
    pub next_run_iso: Option<String>,
    #[serde(deserialize_with = "null_as_false")]
    pub currently_running: bool,
    #[serde(deserialize_with = "null_as_false")]
    pub is_overdue: bool,
    pub last_run: Option<String>,
    pub last_run_status: Option<String>,
    pub avg_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Disabled,
    Overdue,
    Scheduled,
    Unscheduled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Disabled => "disabled",
            Self::Overdue => "overdue",
            Self::Scheduled => "scheduled",
            Self::Unscheduled => "unscheduled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NextRunInfo {
    /// Overdue only counts while the run is not already in progress.
    pub fn is_actionable_overdue(&self) -> bool {
        self.is_overdue && !self.currently_running
    }

    pub fn status(&self) -> RunStatus {
        if self.currently_running {
            RunStatus::Running
        } else if !self.enabled {
            RunStatus::Disabled
        } else if self.is_overdue {
            RunStatus::Overdue
        } else if self.next_run_timestamp.is_some() {
            RunStatus::Scheduled
        } else {
            RunStatus::Unscheduled
        }
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        let ts = self.next_run_timestamp?;
        if !ts.is_finite() {
            return None;
        }
        let secs = ts.floor();
        let nanos = ((ts - secs) * 1e9) as u32;
        Utc.timestamp_opt(secs as i64, nanos).single()
    }

    /// Signed seconds until the projected run; negative once it has passed.
    pub fn seconds_until(&self, now: DateTime<Utc>) -> Option<i64> {
        self.next_run_at().map(|at| (at - now).num_seconds())
    }
}

/// A `NextRunInfo` annotated with where it was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingRun {
    pub automation_type: String,
    pub connection_id: Option<String>,
    #[serde(flatten)]
    pub info: NextRunInfo,
}

pub type RunsByType = BTreeMap<String, NextRunInfo>;

/// Normalized next-run data for one connection or for all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "runs", rename_all = "snake_case")]
pub enum NextRuns {
    Single(RunsByType),
    ByConnection(BTreeMap<String, RunsByType>),
}

impl Default for NextRuns {
    fn default() -> Self {
        Self::Single(BTreeMap::new())
    }
}

impl NextRuns {
    pub fn empty(multi_connection: bool) -> Self {
        if multi_connection {
            Self::ByConnection(BTreeMap::new())
        } else {
            Self::Single(BTreeMap::new())
        }
    }

    pub fn is_multi_connection(&self) -> bool {
        matches!(self, Self::ByConnection(_))
    }

    /// Flattened view in (connection, automation type) order.
    pub fn entries(&self) -> Box<dyn Iterator<Item = (Option<&str>, &str, &NextRunInfo)> + '_> {
        match self {
            Self::Single(runs) => Box::new(runs.iter().map(|(t, info)| (None, t.as_str(), info))),
            Self::ByConnection(conns) => Box::new(conns.iter().flat_map(|(conn, runs)| {
                runs.iter()
                    .map(move |(t, info)| (Some(conn.as_str()), t.as_str(), info))
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// In single-connection mode `connection_id` is ignored. In multi-connection
    /// mode a missing `connection_id` yields `None`.
    pub fn get(&self, automation_type: &str, connection_id: Option<&str>) -> Option<&NextRunInfo> {
        match self {
            Self::Single(runs) => runs.get(automation_type),
            Self::ByConnection(conns) => conns.get(connection_id?)?.get(automation_type),
        }
    }

    pub fn overdue_count(&self) -> usize {
        self.entries()
            .filter(|(_, _, info)| info.is_actionable_overdue())
            .count()
    }

    pub fn has_overdue(&self) -> bool {
        self.entries().any(|(_, _, info)| info.is_actionable_overdue())
    }

    pub fn running_count(&self) -> usize {
        self.entries()
            .filter(|(_, _, info)| info.currently_running)
            .count()
    }

    /// Earliest non-overdue scheduled run. Equal timestamps resolve to the
    /// lexicographically first (connection, automation type).
    pub fn next_upcoming(&self) -> Option<UpcomingRun> {
        let mut best: Option<(f64, Option<&str>, &str, &NextRunInfo)> = None;
        for (conn, automation_type, info) in self.entries() {
            if info.is_overdue {
                continue;
            }
            let Some(ts) = info.next_run_timestamp.filter(|t| t.is_finite()) else {
                continue;
            };
            if best.as_ref().map_or(true, |(best_ts, ..)| ts < *best_ts) {
                best = Some((ts, conn, automation_type, info));
            }
        }
        best.map(|(_, conn, automation_type, info)| UpcomingRun {
            automation_type: automation_type.to_string(),
            connection_id: conn.map(str::to_string),
            info: info.clone(),
        })
    }
}
