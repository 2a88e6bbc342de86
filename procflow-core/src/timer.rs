//! Timer definitions: ISO-8601 durations, absolute dates and (unsupported) cycles.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use nom::{
    character::complete::{char, digit1, one_of},
    combinator::{map_res, opt, recognize},
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 3_600.0;
const SECS_PER_DAY: f64 = 86_400.0;
const SECS_PER_WEEK: f64 = 604_800.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TimerSpec {
    /// Relative to the moment the timer is scheduled.
    Duration(Duration),
    /// Absolute instant.
    Date(DateTime<Utc>),
    /// Repeating `R<n>/<duration>` spec. Kept as text; scheduling it fails.
    Cycle(String),
}

impl TimerSpec {
    pub fn duration(text: &str) -> EngineResult<Self> {
        parse_iso_duration(text).map(TimerSpec::Duration)
    }

    pub fn date(text: &str) -> EngineResult<Self> {
        parse_date(text).map(TimerSpec::Date)
    }

    pub fn cycle(text: &str) -> EngineResult<Self> {
        let trimmed = text.trim();
        if !trimmed.starts_with(['R', 'r']) {
            return Err(EngineError::malformed(text, "cycle must start with 'R'"));
        }
        Ok(TimerSpec::Cycle(trimmed.to_string()))
    }

    /// Parse the `Duration=PT1H`, `Date=2024-01-01T00:00:00` or `Cycle=R3/PT10H` form.
    pub fn parse_tagged(text: &str) -> EngineResult<Self> {
        let (key, value) = text.split_once('=').ok_or_else(|| {
            EngineError::malformed(text, "expected '<Duration|Date|Cycle>=<value>'")
        })?;
        match key.trim().to_ascii_lowercase().as_str() {
            "duration" => Self::duration(value),
            "date" => Self::date(value),
            "cycle" => Self::cycle(value),
            other => Err(EngineError::malformed(
                text,
                format!("unknown timer kind '{other}'"),
            )),
        }
    }

    /// Time left until the timer is due. Dates in the past are due immediately.
    pub fn delay_from(&self, now: DateTime<Utc>) -> EngineResult<Duration> {
        match self {
            TimerSpec::Duration(d) => Ok(*d),
            TimerSpec::Date(at) => Ok((*at - now).to_std().unwrap_or(Duration::ZERO)),
            TimerSpec::Cycle(spec) => Err(EngineError::UnsupportedTrigger(format!(
                "cyclic timer '{spec}'"
            ))),
        }
    }

    /// Absolute instant the timer is due when armed at `now`. Fails with
    /// `MalformedTriggerSpec` when that instant is out of range.
    pub fn fire_at(&self, now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
        let delay = self.delay_from(now)?;
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .ok_or_else(|| {
                EngineError::malformed(format!("{self:?}"), "fire time out of range")
            })
    }

    pub fn is_schedulable(&self) -> bool {
        !matches!(self, TimerSpec::Cycle(_))
    }
}

// ─── ISO-8601 duration grammar ───────────────────────────────

fn decimal(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(pair(digit1, opt(pair(one_of(".,"), digit1)))),
        |s: &str| s.replace(',', ".").parse::<f64>(),
    )(input)
}

fn designator(c: char) -> impl FnMut(&str) -> IResult<&str, char> {
    move |input| char(c)(input)
}

fn unit(designator: char) -> impl FnMut(&str) -> IResult<&str, Option<f64>> {
    move |input| opt(terminated(decimal, char(designator)))(input)
}

type TimeParts = (Option<f64>, Option<f64>, Option<f64>);

fn time_part(input: &str) -> IResult<&str, Option<TimeParts>> {
    opt(preceded(char('T'), tuple((unit('H'), unit('M'), unit('S')))))(input)
}

/// Seconds denoted by `PnW` or `PnDTnHnMnS`. `None` when a designator is empty.
fn duration_seconds(input: &str) -> IResult<&str, Option<f64>> {
    let (rest, _) = designator('P')(input)?;
    if let Ok((rest, weeks)) = terminated(decimal, char('W'))(rest) {
        return Ok((rest, Some(weeks * SECS_PER_WEEK)));
    }
    let (rest, days) = unit('D')(rest)?;
    let (rest, time) = time_part(rest)?;

    let mut any = days.is_some();
    let mut total = days.unwrap_or(0.0) * SECS_PER_DAY;
    if let Some((h, m, s)) = time {
        if h.is_none() && m.is_none() && s.is_none() {
            return Ok((rest, None));
        }
        any = true;
        total += h.unwrap_or(0.0) * SECS_PER_HOUR
            + m.unwrap_or(0.0) * SECS_PER_MINUTE
            + s.unwrap_or(0.0);
    }
    Ok((rest, any.then_some(total)))
}

pub fn parse_iso_duration(text: &str) -> EngineResult<Duration> {
    let normalized = text.trim().to_ascii_uppercase();
    match duration_seconds(&normalized) {
        Ok(("", Some(secs))) => Duration::try_from_secs_f64(secs)
            .map_err(|e| EngineError::malformed(text, e.to_string())),
        Ok(("", _)) => Err(EngineError::malformed(text, "duration has no components")),
        Ok((rest, _)) => Err(EngineError::malformed(
            text,
            format!("unexpected trailing input '{rest}'"),
        )),
        Err(e) => Err(EngineError::malformed(text, e.to_string())),
    }
}

pub fn parse_date(text: &str) -> EngineResult<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| EngineError::malformed(text, e.to_string()))
}
