//! Crontab expression parsing and matching.
//!
//! Supports the classic five-field syntax (`minute hour day month weekday`)
//! plus the `@`-prefixed nicknames. Matching resolution is one minute, in
//! UTC. `@reboot` parses into an expression that never matches; the cron
//! plugin handles it out of band.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("expected five space-separated fields, got {0}")]
    FieldCount(usize),
    #[error("unknown nickname: {0}")]
    UnknownNickname(String),
    #[error("unknown alias in {field} field: {value}")]
    UnknownAlias { field: &'static str, value: String },
    #[error("invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid range in {field} field: {a} is greater than {b}")]
    InvertedRange { field: &'static str, a: u32, b: u32 },
    #[error("invalid step in {field} field: {step} exceeds span of {span}")]
    StepTooLarge {
        field: &'static str,
        step: u32,
        span: u32,
    },
    #[error("step must be positive in {field} field")]
    ZeroStep { field: &'static str },
}

/// One parsed field: either a wildcard or an explicit value set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Set(BTreeSet<u32>),
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Set(values) => values.contains(&value),
        }
    }
}

/// Metadata for one of the five positions: its name, bounds, and any
/// three-letter aliases it accepts.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    aliases: &'static [(&'static str, u32)],
}

const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    aliases: &[],
};

const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    aliases: &[],
};

const DAYS: FieldSpec = FieldSpec {
    name: "day",
    min: 1,
    max: 31,
    aliases: &[],
};

const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    aliases: &[
        ("JAN", 1),
        ("FEB", 2),
        ("MAR", 3),
        ("APR", 4),
        ("MAY", 5),
        ("JUN", 6),
        ("JUL", 7),
        ("AUG", 8),
        ("SEP", 9),
        ("OCT", 10),
        ("NOV", 11),
        ("DEC", 12),
    ],
};

const WEEKDAYS: FieldSpec = FieldSpec {
    name: "weekday",
    min: 0,
    max: 6,
    aliases: &[
        ("SUN", 0),
        ("MON", 1),
        ("TUE", 2),
        ("WED", 3),
        ("THU", 4),
        ("FRI", 5),
        ("SAT", 6),
    ],
};

/// A parsed crontab expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Cron {
    minutes: Field,
    hours: Field,
    days: Field,
    months: Field,
    weekdays: Field,
    reboot: bool,
    /// The source expression, kept for logging and fingerprinting.
    expression: String,
}

impl Cron {
    /// Parse a crontab string or nickname.
    pub fn parse(input: &str) -> Result<Cron, ParseError> {
        let trimmed = input.trim();

        if let Some(nickname) = trimmed.strip_prefix('@') {
            return Self::parse_nickname(nickname, trimmed);
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ParseError::FieldCount(parts.len()));
        }

        Ok(Cron {
            minutes: parse_field(parts[0], &MINUTES)?,
            hours: parse_field(parts[1], &HOURS)?,
            days: parse_field(parts[2], &DAYS)?,
            months: parse_field(parts[3], &MONTHS)?,
            weekdays: parse_field(parts[4], &WEEKDAYS)?,
            reboot: false,
            expression: trimmed.to_owned(),
        })
    }

    fn parse_nickname(nickname: &str, original: &str) -> Result<Cron, ParseError> {
        let expanded = match nickname {
            "yearly" | "annually" => "0 0 1 1 *",
            "monthly" => "0 0 1 * *",
            "weekly" => "0 0 * * 0",
            "daily" | "midnight" => "0 0 * * *",
            "hourly" => "0 * * * *",
            "reboot" => {
                // Never matches on the clock; the cron plugin fires reboot
                // entries exactly once at startup on the leader.
                return Ok(Cron {
                    minutes: Field::Set(BTreeSet::new()),
                    hours: Field::Set(BTreeSet::new()),
                    days: Field::Set(BTreeSet::new()),
                    months: Field::Set(BTreeSet::new()),
                    weekdays: Field::Set(BTreeSet::new()),
                    reboot: true,
                    expression: original.to_owned(),
                });
            }
            other => return Err(ParseError::UnknownNickname(format!("@{other}"))),
        };

        let mut cron = Self::parse(expanded)?;
        cron.expression = original.to_owned();
        Ok(cron)
    }

    /// Whether this is an `@reboot` entry.
    pub fn is_reboot(&self) -> bool {
        self.reboot
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the expression matches `instant`, at minute resolution, in UTC.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        if self.reboot {
            return false;
        }

        self.minutes.contains(instant.minute())
            && self.hours.contains(instant.hour())
            && self.days.contains(instant.day())
            && self.months.contains(instant.month())
            && self.weekdays.contains(instant.weekday().num_days_from_sunday())
    }
}

impl FromStr for Cron {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cron::parse(s)
    }
}

impl std::fmt::Display for Cron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parse one comma-separated field against its spec.
fn parse_field(input: &str, spec: &FieldSpec) -> Result<Field, ParseError> {
    if input == "*" {
        return Ok(Field::Any);
    }

    let mut values = BTreeSet::new();

    for term in input.split(',') {
        match parse_term(term, spec)? {
            // A bare `*` inside a list still covers the whole field
            Field::Any => return Ok(Field::Any),
            Field::Set(set) => values.extend(set),
        }
    }

    Ok(Field::Set(values))
}

/// Parse a single term: `*`, literal, `a-b`, `*/n`, or `a-b/n`.
fn parse_term(term: &str, spec: &FieldSpec) -> Result<Field, ParseError> {
    if term == "*" {
        return Ok(Field::Any);
    }

    let (range_part, step) = match term.split_once('/') {
        Some((range, step_str)) => {
            let step: u32 =
                step_str
                    .parse()
                    .map_err(|_| ParseError::InvalidValue {
                        field: spec.name,
                        value: term.to_owned(),
                    })?;
            (range, Some(step))
        }
        None => (term, None),
    };

    let (first, last) = parse_range(range_part, spec)?;

    match step {
        None => Ok(Field::Set((first..=last).collect())),
        Some(0) => Err(ParseError::ZeroStep { field: spec.name }),
        Some(step) => {
            let span = last - first;
            // Later parser generations accept any step that fits the span,
            // not only even divisors.
            if step > span.max(1) {
                return Err(ParseError::StepTooLarge {
                    field: spec.name,
                    step,
                    span,
                });
            }
            Ok(Field::Set((first..=last).step_by(step as usize).collect()))
        }
    }
}

/// Parse the range half of a term into inclusive bounds.
fn parse_range(input: &str, spec: &FieldSpec) -> Result<(u32, u32), ParseError> {
    if input == "*" {
        return Ok((spec.min, spec.max));
    }

    if let Some((a_str, b_str)) = input.split_once('-') {
        let a = parse_value(a_str, spec)?;
        let b = parse_value(b_str, spec)?;
        if a > b {
            return Err(ParseError::InvertedRange {
                field: spec.name,
                a,
                b,
            });
        }
        return Ok((a, b));
    }

    let value = parse_value(input, spec)?;
    Ok((value, value))
}

/// Parse an integer literal or a three-letter alias, checking bounds.
fn parse_value(input: &str, spec: &FieldSpec) -> Result<u32, ParseError> {
    if input.chars().all(|c| c.is_ascii_digit()) && !input.is_empty() {
        let value: u32 = input.parse().map_err(|_| ParseError::InvalidValue {
            field: spec.name,
            value: input.to_owned(),
        })?;
        if value < spec.min || value > spec.max {
            return Err(ParseError::OutOfRange {
                field: spec.name,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        return Ok(value);
    }

    if let Some((_, value)) = spec.aliases.iter().find(|(alias, _)| *alias == input) {
        return Ok(*value);
    }

    if spec.aliases.is_empty() {
        Err(ParseError::InvalidValue {
            field: spec.name,
            value: input.to_owned(),
        })
    } else {
        Err(ParseError::UnknownAlias {
            field: spec.name,
            value: input.to_owned(),
        })
    }
}
