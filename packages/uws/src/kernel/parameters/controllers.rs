//! Built-in parameter controllers.
//!
//! A controller validates and possibly coerces one parameter, provides
//! its default, and decides whether clients may overwrite it after
//! creation. Dispatch is a tagged enum with a `Custom` escape hatch for
//! user-supplied controllers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::common::units;
use crate::kernel::error::{UwsError, UwsResult};

/// Context a controller may need while checking: currently the job's
/// creation instant, which anchors relative destruction intervals.
#[derive(Debug, Clone, Copy)]
pub struct ParamContext {
    pub creation_time: DateTime<Utc>,
}

impl ParamContext {
    pub fn new(creation_time: DateTime<Utc>) -> Self {
        Self { creation_time }
    }
}

/// Outcome of a successful check: the value to store, plus a warning
/// when the proposed value was coerced.
#[derive(Debug, Clone, PartialEq)]
pub struct Checked {
    pub value: Value,
    pub warning: Option<String>,
}

impl Checked {
    pub fn accepted(value: Value) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    pub fn coerced(value: Value, warning: impl Into<String>) -> Self {
        Self {
            value,
            warning: Some(warning.into()),
        }
    }
}

/// Contract for user-supplied controllers.
pub trait CustomController: Send + Sync {
    fn allows_modification(&self) -> bool {
        true
    }

    fn default_value(&self, _ctx: &ParamContext) -> Option<Value> {
        None
    }

    fn check(&self, ctx: &ParamContext, name: &str, proposed: &Value) -> UwsResult<Checked>;
}

/// Per-parameter validator. Each parameter of a job list has zero or one.
#[derive(Clone)]
pub enum ParameterController {
    String(StringController),
    Numeric(NumericController),
    Duration(DurationController),
    ExecutionDuration(ExecutionDurationController),
    DestructionTime(DestructionTimeController),
    Custom(Arc<dyn CustomController>),
}

impl ParameterController {
    pub fn allows_modification(&self) -> bool {
        match self {
            ParameterController::String(c) => c.modifiable,
            ParameterController::Numeric(c) => c.modifiable,
            ParameterController::Duration(c) => c.modifiable,
            ParameterController::ExecutionDuration(c) => c.modifiable,
            ParameterController::DestructionTime(c) => c.modifiable,
            ParameterController::Custom(c) => c.allows_modification(),
        }
    }

    pub fn default_value(&self, ctx: &ParamContext) -> Option<Value> {
        match self {
            ParameterController::String(c) => c.default.clone().map(Value::String),
            ParameterController::Numeric(c) => c.default.and_then(number),
            ParameterController::Duration(c) => c.default_ms.map(Value::from),
            ParameterController::ExecutionDuration(c) => Some(Value::from(c.default_sec)),
            ParameterController::DestructionTime(c) => Some(Value::String(
                (ctx.creation_time + c.default_interval).to_rfc3339(),
            )),
            ParameterController::Custom(c) => c.default_value(ctx),
        }
    }

    pub fn check(&self, ctx: &ParamContext, name: &str, proposed: &Value) -> UwsResult<Checked> {
        match self {
            ParameterController::String(c) => c.check(name, proposed),
            ParameterController::Numeric(c) => c.check(name, proposed),
            ParameterController::Duration(c) => c.check(name, proposed),
            ParameterController::ExecutionDuration(c) => c.check(name, proposed),
            ParameterController::DestructionTime(c) => c.check(ctx, name, proposed),
            ParameterController::Custom(c) => c.check(ctx, name, proposed),
        }
    }
}

impl std::fmt::Debug for ParameterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ParameterController::String(_) => "String",
            ParameterController::Numeric(_) => "Numeric",
            ParameterController::Duration(_) => "Duration",
            ParameterController::ExecutionDuration(_) => "ExecutionDuration",
            ParameterController::DestructionTime(_) => "DestructionTime",
            ParameterController::Custom(_) => "Custom",
        };
        write!(f, "ParameterController::{}", kind)
    }
}

/// Controllers of a job list, keyed by canonical parameter name.
pub type ControllerMap = HashMap<String, ParameterController>;

fn invalid(name: &str, reason: impl Into<String>) -> UwsError {
    UwsError::InvalidParameter {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn number(value: f64) -> Option<Value> {
    serde_json::Number::from_f64(value).map(Value::Number)
}

/// Free-text parameter, optionally constrained by an anchored regular
/// expression.
#[derive(Debug, Clone, Default)]
pub struct StringController {
    pub default: Option<String>,
    pattern: Option<Regex>,
    pub modifiable: bool,
}

impl StringController {
    pub fn new(default: Option<&str>) -> Self {
        Self {
            default: default.map(str::to_string),
            pattern: None,
            modifiable: true,
        }
    }

    pub fn with_pattern(mut self, pattern: &str, case_sensitive: bool) -> UwsResult<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| invalid("<pattern>", e.to_string()))?;
        self.pattern = Some(regex);
        Ok(self)
    }

    pub fn fixed(mut self) -> Self {
        self.modifiable = false;
        self
    }

    fn check(&self, name: &str, proposed: &Value) -> UwsResult<Checked> {
        let text = match proposed {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(invalid(name, "expected a string")),
        };

        if let Some(regex) = &self.pattern {
            // Anchored match: the pattern must cover the whole value.
            let whole = regex
                .find(&text)
                .is_some_and(|m| m.start() == 0 && m.end() == text.len());
            if !whole {
                return Err(invalid(
                    name,
                    format!("'{}' does not match the expected pattern", text),
                ));
            }
        }

        Ok(Checked::accepted(Value::String(text)))
    }
}

/// Finite real parameter clamped into `[min, max]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericController {
    pub default: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub modifiable: bool,
}

impl NumericController {
    pub fn new(default: Option<f64>, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            default,
            min,
            max,
            modifiable: true,
        }
    }

    fn check(&self, name: &str, proposed: &Value) -> UwsResult<Checked> {
        let value = match proposed {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(name, "expected a finite number"))?;

        if let Some(min) = self.min {
            if value < min {
                let stored = number(min).ok_or_else(|| invalid(name, "min is not finite"))?;
                return Ok(Checked::coerced(
                    stored,
                    format!("{} raised from {} to the minimum {}", name, value, min),
                ));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                let stored = number(max).ok_or_else(|| invalid(name, "max is not finite"))?;
                return Ok(Checked::coerced(
                    stored,
                    format!("{} lowered from {} to the maximum {}", name, value, max),
                ));
            }
        }

        let stored = number(value).ok_or_else(|| invalid(name, "expected a finite number"))?;
        Ok(Checked::accepted(stored))
    }
}

/// Duration parameter with unit suffixes; canonical form is integer
/// milliseconds (non-negative).
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationController {
    pub default_ms: Option<i64>,
    pub min_ms: Option<i64>,
    pub max_ms: Option<i64>,
    pub modifiable: bool,
}

impl DurationController {
    pub fn new(default_ms: Option<i64>, min_ms: Option<i64>, max_ms: Option<i64>) -> Self {
        Self {
            default_ms,
            min_ms,
            max_ms,
            modifiable: true,
        }
    }

    fn parse(name: &str, proposed: &Value) -> UwsResult<i64> {
        let ms = match proposed {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| invalid(name, "expected integer milliseconds"))?,
            Value::String(s) => {
                units::parse_duration_ms(s).map_err(|e| invalid(name, e.to_string()))?
            }
            _ => return Err(invalid(name, "expected a duration")),
        };
        if ms < 0 {
            return Err(invalid(name, "duration must not be negative"));
        }
        Ok(ms)
    }

    fn check(&self, name: &str, proposed: &Value) -> UwsResult<Checked> {
        let ms = Self::parse(name, proposed)?;

        if let Some(min) = self.min_ms {
            if ms < min {
                return Ok(Checked::coerced(
                    Value::from(min),
                    format!(
                        "{} raised to the minimum {}",
                        name,
                        units::format_duration_ms(min)
                    ),
                ));
            }
        }
        if let Some(max) = self.max_ms {
            if ms > max {
                return Ok(Checked::coerced(
                    Value::from(max),
                    format!(
                        "{} lowered to the maximum {}",
                        name,
                        units::format_duration_ms(max)
                    ),
                ));
            }
        }

        Ok(Checked::accepted(Value::from(ms)))
    }
}

/// Controller for the job's EXECUTIONDURATION parameter: integer seconds,
/// 0 meaning "no limit", bounded by `max_sec` when that is positive.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionDurationController {
    pub default_sec: i64,
    pub max_sec: i64,
    pub modifiable: bool,
}

impl ExecutionDurationController {
    pub fn new(default_sec: i64, max_sec: i64) -> Self {
        Self {
            default_sec,
            max_sec,
            modifiable: true,
        }
    }

    fn check(&self, name: &str, proposed: &Value) -> UwsResult<Checked> {
        let seconds = match proposed {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| invalid(name, "expected integer seconds"))?,
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| invalid(name, "expected integer seconds"))?,
            _ => return Err(invalid(name, "expected integer seconds")),
        };
        if seconds < 0 {
            return Err(invalid(name, "execution duration must not be negative"));
        }

        if self.max_sec > 0 && (seconds == 0 || seconds > self.max_sec) {
            return Ok(Checked::coerced(
                Value::from(self.max_sec),
                format!(
                    "{} capped to the maximum of {} seconds",
                    name, self.max_sec
                ),
            ));
        }

        Ok(Checked::accepted(Value::from(seconds)))
    }
}

impl Default for ExecutionDurationController {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Controller for the job's DESTRUCTION parameter: an absolute ISO-8601
/// instant, defaulted and capped relative to the job's creation time.
#[derive(Debug, Clone, Copy)]
pub struct DestructionTimeController {
    pub default_interval: Duration,
    pub max_interval: Option<Duration>,
    pub modifiable: bool,
}

impl DestructionTimeController {
    pub fn new(default_interval: Duration, max_interval: Option<Duration>) -> Self {
        Self {
            default_interval,
            max_interval,
            modifiable: true,
        }
    }

    fn check(&self, ctx: &ParamContext, name: &str, proposed: &Value) -> UwsResult<Checked> {
        let text = proposed
            .as_str()
            .ok_or_else(|| invalid(name, "expected an ISO-8601 instant"))?;
        let supplied = DateTime::parse_from_rfc3339(text.trim())
            .map_err(|e| invalid(name, format!("invalid ISO-8601 instant: {}", e)))?
            .with_timezone(&Utc);

        if let Some(max_interval) = self.max_interval {
            let latest = ctx.creation_time + max_interval;
            if supplied > latest {
                return Ok(Checked::coerced(
                    Value::String(latest.to_rfc3339()),
                    format!("{} moved up to the latest permitted instant", name),
                ));
            }
        }

        Ok(Checked::accepted(Value::String(supplied.to_rfc3339())))
    }
}
