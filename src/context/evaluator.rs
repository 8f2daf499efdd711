use anyhow::Result;
use serde_json::{Number, Value};

use workflow::{Cast, Condition, Predicate};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Can't cast {value} to {cast:?}")]
    InvalidCast { value: Value, cast: Cast },
}

/// Decides whether a condition rule holds.
pub trait ConditionEvaluator {
    /// `value` is the value at the condition's path, with its cast already applied.
    fn evaluate(&self, condition: &Condition, value: &Value) -> Result<bool>;
}

/// Evaluates equality, membership and ordering predicates directly on JSON values.
///
/// Numbers compare by value regardless of representation, so `2` equals `2.0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl ConditionEvaluator for BasicEvaluator {
    fn evaluate(&self, condition: &Condition, value: &Value) -> Result<bool> {
        let result = match &condition.predicate {
            Predicate::Equal(other) => values_equal(value, other),
            Predicate::NotEqual(other) => !values_equal(value, other),
            Predicate::LessThan(n) => value.as_f64().is_some_and(|v| v < *n),
            Predicate::GreaterThan(n) => value.as_f64().is_some_and(|v| v > *n),
            Predicate::In(options) => options.iter().any(|o| values_equal(value, o)),
            Predicate::IsTrue => value.as_bool() == Some(true),
        };
        log::trace!("condition on {}: {result}", condition.path);
        Ok(result)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Convert `value` as a condition's cast requests.
pub fn cast_value(value: &Value, cast: Cast) -> Result<Value> {
    let invalid = || Error::InvalidCast {
        value: value.clone(),
        cast,
    };
    let cast_val = match (cast, value) {
        (Cast::Str, Value::String(_)) => value.clone(),
        (Cast::Str, other) => Value::String(other.to_string()),

        (Cast::Int, Value::Number(n)) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().ok_or_else(invalid)?.trunc() as i64),
        },
        (Cast::Int, Value::String(s)) => Value::from(s.trim().parse::<i64>().map_err(|_| invalid())?),
        (Cast::Int, Value::Bool(b)) => Value::from(i64::from(*b)),

        (Cast::Float, Value::Number(n)) => {
            Value::Number(n.as_f64().and_then(Number::from_f64).ok_or_else(invalid)?)
        }
        (Cast::Float, Value::String(s)) => {
            let f = s.trim().parse::<f64>().map_err(|_| invalid())?;
            Value::Number(Number::from_f64(f).ok_or_else(invalid)?)
        }

        (Cast::Bool, Value::Bool(_)) => value.clone(),
        (Cast::Bool, Value::Number(n)) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
        (Cast::Bool, Value::String(s)) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(invalid().into()),
        },

        _ => return Err(invalid().into()),
    };
    Ok(cast_val)
}
