use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PplError, Result};

/// A realized random choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Real(f64),
    Int(i64),
    Bool(bool),
    Vector(Vec<f64>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Real(_) => "real",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Vector(_) => "vector",
        }
    }

    /// Numeric view of a scalar value. Integers and booleans are widened.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Real(x) => Ok(*x),
            Value::Int(x) => Ok(*x as f64),
            Value::Bool(x) => Ok(if *x { 1. } else { 0. }),
            Value::Vector(_) => Err(self.type_error("real")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(x) => Ok(*x),
            Value::Bool(x) => Ok(*x as i64),
            _ => Err(self.type_error("int")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(x) => Ok(*x),
            _ => Err(self.type_error("bool")),
        }
    }

    pub fn as_slice(&self) -> Result<&[f64]> {
        match self {
            Value::Vector(x) => Ok(x),
            _ => Err(self.type_error("vector")),
        }
    }

    fn type_error(&self, expected: &'static str) -> PplError {
        PplError::ValueType {
            expected,
            found: self.kind(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Real(x) => write!(f, "{x}"),
            Value::Int(x) => write!(f, "{x}"),
            Value::Bool(x) => write!(f, "{x}"),
            Value::Vector(x) => write!(f, "{x:?}"),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::Vector(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scalar_views() {
        assert_eq!(Value::Int(3).as_f64().unwrap(), 3.);
        assert_eq!(Value::Bool(true).as_f64().unwrap(), 1.);
        assert_eq!(Value::Bool(true).as_i64().unwrap(), 1);
        assert!(Value::Real(0.5).as_bool().is_err());
    }

    #[test]
    fn vector_is_not_scalar() {
        let value = Value::from(vec![1., 2.]);
        assert_eq!(
            value.as_f64(),
            Err(PplError::ValueType {
                expected: "real",
                found: "vector"
            })
        );
        assert_eq!(value.as_slice().unwrap(), &[1., 2.]);
    }
}
