use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{trace::Trace, value::Value};

/// Trait for persisting traces as they are generated.
///
/// Handles progressive accumulation of trace records, with methods to
/// record traces and finalize the results.
pub trait TraceStorage: Send {
    /// The type returned when the storage is finalized.
    type Finalized: Send + 'static;

    /// Appends a new trace to the storage.
    fn record_trace(&mut self, record: TraceRecord) -> Result<()>;

    /// Flush any buffered data to ensure all traces are stored.
    fn flush(&mut self) -> Result<()>;

    /// Finalizes the storage and returns the processed result.
    fn finalize(self) -> Result<Self::Finalized>;
}

/// Configuration trait for creating trace storage backends.
///
/// Users choose a storage backend by providing an implementation of this
/// trait to [`Inference::save_traces`](crate::Inference::save_traces).
pub trait StorageConfig {
    /// The storage backend type this config creates.
    type Storage: TraceStorage;

    /// Creates a new storage backend instance.
    fn new_storage(self) -> Result<Self::Storage>;
}

/// Non-finite log probabilities are stored as strings, since JSON has no
/// representation for them.
mod log_prob_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = if value.is_finite() {
            Repr::Finite(*value)
        } else {
            Repr::Special(value.to_string())
        };
        repr.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(value) => Ok(value),
            Repr::Special(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Serializable snapshot of one recorded random choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub address: String,
    pub name: String,
    pub distribution: String,
    pub value: Value,
    #[serde(with = "log_prob_serde")]
    pub log_prob: f64,
    pub controlled: bool,
    pub observed: bool,
    pub reused: bool,
    pub replaced: bool,
}

/// Serializable snapshot of a [`Trace`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub variables: Vec<VariableRecord>,
    #[serde(with = "log_prob_serde")]
    pub log_prob: f64,
    #[serde(with = "log_prob_serde")]
    pub log_prob_observed: f64,
    #[serde(with = "log_prob_serde")]
    pub log_importance_weight: f64,
    pub result: serde_json::Value,
}

impl TraceRecord {
    pub fn from_trace<T: Serialize>(trace: &Trace<T>) -> Result<Self> {
        let variables = trace
            .variables()
            .iter()
            .map(|v| VariableRecord {
                address: v.address.to_string(),
                name: v.name.clone(),
                distribution: v.distribution.name().to_string(),
                value: v.value.clone(),
                log_prob: v.log_prob,
                controlled: v.controlled,
                observed: v.observed,
                reused: v.reused,
                replaced: v.replaced,
            })
            .collect();
        Ok(TraceRecord {
            variables,
            log_prob: trace.log_prob(),
            log_prob_observed: trace.log_prob_observed(),
            log_importance_weight: trace.log_importance_weight(),
            result: serde_json::to_value(trace.result())
                .context("Could not serialize trace result")?,
        })
    }

    pub fn length_controlled(&self) -> usize {
        self.variables.iter().filter(|v| v.controlled).count()
    }

    pub fn get(&self, address: &str) -> Option<&VariableRecord> {
        self.variables.iter().find(|v| v.address == address)
    }

    /// Deserialize the recorded return value of the model.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.result.clone()).context("Could not deserialize trace result")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        address::Address,
        distributions::{Distribution, Uniform},
        trace::Variable,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn impossible_values_survive_json() -> Result<()> {
        let distribution: Arc<dyn Distribution> = Arc::new(Uniform::new(0., 1.)?);
        let value = Value::Real(2.);
        let variable = Variable {
            address: Address::new("u__Uniform__1"),
            name: "u".into(),
            log_prob: distribution.log_prob(&value),
            distribution,
            value,
            controlled: false,
            observed: true,
            reused: false,
            replaced: false,
        };
        let trace = Trace::new(vec![variable], vec![1i64, 2], 0., true);
        let record = TraceRecord::from_trace(&trace)?;
        assert_eq!(record.log_prob_observed, f64::NEG_INFINITY);

        let text = serde_json::to_string(&record)?;
        let parsed: TraceRecord = serde_json::from_str(&text)?;
        assert_eq!(parsed, record);
        assert_eq!(parsed.result_as::<Vec<i64>>()?, vec![1, 2]);
        assert_eq!(parsed.get("u__Uniform__1").map(|v| v.distribution.as_str()), Some("Uniform"));
        assert_eq!(parsed.length_controlled(), 0);
        Ok(())
    }
}
