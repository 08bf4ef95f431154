use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use crate::{address::Address, distributions::Distribution, value::Value};

/// One recorded random choice.
#[derive(Debug, Clone)]
pub struct Variable {
    pub address: Address,
    /// Name of the call site the choice was made at.
    pub name: String,
    pub distribution: Arc<dyn Distribution>,
    pub value: Value,
    /// Log probability of `value` under `distribution`.
    pub log_prob: f64,
    /// Latent choice that inference may propose or reuse.
    pub controlled: bool,
    /// Conditioning data rather than a latent choice.
    pub observed: bool,
    /// The value was copied from the reference trace of a
    /// Metropolis-Hastings proposal.
    pub reused: bool,
    pub replaced: bool,
}

/// The record of one complete execution of a model.
///
/// Traces are created by the
/// [`ExecutionController`](crate::ExecutionController) and are immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct Trace<T> {
    variables: Vec<Variable>,
    controlled: Vec<usize>,
    observed: Vec<usize>,
    by_address: HashMap<Address, usize>,
    result: T,
    log_prob: f64,
    log_prob_observed: f64,
    log_importance_weight: f64,
}

impl<T> Trace<T> {
    /// Assemble a finished trace.
    ///
    /// `log_proposal_correction` is the accumulated `log p - log q` of all
    /// controlled choices that were not drawn from their prior. If
    /// `weight_observations` is set the observation likelihood is part of
    /// the importance weight.
    pub(crate) fn new(
        variables: Vec<Variable>,
        result: T,
        log_proposal_correction: f64,
        weight_observations: bool,
    ) -> Self {
        let controlled = variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.controlled)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let observed = variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.observed)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let by_address = variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address.clone(), i))
            .collect();

        let log_prob_observed: f64 = observed.iter().map(|&i| variables[i].log_prob).sum();
        let log_prob_controlled: f64 = controlled.iter().map(|&i| variables[i].log_prob).sum();
        let log_importance_weight = if weight_observations {
            log_proposal_correction + log_prob_observed
        } else {
            log_proposal_correction
        };

        Trace {
            variables,
            controlled,
            observed,
            by_address,
            result,
            log_prob: log_prob_controlled + log_prob_observed,
            log_prob_observed,
            log_importance_weight,
        }
    }

    /// All variables in execution order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variables_controlled(&self) -> impl ExactSizeIterator<Item = &Variable> + '_ {
        self.controlled.iter().map(|&i| &self.variables[i])
    }

    pub fn variables_observed(&self) -> impl ExactSizeIterator<Item = &Variable> + '_ {
        self.observed.iter().map(|&i| &self.variables[i])
    }

    pub fn length_controlled(&self) -> usize {
        self.controlled.len()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Look up the variable recorded at `address`.
    pub fn get(&self, address: &str) -> Option<&Variable> {
        self.by_address.get(address).map(|&i| &self.variables[i])
    }

    /// The last variable recorded at a call site called `name`.
    pub fn named(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().rev().find(|v| v.name == name)
    }

    pub fn result(&self) -> &T {
        &self.result
    }

    pub fn into_result(self) -> T {
        self.result
    }

    /// Joint log probability of all controlled and observed variables.
    pub fn log_prob(&self) -> f64 {
        self.log_prob
    }

    pub fn log_prob_observed(&self) -> f64 {
        self.log_prob_observed
    }

    pub fn log_importance_weight(&self) -> f64 {
        self.log_importance_weight
    }
}

/// Values for observe sites, keyed by site name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedData(BTreeMap<String, Value>);

pub(crate) static NO_OBSERVATIONS: ObservedData = ObservedData(BTreeMap::new());

impl ObservedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ObservedData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ObservedData(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Bernoulli, Normal};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn variable(address: &str, value: Value, controlled: bool, observed: bool) -> Variable {
        let distribution: Arc<dyn Distribution> = if observed {
            Arc::new(Normal::new(0., 1.).unwrap())
        } else {
            Arc::new(Bernoulli::new(0.3).unwrap())
        };
        let log_prob = distribution.log_prob(&value);
        Variable {
            address: Address::new(address),
            name: address.to_string(),
            distribution,
            value,
            log_prob,
            controlled,
            observed,
            reused: false,
            replaced: false,
        }
    }

    #[test]
    fn aggregates() {
        let variables = vec![
            variable("z", Value::Bool(true), true, false),
            variable("noise", Value::Bool(false), false, false),
            variable("y", Value::Real(0.5), false, true),
        ];
        let trace = Trace::new(variables, 1.5, -0.25, true);

        assert_eq!(trace.len(), 3);
        assert_eq!(trace.length_controlled(), 1);
        assert_eq!(trace.variables_observed().len(), 1);
        let observed = Normal::new(0., 1.).unwrap().log_prob(&Value::Real(0.5));
        assert_abs_diff_eq!(trace.log_prob_observed(), observed);
        assert_abs_diff_eq!(trace.log_prob(), 0.3f64.ln() + observed);
        assert_abs_diff_eq!(trace.log_importance_weight(), observed - 0.25);
        assert_eq!(trace.get("z").unwrap().value, Value::Bool(true));
        assert!(trace.get("missing").is_none());
        assert_eq!(*trace.result(), 1.5);
    }

    #[test]
    fn prior_traces_do_not_weight_observations() {
        let variables = vec![variable("y", Value::Real(3.), false, true)];
        let trace = Trace::new(variables, (), 0., false);
        assert_eq!(trace.log_importance_weight(), 0.);
    }

    #[test]
    fn observed_data_collects() {
        let data: ObservedData = [("a", 1.), ("b", 2.)].into_iter().collect();
        assert_eq!(data.get("b"), Some(&Value::Real(2.)));
        assert_eq!(data.len(), 2);
        let data = ObservedData::new().with("flag", true);
        assert_eq!(data.get("flag"), Some(&Value::Bool(true)));
    }
}
