//! Live variable bindings of a model.
//!
//! `Bindings` is the registry of declared variables and their current values. Pages read
//! it to decide whether a state is an array, pack it into their state vectors, and write
//! solver results and event actions back into it. It also carries the shared
//! independent-variable clock: every page sharing an independent variable reads and
//! advances the same binding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{errors::ModelError, spec::VariableSpec};

/// The value of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Value {
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }
}

/// Current values of all declared variables, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: BTreeMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the bindings described by a model's variable declarations.
    ///
    /// # Errors
    /// Returns a ModelError if a name is declared twice or an array initializer does not
    /// match the declared dimension.
    pub fn from_spec(variables: &[VariableSpec]) -> Result<Self, ModelError> {
        let mut bindings = Bindings::new();
        for var in variables {
            if bindings.values.contains_key(&var.name) {
                return Err(ModelError::InvalidVariable {
                    name: var.name.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
            let value = match (var.dimension, &var.value) {
                (None, None) => Value::Scalar(0.0),
                (None, Some(Value::Scalar(v))) => Value::Scalar(*v),
                (None, Some(Value::Array(values))) => Value::Array(values.clone()),
                (Some(len), None) => Value::Array(vec![0.0; len]),
                (Some(len), Some(Value::Scalar(v))) => Value::Array(vec![*v; len]),
                (Some(len), Some(Value::Array(values))) => {
                    if values.len() != len {
                        return Err(ModelError::InvalidVariable {
                            name: var.name.clone(),
                            reason: format!(
                                "dimension {len} but {} initial values",
                                values.len()
                            ),
                        });
                    }
                    Value::Array(values.clone())
                }
            };
            bindings.values.insert(var.name.clone(), value);
        }
        Ok(bindings)
    }

    pub fn declare_scalar(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), Value::Scalar(value));
    }

    pub fn declare_array(&mut self, name: &str, values: Vec<f64>) {
        self.values.insert(name.to_string(), Value::Array(values));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// `Some(true)` for arrays, `Some(false)` for scalars, `None` when undeclared.
    pub fn is_array(&self, name: &str) -> Option<bool> {
        self.values.get(name).map(Value::is_array)
    }

    /// Current length of an array variable.
    pub fn array_len(&self, name: &str) -> Option<usize> {
        match self.values.get(name)? {
            Value::Array(values) => Some(values.len()),
            Value::Scalar(_) => None,
        }
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            Value::Scalar(v) => Some(*v),
            Value::Array(_) => None,
        }
    }

    pub fn array(&self, name: &str) -> Option<&[f64]> {
        match self.values.get(name)? {
            Value::Array(values) => Some(values),
            Value::Scalar(_) => None,
        }
    }

    /// A scalar (`element == None`) or one array element.
    pub fn component(&self, name: &str, element: Option<usize>) -> Option<f64> {
        match (self.values.get(name)?, element) {
            (Value::Scalar(v), None) => Some(*v),
            (Value::Array(values), Some(k)) => values.get(k).copied(),
            _ => None,
        }
    }

    /// Writes a scalar or one array element. Returns false if the target does not exist.
    pub fn set_component(&mut self, name: &str, element: Option<usize>, value: f64) -> bool {
        match (self.values.get_mut(name), element) {
            (Some(Value::Scalar(v)), None) => {
                *v = value;
                true
            }
            (Some(Value::Array(values)), Some(k)) => match values.get_mut(k) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) -> bool {
        self.set_component(name, None, value)
    }

    /// Replaces the contents of an array variable. The length may change, which makes
    /// every page using it rebuild its state layout before the next step.
    pub fn set_array(&mut self, name: &str, values: Vec<f64>) -> bool {
        match self.values.get_mut(name) {
            Some(Value::Array(current)) => {
                *current = values;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
