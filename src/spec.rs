//! The declarative model document.
//!
//! These types mirror what an authoring tool produces: declared variables, and one
//! [`OdePageSpec`] per equation page. They are plain data read with serde (camelCase JSON
//! field names); nothing in here is validated until a page is compiled.
//!
//! # Example
//!
//! ```rust
//! use evalexpr_ode::spec::ModelSpec;
//!
//! let model: ModelSpec = serde_json::from_str(r#"{
//!     "name": "oscillator",
//!     "variables": [
//!         { "name": "x", "value": 1.0 },
//!         { "name": "v" },
//!         { "name": "t" }
//!     ],
//!     "pages": [{
//!         "name": "motion",
//!         "independentVariable": "t",
//!         "stepSize": 0.01,
//!         "method": "RK4",
//!         "equations": [
//!             { "state": "x", "rate": "v" },
//!             { "state": "v", "rate": "-x" }
//!         ]
//!     }]
//! }"#).unwrap();
//! assert_eq!(model.pages[0].equations.len(), 2);
//! ```

use serde::{Deserialize, Serialize};

use crate::bindings::Value;

/// A whole model: variables plus equation pages in declared order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub pages: Vec<OdePageSpec>,
}

/// A declared model variable.
///
/// A variable with a `dimension` is an array. Its `value` may be a single number, which
/// fills every element, or an array of exactly `dimension` numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// A numeric page setting: either a literal or an expression over model variables.
///
/// Expressions are re-evaluated whenever the solver configuration is applied, so a
/// setting like `"dt/10"` follows changes of `dt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Value(f64),
    Expression(String),
}

impl From<f64> for Setting {
    fn from(value: f64) -> Self {
        Setting::Value(value)
    }
}

impl From<&str> for Setting {
    fn from(text: &str) -> Self {
        Setting::Expression(text.to_string())
    }
}

/// One `(state, rate)` declaration as typed by the author.
///
/// The state may carry an index marker (`x[i]` or `x[]`). The rate may end in a
/// statement separator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEquation {
    pub state: String,
    pub rate: String,
}

impl RawEquation {
    pub fn new(state: &str, rate: &str) -> Self {
        RawEquation {
            state: state.to_string(),
            rate: rate.to_string(),
        }
    }
}

/// How a zero condition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// The condition must stay non-negative; it fires when it would become negative.
    #[default]
    StateEvent,
    /// Fires when the condition goes from positive to negative.
    PositiveEvent,
    /// Fires on any sign change.
    CrossingEvent,
}

/// How the event time is located within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RootMethod {
    #[default]
    Bisection,
    Secant,
}

fn default_iterations() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// An event or discontinuity: a zero condition plus the code run when it triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZeroCrossingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub zero_condition: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default)]
    pub method: RootMethod,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<Setting>,
    #[serde(default)]
    pub stop_at_event: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ZeroCrossingSpec {
    /// An enabled state event with default root finding.
    pub fn new(zero_condition: &str, action: &str) -> Self {
        ZeroCrossingSpec {
            name: None,
            zero_condition: zero_condition.to_string(),
            action: action.to_string(),
            event_type: EventType::default(),
            method: RootMethod::default(),
            iterations: default_iterations(),
            tolerance: None,
            stop_at_event: false,
            enabled: true,
        }
    }
}

pub type EventSpec = ZeroCrossingSpec;
pub type DiscontinuitySpec = ZeroCrossingSpec;

/// The delay block of a delay-differential page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelaySpec {
    /// Delay expressions, evaluated at the current state.
    #[serde(default)]
    pub delay_list: Vec<String>,
    /// Upper bound on every delay. Computed from `delay_list` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_maximum: Option<Setting>,
    /// Pre-history: one expression per state, a function of the independent variable.
    #[serde(default)]
    pub initial_condition: Vec<String>,
    /// Times at which the pre-history is not smooth.
    #[serde(default)]
    pub discontinuities: Vec<String>,
}

/// Solver error categories a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    AnyError,
    InternalSolverError,
    EventNotFound,
    IllegalEventState,
    TooManySteps,
    DidNotConverge,
}

/// Code run when the solver reports an error of `error_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub error_type: ErrorType,
    #[serde(default)]
    pub code: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Action run when events accumulate in vanishing time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZenoSpec {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub stop_after_effect: bool,
}

/// One equation page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OdePageSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub independent_variable: String,
    pub step_size: Setting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_step_size: Option<Setting>,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_length: Option<Setting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step: Option<Setting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_number_of_steps: Option<Setting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_tolerance: Option<Setting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_tolerance: Option<Setting>,
    #[serde(default)]
    pub estimate_first_step: bool,
    #[serde(default)]
    pub use_best_interpolation: bool,
    #[serde(default)]
    pub acceleration_independent_of_velocity: bool,
    #[serde(default)]
    pub force_synchronization: bool,
    #[serde(default)]
    pub equations: Vec<RawEquation>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
    #[serde(default)]
    pub discontinuities: Vec<DiscontinuitySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySpec>,
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandlerSpec>,
    #[serde(default)]
    pub preliminary_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zeno_effect: Option<ZenoSpec>,
}

impl OdePageSpec {
    /// A page with the given equations and every optional setting left unset.
    pub fn new(
        name: &str,
        independent_variable: &str,
        step_size: f64,
        method: &str,
        equations: Vec<RawEquation>,
    ) -> Self {
        OdePageSpec {
            name: name.to_string(),
            enabled: true,
            independent_variable: independent_variable.to_string(),
            step_size: Setting::Value(step_size),
            internal_step_size: None,
            method: method.to_string(),
            history_length: None,
            max_step: None,
            max_number_of_steps: None,
            absolute_tolerance: None,
            relative_tolerance: None,
            estimate_first_step: false,
            use_best_interpolation: false,
            acceleration_independent_of_velocity: false,
            force_synchronization: false,
            equations,
            events: Vec::new(),
            discontinuities: Vec::new(),
            delay: None,
            error_handlers: Vec::new(),
            preliminary_code: String::new(),
            zeno_effect: None,
        }
    }

    /// True when a non-empty delay list is declared.
    pub fn is_delayed(&self) -> bool {
        self.delay
            .as_ref()
            .is_some_and(|delay| !delay.delay_list.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults() {
        let page: OdePageSpec = serde_json::from_str(
            r#"{
                "name": "p",
                "independentVariable": "t",
                "stepSize": "dt",
                "equations": [{ "state": "x", "rate": "v;" }],
                "events": [{ "zeroCondition": "x", "action": "v = -v", "eventType": "CROSSING_EVENT" }]
            }"#,
        )
        .unwrap();
        assert!(page.enabled);
        assert_eq!(page.step_size, Setting::Expression("dt".to_string()));
        assert_eq!(page.absolute_tolerance, None);
        assert_eq!(page.events[0].event_type, EventType::CrossingEvent);
        assert_eq!(page.events[0].iterations, 100);
        assert!(page.events[0].enabled);
        assert!(!page.is_delayed());
    }

    #[test]
    fn test_error_handler_types() {
        let handler: ErrorHandlerSpec =
            serde_json::from_str(r#"{ "errorType": "TOO_MANY_STEPS", "code": "pause()" }"#)
                .unwrap();
        assert_eq!(handler.error_type, ErrorType::TooManySteps);
    }

    #[test]
    fn test_variable_values() {
        let vars: Vec<VariableSpec> = serde_json::from_str(
            r#"[{ "name": "x", "dimension": 3, "value": [1, 2, 3] }, { "name": "k", "value": 0.5 }]"#,
        )
        .unwrap();
        assert_eq!(vars[0].value, Some(Value::Array(vec![1.0, 2.0, 3.0])));
        assert_eq!(vars[1].value, Some(Value::Scalar(0.5)));
    }
}
