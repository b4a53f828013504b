//! The numerical engine behind every ODE page.
//!
//! The engine advances a flat state vector whose last component is the independent
//! variable. It knows nothing about names or bindings: a page exposes itself through the
//! [`OdeSystem`] trait and the engine calls back for rates, delays, zero conditions and
//! event actions.
//!
//! Runtime failures never panic or propagate as `Err`; they are recorded as a
//! [`SolverFailure`] the page reads back after each step, the way an error code is read.

mod events;
mod history;
mod integrator;
mod methods;

use std::fmt;

use thiserror::Error;

use crate::spec::ErrorType;

pub use events::{EventDescriptor, EventSolver};
pub use history::History;
pub use integrator::{Integrator, StepController, Tolerances};

/// Integration method of a page.
///
/// Resolved from the author's method string by keyword. Anything unrecognized is
/// classical fourth-order Runge-Kutta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SolverMethod {
    Euler,
    EulerRichardson,
    #[default]
    RungeKutta4,
    VelocityVerlet,
    /// Cash-Karp embedded 4(5) pair. Also selected by "RungeKuttaFehlberg".
    CashKarp45,
    /// Dormand-Prince embedded 5(4) pair.
    DormandPrince5,
}

/// Keywords in match order. More specific keywords come first.
const KEYWORDS: &[(&str, SolverMethod)] = &[
    ("richardson", SolverMethod::EulerRichardson),
    ("verlet", SolverMethod::VelocityVerlet),
    ("rungekuttafehlberg", SolverMethod::CashKarp45),
    ("cashkarp", SolverMethod::CashKarp45),
    ("rkf45", SolverMethod::CashKarp45),
    ("dormandprince", SolverMethod::DormandPrince5),
    ("dopri5", SolverMethod::DormandPrince5),
    ("euler", SolverMethod::Euler),
    ("rk4", SolverMethod::RungeKutta4),
    ("rungekutta", SolverMethod::RungeKutta4),
];

impl SolverMethod {
    /// Resolves a method name by case-insensitive keyword match.
    ///
    /// Separators (`-`, `_`, whitespace) are ignored, so `"Cash-Karp"` and `"CashKarp"`
    /// resolve alike.
    pub fn from_name(name: &str) -> Self {
        let key: String = name
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        KEYWORDS
            .iter()
            .find(|(keyword, _)| key.contains(keyword))
            .map(|(_, method)| *method)
            .unwrap_or_default()
    }

    /// Verlet-family methods need `(position, velocity)` pairs at even positions.
    pub fn requires_pairs(self) -> bool {
        matches!(self, SolverMethod::VelocityVerlet)
    }

    /// Methods with an embedded error estimate adapt their internal step.
    pub fn is_adaptive(self) -> bool {
        matches!(self, SolverMethod::CashKarp45 | SolverMethod::DormandPrince5)
    }

    pub fn name(self) -> &'static str {
        match self {
            SolverMethod::Euler => "Euler",
            SolverMethod::EulerRichardson => "EulerRichardson",
            SolverMethod::RungeKutta4 => "RK4",
            SolverMethod::VelocityVerlet => "VelocityVerlet",
            SolverMethod::CashKarp45 => "CashKarp45",
            SolverMethod::DormandPrince5 => "DormandPrince5",
        }
    }
}

impl From<&str> for SolverMethod {
    fn from(name: &str) -> Self {
        SolverMethod::from_name(name)
    }
}

impl fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime error codes of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalSolverError,
    EventNotFound,
    IllegalEventState,
    TooManySteps,
    DidNotConverge,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 5] = [
        ErrorCode::InternalSolverError,
        ErrorCode::EventNotFound,
        ErrorCode::IllegalEventState,
        ErrorCode::TooManySteps,
        ErrorCode::DidNotConverge,
    ];
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::InternalSolverError => "INTERNAL_SOLVER_ERROR",
            ErrorCode::EventNotFound => "EVENT_NOT_FOUND",
            ErrorCode::IllegalEventState => "ILLEGAL_EVENT_STATE",
            ErrorCode::TooManySteps => "TOO_MANY_STEPS",
            ErrorCode::DidNotConverge => "DID_NOT_CONVERGE",
        };
        f.write_str(text)
    }
}

impl ErrorType {
    /// True for `ANY_ERROR` and for the type named after `code`.
    pub fn matches(self, code: ErrorCode) -> bool {
        matches!(
            (self, code),
            (ErrorType::AnyError, _)
                | (ErrorType::InternalSolverError, ErrorCode::InternalSolverError)
                | (ErrorType::EventNotFound, ErrorCode::EventNotFound)
                | (ErrorType::IllegalEventState, ErrorCode::IllegalEventState)
                | (ErrorType::TooManySteps, ErrorCode::TooManySteps)
                | (ErrorType::DidNotConverge, ErrorCode::DidNotConverge)
        )
    }
}

/// A runtime failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct SolverFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl SolverFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        SolverFailure {
            code,
            message: message.into(),
        }
    }
}

/// A system the engine can integrate.
///
/// State vectors passed to every method include the independent variable as their last
/// component.
pub trait OdeSystem {
    /// Length of the state vector.
    fn dimension(&self) -> usize;

    /// Writes the derivative of `state` into `out`.
    ///
    /// `delayed` holds one full state vector per delay, delay-major; it is empty for
    /// systems without delays.
    fn rate(&mut self, state: &[f64], delayed: &[f64], out: &mut [f64]);

    /// Number of delays.
    fn delay_count(&self) -> usize {
        0
    }

    /// Evaluates the delays at `state` into `out`.
    fn delays(&mut self, _state: &[f64], _out: &mut Vec<f64>) {}

    /// Upper bound on every delay at `state`.
    fn maximum_delay(&mut self, _state: &[f64]) -> f64 {
        0.0
    }

    /// Fills `state` with the pre-history at `time`. Returns false if there is none.
    fn initial_condition(&mut self, _time: f64, _state: &mut [f64]) -> bool {
        false
    }

    /// Times at which the pre-history is not smooth.
    fn initial_condition_discontinuities(&mut self) -> Vec<f64> {
        Vec::new()
    }

    /// Value of the zero condition of event `event` at `state`.
    fn zero_condition(&mut self, _event: usize, _state: &[f64]) -> f64 {
        1.0
    }

    /// Runs the action of event `event`, which may modify `state`. Returns true to stop
    /// the current step at the event.
    fn event_action(&mut self, _event: usize, _state: &mut [f64]) -> bool {
        false
    }

    /// Runs the Zeno action. Returns true to stop the current step.
    fn zeno_action(&mut self, _state: &mut [f64]) -> bool {
        false
    }
}
