//! Compiles declarative ODE pages into JIT-evaluated, event-aware numerical integrators.
//!
//! A model document declares variables and equation pages. Each page lists `(state, rate)`
//! pairs in text, plus optional events, discontinuities, delays, error handlers and solver
//! settings. This crate turns a page into a packed state layout, a single
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)-compiled
//! rate function and compiled event code, and drives an integrator over it. Expressions are
//! parsed with [evalexpr](https://github.com/ISibboI/evalexpr).
//!
//! # Features
//!
//! - Scalar, element-wise array and interleaved position/derivative states
//! - Fixed-step, adaptive and symplectic methods
//! - Zero-crossing events and discontinuities with Zeno detection
//! - Delay-differential pages with history interpolation
//! - Error handlers and a pluggable recovery policy for unhandled solver failures
//!
//! # Example
//!
//! ```rust
//! use evalexpr_ode::prelude::*;
//!
//! let mut model = Model::from_json(r#"{
//!     "name": "ball",
//!     "variables": [
//!         { "name": "y", "value": 1.0 },
//!         { "name": "v" },
//!         { "name": "t" }
//!     ],
//!     "pages": [{
//!         "name": "fall",
//!         "independentVariable": "t",
//!         "stepSize": 0.1,
//!         "method": "RK4",
//!         "equations": [
//!             { "state": "y", "rate": "v" },
//!             { "state": "v", "rate": "-9.81" }
//!         ]
//!     }]
//! }"#).unwrap();
//!
//! model.step();
//! assert!((model.bindings().scalar("t").unwrap() - 0.1).abs() < 1e-12);
//! assert!(model.bindings().scalar("y").unwrap() < 1.0);
//! ```

pub use model::Model;
pub use page::OdePage;

pub mod prelude {
    pub use crate::backends::vector::Vector;
    pub use crate::bindings::{Bindings, Value};
    pub use crate::dispatch::{ContinueOnError, ErrorPrompt, Recovery};
    pub use crate::errors::{LayoutError, ModelError, PageError, SpecError};
    pub use crate::model::{Model, PageDiagnostic, PageTable};
    pub use crate::page::{OdePage, StepContext, StepReport};
    pub use crate::solver::{ErrorCode, SolverFailure, SolverMethod};
    pub use crate::spec::{
        DelaySpec, ErrorHandlerSpec, ErrorType, EventType, ModelSpec, OdePageSpec, RawEquation,
        RootMethod, Setting, VariableSpec, ZenoSpec, ZeroCrossingSpec,
    };
}

/// Linear algebra backends for state vectors
pub mod backends {
    pub mod vector;
}
/// Live variable values shared by all pages
pub mod bindings;
/// JIT compilation functionality using Cranelift
pub mod builder;
/// Conversion from parsed expressions to internal AST
pub mod convert;
/// Delay-differential pages
pub mod delay;
/// Routing of solver failures to handlers
pub mod dispatch;
/// Error types for the various failure modes
pub mod errors;
/// Compiled events and discontinuities
pub mod events;
/// Expression tree representation
pub mod expr;
/// State vector layout
pub mod layout;
/// Models: variables plus pages
pub mod model;
/// Equation normalization and bracket rewriting
pub mod normalizer;
/// Compiled pages and their solver lifecycle
pub mod page;
/// Position/derivative pair detection
pub mod pairing;
/// Rate function compilation
pub mod rates;
/// Numeric settings
pub mod settings;
/// Numerical integration engine
pub mod solver;
/// The declarative model document
pub mod spec;
/// Compiled code blocks
pub mod statements;
/// Scratch buffer slot maps
pub mod symbols;
/// Shared function types
pub mod types;
/// Functions for linking external functions to the expression tree
pub(crate) mod operators;
