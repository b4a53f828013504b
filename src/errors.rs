//! Error types for the evalexpr-ode crate.
//!
//! Errors are split by the layer that raises them:
//!
//! - `ConvertError`: Errors during conversion from the evalexpr AST to our expression tree
//! - `BuilderError`: Errors during JIT compilation with Cranelift
//! - `EquationError`: Errors of the whole parse, convert and compile pipeline for one expression
//! - `SpecError`: Compile-time errors of a single ODE page, carrying the page and element
//! - `PageError`: Errors of runtime accessors on a compiled page
//! - `ModelError`: Errors while assembling a model from its document
//!
//! Runtime numerical failures are not errors in this sense. They are reported by the
//! solver as a [`crate::solver::SolverFailure`] and routed through the error dispatcher.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from evalexpr AST to our internal AST representation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    /// Error when an exponent cannot be converted
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when a function is called with the wrong number of arguments
    #[error("Function {name} expects {expected} argument(s), got {got}")]
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when a variable is not found in the slot map
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    /// Error when an array variable is read where a single value is expected
    #[error("Array variable {0} used in scalar context")]
    ArrayInScalarContext(String),
    /// Error when a literal element index is out of range
    #[error("Index {index} out of range for {name} (length {len})")]
    IndexOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },
    /// Error when `delayed(x, k)` refers to an unknown state or delay
    #[error("Invalid delayed reference: {0}")]
    InvalidDelay(String),
}

/// Errors that can occur during JIT compilation of expressions.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid compiler setting: {0}")]
    Settings(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// Errors of the parse, convert and compile pipeline of one expression.
#[derive(Debug, Error)]
pub enum EquationError {
    /// Error when parsing the expression string with evalexpr
    #[error("Failed to build Evalexpr AST: {0}")]
    BuildEvalexprError(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting from evalexpr AST to our JIT-compatible AST
    #[error("Failed to build JIT AST: {0}")]
    BuildJITError(#[from] ConvertError),
    /// Error when JIT compiling the expression
    #[error("Failed to build JIT function: {0}")]
    BuildFunctionError(#[from] BuilderError),
    /// Error when the input length does not match the slot count
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
}

/// Compile-time errors of an ODE page.
///
/// Every variant names the page and, where applicable, the offending element so the
/// author can fix the document. A `SpecError` aborts the affected page only.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpecError {
    /// An equation, event or code line cannot be read
    #[error("page '{page}': malformed {element}: {reason}")]
    Malformed {
        page: String,
        element: String,
        reason: String,
    },
    /// A state refers to a variable that is not declared in the model
    #[error("page '{page}': state '{name}' is not a declared variable")]
    UndeclaredVariable { page: String, name: String },
    /// A state is used as array in one place and as scalar in another
    #[error("page '{page}': state '{state}' is used inconsistently as scalar and array")]
    InconsistentArrayUse { page: String, state: String },
    /// The same state appears in more than one equation
    #[error("page '{page}': state '{state}' appears in more than one equation")]
    DuplicateState { page: String, state: String },
    /// A loop index shadows a declared variable
    #[error("page '{page}': index '{index}' of state '{state}' shadows a declared variable")]
    IndexCollision {
        page: String,
        state: String,
        index: String,
    },
    /// An index expression is neither a literal nor the loop index
    #[error("page '{page}': unsupported index '{index}' in {element}")]
    UnsupportedIndex {
        page: String,
        element: String,
        index: String,
    },
    /// An index offset from the loop index, such as `x[i+1]`
    #[error(
        "page '{page}': neighbour index '{index}' in {element}; elements can only be read \
         by the loop index or a literal position"
    )]
    NeighbourIndex {
        page: String,
        element: String,
        index: String,
    },
    /// The independent variable is not a declared scalar
    #[error("page '{page}': independent variable '{name}' is missing or not a scalar")]
    MissingIndependentVariable { page: String, name: String },
    /// A Verlet-family method is selected but the equations are not position/velocity pairs
    #[error("page '{page}': method requires equation {position} to be followed by its derivative")]
    VerletPairing { page: String, position: usize },
    /// Two paired array states have different lengths
    #[error("page '{page}': paired arrays '{first}' and '{second}' differ in length")]
    PairLengthMismatch {
        page: String,
        first: String,
        second: String,
    },
    /// Delays are declared without a pre-history function
    #[error("page '{page}': delays declared without an initial condition")]
    MissingInitialCondition { page: String },
    /// The pre-history function does not return one value per state
    #[error("page '{page}': initial condition has {got} entries, expected {expected}")]
    InitialConditionCount {
        page: String,
        expected: usize,
        got: usize,
    },
    /// An expression of the page failed to parse or compile
    #[error("page '{page}': {element}: {message}")]
    Expression {
        page: String,
        element: String,
        message: String,
    },
}

impl SpecError {
    /// Wraps an expression pipeline failure with its page and element.
    pub fn expression(page: &str, element: &str, err: impl std::fmt::Display) -> Self {
        SpecError::Expression {
            page: page.to_string(),
            element: element.to_string(),
            message: err.to_string(),
        }
    }

    /// Name of the page the error belongs to.
    pub fn page(&self) -> &str {
        match self {
            SpecError::Malformed { page, .. }
            | SpecError::UndeclaredVariable { page, .. }
            | SpecError::InconsistentArrayUse { page, .. }
            | SpecError::DuplicateState { page, .. }
            | SpecError::IndexCollision { page, .. }
            | SpecError::UnsupportedIndex { page, .. }
            | SpecError::NeighbourIndex { page, .. }
            | SpecError::MissingIndependentVariable { page, .. }
            | SpecError::VerletPairing { page, .. }
            | SpecError::PairLengthMismatch { page, .. }
            | SpecError::MissingInitialCondition { page }
            | SpecError::InitialConditionCount { page, .. }
            | SpecError::Expression { page, .. } => page,
        }
    }
}

/// Errors of runtime accessors on a compiled page.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page declares no delays
    #[error("page '{0}' is not a delay equation")]
    NoDelay(String),
    /// The named state is not part of the page
    #[error("page '{page}' has no state '{name}'")]
    UnknownState { page: String, name: String },
    /// The page could not be rebuilt for the current array lengths
    #[error(transparent)]
    Spec(#[from] SpecError),
    /// The bindings no longer hold a value for a state component
    #[error("page '{page}': {source}")]
    Layout {
        page: String,
        #[source]
        source: LayoutError,
    },
}

/// Errors while assembling a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A variable declaration is inconsistent
    #[error("variable '{name}': {reason}")]
    InvalidVariable { name: String, reason: String },
    /// The model document cannot be read
    #[error("failed to read model document: {0}")]
    Document(#[from] serde_json::Error),
}

/// Errors when moving values between bindings and a packed state vector.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    /// A state has no value of the expected shape in the bindings
    #[error("no value for state component {0}")]
    MissingValue(String),
    /// The vector does not have the layout's length
    #[error("state vector has {got} slots, layout needs {expected}")]
    Length { expected: usize, got: usize },
}
