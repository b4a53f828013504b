use std::sync::Arc;

/// Type alias for a JIT-compiled function that evaluates a single expression.
///
/// This represents a function that:
/// - Takes a slice of input values laid out by a page's slot map
/// - Returns a single f64 result from evaluating the expression
/// - Is both Send and Sync for thread safety
pub type JITFunction = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Type alias for a JIT-compiled function that evaluates multiple expressions at once.
///
/// This represents a function that:
/// - Takes a slice of input values laid out by a page's slot map
/// - Takes a mutable slice to store the results
/// - Evaluates all expressions and writes results into the output slice in order
/// - Is both Send and Sync for thread safety
pub type CombinedJITFunction = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;
