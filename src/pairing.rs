//! Detection of position/derivative pairs.
//!
//! Equation `i-1` is "followed by derivative" when its rate simply names the state of
//! equation `i` (for example `x' = v` directly followed by `v' = -x`). Paired array states
//! are interleaved element by element in the state vector, which is the layout symplectic
//! integrators such as Velocity Verlet expect.

use log::debug;

use crate::{
    errors::SpecError,
    normalizer::{rate_name, EquationSpec},
    solver::SolverMethod,
};

/// Marks every equation that is immediately followed by its own derivative.
///
/// The mark goes on the position: equation `i-1` gets `followed_by_derivative` when its
/// rate is exactly the state of equation `i`. The last equation is never marked.
///
/// Both members of a pair must agree on array-ness; a scalar followed by an array (or
/// the reverse) is never paired.
pub fn analyze(equations: &mut [EquationSpec]) {
    for i in 1..equations.len() {
        let (head, tail) = equations.split_at_mut(i);
        let previous = &mut head[i - 1];
        let current = &tail[0];
        let paired = rate_name(&previous.rate) == Some(current.state.as_str())
            && previous.is_array() == current.is_array();
        previous.followed_by_derivative = paired;
        if paired {
            debug!("paired {} with derivative {}", previous.state, current.state);
        }
    }
    if let Some(last) = equations.last_mut() {
        last.followed_by_derivative = false;
    }
}

/// Checks that a Verlet-family method sees `(position, velocity)` pairs at every even
/// position.
///
/// # Errors
/// Returns `SpecError::VerletPairing` naming the first even position that is not
/// followed by its derivative. Other methods always pass.
pub fn validate_for_method(
    page: &str,
    equations: &[EquationSpec],
    method: SolverMethod,
) -> Result<(), SpecError> {
    if !method.requires_pairs() {
        return Ok(());
    }
    for (position, equation) in equations.iter().enumerate().step_by(2) {
        if !equation.followed_by_derivative {
            return Err(SpecError::VerletPairing {
                page: page.to_string(),
                position,
            });
        }
    }
    Ok(())
}
