//! Equation normalization.
//!
//! Turns the author's `(state, rate)` text pairs into canonical [`EquationSpec`] records
//! and rewrites the bracket notation of expressions into identifiers evalexpr can parse.
//!
//! Array-ness of a state is decided by an explicit index marker (`x[i]`, or `x[]` for a
//! synthesized index) or, without a marker, by the declared dimension of the variable.

use std::collections::HashSet;

use log::debug;

use crate::{bindings::Bindings, errors::SpecError, spec::RawEquation};

/// Loop index used for array states declared without an explicit one.
pub const SYNTHESIZED_INDEX: &str = "_i";

/// Separator between an array name and a literal element in rewritten expressions.
pub(crate) const ELEMENT_SEPARATOR: &str = "__";

/// A canonical equation.
#[derive(Debug, Clone, PartialEq)]
pub struct EquationSpec {
    /// Name of the state variable.
    pub state: String,
    /// Loop index for array states, `None` for scalars.
    pub index: Option<String>,
    /// Rate expression, trimmed and without trailing separator.
    pub rate: String,
    /// Set by the pairing analysis when the next equation is this state's derivative.
    pub followed_by_derivative: bool,
}

impl EquationSpec {
    pub fn is_array(&self) -> bool {
        self.index.is_some()
    }
}

/// Normalizes the equations of one page.
///
/// # Arguments
/// * `page` - Page name, for error reports
/// * `raw` - The equations as written
/// * `registry` - Declared variables, consulted for array-ness
///
/// # Errors
/// Returns a SpecError for malformed text, undeclared or duplicated states, and states
/// whose index marker contradicts their declaration.
pub fn normalize(
    page: &str,
    raw: &[RawEquation],
    registry: &Bindings,
) -> Result<Vec<EquationSpec>, SpecError> {
    let mut seen = HashSet::new();
    let mut equations = Vec::with_capacity(raw.len());

    for (position, equation) in raw.iter().enumerate() {
        let element = format!("equation {position}");
        let malformed = |reason: &str| SpecError::Malformed {
            page: page.to_string(),
            element: element.clone(),
            reason: reason.to_string(),
        };

        let state_text = equation.state.trim();
        let rate = strip_separator(&equation.rate);
        if state_text.is_empty() {
            return Err(malformed("empty state"));
        }
        if rate.is_empty() {
            return Err(malformed("empty rate"));
        }

        let (state, marker) = parse_state(state_text).ok_or_else(|| {
            malformed(&format!("cannot read state '{state_text}'"))
        })?;

        let declared_array = registry
            .is_array(state)
            .ok_or_else(|| SpecError::UndeclaredVariable {
                page: page.to_string(),
                name: state.to_string(),
            })?;

        if !seen.insert(state.to_string()) {
            return Err(SpecError::DuplicateState {
                page: page.to_string(),
                state: state.to_string(),
            });
        }

        let (index, explicit) = match (marker, declared_array) {
            (Some(_), false) => {
                return Err(SpecError::InconsistentArrayUse {
                    page: page.to_string(),
                    state: state.to_string(),
                })
            }
            (Some(Some(index)), true) => (Some(index.to_string()), true),
            (Some(None), true) | (None, true) => (Some(SYNTHESIZED_INDEX.to_string()), false),
            (None, false) => (None, false),
        };

        let mut rate = rate.to_string();
        if let Some(index) = &index {
            if registry.contains(index) {
                return Err(SpecError::IndexCollision {
                    page: page.to_string(),
                    state: state.to_string(),
                    index: index.clone(),
                });
            }
            if !explicit && is_identifier(&rate) && registry.is_array(&rate) == Some(true) {
                rate = format!("{rate}[{index}]");
            }
        }

        debug!("page '{page}': {state}{} = {rate}", if index.is_some() { "[]" } else { "" });
        equations.push(EquationSpec {
            state: state.to_string(),
            index,
            rate,
            followed_by_derivative: false,
        });
    }

    Ok(equations)
}

/// Trims and removes a single trailing statement separator.
pub(crate) fn strip_separator(text: &str) -> &str {
    let text = text.trim();
    text.strip_suffix(';').unwrap_or(text).trim()
}

/// Splits `x`, `x[]` and `x[i]` into name and marker.
///
/// The marker is `None` without brackets, `Some(None)` for empty brackets and
/// `Some(Some(index))` otherwise.
fn parse_state(text: &str) -> Option<(&str, Option<Option<&str>>)> {
    match text.find('[') {
        None => is_identifier(text).then_some((text, None)),
        Some(open) => {
            let name = text[..open].trim();
            let index = text[open + 1..].strip_suffix(']')?.trim();
            if !is_identifier(name) {
                return None;
            }
            if index.is_empty() {
                Some((name, Some(None)))
            } else if is_identifier(index) {
                Some((name, Some(Some(index))))
            } else {
                None
            }
        }
    }
}

pub(crate) fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// The variable a rate expression names, ignoring an index suffix.
///
/// `"v"` and `"v[i]"` both give `Some("v")`; any other expression gives `None`.
pub(crate) fn rate_name(rate: &str) -> Option<&str> {
    let rate = rate.trim();
    let name = match rate.find('[') {
        Some(open) if rate.ends_with(']') => rate[..open].trim(),
        Some(_) => return None,
        None => rate,
    };
    is_identifier(name).then_some(name)
}

/// Rewrites bracket indexing into plain identifiers.
///
/// `name[k]` with a literal `k` becomes `name__k`, and `name[index]` with the current loop
/// index becomes `name`, which the element-wise resolver maps to the current element.
///
/// # Errors
/// Returns the offending index text if it is neither a literal nor `loop_index`.
pub(crate) fn expand_indices(text: &str, loop_index: Option<&str>) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let (head, tail) = rest.split_at(open);
        out.push_str(head);

        let trailing_ident = out
            .trim_end()
            .chars()
            .rev()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .count();
        if trailing_ident == 0 {
            return Err(tail.to_string());
        }

        let close = tail.find(']').ok_or_else(|| tail.to_string())?;
        let index = tail[1..close].trim();
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);

        if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(ELEMENT_SEPARATOR);
            out.push_str(index);
        } else if Some(index) != loop_index {
            return Err(index.to_string());
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// True for `index` of the form `i+k` or `i-k`, with `i` the loop index and `k` a literal.
pub(crate) fn is_offset_index(index: &str, loop_index: Option<&str>) -> bool {
    let Some(loop_index) = loop_index else {
        return false;
    };
    let Some(offset) = index.trim().strip_prefix(loop_index) else {
        return false;
    };
    let Some(k) = offset.trim_start().strip_prefix(['+', '-']) else {
        return false;
    };
    let k = k.trim();
    !k.is_empty() && k.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Bindings {
        let mut bindings = Bindings::new();
        bindings.declare_scalar("t", 0.0);
        bindings.declare_scalar("y", 0.0);
        bindings.declare_scalar("k", 2.0);
        bindings.declare_array("x", vec![0.0; 5]);
        bindings.declare_array("v", vec![0.0; 5]);
        bindings
    }

    #[test]
    fn test_scalar_equation() {
        let eqs = normalize("p", &[RawEquation::new("  y ", " -k*y; ")], &registry()).unwrap();
        assert_eq!(
            eqs,
            vec![EquationSpec {
                state: "y".to_string(),
                index: None,
                rate: "-k*y".to_string(),
                followed_by_derivative: false,
            }]
        );
    }

    #[test]
    fn test_array_from_registry() {
        let eqs = normalize("p", &[RawEquation::new("x", "v")], &registry()).unwrap();
        assert_eq!(eqs[0].index.as_deref(), Some(SYNTHESIZED_INDEX));
        assert_eq!(eqs[0].rate, "v[_i]");
    }

    #[test]
    fn test_empty_marker_synthesizes_index() {
        let eqs = normalize("p", &[RawEquation::new("x[]", "v")], &registry()).unwrap();
        assert_eq!(eqs[0].state, "x");
        assert_eq!(eqs[0].index.as_deref(), Some(SYNTHESIZED_INDEX));
        assert_eq!(eqs[0].rate, "v[_i]");
    }

    #[test]
    fn test_explicit_index() {
        let eqs = normalize("p", &[RawEquation::new("x[j]", "-x[j]")], &registry()).unwrap();
        assert_eq!(eqs[0].index.as_deref(), Some("j"));
        assert_eq!(eqs[0].rate, "-x[j]");
    }

    #[test]
    fn test_malformed_equations() {
        let reg = registry();
        assert!(matches!(
            normalize("p", &[RawEquation::new("y[i]", "1")], &reg),
            Err(SpecError::InconsistentArrayUse { .. })
        ));
        assert!(matches!(
            normalize("p", &[RawEquation::new("w", "1")], &reg),
            Err(SpecError::UndeclaredVariable { .. })
        ));
        assert!(matches!(
            normalize(
                "p",
                &[RawEquation::new("y", "1"), RawEquation::new("y", "2")],
                &reg
            ),
            Err(SpecError::DuplicateState { .. })
        ));
        assert!(matches!(
            normalize("p", &[RawEquation::new("x[k]", "1")], &reg),
            Err(SpecError::IndexCollision { .. })
        ));
        assert!(matches!(
            normalize("p", &[RawEquation::new("y", " ; ")], &reg),
            Err(SpecError::Malformed { .. })
        ));
        assert!(matches!(
            normalize("p", &[RawEquation::new("x[1]", "1")], &reg),
            Err(SpecError::Malformed { .. })
        ));
    }

    #[test]
    fn test_rate_name() {
        assert_eq!(rate_name("v"), Some("v"));
        assert_eq!(rate_name(" v[_i] "), Some("v"));
        assert_eq!(rate_name("-x"), None);
        assert_eq!(rate_name("v + 1"), None);
    }

    #[test]
    fn test_expand_indices() {
        assert_eq!(
            expand_indices("x[i] - x[0] + y", Some("i")).unwrap(),
            "x - x__0 + y"
        );
        assert_eq!(expand_indices("a [ 2 ]*b", None).unwrap(), "a__2*b");
        assert_eq!(expand_indices("x[j]", Some("i")).unwrap_err(), "j");
        assert!(expand_indices("(1)[0]", None).is_err());
        assert_eq!(expand_indices("x[i+1] - x[i]", Some("i")).unwrap_err(), "i+1");
    }

    #[test]
    fn test_offset_index() {
        assert!(is_offset_index("i+1", Some("i")));
        assert!(is_offset_index(" i - 2 ", Some("i")));
        assert!(!is_offset_index("i+1", None));
        assert!(!is_offset_index("j+1", Some("i")));
        assert!(!is_offset_index("i*2", Some("i")));
        assert!(!is_offset_index("i+k", Some("i")));
        assert!(!is_offset_index("i", Some("i")));
    }
}
