//! The packed state vector of a page.
//!
//! A `StateLayout` fixes where every state component lives in the flat vector the solver
//! advances. Equations are visited in declared order: a scalar takes one slot, an array
//! takes one slot per element, and a pair of arrays marked "followed by derivative" is
//! interleaved element by element (`x0, v0, x1, v1, ...`). The independent variable always
//! takes the last slot.
//!
//! Pack, unpack and the slot queries all go through the same private visitor, so they
//! cannot disagree on order or grouping.

use std::collections::HashMap;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    bindings::Bindings,
    errors::{LayoutError, SpecError},
    normalizer::EquationSpec,
    symbols::SlotMap,
};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Scalar { state: usize },
    Array { state: usize, len: usize },
    Pair { first: usize, second: usize, len: usize },
}

/// Order and grouping of a page's state vector.
#[derive(Clone, PartialEq)]
pub struct StateLayout {
    states: Vec<String>,
    independent: String,
    segments: Vec<Segment>,
    offsets: HashMap<String, (usize, usize)>,
    len: usize,
}

impl std::fmt::Debug for StateLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut components = Vec::with_capacity(self.len);
        self.visit(|_, name, element| match element {
            Some(k) => components.push(format!("{name}[{k}]")),
            None => components.push(name.to_string()),
        });
        writeln!(f, "{{")?;
        writeln!(f, "    {}: [{}]", "Layout".cyan(), components.iter().join(", "))?;
        writeln!(f, "    {}: {}", "Length".cyan(), self.len)?;
        writeln!(f, "}}")
    }
}

impl StateLayout {
    /// Builds the layout for the current array lengths in `bindings`.
    ///
    /// # Errors
    /// Returns a SpecError if the independent variable is not a declared scalar distinct
    /// from every state, if a state no longer has the shape its equation declares, or if
    /// paired arrays differ in length.
    pub fn build(
        page: &str,
        equations: &[EquationSpec],
        bindings: &Bindings,
        independent: &str,
    ) -> Result<Self, SpecError> {
        if bindings.is_array(independent) != Some(false)
            || equations.iter().any(|eq| eq.state == independent)
        {
            return Err(SpecError::MissingIndependentVariable {
                page: page.to_string(),
                name: independent.to_string(),
            });
        }

        let array_len = |eq: &EquationSpec| -> Result<Option<usize>, SpecError> {
            match (eq.is_array(), bindings.is_array(&eq.state)) {
                (true, Some(true)) => Ok(bindings.array_len(&eq.state)),
                (false, Some(false)) => Ok(None),
                (_, None) => Err(SpecError::UndeclaredVariable {
                    page: page.to_string(),
                    name: eq.state.clone(),
                }),
                _ => Err(SpecError::InconsistentArrayUse {
                    page: page.to_string(),
                    state: eq.state.clone(),
                }),
            }
        };

        let mut segments = Vec::new();
        let mut i = 0;
        while i < equations.len() {
            let eq = &equations[i];
            let len = array_len(eq)?;
            let paired = eq.followed_by_derivative && i + 1 < equations.len();
            match (len, paired) {
                (Some(len), true) => {
                    let next = &equations[i + 1];
                    if array_len(next)? != Some(len) {
                        return Err(SpecError::PairLengthMismatch {
                            page: page.to_string(),
                            first: eq.state.clone(),
                            second: next.state.clone(),
                        });
                    }
                    segments.push(Segment::Pair {
                        first: i,
                        second: i + 1,
                        len,
                    });
                    i += 2;
                }
                (Some(len), false) => {
                    segments.push(Segment::Array { state: i, len });
                    i += 1;
                }
                // A scalar pair is already adjacent; interleaving changes nothing
                (None, _) => {
                    segments.push(Segment::Scalar { state: i });
                    i += 1;
                }
            }
        }

        let mut layout = StateLayout {
            states: equations.iter().map(|eq| eq.state.clone()).collect(),
            independent: independent.to_string(),
            segments,
            offsets: HashMap::new(),
            len: 0,
        };

        let mut offsets = HashMap::new();
        let mut len = 0;
        for segment in &layout.segments {
            match segment {
                Segment::Scalar { state } => {
                    offsets.insert(layout.states[*state].clone(), (len, 1));
                    len += 1;
                }
                Segment::Array { state, len: n } => {
                    offsets.insert(layout.states[*state].clone(), (len, 1));
                    len += n;
                }
                Segment::Pair { first, second, len: n } => {
                    offsets.insert(layout.states[*first].clone(), (len, 2));
                    offsets.insert(layout.states[*second].clone(), (len + 1, 2));
                    len += 2 * n;
                }
            }
        }
        layout.offsets = offsets;
        layout.len = len + 1;
        Ok(layout)
    }

    /// Calls `f(position, name, element)` for every vector slot in order.
    pub(crate) fn visit(&self, mut f: impl FnMut(usize, &str, Option<usize>)) {
        let mut position = 0;
        for segment in &self.segments {
            match segment {
                Segment::Scalar { state } => {
                    f(position, &self.states[*state], None);
                    position += 1;
                }
                Segment::Array { state, len } => {
                    for k in 0..*len {
                        f(position, &self.states[*state], Some(k));
                        position += 1;
                    }
                }
                Segment::Pair { first, second, len } => {
                    for k in 0..*len {
                        f(position, &self.states[*first], Some(k));
                        f(position + 1, &self.states[*second], Some(k));
                        position += 2;
                    }
                }
            }
        }
        f(position, &self.independent, None);
    }

    /// Vector length: array elements plus scalar states plus the independent variable.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// State names in equation order.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn independent_variable(&self) -> &str {
        &self.independent
    }

    /// Offset of a state's first component and the stride between its elements.
    pub fn offset_of(&self, name: &str) -> Option<(usize, usize)> {
        self.offsets.get(name).copied()
    }

    /// Array length a state was laid out with; `None` for scalars and unknown names.
    pub fn array_len(&self, name: &str) -> Option<usize> {
        let index = self.states.iter().position(|state| state == name)?;
        self.segments.iter().find_map(|segment| match segment {
            Segment::Array { state, len } if *state == index => Some(*len),
            Segment::Pair { first, second, len } if *first == index || *second == index => {
                Some(*len)
            }
            _ => None,
        })
    }

    /// True if any array state has a different length in `bindings` than in the layout.
    pub fn lengths_changed(&self, bindings: &Bindings) -> bool {
        self.segments.iter().any(|segment| match segment {
            Segment::Scalar { state } => bindings.is_array(&self.states[*state]) != Some(false),
            Segment::Array { state, len } => {
                bindings.array_len(&self.states[*state]) != Some(*len)
            }
            Segment::Pair { first, second, len } => {
                bindings.array_len(&self.states[*first]) != Some(*len)
                    || bindings.array_len(&self.states[*second]) != Some(*len)
            }
        })
    }

    fn check_len(&self, got: usize) -> Result<(), LayoutError> {
        if got == self.len {
            Ok(())
        } else {
            Err(LayoutError::Length {
                expected: self.len,
                got,
            })
        }
    }

    /// Copies the bound values of every state, then the independent variable, into `out`.
    pub fn pack(&self, bindings: &Bindings, out: &mut [f64]) -> Result<(), LayoutError> {
        self.check_len(out.len())?;
        let mut missing = None;
        self.visit(|position, name, element| match bindings.component(name, element) {
            Some(value) => out[position] = value,
            None => missing = missing.take().or(Some(component_name(name, element))),
        });
        missing.map_or(Ok(()), |name| Err(LayoutError::MissingValue(name)))
    }

    /// Like [`pack`](Self::pack), but reports whether any slot changed.
    ///
    /// Used to skip solver reinitialization when nothing outside the solver touched the
    /// state since the last step.
    pub fn pack_synchronized(
        &self,
        bindings: &Bindings,
        out: &mut [f64],
    ) -> Result<bool, LayoutError> {
        self.check_len(out.len())?;
        let mut changed = false;
        let mut missing = None;
        self.visit(|position, name, element| match bindings.component(name, element) {
            Some(value) => {
                let previous = out[position];
                if previous != value && !(previous.is_nan() && value.is_nan()) {
                    changed = true;
                }
                out[position] = value;
            }
            None => missing = missing.take().or(Some(component_name(name, element))),
        });
        missing.map_or(Ok(changed), |name| Err(LayoutError::MissingValue(name)))
    }

    /// Writes `state` back into the model's live bindings.
    pub fn unpack_live(&self, state: &[f64], bindings: &mut Bindings) -> Result<(), LayoutError> {
        self.check_len(state.len())?;
        let mut missing = None;
        self.visit(|position, name, element| {
            if !bindings.set_component(name, element, state[position]) {
                missing = missing.take().or(Some(component_name(name, element)));
            }
        });
        missing.map_or(Ok(()), |name| Err(LayoutError::MissingValue(name)))
    }

    /// Binds the layout to a slot map for side-effect free evaluation.
    pub fn temporary_view(&self, slots: &SlotMap) -> Result<TemporaryView, LayoutError> {
        let mut indices = vec![0; self.len];
        let mut missing = None;
        self.visit(|position, name, element| {
            match slots.slot(name).and_then(|slot| slot.component(element)) {
                Some(index) => indices[position] = index,
                None => missing = missing.take().or(Some(component_name(name, element))),
            }
        });
        match missing {
            Some(name) => Err(LayoutError::MissingValue(name)),
            None => Ok(TemporaryView { indices }),
        }
    }
}

fn component_name(name: &str, element: Option<usize>) -> String {
    match element {
        Some(k) => format!("{name}[{k}]"),
        None => name.to_string(),
    }
}

/// Unpacks state vectors into a page's scratch buffer instead of the live bindings.
///
/// Rates, zero conditions and delays are evaluated on this view, so evaluating them at
/// trial states never disturbs the model.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporaryView {
    indices: Vec<usize>,
}

impl TemporaryView {
    pub fn unpack(&self, state: &[f64], scratch: &mut [f64]) {
        for (value, &index) in state.iter().zip(&self.indices) {
            scratch[index] = *value;
        }
    }

    /// Scratch slot of the independent variable.
    pub fn independent_slot(&self) -> usize {
        self.indices.last().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizer::normalize, pairing, spec::RawEquation};

    fn layout_for(raw: &[RawEquation], bindings: &Bindings) -> StateLayout {
        let mut eqs = normalize("p", raw, bindings).unwrap();
        pairing::analyze(&mut eqs);
        StateLayout::build("p", &eqs, bindings, "t").unwrap()
    }

    #[test]
    fn test_scalar_layout_order() {
        let mut b = Bindings::new();
        b.declare_scalar("x", 1.0);
        b.declare_scalar("v", 2.0);
        b.declare_scalar("t", 0.5);

        let layout = layout_for(
            &[RawEquation::new("x", "v"), RawEquation::new("v", "-x")],
            &b,
        );
        let mut packed = vec![0.0; layout.len()];
        layout.pack(&b, &mut packed).unwrap();
        assert_eq!(packed, vec![1.0, 2.0, 0.5]);
        assert_eq!(layout.offset_of("v"), Some((1, 1)));
    }

    #[test]
    fn test_array_round_trip() {
        let mut b = Bindings::new();
        b.declare_array("x", vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        b.declare_array("v", vec![0.0; 5]);
        b.declare_scalar("t", 0.0);

        let layout = layout_for(&[RawEquation::new("x[]", "v")], &b);
        assert_eq!(layout.len(), 6);

        let mut packed = vec![0.0; layout.len()];
        layout.pack(&b, &mut packed).unwrap();
        assert_eq!(&packed[..5], &[1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut restored = b.clone();
        restored.set_array("x", vec![0.0; 5]);
        layout.unpack_live(&packed, &mut restored).unwrap();
        assert_eq!(restored, b);
    }

    #[test]
    fn test_pairs_are_interleaved() {
        let mut b = Bindings::new();
        b.declare_array("x", vec![1.0, 2.0]);
        b.declare_array("v", vec![10.0, 20.0]);
        b.declare_scalar("e", 7.0);
        b.declare_scalar("t", 0.0);

        let layout = layout_for(
            &[
                RawEquation::new("x", "v"),
                RawEquation::new("v", "-x"),
                RawEquation::new("e", "0"),
            ],
            &b,
        );
        let mut packed = vec![0.0; layout.len()];
        layout.pack(&b, &mut packed).unwrap();
        assert_eq!(packed, vec![1.0, 10.0, 2.0, 20.0, 7.0, 0.0]);
        assert_eq!(layout.offset_of("x"), Some((0, 2)));
        assert_eq!(layout.offset_of("v"), Some((1, 2)));
        assert_eq!(layout.offset_of("e"), Some((4, 1)));
    }

    #[test]
    fn test_pack_synchronized_detects_changes() {
        let mut b = Bindings::new();
        b.declare_scalar("y", 1.0);
        b.declare_scalar("t", 0.0);
        let layout = layout_for(&[RawEquation::new("y", "-y")], &b);

        let mut packed = vec![0.0; layout.len()];
        layout.pack(&b, &mut packed).unwrap();
        assert!(!layout.pack_synchronized(&b, &mut packed).unwrap());

        b.set_scalar("y", 2.0);
        assert!(layout.pack_synchronized(&b, &mut packed).unwrap());
        assert_eq!(packed[0], 2.0);
    }

    #[test]
    fn test_lengths_changed() {
        let mut b = Bindings::new();
        b.declare_array("x", vec![0.0; 3]);
        b.declare_scalar("t", 0.0);
        let layout = layout_for(&[RawEquation::new("x", "-x")], &b);
        assert!(!layout.lengths_changed(&b));
        b.set_array("x", vec![0.0; 4]);
        assert!(layout.lengths_changed(&b));
    }

    #[test]
    fn test_independent_variable_checks() {
        let mut b = Bindings::new();
        b.declare_scalar("y", 0.0);
        let eqs = normalize("p", &[RawEquation::new("y", "1")], &b).unwrap();
        assert!(matches!(
            StateLayout::build("p", &eqs, &b, "t"),
            Err(SpecError::MissingIndependentVariable { .. })
        ));
        assert!(matches!(
            StateLayout::build("p", &eqs, &b, "y"),
            Err(SpecError::MissingIndependentVariable { .. })
        ));
    }

    #[test]
    fn test_temporary_view() {
        let mut b = Bindings::new();
        b.declare_scalar("k", 3.0);
        b.declare_scalar("y", 1.0);
        b.declare_scalar("t", 0.0);
        let layout = layout_for(&[RawEquation::new("y", "-k*y")], &b);
        let slots = SlotMap::new(&b);
        let view = layout.temporary_view(&slots).unwrap();

        let mut scratch = vec![0.0; slots.len()];
        slots.fill(&b, &mut scratch);
        view.unpack(&[5.0, 2.0], &mut scratch);
        // k, t, y in name order
        assert_eq!(scratch, vec![3.0, 2.0, 5.0]);
        assert_eq!(view.independent_slot(), 1);
        assert_eq!(b.scalar("y"), Some(1.0));
    }
}
