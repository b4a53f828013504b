//! Compilation of a page's derivative vector.
//!
//! Rates are compiled into a single combined JIT function whose outputs follow the
//! [`StateLayout`] order exactly: element-wise for arrays, interleaved for pairs, and the
//! constant `1` for the independent variable last.

use colored::Colorize;
use evalexpr::Node;
use itertools::Itertools;

use crate::{
    builder::build_combined_function,
    convert::{build_ast, parse_expression},
    errors::SpecError,
    expr::Expr,
    layout::StateLayout,
    normalizer::{expand_indices, is_offset_index, EquationSpec},
    symbols::SlotMap,
    types::CombinedJITFunction,
};

/// Parses `text` after rewriting its bracket indexing for `loop_index`.
pub(crate) fn parse_indexed(
    page: &str,
    element: &str,
    text: &str,
    loop_index: Option<&str>,
) -> Result<Node, SpecError> {
    let expanded = expand_indices(text, loop_index).map_err(|index| {
        let (page, element) = (page.to_string(), element.to_string());
        if is_offset_index(&index, loop_index) {
            SpecError::NeighbourIndex {
                page,
                element,
                index,
            }
        } else {
            SpecError::UnsupportedIndex {
                page,
                element,
                index,
            }
        }
    })?;
    parse_expression(&expanded).map_err(|err| SpecError::expression(page, element, err))
}

/// Resolves a parsed expression for one array element (or scalar context).
pub(crate) fn lower(
    page: &str,
    element: &str,
    node: &Node,
    slots: &SlotMap,
    component: Option<usize>,
) -> Result<Expr, SpecError> {
    build_ast(node, &slots.scope(component))
        .map(|expr| *expr.simplify())
        .map_err(|err| SpecError::expression(page, element, err))
}

/// Compiles one expression per state into a function over every layout component.
///
/// `texts[i]` belongs to `equations[i]` and is expanded element-wise for array states.
/// With `with_clock`, the independent variable's slot gets the constant `1`; otherwise
/// the output stops before it.
pub(crate) fn compile_components(
    page: &str,
    label: &str,
    equations: &[EquationSpec],
    texts: &[&str],
    layout: &StateLayout,
    slots: &SlotMap,
    with_clock: bool,
) -> Result<(CombinedJITFunction, Vec<Expr>), SpecError> {
    let nodes = equations
        .iter()
        .zip(texts)
        .map(|(eq, text)| {
            let element = format!("{label} of {}", eq.state);
            parse_indexed(page, &element, text, eq.index.as_deref()).map(|node| (element, node))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut exprs = Vec::with_capacity(layout.len());
    let mut failure = None;
    let clock = layout.len() - 1;
    layout.visit(|position, name, component| {
        if failure.is_some() || position == clock {
            return;
        }
        let Some(i) = equations.iter().position(|eq| eq.state == name) else {
            return;
        };
        let (element, node) = &nodes[i];
        match lower(page, element, node, slots, component) {
            Ok(expr) => exprs.push(expr),
            Err(err) => failure = Some(err),
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    if with_clock {
        exprs.push(Expr::Const(1.0));
    }

    let function = build_combined_function(exprs.clone(), slots.len())
        .map_err(|err| SpecError::expression(page, label, err))?;
    Ok((function, exprs))
}

/// The compiled derivative function of a page.
#[derive(Clone)]
pub struct RateFunction {
    function: CombinedJITFunction,
    exprs: Vec<Expr>,
}

impl std::fmt::Debug for RateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{")?;
        writeln!(
            f,
            "    {}: [{}]",
            "Rates".cyan(),
            self.exprs.iter().map(|expr| expr.to_string()).join(", ")
        )?;
        writeln!(f, "}}")
    }
}

impl RateFunction {
    /// Compiles the rates of `equations` against `slots`.
    ///
    /// # Errors
    /// Returns a SpecError naming the state whose rate cannot be compiled.
    pub fn build(
        page: &str,
        equations: &[EquationSpec],
        layout: &StateLayout,
        slots: &SlotMap,
    ) -> Result<Self, SpecError> {
        let texts = equations
            .iter()
            .map(|eq| eq.rate.as_str())
            .collect::<Vec<_>>();
        let (function, exprs) =
            compile_components(page, "rate", equations, &texts, layout, slots, true)?;
        Ok(RateFunction { function, exprs })
    }

    /// Writes the derivative of every layout component into `out`.
    ///
    /// # Panics
    /// Panics if `scratch` is shorter than the slot map or `out` is not layout-sized.
    pub fn evaluate(&self, scratch: &[f64], out: &mut [f64]) {
        (self.function)(scratch, out)
    }

    /// The compiled rate expressions in layout order.
    pub fn expressions(&self) -> &[Expr] {
        &self.exprs
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}
