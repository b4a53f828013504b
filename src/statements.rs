//! Compiled code blocks: event actions, error handlers and preliminary code.
//!
//! A block is a sequence of statements separated by `;` or newlines, with `//` line
//! comments. Each statement is either an assignment or `pause()`:
//!
//! ```text
//! v = -0.9*v          // scalar
//! x[0] = 0            // one element
//! x = x + dx          // every element of x, with bare array names read element-wise
//! pause()
//! ```
//!
//! Assignments run in order against a page's scratch buffer, so later statements see
//! earlier results. An element-wise assignment evaluates all elements before writing any.

use log::debug;

use crate::{
    bindings::Bindings,
    builder::build_combined_function,
    errors::SpecError,
    normalizer::is_identifier,
    rates::{lower, parse_indexed},
    symbols::SlotMap,
    types::CombinedJITFunction,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target<'a> {
    /// A scalar, or every element of an array with an optional loop index name.
    Whole(&'a str, Option<&'a str>),
    /// One literal element of an array.
    Element(&'a str, usize),
}

#[derive(Clone)]
enum Statement {
    Assign {
        target: String,
        slots: Vec<usize>,
        function: CombinedJITFunction,
    },
    Pause,
}

/// Result of running a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// `pause()` was executed.
    pub pause: bool,
}

/// A compiled code block.
#[derive(Clone, Default)]
pub struct Program {
    statements: Vec<Statement>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.statements.iter().map(|statement| match statement {
                Statement::Assign { target, .. } => format!("{target} = ..."),
                Statement::Pause => "pause()".to_string(),
            }))
            .finish()
    }
}

impl Program {
    /// Compiles `code` against the page's slot map.
    ///
    /// # Arguments
    /// * `page` - Page name, for error reports
    /// * `element` - What the code belongs to, e.g. `"action of event bounce"`
    /// * `code` - The statements
    /// * `slots` - Scratch layout the statements read and write
    ///
    /// # Errors
    /// Returns a SpecError for unreadable statements, undeclared targets and
    /// expressions that fail to compile.
    pub fn compile(
        page: &str,
        element: &str,
        code: &str,
        slots: &SlotMap,
    ) -> Result<Self, SpecError> {
        let mut statements = Vec::new();
        for text in split_statements(code) {
            let malformed = |reason: String| SpecError::Malformed {
                page: page.to_string(),
                element: element.to_string(),
                reason,
            };

            if is_pause(text) {
                statements.push(Statement::Pause);
                continue;
            }

            let (lhs, rhs) = text
                .split_once('=')
                .filter(|(_, rhs)| !rhs.starts_with('='))
                .ok_or_else(|| malformed(format!("'{text}' is not an assignment")))?;
            let target = parse_target(lhs.trim())
                .ok_or_else(|| malformed(format!("cannot assign to '{}'", lhs.trim())))?;

            let name = match target {
                Target::Whole(name, _) | Target::Element(name, _) => name,
            };
            let slot = slots.slot(name).ok_or_else(|| SpecError::UndeclaredVariable {
                page: page.to_string(),
                name: name.to_string(),
            })?;

            let (loop_index, components): (Option<&str>, Vec<(Option<usize>, usize)>) =
                match (target, slot.len) {
                    (Target::Whole(_, index), Some(len)) => (
                        index,
                        (0..len).map(|k| (Some(k), slot.offset + k)).collect(),
                    ),
                    (Target::Whole(_, None), None) => (None, vec![(None, slot.offset)]),
                    (Target::Element(_, k), Some(len)) if k < len => {
                        (None, vec![(None, slot.offset + k)])
                    }
                    (Target::Element(_, k), Some(len)) => {
                        return Err(malformed(format!(
                            "index {k} out of range for {name} (length {len})"
                        )))
                    }
                    _ => {
                        return Err(SpecError::InconsistentArrayUse {
                            page: page.to_string(),
                            state: name.to_string(),
                        })
                    }
                };

            let node = parse_indexed(page, element, rhs.trim(), loop_index)?;
            let exprs = components
                .iter()
                .map(|(component, _)| lower(page, element, &node, slots, *component))
                .collect::<Result<Vec<_>, _>>()?;
            let function = build_combined_function(exprs, slots.len())
                .map_err(|err| SpecError::expression(page, element, err))?;

            debug!("page '{page}': compiled {element}: {name} = {}", rhs.trim());
            statements.push(Statement::Assign {
                target: name.to_string(),
                slots: components.into_iter().map(|(_, slot)| slot).collect(),
                function,
            });
        }
        Ok(Program { statements })
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Runs every statement against `scratch`.
    pub fn run(&self, scratch: &mut [f64]) -> Outcome {
        let mut outcome = Outcome::default();
        for statement in &self.statements {
            match statement {
                Statement::Assign {
                    slots, function, ..
                } => {
                    let mut values = vec![0.0; slots.len()];
                    function(scratch, &mut values);
                    for (slot, value) in slots.iter().zip(values) {
                        scratch[*slot] = value;
                    }
                }
                Statement::Pause => outcome.pause = true,
            }
        }
        outcome
    }

    /// Runs the block and writes every assigned variable back into `bindings`.
    pub fn run_live(
        &self,
        slots: &SlotMap,
        scratch: &mut [f64],
        bindings: &mut Bindings,
    ) -> Outcome {
        let outcome = self.run(scratch);
        for target in self.targets() {
            slots.store(target, scratch, bindings);
        }
        outcome
    }

    /// Names of the variables the block assigns.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().filter_map(|statement| match statement {
            Statement::Assign { target, .. } => Some(target.as_str()),
            Statement::Pause => None,
        })
    }
}

fn split_statements(code: &str) -> impl Iterator<Item = &str> {
    code.lines()
        .map(|line| line.split_once("//").map_or(line, |(code, _)| code))
        .flat_map(|line| line.split(';'))
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn is_pause(text: &str) -> bool {
    text.strip_prefix("pause")
        .and_then(|rest| rest.trim().strip_prefix('('))
        .is_some_and(|rest| rest.trim() == ")")
}

fn parse_target(text: &str) -> Option<Target<'_>> {
    match text.find('[') {
        None => is_identifier(text).then_some(Target::Whole(text, None)),
        Some(open) => {
            let name = text[..open].trim();
            let index = text[open + 1..].strip_suffix(']')?.trim();
            if !is_identifier(name) {
                return None;
            }
            if index.is_empty() {
                Some(Target::Whole(name, None))
            } else if let Ok(k) = index.parse() {
                Some(Target::Element(name, k))
            } else {
                is_identifier(index).then_some(Target::Whole(name, Some(index)))
            }
        }
    }
}
