//! Delay-differential pages.
//!
//! A delayed page declares delay expressions, an optional bound on them, a pre-history
//! function of the independent variable and the times where that pre-history jumps. All
//! of it is compiled against the page's scratch buffer; the page unpacks the state it is
//! asked about into the buffer before calling in here.

use log::debug;

use crate::{
    builder::build_function,
    errors::SpecError,
    layout::StateLayout,
    normalizer::EquationSpec,
    rates::{compile_components, lower, parse_indexed},
    settings::CompiledSetting,
    spec::{DelaySpec, Setting},
    symbols::SlotMap,
    types::{CombinedJITFunction, JITFunction},
};

/// The compiled delay block of a page.
#[derive(Clone)]
pub struct CompiledDelays {
    delays: Vec<JITFunction>,
    maximum: Option<CompiledSetting>,
    initial_condition: CombinedJITFunction,
    initial_len: usize,
    discontinuities: Vec<CompiledSetting>,
}

impl std::fmt::Debug for CompiledDelays {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledDelays")
            .field("delays", &self.delays.len())
            .field("maximum", &self.maximum)
            .field("discontinuities", &self.discontinuities)
            .finish()
    }
}

impl CompiledDelays {
    /// Compiles the delay block of `page`.
    ///
    /// # Errors
    /// Returns `SpecError::MissingInitialCondition` if delays come without a pre-history,
    /// `SpecError::InitialConditionCount` if the pre-history does not give one entry per
    /// state, and expression errors naming the offending delay or entry.
    pub fn compile(
        page: &str,
        spec: &DelaySpec,
        equations: &[EquationSpec],
        layout: &StateLayout,
        slots: &SlotMap,
    ) -> Result<Self, SpecError> {
        if spec.initial_condition.is_empty() {
            return Err(SpecError::MissingInitialCondition {
                page: page.to_string(),
            });
        }
        if spec.initial_condition.len() != equations.len() {
            return Err(SpecError::InitialConditionCount {
                page: page.to_string(),
                expected: equations.len(),
                got: spec.initial_condition.len(),
            });
        }

        let delays = spec
            .delay_list
            .iter()
            .enumerate()
            .map(|(k, text)| {
                let element = format!("delay {k}");
                let node = parse_indexed(page, &element, text.trim(), None)?;
                let expr = lower(page, &element, &node, slots, None)?;
                build_function(expr, slots.len())
                    .map_err(|err| SpecError::expression(page, &element, err))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let maximum = CompiledSetting::compile_optional(
            page,
            "maximum delay",
            spec.delay_maximum.as_ref(),
            slots,
        )?;

        let texts = spec
            .initial_condition
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();
        let (initial_condition, exprs) = compile_components(
            page,
            "initial condition",
            equations,
            &texts,
            layout,
            slots,
            false,
        )?;

        let discontinuities = spec
            .discontinuities
            .iter()
            .enumerate()
            .map(|(k, text)| {
                CompiledSetting::compile(
                    page,
                    &format!("initial condition discontinuity {k}"),
                    &Setting::Expression(text.clone()),
                    slots,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "page '{page}': {} delays, {} pre-history discontinuities",
            delays.len(),
            discontinuities.len()
        );
        Ok(CompiledDelays {
            delays,
            maximum,
            initial_len: exprs.len(),
            initial_condition,
            discontinuities,
        })
    }

    /// Number of declared delays.
    pub fn count(&self) -> usize {
        self.delays.len()
    }

    /// Evaluates every delay, in declared order.
    pub fn delays(&self, scratch: &[f64], out: &mut Vec<f64>) {
        out.clear();
        out.extend(self.delays.iter().map(|delay| delay(scratch)));
    }

    /// The declared bound, or the largest delay magnitude at the state in `scratch`.
    pub fn maximum(&self, scratch: &[f64]) -> f64 {
        match &self.maximum {
            Some(bound) => bound.evaluate(scratch).abs(),
            None => self
                .delays
                .iter()
                .map(|delay| delay(scratch).abs())
                .fold(0.0, f64::max),
        }
    }

    /// Writes the pre-history at the time held in `scratch` into `state`.
    ///
    /// `state` is a full packed vector; every component but the independent variable is
    /// written.
    pub fn initial_condition(&self, scratch: &[f64], state: &mut [f64]) {
        let n = self.initial_len.min(state.len());
        (self.initial_condition)(scratch, &mut state[..n]);
    }

    pub fn discontinuities(&self, scratch: &[f64]) -> Vec<f64> {
        self.discontinuities
            .iter()
            .map(|time| time.evaluate(scratch))
            .collect()
    }
}
