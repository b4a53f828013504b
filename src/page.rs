//! Compiled ODE pages and their solver lifecycle.
//!
//! An [`OdePage`] owns everything compiled from one page of the document: the state
//! layout, the rate function, events, delays and error handlers, plus the engine that
//! advances them. Pages do not own the model's variables; every call that touches live
//! state borrows the [`Bindings`] (and the model's [`PageTable`]) from the caller.
//!
//! A step runs synchronously: apply settings, pack the bindings, reinitialize if needed,
//! advance, unpack, dispatch failures.
//!
//! # Example
//!
//! ```rust
//! use evalexpr_ode::prelude::*;
//!
//! let mut bindings = Bindings::new();
//! bindings.declare_scalar("x", 1.0);
//! bindings.declare_scalar("v", 0.0);
//! bindings.declare_scalar("t", 0.0);
//!
//! let spec = OdePageSpec::new(
//!     "oscillator",
//!     "t",
//!     0.1,
//!     "RK4",
//!     vec![RawEquation::new("x", "v"), RawEquation::new("v", "-x")],
//! );
//! let mut page = OdePage::compile(&spec, &bindings).unwrap();
//! let table = PageTable::new();
//!
//! let mut ctx = StepContext::new(&mut bindings, &table, &ContinueOnError);
//! let report = page.step(&mut ctx).unwrap();
//! assert!((report.advanced - 0.1).abs() < 1e-12);
//! assert!((bindings.scalar("x").unwrap() - 0.1f64.cos()).abs() < 1e-6);
//! ```

use colored::Colorize;
use log::{debug, error, trace};

use crate::{
    backends::vector::Vector,
    bindings::{Bindings, Value},
    delay::CompiledDelays,
    dispatch::{Dispatcher, ErrorPrompt, HandlerScope},
    errors::{LayoutError, PageError, SpecError},
    events::{event_key, CompiledEvent},
    layout::{StateLayout, TemporaryView},
    model::PageTable,
    normalizer::{normalize, EquationSpec},
    pairing,
    rates::RateFunction,
    settings::CompiledSetting,
    solver::{ErrorCode, EventSolver, Integrator, OdeSystem, SolverMethod, Tolerances},
    spec::{OdePageSpec, Setting, ZeroCrossingSpec},
    statements::{Outcome, Program},
    symbols::SlotMap,
};

/// Borrowed model state a page steps against.
pub struct StepContext<'a> {
    pub bindings: &'a mut Bindings,
    pub table: &'a PageTable,
    pub prompt: &'a dyn ErrorPrompt,
}

impl<'a> StepContext<'a> {
    pub fn new(
        bindings: &'a mut Bindings,
        table: &'a PageTable,
        prompt: &'a dyn ErrorPrompt,
    ) -> Self {
        StepContext {
            bindings,
            table,
            prompt,
        }
    }
}

/// What one page step did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepReport {
    /// Advance of the independent variable.
    pub advanced: f64,
    /// Engine failure of this step, after dispatch.
    pub error: Option<ErrorCode>,
    /// Code run during the step asked to pause the simulation.
    pub pause: bool,
}

/// Solver settings of a page, re-evaluated whenever they are applied.
#[derive(Debug, Clone)]
struct PageSettings {
    step_size: CompiledSetting,
    internal_step_size: Option<CompiledSetting>,
    history_length: Option<CompiledSetting>,
    max_step: Option<CompiledSetting>,
    max_number_of_steps: Option<CompiledSetting>,
    absolute_tolerance: Option<CompiledSetting>,
    relative_tolerance: Option<CompiledSetting>,
    estimate_first_step: bool,
    best_interpolation: bool,
    acceleration_independent_of_velocity: bool,
}

impl PageSettings {
    fn compile(spec: &OdePageSpec, slots: &SlotMap) -> Result<Self, SpecError> {
        let page = spec.name.as_str();
        let optional = |element: &str, setting: &Option<Setting>| {
            CompiledSetting::compile_optional(page, element, setting.as_ref(), slots)
        };
        Ok(PageSettings {
            step_size: CompiledSetting::compile(page, "step size", &spec.step_size, slots)?,
            internal_step_size: optional("internal step size", &spec.internal_step_size)?,
            history_length: optional("history length", &spec.history_length)?,
            max_step: optional("maximum step", &spec.max_step)?,
            max_number_of_steps: optional("maximum number of steps", &spec.max_number_of_steps)?,
            absolute_tolerance: optional("absolute tolerance", &spec.absolute_tolerance)?,
            relative_tolerance: optional("relative tolerance", &spec.relative_tolerance)?,
            estimate_first_step: spec.estimate_first_step,
            best_interpolation: spec.use_best_interpolation,
            acceleration_independent_of_velocity: spec.acceleration_independent_of_velocity,
        })
    }

    fn absolute_tolerance(&self, scratch: &[f64]) -> Option<f64> {
        self.absolute_tolerance
            .as_ref()
            .map(|tolerance| tolerance.evaluate(scratch))
    }

    fn apply(&self, solver: &mut Integrator, scratch: &[f64]) {
        let evaluate = |setting: &Option<CompiledSetting>| {
            setting.as_ref().map(|setting| setting.evaluate(scratch))
        };
        solver.set_step_size(self.step_size.evaluate(scratch));
        solver.set_internal_step_size(evaluate(&self.internal_step_size));
        solver.set_history_length(evaluate(&self.history_length));
        solver.set_max_step(evaluate(&self.max_step));
        if let Some(steps) = evaluate(&self.max_number_of_steps) {
            if steps.is_finite() && steps >= 1.0 {
                solver.set_max_number_of_steps(steps.round() as usize);
            }
        }
        // Tolerances stay at the engine defaults unless an absolute one is given
        if let Some(absolute) = self.absolute_tolerance(scratch) {
            let relative = evaluate(&self.relative_tolerance).unwrap_or(absolute);
            solver.set_tolerances(absolute, relative);
        }
        solver.set_best_interpolation(self.best_interpolation);
        solver.set_estimate_first_step(self.estimate_first_step);
        solver.set_acceleration_independent_of_velocity(self.acceleration_independent_of_velocity);
    }
}

#[derive(Debug, Clone)]
struct ZenoAction {
    program: Program,
    stop_after_effect: bool,
}

/// Number of variables and of scratch slots they need.
fn shape(bindings: &Bindings) -> (usize, usize) {
    let slots = bindings
        .iter()
        .map(|(_, value)| match value {
            Value::Scalar(_) => 1,
            Value::Array(values) => values.len(),
        })
        .sum();
    (bindings.len(), slots)
}

/// Everything compiled for the current array lengths.
struct Compiled {
    layout: StateLayout,
    slots: SlotMap,
    view: TemporaryView,
    shape: (usize, usize),
    rates: RateFunction,
    preliminary: Program,
    events: Vec<CompiledEvent>,
    static_events: usize,
    dispatcher: Dispatcher,
    zeno: Option<ZenoAction>,
    delays: Option<CompiledDelays>,
    settings: PageSettings,
    scratch: Vec<f64>,
}

impl Compiled {
    fn build(
        spec: &OdePageSpec,
        equations: &[EquationSpec],
        dynamic_events: &[ZeroCrossingSpec],
        bindings: &Bindings,
    ) -> Result<Self, SpecError> {
        let page = spec.name.as_str();
        let layout = StateLayout::build(page, equations, bindings, &spec.independent_variable)?;

        let delay_spec = spec.delay.as_ref().filter(|_| spec.is_delayed());
        let mut slots = SlotMap::new(bindings);
        if let Some(delay) = delay_spec {
            slots = slots.with_delays(delay.delay_list.len(), &layout);
        }
        let view = layout
            .temporary_view(&slots)
            .map_err(|err| SpecError::Malformed {
                page: page.to_string(),
                element: "state layout".to_string(),
                reason: err.to_string(),
            })?;

        let rates = RateFunction::build(page, equations, &layout, &slots)?;
        let preliminary = Program::compile(page, "preliminary code", &spec.preliminary_code, &slots)?;

        let mut events = Vec::with_capacity(spec.events.len() + spec.discontinuities.len());
        for (i, event) in spec.events.iter().enumerate() {
            let key = event_key(page, "event", i, event.name.as_deref());
            events.push(CompiledEvent::compile(page, key, event, false, &slots)?);
        }
        for (i, discontinuity) in spec.discontinuities.iter().enumerate() {
            let key = event_key(page, "discontinuity", i, discontinuity.name.as_deref());
            events.push(CompiledEvent::compile(page, key, discontinuity, true, &slots)?);
        }
        let static_events = events.len();
        for (i, event) in dynamic_events.iter().enumerate() {
            let key = event_key(page, "dynamic", i, event.name.as_deref());
            events.push(CompiledEvent::compile(page, key, event, false, &slots)?);
        }

        let dispatcher = Dispatcher::compile(page, &spec.error_handlers, &slots)?;
        let zeno = spec
            .zeno_effect
            .as_ref()
            .map(|zeno| {
                Program::compile(page, "Zeno action", &zeno.action, &slots).map(|program| {
                    ZenoAction {
                        program,
                        stop_after_effect: zeno.stop_after_effect,
                    }
                })
            })
            .transpose()?;
        let delays = delay_spec
            .map(|delay| CompiledDelays::compile(page, delay, equations, &layout, &slots))
            .transpose()?;
        let settings = PageSettings::compile(spec, &slots)?;

        let mut scratch = vec![0.0; slots.len()];
        slots.fill(bindings, &mut scratch);
        trace!("page '{page}' slots: {}", slots.describe());

        Ok(Compiled {
            layout,
            slots,
            view,
            shape: shape(bindings),
            rates,
            preliminary,
            events,
            static_events,
            dispatcher,
            zeno,
            delays,
            settings,
            scratch,
        })
    }

    fn is_stale(&self, bindings: &Bindings) -> bool {
        self.layout.lengths_changed(bindings) || self.shape != shape(bindings)
    }

    fn rate(&mut self, state: &[f64], delayed: &[f64], out: &mut [f64]) {
        self.view.unpack(state, &mut self.scratch);
        if !delayed.is_empty() {
            self.slots.write_delayed(delayed, &mut self.scratch);
        }
        if !self.preliminary.is_empty() {
            self.preliminary.run(&mut self.scratch);
        }
        self.rates.evaluate(&self.scratch, out);
    }

    fn zero_condition(&mut self, event: usize, state: &[f64]) -> f64 {
        self.view.unpack(state, &mut self.scratch);
        self.events
            .get(event)
            .map_or(1.0, |event| event.condition(&self.scratch))
    }

    fn delays(&mut self, state: &[f64], out: &mut Vec<f64>) {
        if let Some(delays) = &self.delays {
            self.view.unpack(state, &mut self.scratch);
            delays.delays(&self.scratch, out);
        }
    }

    fn maximum_delay(&mut self, state: &[f64]) -> f64 {
        match &self.delays {
            Some(delays) => {
                self.view.unpack(state, &mut self.scratch);
                delays.maximum(&self.scratch)
            }
            None => 0.0,
        }
    }

    fn initial_condition(&mut self, time: f64, state: &mut [f64]) -> bool {
        let Some(delays) = &self.delays else {
            return false;
        };
        self.scratch[self.view.independent_slot()] = time;
        delays.initial_condition(&self.scratch, state);
        if let Some(last) = state.last_mut() {
            *last = time;
        }
        true
    }

    fn initial_condition_discontinuities(&self) -> Vec<f64> {
        self.delays
            .as_ref()
            .map(|delays| delays.discontinuities(&self.scratch))
            .unwrap_or_default()
    }

    /// Registers every enabled event with `solver`.
    fn register_events(&self, page: &str, table: &PageTable, solver: &mut EventSolver) {
        solver.clear();
        if table.is_enabled(page) {
            let absolute = self.settings.absolute_tolerance(&self.scratch);
            for (id, event) in self.events.iter().enumerate() {
                if event.is_enabled() && table.is_enabled(event.key()) {
                    solver.add(event.descriptor(id, &self.scratch, absolute));
                }
            }
        }
        solver.set_zeno_action(self.zeno.is_some());
        debug!("page '{page}': {} events registered", solver.len());
    }
}

#[derive(Debug, Clone, Copy)]
enum LiveCode {
    Event(usize),
    Zeno,
}

/// Runs an action on the live bindings at `state`, then re-packs `state`.
fn run_live(
    page: &str,
    compiled: &mut Compiled,
    code: LiveCode,
    bindings: &mut Bindings,
    state: &mut [f64],
) -> Outcome {
    let Compiled {
        layout,
        slots,
        scratch,
        events,
        zeno,
        ..
    } = compiled;
    if let Err(err) = layout.unpack_live(state, bindings) {
        error!("page '{page}': {err}");
        return Outcome::default();
    }
    slots.fill(bindings, scratch);
    let program = match code {
        LiveCode::Event(index) => events.get(index).map(CompiledEvent::action),
        LiveCode::Zeno => zeno.as_ref().map(|zeno| &zeno.program),
    };
    let outcome = program.map_or_else(Outcome::default, |program| {
        program.run_live(slots, scratch, bindings)
    });
    if let Err(err) = layout.pack(bindings, state) {
        error!("page '{page}': {err}");
    }
    outcome
}

/// The engine's view of a page during one call.
struct PageSystem<'a> {
    page: &'a str,
    compiled: &'a mut Compiled,
    bindings: &'a mut Bindings,
    pause: bool,
}

impl OdeSystem for PageSystem<'_> {
    fn dimension(&self) -> usize {
        self.compiled.layout.len()
    }

    fn rate(&mut self, state: &[f64], delayed: &[f64], out: &mut [f64]) {
        self.compiled.rate(state, delayed, out);
    }

    fn delay_count(&self) -> usize {
        self.compiled.delays.as_ref().map_or(0, CompiledDelays::count)
    }

    fn delays(&mut self, state: &[f64], out: &mut Vec<f64>) {
        self.compiled.delays(state, out);
    }

    fn maximum_delay(&mut self, state: &[f64]) -> f64 {
        self.compiled.maximum_delay(state)
    }

    fn initial_condition(&mut self, time: f64, state: &mut [f64]) -> bool {
        self.compiled.initial_condition(time, state)
    }

    fn initial_condition_discontinuities(&mut self) -> Vec<f64> {
        self.compiled.initial_condition_discontinuities()
    }

    fn zero_condition(&mut self, event: usize, state: &[f64]) -> f64 {
        self.compiled.zero_condition(event, state)
    }

    fn event_action(&mut self, event: usize, state: &mut [f64]) -> bool {
        let Some(stop) = self.compiled.events.get(event).map(CompiledEvent::stop_at_event) else {
            return false;
        };
        let outcome = run_live(
            self.page,
            self.compiled,
            LiveCode::Event(event),
            self.bindings,
            state,
        );
        self.pause |= outcome.pause;
        stop
    }

    fn zeno_action(&mut self, state: &mut [f64]) -> bool {
        let Some(stop) = self.compiled.zeno.as_ref().map(|zeno| zeno.stop_after_effect) else {
            return false;
        };
        let outcome = run_live(self.page, self.compiled, LiveCode::Zeno, self.bindings, state);
        self.pause |= outcome.pause;
        stop
    }
}

/// A compiled ODE page.
pub struct OdePage {
    spec: OdePageSpec,
    method: SolverMethod,
    equations: Vec<EquationSpec>,
    dynamic_events: Vec<ZeroCrossingSpec>,
    compiled: Compiled,
    solver: Option<Integrator>,
    enabled: bool,
    reinitialize_requested: bool,
    packed: Vec<f64>,
}

impl std::fmt::Debug for OdePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {}", "OdePage".cyan(), self.spec.name.bold())?;
        writeln!(f, "    {}: {}", "Method".cyan(), self.method)?;
        writeln!(f, "    {}: {}", "Enabled".cyan(), self.enabled)?;
        write!(f, "    {}: {:?}", "Layout".cyan(), self.compiled.layout)?;
        write!(f, "    {}: {:?}", "Rates".cyan(), self.compiled.rates)?;
        writeln!(
            f,
            "    {}: [{}]",
            "Events".cyan(),
            self.compiled
                .events
                .iter()
                .map(CompiledEvent::key)
                .collect::<Vec<_>>()
                .join(", ")
        )?;
        writeln!(
            f,
            "    {}: {}",
            "Initialized".cyan(),
            self.solver.is_some()
        )
    }
}

impl OdePage {
    /// Compiles `spec` against the variables declared in `bindings`.
    ///
    /// # Errors
    /// Returns the first SpecError of the page: malformed or undeclared states,
    /// unpaired equations under a Verlet method, expressions that fail to compile,
    /// delays without a usable pre-history.
    pub fn compile(spec: &OdePageSpec, bindings: &Bindings) -> Result<Self, SpecError> {
        let mut equations = normalize(&spec.name, &spec.equations, bindings)?;
        pairing::analyze(&mut equations);
        let method = SolverMethod::from_name(&spec.method);
        pairing::validate_for_method(&spec.name, &equations, method)?;

        let compiled = Compiled::build(spec, &equations, &[], bindings)?;
        debug!(
            "compiled page '{}': {} states, vector length {}, method {method}",
            spec.name,
            equations.len(),
            compiled.layout.len()
        );
        Ok(OdePage {
            spec: spec.clone(),
            method,
            equations,
            dynamic_events: Vec::new(),
            compiled,
            solver: None,
            enabled: spec.enabled,
            reinitialize_requested: false,
            packed: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &OdePageSpec {
        &self.spec
    }

    pub fn method(&self) -> SolverMethod {
        self.method
    }

    /// Canonical equations, with pairing marks.
    pub fn equations(&self) -> &[EquationSpec] {
        &self.equations
    }

    pub fn layout(&self) -> &StateLayout {
        &self.compiled.layout
    }

    pub fn is_delayed(&self) -> bool {
        self.compiled.delays.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabled pages skip their steps.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// True once the prompt chose to suppress this instance's failures.
    pub fn is_suppressed(&self) -> bool {
        self.compiled.dispatcher.is_suppressed()
    }

    fn ensure_current(&mut self, bindings: &Bindings) -> Result<(), SpecError> {
        if self.compiled.is_stale(bindings) {
            debug!("page '{}': variable shapes changed, rebuilding", self.spec.name);
            self.compiled =
                Compiled::build(&self.spec, &self.equations, &self.dynamic_events, bindings)?;
            self.solver = None;
        }
        Ok(())
    }

    fn layout_error(&self, source: LayoutError) -> PageError {
        PageError::Layout {
            page: self.spec.name.clone(),
            source,
        }
    }

    /// Creates and initializes the engine from the current bindings.
    ///
    /// Rebuilds the compiled page first if any array changed length. Events are
    /// registered here, gated by `table`.
    pub fn initialize_solver(
        &mut self,
        bindings: &mut Bindings,
        table: &PageTable,
    ) -> Result<(), PageError> {
        self.ensure_current(bindings)?;

        let mut state = vec![0.0; self.compiled.layout.len()];
        self.compiled
            .layout
            .pack(bindings, &mut state)
            .map_err(|source| self.layout_error(source))?;

        let OdePage {
            spec,
            method,
            compiled,
            ..
        } = self;
        compiled.slots.fill(bindings, &mut compiled.scratch);
        let mut solver = Integrator::new(*method);
        compiled.settings.apply(&mut solver, &compiled.scratch);
        compiled.register_events(&spec.name, table, solver.events_mut());

        let mut system = PageSystem {
            page: &spec.name,
            compiled,
            bindings,
            pause: false,
        };
        solver.initialize(&mut system, &state);

        self.packed = state;
        self.solver = Some(solver);
        self.reinitialize_requested = false;
        Ok(())
    }

    /// Advances by the nominal step size.
    ///
    /// # Errors
    /// Returns a PageError only if the page cannot be rebuilt for changed array lengths
    /// or the bindings lost a state. Solver failures are dispatched and reported in the
    /// [`StepReport`].
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<StepReport, PageError> {
        self.advance(ctx, false)
    }

    /// Takes one full internal step without sub-stepping.
    pub fn solver_step(&mut self, ctx: &mut StepContext<'_>) -> Result<StepReport, PageError> {
        self.advance(ctx, true)
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>, single: bool) -> Result<StepReport, PageError> {
        if !self.enabled {
            return Ok(StepReport::default());
        }
        self.ensure_current(ctx.bindings)?;
        let fresh = self.solver.is_none();
        if fresh {
            self.initialize_solver(ctx.bindings, ctx.table)?;
        }

        let OdePage {
            spec,
            compiled,
            solver,
            packed,
            reinitialize_requested,
            ..
        } = self;
        let page = spec.name.as_str();
        let Some(solver) = solver.as_mut() else {
            return Ok(StepReport::default());
        };
        let layout_error = |source| PageError::Layout {
            page: page.to_string(),
            source,
        };

        compiled.slots.fill(ctx.bindings, &mut compiled.scratch);
        compiled.settings.apply(solver, &compiled.scratch);

        if !fresh {
            packed.clear();
            packed.extend_from_slice(solver.state());
            let diverged = if spec.force_synchronization {
                compiled.layout.pack(ctx.bindings, packed).map(|()| true)
            } else {
                compiled.layout.pack_synchronized(ctx.bindings, packed)
            }
            .map_err(layout_error)?;

            let mut system = PageSystem {
                page,
                compiled: &mut *compiled,
                bindings: &mut *ctx.bindings,
                pause: false,
            };
            if std::mem::take(reinitialize_requested) {
                solver.user_reinitialize(&mut system, packed);
            } else if diverged {
                solver.reinitialize(&mut system, packed);
            }
        }

        let mut system = PageSystem {
            page,
            compiled: &mut *compiled,
            bindings: &mut *ctx.bindings,
            pause: false,
        };
        let advanced = if single {
            solver.max_step(&mut system)
        } else {
            solver.step(&mut system)
        };
        let mut report = StepReport {
            advanced,
            error: None,
            pause: system.pause,
        };

        compiled
            .layout
            .unpack_live(solver.state(), ctx.bindings)
            .map_err(layout_error)?;

        if let Some(failure) = solver.failure().cloned() {
            report.error = Some(failure.code);
            let dispatch = compiled.dispatcher.dispatch(
                page,
                &failure,
                HandlerScope {
                    slots: &compiled.slots,
                    scratch: &mut compiled.scratch,
                    bindings: &mut *ctx.bindings,
                },
                ctx.prompt,
            );
            report.pause |= dispatch.pause;
        }
        trace!(
            "page '{page}': advanced {advanced} to {}",
            solver.independent_variable()
        );
        Ok(report)
    }

    /// Asks the next step to restart the engine from the bindings, dropping its history.
    pub fn request_reinitialize(&mut self) {
        self.reinitialize_requested = true;
    }

    /// Rebuilds the page from scratch and reinitializes the engine.
    pub fn reset_solver(
        &mut self,
        bindings: &mut Bindings,
        table: &PageTable,
    ) -> Result<(), PageError> {
        self.compiled =
            Compiled::build(&self.spec, &self.equations, &self.dynamic_events, bindings)?;
        self.solver = None;
        self.initialize_solver(bindings, table)
    }

    /// Restarts an engine that is already running from the current bindings.
    ///
    /// Pages that were never initialized stay uninitialized and start on their first
    /// step.
    pub fn automatic_reset_solver(
        &mut self,
        bindings: &mut Bindings,
        table: &PageTable,
    ) -> Result<(), PageError> {
        if self.solver.is_some() {
            self.initialize_solver(bindings, table)?;
        }
        Ok(())
    }

    /// Selects the integration method by name.
    ///
    /// # Errors
    /// Returns `SpecError::VerletPairing` if the new method needs pairs the equations do
    /// not form; the page keeps its previous method.
    pub fn set_solver_class(&mut self, name: &str) -> Result<(), SpecError> {
        let method = SolverMethod::from_name(name);
        pairing::validate_for_method(&self.spec.name, &self.equations, method)?;
        if method != self.method {
            debug!("page '{}': method {} -> {method}", self.spec.name, self.method);
            self.method = method;
            self.solver = None;
        }
        Ok(())
    }

    /// Current packed state, independent variable last.
    pub fn get_state(&self) -> Option<&[f64]> {
        self.solver.as_ref().map(Integrator::state)
    }

    pub fn get_event_solver(&self) -> Option<&EventSolver> {
        self.solver.as_ref().map(Integrator::events)
    }

    pub fn get_independent_variable_value(&self) -> Option<f64> {
        self.solver.as_ref().map(Integrator::independent_variable)
    }

    pub fn get_internal_step_size(&self) -> Option<f64> {
        self.solver.as_ref().map(Integrator::internal_step_size)
    }

    /// Error tolerances the engine currently uses.
    pub fn get_tolerances(&self) -> Option<Tolerances> {
        self.solver.as_ref().map(Integrator::tolerances)
    }

    /// Interpolated value of scalar state `state` at time `t`.
    ///
    /// `None` if the engine is not running or `t` is outside the recorded history.
    pub fn historic_value(&self, state: &str, t: f64) -> Result<Option<f64>, PageError> {
        self.historic(state, None, t)
    }

    /// Interpolated value of element `k` of array state `state` at time `t`.
    pub fn historic_element(
        &self,
        state: &str,
        k: usize,
        t: f64,
    ) -> Result<Option<f64>, PageError> {
        self.historic(state, Some(k), t)
    }

    fn historic(&self, state: &str, k: Option<usize>, t: f64) -> Result<Option<f64>, PageError> {
        let layout = &self.compiled.layout;
        let (offset, stride) = layout.offset_of(state).ok_or_else(|| PageError::UnknownState {
            page: self.spec.name.clone(),
            name: state.to_string(),
        })?;
        let index = match (layout.array_len(state), k) {
            (None, None) => offset,
            (Some(len), Some(k)) if k < len => offset + stride * k,
            _ => return Ok(None),
        };
        Ok(self
            .solver
            .as_ref()
            .and_then(|solver| solver.historic_value(index, t)))
    }

    /// Compiles `event` and registers it alongside the declared events.
    pub fn add_event(&mut self, event: ZeroCrossingSpec, table: &PageTable) -> Result<(), SpecError> {
        let page = self.spec.name.as_str();
        let index = self.dynamic_events.len();
        let key = event_key(page, "dynamic", index, event.name.as_deref());
        let compiled = CompiledEvent::compile(page, key, &event, false, &self.compiled.slots)?;
        self.compiled.events.push(compiled);
        self.dynamic_events.push(event);
        if let Some(solver) = &mut self.solver {
            self.compiled
                .register_events(&self.spec.name, table, solver.events_mut());
        }
        Ok(())
    }

    /// Drops every dynamically added event.
    pub fn remove_events(&mut self, table: &PageTable) {
        self.dynamic_events.clear();
        self.compiled.events.truncate(self.compiled.static_events);
        if let Some(solver) = &mut self.solver {
            self.compiled
                .register_events(&self.spec.name, table, solver.events_mut());
        }
    }

    fn require_delays(&self) -> Result<(), PageError> {
        if self.compiled.delays.is_some() {
            Ok(())
        } else {
            Err(PageError::NoDelay(self.spec.name.clone()))
        }
    }

    fn check_state_len(&self, len: usize) -> Result<(), PageError> {
        let expected = self.compiled.layout.len();
        if len == expected {
            Ok(())
        } else {
            Err(self.layout_error(LayoutError::Length { expected, got: len }))
        }
    }

    /// Delays evaluated at the packed `state`.
    pub fn get_delays<V: Vector>(&mut self, state: &V) -> Result<Vec<f64>, PageError> {
        self.require_delays()?;
        self.check_state_len(state.len())?;
        let mut delays = Vec::new();
        self.compiled.delays(state.as_slice(), &mut delays);
        Ok(delays)
    }

    /// The declared delay bound, or the largest delay at the state in `bindings`.
    pub fn get_maximum_delay(&mut self, bindings: &Bindings) -> Result<f64, PageError> {
        self.require_delays()?;
        let mut state = vec![0.0; self.compiled.layout.len()];
        self.compiled
            .layout
            .pack(bindings, &mut state)
            .map_err(|source| self.layout_error(source))?;
        self.compiled.slots.fill(bindings, &mut self.compiled.scratch);
        Ok(self.compiled.maximum_delay(&state))
    }

    /// Fills `state` with the pre-history at `time`.
    pub fn get_initial_condition<V: Vector>(
        &mut self,
        time: f64,
        state: &mut V,
    ) -> Result<(), PageError> {
        self.require_delays()?;
        self.check_state_len(state.len())?;
        self.compiled.initial_condition(time, state.as_mut_slice());
        Ok(())
    }

    pub fn get_initial_condition_discontinuities(&self) -> Result<Vec<f64>, PageError> {
        self.require_delays()?;
        Ok(self.compiled.initial_condition_discontinuities())
    }
}

#[cfg(test)]
mod tests {
    use ode_solvers::{dopri5::Dopri5, System, Vector2};

    use super::*;
    use crate::{
        dispatch::{ContinueOnError, Recovery},
        solver::SolverFailure,
        spec::{DelaySpec, ErrorHandlerSpec, ErrorType, RawEquation, ZenoSpec},
    };

    fn oscillator_bindings() -> Bindings {
        let mut b = Bindings::new();
        b.declare_scalar("x", 1.0);
        b.declare_scalar("v", 0.0);
        b.declare_scalar("t", 0.0);
        b
    }

    fn oscillator(method: &str, step: f64) -> OdePageSpec {
        OdePageSpec::new(
            "oscillator",
            "t",
            step,
            method,
            vec![RawEquation::new("x", "v"), RawEquation::new("v", "-x")],
        )
    }

    fn run(page: &mut OdePage, b: &mut Bindings, table: &PageTable, steps: usize) -> Vec<StepReport> {
        (0..steps)
            .map(|_| {
                let mut ctx = StepContext::new(b, table, &ContinueOnError);
                page.step(&mut ctx).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_oscillator_layout_and_steps() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut page = OdePage::compile(&oscillator("RK4", 0.01), &b).unwrap();
        assert_eq!(page.layout().len(), 3);
        assert!(page.equations()[0].followed_by_derivative);

        run(&mut page, &mut b, &table, 100);
        let t = b.scalar("t").unwrap();
        assert!((t - 1.0).abs() < 1e-9);
        assert!((b.scalar("x").unwrap() - t.cos()).abs() < 1e-8);
        assert!((b.scalar("v").unwrap() + t.sin()).abs() < 1e-8);
        assert_eq!(page.get_state().unwrap().len(), 3);
        assert_eq!(page.get_independent_variable_value(), Some(t));
    }

    #[test]
    fn test_external_change_reinitializes() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut page = OdePage::compile(&oscillator("RK4", 0.01), &b).unwrap();
        run(&mut page, &mut b, &table, 1);

        b.set_scalar("x", 5.0);
        b.set_scalar("v", 0.0);
        run(&mut page, &mut b, &table, 1);
        let x = b.scalar("x").unwrap();
        assert!((x - 5.0 * 0.01f64.cos()).abs() < 1e-8);
    }

    #[test]
    fn test_force_synchronization_matches_compare_path() {
        let mut b1 = oscillator_bindings();
        let mut b2 = oscillator_bindings();
        let table = PageTable::new();
        let mut compare = OdePage::compile(&oscillator("RK4", 0.05), &b1).unwrap();
        let mut spec = oscillator("RK4", 0.05);
        spec.force_synchronization = true;
        let mut forced = OdePage::compile(&spec, &b2).unwrap();

        run(&mut compare, &mut b1, &table, 20);
        run(&mut forced, &mut b2, &table, 20);
        assert!((b1.scalar("x").unwrap() - b2.scalar("x").unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_verlet_requires_pairs() {
        let b = oscillator_bindings();
        let spec = OdePageSpec::new(
            "p",
            "t",
            0.1,
            "VelocityVerlet",
            vec![RawEquation::new("x", "-x"), RawEquation::new("v", "-x")],
        );
        assert!(matches!(
            OdePage::compile(&spec, &b),
            Err(SpecError::VerletPairing { position: 0, .. })
        ));

        let mut page = OdePage::compile(&oscillator("Euler", 0.1), &b).unwrap();
        page.set_solver_class("Verlet").unwrap();
        assert_eq!(page.method(), SolverMethod::VelocityVerlet);

        let spec = OdePageSpec {
            equations: vec![RawEquation::new("x", "-x"), RawEquation::new("v", "-x")],
            ..oscillator("Euler", 0.1)
        };
        let mut page = OdePage::compile(&spec, &b).unwrap();
        assert!(page.set_solver_class("verlet").is_err());
        assert_eq!(page.method(), SolverMethod::Euler);
    }

    #[test]
    fn test_disabled_page_does_not_step() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut page = OdePage::compile(&oscillator("RK4", 0.1), &b).unwrap();
        page.set_enabled(false);
        let reports = run(&mut page, &mut b, &table, 3);
        assert!(reports.iter().all(|r| r.advanced == 0.0));
        assert_eq!(b.scalar("t"), Some(0.0));
        assert!(page.get_state().is_none());
    }

    #[test]
    fn test_rebuild_on_array_length_change() {
        let mut b = Bindings::new();
        b.declare_array("x", vec![1.0; 3]);
        b.declare_scalar("k", 1.0);
        b.declare_scalar("t", 0.0);
        let table = PageTable::new();
        let spec = OdePageSpec::new("decay", "t", 0.1, "RK4", vec![RawEquation::new("x[]", "-k*x")]);
        let mut page = OdePage::compile(&spec, &b).unwrap();
        run(&mut page, &mut b, &table, 1);
        assert_eq!(page.layout().len(), 4);

        b.set_array("x", vec![2.0; 5]);
        run(&mut page, &mut b, &table, 1);
        assert_eq!(page.layout().len(), 6);
        let x = b.array("x").unwrap();
        assert_eq!(x.len(), 5);
        assert!((x[4] - 2.0 * (-0.1f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_bouncing_ball() {
        let mut b = Bindings::new();
        b.declare_scalar("y", 1.0);
        b.declare_scalar("v", 0.0);
        b.declare_scalar("t", 0.0);
        b.declare_scalar("bounces", 0.0);
        let table = PageTable::new();
        let mut spec = OdePageSpec::new(
            "ball",
            "t",
            0.05,
            "RK4",
            vec![RawEquation::new("y", "v"), RawEquation::new("v", "-9.81")],
        );
        spec.internal_step_size = Some(Setting::from(0.01));
        spec.events.push(ZeroCrossingSpec {
            name: Some("floor".to_string()),
            ..ZeroCrossingSpec::new("y", "v = -v; bounces = bounces + 1")
        });
        let mut page = OdePage::compile(&spec, &b).unwrap();

        let reports = run(&mut page, &mut b, &table, 20);
        assert!(reports.iter().all(|r| r.error.is_none()));
        assert_eq!(b.scalar("bounces"), Some(1.0));
        assert!(b.scalar("y").unwrap() >= -1e-6);

        let events = page.get_event_solver().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events.events()[0].name, "floor");
    }

    #[test]
    fn test_event_tolerance_falls_back_to_page_tolerance() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.absolute_tolerance = Some(Setting::from(1e-3));
        spec.events.push(ZeroCrossingSpec::new("x + 2", ""));
        spec.events.push(ZeroCrossingSpec {
            tolerance: Some(Setting::from(1e-9)),
            ..ZeroCrossingSpec::new("x + 3", "")
        });
        let mut page = OdePage::compile(&spec, &b).unwrap();
        page.initialize_solver(&mut b, &table).unwrap();
        let events = page.get_event_solver().unwrap().events();
        assert_eq!(events[0].tolerance, 1e-3);
        assert_eq!(events[1].tolerance, 1e-9);
    }

    #[test]
    fn test_tolerance_defaults() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let spec = oscillator("DormandPrince", 0.1);
        let mut page = OdePage::compile(&spec, &b).unwrap();
        assert_eq!(page.get_tolerances(), None);
        page.initialize_solver(&mut b, &table).unwrap();
        assert_eq!(
            page.get_tolerances(),
            Some(Tolerances {
                absolute: 1e-6,
                relative: 1e-6
            })
        );

        // a relative tolerance alone is ignored
        let mut spec = oscillator("DormandPrince", 0.1);
        spec.relative_tolerance = Some(Setting::from(1e-2));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        page.initialize_solver(&mut b, &table).unwrap();
        assert_eq!(page.get_tolerances().unwrap().relative, 1e-6);

        // the relative tolerance follows an absolute-only setting
        let mut spec = oscillator("DormandPrince", 0.1);
        spec.absolute_tolerance = Some(Setting::from(1e-3));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        page.initialize_solver(&mut b, &table).unwrap();
        assert_eq!(
            page.get_tolerances(),
            Some(Tolerances {
                absolute: 1e-3,
                relative: 1e-3
            })
        );

        spec.relative_tolerance = Some(Setting::from(1e-8));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        page.initialize_solver(&mut b, &table).unwrap();
        assert_eq!(page.get_tolerances().unwrap().relative, 1e-8);
    }

    #[test]
    fn test_solver_step_takes_one_internal_step() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.internal_step_size = Some(Setting::from(0.01));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        assert_eq!(page.get_internal_step_size(), None);

        let mut ctx = StepContext::new(&mut b, &table, &ContinueOnError);
        let report = page.solver_step(&mut ctx).unwrap();
        assert!((report.advanced - 0.01).abs() < 1e-12);
        assert_eq!(page.get_internal_step_size(), Some(0.01));
        assert!((b.scalar("t").unwrap() - 0.01).abs() < 1e-12);
        assert!((b.scalar("x").unwrap() - 0.01f64.cos()).abs() < 1e-10);

        let reports = run(&mut page, &mut b, &table, 1);
        assert!((reports[0].advanced - 0.1).abs() < 1e-12);
        assert!((b.scalar("t").unwrap() - 0.11).abs() < 1e-12);
    }

    #[test]
    fn test_adaptive_internal_step_size_changes() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("DormandPrince", 1.0);
        spec.internal_step_size = Some(Setting::from(1e-4));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        page.initialize_solver(&mut b, &table).unwrap();
        assert_eq!(page.get_internal_step_size(), Some(1e-4));
        run(&mut page, &mut b, &table, 1);
        assert!(page.get_internal_step_size().unwrap() > 1e-4);
    }

    #[test]
    fn test_request_reinitialize_drops_history() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.history_length = Some(Setting::from(10.0));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        run(&mut page, &mut b, &table, 5);
        assert!(page.historic_value("x", 0.2).unwrap().is_some());

        // an external change keeps the history
        b.set_scalar("v", b.scalar("v").unwrap() + 1e-3);
        run(&mut page, &mut b, &table, 1);
        assert!(page.historic_value("x", 0.2).unwrap().is_some());

        page.request_reinitialize();
        run(&mut page, &mut b, &table, 1);
        assert_eq!(page.historic_value("x", 0.2).unwrap(), None);
        assert!(page.historic_value("x", 0.65).unwrap().is_some());
        assert!((b.scalar("t").unwrap() - 0.7).abs() < 1e-9);
    }

    fn converging_events(zeno: Option<ZenoSpec>) -> (OdePage, Bindings) {
        let mut b = Bindings::new();
        b.declare_scalar("x", 0.0);
        b.declare_scalar("t", 0.0);
        b.declare_scalar("s", 0.1);
        b.declare_scalar("gap", 0.1);
        b.declare_scalar("hits", 0.0);
        b.declare_scalar("zenos", 0.0);
        let mut spec = OdePageSpec::new("tick", "t", 0.05, "RK4", vec![RawEquation::new("x", "1")]);
        // event times converge to 0.3 with halving intervals
        spec.events.push(ZeroCrossingSpec {
            tolerance: Some(Setting::from(1e-3)),
            ..ZeroCrossingSpec::new("1000 * (s - t)", "s = t + gap; gap = gap / 2; hits = hits + 1")
        });
        spec.zeno_effect = zeno;
        let page = OdePage::compile(&spec, &b).unwrap();
        (page, b)
    }

    #[test]
    fn test_zeno_action_runs_once() {
        let table = PageTable::new();
        let (mut page, mut b) = converging_events(Some(ZenoSpec {
            action: "gap = 1; zenos = zenos + 1".to_string(),
            stop_after_effect: false,
        }));
        let reports = run(&mut page, &mut b, &table, 10);
        assert!(reports.iter().all(|r| r.error.is_none()));
        assert_eq!(b.scalar("zenos"), Some(1.0));
        assert!(b.scalar("hits").unwrap() >= 9.0);
        assert!((b.scalar("t").unwrap() - 0.5).abs() < 1e-9);
        assert!(b.scalar("s").unwrap() > 1.0);
    }

    #[test]
    fn test_zeno_action_can_stop_the_step() {
        let table = PageTable::new();
        let (mut page, mut b) = converging_events(Some(ZenoSpec {
            action: "gap = 1; zenos = zenos + 1".to_string(),
            stop_after_effect: true,
        }));
        let reports = run(&mut page, &mut b, &table, 6);
        assert_eq!(b.scalar("zenos"), Some(1.0));
        let t = b.scalar("t").unwrap();
        assert!(t > 0.29 && t < 0.3, "{t}");
        assert!(reports.last().unwrap().advanced < 0.05);
    }

    #[test]
    fn test_page_table_gates_events() {
        let mut b = oscillator_bindings();
        let mut table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.events.push(ZeroCrossingSpec {
            name: Some("guard".to_string()),
            ..ZeroCrossingSpec::new("x + 2", "")
        });
        spec.discontinuities.push(ZeroCrossingSpec::new("v + 2", ""));
        let mut page = OdePage::compile(&spec, &b).unwrap();

        table.set("guard", false);
        page.initialize_solver(&mut b, &table).unwrap();
        let events = page.get_event_solver().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events.events()[0].name, "oscillator.discontinuity0");
        assert!(events.events()[0].discontinuity);

        table.set("oscillator", false);
        page.initialize_solver(&mut b, &table).unwrap();
        assert!(page.get_event_solver().unwrap().is_empty());
    }

    #[test]
    fn test_dynamic_events() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut page = OdePage::compile(&oscillator("RK4", 0.1), &b).unwrap();
        page.initialize_solver(&mut b, &table).unwrap();

        page.add_event(ZeroCrossingSpec::new("x + 2", ""), &table).unwrap();
        assert_eq!(page.get_event_solver().unwrap().len(), 1);
        assert_eq!(page.get_event_solver().unwrap().events()[0].name, "oscillator.dynamic0");

        page.remove_events(&table);
        assert!(page.get_event_solver().unwrap().is_empty());
    }

    #[test]
    fn test_error_handlers_run_on_failure() {
        let mut b = oscillator_bindings();
        b.declare_scalar("failures", 0.0);
        let table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.internal_step_size = Some(Setting::from(0.01));
        spec.max_number_of_steps = Some(Setting::from(2.0));
        spec.error_handlers.push(ErrorHandlerSpec {
            name: None,
            error_type: ErrorType::TooManySteps,
            code: "failures = failures + 1".to_string(),
            enabled: true,
        });
        let mut page = OdePage::compile(&spec, &b).unwrap();

        let reports = run(&mut page, &mut b, &table, 2);
        assert!(reports.iter().all(|r| r.error == Some(ErrorCode::TooManySteps)));
        assert_eq!(b.scalar("failures"), Some(2.0));
    }

    #[test]
    fn test_fallback_prompt_can_pause() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.internal_step_size = Some(Setting::from(0.01));
        spec.max_number_of_steps = Some(Setting::from(1.0));
        let mut page = OdePage::compile(&spec, &b).unwrap();

        let pause = |_: &str, failure: &SolverFailure| {
            assert_eq!(failure.code, ErrorCode::TooManySteps);
            Recovery::Pause
        };
        let mut ctx = StepContext::new(&mut b, &table, &pause);
        let report = page.step(&mut ctx).unwrap();
        assert!(report.pause);
    }

    #[test]
    fn test_historic_values() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("RK4", 0.1);
        spec.history_length = Some(Setting::from(10.0));
        spec.use_best_interpolation = true;
        let mut page = OdePage::compile(&spec, &b).unwrap();
        run(&mut page, &mut b, &table, 10);

        let x = page.historic_value("x", 0.55).unwrap().unwrap();
        assert!((x - 0.55f64.cos()).abs() < 1e-4);
        assert_eq!(page.historic_value("x", 5.0).unwrap(), None);
        assert!(page.historic_value("nope", 0.5).is_err());
        assert_eq!(page.historic_element("x", 0, 0.5).unwrap(), None);
    }

    #[test]
    fn test_delay_accessors() {
        let mut b = Bindings::new();
        b.declare_scalar("x", 3.0);
        b.declare_scalar("t", 0.0);
        let mut spec = OdePageSpec::new("dde", "t", 0.1, "RK4", vec![RawEquation::new("x", "-delayed(x, 0)")]);
        spec.delay = Some(DelaySpec {
            delay_list: vec!["x-1".to_string()],
            delay_maximum: None,
            initial_condition: vec!["1".to_string()],
            discontinuities: vec!["0".to_string()],
        });
        let mut page = OdePage::compile(&spec, &b).unwrap();
        assert!(page.is_delayed());

        assert_eq!(page.get_maximum_delay(&b).unwrap(), 2.0);
        b.set_scalar("x", -1.0);
        assert_eq!(page.get_maximum_delay(&b).unwrap(), 2.0);
        b.set_scalar("x", 1.5);
        assert_eq!(page.get_maximum_delay(&b).unwrap(), 0.5);

        assert_eq!(page.get_delays(&vec![4.0, 0.0]).unwrap(), vec![3.0]);
        let mut state = vec![0.0; 2];
        page.get_initial_condition(-0.5, &mut state).unwrap();
        assert_eq!(state, vec![1.0, -0.5]);
        assert_eq!(page.get_initial_condition_discontinuities().unwrap(), vec![0.0]);

        let plain = OdePage::compile(&oscillator("RK4", 0.1), &oscillator_bindings()).unwrap();
        assert!(matches!(
            plain.get_initial_condition_discontinuities(),
            Err(PageError::NoDelay(_))
        ));
    }

    #[test]
    fn test_delay_equation_steps() {
        // y'(t) = -y(t - 1) with y = 1 before t = 0: y(1) = 0
        let mut b = Bindings::new();
        b.declare_scalar("y", 1.0);
        b.declare_scalar("t", 0.0);
        let table = PageTable::new();
        let mut spec = OdePageSpec::new("dde", "t", 0.1, "RK4", vec![RawEquation::new("y", "-delayed(y, 0)")]);
        spec.delay = Some(DelaySpec {
            delay_list: vec!["1".to_string()],
            delay_maximum: None,
            initial_condition: vec!["1".to_string()],
            discontinuities: vec!["0".to_string()],
        });
        let mut page = OdePage::compile(&spec, &b).unwrap();
        run(&mut page, &mut b, &table, 10);
        assert!((b.scalar("t").unwrap() - 1.0).abs() < 1e-9);
        assert!(b.scalar("y").unwrap().abs() < 1e-9);
    }

    struct Oscillator;

    impl System<f64, Vector2<f64>> for Oscillator {
        fn system(&self, _t: f64, y: &Vector2<f64>, dy: &mut Vector2<f64>) {
            dy[0] = y[1];
            dy[1] = -y[0];
        }
    }

    #[test]
    fn test_dormand_prince_matches_reference() {
        let mut b = oscillator_bindings();
        let table = PageTable::new();
        let mut spec = oscillator("DormandPrince", 2.0);
        spec.absolute_tolerance = Some(Setting::from(1e-10));
        let mut page = OdePage::compile(&spec, &b).unwrap();
        run(&mut page, &mut b, &table, 1);

        let x = b.scalar("x").unwrap();
        let v = b.scalar("v").unwrap();
        assert!((x - 2f64.cos()).abs() < 1e-7);
        assert!((v + 2f64.sin()).abs() < 1e-7);

        let mut reference = Dopri5::new(Oscillator, 0.0, 2.0, 0.5, Vector2::new(1.0, 0.0), 1e-10, 1e-10);
        reference.integrate().unwrap();
        let at_end = reference
            .x_out()
            .iter()
            .position(|t| (t - 2.0).abs() < 1e-9)
            .unwrap();
        let expected = reference.y_out()[at_end];
        assert!((x - expected[0]).abs() < 1e-7);
        assert!((v - expected[1]).abs() < 1e-7);
    }
}
