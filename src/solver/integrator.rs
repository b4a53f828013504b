//! The stepping engine.
//!
//! An `Integrator` advances a state vector by a nominal step, split into internal steps
//! of the configured method. Adaptive methods size their internal steps with an
//! I-controller; fixed-step methods use the internal step size. Each internal step is
//! checked for events, recorded in the history and, for delay systems, reads delayed
//! states back from it.

use log::{debug, trace};

use super::{
    events::{Detection, EventSolver, ZenoVerdict},
    history::{hermite, History},
    methods::{self, Stages, Tableau},
    ErrorCode, OdeSystem, SolverFailure, SolverMethod,
};

/// Smallest internal step relative to the magnitude of the independent variable.
const MIN_STEP_FACTOR: f64 = 1e-12;

/// Step-size controller using an I-controller.
///
/// `h_new = safety * h * error^(-1/(order + 1))`, clamped to `[min_factor, max_factor]`.
#[derive(Debug, Clone)]
pub struct StepController {
    /// Safety factor (0.8-0.9 typical)
    pub safety: f64,
    /// Maximum growth factor per step
    pub max_factor: f64,
    /// Minimum reduction factor per step
    pub min_factor: f64,
}

impl Default for StepController {
    fn default() -> Self {
        Self {
            safety: 0.9,
            max_factor: 5.0,
            min_factor: 0.2,
        }
    }
}

impl StepController {
    /// Step size adjustment factor for a normalized error.
    pub fn compute_factor(&self, error: f64, order: u32) -> f64 {
        if error == 0.0 {
            return self.max_factor;
        }
        let factor = self.safety * error.powf(-1.0 / f64::from(order + 1));
        factor.clamp(self.min_factor, self.max_factor)
    }
}

/// Error tolerances: a component's error is scaled by `absolute + relative * |y|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub absolute: f64,
    pub relative: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            absolute: 1e-6,
            relative: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Work {
    stages: Stages,
    y1: Vec<f64>,
    f1: Vec<f64>,
    error: Vec<f64>,
    sample: Vec<f64>,
    delays: Vec<f64>,
    delayed: Vec<f64>,
}

impl Work {
    fn resize(&mut self, dimension: usize) {
        for buffer in [&mut self.y1, &mut self.f1, &mut self.error, &mut self.sample] {
            buffer.resize(dimension, 0.0);
        }
    }
}

struct Advance {
    dt: f64,
    stop: bool,
}

/// Numerical integrator for one page.
#[derive(Debug, Clone)]
pub struct Integrator {
    method: SolverMethod,
    step_size: f64,
    internal_step_size: Option<f64>,
    adaptive_step: f64,
    max_step: Option<f64>,
    max_number_of_steps: usize,
    history_length: Option<f64>,
    estimate_first_step: bool,
    acceleration_independent_of_velocity: bool,
    best_interpolation: bool,
    tolerances: Tolerances,
    controller: StepController,
    state: Vec<f64>,
    rate: Vec<f64>,
    history: History,
    events: EventSolver,
    breakpoints: Vec<f64>,
    maximum_delay: f64,
    failure: Option<SolverFailure>,
    initialized: bool,
    work: Work,
}

impl Integrator {
    /// An uninitialized integrator with default settings.
    pub fn new(method: SolverMethod) -> Self {
        Integrator {
            method,
            step_size: 0.1,
            internal_step_size: None,
            adaptive_step: 0.1,
            max_step: None,
            max_number_of_steps: 10_000,
            history_length: None,
            estimate_first_step: false,
            acceleration_independent_of_velocity: false,
            best_interpolation: false,
            tolerances: Tolerances::default(),
            controller: StepController::default(),
            state: Vec::new(),
            rate: Vec::new(),
            history: History::new(false),
            events: EventSolver::new(),
            breakpoints: Vec::new(),
            maximum_delay: 0.0,
            failure: None,
            initialized: false,
            work: Work::default(),
        }
    }

    pub fn method(&self) -> SolverMethod {
        self.method
    }

    fn tableau(&self) -> Option<&'static Tableau> {
        match self.method {
            SolverMethod::Euler => Some(&methods::EULER),
            SolverMethod::EulerRichardson => Some(&methods::EULER_RICHARDSON),
            SolverMethod::RungeKutta4 => Some(&methods::RK4),
            SolverMethod::CashKarp45 => Some(&methods::CASH_KARP),
            SolverMethod::DormandPrince5 => Some(&methods::DORMAND_PRINCE),
            SolverMethod::VelocityVerlet => None,
        }
    }

    /// Nominal step taken by [`step`](Self::step).
    pub fn set_step_size(&mut self, step_size: f64) {
        self.step_size = step_size;
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Internal step of fixed-step methods, and the first step of adaptive ones.
    /// Falls back to the nominal step size.
    pub fn set_internal_step_size(&mut self, internal_step_size: Option<f64>) {
        self.internal_step_size = internal_step_size;
    }

    /// The internal step currently in use.
    pub fn internal_step_size(&self) -> f64 {
        if self.method.is_adaptive() && self.initialized {
            self.adaptive_step
        } else {
            self.configured_internal_step()
        }
    }

    fn configured_internal_step(&self) -> f64 {
        self.internal_step_size
            .filter(|h| *h != 0.0 && h.is_finite())
            .unwrap_or(self.step_size)
            .abs()
    }

    pub fn set_tolerances(&mut self, absolute: f64, relative: f64) {
        self.tolerances = Tolerances { absolute, relative };
    }

    pub fn tolerances(&self) -> Tolerances {
        self.tolerances
    }

    pub fn set_max_step(&mut self, max_step: Option<f64>) {
        self.max_step = max_step.map(f64::abs).filter(|h| *h > 0.0);
    }

    pub fn set_max_number_of_steps(&mut self, steps: usize) {
        self.max_number_of_steps = steps.max(1);
    }

    /// Span of history kept behind the current time (at least the maximum delay).
    pub fn set_history_length(&mut self, length: Option<f64>) {
        self.history_length = length.map(f64::abs);
    }

    /// Hermite instead of linear interpolation for events and history.
    pub fn set_best_interpolation(&mut self, best: bool) {
        self.best_interpolation = best;
        self.history.set_hermite(best);
    }

    pub fn set_estimate_first_step(&mut self, estimate: bool) {
        self.estimate_first_step = estimate;
    }

    pub fn set_acceleration_independent_of_velocity(&mut self, independent: bool) {
        self.acceleration_independent_of_velocity = independent;
    }

    pub fn events(&self) -> &EventSolver {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventSolver {
        &mut self.events
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Current state, independent variable last.
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn independent_variable(&self) -> f64 {
        self.state.last().copied().unwrap_or(0.0)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Failure of the last step, if any.
    pub fn failure(&self) -> Option<&SolverFailure> {
        self.failure.as_ref()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.failure.as_ref().map(|failure| failure.code)
    }

    /// Interpolated value of component `index` at time `t`.
    pub fn historic_value(&self, index: usize, t: f64) -> Option<f64> {
        self.history.component(t, index)
    }

    /// Starts from `state`, discarding history and step size adaptation.
    pub fn initialize<S: OdeSystem + ?Sized>(&mut self, system: &mut S, state: &[f64]) {
        let n = state.len();
        self.state = state.to_vec();
        self.rate = vec![0.0; n];
        self.work.resize(n);
        self.history.clear();
        self.history.set_hermite(self.best_interpolation);
        self.events.reset_watch();
        self.failure = None;

        self.breakpoints.clear();
        self.maximum_delay = 0.0;
        if system.delay_count() > 0 {
            self.maximum_delay = system.maximum_delay(state).abs();
            let t = self.independent_variable();
            let mut delays = Vec::new();
            system.delays(state, &mut delays);
            for discontinuity in system.initial_condition_discontinuities() {
                for delay in &delays {
                    let time = discontinuity + delay.abs();
                    if time > t {
                        self.breakpoints.push(time);
                    }
                }
            }
            self.breakpoints.sort_by(f64::total_cmp);
            self.breakpoints.dedup();
        }

        evaluate(system, &self.history, &mut self.work, &self.state, &mut self.rate);
        self.adaptive_step = self.configured_internal_step();
        if self.method.is_adaptive() && self.estimate_first_step {
            self.adaptive_step = self.estimate_initial_step(system);
        }
        if let Some(max) = self.max_step {
            self.adaptive_step = self.adaptive_step.min(max);
        }

        let t = self.independent_variable();
        self.history.push(t, &self.state, &self.rate);
        self.initialized = true;
        debug!(
            "initialized {} at t = {t} with internal step {}",
            self.method, self.adaptive_step
        );
    }

    /// Continues from a state changed outside the solver, keeping history and step size.
    pub fn reinitialize<S: OdeSystem + ?Sized>(&mut self, system: &mut S, state: &[f64]) {
        let t = state.last().copied().unwrap_or(0.0);
        let rewound = self.history.end().is_some_and(|end| t < end);
        if !self.initialized || state.len() != self.state.len() || rewound {
            self.initialize(system, state);
            return;
        }
        self.state.copy_from_slice(state);
        self.failure = None;
        evaluate(system, &self.history, &mut self.work, &self.state, &mut self.rate);
        self.history.push(t, &self.state, &self.rate);
        trace!("reinitialized at t = {t}");
    }

    /// Reinitialization requested by the user: a fresh start from `state`.
    pub fn user_reinitialize<S: OdeSystem + ?Sized>(&mut self, system: &mut S, state: &[f64]) {
        self.initialize(system, state);
    }

    /// Advances by the nominal step size. Returns the time actually advanced.
    ///
    /// The step ends early if an event asks to stop or the engine fails; the failure is
    /// then available from [`failure`](Self::failure).
    pub fn step<S: OdeSystem + ?Sized>(&mut self, system: &mut S) -> f64 {
        self.failure = None;
        if !self.initialized {
            self.failure = Some(SolverFailure::new(
                ErrorCode::InternalSolverError,
                "solver stepped before initialization",
            ));
            return 0.0;
        }
        let start = self.independent_variable();
        let target = start + self.step_size;
        let direction = self.step_size.signum();
        let tiny = MIN_STEP_FACTOR * target.abs().max(1.0);

        let mut steps = 0;
        loop {
            let remaining = target - self.independent_variable();
            if remaining * direction <= tiny || self.step_size == 0.0 {
                break;
            }
            if steps >= self.max_number_of_steps {
                self.failure = Some(SolverFailure::new(
                    ErrorCode::TooManySteps,
                    format!(
                        "more than {} internal steps to advance from t = {start} by {}",
                        self.max_number_of_steps, self.step_size
                    ),
                ));
                break;
            }
            let h = self.next_internal_step(remaining.abs()) * direction;
            match self.advance(system, h) {
                Ok(advance) if advance.stop => break,
                Ok(_) => {}
                Err(failure) => {
                    self.failure = Some(failure);
                    break;
                }
            }
            steps += 1;
        }
        self.prune();
        self.independent_variable() - start
    }

    /// Takes a single full internal step, without sub-stepping to the nominal step size.
    pub fn max_step<S: OdeSystem + ?Sized>(&mut self, system: &mut S) -> f64 {
        self.failure = None;
        if !self.initialized {
            self.failure = Some(SolverFailure::new(
                ErrorCode::InternalSolverError,
                "solver stepped before initialization",
            ));
            return 0.0;
        }
        let direction = if self.step_size < 0.0 { -1.0 } else { 1.0 };
        let h = self.next_internal_step(f64::INFINITY) * direction;
        let dt = match self.advance(system, h) {
            Ok(advance) => advance.dt,
            Err(failure) => {
                self.failure = Some(failure);
                0.0
            }
        };
        self.prune();
        dt
    }

    /// Magnitude of the next internal step.
    fn next_internal_step(&mut self, remaining: f64) -> f64 {
        let mut h = if self.method.is_adaptive() {
            self.adaptive_step
        } else {
            self.configured_internal_step()
        };
        if let Some(max) = self.max_step {
            h = h.min(max);
        }
        h = h.min(remaining);

        let t = self.independent_variable();
        self.breakpoints.retain(|b| *b > t + MIN_STEP_FACTOR * t.abs().max(1.0));
        if let Some(next) = self.breakpoints.first() {
            h = h.min(next - t);
        }
        h
    }

    /// One internal step with event handling.
    fn advance<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        h: f64,
    ) -> Result<Advance, SolverFailure> {
        let n = self.state.len();
        let t0 = self.independent_variable();

        if !self.events.is_empty() {
            let state = &self.state;
            self.events
                .begin_step(&mut |id| system.zero_condition(id, state), t0)?;
        }

        let h = self.attempt(system, h)?;
        let t1 = t0 + h;
        self.work.y1[n - 1] = t1;
        if self.work.y1.iter().any(|y| !y.is_finite()) {
            return Err(SolverFailure::new(
                ErrorCode::InternalSolverError,
                format!("non-finite state at t = {t1}"),
            ));
        }
        evaluate_into(
            system,
            &self.history,
            &mut self.work.delays,
            &mut self.work.delayed,
            &self.work.y1,
            &mut self.work.f1,
        );

        let detection = if self.events.is_empty() {
            Detection::None
        } else {
            let hermite = self.best_interpolation;
            let (y0, f0) = (&self.state, &self.rate);
            let Work { y1, f1, sample, .. } = &mut self.work;
            self.events.detect(t0, t1, &mut |id, t| {
                interpolate_step(hermite, t0, y0, f0, t1, y1, f1, t, sample);
                system.zero_condition(id, sample)
            })?
        };

        match detection {
            Detection::None => {
                self.accept();
                Ok(Advance { dt: h, stop: false })
            }
            Detection::Found { index, t } => {
                if t != t1 {
                    let mut y = vec![0.0; n];
                    interpolate_step(
                        self.best_interpolation,
                        t0,
                        &self.state,
                        &self.rate,
                        t1,
                        &self.work.y1,
                        &self.work.f1,
                        t,
                        &mut y,
                    );
                    y[n - 1] = t;
                    let mut f = vec![0.0; n];
                    evaluate_into(
                        system,
                        &self.history,
                        &mut self.work.delays,
                        &mut self.work.delayed,
                        &y,
                        &mut f,
                    );
                    self.work.y1 = y;
                    self.work.f1 = f;
                }
                self.accept();
                let stop = self.handle_event(system, index)?;
                Ok(Advance { dt: t - t0, stop })
            }
        }
    }

    /// Proposes `y1` for a step of `h`, shrinking `h` for adaptive methods until the
    /// error estimate is acceptable. Returns the step actually taken.
    fn attempt<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        h: f64,
    ) -> Result<f64, SolverFailure> {
        let tableau = self.tableau();
        let history = &self.history;
        let Work {
            stages,
            y1,
            error,
            delays,
            delayed,
            ..
        } = &mut self.work;
        let mut rate = |y: &[f64], out: &mut [f64]| {
            evaluate_into(system, history, delays, delayed, y, out)
        };

        let Some(tableau) = tableau else {
            methods::velocity_verlet(
                &self.state,
                &self.rate,
                h,
                self.acceleration_independent_of_velocity,
                &mut rate,
                stages,
                y1,
            );
            return Ok(h);
        };

        if !self.method.is_adaptive() {
            methods::runge_kutta(
                tableau,
                &self.state,
                &self.rate,
                h,
                &mut rate,
                stages,
                y1,
                error,
            );
            return Ok(h);
        }

        let natural = self.adaptive_step;
        let mut h = h;
        loop {
            methods::runge_kutta(
                tableau,
                &self.state,
                &self.rate,
                h,
                &mut rate,
                stages,
                y1,
                error,
            );
            let norm = error_norm(&self.tolerances, &self.state, y1, error);
            if norm.is_nan() {
                return Err(SolverFailure::new(
                    ErrorCode::InternalSolverError,
                    format!(
                        "error estimate is not a number at t = {}",
                        self.state.last().copied().unwrap_or(0.0)
                    ),
                ));
            }
            let factor = self.controller.compute_factor(norm, tableau.order);
            if norm <= 1.0 {
                let next = h.abs() * factor;
                let next = if h.abs() < natural { next.max(natural) } else { next };
                self.adaptive_step = match self.max_step {
                    Some(max) => next.min(max),
                    None => next,
                };
                return Ok(h);
            }
            h *= factor;
            let t = self.state.last().copied().unwrap_or(0.0);
            if h.abs() < MIN_STEP_FACTOR * t.abs().max(1.0) {
                return Err(SolverFailure::new(
                    ErrorCode::DidNotConverge,
                    format!("step size underflow at t = {t} (error {norm:.3e})"),
                ));
            }
            trace!("rejected step at t = {t}, retrying with h = {h}");
        }
    }

    /// Moves the proposed point into the current state and records it.
    fn accept(&mut self) {
        std::mem::swap(&mut self.state, &mut self.work.y1);
        std::mem::swap(&mut self.rate, &mut self.work.f1);
        let t = self.independent_variable();
        self.history.push(t, &self.state, &self.rate);
    }

    /// Runs the action of a located event and applies the Zeno policy.
    fn handle_event<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        index: usize,
    ) -> Result<bool, SolverFailure> {
        let descriptor = self.events.descriptor(index).clone();
        let t = self.independent_variable();
        let mut stop = system.event_action(descriptor.id, &mut self.state);

        match self.events.record(t, descriptor.tolerance) {
            ZenoVerdict::Continue => {}
            ZenoVerdict::RunAction => {
                debug!("Zeno effect at t = {t}");
                stop |= system.zeno_action(&mut self.state);
            }
            ZenoVerdict::Fail => {
                return Err(SolverFailure::new(
                    ErrorCode::DidNotConverge,
                    format!(
                        "event '{}' keeps triggering at t = {t} (Zeno effect)",
                        descriptor.name
                    ),
                ))
            }
        }

        evaluate(system, &self.history, &mut self.work, &self.state, &mut self.rate);
        let t = self.independent_variable();
        self.history.push(t, &self.state, &self.rate);
        if descriptor.discontinuity {
            self.adaptive_step = self.configured_internal_step();
            if let Some(max) = self.max_step {
                self.adaptive_step = self.adaptive_step.min(max);
            }
        }
        Ok(stop)
    }

    fn prune(&mut self) {
        let keep = self.history_length.unwrap_or(0.0).max(self.maximum_delay);
        let t = self.independent_variable();
        self.history.prune(t - keep);
    }

    /// Initial step estimate for adaptive methods (Hairer, Norsett and Wanner).
    fn estimate_initial_step<S: OdeSystem + ?Sized>(&mut self, system: &mut S) -> f64 {
        let n = self.state.len();
        let fallback = self.configured_internal_step();
        if n < 2 {
            return fallback;
        }
        let scale = |y: f64| self.tolerances.absolute + self.tolerances.relative * y.abs();
        let rms = |values: &mut dyn Iterator<Item = f64>| {
            let sum: f64 = values.map(|v| v * v).sum();
            (sum / (n - 1) as f64).sqrt()
        };

        let d0 = rms(&mut self.state[..n - 1].iter().map(|y| y / scale(*y)));
        let d1 = rms(&mut self.state[..n - 1]
            .iter()
            .zip(&self.rate)
            .map(|(y, f)| f / scale(*y)));
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        let direction = if self.step_size < 0.0 { -1.0 } else { 1.0 };
        let sample: Vec<f64> = self
            .state
            .iter()
            .zip(&self.rate)
            .map(|(y, f)| y + direction * h0 * f)
            .collect();
        let mut f1 = vec![0.0; n];
        evaluate(system, &self.history, &mut self.work, &sample, &mut f1);
        let d2 = rms(&mut self.state[..n - 1]
            .iter()
            .zip(f1.iter().zip(&self.rate))
            .map(|(y, (f1, f0))| (f1 - f0) / scale(*y)))
            / h0;

        let order = self.tableau().map_or(4, |tableau| tableau.order);
        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(1.0 / f64::from(order + 1))
        };
        let estimate = (100.0 * h0).min(h1);
        if estimate.is_finite() && estimate > 0.0 {
            estimate
        } else {
            fallback
        }
    }
}

/// RMS of the error over every component but the independent variable.
fn error_norm(tolerances: &Tolerances, y0: &[f64], y1: &[f64], error: &[f64]) -> f64 {
    let n = y0.len().saturating_sub(1);
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = (0..n)
        .map(|j| {
            let scale = tolerances.absolute + tolerances.relative * y0[j].abs().max(y1[j].abs());
            // zero tolerance accepts only an exact step
            if scale == 0.0 {
                return if error[j] == 0.0 { 0.0 } else { f64::INFINITY };
            }
            let e = error[j] / scale;
            e * e
        })
        .sum();
    (sum / n as f64).sqrt()
}

/// Interpolates the state at `t` inside the step `[t0, t1]`.
#[allow(clippy::too_many_arguments)]
fn interpolate_step(
    hermite_interpolation: bool,
    t0: f64,
    y0: &[f64],
    f0: &[f64],
    t1: f64,
    y1: &[f64],
    f1: &[f64],
    t: f64,
    out: &mut [f64],
) {
    let dt = t1 - t0;
    let s = if dt == 0.0 { 0.0 } else { (t - t0) / dt };
    for j in 0..out.len() {
        out[j] = if hermite_interpolation {
            hermite(s, dt, y0[j], f0[j], y1[j], f1[j])
        } else {
            y0[j] + s * (y1[j] - y0[j])
        };
    }
    if let Some(last) = out.last_mut() {
        *last = t;
    }
}

fn evaluate<S: OdeSystem + ?Sized>(
    system: &mut S,
    history: &History,
    work: &mut Work,
    y: &[f64],
    out: &mut [f64],
) {
    evaluate_into(system, history, &mut work.delays, &mut work.delayed, y, out);
}

/// Evaluates the rate at `y`, looking up delayed states first.
fn evaluate_into<S: OdeSystem + ?Sized>(
    system: &mut S,
    history: &History,
    delays: &mut Vec<f64>,
    delayed: &mut Vec<f64>,
    y: &[f64],
    out: &mut [f64],
) {
    let count = system.delay_count();
    if count == 0 {
        system.rate(y, &[], out);
        return;
    }

    let n = y.len();
    let t = y.last().copied().unwrap_or(0.0);
    delays.clear();
    system.delays(y, delays);
    delayed.resize(count * n, 0.0);
    for (j, chunk) in delayed.chunks_mut(n).enumerate() {
        let time = t - delays.get(j).copied().unwrap_or(0.0);
        let found = history.interpolate(time, chunk)
            || (history.end().is_some_and(|end| time > end) && history.extrapolate(time, chunk))
            || system.initial_condition(time, chunk);
        if !found {
            chunk.copy_from_slice(y);
        }
        chunk[n - 1] = time;
    }
    system.rate(y, delayed, out);
}
