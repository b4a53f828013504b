//! Event location within a step.
//!
//! Every registered event has a zero condition `g(state)`. After a trial step the solver
//! classifies `g` at both ends, and for each event that triggers it locates the earliest
//! time where `|g| <= tolerance` by bisection or by the Illinois variant of the secant
//! method on the step's interpolant. The earliest event of the step wins.

use std::fmt;

use log::debug;

use crate::spec::{EventType, RootMethod};

use super::{ErrorCode, SolverFailure};

/// Engine-side view of one event or discontinuity.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDescriptor {
    /// Identifier passed back to [`super::OdeSystem`].
    pub id: usize,
    pub name: String,
    pub kind: EventType,
    pub method: RootMethod,
    pub iterations: usize,
    pub tolerance: f64,
    /// Discontinuities restart the step size controller after their action.
    pub discontinuity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Before,
    Hit,
    After,
}

impl EventDescriptor {
    /// Position of `g` relative to the event, given the value at the step start.
    fn side(&self, g0: f64, g: f64) -> Side {
        let tol = self.tolerance;
        let signed = match self.kind {
            EventType::CrossingEvent if g0 < 0.0 => -g,
            _ => g,
        };
        if signed.abs() <= tol {
            Side::Hit
        } else if signed > 0.0 {
            Side::Before
        } else {
            Side::After
        }
    }
}

/// Result of checking one trial step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Detection {
    None,
    /// Event `index` (into the registered list) happens at time `t`.
    Found { index: usize, t: f64 },
}

/// Zeno bookkeeping: repeated events in vanishing time.
#[derive(Debug, Clone, Default)]
struct ZenoWatch {
    last_time: Option<f64>,
    count: usize,
}

/// Events required in a row, each within tolerance of the previous, to invoke the
/// Zeno action.
const ZENO_EVENTS: usize = 3;
/// Without a Zeno action, this many such events fail the step.
const ZENO_LIMIT: usize = 100;

/// What the solver must do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZenoVerdict {
    Continue,
    RunAction,
    Fail,
}

/// The events registered with one integrator.
#[derive(Clone, Default)]
pub struct EventSolver {
    events: Vec<EventDescriptor>,
    zeno_action: bool,
    watch: ZenoWatch,
    g0: Vec<f64>,
}

impl fmt::Debug for EventSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSolver")
            .field("events", &self.events)
            .field("zeno_action", &self.zeno_action)
            .finish()
    }
}

impl EventSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every event and the Zeno action.
    pub fn clear(&mut self) {
        self.events.clear();
        self.zeno_action = false;
        self.watch = ZenoWatch::default();
    }

    pub fn add(&mut self, event: EventDescriptor) {
        self.events.push(event);
    }

    pub fn set_zeno_action(&mut self, present: bool) {
        self.zeno_action = present;
    }

    pub fn events(&self) -> &[EventDescriptor] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn descriptor(&self, index: usize) -> &EventDescriptor {
        &self.events[index]
    }

    /// Records the zero conditions at the start of a step.
    ///
    /// # Errors
    /// Returns ILLEGAL_EVENT_STATE if a state event is already violated.
    pub(crate) fn begin_step(
        &mut self,
        g: &mut dyn FnMut(usize) -> f64,
        t0: f64,
    ) -> Result<(), SolverFailure> {
        self.g0.clear();
        for event in &self.events {
            let value = g(event.id);
            if event.kind == EventType::StateEvent && event.side(value, value) == Side::After {
                return Err(SolverFailure::new(
                    ErrorCode::IllegalEventState,
                    format!(
                        "state event '{}' is violated at t = {t0} (value {value})",
                        event.name
                    ),
                ));
            }
            self.g0.push(value);
        }
        Ok(())
    }

    /// Finds the earliest event in the step `[t0, t1]`.
    ///
    /// `g(id, t)` evaluates the zero condition of event `id` on the step interpolant.
    ///
    /// # Errors
    /// Returns EVENT_NOT_FOUND if root finding does not converge.
    pub(crate) fn detect(
        &self,
        t0: f64,
        t1: f64,
        g: &mut dyn FnMut(usize, f64) -> f64,
    ) -> Result<Detection, SolverFailure> {
        let mut earliest: Option<(usize, f64)> = None;
        for (index, event) in self.events.iter().enumerate() {
            let g0 = self.g0.get(index).copied().unwrap_or_else(|| g(event.id, t0));
            let g1 = g(event.id, t1);
            let start = event.side(g0, g0);
            let end = event.side(g0, g1);

            let time = match (event.kind, start, end) {
                (EventType::StateEvent, Side::Hit, Side::After) => t0,
                (_, Side::Before, Side::Hit | Side::After) => {
                    locate(event, g0, t0, t1, &mut |t| g(event.id, t))?
                }
                _ => continue,
            };
            let earlier = match earliest {
                Some((_, best)) => (time - t0).abs() < (best - t0).abs(),
                None => true,
            };
            if earlier {
                earliest = Some((index, time));
            }
        }
        Ok(match earliest {
            Some((index, t)) => {
                debug!("event '{}' at t = {t}", self.events[index].name);
                Detection::Found { index, t }
            }
            None => Detection::None,
        })
    }

    /// Notes an event at `t` and decides whether the Zeno policy applies.
    pub(crate) fn record(&mut self, t: f64, tolerance: f64) -> ZenoVerdict {
        let close = self
            .watch
            .last_time
            .is_some_and(|last| (t - last).abs() < tolerance);
        self.watch.last_time = Some(t);
        self.watch.count = if close { self.watch.count + 1 } else { 1 };

        if self.zeno_action && self.watch.count >= ZENO_EVENTS {
            self.watch.count = 0;
            ZenoVerdict::RunAction
        } else if !self.zeno_action && self.watch.count >= ZENO_LIMIT {
            self.watch.count = 0;
            ZenoVerdict::Fail
        } else {
            ZenoVerdict::Continue
        }
    }

    /// Forgets the Zeno history, e.g. after a reinitialization.
    pub(crate) fn reset_watch(&mut self) {
        self.watch = ZenoWatch::default();
    }
}

/// Locates the earliest hit of `event` in `[a, b]`, where `g(a)` is before the event
/// and `g(b)` is not.
fn locate(
    event: &EventDescriptor,
    g0: f64,
    t0: f64,
    t1: f64,
    g: &mut dyn FnMut(f64) -> f64,
) -> Result<f64, SolverFailure> {
    let (mut a, mut b) = (t0, t1);
    let (mut ga, mut gb) = (g0, g(t1));
    let mut retained = 0i8;

    for _ in 0..event.iterations.max(1) {
        let mut m = match event.method {
            RootMethod::Secant if gb != ga => b - gb * (b - a) / (gb - ga),
            _ => 0.5 * (a + b),
        };
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if !(m > lo && m < hi) {
            m = 0.5 * (a + b);
        }
        if m == a || m == b {
            break;
        }

        let gm = g(m);
        match event.side(g0, gm) {
            Side::Hit => return Ok(m),
            Side::Before => {
                a = m;
                ga = gm;
                // Illinois: halve the stale endpoint after two updates on the same side
                if retained == -1 {
                    gb *= 0.5;
                }
                retained = -1;
            }
            Side::After => {
                b = m;
                gb = gm;
                if retained == 1 {
                    ga *= 0.5;
                }
                retained = 1;
            }
        }
    }

    match event.side(g0, g(b)) {
        Side::Hit => Ok(b),
        _ => Err(SolverFailure::new(
            ErrorCode::EventNotFound,
            format!(
                "event '{}' not located within {} iterations in [{t0}, {t1}]",
                event.name, event.iterations
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: EventType, method: RootMethod) -> EventDescriptor {
        EventDescriptor {
            id: 0,
            name: "e".to_string(),
            kind,
            method,
            iterations: 100,
            tolerance: 1e-9,
            discontinuity: false,
        }
    }

    fn solver(event: EventDescriptor) -> EventSolver {
        let mut solver = EventSolver::new();
        solver.add(event);
        solver
    }

    #[test]
    fn test_bisection_and_secant_find_root() {
        for method in [RootMethod::Bisection, RootMethod::Secant] {
            let mut events = solver(descriptor(EventType::StateEvent, method));
            // g(t) = 0.5 - t^2 on [0, 1], root at sqrt(0.5)
            events.begin_step(&mut |_| 0.5, 0.0).unwrap();
            let found = events.detect(0.0, 1.0, &mut |_, t| 0.5 - t * t).unwrap();
            match found {
                Detection::Found { index: 0, t } => {
                    assert!((0.5 - t * t).abs() <= 1e-9, "{method:?}: {t}")
                }
                other => panic!("{method:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_state_event_illegal_start() {
        let mut events = solver(descriptor(EventType::StateEvent, RootMethod::Bisection));
        let err = events.begin_step(&mut |_| -1.0, 2.0).unwrap_err();
        assert_eq!(err.code, ErrorCode::IllegalEventState);
    }

    #[test]
    fn test_positive_event_ignores_upward_crossing() {
        let mut events = solver(descriptor(EventType::PositiveEvent, RootMethod::Bisection));
        events.begin_step(&mut |_| -1.0, 0.0).unwrap();
        let found = events.detect(0.0, 1.0, &mut |_, t| 2.0 * t - 1.0).unwrap();
        assert_eq!(found, Detection::None);
    }

    #[test]
    fn test_crossing_event_both_directions() {
        let mut events = solver(descriptor(EventType::CrossingEvent, RootMethod::Bisection));
        events.begin_step(&mut |_| -1.0, 0.0).unwrap();
        let found = events.detect(0.0, 1.0, &mut |_, t| 2.0 * t - 1.0).unwrap();
        assert!(matches!(found, Detection::Found { t, .. } if (t - 0.5).abs() < 1e-9));
    }

    #[test]
    fn test_earliest_event_wins() {
        let mut events = EventSolver::new();
        events.add(descriptor(EventType::StateEvent, RootMethod::Bisection));
        events.add(EventDescriptor {
            id: 1,
            ..descriptor(EventType::StateEvent, RootMethod::Bisection)
        });
        events.begin_step(&mut |_| 1.0, 0.0).unwrap();
        let found = events
            .detect(0.0, 1.0, &mut |id, t| if id == 0 { 0.75 - t } else { 0.25 - t })
            .unwrap();
        assert!(matches!(found, Detection::Found { index: 1, .. }));
    }

    #[test]
    fn test_event_not_found_with_too_few_iterations() {
        let mut events = solver(EventDescriptor {
            iterations: 2,
            tolerance: 1e-12,
            ..descriptor(EventType::StateEvent, RootMethod::Bisection)
        });
        events.begin_step(&mut |_| 1.0, 0.0).unwrap();
        let err = events.detect(0.0, 1.0, &mut |_, t| 0.3 - t).unwrap_err();
        assert_eq!(err.code, ErrorCode::EventNotFound);
    }

    #[test]
    fn test_zeno_policy() {
        let mut events = EventSolver::new();
        events.set_zeno_action(true);
        assert_eq!(events.record(1.0, 1e-6), ZenoVerdict::Continue);
        assert_eq!(events.record(1.0, 1e-6), ZenoVerdict::Continue);
        assert_eq!(events.record(1.0, 1e-6), ZenoVerdict::RunAction);

        events.set_zeno_action(false);
        let verdicts: Vec<_> = (0..ZENO_LIMIT).map(|_| events.record(2.0, 1e-6)).collect();
        assert_eq!(verdicts.last(), Some(&ZenoVerdict::Fail));
        assert!(verdicts[..ZENO_LIMIT - 1]
            .iter()
            .all(|v| *v == ZenoVerdict::Continue));
    }
}
