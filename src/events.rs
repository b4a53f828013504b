//! Compiled events and discontinuities of a page.
//!
//! The zero condition is compiled as a scalar function over the page's scratch buffer,
//! which the page fills from a temporary unpack of the state, so evaluating it never
//! touches the model. The action is a compiled [`Program`] the page runs on the live
//! bindings.

use log::debug;

use crate::{
    builder::build_function,
    errors::SpecError,
    rates::{lower, parse_indexed},
    settings::CompiledSetting,
    solver::EventDescriptor,
    spec::{EventType, RootMethod, ZeroCrossingSpec},
    statements::Program,
    symbols::SlotMap,
    types::JITFunction,
};

/// Tolerance of events without their own and without a page absolute tolerance.
pub const DEFAULT_EVENT_TOLERANCE: f64 = 1e-6;

/// Key of an event in the page-enabled table: its name, or a positional key.
pub fn event_key(page: &str, kind: &str, index: usize, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => format!("{page}.{kind}{index}"),
    }
}

/// A compiled event or discontinuity.
#[derive(Clone)]
pub struct CompiledEvent {
    key: String,
    kind: EventType,
    method: RootMethod,
    iterations: usize,
    tolerance: Option<CompiledSetting>,
    condition: JITFunction,
    action: Program,
    stop_at_event: bool,
    enabled: bool,
    discontinuity: bool,
}

impl std::fmt::Debug for CompiledEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledEvent")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("method", &self.method)
            .field("iterations", &self.iterations)
            .field("tolerance", &self.tolerance)
            .field("action", &self.action)
            .field("stop_at_event", &self.stop_at_event)
            .field("enabled", &self.enabled)
            .field("discontinuity", &self.discontinuity)
            .finish()
    }
}

impl CompiledEvent {
    /// Compiles one event (or discontinuity) of `page`.
    ///
    /// # Errors
    /// Returns a SpecError naming the event if its condition, tolerance or action
    /// cannot be compiled.
    pub fn compile(
        page: &str,
        key: String,
        spec: &ZeroCrossingSpec,
        discontinuity: bool,
        slots: &SlotMap,
    ) -> Result<Self, SpecError> {
        let element = format!("zero condition of {key}");
        let node = parse_indexed(page, &element, spec.zero_condition.trim(), None)?;
        let expr = lower(page, &element, &node, slots, None)?;
        let condition = build_function(expr, slots.len())
            .map_err(|err| SpecError::expression(page, &element, err))?;

        let tolerance = CompiledSetting::compile_optional(
            page,
            &format!("tolerance of {key}"),
            spec.tolerance.as_ref(),
            slots,
        )?;
        let action = Program::compile(page, &format!("action of {key}"), &spec.action, slots)?;

        debug!("page '{page}': compiled {} {key}", if discontinuity { "discontinuity" } else { "event" });
        Ok(CompiledEvent {
            key,
            kind: spec.event_type,
            method: spec.method,
            iterations: spec.iterations,
            tolerance,
            condition,
            action,
            stop_at_event: spec.stop_at_event,
            enabled: spec.enabled,
            discontinuity,
        })
    }

    /// Key in the page-enabled table.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn event_type(&self) -> EventType {
        self.kind
    }

    pub fn root_method(&self) -> RootMethod {
        self.method
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Own tolerance, else the page absolute tolerance, else the default.
    pub fn tolerance(&self, scratch: &[f64], page_absolute: Option<f64>) -> f64 {
        self.tolerance
            .as_ref()
            .map(|tolerance| tolerance.evaluate(scratch))
            .or(page_absolute)
            .unwrap_or(DEFAULT_EVENT_TOLERANCE)
            .abs()
    }

    /// Zero condition at the state held in `scratch`.
    pub fn condition(&self, scratch: &[f64]) -> f64 {
        (self.condition)(scratch)
    }

    pub fn action(&self) -> &Program {
        &self.action
    }

    pub fn stop_at_event(&self) -> bool {
        self.stop_at_event
    }

    /// The enable flag of the document; the page-enabled table is consulted separately.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_discontinuity(&self) -> bool {
        self.discontinuity
    }

    /// Engine descriptor of this event under identifier `id`.
    pub fn descriptor(&self, id: usize, scratch: &[f64], page_absolute: Option<f64>) -> EventDescriptor {
        EventDescriptor {
            id,
            name: self.key.clone(),
            kind: self.kind,
            method: self.method,
            iterations: self.iterations,
            tolerance: self.tolerance(scratch, page_absolute),
            discontinuity: self.discontinuity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bindings::Bindings, spec::Setting};

    fn slots() -> (Bindings, SlotMap) {
        let mut b = Bindings::new();
        b.declare_scalar("y", 2.0);
        b.declare_scalar("v", -1.0);
        b.declare_scalar("t", 0.0);
        let slots = SlotMap::new(&b);
        (b, slots)
    }

    #[test]
    fn test_event_key() {
        assert_eq!(event_key("p", "event", 0, Some("bounce")), "bounce");
        assert_eq!(event_key("p", "event", 2, None), "p.event2");
        assert_eq!(event_key("p", "discontinuity", 1, Some("  ")), "p.discontinuity1");
    }

    #[test]
    fn test_tolerance_fallback() {
        let (b, slots) = slots();
        let mut scratch = vec![0.0; slots.len()];
        slots.fill(&b, &mut scratch);

        let spec = ZeroCrossingSpec::new("y", "v = -v");
        let event = CompiledEvent::compile("p", "e".to_string(), &spec, false, &slots).unwrap();
        assert_eq!(event.tolerance(&scratch, Some(1e-4)), 1e-4);
        assert_eq!(event.tolerance(&scratch, None), DEFAULT_EVENT_TOLERANCE);

        let spec = ZeroCrossingSpec {
            tolerance: Some(Setting::from("y/1000")),
            ..ZeroCrossingSpec::new("y", "")
        };
        let event = CompiledEvent::compile("p", "e".to_string(), &spec, true, &slots).unwrap();
        assert_eq!(event.tolerance(&scratch, Some(1e-4)), 0.002);
        assert!(event.is_discontinuity());
        assert_eq!(event.descriptor(3, &scratch, None).id, 3);
    }

    #[test]
    fn test_condition_and_action() {
        let (mut b, slots) = slots();
        let spec = ZeroCrossingSpec::new("y - 0.5", "v = -0.5*v");
        let event = CompiledEvent::compile("p", "e".to_string(), &spec, false, &slots).unwrap();

        let mut scratch = vec![0.0; slots.len()];
        slots.fill(&b, &mut scratch);
        assert_eq!(event.condition(&scratch), 1.5);

        event.action().run_live(&slots, &mut scratch, &mut b);
        assert_eq!(b.scalar("v"), Some(0.5));
    }

    #[test]
    fn test_bad_condition_names_event() {
        let (_, slots) = slots();
        let spec = ZeroCrossingSpec::new("(y + 1", "");
        let err = CompiledEvent::compile("p", "floor".to_string(), &spec, false, &slots)
            .unwrap_err();
        assert!(matches!(err, SpecError::Expression { ref element, .. } if element.contains("floor")));
    }
}
