//! Routing of runtime solver failures.
//!
//! A page with error handlers runs every enabled handler whose type matches the failure,
//! in declaration order. A page without handlers logs the failure and asks the model's
//! [`ErrorPrompt`] what to do; the answer comes back as a [`Recovery`] instead of a
//! blocking dialog.

use log::{debug, error};

use crate::{
    bindings::Bindings,
    errors::SpecError,
    events::event_key,
    solver::SolverFailure,
    spec::{ErrorHandlerSpec, ErrorType},
    statements::Program,
    symbols::SlotMap,
};

/// What the embedding application wants done after an unhandled failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recovery {
    /// Keep stepping and keep reporting.
    #[default]
    Continue,
    /// Keep stepping and stop reporting failures of this page instance.
    Suppress,
    /// Set the model's paused flag.
    Pause,
}

/// Decides how to recover from failures of pages without error handlers.
pub trait ErrorPrompt: Send + Sync {
    fn on_error(&self, page: &str, failure: &SolverFailure) -> Recovery;
}

/// Always continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnError;

impl ErrorPrompt for ContinueOnError {
    fn on_error(&self, _page: &str, _failure: &SolverFailure) -> Recovery {
        Recovery::Continue
    }
}

impl<F> ErrorPrompt for F
where
    F: Fn(&str, &SolverFailure) -> Recovery + Send + Sync,
{
    fn on_error(&self, page: &str, failure: &SolverFailure) -> Recovery {
        self(page, failure)
    }
}

#[derive(Debug, Clone)]
struct CompiledHandler {
    key: String,
    error_type: ErrorType,
    code: Program,
    enabled: bool,
}

/// Outcome of dispatching one failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Number of handlers that ran.
    pub handled: usize,
    /// A handler executed `pause()` or the prompt asked to pause.
    pub pause: bool,
}

/// The error handlers of one page instance.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    handlers: Vec<CompiledHandler>,
    suppressed: bool,
}

/// Live state handlers run against.
pub struct HandlerScope<'a> {
    pub slots: &'a SlotMap,
    pub scratch: &'a mut [f64],
    pub bindings: &'a mut Bindings,
}

impl Dispatcher {
    /// Compiles the handler code of `page`.
    pub fn compile(
        page: &str,
        handlers: &[ErrorHandlerSpec],
        slots: &SlotMap,
    ) -> Result<Self, SpecError> {
        let handlers = handlers
            .iter()
            .enumerate()
            .map(|(i, handler)| {
                let key = event_key(page, "handler", i, handler.name.as_deref());
                let code = Program::compile(page, &format!("error handler {key}"), &handler.code, slots)?;
                Ok(CompiledHandler {
                    key,
                    error_type: handler.error_type,
                    code,
                    enabled: handler.enabled,
                })
            })
            .collect::<Result<Vec<_>, SpecError>>()?;
        Ok(Dispatcher {
            handlers,
            suppressed: false,
        })
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// True once the prompt answered [`Recovery::Suppress`].
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Routes `failure` to the handlers, or to the prompt if there are none.
    pub fn dispatch(
        &mut self,
        page: &str,
        failure: &SolverFailure,
        scope: HandlerScope<'_>,
        prompt: &dyn ErrorPrompt,
    ) -> Dispatch {
        let mut result = Dispatch::default();

        if self.has_handlers() {
            let HandlerScope {
                slots,
                scratch,
                bindings,
            } = scope;
            let code = failure.code;
            slots.fill(bindings, scratch);
            for handler in &self.handlers {
                if !handler.enabled || !handler.error_type.matches(code) {
                    continue;
                }
                debug!("page '{page}': running error handler {} for {code}", handler.key);
                let outcome = handler.code.run_live(slots, scratch, bindings);
                result.handled += 1;
                result.pause |= outcome.pause;
            }
            return result;
        }

        if self.suppressed {
            return result;
        }
        error!("page '{page}': {failure}");
        match prompt.on_error(page, failure) {
            Recovery::Continue => {}
            Recovery::Suppress => {
                debug!("page '{page}': further solver errors suppressed");
                self.suppressed = true;
            }
            Recovery::Pause => result.pause = true,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::solver::ErrorCode;

    fn setup() -> (Bindings, SlotMap) {
        let mut b = Bindings::new();
        b.declare_scalar("count", 0.0);
        b.declare_scalar("total", 0.0);
        let slots = SlotMap::new(&b);
        (b, slots)
    }

    fn handler(error_type: ErrorType, code: &str) -> ErrorHandlerSpec {
        ErrorHandlerSpec {
            name: None,
            error_type,
            code: code.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_every_matching_handler_runs_in_order() {
        let (mut b, slots) = setup();
        let specs = [
            handler(ErrorType::AnyError, "count = count + 1; total = 10"),
            handler(ErrorType::EventNotFound, "total = 100"),
            handler(ErrorType::TooManySteps, "count = count + 1; total = total + 1"),
            ErrorHandlerSpec {
                enabled: false,
                ..handler(ErrorType::AnyError, "total = -1")
            },
        ];
        let mut dispatcher = Dispatcher::compile("p", &specs, &slots).unwrap();
        let mut scratch = vec![0.0; slots.len()];
        let failure = SolverFailure::new(ErrorCode::TooManySteps, "limit");

        let result = dispatcher.dispatch(
            "p",
            &failure,
            HandlerScope {
                slots: &slots,
                scratch: &mut scratch,
                bindings: &mut b,
            },
            &ContinueOnError,
        );
        assert_eq!(result, Dispatch { handled: 2, pause: false });
        assert_eq!(b.scalar("count"), Some(2.0));
        assert_eq!(b.scalar("total"), Some(11.0));
    }

    #[test]
    fn test_handler_can_pause() {
        let (mut b, slots) = setup();
        let specs = [handler(ErrorType::DidNotConverge, "pause()")];
        let mut dispatcher = Dispatcher::compile("p", &specs, &slots).unwrap();
        let mut scratch = vec![0.0; slots.len()];
        let failure = SolverFailure::new(ErrorCode::DidNotConverge, "zeno");
        let result = dispatcher.dispatch(
            "p",
            &failure,
            HandlerScope {
                slots: &slots,
                scratch: &mut scratch,
                bindings: &mut b,
            },
            &ContinueOnError,
        );
        assert!(result.pause);
    }

    #[test]
    fn test_fallback_asks_prompt_for_every_code() {
        let (mut b, slots) = setup();
        let mut dispatcher = Dispatcher::compile("p", &[], &slots).unwrap();
        let mut scratch = vec![0.0; slots.len()];
        let seen = Mutex::new(Vec::new());
        let prompt = |page: &str, failure: &SolverFailure| {
            seen.lock().unwrap().push((page.to_string(), failure.code));
            Recovery::Continue
        };

        for code in ErrorCode::ALL {
            let result = dispatcher.dispatch(
                "p",
                &SolverFailure::new(code, "failed"),
                HandlerScope {
                    slots: &slots,
                    scratch: &mut scratch,
                    bindings: &mut b,
                },
                &prompt,
            );
            assert_eq!(result, Dispatch::default());
        }
        let seen = seen.into_inner().unwrap();
        assert_eq!(
            seen.iter().map(|(_, code)| *code).collect::<Vec<_>>(),
            ErrorCode::ALL.to_vec()
        );
    }

    #[test]
    fn test_suppress_and_pause() {
        let (mut b, slots) = setup();
        let mut dispatcher = Dispatcher::compile("p", &[], &slots).unwrap();
        let mut scratch = vec![0.0; slots.len()];
        let failure = SolverFailure::new(ErrorCode::InternalSolverError, "boom");

        let pause = |_: &str, _: &SolverFailure| Recovery::Pause;
        let result = dispatcher.dispatch(
            "p",
            &failure,
            HandlerScope {
                slots: &slots,
                scratch: &mut scratch,
                bindings: &mut b,
            },
            &pause,
        );
        assert!(result.pause);
        assert!(!dispatcher.is_suppressed());

        let suppress = |_: &str, _: &SolverFailure| Recovery::Suppress;
        dispatcher.dispatch(
            "p",
            &failure,
            HandlerScope {
                slots: &slots,
                scratch: &mut scratch,
                bindings: &mut b,
            },
            &suppress,
        );
        assert!(dispatcher.is_suppressed());

        // Suppressed instances no longer consult the prompt
        let result = dispatcher.dispatch(
            "p",
            &failure,
            HandlerScope {
                slots: &slots,
                scratch: &mut scratch,
                bindings: &mut b,
            },
            &pause,
        );
        assert!(!result.pause);
    }
}
