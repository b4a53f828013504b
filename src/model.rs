//! A whole model: variables, pages and the state they share.
//!
//! The model owns the live [`Bindings`], the [`PageTable`] consulted when events are
//! registered, and the [`ErrorPrompt`] that decides how to recover from unhandled solver
//! failures. Pages compile independently (in parallel) and step in declared order; a
//! page that fails to compile is reported as a [`PageDiagnostic`] and left out, without
//! affecting its siblings.

use std::collections::HashMap;
use std::fmt;

use colored::Colorize;
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::{
    bindings::Bindings,
    dispatch::{ContinueOnError, ErrorPrompt},
    errors::{ModelError, PageError, SpecError},
    page::{OdePage, StepContext, StepReport},
    spec::ModelSpec,
};

/// Enabled flags of pages and events, keyed by name. Unknown keys are enabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageTable {
    enabled: HashMap<String, bool>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.enabled.get(key).copied().unwrap_or(true)
    }

    pub fn set(&mut self, key: &str, enabled: bool) {
        self.enabled.insert(key.to_string(), enabled);
    }

    pub fn clear(&mut self) {
        self.enabled.clear();
    }
}

/// A page that failed to compile.
#[derive(Debug, Clone, PartialEq)]
pub struct PageDiagnostic {
    pub page: String,
    pub error: SpecError,
}

impl fmt::Display for PageDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", "error:".red().bold(), self.error)
    }
}

/// Result of one model step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStep {
    /// One report per page, in declared order.
    pub reports: Vec<(String, StepReport)>,
    /// Pages that could not step at all.
    pub failures: Vec<(String, String)>,
}

/// A compiled model.
pub struct Model {
    name: String,
    bindings: Bindings,
    initial: Bindings,
    pages: Vec<OdePage>,
    diagnostics: Vec<PageDiagnostic>,
    table: PageTable,
    prompt: Box<dyn ErrorPrompt>,
    paused: bool,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "Model".cyan(), self.name.bold())?;
        for page in &self.pages {
            write!(f, "{page:?}")?;
        }
        for diagnostic in &self.diagnostics {
            writeln!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

impl Model {
    /// Compiles every page of `spec`.
    ///
    /// # Errors
    /// Returns a ModelError only if the variable declarations are invalid. Pages that do
    /// not compile are listed in [`diagnostics`](Self::diagnostics).
    pub fn compile(spec: &ModelSpec) -> Result<Self, ModelError> {
        let bindings = Bindings::from_spec(&spec.variables)?;

        let compiled: Vec<_> = spec
            .pages
            .par_iter()
            .map(|page| OdePage::compile(page, &bindings))
            .collect();

        let mut pages = Vec::with_capacity(compiled.len());
        let mut diagnostics = Vec::new();
        for (page, result) in spec.pages.iter().zip(compiled) {
            match result {
                Ok(compiled) => pages.push(compiled),
                Err(error) => {
                    warn!("skipping page '{}': {error}", page.name);
                    diagnostics.push(PageDiagnostic {
                        page: page.name.clone(),
                        error,
                    });
                }
            }
        }

        let mut table = PageTable::new();
        for page in &spec.pages {
            table.set(&page.name, page.enabled);
        }

        info!(
            "compiled model '{}': {} pages, {} diagnostics",
            spec.name,
            pages.len(),
            diagnostics.len()
        );
        Ok(Model {
            name: spec.name.clone(),
            initial: bindings.clone(),
            bindings,
            pages,
            diagnostics,
            table,
            prompt: Box::new(ContinueOnError),
            paused: false,
        })
    }

    /// Reads a JSON model document and compiles it.
    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        let spec: ModelSpec = serde_json::from_str(text)?;
        Self::compile(&spec)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the recovery policy for pages without error handlers.
    pub fn set_prompt(&mut self, prompt: impl ErrorPrompt + 'static) {
        self.prompt = Box::new(prompt);
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut Bindings {
        &mut self.bindings
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn diagnostics(&self) -> &[PageDiagnostic] {
        &self.diagnostics
    }

    /// The live ODE instances, in declared order.
    pub fn get_odes(&self) -> &[OdePage] {
        &self.pages
    }

    pub fn page(&self, name: &str) -> Option<&OdePage> {
        self.pages.iter().find(|page| page.name() == name)
    }

    pub fn page_mut(&mut self, name: &str) -> Option<&mut OdePage> {
        self.pages.iter_mut().find(|page| page.name() == name)
    }

    /// Set when code run by a page, or the prompt, asked to pause.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Enables or disables a page, both for stepping and for event registration.
    ///
    /// Takes effect immediately: the next [`step`](Self::step) skips a disabled page.
    /// The flag lasts until [`reset`](Self::reset), which restores the document's
    /// `enabled` flags.
    pub fn set_page_enabled(&mut self, name: &str, enabled: bool) {
        self.table.set(name, enabled);
        if let Some(page) = self.page_mut(name) {
            page.set_enabled(enabled);
        }
    }

    /// Initializes every page's engine from the current bindings.
    pub fn initialize(&mut self) -> Result<(), PageError> {
        for page in &mut self.pages {
            page.initialize_solver(&mut self.bindings, &self.table)?;
        }
        Ok(())
    }

    /// Steps every page once, in declared order.
    ///
    /// A page that cannot step is logged and skipped; the others still step.
    pub fn step(&mut self) -> ModelStep {
        let mut result = ModelStep::default();
        let Model {
            bindings,
            pages,
            table,
            prompt,
            paused,
            ..
        } = self;
        for page in pages.iter_mut() {
            let mut ctx = StepContext::new(bindings, table, &**prompt);
            match page.step(&mut ctx) {
                Ok(report) => {
                    *paused |= report.pause;
                    result.reports.push((page.name().to_string(), report));
                }
                Err(err) => {
                    error!("{err}");
                    result
                        .failures
                        .push((page.name().to_string(), err.to_string()));
                }
            }
        }
        if *paused {
            debug!("model '{}' paused", self.name);
        }
        result
    }

    /// Rebuilds every page's engine from scratch.
    pub fn reset_solvers(&mut self) -> Result<(), PageError> {
        for page in &mut self.pages {
            page.reset_solver(&mut self.bindings, &self.table)?;
        }
        Ok(())
    }

    /// Restores the initial variable values and the page table, then restarts the
    /// engines that were running.
    pub fn reset(&mut self) -> Result<(), PageError> {
        self.bindings = self.initial.clone();
        self.paused = false;
        self.table.clear();
        for page in &mut self.pages {
            self.table.set(page.name(), page.spec().enabled);
            page.set_enabled(page.spec().enabled);
        }
        for page in &mut self.pages {
            page.automatic_reset_solver(&mut self.bindings, &self.table)?;
        }
        debug!("model '{}' reset", self.name);
        Ok(())
    }

    /// Removes the dynamically added events of every page.
    pub fn remove_events(&mut self) {
        for page in &mut self.pages {
            page.remove_events(&self.table);
        }
    }
}
