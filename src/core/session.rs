// This module provides arena-based pipeline session management using the bumpalo crate.
// PipelineSession is the shared state threaded through one run of the canonicalizer and the
// lowering pipeline: it owns a reference to the arena allocator, interns symbol names
// (outlined function names, runtime entry points) so they can be handed out as `&'arena str`
// without cloning, collects diagnostics emitted by passes (severity, offending op, message)
// and gathers statistics. PipelineStats counts passes run, rewrite rules fired per rule name,
// ops created and erased, functions outlined and diagnostics emitted; its Display output is
// what the debug log prints at the end of a pipeline run. Interior mutability (RefCell)
// keeps the session shareable by `&` reference across passes.

//! Arena-based pipeline session management.
//!
//! All per-run bookkeeping shares the session lifetime, so passes only need
//! a `&PipelineSession` to record what they did.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

use crate::ir::module::OpId;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Remark,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Remark => write!(f, "remark"),
        }
    }
}

/// A message attached to an op.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub pass: &'static str,
    pub op: Option<OpId>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.pass)?;
        if let Some(op) = self.op {
            write!(f, " (op {})", op.index())?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Arena-based pipeline session.
pub struct PipelineSession<'arena> {
    /// Arena allocator for interned names.
    arena: &'arena Bump,

    stats: RefCell<PipelineStats>,

    diagnostics: RefCell<Vec<Diagnostic>>,

    /// String interning for symbol names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Pass currently running, used to tag diagnostics.
    current_pass: RefCell<&'static str>,
}

impl<'arena> PipelineSession<'arena> {
    /// Create a new session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(PipelineStats::default()),
            diagnostics: RefCell::new(Vec::new()),
            interned_strings: RefCell::new(HashMap::new()),
            current_pass: RefCell::new("pipeline"),
        }
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Mark the start of a pass.
    pub fn begin_pass(&self, name: &'static str) {
        *self.current_pass.borrow_mut() = name;
        self.stats.borrow_mut().passes_run += 1;
        log::debug!("Running pass {}", name);
    }

    pub fn current_pass(&self) -> &'static str {
        *self.current_pass.borrow()
    }

    /// Record a diagnostic and log it.
    pub fn emit(&self, severity: Severity, op: Option<OpId>, message: impl Into<String>) {
        let diag = Diagnostic {
            severity,
            pass: self.current_pass(),
            op,
            message: message.into(),
        };
        match severity {
            Severity::Error => log::error!("{}", diag),
            Severity::Warning => log::warn!("{}", diag),
            Severity::Remark => log::debug!("{}", diag),
        }
        self.stats.borrow_mut().diagnostics_emitted += 1;
        self.diagnostics.borrow_mut().push(diag);
    }

    pub fn error(&self, op: Option<OpId>, message: impl Into<String>) {
        self.emit(Severity::Error, op, message);
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow().clone()
    }

    /// First error recorded since `start` (an index into the diagnostic list).
    pub fn first_error_since(&self, start: usize) -> Option<Diagnostic> {
        self.diagnostics
            .borrow()
            .iter()
            .skip(start)
            .find(|d| d.severity == Severity::Error)
            .cloned()
    }

    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics.borrow().len()
    }

    /// Record a rewrite rule application.
    pub fn record_rule_fired(&self, rule: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.rewrites_applied += 1;
        *stats.rules_fired.entry(rule).or_insert(0) += 1;
    }

    pub fn record_ops_erased(&self, count: usize) {
        self.stats.borrow_mut().ops_erased += count;
    }

    pub fn record_ops_created(&self, count: usize) {
        self.stats.borrow_mut().ops_created += count;
    }

    pub fn record_function_outlined(&self, name: &str) {
        self.stats.borrow_mut().functions_outlined += 1;
        log::debug!("Outlined parallel loop body: {}", name);
    }

    /// Get pipeline statistics.
    pub fn stats(&self) -> PipelineStats {
        self.stats.borrow().clone()
    }
}

/// Pipeline statistics.
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    /// Number of passes run.
    pub passes_run: usize,

    /// Total rewrite applications.
    pub rewrites_applied: usize,

    /// Applications per rule name.
    pub rules_fired: HashMap<&'static str, usize>,

    pub ops_created: usize,

    pub ops_erased: usize,

    /// Parallel loop bodies outlined.
    pub functions_outlined: usize,

    pub diagnostics_emitted: usize,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline Statistics:")?;
        writeln!(f, "  Passes run: {}", self.passes_run)?;
        writeln!(f, "  Rewrites applied: {}", self.rewrites_applied)?;
        writeln!(f, "  Ops created: {}", self.ops_created)?;
        writeln!(f, "  Ops erased: {}", self.ops_erased)?;
        writeln!(f, "  Functions outlined: {}", self.functions_outlined)?;
        writeln!(f, "  Diagnostics: {}", self.diagnostics_emitted)?;

        if !self.rules_fired.is_empty() {
            writeln!(f, "  Rule breakdown:")?;
            let mut sorted: Vec<_> = self.rules_fired.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (rule, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", rule, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let arena = Bump::new();
        let session = PipelineSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.passes_run, 0);
        assert_eq!(stats.rewrites_applied, 0);
        assert!(session.diagnostics().is_empty());
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = PipelineSession::new(&arena);

        let s1 = session.intern_str("main_outlined");
        let s2 = session.intern_str("main_outlined");
        let s3 = session.intern_str("main_outlined_1");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_diagnostics_carry_pass_name() {
        let arena = Bump::new();
        let session = PipelineSession::new(&arena);

        session.begin_pass("lower-to-low-level");
        session.emit(Severity::Warning, None, "unused");
        let start = session.diagnostic_count();
        session.error(None, "unsupported type");

        let err = session.first_error_since(0).unwrap();
        assert_eq!(err.pass, "lower-to-low-level");
        assert_eq!(err.message, "unsupported type");
        assert!(session.first_error_since(start + 1).is_none());
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = PipelineSession::new(&arena);

        session.begin_pass("canonicalize");
        session.record_rule_fired("change-layout-load");
        session.record_rule_fired("change-layout-load");
        session.record_rule_fired("sign-cast-dim");
        session.record_function_outlined("f_outlined");

        let output = format!("{}", session.stats());
        assert!(output.contains("Passes run: 1"));
        assert!(output.contains("Rewrites applied: 3"));
        assert!(output.contains("change-layout-load: 2"));
        assert!(output.contains("Functions outlined: 1"));
    }
}
