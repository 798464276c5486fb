// This module drives the one-way lowering of a shaped-array module to the low-level form the
// LLVM translator accepts. A `Pass` transforms the module in place and reports failure as a
// `PassError` that names the pass and carries the first error diagnostic it emitted. The
// `PassManager` runs passes in order, marks each one in the session (for diagnostics and
// statistics), optionally verifies the module after every pass and logs the module text at
// trace level. `default_pipeline` assembles the fixed order: parallel environment regions are
// unwrapped, linalg ops become loops, parallel loops are outlined into runtime calls,
// structured control flow becomes a CFG, the module is canonicalized, shaped-array ops,
// refcounts and public signatures are lowered, struct parameters of external declarations
// are made indirect, fastmath flags are attached, and a final CSE and canonicalization run
// tidies up. `LoweringOptions` carries the per-compilation switches.

//! Lowering pipeline.

pub mod cse;
pub mod linalg_to_loops;
pub mod parallel;
pub mod post;
pub mod scf_to_cf;
pub mod struct_abi;
pub mod to_low_level;

use log::{debug, trace};

use crate::core::error::{PassError, PassResult};
use crate::core::session::PipelineSession;
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId};
use crate::ir::ops::OpKind;
use crate::ir::types::FunctionType;
use crate::ir::verify::verify_module;
use crate::rewrite::{apply_rules_greedily, RuleSet};

/// Per-compilation lowering switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringOptions {
    /// Route allocation pointers through a token cell so that every
    /// descriptor owns a distinct allocation handle.
    pub use_alloc_tokens: bool,
    /// Attach fastmath flags to float arithmetic and function attributes.
    pub fastmath: bool,
    /// Run the verifier after every pass.
    pub verify_each: bool,
    pub max_rewrite_iterations: usize,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self {
            use_alloc_tokens: false,
            fastmath: false,
            verify_each: cfg!(debug_assertions),
            max_rewrite_iterations: 10,
        }
    }
}

/// A module transformation.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()>;
}

/// Fail `pass` with its first error diagnostic since `start`, or `fallback`.
pub(crate) fn pass_failure(
    pass: &'static str,
    session: &PipelineSession<'_>,
    start: usize,
    fallback: &str,
) -> PassError {
    let message = session
        .first_error_since(start)
        .map(|d| d.message)
        .unwrap_or_else(|| fallback.to_string());
    PassError::Failed { pass, message }
}

/// Name of a function op.
pub(crate) fn func_name(m: &Module, func: OpId) -> Option<&str> {
    match m.kind(func) {
        OpKind::Func { name, .. } => Some(name),
        _ => None,
    }
}

/// Existing function `name`, or a new external declaration of it.
pub(crate) fn declare_function(m: &mut Module, name: &str, ty: FunctionType) -> OpId {
    if let Some(f) = m.lookup_function(name) {
        return f;
    }
    let body = m.body();
    Builder::at_end(m, body).func_decl(name, ty)
}

/// `base`, or `base_<N>` with the smallest `N` not yet taken.
pub(crate) fn unique_function_name(m: &Module, base: &str) -> String {
    if m.lookup_function(base).is_none() {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| m.lookup_function(candidate).is_none())
        .unwrap_or_else(|| base.to_string())
}

/// Greedy canonicalization with the full rule catalog.
pub struct Canonicalize {
    rules: RuleSet,
    max_iterations: usize,
}

impl Canonicalize {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            rules: RuleSet::canonical(),
            max_iterations,
        }
    }
}

impl Pass for Canonicalize {
    fn name(&self) -> &'static str {
        "canonicalize"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        apply_rules_greedily(m, &self.rules, session, self.max_iterations)?;
        Ok(())
    }
}

/// Ordered list of passes.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    verify_each: bool,
}

impl PassManager {
    pub fn new(verify_each: bool) -> Self {
        Self {
            passes: Vec::new(),
            verify_each,
        }
    }

    pub fn add<P: Pass + 'static>(&mut self, pass: P) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass in order, stopping at the first failure.
    pub fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        for pass in &self.passes {
            let name = pass.name();
            session.begin_pass(name);
            let start = session.diagnostic_count();
            pass.run(m, session)?;
            if let Some(diag) = session.first_error_since(start) {
                return Err(PassError::Failed {
                    pass: name,
                    message: diag.message,
                });
            }
            if self.verify_each {
                verify_module(m).map_err(|source| PassError::Ir { pass: name, source })?;
            }
            trace!("after {}:\n{}", name, m);
        }
        debug!("{}", session.stats());
        Ok(())
    }
}

/// The full lowering pipeline in its fixed order.
pub fn default_pipeline(options: &LoweringOptions) -> PassManager {
    let mut pm = PassManager::new(options.verify_each);
    pm.add(parallel::RemoveParallelRegion)
        .add(linalg_to_loops::LinalgToLoops)
        .add(parallel::LowerParallelToCfg)
        .add(scf_to_cf::ScfToCf)
        .add(Canonicalize::new(options.max_rewrite_iterations))
        .add(to_low_level::LowerToLowLevel::new(options.use_alloc_tokens))
        .add(struct_abi::FixStructAbi)
        .add(post::PostLowering::new(options.fastmath))
        .add(cse::Cse)
        .add(Canonicalize::new(options.max_rewrite_iterations));
    pm
}

/// Lower `m` in place with the default pipeline.
pub fn lower_module(
    m: &mut Module,
    options: &LoweringOptions,
    session: &PipelineSession<'_>,
) -> PassResult<()> {
    debug!("Lowering module {}", m.name());
    default_pipeline(options).run(m, session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::ops::SliceParams;
    use crate::ir::types::{Dim, Type};

    struct Failing;

    impl Pass for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run(&self, _m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
            session.error(None, "cannot lower");
            Ok(())
        }
    }

    #[test]
    fn test_pipeline_order() {
        let pm = default_pipeline(&LoweringOptions::default());
        assert_eq!(
            pm.pass_names(),
            vec![
                "remove-parallel-region",
                "linalg-to-loops",
                "lower-parallel-to-cfg",
                "scf-to-cf",
                "canonicalize",
                "lower-to-low-level",
                "fix-struct-abi",
                "post-lowering",
                "cse",
                "canonicalize",
            ]
        );
    }

    #[test]
    fn test_local_array_views_lower_end_to_end() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("local");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::f64(), Type::Index, Type::Index]);
        let n = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let mem = b.alloc(Type::memref(Type::f64(), vec![Dim::Dynamic, Dim::Static(4)]), vec![n]);
        let zero = b.const_index(0);
        let one = b.const_index(1);
        let two = b.const_index(2);
        let value = b.const_float(2.5, Type::f64());
        b.store(value, mem, vec![one, two]);
        let row = b.subview(
            mem,
            SliceParams {
                offsets: vec![Dim::Static(1), Dim::Static(0)],
                sizes: vec![Dim::Static(1), Dim::Static(4)],
                strides: vec![Dim::Static(1), Dim::Static(1)],
            },
            vec![],
        );
        let loaded = b.load(row, vec![zero, two]);
        let rows = b.dim(mem, zero);
        let cols = b.dim(row, one);
        b.dealloc(mem);
        b.return_(vec![loaded, rows, cols]);

        lower_module(&mut m, &LoweringOptions::default(), &session).unwrap();
        verify_module(&m).unwrap();
        assert!(m
            .walk()
            .into_iter()
            .all(|op| to_low_level::is_low_level(m.tag(op))));
    }

    #[test]
    fn test_error_diagnostic_stops_pipeline() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("fail");
        let (_, entry) = build_func(&mut m, "f", vec![], vec![Type::Index]);
        let mut b = Builder::at_end(&mut m, entry);
        let c = b.const_index(1);
        b.return_(vec![c]);

        let mut pm = PassManager::new(true);
        pm.add(Failing).add(Canonicalize::new(4));
        let err = pm.run(&mut m, &session).unwrap_err();
        assert_eq!(
            err,
            PassError::Failed {
                pass: "failing",
                message: "cannot lower".into()
            }
        );
        assert_eq!(session.stats().passes_run, 1);
    }
}
