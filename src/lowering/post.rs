//! Fastmath flags on lowered float arithmetic.
//!
//! A function gets fast-math when the compilation asks for it or when the
//! function already carries the `fastmath` attribute. Its float binary ops,
//! float compares and float casts are flagged, and the function attribute is
//! set so the translator emits the matching function-level passthrough.

use log::trace;

use super::Pass;
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::attrs::{names, Attribute};
use crate::ir::module::{Module, OpId};
use crate::ir::ops::{CastKind, OpKind};

pub struct PostLowering {
    fastmath: bool,
}

impl PostLowering {
    pub fn new(fastmath: bool) -> Self {
        Self { fastmath }
    }
}

impl Pass for PostLowering {
    fn name(&self) -> &'static str {
        "post-lowering"
    }

    fn run(&self, m: &mut Module, _session: &PipelineSession<'_>) -> PassResult<()> {
        for func in m.functions() {
            if m.region_blocks(m.region(func, 0)).is_empty() {
                continue;
            }
            if !self.fastmath && m.attr(func, names::FASTMATH).is_none() {
                continue;
            }
            m.set_attr(func, names::FASTMATH, Attribute::Unit);
            let flagged: Vec<OpId> = m
                .walk_op(func)
                .into_iter()
                .filter(|op| is_float_op(m.kind(*op)))
                .collect();
            trace!("fastmath on {} ops", flagged.len());
            for op in flagged {
                m.set_attr(op, names::FASTMATH, Attribute::Unit);
            }
        }
        Ok(())
    }
}

fn is_float_op(kind: &OpKind) -> bool {
    match kind {
        OpKind::Binary(op) => op.is_float(),
        OpKind::CmpF(_) => true,
        OpKind::Cast(cast) => matches!(
            cast,
            CastKind::SIToFP | CastKind::UIToFP | CastKind::FPToSI | CastKind::FPToUI | CastKind::ExtF | CastKind::TruncF
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::builder::Builder;
    use crate::ir::ops::BinOp;
    use crate::ir::types::Type;

    fn build(m: &mut Module) -> (OpId, OpId, OpId) {
        let (f, entry) = build_func(m, "axpy", vec![Type::f64(), Type::i64()], vec![Type::f64()]);
        let x = m.block_arg(entry, 0);
        let n = m.block_arg(entry, 1);
        let mut b = Builder::at_end(m, entry);
        let y = b.binary(BinOp::MulF, x, x);
        let k = b.binary(BinOp::AddI, n, n);
        b.return_(vec![y]);
        let fmul = m.defining_op(y).unwrap();
        let add = m.defining_op(k).unwrap();
        (f, fmul, add)
    }

    #[test]
    fn test_fastmath_flags_float_ops_only() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("fm");
        let (f, fmul, add) = build(&mut m);

        PostLowering::new(true).run(&mut m, &session).unwrap();
        assert!(m.attr(f, names::FASTMATH).is_some());
        assert!(m.attr(fmul, names::FASTMATH).is_some());
        assert!(m.attr(add, names::FASTMATH).is_none());
    }

    #[test]
    fn test_function_attribute_enables_fastmath() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("fm");
        let (f, fmul, _) = build(&mut m);

        PostLowering::new(false).run(&mut m, &session).unwrap();
        assert!(m.attr(fmul, names::FASTMATH).is_none());

        m.set_attr(f, names::FASTMATH, Attribute::Unit);
        PostLowering::new(false).run(&mut m, &session).unwrap();
        assert!(m.attr(fmul, names::FASTMATH).is_some());
    }
}
