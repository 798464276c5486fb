//! Indirect struct parameters for external declarations.
//!
//! Native callees expect aggregates by reference. A declaration that takes a
//! literal struct gets a pointer parameter instead; every call site spills the
//! struct into a stack slot allocated at the start of the caller's entry block
//! and passes the slot.

use super::{pass_failure, Pass};
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId};
use crate::ir::ops::{OpKind, OpTag};
use crate::ir::types::{FunctionType, Type};

pub struct FixStructAbi;

impl Pass for FixStructAbi {
    fn name(&self) -> &'static str {
        "fix-struct-abi"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        let start = session.diagnostic_count();
        let decls: Vec<OpId> = m
            .functions()
            .into_iter()
            .filter(|f| m.region_blocks(m.region(*f, 0)).is_empty())
            .collect();
        for decl in decls {
            let OpKind::Func { name, ty, visibility } = m.kind(decl).clone() else {
                continue;
            };
            let indirect: Vec<usize> = ty
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, t)| matches!(t, Type::Struct(_)))
                .map(|(i, _)| i)
                .collect();
            if indirect.is_empty() {
                continue;
            }
            if !fix_call_sites(m, session, &name, &ty, &indirect) {
                continue;
            }
            let inputs = ty
                .inputs
                .iter()
                .enumerate()
                .map(|(i, t)| if indirect.contains(&i) { Type::Ptr } else { t.clone() })
                .collect();
            m.set_kind(
                decl,
                OpKind::Func {
                    name,
                    ty: FunctionType::new(inputs, ty.results),
                    visibility,
                },
            );
        }
        match session.first_error_since(start) {
            Some(_) => Err(pass_failure(self.name(), session, start, "")),
            None => Ok(()),
        }
    }
}

fn fix_call_sites(
    m: &mut Module,
    session: &PipelineSession<'_>,
    name: &str,
    ty: &FunctionType,
    indirect: &[usize],
) -> bool {
    let mut calls = Vec::new();
    for op in m.walk() {
        match m.kind(op) {
            OpKind::Call { callee } if callee == name => calls.push(op),
            OpKind::AddressOf { symbol } if symbol == name => {
                session.error(Some(op), format!("@{} has struct parameters and cannot be referenced", name));
                return false;
            }
            _ => {}
        }
    }
    for call in calls {
        let Some(entry) = m.parent_func(call).map(|f| m.body_block(f, 0)) else {
            continue;
        };
        for &i in indirect {
            let value = m.operand(call, i);
            let mut b = Builder::at_start(m, entry);
            let one = b.const_int(1, Type::i64());
            let slot = b.l_alloca(ty.inputs[i].clone(), one);
            Builder::before(m, call).l_store(value, slot);
            m.set_operand(call, i, slot);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::lowering::func_name;
    use crate::ir::ops::Visibility;
    use crate::ir::verify::verify_module;

    fn private_func(m: &mut Module, name: &str, inputs: Vec<Type>) -> crate::ir::module::BlockId {
        let body = m.body();
        let f = Builder::at_end(m, body).func(name, FunctionType::new(inputs, vec![]), Visibility::Private);
        m.body_block(f, 0)
    }

    #[test]
    fn test_struct_argument_is_passed_indirectly() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("abi");
        let pair = Type::Struct(vec![Type::i64(), Type::f64()]);
        let body = m.body();
        let decl = Builder::at_end(&mut m, body).func_decl("consume", FunctionType::new(vec![pair.clone(), Type::i32()], vec![]));
        let entry = private_func(&mut m, "caller", vec![pair.clone()]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let flag = b.const_int(7, Type::i32());
        let call = b.call("consume", vec![arg, flag], vec![]);
        b.return_(vec![]);

        FixStructAbi.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        let OpKind::Func { ty, .. } = m.kind(decl) else {
            panic!("not a function");
        };
        assert_eq!(ty.inputs, vec![Type::Ptr, Type::i32()]);
        let slot = m.operand(call, 0);
        let alloca = m.defining_op_of(slot, OpTag::LAlloca).unwrap();
        assert_eq!(m.parent_block(alloca), Some(entry));
        assert_eq!(m.kind(alloca), &OpKind::LAlloca { elem: pair });
        let store = m.prev_op(call).unwrap();
        assert_eq!(m.tag(store), OpTag::LStore);
        assert_eq!(m.operand(store, 0), arg);
        assert_eq!(func_name(&m, decl), Some("consume"));
    }

    #[test]
    fn test_address_taken_declaration_fails() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("abi");
        let body = m.body();
        Builder::at_end(&mut m, body).func_decl("consume", FunctionType::new(vec![Type::Struct(vec![Type::i64()])], vec![]));
        let entry = private_func(&mut m, "caller", vec![]);
        let mut b = Builder::at_end(&mut m, entry);
        b.address_of("consume");
        b.return_(vec![]);

        assert!(FixStructAbi.run(&mut m, &session).is_err());
    }
}
