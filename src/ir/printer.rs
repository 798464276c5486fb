// This module renders a module as text in an MLIR-like syntax for debug logging and test
// failure messages. Values print as `%<id>`, blocks as `^bb<id>`; nested regions are indented.
// The format is write-only: nothing parses it back.

//! Textual IR dump.

use std::fmt::{self, Write};

use super::module::{BlockId, Module, OpId, ValueId};
use super::ops::OpKind;

fn value(v: ValueId) -> String {
    format!("%{}", v.index())
}

impl Module {
    /// Render the module as text.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "module @{} {{", self.name());
        for op in self.block_ops(self.body()).to_vec() {
            let _ = self.print_op(&mut out, op, 1);
        }
        out.push_str("}\n");
        out
    }

    /// Render a single op (with its regions).
    pub fn op_to_text(&self, op: OpId) -> String {
        let mut out = String::new();
        let _ = self.print_op(&mut out, op, 0);
        out
    }

    fn print_op(&self, out: &mut String, op: OpId, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        write!(out, "{}", pad)?;
        let results = self.results(op);
        if !results.is_empty() {
            let names: Vec<String> = results.iter().map(|r| value(*r)).collect();
            write!(out, "{} = ", names.join(", "))?;
        }
        write!(out, "{}", self.kind(op).name())?;
        match self.kind(op) {
            OpKind::Func { name, ty, .. } => write!(out, " @{} : {}", name, super::types::Type::Function(ty.clone()))?,
            OpKind::Call { callee } => write!(out, " @{}", callee)?,
            OpKind::Constant(c) => write!(out, " {:?}", c)?,
            OpKind::CmpI(p) => write!(out, " {:?}", p)?,
            OpKind::CmpF(p) => write!(out, " {:?}", p)?,
            OpKind::Cast(k) => write!(out, " {:?}", k)?,
            OpKind::EnvRegion { env } => write!(out, " {}", env)?,
            OpKind::AtomicRmw(k) => write!(out, " {:?}", k)?,
            OpKind::LAtomicRmw { kind, ordering } => write!(out, " {:?} {:?}", kind, ordering)?,
            OpKind::AddressOf { symbol } => write!(out, " @{}", symbol)?,
            OpKind::Subview(p) | OpKind::ExtractSlice(p) => {
                write!(out, " {:?} {:?} {:?}", p.offsets, p.sizes, p.strides)?
            }
            OpKind::Gep { elem, indices } => write!(out, " {} {:?}", elem, indices)?,
            OpKind::InsertValue { position } | OpKind::ExtractValue { position } => {
                write!(out, " {:?}", position)?
            }
            OpKind::WrapAllocatedPointer { dtor } => write!(out, " @{}", dtor)?,
            OpKind::SliceGetItem { dim } => write!(out, " dim {}", dim)?,
            _ => {}
        }
        let operands: Vec<String> = self.operands(op).iter().map(|v| value(*v)).collect();
        if !operands.is_empty() {
            write!(out, " ({})", operands.join(", "))?;
        }
        let succs = self.successors(op);
        if !succs.is_empty() {
            let names: Vec<String> = succs.iter().map(|b| format!("^bb{}", b.index())).collect();
            write!(out, " [{}]", names.join(", "))?;
        }
        let mut attrs: Vec<(&String, _)> = self.attrs(op).collect();
        attrs.sort_by(|a, b| a.0.cmp(b.0));
        if !attrs.is_empty() {
            let rendered: Vec<String> = attrs.iter().map(|(k, v)| format!("{} = {}", k, v)).collect();
            write!(out, " {{{}}}", rendered.join(", "))?;
        }
        if !results.is_empty() {
            let types: Vec<String> = results
                .iter()
                .map(|r| self.value_type(*r).to_string())
                .collect();
            write!(out, " : {}", types.join(", "))?;
        }
        for region in self.regions(op) {
            writeln!(out, " {{")?;
            for block in self.region_blocks(*region) {
                self.print_block(out, *block, indent + 1)?;
            }
            write!(out, "{}}}", pad)?;
        }
        writeln!(out)
    }

    fn print_block(&self, out: &mut String, block: BlockId, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent.saturating_sub(1));
        let args: Vec<String> = self
            .block_args(block)
            .iter()
            .map(|a| format!("{}: {}", value(*a), self.value_type(*a)))
            .collect();
        writeln!(out, "{}^bb{}({}):", pad, block.index(), args.join(", "))?;
        for op in self.block_ops(block) {
            self.print_op(out, *op, indent)?;
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}
