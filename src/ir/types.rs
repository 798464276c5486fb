// This module defines the type model of the array IR. Scalar types (index, sized integers
// with an explicit signedness, floats), shaped types (memrefs with a strided layout and a
// memory space, value-semantic tensors), aggregate types (tuples, opaque names, type
// variables) and the low-level types that only appear after lowering (opaque pointers,
// literal structs, fixed arrays, tokens). The strided layout helpers at the bottom are
// the predicates every layout-changing rewrite relies on: the symmetric compatibility test
// between two layouts, the directional relaxation test used before replacing a value of
// one layout by a value of another, and the construction of the fully dynamic layout
// used as the fallback common type.

//! Value types and strided layouts.

use std::fmt;

/// A shape extent, stride or offset: either known at compile time or dynamic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(i64),
    Dynamic,
}

impl Dim {
    pub fn is_dynamic(self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    pub fn as_static(self) -> Option<i64> {
        match self {
            Dim::Static(v) => Some(v),
            Dim::Dynamic => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(v) => write!(f, "{}", v),
            Dim::Dynamic => write!(f, "?"),
        }
    }
}

/// Integer signedness. Only signless integers take part in arithmetic; the
/// signed/unsigned flavours are reinterpreted through `sign_cast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signedness {
    Signless,
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntType {
    pub width: u32,
    pub signedness: Signedness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F16,
    F32,
    F64,
}

impl FloatKind {
    pub fn width(self) -> u32 {
        match self {
            FloatKind::F16 => 16,
            FloatKind::F32 => 32,
            FloatKind::F64 => 64,
        }
    }
}

/// Offset plus one stride per dimension, in elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StridedLayout {
    pub offset: Dim,
    pub strides: Vec<Dim>,
}

impl StridedLayout {
    pub fn new(offset: Dim, strides: Vec<Dim>) -> Self {
        Self { offset, strides }
    }

    /// Layout with dynamic offset and every stride dynamic.
    pub fn fully_dynamic(rank: usize) -> Self {
        Self {
            offset: Dim::Dynamic,
            strides: vec![Dim::Dynamic; rank],
        }
    }

    pub fn is_fully_dynamic(&self) -> bool {
        self.offset.is_dynamic() && self.strides.iter().all(|s| s.is_dynamic())
    }
}

/// Layout attached to a memref type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Row-major contiguous, offset zero.
    Identity,
    Strided(StridedLayout),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemRefType {
    pub elem: Box<Type>,
    pub shape: Vec<Dim>,
    pub layout: Layout,
    pub memory_space: u32,
}

impl MemRefType {
    /// Contiguous memref in the default memory space.
    pub fn new(elem: Type, shape: Vec<Dim>) -> Self {
        Self {
            elem: Box::new(elem),
            shape,
            layout: Layout::Identity,
            memory_space: 0,
        }
    }

    pub fn strided(elem: Type, shape: Vec<Dim>, layout: StridedLayout) -> Self {
        Self {
            elem: Box::new(elem),
            shape,
            layout: Layout::Strided(layout),
            memory_space: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn has_static_shape(&self) -> bool {
        self.shape.iter().all(|d| !d.is_dynamic())
    }

    pub fn num_dynamic_dims(&self) -> usize {
        self.shape.iter().filter(|d| d.is_dynamic()).count()
    }

    /// Explicit strides and offset; identity layouts get the canonical
    /// row-major strides, which turn dynamic left of the first dynamic extent.
    pub fn strides_and_offset(&self) -> StridedLayout {
        match &self.layout {
            Layout::Strided(layout) => layout.clone(),
            Layout::Identity => {
                let mut strides = vec![Dim::Static(1); self.rank()];
                let mut running = Dim::Static(1);
                for i in (0..self.rank()).rev() {
                    strides[i] = running;
                    running = match (running, self.shape[i]) {
                        (Dim::Static(a), Dim::Static(b)) => Dim::Static(a * b),
                        _ => Dim::Dynamic,
                    };
                }
                StridedLayout::new(Dim::Static(0), strides)
            }
        }
    }

    pub fn with_layout(&self, layout: Layout) -> Self {
        Self {
            layout,
            ..self.clone()
        }
    }

    pub fn with_shape(&self, shape: Vec<Dim>) -> Self {
        Self {
            shape,
            ..self.clone()
        }
    }

    pub fn with_elem(&self, elem: Type) -> Self {
        Self {
            elem: Box::new(elem),
            ..self.clone()
        }
    }

    /// Same memref with every stride and the offset dynamic, or `None` if the
    /// layout is already fully dynamic.
    pub fn fully_dynamic(&self) -> Option<MemRefType> {
        if self.strides_and_offset().is_fully_dynamic() {
            return None;
        }
        Some(self.with_layout(Layout::Strided(StridedLayout::fully_dynamic(self.rank()))))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub elem: Box<Type>,
    pub shape: Vec<Dim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub inputs: Vec<Type>,
    pub results: Vec<Type>,
}

impl FunctionType {
    pub fn new(inputs: Vec<Type>, results: Vec<Type>) -> Self {
        Self { inputs, results }
    }
}

/// Type of an SSA value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Index,
    Int(IntType),
    Float(FloatKind),
    /// Unit type of ops without a meaningful value.
    None,
    MemRef(MemRefType),
    Tensor(TensorType),
    Tuple(Vec<Type>),
    Opaque(String),
    /// Compile-time type placeholder carried through the pipeline.
    TypeVar(Box<Type>),
    /// Opaque pointer (low-level only).
    Ptr,
    /// Literal struct (low-level only).
    Struct(Vec<Type>),
    Array(Box<Type>, u64),
    Token,
    Function(FunctionType),
}

impl Type {
    pub fn int(width: u32) -> Type {
        Type::Int(IntType {
            width,
            signedness: Signedness::Signless,
        })
    }

    pub fn sint(width: u32) -> Type {
        Type::Int(IntType {
            width,
            signedness: Signedness::Signed,
        })
    }

    pub fn uint(width: u32) -> Type {
        Type::Int(IntType {
            width,
            signedness: Signedness::Unsigned,
        })
    }

    pub fn i1() -> Type {
        Type::int(1)
    }

    pub fn i8() -> Type {
        Type::int(8)
    }

    pub fn i32() -> Type {
        Type::int(32)
    }

    pub fn i64() -> Type {
        Type::int(64)
    }

    pub fn f32() -> Type {
        Type::Float(FloatKind::F32)
    }

    pub fn f64() -> Type {
        Type::Float(FloatKind::F64)
    }

    pub fn memref(elem: Type, shape: Vec<Dim>) -> Type {
        Type::MemRef(MemRefType::new(elem, shape))
    }

    pub fn as_memref(&self) -> Option<&MemRefType> {
        match self {
            Type::MemRef(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_memref(&self) -> bool {
        matches!(self, Type::MemRef(_))
    }

    pub fn is_shaped(&self) -> bool {
        matches!(self, Type::MemRef(_) | Type::Tensor(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn is_int_or_index(&self) -> bool {
        matches!(self, Type::Int(_) | Type::Index)
    }

    pub fn is_signless_int(&self) -> bool {
        matches!(
            self,
            Type::Int(IntType {
                signedness: Signedness::Signless,
                ..
            })
        )
    }

    /// Element type of a shaped type.
    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::MemRef(m) => Some(&m.elem),
            Type::Tensor(t) => Some(&t.elem),
            _ => None,
        }
    }

    pub fn shape(&self) -> Option<&[Dim]> {
        match self {
            Type::MemRef(m) => Some(&m.shape),
            Type::Tensor(t) => Some(&t.shape),
            _ => None,
        }
    }

    /// Same shaped type with a different element type.
    pub fn with_element_type(&self, elem: Type) -> Option<Type> {
        match self {
            Type::MemRef(m) => Some(Type::MemRef(m.with_elem(elem))),
            Type::Tensor(t) => Some(Type::Tensor(TensorType {
                elem: Box::new(elem),
                shape: t.shape.clone(),
            })),
            _ => None,
        }
    }

    /// Integer with the signedness dropped.
    pub fn to_signless(&self) -> Type {
        match self {
            Type::Int(i) => Type::int(i.width),
            other => other.clone(),
        }
    }

    /// Scalar bit width, index counted as 64.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::Index => Some(64),
            Type::Int(i) => Some(i.width),
            Type::Float(k) => Some(k.width()),
            Type::Ptr => Some(64),
            _ => None,
        }
    }

    /// Store size in bytes of a scalar or low-level aggregate.
    pub fn size_in_bytes(&self) -> Option<u64> {
        match self {
            Type::Struct(fields) => {
                let mut size = 0u64;
                for field in fields {
                    let align = field.align_in_bytes()?;
                    size = size.div_ceil(align) * align + field.size_in_bytes()?;
                }
                let align = self.align_in_bytes()?;
                Some(size.div_ceil(align) * align)
            }
            Type::Array(elem, n) => Some(elem.size_in_bytes()? * n),
            other => other.bit_width().map(|w| u64::from(w.div_ceil(8))),
        }
    }

    pub fn align_in_bytes(&self) -> Option<u64> {
        match self {
            Type::Struct(fields) => fields
                .iter()
                .map(|f| f.align_in_bytes())
                .try_fold(1u64, |acc, a| a.map(|a| acc.max(a))),
            Type::Array(elem, _) => elem.align_in_bytes(),
            other => other.size_in_bytes().map(|s| s.max(1)),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Index => write!(f, "index"),
            Type::Int(IntType { width, signedness }) => match signedness {
                Signedness::Signless => write!(f, "i{}", width),
                Signedness::Signed => write!(f, "si{}", width),
                Signedness::Unsigned => write!(f, "ui{}", width),
            },
            Type::Float(k) => write!(f, "f{}", k.width()),
            Type::None => write!(f, "none"),
            Type::MemRef(m) => {
                write!(f, "memref<")?;
                for d in &m.shape {
                    write!(f, "{}x", d)?;
                }
                write!(f, "{}", m.elem)?;
                if let Layout::Strided(l) = &m.layout {
                    write!(f, ", strided<[")?;
                    for (i, s) in l.strides.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", s)?;
                    }
                    write!(f, "], offset: {}>", l.offset)?;
                }
                if m.memory_space != 0 {
                    write!(f, ", {}", m.memory_space)?;
                }
                write!(f, ">")
            }
            Type::Tensor(t) => {
                write!(f, "tensor<")?;
                for d in &t.shape {
                    write!(f, "{}x", d)?;
                }
                write!(f, "{}>", t.elem)
            }
            Type::Tuple(elems) => {
                write!(f, "tuple<")?;
                write_list(f, elems)?;
                write!(f, ">")
            }
            Type::Opaque(name) => write!(f, "!opaque<\"{}\">", name),
            Type::TypeVar(t) => write!(f, "!typevar<{}>", t),
            Type::Ptr => write!(f, "ptr"),
            Type::Struct(fields) => {
                write!(f, "struct<(")?;
                write_list(f, fields)?;
                write!(f, ")>")
            }
            Type::Array(elem, n) => write!(f, "array<{} x {}>", n, elem),
            Type::Token => write!(f, "token"),
            Type::Function(ft) => {
                write!(f, "(")?;
                write_list(f, &ft.inputs)?;
                write!(f, ") -> (")?;
                write_list(f, &ft.results)?;
                write!(f, ")")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, types: &[Type]) -> fmt::Result {
    for (i, t) in types.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", t)?;
    }
    Ok(())
}

/// Two layouts can describe the same memory: no position holds two
/// different static values. Symmetric in its arguments.
pub fn layouts_compatible(a: &StridedLayout, b: &StridedLayout) -> bool {
    if a.strides.len() != b.strides.len() {
        return false;
    }
    std::iter::once((a.offset, b.offset))
        .chain(a.strides.iter().copied().zip(b.strides.iter().copied()))
        .all(|pair| match pair {
            (Dim::Static(x), Dim::Static(y)) => x == y,
            _ => true,
        })
}

/// Directional stride test: a static source fits a dynamic destination, a
/// dynamic source never fits a static destination.
pub fn is_stride_relaxable(src: Dim, dst: Dim) -> bool {
    match (src, dst) {
        (Dim::Static(a), Dim::Static(b)) => a == b,
        (Dim::Static(_), Dim::Dynamic) => true,
        (Dim::Dynamic, Dim::Static(_)) => false,
        (Dim::Dynamic, Dim::Dynamic) => true,
    }
}

/// Same element type, memory space and rank, and no two different static extents.
pub fn memrefs_cast_compatible(a: &MemRefType, b: &MemRefType) -> bool {
    a.elem == b.elem
        && a.memory_space == b.memory_space
        && a.rank() == b.rank()
        && a.shape.iter().zip(&b.shape).all(|pair| match pair {
            (Dim::Static(x), Dim::Static(y)) => x == y,
            _ => true,
        })
}

/// A value of type `src` may be used where `dst` is expected through a plain
/// memref cast, without a layout change op.
pub fn can_relax_layout(src: &Type, dst: &Type) -> bool {
    let (Some(src), Some(dst)) = (src.as_memref(), dst.as_memref()) else {
        return false;
    };
    if !memrefs_cast_compatible(src, dst) {
        return false;
    }
    let src_layout = src.strides_and_offset();
    let dst_layout = dst.strides_and_offset();
    is_stride_relaxable(src_layout.offset, dst_layout.offset)
        && src_layout
            .strides
            .iter()
            .zip(&dst_layout.strides)
            .all(|(s, d)| is_stride_relaxable(*s, *d))
}

/// Fully dynamic variant of a memref type, `None` for other types or when the
/// layout is already fully dynamic.
pub fn fully_dynamic_type(ty: &Type) -> Option<Type> {
    ty.as_memref()?.fully_dynamic().map(Type::MemRef)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(offset: Dim, strides: &[Dim]) -> StridedLayout {
        StridedLayout::new(offset, strides.to_vec())
    }

    #[test]
    fn test_layout_compatibility_is_symmetric() {
        let s4 = layout(Dim::Static(0), &[Dim::Static(4), Dim::Static(1)]);
        let s8 = layout(Dim::Static(0), &[Dim::Static(8), Dim::Static(1)]);
        let dyn_stride = layout(Dim::Static(0), &[Dim::Dynamic, Dim::Static(1)]);

        assert!(!layouts_compatible(&s4, &s8));
        assert!(!layouts_compatible(&s8, &s4));
        assert!(layouts_compatible(&s4, &dyn_stride));
        assert!(layouts_compatible(&dyn_stride, &s4));
        assert!(layouts_compatible(&s4, &s4));
    }

    #[test]
    fn test_layout_compatibility_checks_offset() {
        let a = layout(Dim::Static(0), &[Dim::Static(1)]);
        let b = layout(Dim::Static(3), &[Dim::Static(1)]);
        let c = layout(Dim::Dynamic, &[Dim::Static(1)]);
        assert!(!layouts_compatible(&a, &b));
        assert!(layouts_compatible(&a, &c));
        assert!(layouts_compatible(&c, &b));
    }

    #[test]
    fn test_relaxation_is_directional() {
        let static_ty = Type::MemRef(MemRefType::strided(
            Type::f64(),
            vec![Dim::Dynamic],
            layout(Dim::Static(0), &[Dim::Static(1)]),
        ));
        let dynamic_ty = fully_dynamic_type(&static_ty).unwrap();

        assert!(can_relax_layout(&static_ty, &dynamic_ty));
        assert!(!can_relax_layout(&dynamic_ty, &static_ty));
    }

    #[test]
    fn test_identity_layout_strides() {
        let m = MemRefType::new(Type::f32(), vec![Dim::Static(2), Dim::Static(3), Dim::Static(4)]);
        let l = m.strides_and_offset();
        assert_eq!(l.offset, Dim::Static(0));
        assert_eq!(l.strides, vec![Dim::Static(12), Dim::Static(4), Dim::Static(1)]);

        let d = MemRefType::new(Type::f32(), vec![Dim::Static(2), Dim::Dynamic, Dim::Static(4)]);
        assert_eq!(
            d.strides_and_offset().strides,
            vec![Dim::Dynamic, Dim::Static(4), Dim::Static(1)]
        );
    }

    #[test]
    fn test_fully_dynamic_of_fully_dynamic_is_none() {
        let m = MemRefType::strided(Type::i64(), vec![Dim::Dynamic], StridedLayout::fully_dynamic(1));
        assert!(m.fully_dynamic().is_none());
    }

    #[test]
    fn test_struct_size_with_padding() {
        let s = Type::Struct(vec![Type::i8(), Type::i64(), Type::i32()]);
        assert_eq!(s.size_in_bytes(), Some(24));
        assert_eq!(s.align_in_bytes(), Some(8));
    }

    #[test]
    fn test_type_display() {
        let m = Type::MemRef(MemRefType::strided(
            Type::f64(),
            vec![Dim::Dynamic, Dim::Static(4)],
            layout(Dim::Dynamic, &[Dim::Dynamic, Dim::Static(1)]),
        ));
        assert_eq!(m.to_string(), "memref<?x4xf64, strided<[?, 1], offset: ?>>");
        assert_eq!(Type::uint(8).to_string(), "ui8");
    }
}
