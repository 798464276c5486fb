// This module defines the attribute values carried by operations. The most important one is
// the environment attribute attached to environment regions. Environments come in closed
// families (parallel scheduling hints, device placement); each family knows how to compare
// and, where it makes sense, merge two of its members. `merge_env_attrs` is the single
// entry point region canonicalization uses: equal attributes merge to themselves, a missing
// attribute or two different families never merge, and otherwise the family decides.
// Family merges must be symmetric, which is checked in debug builds. The generic
// `Attribute` enum holds the discardable per-op attributes (fastmath flags, loop metadata,
// inline hints) that passes attach without changing op semantics.

//! Environment and discardable attributes.

use std::fmt;

/// Capabilities a device environment guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCaps {
    pub fp16: bool,
    pub fp64: bool,
}

/// Environment attached to an environment region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvAttr {
    /// Parallel scheduling hint; carries no runtime semantics.
    Parallel,
    /// Placement on a named device.
    Device { name: String, caps: DeviceCaps },
}

/// Attribute family interface: structural equality plus an optional merge.
pub trait AttrFamily {
    fn equals(&self, other: &Self) -> bool;

    /// Combine two members of the same family, `None` if they conflict.
    fn try_merge(&self, other: &Self) -> Option<Self>
    where
        Self: Sized;
}

impl EnvAttr {
    fn family(&self) -> u8 {
        match self {
            EnvAttr::Parallel => 0,
            EnvAttr::Device { .. } => 1,
        }
    }
}

impl AttrFamily for EnvAttr {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }

    fn try_merge(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            (EnvAttr::Parallel, EnvAttr::Parallel) => Some(EnvAttr::Parallel),
            (
                EnvAttr::Device { name: a, caps: ca },
                EnvAttr::Device { name: b, caps: cb },
            ) if a == b => Some(EnvAttr::Device {
                name: a.clone(),
                caps: DeviceCaps {
                    fp16: ca.fp16 && cb.fp16,
                    fp64: ca.fp64 && cb.fp64,
                },
            }),
            _ => None,
        }
    }
}

/// Merge two optional environments.
pub fn merge_env_attrs(a: Option<&EnvAttr>, b: Option<&EnvAttr>) -> Option<EnvAttr> {
    if a == b {
        return a.cloned();
    }
    let (a, b) = (a?, b?);
    if a.family() != b.family() {
        return None;
    }
    let merged = a.try_merge(b);
    debug_assert_eq!(merged, b.try_merge(a), "environment merge must be symmetric");
    merged
}

impl fmt::Display for EnvAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvAttr::Parallel => write!(f, "#parallel"),
            EnvAttr::Device { name, caps } => write!(
                f,
                "#device<\"{}\", fp16 = {}, fp64 = {}>",
                name, caps.fp16, caps.fp64
            ),
        }
    }
}

/// Discardable attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Loop metadata pairs such as `("tapir.loop.target", 1)`.
    LoopHints(Vec<(String, i64)>),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Unit => write!(f, "unit"),
            Attribute::Bool(b) => write!(f, "{}", b),
            Attribute::Int(i) => write!(f, "{}", i),
            Attribute::Str(s) => write!(f, "\"{}\"", s),
            Attribute::LoopHints(hints) => {
                write!(f, "{{")?;
                for (i, (k, v)) in hints.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Names of discardable attributes used across passes.
pub mod names {
    pub const FASTMATH: &str = "fastmath";
    pub const LOOP_METADATA: &str = "llvm.loop";
    pub const FORCE_INLINE: &str = "force_inline";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, fp16: bool, fp64: bool) -> EnvAttr {
        EnvAttr::Device {
            name: name.to_string(),
            caps: DeviceCaps { fp16, fp64 },
        }
    }

    #[test]
    fn test_merge_equal_and_missing() {
        let p = EnvAttr::Parallel;
        assert_eq!(merge_env_attrs(Some(&p), Some(&p)), Some(EnvAttr::Parallel));
        assert_eq!(merge_env_attrs(None, None), None);
        assert_eq!(merge_env_attrs(Some(&p), None), None);
        assert_eq!(merge_env_attrs(None, Some(&p)), None);
    }

    #[test]
    fn test_merge_different_families() {
        let d = device("gpu", true, true);
        assert_eq!(merge_env_attrs(Some(&EnvAttr::Parallel), Some(&d)), None);
    }

    #[test]
    fn test_device_merge_is_symmetric() {
        let a = device("gpu", true, false);
        let b = device("gpu", false, true);
        let ab = merge_env_attrs(Some(&a), Some(&b));
        let ba = merge_env_attrs(Some(&b), Some(&a));
        assert_eq!(ab, ba);
        assert_eq!(ab, Some(device("gpu", false, false)));

        let other = device("cpu", true, true);
        assert_eq!(merge_env_attrs(Some(&a), Some(&other)), None);
    }
}
