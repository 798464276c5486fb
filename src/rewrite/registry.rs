// This module keeps the rewrite rules in a table keyed by the root op tag. A rule is a plain
// function over the module and the root op that either performs a complete rewrite and
// returns true, or returns false without touching the module. Rules registered for the same
// tag are tried in registration order, so folds (which only forward an existing value) are
// registered ahead of the structural rewrites for the same op. `RuleSet::canonical()` builds
// the full catalog used by the canonicalization pass.

//! Rule registry keyed by op tag.

use hashbrown::HashMap;

use crate::ir::module::{Module, OpId};
use crate::ir::ops::OpTag;

/// Rewrite function: true when the module was changed.
pub type RuleFn = fn(&mut Module, OpId) -> bool;

/// A named rule rooted at one op kind.
#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub root: OpTag,
    pub apply: RuleFn,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rule({} on {})", self.name, self.root.name())
    }
}

/// Rules grouped by root tag.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<OpTag, Vec<Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &'static str, root: OpTag, apply: RuleFn) -> &mut Self {
        self.rules.entry(root).or_default().push(Rule { name, root, apply });
        self
    }

    /// Rules rooted at `tag`, in registration order.
    pub fn rules_for(&self, tag: OpTag) -> &[Rule] {
        self.rules.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every canonicalization rule of the compiler.
    pub fn canonical() -> Self {
        let mut set = Self::new();
        super::folds::register(&mut set);
        super::layout::register(&mut set);
        super::sign_cast::register(&mut set);
        super::retain::register(&mut set);
        super::env_region::register(&mut set);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &mut Module, _: OpId) -> bool {
        false
    }

    #[test]
    fn test_rules_keep_registration_order() {
        let mut set = RuleSet::new();
        set.add("first", OpTag::ChangeLayout, never)
            .add("second", OpTag::ChangeLayout, never)
            .add("other", OpTag::Load, never);

        let names: Vec<_> = set.rules_for(OpTag::ChangeLayout).iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(set.len(), 3);
        assert!(set.rules_for(OpTag::Store).is_empty());
    }

    #[test]
    fn test_canonical_catalog_covers_rule_families() {
        let set = RuleSet::canonical();
        assert!(!set.rules_for(OpTag::ChangeLayout).is_empty());
        assert!(!set.rules_for(OpTag::SignCast).is_empty());
        assert!(!set.rules_for(OpTag::EnvRegion).is_empty());
        assert!(!set.rules_for(OpTag::Retain).is_empty());
        assert!(!set.rules_for(OpTag::Yield).is_empty());
    }
}
