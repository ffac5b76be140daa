//! In-memory registry of active forward rules
//!
//! The table owns the [`RuleIdPool`] so that an id is live in the pool
//! exactly when it is either reserved for an in-flight install or mapped to
//! a committed [`ForwardRule`].

use std::collections::BTreeMap;

use crate::core::error::Result;
use crate::core::ids::{RuleId, RuleIdPool};
use crate::core::rule::{ForwardRule, Mapping};

#[derive(Debug, Default)]
pub struct RuleTable {
    pool: RuleIdPool,
    rules: BTreeMap<RuleId, ForwardRule>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id for a rule that is about to be installed.
    pub fn reserve(&mut self) -> Result<RuleId> {
        self.pool.allocate()
    }

    /// Gives back a reserved id whose install did not go through.
    pub fn abandon(&mut self, id: RuleId) {
        debug_assert!(!self.rules.contains_key(&id));
        self.pool.release(id);
    }

    /// Records the installed rule under its reserved id.
    pub fn commit(&mut self, id: RuleId, mapping: Mapping, allow_lan: bool) -> &ForwardRule {
        debug_assert!(self.pool.is_allocated(id));
        self.rules.insert(id, ForwardRule::new(id, mapping, allow_lan));
        &self.rules[&id]
    }

    pub fn get(&self, id: RuleId) -> Option<&ForwardRule> {
        self.rules.get(&id)
    }

    /// Removes the rule and releases its id.
    pub fn remove(&mut self, id: RuleId) -> Option<ForwardRule> {
        let rule = self.rules.remove(&id)?;
        self.pool.release(id);
        Some(rule)
    }

    /// Whether an active rule already produces this external effect
    pub fn contains_mapping(&self, mapping: &Mapping) -> bool {
        self.rules.values().any(|r| r.mapping() == *mapping)
    }

    /// Active rules in id order
    pub fn iter(&self) -> impl Iterator<Item = &ForwardRule> {
        self.rules.values()
    }

    pub fn ids(&self) -> Vec<RuleId> {
        self.rules.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Ids that can still be reserved
    pub fn available(&self) -> usize {
        self.pool.available()
    }
}
