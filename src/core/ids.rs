//! Rule identifier space
//!
//! Rule ids are small non-negative `i8` values so they can share a return
//! slot with the negative error codes of the C ABI. The pool is a `u128`
//! bitmap over `0..=127`; allocation always hands out the lowest free id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Number of rules that can be active at the same time
pub const MAX_RULES: usize = 128;

/// Handle for one active forward rule, always within `0..=127`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct RuleId(i8);

impl RuleId {
    /// Returns `None` for negative values (those are error codes).
    pub const fn new(raw: i8) -> Option<Self> {
        if raw >= 0 { Some(Self(raw)) } else { None }
    }

    pub const fn get(self) -> i8 {
        self.0
    }

    const fn bit(self) -> u128 {
        1u128 << self.0
    }
}

impl TryFrom<i8> for RuleId {
    type Error = Error;

    fn try_from(raw: i8) -> Result<Self> {
        Self::new(raw).ok_or(Error::UnknownRuleId(raw))
    }
}

impl From<RuleId> for i8 {
    fn from(id: RuleId) -> Self {
        id.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bounded allocator for [`RuleId`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleIdPool {
    used: u128,
}

impl RuleIdPool {
    pub const fn new() -> Self {
        Self { used: 0 }
    }

    /// Allocates the lowest unused id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] once all 128 ids are live.
    pub fn allocate(&mut self) -> Result<RuleId> {
        let free = !self.used;
        if free == 0 {
            return Err(Error::ResourceExhausted);
        }
        let id = RuleId(free.trailing_zeros() as i8);
        self.used |= id.bit();
        Ok(id)
    }

    /// Returns `id` to the pool. Releasing a free id is a no-op and returns `false`.
    pub fn release(&mut self, id: RuleId) -> bool {
        let was_used = self.is_allocated(id);
        self.used &= !id.bit();
        was_used
    }

    pub const fn is_allocated(&self, id: RuleId) -> bool {
        self.used & id.bit() != 0
    }

    pub const fn in_use(&self) -> usize {
        self.used.count_ones() as usize
    }

    pub const fn available(&self) -> usize {
        MAX_RULES - self.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_id_rejects_negative() {
        assert!(RuleId::new(-1).is_none());
        assert!(RuleId::new(i8::MIN).is_none());
        assert_eq!(RuleId::new(0).map(RuleId::get), Some(0));
        assert_eq!(RuleId::new(127).map(RuleId::get), Some(127));
        assert!(matches!(RuleId::try_from(-13), Err(Error::UnknownRuleId(-13))));
    }

    #[test]
    fn test_allocate_lowest_first() {
        let mut pool = RuleIdPool::new();
        assert_eq!(pool.allocate().unwrap().get(), 0);
        assert_eq!(pool.allocate().unwrap().get(), 1);
        assert_eq!(pool.allocate().unwrap().get(), 2);

        assert!(pool.release(RuleId(1)));
        assert_eq!(pool.allocate().unwrap().get(), 1);
        assert_eq!(pool.allocate().unwrap().get(), 3);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut pool = RuleIdPool::new();
        for expected in 0..MAX_RULES {
            assert_eq!(pool.allocate().unwrap().get() as usize, expected);
        }
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.allocate(), Err(Error::ResourceExhausted)));
        // Failed allocation must not disturb the bitmap
        assert_eq!(pool.in_use(), MAX_RULES);

        assert!(pool.release(RuleId(77)));
        assert_eq!(pool.allocate().unwrap().get(), 77);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = RuleIdPool::new();
        let id = pool.allocate().unwrap();
        assert!(pool.release(id));
        assert!(!pool.release(id));
        assert!(!pool.release(RuleId(42)));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_rule_id_serde_uses_raw_value() {
        let id = RuleId(9);
        assert_eq!(serde_json::to_string(&id).unwrap(), "9");
        assert!(serde_json::from_str::<RuleId>("-3").is_err());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_pool_never_hands_out_live_ids(ops in proptest::collection::vec(any::<Option<u8>>(), 0..400)) {
            let mut pool = RuleIdPool::new();
            let mut live = std::collections::BTreeSet::new();

            for op in ops {
                match op {
                    None => match pool.allocate() {
                        Ok(id) => {
                            let lowest = (0i8..=127).find(|r| !live.contains(r));
                            prop_assert_eq!(Some(id.get()), lowest);
                            prop_assert!(live.insert(id.get()));
                        }
                        Err(_) => {
                            prop_assert_eq!(live.len(), MAX_RULES);
                        }
                    },
                    Some(raw) => {
                        let id = RuleId((raw % 128) as i8);
                        prop_assert_eq!(pool.release(id), live.remove(&id.get()));
                    }
                }
                prop_assert_eq!(pool.in_use(), live.len());
            }
        }

        #[test]
        fn test_allocate_returns_lowest_free(taken in proptest::collection::btree_set(0i8..=127, 0..127)) {
            let mut pool = RuleIdPool::new();
            for raw in &taken {
                pool.used |= RuleId(*raw).bit();
            }
            let expected = (0i8..=127).find(|r| !taken.contains(r)).unwrap();
            prop_assert_eq!(pool.allocate().unwrap().get(), expected);
        }
    }
}
