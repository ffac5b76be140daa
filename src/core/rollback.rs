//! All-or-nothing over a sequence of reversible steps
//!
//! Completed steps are pushed as they succeed. On success the caller
//! [`commit`](Rollback::commit)s and keeps them; on failure it
//! [`unwind`](Rollback::unwind)s, compensating newest-first.

#[derive(Debug)]
#[must_use = "a Rollback must be committed or unwound"]
pub struct Rollback<T> {
    done: Vec<T>,
}

impl<T> Default for Rollback<T> {
    fn default() -> Self {
        Self { done: Vec::new() }
    }
}

impl<T> Rollback<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            done: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, step: T) {
        self.done.push(step);
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    /// Keeps every step, in the order they completed.
    pub fn commit(self) -> Vec<T> {
        self.done
    }

    /// Compensates every step, newest first. Returns how many compensations failed.
    pub fn unwind<E>(mut self, mut undo: impl FnMut(T) -> Result<(), E>) -> usize {
        let mut failed = 0;
        while let Some(step) = self.done.pop() {
            if undo(step).is_err() {
                failed += 1;
            }
        }
        failed
    }
}
