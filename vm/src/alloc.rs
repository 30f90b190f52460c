//! Accounting for heap-backed values.
//!
//! Values are reference counted; the allocator only tracks how many bytes
//! the live ones hold, and may refuse new ones. Every heap value owns a
//! [`Charge`] that gives its bytes back when the last reference drops.

use std::{cell::Cell, rc::Rc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot allocate {requested} bytes ({in_use} of {limit} in use)")]
pub struct AllocError {
    pub requested: usize,
    pub in_use: usize,
    pub limit: usize,
}

pub trait Allocator {
    fn reserve(&self, bytes: usize) -> Result<(), AllocError>;
    fn release(&self, bytes: usize);
    fn in_use(&self) -> usize;
}

/// Unlimited allocator that only counts.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    in_use: Cell<usize>,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for SystemAllocator {
    fn reserve(&self, bytes: usize) -> Result<(), AllocError> {
        self.in_use.set(self.in_use.get() + bytes);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.in_use.set(self.in_use.get().saturating_sub(bytes));
    }

    fn in_use(&self) -> usize {
        self.in_use.get()
    }
}

/// Allocator with a fixed byte budget, standing in for the small static
/// pools of an embedded target.
#[derive(Debug)]
pub struct BudgetAllocator {
    limit: usize,
    in_use: Cell<usize>,
}

impl BudgetAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: Cell::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Allocator for BudgetAllocator {
    fn reserve(&self, bytes: usize) -> Result<(), AllocError> {
        let in_use = self.in_use.get();
        if bytes > self.limit - in_use.min(self.limit) {
            return Err(AllocError {
                requested: bytes,
                in_use,
                limit: self.limit,
            });
        }
        self.in_use.set(in_use + bytes);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.in_use.set(self.in_use.get().saturating_sub(bytes));
    }

    fn in_use(&self) -> usize {
        self.in_use.get()
    }
}

/// Bytes held by one heap value.
pub struct Charge {
    allocator: Rc<dyn Allocator>,
    bytes: usize,
}

impl Charge {
    pub fn new(allocator: &Rc<dyn Allocator>, bytes: usize) -> Result<Self, AllocError> {
        allocator.reserve(bytes)?;
        Ok(Self {
            allocator: allocator.clone(),
            bytes,
        })
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.allocator.release(self.bytes);
    }
}

impl std::fmt::Debug for Charge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Charge({})", self.bytes)
    }
}
