// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Slab storage with stable indices.
//!
//! Domains and UNITs point at each other (UNIT to parent domain, domain to
//! its UNIT list). Both live in arenas owned by the scheduler and refer to
//! each other by index, so no record owns another.

use std::collections::TryReserveError;

#[derive(Debug, Clone)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store `value`, reusing a freed slot if one exists. Fails only when
    /// the backing storage cannot grow.
    pub fn try_insert(&mut self, value: T) -> Result<u32, TryReserveError> {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(value);
                idx
            }
            None => {
                self.slots.try_reserve(1)?;
                // Reserve now so remove() never has to allocate.
                self.free.try_reserve(self.slots.len() + 1 - self.free.len())?;
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        };
        self.len += 1;
        Ok(idx)
    }

    pub fn remove(&mut self, idx: u32) -> Option<T> {
        let value = self.slots.get_mut(idx as usize)?.take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.get(idx).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
