// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Memo tables for pickling and unpickling.

use std::mem;
use std::collections::BTreeMap;
use log::debug;

use crate::error::ErrorCode;
use crate::value::Value;

/// Table sizes; each one is roughly double the one before.
const PRIMES: [usize; 25] = [
    13, 61, 251, 1021, 4093, 5987, 9551, 15683, 19609, 31397, 65521,
    131071, 262139, 524287, 1048573, 2097143, 4194301, 8388593, 16777213,
    33554393, 67108859, 134217689, 268435399, 536870909, 1073741789,
];

struct Slot {
    id: usize,
    position: u32,
    // Holds the object alive, so that its identity can't be reused by a
    // later allocation while the pickle is being written.
    #[allow(dead_code)]
    value: Value,
}

/// Identity-keyed open addressing table, mapping objects already written
/// to their memo positions.
///
/// The table is never more than about half full, which keeps the probe
/// sequences short and guarantees that every lookup finds an empty slot.
pub struct PickleMemo {
    slots: Vec<Option<Slot>>,
    filled: usize,
}

impl PickleMemo {
    pub fn new() -> PickleMemo {
        PickleMemo::with_capacity(PRIMES[0])
    }

    /// Create a table able to hold about `capacity / 2` objects before
    /// growing.
    pub fn with_capacity(capacity: usize) -> PickleMemo {
        let size = PRIMES.iter().cloned().find(|&p| p >= capacity)
                                         .unwrap_or(PRIMES[PRIMES.len() - 1]);
        PickleMemo { slots: (0..size).map(|_| None).collect(), filled: 0 }
    }

    /// Number of memoized objects.
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Return the slot index holding `id`, or the empty slot where it
    /// would go.
    fn probe(&self, id: usize) -> usize {
        let len = self.slots.len();
        let step = len / 5;
        let mut i = (id & 0x7fff_ffff) % len;
        loop {
            match self.slots[i] {
                Some(ref slot) if slot.id != id => i = (i + step) % len,
                _ => return i,
            }
        }
    }

    /// The memo position of the object with the given identity.
    pub fn find_position(&self, id: usize) -> Option<u32> {
        self.slots[self.probe(id)].as_ref().map(|slot| slot.position)
    }

    /// Record `value` (whose identity is `id`) at `position`.
    ///
    /// Recording an identity again replaces its position.
    pub fn put(&mut self, id: usize, position: u32, value: Value) -> Result<(), ErrorCode> {
        if 2 * self.filled > self.slots.len() {
            self.grow()?;
        }
        let i = self.probe(id);
        if self.slots[i].is_none() {
            self.filled += 1;
        }
        self.slots[i] = Some(Slot { id, position, value });
        Ok(())
    }

    fn grow(&mut self) -> Result<(), ErrorCode> {
        let current = self.slots.len();
        let size = match PRIMES.iter().cloned().find(|&p| p > current) {
            Some(size) => size,
            None => return Err(ErrorCode::MemoFull),
        };
        debug!("growing pickle memo from {} to {} slots", current, size);
        let old = std::mem::replace(&mut self.slots, (0..size).map(|_| None).collect());
        for slot in old.into_iter().flatten() {
            let i = self.probe(slot.id);
            self.slots[i] = Some(slot);
        }
        Ok(())
    }
}

impl Default for PickleMemo {
    fn default() -> PickleMemo {
        PickleMemo::new()
    }
}

/// Position-keyed memo of an unpickler.
///
/// Positions are whatever the stream uses; they need not be dense.
#[derive(Default)]
pub struct UnpickleMemo {
    values: BTreeMap<u32, Value>,
}

impl UnpickleMemo {
    pub fn new() -> UnpickleMemo {
        UnpickleMemo::default()
    }

    pub fn put(&mut self, position: u32, value: Value) {
        self.values.insert(position, value);
    }

    pub fn get(&self, position: u32) -> Option<&Value> {
        self.values.get(&position)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Empty the memo, handing out the values it held.
    pub fn drain(&mut self) -> Vec<Value> {
        mem::take(&mut self.values).into_iter().map(|(_, value)| value).collect()
    }
}
