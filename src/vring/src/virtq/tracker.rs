/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Maps chain heads to caller tokens.

use alloc::vec::Vec;

use super::chain::ChainHandle;

/// A chain the device has not given back yet.
#[derive(Debug)]
pub struct Inflight<T> {
    pub token: T,
    pub chain: ChainHandle,
}

/// One slot per descriptor; only chain heads are ever occupied.
#[derive(Debug)]
pub struct BufferTracker<T> {
    slots: Vec<Option<Inflight<T>>>,
    outstanding: usize,
}

impl<T> BufferTracker<T> {
    pub fn new(size: u16) -> Self {
        let mut slots = Vec::with_capacity(size as usize);
        slots.resize_with(size as usize, || None);
        Self {
            slots,
            outstanding: 0,
        }
    }

    /// Remember `token` for the chain described by `chain`.
    ///
    /// Hands the token back if the head is already tracked.
    pub fn insert(&mut self, chain: ChainHandle, token: T) -> Result<(), T> {
        match self.slots.get_mut(chain.head() as usize) {
            Some(slot @ None) => {
                *slot = Some(Inflight { token, chain });
                self.outstanding += 1;
                Ok(())
            }
            _ => Err(token),
        }
    }

    /// Stop tracking the chain headed by `head`.
    pub fn take(&mut self, head: u16) -> Option<Inflight<T>> {
        let inflight = self.slots.get_mut(head as usize)?.take()?;
        self.outstanding -= 1;
        Some(inflight)
    }

    #[inline]
    pub fn contains(&self, head: u16) -> bool {
        matches!(self.slots.get(head as usize), Some(Some(_)))
    }

    /// Number of chains in flight.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Lowest head still in flight.
    pub fn first_outstanding(&self) -> Option<u16> {
        if self.outstanding == 0 {
            return None;
        }
        self.slots
            .iter()
            .position(Option::is_some)
            .map(|head| head as u16)
    }
}
