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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// Arbitrary requires std, so fuzzing builds link it too
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

/// Split virtqueues: the shared-memory ring, its chain allocator and the
/// notification suppression handshake.
///
/// A [`virtq::Queue`] is the driver's end of one channel. The device end is
/// emulated by [`virtq::DeviceRing`] in tests and by whatever sits on the
/// other side of the shared memory in production.
pub mod virtq;

/// Feature bit negotiation between a driver and a device.
pub mod feature;

/// Device lifecycle, the driver and transport traits, and the bus registry
/// that binds them together.
pub mod device;

/// Per-queue tunables.
pub mod config;
