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

use alloc::string::String;
use core::cmp::{max, min};
use core::fmt;

use crate::virtq::{CompletionCallback, QueueStats};

/// Fraction of the outstanding buffers that may complete before a delayed
/// callback re-enable asks to be woken.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DelayedEnable {
    numerator: u16,
    denominator: u16,
}

impl DelayedEnable {
    /// Number of completions to tolerate out of `outstanding`.
    #[inline]
    pub fn threshold(&self, outstanding: u16) -> u16 {
        (outstanding as u32 * self.numerator as u32 / self.denominator as u32) as u16
    }

    pub fn numerator(&self) -> u16 {
        self.numerator
    }

    pub fn denominator(&self) -> u16 {
        self.denominator
    }
}

/// Tunables for a single queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueConfig {
    /// Chains with more segments than this go through an indirect table
    /// when one is available.
    indirect_threshold: u16,
    delayed_enable: DelayedEnable,
}

impl QueueConfig {
    /// The default value for the indirect threshold (in segments)
    pub const DEFAULT_INDIRECT_THRESHOLD: u16 = 1;
    /// The minimum value for the indirect threshold (in segments)
    pub const MIN_INDIRECT_THRESHOLD: u16 = 1;
    /// The maximum value for the indirect threshold (in segments)
    pub const MAX_INDIRECT_THRESHOLD: u16 = 32768;
    /// The default numerator of the delayed enable fraction
    pub const DEFAULT_DELAYED_NUMERATOR: u16 = 3;
    /// The default denominator of the delayed enable fraction
    pub const DEFAULT_DELAYED_DENOMINATOR: u16 = 4;
    /// The minimum value for the delayed enable denominator
    pub const MIN_DELAYED_DENOMINATOR: u16 = 1;
    /// The maximum value for the delayed enable denominator
    pub const MAX_DELAYED_DENOMINATOR: u16 = 256;

    /// Get the indirect threshold
    pub fn get_indirect_threshold(&self) -> u16 {
        self.indirect_threshold
    }

    /// Set the indirect threshold, clamped to
    /// `MIN_INDIRECT_THRESHOLD..=MAX_INDIRECT_THRESHOLD`.
    pub fn set_indirect_threshold(&mut self, threshold: u16) {
        self.indirect_threshold = min(
            Self::MAX_INDIRECT_THRESHOLD,
            max(threshold, Self::MIN_INDIRECT_THRESHOLD),
        );
    }

    /// Get the delayed enable policy
    pub fn get_delayed_enable(&self) -> DelayedEnable {
        self.delayed_enable
    }

    /// Set the delayed enable fraction. The denominator is clamped to
    /// `MIN_DELAYED_DENOMINATOR..=MAX_DELAYED_DENOMINATOR` and the numerator
    /// to at most the denominator.
    pub fn set_delayed_enable(&mut self, numerator: u16, denominator: u16) {
        let denominator = min(
            Self::MAX_DELAYED_DENOMINATOR,
            max(denominator, Self::MIN_DELAYED_DENOMINATOR),
        );
        self.delayed_enable = DelayedEnable {
            numerator: min(numerator, denominator),
            denominator,
        };
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            indirect_threshold: Self::DEFAULT_INDIRECT_THRESHOLD,
            delayed_enable: DelayedEnable {
                numerator: Self::DEFAULT_DELAYED_NUMERATOR,
                denominator: Self::DEFAULT_DELAYED_DENOMINATOR,
            },
        }
    }
}

/// What a driver asks for when it creates a queue.
#[derive(Clone, Default)]
pub struct QueueSpec {
    pub(crate) name: String,
    pub(crate) size: Option<u16>,
    pub(crate) callback: Option<CompletionCallback>,
    pub(crate) config: QueueConfig,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Request a queue size. The transport may hand out a smaller one; the
    /// default is the transport maximum.
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = Some(size);
        self
    }

    /// Run `callback` when the device completes buffers.
    pub fn with_callback(mut self, callback: impl Fn(QueueStats) + Send + Sync + 'static) -> Self {
        self.callback = Some(alloc::sync::Arc::new(callback));
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Option<u16> {
        self.size
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl fmt::Debug for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSpec")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("callback", &self.callback.is_some())
            .field("config", &self.config)
            .finish()
    }
}
