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

//! Feature bits and their negotiation.
//!
//! The device offers a 64-bit feature set. The driver accepts the offered
//! bits it knows, from its modern table when the device speaks VIRTIO 1.0
//! (`VIRTIO_F_VERSION_1`) and from its legacy table otherwise. Bits the ring
//! implements itself are always accepted.

use thiserror::Error;

/// Indirect descriptor tables.
pub const VIRTIO_F_INDIRECT_DESC: u32 = 28;
/// `used_event` / `avail_event` notification suppression.
pub const VIRTIO_RING_F_EVENT_IDX: u32 = 29;
/// Device complies with VIRTIO 1.0 or later.
pub const VIRTIO_F_VERSION_1: u32 = 32;

/// Bits the ring and transport implement, accepted on behalf of every driver.
pub const TRANSPORT_FEATURES: u64 =
    bit(VIRTIO_F_INDIRECT_DESC) | bit(VIRTIO_RING_F_EVENT_IDX) | bit(VIRTIO_F_VERSION_1);

/// Mask for feature number `feature`, which must be below 64.
#[inline]
pub const fn bit(feature: u32) -> u64 {
    1 << feature
}

#[inline]
pub fn has_feature(features: u64, feature: u32) -> bool {
    feature < u64::BITS && features & bit(feature) != 0
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureError {
    #[error("Feature bit {0} out of range")]
    BitOutOfRange(u32),
    #[error("Required features {missing:#x} missing from negotiated set {negotiated:#x}")]
    MissingRequired { missing: u64, negotiated: u64 },
    #[error("Features {negotiated:#x} differ from {saved:#x} negotiated before suspend")]
    ResumeMismatch { saved: u64, negotiated: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    Legacy,
    Modern,
}

/// A set of feature numbers a driver understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureTable {
    bits: u64,
}

impl FeatureTable {
    pub fn new(features: &[u32]) -> Result<Self, FeatureError> {
        features
            .iter()
            .try_fold(0u64, |bits, &feature| {
                if feature >= u64::BITS {
                    return Err(FeatureError::BitOutOfRange(feature));
                }
                Ok(bits | bit(feature))
            })
            .map(Self::from_bits)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    #[inline]
    pub fn bits(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn contains(&self, feature: u32) -> bool {
        has_feature(self.bits, feature)
    }
}

/// What a driver declares about features.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverFeatures {
    /// Features understood on modern devices.
    pub table: FeatureTable,
    /// Features understood on legacy devices; `None` uses `table`.
    pub legacy: Option<FeatureTable>,
    /// Features the driver cannot work without.
    pub required: u64,
}

impl DriverFeatures {
    pub fn new(table: FeatureTable) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    pub fn with_legacy(mut self, legacy: FeatureTable) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn with_required(mut self, required: &[u32]) -> Result<Self, FeatureError> {
        self.required = FeatureTable::new(required)?.bits();
        Ok(self)
    }

    /// The table used against a device of `revision`.
    pub fn table_for(&self, revision: Revision) -> FeatureTable {
        match revision {
            Revision::Modern => self.table,
            Revision::Legacy => self.legacy.unwrap_or(self.table),
        }
    }
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub features: u64,
    pub revision: Revision,
}

/// Intersect what the device offers with what the driver understands.
pub fn negotiate(device: u64, driver: &DriverFeatures) -> Result<Negotiated, FeatureError> {
    let revision = if has_feature(device, VIRTIO_F_VERSION_1) {
        Revision::Modern
    } else {
        Revision::Legacy
    };

    let accepted = driver.table_for(revision).bits() | TRANSPORT_FEATURES;
    let features = device & accepted;

    let missing = driver.required & !features;
    if missing != 0 {
        return Err(FeatureError::MissingRequired {
            missing,
            negotiated: features,
        });
    }

    Ok(Negotiated { features, revision })
}
