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

#![allow(dead_code)]

use std::num::NonZeroU16;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vring::device::{
    Device, DeviceError, DeviceId, DeviceStatus, Driver, QueueMemory, QueueSpec, Transport,
    TransportError,
};
use vring::feature::{
    DriverFeatures, FeatureTable, VIRTIO_F_INDIRECT_DESC, VIRTIO_F_VERSION_1,
    VIRTIO_RING_F_EVENT_IDX, bit,
};
use vring::virtq::{DeviceRing, HeapMem, IndirectPool, Layout, Notifier, QueueStats};

pub const NET_ID: DeviceId = DeviceId::new(1, 0x1af4);
pub const BLK_ID: DeviceId = DeviceId::new(2, 0x1af4);

/// Device specific feature bits used by the test drivers.
pub const F_MAC: u32 = 5;
pub const F_MQ: u32 = 22;

/// Counts doorbell writes of one queue.
#[derive(Debug, Clone, Default)]
pub struct Doorbell(pub Arc<AtomicUsize>);

impl Doorbell {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Notifier for Doorbell {
    fn notify(&self, _stats: QueueStats) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct FakeQueue {
    layout: Layout,
    mem: Arc<HeapMem>,
    doorbell: Doorbell,
}

/// An in-memory transport. Ring memory is allocated from the heap and kept
/// so a test can attach the device half of each queue.
#[derive(Debug)]
pub struct FakeTransport {
    pub id: DeviceId,
    pub offered: u64,
    pub accepted: Option<u64>,
    /// Clear FEATURES_OK when the driver sets it.
    pub reject_features: bool,
    pub max_size: u16,
    pub num_queues: u16,
    /// Indirect tables allocated per queue; 0 for none.
    pub indirect_tables: usize,
    pub resets: usize,
    status: DeviceStatus,
    queues: Vec<Option<FakeQueue>>,
}

impl FakeTransport {
    pub const TABLE_LEN: u16 = 16;

    pub fn new(id: DeviceId, offered: u64) -> Self {
        Self {
            id,
            offered,
            accepted: None,
            reject_features: false,
            max_size: 16,
            num_queues: 2,
            indirect_tables: 0,
            resets: 0,
            status: DeviceStatus::empty(),
            queues: Vec::new(),
        }
    }

    /// A modern device offering event index and indirect descriptors.
    pub fn modern(id: DeviceId) -> Self {
        Self::new(
            id,
            bit(VIRTIO_F_VERSION_1) | bit(VIRTIO_RING_F_EVENT_IDX) | bit(VIRTIO_F_INDIRECT_DESC),
        )
    }

    pub fn with_indirect_tables(mut self, tables: usize) -> Self {
        self.indirect_tables = tables;
        self
    }

    pub fn num_live_queues(&self) -> usize {
        self.queues.iter().flatten().count()
    }

    /// Attach the device half of queue `index`.
    pub fn device_ring(&self, index: u16) -> DeviceRing<Arc<HeapMem>> {
        let queue = self.queues[index as usize].as_ref().unwrap();
        let event_idx = self
            .accepted
            .is_some_and(|features| features & bit(VIRTIO_RING_F_EVENT_IDX) != 0);
        DeviceRing::new(queue.layout, queue.mem.clone(), event_idx).unwrap()
    }

    pub fn doorbell(&self, index: u16) -> Doorbell {
        self.queues[index as usize].as_ref().unwrap().doorbell.clone()
    }
}

impl Transport for FakeTransport {
    type Mem = Arc<HeapMem>;
    type Notifier = Doorbell;

    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn device_features(&self) -> u64 {
        self.offered
    }

    fn finalize_features(&mut self, features: u64) -> Result<(), TransportError> {
        self.accepted = Some(features);
        Ok(())
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }

    fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
        if self.reject_features {
            self.status.remove(DeviceStatus::FEATURES_OK);
        }
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.status = DeviceStatus::empty();
        self.accepted = None;
        self.queues.clear();
    }

    fn max_queue_size(&self, index: u16) -> u16 {
        if index < self.num_queues { self.max_size } else { 0 }
    }

    fn setup_queue(
        &mut self,
        index: u16,
        size: u16,
    ) -> Result<QueueMemory<Self::Mem>, TransportError> {
        let queue_size =
            NonZeroU16::new(size).ok_or(TransportError::QueueSize { index, size })?;
        let ring_len = Layout::query_size(size as usize).next_multiple_of(Layout::DESC_ALIGN);
        let pool_len = IndirectPool::query_size(self.indirect_tables, Self::TABLE_LEN);

        let mem = Arc::new(HeapMem::new(ring_len + pool_len)?);
        let layout = Layout::from_base(mem.base_addr(), queue_size)?;
        let indirect = if self.indirect_tables > 0 {
            Some(IndirectPool::new(
                mem.base_addr() + ring_len as u64,
                pool_len,
                Self::TABLE_LEN,
            )?)
        } else {
            None
        };

        if self.queues.len() <= index as usize {
            self.queues.resize_with(index as usize + 1, || None);
        }
        self.queues[index as usize] = Some(FakeQueue {
            layout,
            mem: mem.clone(),
            doorbell: Doorbell::default(),
        });

        Ok(QueueMemory {
            layout,
            mem,
            indirect,
        })
    }

    fn notifier(&self, index: u16) -> Self::Notifier {
        self.queues
            .get(index as usize)
            .and_then(Option::as_ref)
            .map(|queue| queue.doorbell.clone())
            .unwrap_or_default()
    }

    fn teardown_queue(&mut self, index: u16) {
        if let Some(queue) = self.queues.get_mut(index as usize) {
            *queue = None;
        }
    }
}

/// Everything a [`TestDriver`] was asked to do, in order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// A driver that creates `queues` queues named `q0`, `q1`, ... on probe.
pub struct TestDriver {
    pub name: &'static str,
    pub ids: Vec<DeviceId>,
    pub features: DriverFeatures,
    pub queues: u16,
    pub fail_probe: bool,
    pub calls: CallLog,
    pub config_changes: Arc<AtomicUsize>,
}

impl TestDriver {
    pub fn new(name: &'static str, id: DeviceId) -> Self {
        Self {
            name,
            ids: vec![id],
            features: DriverFeatures::new(
                FeatureTable::new(&[F_MAC, F_MQ, VIRTIO_F_INDIRECT_DESC, VIRTIO_RING_F_EVENT_IDX])
                    .unwrap(),
            ),
            queues: 2,
            fail_probe: false,
            calls: CallLog::default(),
            config_changes: Arc::default(),
        }
    }

    pub fn requiring(mut self, required: &[u32]) -> Self {
        self.features = self.features.with_required(required).unwrap();
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_probe = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl Driver<FakeTransport, u32> for TestDriver {
    fn name(&self) -> &str {
        self.name
    }

    fn id_table(&self) -> &[DeviceId] {
        &self.ids
    }

    fn features(&self) -> &DriverFeatures {
        &self.features
    }

    fn probe(&self, dev: &mut Device<FakeTransport, u32>) -> Result<(), DeviceError> {
        self.record("probe");
        let specs = (0..self.queues)
            .map(|i| QueueSpec::new(format!("q{i}")))
            .collect();
        dev.find_vqs(specs)?;

        if self.fail_probe {
            return Err(DeviceError::Driver {
                driver: self.name.to_string(),
                reason: "probe refused".to_string(),
            });
        }
        Ok(())
    }

    fn remove(&self, _dev: &mut Device<FakeTransport, u32>) {
        self.record("remove");
    }

    fn scan(&self, _dev: &mut Device<FakeTransport, u32>) {
        self.record("scan");
    }

    fn config_changed(&self, _dev: &Device<FakeTransport, u32>) {
        self.config_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn freeze(&self, _dev: &mut Device<FakeTransport, u32>) -> Result<(), DeviceError> {
        self.record("freeze");
        Ok(())
    }

    fn restore(&self, dev: &mut Device<FakeTransport, u32>) -> Result<(), DeviceError> {
        self.record("restore");
        self.probe(dev)
    }
}
