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

#![no_main]

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroU16;
use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use vring::config::QueueConfig;
use vring::device::{DeviceHandle, QueueSpec};
use vring::feature::{VIRTIO_F_INDIRECT_DESC, VIRTIO_RING_F_EVENT_IDX, bit};
use vring::virtq::{
    BufferChainBuilder, BufferElement, DeviceRing, HeapMem, IndirectPool, Layout, MemOps, Queue,
    QueueMemory, QueueStats, UsedRing, VirtqError,
};

const QUEUE_SIZE: u16 = 8;
const TABLE_LEN: u16 = 4;
const TABLES: usize = 2;

/// One step of a driver talking to a device that may lie.
#[derive(Arbitrary, Debug)]
enum Op {
    Add(Vec<BufferElement>),
    Kick,
    GetBuf,
    DisableCb,
    EnableCb,
    EnableCbDelayed,
    /// The device pops and completes the oldest chain it was given.
    Complete { written: u32 },
    /// The device makes up a completion.
    ForgeUsed { id: u32, len: u32 },
    /// The device scribbles over the used index.
    ForgeUsedIdx(u16),
    /// The device scribbles over a descriptor.
    ForgeDesc { idx: u8, bytes: [u8; 16] },
}

#[derive(Arbitrary, Debug)]
struct Input {
    event_idx: bool,
    indirect: bool,
    ops: Vec<Op>,
}

fn no_doorbell(_stats: QueueStats) {}

fuzz_target!(|input: Input| {
    let mut features = 0;
    if input.event_idx {
        features |= bit(VIRTIO_RING_F_EVENT_IDX);
    }
    if input.indirect {
        features |= bit(VIRTIO_F_INDIRECT_DESC);
    }

    let ring_len = Layout::query_size(QUEUE_SIZE as usize).next_multiple_of(Layout::DESC_ALIGN);
    let pool_len = IndirectPool::query_size(TABLES, TABLE_LEN);
    let mem = Arc::new(HeapMem::new(ring_len + pool_len).unwrap());
    let layout = Layout::from_base(mem.base_addr(), NonZeroU16::new(QUEUE_SIZE).unwrap()).unwrap();
    let pool = IndirectPool::new(mem.base_addr() + ring_len as u64, pool_len, TABLE_LEN).unwrap();

    let mut config = QueueConfig::default();
    config.set_indirect_threshold(2);
    let mut queue = Queue::new(
        DeviceHandle::new(0),
        0,
        QueueSpec::new("fuzz").with_config(config),
        QueueMemory {
            layout,
            mem: mem.clone(),
            indirect: Some(pool),
        },
        no_doorbell as fn(QueueStats),
        features,
    )
    .unwrap();
    let mut device = DeviceRing::new(layout, mem.clone(), input.event_idx).unwrap();

    let mut next_token = 0u64;
    let mut outstanding = HashSet::new();
    let mut popped = VecDeque::new();

    for op in input.ops {
        let broken = queue.is_broken();
        match op {
            Op::Add(elems) => {
                let (readables, writables): (Vec<_>, Vec<_>) =
                    elems.into_iter().take(16).partition(|e| !e.writable);
                let chain = BufferChainBuilder::new()
                    .readables(readables.iter().map(|e| (e.addr, e.len)))
                    .writables(writables.iter().map(|e| (e.addr, e.len)))
                    .build();
                let Ok(chain) = chain else {
                    continue;
                };

                match queue.add(&chain, next_token) {
                    Ok(_) => {
                        assert!(!broken);
                        outstanding.insert(next_token);
                        next_token += 1;
                    }
                    Err(VirtqError::Broken) => assert!(broken),
                    Err(VirtqError::OutOfSpace | VirtqError::ChainTooLong { .. }) => {}
                    Err(err) => panic!("unexpected add error: {err}"),
                }
            }
            Op::Kick => {
                let _ = queue.kick();
            }
            Op::GetBuf => match queue.get_buf() {
                Ok(Some((token, _len))) => {
                    assert!(outstanding.remove(&token), "token {token} returned twice");
                }
                Ok(None) => assert!(!broken),
                Err(VirtqError::Broken) => assert!(broken),
                Err(VirtqError::ProtocolViolation(_)) => {
                    assert!(!broken);
                    assert!(queue.is_broken());
                }
                Err(err) => panic!("unexpected get_buf error: {err}"),
            },
            Op::DisableCb => {
                let _ = queue.disable_cb();
            }
            Op::EnableCb => {
                let _ = queue.enable_cb();
            }
            Op::EnableCbDelayed => {
                let _ = queue.enable_cb_delayed();
            }
            Op::Complete { written } => {
                while let Ok(Some(chain)) = device.pop_avail() {
                    popped.push_back(chain.head);
                }
                if let Some(head) = popped.pop_front() {
                    let _ = device.push_used(u32::from(head), written);
                }
            }
            Op::ForgeUsed { id, len } => {
                let _ = device.push_used(id, len);
            }
            Op::ForgeUsedIdx(idx) => {
                mem.store_release(layout.used_addr + UsedRing::IDX_OFFSET, idx)
                    .unwrap();
            }
            Op::ForgeDesc { idx, bytes } => {
                let slot = u64::from(idx) % u64::from(QUEUE_SIZE);
                mem.write(layout.desc_table_addr + slot * 16, &bytes).unwrap();
            }
        }
    }

    // whatever the device did, every token comes back exactly once
    let drained: HashSet<_> = queue.drain().into_iter().collect();
    assert_eq!(drained, outstanding);
    assert_eq!(queue.num_free(), QUEUE_SIZE);
});
