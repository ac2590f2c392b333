/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The device/CU/channel catalog (spec.md §3, §4.A).

use crate::error::{XrmError, XrmResult};
use crate::request::MatchKey;

/// A CU's kind, mirroring spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuKind {
    IpKernel,
    SoftKernel,
    Empty,
}

/// The memory bank a CU is bound to.
#[derive(Debug, Clone)]
pub struct MemoryBank {
    pub bank_id: u32,
    pub bank_type: String,
    pub size: u64,
    pub base_address: u64,
}

/// A single fractional allocation of a CU (spec.md §3 "Channel").
#[derive(Debug, Clone)]
pub struct Channel {
    pub client_id: u64,
    /// 0 when this channel was not drawn from a reservation pool.
    pub pool_id: u64,
    pub original_load: u32,
    pub unified_load: u32,
    pub channel_id: u32,
    pub alloc_service_id: u64,
}

/// A reservation quota row bound to one CU (spec.md §3 "Reservation").
#[derive(Debug, Clone)]
pub struct Reserve {
    pub pool_id: u64,
    pub reserve_load: u32,
    pub client_id: u64,
}

/// A compute unit exposed by a loaded image (spec.md §3 "CU").
#[derive(Debug, Clone)]
pub struct Cu {
    pub cu_id: u32,
    pub kind: CuKind,
    pub kernel_name: String,
    pub kernel_alias: String,
    pub instance_name: String,
    pub base_address: u64,
    pub memory_bank: Option<MemoryBank>,
    pub max_capacity: Option<u64>,
    pub plugin_file_name: Option<String>,
    pub used_load: u32,
    pub num_chan_inuse: u32,
    pub channels: Vec<Channel>,
    pub reserves: Vec<Reserve>,
}

impl Cu {
    pub fn new(
        cu_id: u32,
        kind: CuKind,
        kernel_name: impl Into<String>,
        kernel_alias: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            cu_id,
            kind,
            kernel_name: kernel_name.into(),
            kernel_alias: kernel_alias.into(),
            instance_name: instance_name.into(),
            base_address: 0,
            memory_bank: None,
            max_capacity: None,
            plugin_file_name: None,
            used_load: 0,
            num_chan_inuse: 0,
            channels: Vec::new(),
            reserves: Vec::new(),
        }
    }

    pub fn with_max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = Some(cap);
        self
    }

    pub fn with_memory_bank(mut self, bank: MemoryBank) -> Self {
        self.memory_bank = Some(bank);
        self
    }

    /// Fully qualified "kernel:instance" name, per spec.md §3.
    pub fn cu_name(&self) -> String {
        format!("{}:{}", self.kernel_name, self.instance_name)
    }

    /// CU matching policy, spec.md §4.A: all supplied fields of `key` must agree, and at least
    /// one field must be supplied.
    pub fn matches(&self, key: &MatchKey) -> bool {
        if key.is_empty() {
            return false;
        }
        if let Some(name) = &key.kernel_name {
            if &self.kernel_name != name {
                return false;
            }
        }
        if let Some(alias) = &key.kernel_alias {
            if &self.kernel_alias != alias {
                return false;
            }
        }
        if let Some(cu_name) = &key.cu_name {
            if self.cu_name() != *cu_name {
                return false;
            }
        }
        true
    }

    /// Total reserve quota on this CU for a given pool id.
    pub fn reserved_for_pool(&self, pool_id: u64) -> u32 {
        self.reserves
            .iter()
            .filter(|r| r.pool_id == pool_id)
            .map(|r| r.reserve_load)
            .sum()
    }

    /// Total channel load already drawn from a given pool id on this CU.
    pub fn drawn_from_pool(&self, pool_id: u64) -> u32 {
        self.channels
            .iter()
            .filter(|c| c.pool_id == pool_id)
            .map(|c| c.unified_load)
            .sum()
    }

    /// Load available to a specific pool on this CU (spec.md §4.D pool arithmetic).
    pub fn available_for_pool(&self, pool_id: u64) -> u32 {
        self.reserved_for_pool(pool_id)
            .saturating_sub(self.drawn_from_pool(pool_id))
    }

    /// Load available to non-pool requests on this CU (spec.md §4.D pool arithmetic).
    pub fn available_non_pool(&self) -> u32 {
        crate::load::UNIFIED_MAX.saturating_sub(self.used_load)
    }

    /// Total quota live across all reservation rows on this CU (any pool).
    pub fn total_reserved(&self) -> u32 {
        self.reserves.iter().map(|r| r.reserve_load).sum()
    }

    /// Invariant I1: `used_load == Σ(non-pool channels) + Σreserves`. A pool-drawn channel's
    /// load was already booked into `used_load` when its reservation row was created; the
    /// channel itself only tracks which client drew how much of that quota.
    pub fn accounting_is_consistent(&self) -> bool {
        let chan_sum: u32 = self
            .channels
            .iter()
            .filter(|c| c.pool_id == 0)
            .map(|c| c.unified_load)
            .sum();
        let reserve_sum: u32 = self.reserves.iter().map(|r| r.reserve_load).sum();
        self.used_load == chan_sum + reserve_sum
    }
}

/// The image (xclbin) currently loaded on a device.
#[derive(Debug, Clone)]
pub struct Image {
    pub uuid: [u8; 16],
    pub file_name: String,
    pub num_cu: u32,
}

/// An accelerator device (spec.md §3 "Device").
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: u32,
    pub name: String,
    pub enabled: bool,
    pub is_loaded: bool,
    pub image: Option<Image>,
    pub is_exclusive: bool,
    pub cus: Vec<Cu>,
    /// Number of live reservation pools pinning the current image in place (spec.md §4.F step 3).
    pub xclbin_locks: u32,
}

impl Device {
    pub fn new(device_id: u32, name: impl Into<String>) -> Self {
        Self {
            device_id,
            name: name.into(),
            enabled: true,
            is_loaded: false,
            image: None,
            is_exclusive: false,
            cus: Vec::new(),
            xclbin_locks: 0,
        }
    }

    pub fn with_cus(mut self, cus: Vec<Cu>) -> Self {
        self.cus = cus;
        self
    }

    pub fn usable(&self) -> bool {
        self.enabled && self.is_loaded
    }

    /// True if this device currently holds no live channel belonging to any client.
    pub fn is_idle(&self) -> bool {
        self.cus.iter().all(|cu| cu.channels.is_empty())
    }

    /// True if every live channel on this device belongs to `client_id` (spec.md §4.D devExcl).
    pub fn held_only_by(&self, client_id: u64) -> bool {
        self.cus
            .iter()
            .all(|cu| cu.channels.iter().all(|c| c.client_id == client_id))
    }

    /// True if this device has any live channel or reservation row (spec.md §4.A "busy").
    pub fn is_busy(&self) -> bool {
        self.cus
            .iter()
            .any(|cu| !cu.channels.is_empty() || !cu.reserves.is_empty())
    }
}

/// The authoritative device table (spec.md §4.A).
#[derive(Debug, Clone)]
pub struct Catalog {
    devices: Vec<Device>,
}

impl Catalog {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn device(&self, device_id: u32) -> XrmResult<&Device> {
        self.devices
            .get(device_id as usize)
            .filter(|d| d.device_id == device_id)
            .ok_or_else(|| XrmError::InvalidRequest(format!("invalid device id {device_id}")))
    }

    pub fn device_mut(&mut self, device_id: u32) -> XrmResult<&mut Device> {
        self.devices
            .get_mut(device_id as usize)
            .filter(|d| d.device_id == device_id)
            .ok_or_else(|| XrmError::InvalidRequest(format!("invalid device id {device_id}")))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    pub fn enable_device(&mut self, device_id: u32) -> XrmResult<()> {
        let dev = self.device_mut(device_id)?;
        if dev.is_busy() {
            return Err(XrmError::InvalidRequest(format!(
                "device {device_id} still has live allocations"
            )));
        }
        dev.enabled = true;
        Ok(())
    }

    /// Disables a device; implies unload (spec.md §4.A). Fails if the device still has live
    /// channels or reservations -- callers must release first (Open Question #3 in DESIGN.md).
    pub fn disable_device(&mut self, device_id: u32) -> XrmResult<()> {
        let dev = self.device_mut(device_id)?;
        if dev.is_busy() {
            return Err(XrmError::InvalidRequest(format!(
                "device {device_id} still has live allocations"
            )));
        }
        dev.enabled = false;
        dev.is_loaded = false;
        dev.image = None;
        Ok(())
    }

    /// `maxCapacity(kernelName, kernelAlias)` (spec.md §4.A): the largest `maxCapacity` hint
    /// among matching CUs across enabled, loaded devices; 0 if none match or none carry a hint.
    pub fn max_capacity(&self, key: &MatchKey) -> u64 {
        self.devices
            .iter()
            .filter(|d| d.usable())
            .flat_map(|d| d.cus.iter())
            .filter(|cu| cu.matches(key))
            .filter_map(|cu| cu.max_capacity)
            .max()
            .unwrap_or(0)
    }

    pub fn is_cu_existing(&self, key: &MatchKey) -> bool {
        self.devices
            .iter()
            .filter(|d| d.usable())
            .flat_map(|d| d.cus.iter())
            .any(|cu| cu.matches(key))
    }

    /// Invariant I1 (spec.md §8), checked across every CU in the catalog.
    pub fn accounting_is_consistent(&self) -> bool {
        self.devices
            .iter()
            .flat_map(|d| d.cus.iter())
            .all(|cu| cu.accounting_is_consistent())
    }

    /// True if any CU anywhere still carries a reserve row for `pool_id` (spec.md §7 distinguishes
    /// *unknown-pool* -- the id never existed or was already relinquished -- from *pool-empty*,
    /// where it exists but has no quota left for this particular request).
    pub fn pool_exists(&self, pool_id: u64) -> bool {
        self.devices
            .iter()
            .flat_map(|d| d.cus.iter())
            .any(|cu| cu.reserves.iter().any(|r| r.pool_id == pool_id))
    }
}
