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

//! The one internal request type the placement engine consumes (spec.md §9: "Collapse [V1/V2]
//! into one internal request type that carries optional V2 hint words").
//!
//! V1 commands build a [`CuRequest`] with every V2 hint left at its default (no filter); V2
//! commands set them. The placement engine (`crate::placement`) has a single code path.

use std::time::Duration;

/// A CU match key (spec.md §4.A). At least one field must be set for a request to be valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchKey {
    pub kernel_name: Option<String>,
    pub kernel_alias: Option<String>,
    pub cu_name: Option<String>,
}

impl MatchKey {
    pub fn by_kernel_name(name: impl Into<String>) -> Self {
        Self {
            kernel_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kernel_name.is_none() && self.kernel_alias.is_none() && self.cu_name.is_none()
    }
}

/// V2 `deviceInfo` hint word (spec.md §6 bit layout): which devices a request may land on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceConstraint {
    Any,
    Specific(u32),
    /// References an entry of the V2 reservation's `deviceIdList`.
    FromList(Vec<u32>),
}

impl Default for DeviceConstraint {
    fn default() -> Self {
        DeviceConstraint::Any
    }
}

impl DeviceConstraint {
    pub fn admits(&self, device_id: u32) -> bool {
        match self {
            DeviceConstraint::Any => true,
            DeviceConstraint::Specific(id) => *id == device_id,
            DeviceConstraint::FromList(ids) => ids.contains(&device_id),
        }
    }
}

/// V2 `memoryInfo` hint word (spec.md §6 bit layout): which memory bank a CU must expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryConstraint {
    Any,
    BankId(u32),
    BankType(String),
}

impl Default for MemoryConstraint {
    fn default() -> Self {
        MemoryConstraint::Any
    }
}

impl MemoryConstraint {
    pub fn admits(&self, bank: Option<&crate::catalog::MemoryBank>) -> bool {
        match self {
            MemoryConstraint::Any => true,
            MemoryConstraint::BankId(id) => bank.map(|b| b.bank_id == *id).unwrap_or(false),
            MemoryConstraint::BankType(ty) => bank.map(|b| &b.bank_type == ty).unwrap_or(false),
        }
    }
}

/// One side of the V2 `policyInfo` hint word's two orthogonal preferences (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsagePreference {
    #[default]
    Any,
    LeastUsed,
    MostUsed,
}

/// V2 `policyInfo` hint word: device preference dominates CU preference lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyInfo {
    pub device: UsagePreference,
    pub cu: UsagePreference,
}

/// Selects which tie-break policy the placement engine applies (spec.md §4.D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// V1 `cuAlloc`: first candidate in (device, cu) iteration order that fits.
    FirstFit,
    /// V1 `cuAllocFromDev`: first fit, restricted to one device.
    FromDevice(u32),
    /// V1 `cuAllocLeastUsedFromDev`: least-used CU, restricted to one device.
    LeastUsedFromDevice(u32),
    /// V1 `cuAllocLeastUsed` / the `LeastUsed*` family: minimise usedLoad, then deviceId, then
    /// cuId among all fitting candidates.
    LeastUsed,
    /// V2: two orthogonal device/CU usage preferences, device preference dominates.
    V2(PolicyInfo),
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        PlacementPolicy::FirstFit
    }
}

/// Governs whether an unmet request should trigger an on-demand image load (spec.md §4.D
/// "WithLoad / LeastUsedWithLoad / LoadAndAllCuAlloc").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOnDemand {
    /// Do not load an image; fail with `no-capacity`/`no-device` if nothing already fits.
    Never,
    /// Load `path` (on any free device, or `device_id` if given) and retry once.
    IfNeeded { path: String, device_id: Option<u32> },
    /// Like `IfNeeded`, but on success allocate one channel at maximum load on every CU of the
    /// freshly loaded device (spec.md §4.D `LoadAndAllCuAlloc`).
    LockWholeDevice { path: String, device_id: Option<u32> },
}

impl Default for LoadOnDemand {
    fn default() -> Self {
        LoadOnDemand::Never
    }
}

/// A single CU request (spec.md §4.D input).
#[derive(Debug, Clone, Default)]
pub struct CuRequest {
    pub match_key: MatchKey,
    /// Already-unified load; use [`crate::load::RequestLoad::to_unified`] to build this from a
    /// caller-supplied granularity.
    pub unified_load: u32,
    pub original_load: u32,
    pub dev_excl: bool,
    pub client_id: u64,
    /// Non-zero means "draw from this reservation pool".
    pub pool_id: u64,
    pub device: DeviceConstraint,
    pub memory: MemoryConstraint,
    pub policy: PlacementPolicy,
    pub load_on_demand: LoadOnDemand,
}

/// The outcome of a successful single-CU placement (spec.md §4.D "Result on success").
#[derive(Debug, Clone)]
pub struct Grant {
    pub device_id: u32,
    pub cu_id: u32,
    pub channel_id: u32,
    pub alloc_service_id: u64,
    pub kernel_name: String,
    pub instance_name: String,
    pub unified_load: u32,
    pub original_load: u32,
    pub pool_id: u64,
}

/// An ordered list of sub-requests (spec.md §4.E "CU-list allocation").
#[derive(Debug, Clone, Default)]
pub struct CuListRequest {
    pub requests: Vec<CuRequest>,
    pub same_device: bool,
}

/// A blocking variant's retry interval (spec.md §4.E "Blocking variants"). `None` means "use the
/// manager's configured default".
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingOptions {
    pub retry_interval: Option<Duration>,
}

/// Reservation input (spec.md §4.F).
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub template: CuListRequest,
    pub cu_list_num: u32,
    pub xclbin_uuid: [u8; 16],
    pub xclbin_num: u32,
    pub xclbin_path: Option<String>,
    pub device_id_list: Option<Vec<u32>>,
    pub client_id: u64,
}

/// Where one copy of a granted pool's template landed (spec.md §4.F "cuPoolResInfor").
#[derive(Debug, Clone)]
pub struct PoolListPlacement {
    pub device_ids: Vec<u32>,
}

/// Result of a successful reservation (spec.md §4.F).
#[derive(Debug, Clone)]
pub struct PoolGrant {
    pub pool_id: u64,
    pub list_placements: Vec<PoolListPlacement>,
    pub xclbin_device_ids: Vec<u32>,
}
