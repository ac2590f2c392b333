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

//! The reservation engine (spec.md §4.F): a two-phase scheme where a pool first carves a quota
//! out of the unreserved portion of a CU's capacity, and ordinary allocation later draws against
//! that quota by supplying the pool id.

use crate::catalog::{Catalog, Reserve};
use crate::driver::DeviceDriver;
use crate::error::{XrmError, XrmResult};
use crate::identity::IdentityService;
use crate::placement;
use crate::request::{CuListRequest, DeviceConstraint, PoolGrant, PoolListPlacement, PoolRequest};

/// Reserves `req.cu_list_num` copies of `req.template`, first satisfying `req.xclbin_num` --
/// that many devices in scope must already carry `req.xclbin_uuid` or be loadable to carry it
/// (spec.md §4.F steps 1-3).
pub fn reserve(
    catalog: &mut Catalog,
    identity: &mut IdentityService,
    driver: &dyn DeviceDriver,
    req: &PoolRequest,
) -> XrmResult<PoolGrant> {
    if req.cu_list_num == 0 {
        return Err(XrmError::InvalidRequest(
            "cuListNum must be at least 1".to_string(),
        ));
    }

    satisfy_xclbin_requirement(
        catalog,
        driver,
        req.xclbin_uuid,
        req.xclbin_num,
        req.xclbin_path.as_deref(),
        req.device_id_list.as_deref(),
    )?;

    let pool_id = identity.new_pool_id();
    let snapshot = catalog.clone();

    let mut list_placements = Vec::with_capacity(req.cu_list_num as usize);
    for _ in 0..req.cu_list_num {
        match reserve_one_copy(catalog, pool_id, req.client_id, &req.template, req.device_id_list.as_deref()) {
            Ok(device_ids) => list_placements.push(PoolListPlacement { device_ids }),
            Err(e) => {
                *catalog = snapshot;
                return Err(e);
            }
        }
    }

    let xclbin_device_ids: Vec<u32> = list_placements
        .iter()
        .flat_map(|p| p.device_ids.iter().copied())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    for device_id in &xclbin_device_ids {
        catalog.device_mut(*device_id)?.xclbin_locks += 1;
    }

    Ok(PoolGrant {
        pool_id,
        list_placements,
        xclbin_device_ids,
    })
}

/// Ensures `xclbin_num` devices in scope carry `uuid` (spec.md §4.F "demand that xclbinNum
/// devices already carry the given image or can be loaded to carry it"): devices whose current
/// image already matches count for free; the remainder are loaded from `path`, in scope order,
/// until the count is met or scope is exhausted. Fails `no-device` if `path` is absent or scope
/// runs out before the count is met.
fn satisfy_xclbin_requirement(
    catalog: &mut Catalog,
    driver: &dyn DeviceDriver,
    uuid: [u8; 16],
    xclbin_num: u32,
    path: Option<&str>,
    device_id_list: Option<&[u32]>,
) -> XrmResult<()> {
    if xclbin_num == 0 {
        return Ok(());
    }

    let scope: Vec<u32> = match device_id_list {
        Some(ids) => ids.to_vec(),
        None => catalog.devices().iter().map(|d| d.device_id).collect(),
    };

    let carries_uuid = |catalog: &Catalog, id: u32| {
        catalog
            .device(id)
            .ok()
            .and_then(|d| d.image.as_ref())
            .is_some_and(|img| img.uuid == uuid)
    };

    let mut satisfied = scope.iter().filter(|&&id| carries_uuid(catalog, id)).count() as u32;
    if satisfied >= xclbin_num {
        return Ok(());
    }

    let Some(path) = path else {
        return Err(XrmError::NoDevice);
    };

    for id in scope {
        if satisfied >= xclbin_num {
            break;
        }
        if carries_uuid(catalog, id) {
            continue;
        }
        let dev = catalog.device(id)?;
        if !dev.enabled {
            continue;
        }
        let mut image = driver
            .load(id, path)
            .map_err(|e| XrmError::DriverError(e.0))?;
        image.uuid = uuid;
        let dev = catalog.device_mut(id)?;
        dev.image = Some(image);
        dev.is_loaded = true;
        satisfied += 1;
    }

    if satisfied < xclbin_num {
        return Err(XrmError::NoDevice);
    }
    Ok(())
}

/// Reserves one copy of `list` -- a dry-run placement per sub-request followed by committing a
/// [`Reserve`] row, instead of a live channel, on each winning CU.
fn reserve_one_copy(
    catalog: &mut Catalog,
    pool_id: u64,
    client_id: u64,
    list: &CuListRequest,
    device_id_list: Option<&[u32]>,
) -> XrmResult<Vec<u32>> {
    if list.same_device {
        return reserve_one_copy_same_device(catalog, pool_id, client_id, list, device_id_list);
    }

    let snapshot = catalog.clone();
    let mut device_ids = Vec::with_capacity(list.requests.len());
    for req in &list.requests {
        let mut scoped = req.clone();
        if let Some(ids) = device_id_list {
            scoped.device = DeviceConstraint::FromList(ids.to_vec());
        }
        scoped.pool_id = 0; // reservations draw from the unreserved portion
        match placement::try_place(catalog, &scoped) {
            Ok(candidate) => {
                commit_reserve(catalog, candidate.device_id, candidate.cu_id, pool_id, client_id, scoped.unified_load)?;
                device_ids.push(candidate.device_id);
            }
            Err(e) => {
                *catalog = snapshot;
                return Err(e);
            }
        }
    }
    Ok(device_ids)
}

fn reserve_one_copy_same_device(
    catalog: &mut Catalog,
    pool_id: u64,
    client_id: u64,
    list: &CuListRequest,
    device_id_list: Option<&[u32]>,
) -> XrmResult<Vec<u32>> {
    let snapshot = catalog.clone();
    let candidate_devices: Vec<u32> = match device_id_list {
        Some(ids) => ids.to_vec(),
        None => catalog.devices().iter().map(|d| d.device_id).collect(),
    };

    let mut last_err = XrmError::NoCapacity;
    for device_id in candidate_devices {
        let mut placed = Vec::with_capacity(list.requests.len());
        let mut failed = false;
        for req in &list.requests {
            let mut scoped = req.clone();
            scoped.device = DeviceConstraint::Specific(device_id);
            scoped.pool_id = 0;
            match placement::try_place(catalog, &scoped) {
                Ok(candidate) => {
                    commit_reserve(catalog, candidate.device_id, candidate.cu_id, pool_id, client_id, scoped.unified_load)?;
                    placed.push(candidate.device_id);
                }
                Err(e) => {
                    last_err = e;
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            return Ok(placed);
        }
        *catalog = snapshot.clone();
    }
    Err(last_err)
}

fn commit_reserve(
    catalog: &mut Catalog,
    device_id: u32,
    cu_id: u32,
    pool_id: u64,
    client_id: u64,
    reserve_load: u32,
) -> XrmResult<()> {
    let device = catalog.device_mut(device_id)?;
    let cu = device
        .cus
        .iter_mut()
        .find(|cu| cu.cu_id == cu_id)
        .ok_or_else(|| XrmError::InvalidRequest(format!("cu {cu_id} not found")))?;
    cu.reserves.push(Reserve {
        pool_id,
        reserve_load,
        client_id,
    });
    cu.used_load += reserve_load;
    Ok(())
}

/// Releases every reserve row belonging to `pool_id` (spec.md §4.F "cuPoolRelinquish").
///
/// Channels still drawn from the pool are re-parented to non-pool bookkeeping rather than
/// forcibly released (spec.md §4.G open question: "the spec chooses [re-parenting]" over forced
/// release) -- their capacity stays booked, just no longer attributed to the pool. Only the
/// undrawn remainder of the quota is actually freed.
pub fn release_pool(catalog: &mut Catalog, pool_id: u64) -> XrmResult<()> {
    let mut touched = false;
    for device in catalog.devices_mut() {
        let mut released_on_device = false;
        for cu in &mut device.cus {
            let before = cu.reserves.len();
            let freed: u32 = cu
                .reserves
                .iter()
                .filter(|r| r.pool_id == pool_id)
                .map(|r| r.reserve_load)
                .sum();
            cu.reserves.retain(|r| r.pool_id != pool_id);
            if cu.reserves.len() != before {
                let drawn = cu.drawn_from_pool(pool_id);
                cu.used_load = cu.used_load.saturating_sub(freed.saturating_sub(drawn));
                for channel in cu.channels.iter_mut().filter(|c| c.pool_id == pool_id) {
                    channel.pool_id = 0;
                }
                released_on_device = true;
                touched = true;
            }
        }
        if released_on_device {
            device.xclbin_locks = device.xclbin_locks.saturating_sub(1);
        }
    }
    if touched {
        Ok(())
    } else {
        Err(XrmError::UnknownPool(pool_id))
    }
}

/// `checkCuPoolAvailableNum` (spec.md §4.F): repeatedly reserves a probe pool from `req` against
/// a scratch copy of the catalog, counting successful rounds until one fails, then discards the
/// scratch copy -- the real catalog is never touched.
pub fn check_available_num(
    catalog: &Catalog,
    identity: &IdentityService,
    driver: &dyn DeviceDriver,
    req: &PoolRequest,
) -> u32 {
    let mut scratch = catalog.clone();
    let mut scratch_identity = identity.clone();
    let mut count = 0;
    loop {
        match reserve(&mut scratch, &mut scratch_identity, driver, req) {
            Ok(_) => count += 1,
            Err(_) => break,
        }
    }
    count
}
