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

//! The placement engine (spec.md §4.D) -- the single decision point every allocation path
//! (single CU, list, group, reservation dry-run) ultimately calls through.

use crate::catalog::Catalog;
use crate::driver::DeviceDriver;
use crate::error::{XrmError, XrmResult};
use crate::identity::IdentityService;
use crate::load::UNIFIED_MAX;
use crate::request::{CuRequest, Grant, LoadOnDemand, PlacementPolicy, UsagePreference};

/// One (device, cu) pair that satisfies every hard constraint of a request, before tie-breaking.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub device_id: u32,
    pub cu_id: u32,
    cu_used_load: u32,
    device_used_load: u32,
}

fn pool_fits(cu: &crate::catalog::Cu, pool_id: u64, unified_load: u32) -> bool {
    if pool_id == 0 {
        cu.available_non_pool() >= unified_load
    } else {
        cu.available_for_pool(pool_id) >= unified_load
    }
}

fn device_total_used(device: &crate::catalog::Device) -> u32 {
    device.cus.iter().map(|cu| cu.used_load).sum()
}

/// Validates the parts of a [`CuRequest`] the placement engine itself is responsible for
/// (the load value is expected to already be unified and in-range by the time it reaches here).
fn validate(req: &CuRequest) -> XrmResult<()> {
    if req.match_key.is_empty() {
        return Err(XrmError::InvalidRequest(
            "no match key supplied".to_string(),
        ));
    }
    if req.unified_load == 0 || req.unified_load > UNIFIED_MAX {
        return Err(XrmError::InvalidRequest(format!(
            "unified load {} out of range",
            req.unified_load
        )));
    }
    Ok(())
}

/// Enumerates every candidate (device, cu) satisfying the request's hard constraints, in
/// (deviceId, cuId) order (spec.md §4.D "Candidate generation"). When `check_pool` is false the
/// pool-arithmetic fit is skipped, which lets callers tell "no CU matches at all" apart from
/// "CUs match but this pool has no quota left" (spec.md §7 *pool-empty*). When
/// `ignore_exclusivity` is true the devExcl/is_exclusive filters are skipped too, which lets
/// callers tell "no CU matches at all" apart from "CUs match, only exclusivity blocks them"
/// (spec.md §7 *exclusive-conflict*).
fn candidates_filtered(
    catalog: &Catalog,
    req: &CuRequest,
    check_pool: bool,
    ignore_exclusivity: bool,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for device in catalog.devices() {
        if !device.usable() {
            continue;
        }
        if !req.device.admits(device.device_id) {
            continue;
        }
        if !ignore_exclusivity {
            // Exclusivity: another client's exclusive hold locks the whole device out.
            if device.is_exclusive && !device.held_only_by(req.client_id) {
                continue;
            }
            // devExcl requests need the device free of other clients' channels.
            if req.dev_excl && !device.is_idle() && !device.held_only_by(req.client_id) {
                continue;
            }
        }
        let device_used = device_total_used(device);
        for cu in &device.cus {
            if !cu.matches(&req.match_key) {
                continue;
            }
            if !req.memory.admits(cu.memory_bank.as_ref()) {
                continue;
            }
            if check_pool && !pool_fits(cu, req.pool_id, req.unified_load) {
                continue;
            }
            out.push(Candidate {
                device_id: device.device_id,
                cu_id: cu.cu_id,
                cu_used_load: cu.used_load,
                device_used_load: device_used,
            });
        }
    }
    out
}

fn candidates_with(catalog: &Catalog, req: &CuRequest, check_pool: bool) -> Vec<Candidate> {
    candidates_filtered(catalog, req, check_pool, false)
}

fn candidates(catalog: &Catalog, req: &CuRequest) -> Vec<Candidate> {
    candidates_filtered(catalog, req, true, false)
}

/// True if at least one CU would satisfy `req` were exclusivity not in play -- i.e. the *only*
/// reason placement found no candidate is another client's exclusive hold (spec.md §4.D/§7
/// *exclusive-conflict*). Only meaningful to call once the real candidate set is already known
/// to be empty.
fn exclusivity_only_block(catalog: &Catalog, req: &CuRequest) -> bool {
    !candidates_filtered(catalog, req, true, true).is_empty()
}

/// Classifies a placement miss for a pool-scoped request (spec.md §7: *unknown-pool* if the id
/// never existed, *pool-empty* if it exists but this request doesn't fit its remaining quota).
fn pool_miss_reason(catalog: &Catalog, req: &CuRequest) -> XrmError {
    if !catalog.pool_exists(req.pool_id) {
        XrmError::UnknownPool(req.pool_id)
    } else if candidates_with(catalog, req, false).is_empty() {
        // No CU matches this request's non-pool constraints either; that's an ordinary miss.
        XrmError::NoCapacity
    } else {
        XrmError::PoolEmpty(req.pool_id)
    }
}

/// Applies the tie-break policy and returns the winning candidate, if any (spec.md §4.D
/// "Tie-break / ordering policies").
fn select(mut cands: Vec<Candidate>, policy: &PlacementPolicy) -> Option<Candidate> {
    if cands.is_empty() {
        return None;
    }
    match policy {
        PlacementPolicy::FirstFit | PlacementPolicy::FromDevice(_) => {
            // `candidates` is already produced in (deviceId, cuId) order.
            Some(cands[0])
        }
        PlacementPolicy::LeastUsedFromDevice(_) | PlacementPolicy::LeastUsed => {
            cands.sort_by_key(|c| (c.cu_used_load, c.device_id, c.cu_id));
            Some(cands[0])
        }
        PlacementPolicy::V2(policy) => {
            let device_ids: Vec<u32> = {
                let mut ids: Vec<u32> = cands.iter().map(|c| c.device_id).collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            };
            let chosen_device = match policy.device {
                UsagePreference::Any => device_ids[0],
                UsagePreference::LeastUsed => *device_ids
                    .iter()
                    .min_by_key(|id| {
                        cands
                            .iter()
                            .find(|c| c.device_id == **id)
                            .unwrap()
                            .device_used_load
                    })
                    .unwrap(),
                UsagePreference::MostUsed => *device_ids
                    .iter()
                    .max_by_key(|id| {
                        cands
                            .iter()
                            .find(|c| c.device_id == **id)
                            .unwrap()
                            .device_used_load
                    })
                    .unwrap(),
            };
            let mut on_device: Vec<Candidate> = cands
                .into_iter()
                .filter(|c| c.device_id == chosen_device)
                .collect();
            match policy.cu {
                UsagePreference::Any => {
                    on_device.sort_by_key(|c| c.cu_id);
                }
                UsagePreference::LeastUsed => {
                    on_device.sort_by_key(|c| (c.cu_used_load, c.cu_id));
                }
                UsagePreference::MostUsed => {
                    on_device.sort_by_key(|c| (std::cmp::Reverse(c.cu_used_load), c.cu_id));
                }
            }
            Some(on_device[0])
        }
    }
}

/// Grants a channel on `candidate` to the request, mutating the catalog (spec.md §4.D "Grant").
fn grant(catalog: &mut Catalog, identity: &mut IdentityService, req: &CuRequest, candidate: Candidate) -> Grant {
    let alloc_service_id = identity.new_alloc_service_id();
    let device = catalog
        .device_mut(candidate.device_id)
        .expect("candidate device must exist");
    let cu = device
        .cus
        .iter_mut()
        .find(|cu| cu.cu_id == candidate.cu_id)
        .expect("candidate cu must exist");

    let channel_id = cu.channels.len() as u32;
    cu.channels.push(crate::catalog::Channel {
        client_id: req.client_id,
        pool_id: req.pool_id,
        original_load: req.original_load,
        unified_load: req.unified_load,
        channel_id,
        alloc_service_id,
    });
    // A pool-drawn channel's load was already booked into used_load when its reserve row was
    // created; only a non-pool channel adds fresh consumption.
    if req.pool_id == 0 {
        cu.used_load += req.unified_load;
    }
    cu.num_chan_inuse += 1;

    if req.dev_excl {
        device.is_exclusive = true;
    }

    Grant {
        device_id: candidate.device_id,
        cu_id: candidate.cu_id,
        channel_id,
        alloc_service_id,
        kernel_name: cu.kernel_name.clone(),
        instance_name: cu.instance_name.clone(),
        unified_load: req.unified_load,
        original_load: req.original_load,
        pool_id: req.pool_id,
    }
}

/// Counts the CUs that currently satisfy every hard constraint of `req` (spec.md §6
/// `checkCuAvailableNum`/`checkCuListAvailableNum`/`checkCuGroupAvailableNum` family). Does not
/// consider on-demand loading.
pub fn available_count(catalog: &Catalog, req: &CuRequest) -> u32 {
    candidates(catalog, req).len() as u32
}

/// Runs one placement attempt with no on-demand loading; used for reservation dry-runs
/// (spec.md §4.F), where a missing image is never implicitly loaded.
pub(crate) fn try_place(catalog: &Catalog, req: &CuRequest) -> XrmResult<Candidate> {
    validate(req)?;
    if catalog.device_count() == 0 || catalog.devices().iter().all(|d| !d.usable()) {
        return Err(XrmError::NoDevice);
    }
    let cands = candidates(catalog, req);
    select(cands, &req.policy).ok_or_else(|| {
        if exclusivity_only_block(catalog, req) {
            XrmError::ExclusiveConflict
        } else if req.pool_id == 0 {
            XrmError::NoCapacity
        } else {
            pool_miss_reason(catalog, req)
        }
    })
}

/// Full single-CU placement, including the `LoadOnDemand::IfNeeded` retry (spec.md §4.D
/// "WithLoad / LeastUsedWithLoad").
pub fn allocate(
    catalog: &mut Catalog,
    identity: &mut IdentityService,
    driver: &dyn DeviceDriver,
    req: &CuRequest,
) -> XrmResult<Grant> {
    validate(req)?;

    let first_attempt = {
        if catalog.devices().iter().all(|d| !d.usable()) {
            None
        } else {
            select(candidates(catalog, req), &req.policy)
        }
    };

    let candidate = match first_attempt {
        Some(c) => c,
        None => match &req.load_on_demand {
            LoadOnDemand::Never => {
                if catalog.devices().iter().all(|d| !d.usable()) {
                    return Err(XrmError::NoDevice);
                }
                return Err(if exclusivity_only_block(catalog, req) {
                    XrmError::ExclusiveConflict
                } else if req.pool_id == 0 {
                    XrmError::NoCapacity
                } else {
                    pool_miss_reason(catalog, req)
                });
            }
            LoadOnDemand::IfNeeded { path, device_id } => {
                load_image(catalog, driver, path, *device_id)?;
                select(candidates(catalog, req), &req.policy).ok_or_else(|| {
                    if exclusivity_only_block(catalog, req) {
                        XrmError::ExclusiveConflict
                    } else if req.pool_id == 0 {
                        XrmError::NoCapacity
                    } else {
                        pool_miss_reason(catalog, req)
                    }
                })?
            }
            LoadOnDemand::LockWholeDevice { .. } => {
                // LockWholeDevice is handled by `allocate_and_lock_device`; a caller that
                // reaches this branch used the wrong entry point.
                return Err(XrmError::InvalidRequest(
                    "LockWholeDevice must go through allocate_and_lock_device".to_string(),
                ));
            }
        },
    };

    Ok(grant(catalog, identity, req, candidate))
}

/// `loadAndAllCuAlloc` (spec.md §4.D): loads `path` then grants one maximum-load channel on
/// every CU of the freshly loaded device, to `req.client_id`.
pub fn allocate_and_lock_device(
    catalog: &mut Catalog,
    identity: &mut IdentityService,
    driver: &dyn DeviceDriver,
    req: &CuRequest,
    path: &str,
    device_id: Option<u32>,
) -> XrmResult<Vec<Grant>> {
    validate(req)?;
    let loaded_device_id = load_image(catalog, driver, path, device_id)?;
    let device = catalog.device_mut(loaded_device_id)?;
    let cu_ids: Vec<u32> = device.cus.iter().map(|cu| cu.cu_id).collect();

    let mut grants = Vec::with_capacity(cu_ids.len());
    for cu_id in cu_ids {
        let mut full_req = req.clone();
        full_req.device = crate::request::DeviceConstraint::Specific(loaded_device_id);
        full_req.unified_load = UNIFIED_MAX;
        full_req.original_load = 100;
        let candidate = Candidate {
            device_id: loaded_device_id,
            cu_id,
            cu_used_load: 0,
            device_used_load: 0,
        };
        grants.push(grant(catalog, identity, &full_req, candidate));
    }
    catalog.device_mut(loaded_device_id)?.is_exclusive = true;
    Ok(grants)
}

fn load_image(
    catalog: &mut Catalog,
    driver: &dyn DeviceDriver,
    path: &str,
    device_id: Option<u32>,
) -> XrmResult<u32> {
    match device_id {
        Some(id) => {
            let dev = catalog.device(id)?;
            if !dev.enabled {
                return Err(XrmError::InvalidRequest(format!(
                    "device {id} is disabled"
                )));
            }
            let image = driver
                .load(id, path)
                .map_err(|e| XrmError::DriverError(e.0))?;
            let dev = catalog.device_mut(id)?;
            dev.image = Some(image);
            dev.is_loaded = true;
            Ok(id)
        }
        None => {
            let (id, image) = driver
                .load_any(path, catalog.devices())
                .map_err(|e| XrmError::DriverError(e.0))?;
            let dev = catalog.device_mut(id)?;
            dev.image = Some(image);
            dev.is_loaded = true;
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Cu, CuKind, Device};
    use crate::driver::SimDriver;
    use crate::request::{DeviceConstraint, MatchKey, PolicyInfo};

    fn one_device_one_cu(max_pct: u32) -> Catalog {
        let mut dev = Device::new(0, "dev0");
        dev.is_loaded = true;
        dev.cus = vec![Cu::new(0, CuKind::IpKernel, "scaler", "scaler_alias", "inst0")
            .with_max_capacity(max_pct as u64)];
        Catalog::new(vec![dev])
    }

    fn req(load: u32) -> CuRequest {
        CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: load,
            original_load: 45,
            client_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn s1_first_fit_single_cu() {
        let mut catalog = one_device_one_cu(100);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let g = allocate(&mut catalog, &mut identity, &driver, &req(450_000)).unwrap();
        assert_eq!((g.device_id, g.cu_id, g.channel_id, g.alloc_service_id), (0, 0, 0, 1));
        assert_eq!(catalog.device(0).unwrap().cus[0].used_load, 450_000);
    }

    #[test]
    fn s2_capacity_rejection() {
        let mut catalog = one_device_one_cu(100);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        allocate(&mut catalog, &mut identity, &driver, &req(450_000)).unwrap();
        allocate(&mut catalog, &mut identity, &driver, &req(450_000)).unwrap();
        let err = allocate(&mut catalog, &mut identity, &driver, &req(450_000)).unwrap_err();
        assert!(matches!(err, XrmError::NoCapacity));
        assert_eq!(catalog.device(0).unwrap().cus[0].used_load, 900_000);
    }

    #[test]
    fn dev_excl_blocks_other_clients() {
        let mut dev = Device::new(0, "dev0");
        dev.is_loaded = true;
        dev.cus = vec![
            Cu::new(0, CuKind::IpKernel, "k", "k_alias", "i0"),
            Cu::new(1, CuKind::IpKernel, "k", "k_alias", "i1"),
        ];
        let mut catalog = Catalog::new(vec![dev]);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let mut r1 = req(100_000);
        r1.client_id = 1;
        r1.dev_excl = true;
        allocate(&mut catalog, &mut identity, &driver, &r1).unwrap();
        assert!(catalog.device(0).unwrap().is_exclusive);

        let mut r2 = req(100_000);
        r2.client_id = 2;
        let err = allocate(&mut catalog, &mut identity, &driver, &r2).unwrap_err();
        assert!(matches!(err, XrmError::ExclusiveConflict));
    }

    #[test]
    fn v2_least_used_device_then_least_used_cu() {
        let mut d0 = Device::new(0, "d0");
        d0.is_loaded = true;
        d0.cus = vec![Cu::new(0, CuKind::IpKernel, "k", "k_a", "i0")];
        d0.cus[0].used_load = 100_000;

        let mut d1 = Device::new(1, "d1");
        d1.is_loaded = true;
        d1.cus = vec![Cu::new(0, CuKind::IpKernel, "k", "k_a", "i0")];

        let mut catalog = Catalog::new(vec![d0, d1]);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let mut r = req(10_000);
        r.policy = PlacementPolicy::V2(PolicyInfo {
            device: UsagePreference::LeastUsed,
            cu: UsagePreference::Any,
        });
        let g = allocate(&mut catalog, &mut identity, &driver, &r).unwrap();
        assert_eq!(g.device_id, 1);
    }

    #[test]
    fn from_device_restricts_candidates() {
        let mut d0 = Device::new(0, "d0");
        d0.is_loaded = true;
        d0.cus = vec![Cu::new(0, CuKind::IpKernel, "k", "k_a", "i0")];
        let mut d1 = Device::new(1, "d1");
        d1.is_loaded = true;
        d1.cus = vec![Cu::new(0, CuKind::IpKernel, "k", "k_a", "i0")];
        let mut catalog = Catalog::new(vec![d0, d1]);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let mut r = req(10_000);
        r.policy = PlacementPolicy::FromDevice(1);
        r.device = DeviceConstraint::Specific(1);
        let g = allocate(&mut catalog, &mut identity, &driver, &r).unwrap();
        assert_eq!(g.device_id, 1);
    }

    #[test]
    fn invalid_request_without_match_key() {
        let mut catalog = one_device_one_cu(100);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();
        let mut r = req(10_000);
        r.match_key = MatchKey::default();
        let err = allocate(&mut catalog, &mut identity, &driver, &r).unwrap_err();
        assert!(matches!(err, XrmError::InvalidRequest(_)));
    }

    #[test]
    fn draw_against_unknown_pool_is_unknown_pool_not_no_capacity() {
        let mut catalog = one_device_one_cu(100);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();
        let mut r = req(10_000);
        r.pool_id = 999;
        let err = allocate(&mut catalog, &mut identity, &driver, &r).unwrap_err();
        assert!(matches!(err, XrmError::UnknownPool(999)));
    }

    #[test]
    fn draw_exceeding_a_real_pools_quota_is_pool_empty() {
        let mut catalog = one_device_one_cu(100);
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let cu = &mut catalog.device_mut(0).unwrap().cus[0];
        cu.reserves.push(crate::catalog::Reserve {
            pool_id: 7,
            reserve_load: 100_000,
            client_id: 1,
        });
        cu.used_load += 100_000;
        let mut r = req(200_000);
        r.pool_id = 7;
        let err = allocate(&mut catalog, &mut identity, &driver, &r).unwrap_err();
        assert!(matches!(err, XrmError::PoolEmpty(7)));
    }
}
