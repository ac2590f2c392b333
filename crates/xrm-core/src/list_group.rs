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

//! CU-list and CU-group allocation (spec.md §4.E): both are "all or nothing" compositions over
//! the single-CU placement engine (`crate::placement`).

use crate::catalog::Catalog;
use crate::driver::DeviceDriver;
use crate::error::{XrmError, XrmResult};
use crate::group::GroupRegistry;
use crate::identity::IdentityService;
use crate::placement;
use crate::request::{CuListRequest, DeviceConstraint, Grant};

/// Allocates every sub-request of `list`, rolling the whole catalog back to its pre-attempt
/// state if any sub-request fails (spec.md §4.E "A list either fully succeeds or fully fails").
pub fn allocate_list(
    catalog: &mut Catalog,
    identity: &mut IdentityService,
    driver: &dyn DeviceDriver,
    list: &CuListRequest,
) -> XrmResult<Vec<Grant>> {
    if list.requests.is_empty() {
        return Err(XrmError::InvalidRequest(
            "cu list request has no entries".to_string(),
        ));
    }

    if list.same_device {
        return allocate_list_same_device(catalog, identity, driver, list);
    }

    let snapshot = catalog.clone();
    let mut grants = Vec::with_capacity(list.requests.len());
    for req in &list.requests {
        match placement::allocate(catalog, identity, driver, req) {
            Ok(g) => grants.push(g),
            Err(e) => {
                *catalog = snapshot;
                return Err(e);
            }
        }
    }
    Ok(grants)
}

/// Tries every enabled, loaded device in ascending id order as the single host for the whole
/// list, restoring the snapshot between attempts (spec.md §4.E "sameDevice").
fn allocate_list_same_device(
    catalog: &mut Catalog,
    identity: &mut IdentityService,
    driver: &dyn DeviceDriver,
    list: &CuListRequest,
) -> XrmResult<Vec<Grant>> {
    let snapshot = catalog.clone();
    let device_ids: Vec<u32> = catalog
        .devices()
        .iter()
        .filter(|d| d.usable())
        .map(|d| d.device_id)
        .collect();

    if device_ids.is_empty() {
        return Err(XrmError::NoDevice);
    }

    let mut last_err = XrmError::NoCapacity;
    for device_id in device_ids {
        let mut grants = Vec::with_capacity(list.requests.len());
        let mut failed = false;
        for req in &list.requests {
            let mut pinned = req.clone();
            pinned.device = DeviceConstraint::Specific(device_id);
            match placement::allocate(catalog, identity, driver, &pinned) {
                Ok(g) => grants.push(g),
                Err(e) => {
                    last_err = e;
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            return Ok(grants);
        }
        *catalog = snapshot.clone();
    }
    Err(last_err)
}

/// Allocates a user-declared CU group (spec.md §4.C, §4.E): tries each option template in
/// declaration order, accepting the first that fully succeeds.
pub fn allocate_group(
    catalog: &mut Catalog,
    identity: &mut IdentityService,
    driver: &dyn DeviceDriver,
    groups: &GroupRegistry,
    group_name: &str,
) -> XrmResult<Vec<Grant>> {
    let template = groups.get(group_name)?;
    let snapshot = catalog.clone();

    let mut last_err = XrmError::NoCapacity;
    for option in &template.options {
        match allocate_list(catalog, identity, driver, option) {
            Ok(grants) => return Ok(grants),
            Err(e) => {
                last_err = e;
                *catalog = snapshot.clone();
            }
        }
    }
    Err(last_err)
}

/// Releases every channel a single list/group allocation produced; used both by explicit release
/// calls and by client-reclamation (spec.md §4.G).
///
/// Best-effort, per spec.md §4.G: every element is attempted even after an earlier one fails;
/// the overall result is `Ok` iff every element released cleanly.
pub fn release_grants(catalog: &mut Catalog, grants: &[Grant]) -> XrmResult<()> {
    let mut first_err = None;
    for g in grants {
        if let Err(e) = release_one(catalog, g.device_id, g.cu_id, g.channel_id, g.alloc_service_id) {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Releases one channel, keyed by `alloc_service_id` (spec.md §4.G: "locate the channel row by
/// allocServiceId (primary key; the triple is a consistency check)"). `device_id`/`cu_id`/
/// `channel_id` are validated against the row actually found, not used to locate it.
pub(crate) fn release_one(
    catalog: &mut Catalog,
    device_id: u32,
    cu_id: u32,
    channel_id: u32,
    alloc_service_id: u64,
) -> XrmResult<()> {
    let device = catalog.device_mut(device_id)?;
    let cu = device
        .cus
        .iter_mut()
        .find(|cu| cu.cu_id == cu_id)
        .ok_or(XrmError::UnknownAlloc(alloc_service_id))?;
    let idx = cu
        .channels
        .iter()
        .position(|c| c.alloc_service_id == alloc_service_id)
        .ok_or(XrmError::UnknownAlloc(alloc_service_id))?;
    if cu.channels[idx].channel_id != channel_id {
        tracing::warn!(
            alloc_service_id,
            expected = cu.channels[idx].channel_id,
            supplied = channel_id,
            "channel id mismatch on release; allocServiceId is authoritative"
        );
    }
    let channel = cu.channels.remove(idx);
    if channel.pool_id == 0 {
        cu.used_load = cu.used_load.saturating_sub(channel.unified_load);
    }
    cu.num_chan_inuse = cu.num_chan_inuse.saturating_sub(1);
    if device.is_exclusive && device.is_idle() {
        device.is_exclusive = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Cu, CuKind, Device};
    use crate::driver::SimDriver;
    use crate::group::CuGroupTemplate;
    use crate::request::{CuRequest, MatchKey};

    fn two_devices() -> Catalog {
        let mut d0 = Device::new(0, "d0");
        d0.is_loaded = true;
        d0.cus = vec![Cu::new(0, CuKind::IpKernel, "a", "a_alias", "i0")];
        let mut d1 = Device::new(1, "d1");
        d1.is_loaded = true;
        d1.cus = vec![
            Cu::new(0, CuKind::IpKernel, "a", "a_alias", "i0"),
            Cu::new(1, CuKind::IpKernel, "b", "b_alias", "i1"),
        ];
        Catalog::new(vec![d0, d1])
    }

    fn req(kernel: &str, load: u32) -> CuRequest {
        CuRequest {
            match_key: MatchKey::by_kernel_name(kernel),
            unified_load: load,
            original_load: 10,
            client_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn same_device_finds_device_hosting_both_kernels() {
        let mut catalog = two_devices();
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let list = CuListRequest {
            requests: vec![req("a", 10_000), req("b", 10_000)],
            same_device: true,
        };
        let grants = allocate_list(&mut catalog, &mut identity, &driver, &list).unwrap();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].device_id, grants[1].device_id);
        assert_eq!(grants[0].device_id, 1);
    }

    #[test]
    fn list_rolls_back_on_partial_failure() {
        let mut catalog = two_devices();
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let list = CuListRequest {
            requests: vec![req("a", 10_000), req("missing", 10_000)],
            same_device: false,
        };
        let err = allocate_list(&mut catalog, &mut identity, &driver, &list).unwrap_err();
        assert!(matches!(err, XrmError::NoCapacity));
        assert_eq!(catalog.device(0).unwrap().cus[0].used_load, 0);
        assert_eq!(catalog.device(1).unwrap().cus[0].used_load, 0);
    }

    #[test]
    fn group_falls_through_to_second_option() {
        let mut catalog = two_devices();
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();
        let mut groups = GroupRegistry::new();
        groups
            .declare(CuGroupTemplate {
                name: "g1".to_string(),
                options: vec![
                    CuListRequest {
                        requests: vec![req("missing", 10_000)],
                        same_device: false,
                    },
                    CuListRequest {
                        requests: vec![req("b", 10_000)],
                        same_device: false,
                    },
                ],
            })
            .unwrap();

        let grants = allocate_group(&mut catalog, &mut identity, &driver, &groups, "g1").unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].device_id, 1);
    }

    #[test]
    fn release_grants_restores_capacity() {
        let mut catalog = two_devices();
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();

        let list = CuListRequest {
            requests: vec![req("a", 10_000)],
            same_device: false,
        };
        let grants = allocate_list(&mut catalog, &mut identity, &driver, &list).unwrap();
        release_grants(&mut catalog, &grants).unwrap();
        assert_eq!(catalog.device(0).unwrap().cus[0].used_load, 0);
    }
}
