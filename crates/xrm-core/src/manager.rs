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

//! The single owner object and its serialized mutator gate (spec.md §4.H, §5, §9 "Global
//! mutable state guarded by one lock").
//!
//! `Manager` holds the catalog, identity counters, group registry and client table behind one
//! `std::sync::Mutex`. Every externally visible operation acquires it once, does its work
//! synchronously, and releases it -- except blocking allocation, which releases the gate while
//! it sleeps between retries so other callers can make progress (spec.md §4.H).

use std::sync::Mutex;

use tracing::{instrument, warn};

use crate::catalog::{Catalog, Device};
use crate::config::ManagerConfig;
use crate::driver::DeviceDriver;
use crate::error::{XrmError, XrmResult};
use crate::group::{CuGroupTemplate, GroupRegistry};
use crate::identity::IdentityService;
use crate::lifecycle::{ClientTable, HeldChannel};
use crate::list_group;
use crate::placement;
use crate::request::{
    BlockingOptions, CuListRequest, CuRequest, Grant, MatchKey, PoolGrant, PoolRequest,
};
use crate::reservation;

struct ManagerState {
    catalog: Catalog,
    identity: IdentityService,
    groups: GroupRegistry,
    clients: ClientTable,
}

/// The resource manager's single owner object (spec.md §4.H).
pub struct Manager {
    state: Mutex<ManagerState>,
    config: ManagerConfig,
}

impl Manager {
    /// Builds a manager around an already-enumerated device set (spec.md §4.A startup).
    pub fn new(devices: Vec<Device>, config: ManagerConfig) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                catalog: Catalog::new(devices),
                identity: IdentityService::new(config.max_concurrent_clients),
                groups: GroupRegistry::new(),
                clients: ClientTable::new(),
            }),
            config,
        }
    }

    /// Builds a manager by enumerating devices from `driver` at startup.
    pub fn from_driver(driver: &dyn DeviceDriver, config: ManagerConfig) -> XrmResult<Self> {
        let devices = driver
            .enumerate()
            .map_err(|e| XrmError::DriverError(e.0))?;
        Ok(Self::new(devices, config))
    }

    // ---- 4.B identity / lifecycle -----------------------------------------------------------

    /// `createContext` (spec.md §4.B): mints a client id, or [`crate::identity::NO_CLIENT`] if
    /// the concurrency cap is reached.
    #[instrument(skip(self))]
    pub fn create_context(&self, process_id: Option<i32>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let client_id = state.identity.new_client_id();
        if client_id == crate::identity::NO_CLIENT {
            warn!("createContext rejected: concurrent client cap reached");
            return client_id;
        }
        state.clients.register(client_id, process_id);
        client_id
    }

    /// `echoContext` (spec.md §6): a liveness probe that costs nothing beyond a table lookup.
    pub fn echo_context(&self, client_id: u64) -> bool {
        self.state.lock().unwrap().clients.is_registered(client_id)
    }

    /// `destroyContext` (spec.md §4.G), also used for the unsolicited-disconnect path via
    /// [`Manager::drop_client`] -- the two are the same operation from the core's perspective
    /// (spec.md §4.H "Client-death detection").
    #[instrument(skip(self))]
    pub fn destroy_context(&self, client_id: u64) -> XrmResult<()> {
        self.drop_client(client_id)
    }

    /// Entry point the transport layer calls once it detects a client is gone, by whatever
    /// means (spec.md §4.H).
    pub fn drop_client(&self, client_id: u64) -> XrmResult<()> {
        let mut state = self.state.lock().unwrap();
        let ManagerState {
            catalog,
            identity,
            clients,
            ..
        } = &mut *state;
        clients.drop_client(catalog, identity, client_id)
    }

    pub fn is_daemon_running(&self) -> bool {
        true
    }

    // ---- 4.A catalog reads --------------------------------------------------------------

    pub fn max_capacity(&self, key: &MatchKey) -> u64 {
        self.state.lock().unwrap().catalog.max_capacity(key)
    }

    pub fn is_cu_existing(&self, key: &MatchKey) -> bool {
        self.state.lock().unwrap().catalog.is_cu_existing(key)
    }

    /// `deviceCount` (spec.md §4.A).
    pub fn device_count(&self) -> u32 {
        self.state.lock().unwrap().catalog.device_count()
    }

    /// `listDevice` (spec.md §4.A): a snapshot of one device's current state.
    pub fn list_device(&self, device_id: u32) -> XrmResult<Device> {
        self.state
            .lock()
            .unwrap()
            .catalog
            .device(device_id)
            .map(|d| d.clone())
    }

    /// Invariant I1 (spec.md §8): `usedLoad` ties out against live channels plus reserves on
    /// every CU. Intended for test harnesses, not a transport-facing operation.
    pub fn accounting_is_consistent(&self) -> bool {
        self.state.lock().unwrap().catalog.accounting_is_consistent()
    }

    pub fn is_cu_list_existing(&self, keys: &[MatchKey]) -> bool {
        let state = self.state.lock().unwrap();
        keys.iter().all(|k| state.catalog.is_cu_existing(k))
    }

    pub fn is_cu_group_existing(&self, group_name: &str) -> bool {
        self.state.lock().unwrap().groups.exists(group_name)
    }

    pub fn available_count(&self, req: &CuRequest) -> u32 {
        placement::available_count(&self.state.lock().unwrap().catalog, req)
    }

    pub fn available_count_list(&self, list: &CuListRequest) -> u32 {
        let state = self.state.lock().unwrap();
        list.requests
            .iter()
            .map(|r| placement::available_count(&state.catalog, r))
            .min()
            .unwrap_or(0)
    }

    pub fn available_count_group(&self, group_name: &str) -> XrmResult<u32> {
        let state = self.state.lock().unwrap();
        let template = state.groups.get(group_name)?;
        Ok(template
            .options
            .iter()
            .map(|list| {
                list.requests
                    .iter()
                    .map(|r| placement::available_count(&state.catalog, r))
                    .min()
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0))
    }

    pub fn enable_device(&self, device_id: u32) -> XrmResult<()> {
        self.state.lock().unwrap().catalog.enable_device(device_id)
    }

    pub fn disable_device(&self, device_id: u32) -> XrmResult<()> {
        self.state.lock().unwrap().catalog.disable_device(device_id)
    }

    // ---- 4.C groups -----------------------------------------------------------------------

    pub fn declare_group(&self, template: CuGroupTemplate) -> XrmResult<()> {
        self.state.lock().unwrap().groups.declare(template)
    }

    pub fn undeclare_group(&self, name: &str) -> XrmResult<()> {
        self.state.lock().unwrap().groups.undeclare(name)
    }

    // ---- 4.D / 4.E placement ----------------------------------------------------------------

    /// Single-CU allocation (spec.md §4.D). On success, registers the channel against
    /// `req.client_id` in the client table for later reclamation.
    #[instrument(skip(self, driver, req), fields(client_id = req.client_id))]
    pub fn alloc(&self, driver: &dyn DeviceDriver, req: &CuRequest) -> XrmResult<Grant> {
        let mut state = self.state.lock().unwrap();
        if !state.clients.is_registered(req.client_id) {
            return Err(XrmError::InvalidRequest(format!(
                "client {} has no context",
                req.client_id
            )));
        }
        let grant = placement::allocate(&mut state.catalog, &mut state.identity, driver, req)?;
        state
            .clients
            .record_channel(req.client_id, HeldChannel::from(&grant));
        Ok(grant)
    }

    /// Blocking variant of [`Manager::alloc`] (spec.md §4.E "Blocking variants", §4.H): retries
    /// outside the gate on a timer until it either succeeds or observes the owning client has
    /// died. No timeout is offered (spec.md §5) -- a bounded wait is the caller's job, achieved
    /// by retrying the non-blocking form instead.
    pub fn alloc_blocking(
        &self,
        driver: &dyn DeviceDriver,
        req: &CuRequest,
        opts: BlockingOptions,
    ) -> XrmResult<Grant> {
        let interval = opts
            .retry_interval
            .unwrap_or_else(|| self.config.default_blocking_retry_interval());

        loop {
            match self.alloc(driver, req) {
                Ok(g) => return Ok(g),
                Err(XrmError::NoCapacity | XrmError::NoDevice | XrmError::PoolEmpty(_)) => {}
                Err(e) => return Err(e),
            }
            if !self.echo_context(req.client_id) {
                return Err(XrmError::Cancelled);
            }
            std::thread::sleep(interval);
        }
    }

    pub fn alloc_list(
        &self,
        driver: &dyn DeviceDriver,
        client_id: u64,
        list: &CuListRequest,
    ) -> XrmResult<Vec<Grant>> {
        let mut state = self.state.lock().unwrap();
        if !state.clients.is_registered(client_id) {
            return Err(XrmError::InvalidRequest(format!(
                "client {client_id} has no context"
            )));
        }
        let grants =
            list_group::allocate_list(&mut state.catalog, &mut state.identity, driver, list)?;
        for g in &grants {
            state.clients.record_channel(client_id, HeldChannel::from(g));
        }
        Ok(grants)
    }

    pub fn alloc_group(
        &self,
        driver: &dyn DeviceDriver,
        client_id: u64,
        group_name: &str,
    ) -> XrmResult<Vec<Grant>> {
        let mut state = self.state.lock().unwrap();
        if !state.clients.is_registered(client_id) {
            return Err(XrmError::InvalidRequest(format!(
                "client {client_id} has no context"
            )));
        }
        let ManagerState {
            catalog,
            identity,
            groups,
            ..
        } = &mut *state;
        let grants = list_group::allocate_group(catalog, identity, driver, groups, group_name)?;
        for g in &grants {
            state.clients.record_channel(client_id, HeldChannel::from(g));
        }
        Ok(grants)
    }

    pub fn release(&self, client_id: u64, grant: &Grant) -> XrmResult<()> {
        self.release_list(client_id, std::slice::from_ref(grant))
    }

    pub fn release_list(&self, client_id: u64, grants: &[Grant]) -> XrmResult<()> {
        let mut state = self.state.lock().unwrap();
        let result = list_group::release_grants(&mut state.catalog, grants);
        for g in grants {
            state.clients.forget_channel(client_id, g.alloc_service_id);
        }
        result
    }

    // ---- 4.F reservations -------------------------------------------------------------------

    pub fn reserve_pool(&self, driver: &dyn DeviceDriver, req: &PoolRequest) -> XrmResult<PoolGrant> {
        let mut state = self.state.lock().unwrap();
        if !state.clients.is_registered(req.client_id) {
            return Err(XrmError::InvalidRequest(format!(
                "client {} has no context",
                req.client_id
            )));
        }
        let grant = reservation::reserve(&mut state.catalog, &mut state.identity, driver, req)?;
        state.clients.record_pool(req.client_id, grant.pool_id);
        Ok(grant)
    }

    pub fn relinquish_pool(&self, client_id: u64, pool_id: u64) -> XrmResult<()> {
        let mut state = self.state.lock().unwrap();
        reservation::release_pool(&mut state.catalog, pool_id)?;
        state.clients.forget_pool(client_id, pool_id);
        Ok(())
    }

    /// `checkCuPoolAvailableNum` (spec.md §4.F): how many independent copies of `req` could be
    /// reserved right now. Probes against a scratch snapshot; never mutates live state.
    pub fn check_pool_available_num(&self, driver: &dyn DeviceDriver, req: &PoolRequest) -> u32 {
        let state = self.state.lock().unwrap();
        reservation::check_available_num(&state.catalog, &state.identity, driver, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Cu, CuKind};
    use crate::driver::SimDriver;

    fn manager_with_one_cu() -> Manager {
        let mut dev = Device::new(0, "dev0");
        dev.is_loaded = true;
        dev.cus = vec![Cu::new(0, CuKind::IpKernel, "scaler", "scaler_a", "i0")];
        Manager::new(vec![dev], ManagerConfig::default())
    }

    #[test]
    fn s1_create_context_then_alloc_then_release() {
        let mgr = manager_with_one_cu();
        let driver = SimDriver::default();
        let client_id = mgr.create_context(Some(1));
        assert_ne!(client_id, crate::identity::NO_CLIENT);

        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 450_000,
            original_load: 45,
            client_id,
            ..Default::default()
        };
        let grant = mgr.alloc(&driver, &req).unwrap();
        assert_eq!((grant.device_id, grant.cu_id, grant.channel_id, grant.alloc_service_id), (0, 0, 0, 1));

        mgr.release(client_id, &grant).unwrap();
        assert_eq!(mgr.max_capacity(&MatchKey::by_kernel_name("scaler")), 0);
    }

    #[test]
    fn alloc_without_context_is_rejected() {
        let mgr = manager_with_one_cu();
        let driver = SimDriver::default();
        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 10_000,
            client_id: 77,
            ..Default::default()
        };
        assert!(matches!(mgr.alloc(&driver, &req), Err(XrmError::InvalidRequest(_))));
    }

    #[test]
    fn s6_drop_client_reclaims_everything() {
        let mgr = manager_with_one_cu();
        let driver = SimDriver::default();
        let client_id = mgr.create_context(None);
        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 300_000,
            original_load: 30,
            client_id,
            ..Default::default()
        };
        mgr.alloc(&driver, &req).unwrap();
        mgr.drop_client(client_id).unwrap();
        assert!(!mgr.echo_context(client_id));

        let new_client = mgr.create_context(None);
        let req2 = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 1_000_000,
            original_load: 100,
            client_id: new_client,
            ..Default::default()
        };
        mgr.alloc(&driver, &req2).unwrap();
    }

    #[test]
    fn blocking_alloc_retries_until_capacity_frees() {
        let mut config = ManagerConfig::default();
        config.default_blocking_retry_interval_ms = 1;
        let mut dev = Device::new(0, "dev0");
        dev.is_loaded = true;
        dev.cus = vec![Cu::new(0, CuKind::IpKernel, "scaler", "scaler_a", "i0")];
        let mgr = std::sync::Arc::new(Manager::new(vec![dev], config));
        let driver = SimDriver::default();
        let client_id = mgr.create_context(None);

        let hog = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 1_000_000,
            client_id,
            ..Default::default()
        };
        let hog_grant = mgr.alloc(&driver, &hog).unwrap();

        let releaser = {
            let mgr = mgr.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                mgr.release(client_id, &hog_grant).unwrap();
            })
        };

        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 1,
            client_id,
            ..Default::default()
        };
        mgr.alloc_blocking(&driver, &req, BlockingOptions::default())
            .unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn blocking_alloc_returns_cancelled_when_client_dies() {
        let mut config = ManagerConfig::default();
        config.default_blocking_retry_interval_ms = 1;
        let mut dev = Device::new(0, "dev0");
        dev.is_loaded = true;
        dev.cus = vec![Cu::new(0, CuKind::IpKernel, "scaler", "scaler_a", "i0")];
        let mgr = std::sync::Arc::new(Manager::new(vec![dev], config));
        let driver = SimDriver::default();
        let client_id = mgr.create_context(None);
        let hog_client = mgr.create_context(None);

        let hog = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 1_000_000,
            client_id: hog_client,
            ..Default::default()
        };
        mgr.alloc(&driver, &hog).unwrap();

        let killer = {
            let mgr = mgr.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                mgr.drop_client(client_id).unwrap();
            })
        };

        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("scaler"),
            unified_load: 1,
            client_id,
            ..Default::default()
        };
        let err = mgr
            .alloc_blocking(&driver, &req, BlockingOptions::default())
            .unwrap_err();
        assert!(matches!(err, XrmError::Cancelled));
        killer.join().unwrap();
    }

    #[test]
    fn device_count_and_list_device_pass_through() {
        let mgr = manager_with_one_cu();
        assert_eq!(mgr.device_count(), 1);
        let dev = mgr.list_device(0).unwrap();
        assert_eq!(dev.device_id, 0);
        assert!(matches!(mgr.list_device(99), Err(XrmError::InvalidRequest(_))));
    }
}
