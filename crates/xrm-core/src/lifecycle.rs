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

//! Client lifecycle and reclamation (spec.md §4.G).
//!
//! The core only ever learns about client death through [`ClientTable::drop_client`]; whether
//! that call came from an explicit `destroyContext` or from the transport noticing a closed
//! socket is indistinguishable from here (spec.md §4.H "Client-death detection").

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{XrmError, XrmResult};
use crate::identity::IdentityService;
use crate::list_group;
use crate::reservation;
use crate::request::Grant;

/// One channel this client currently holds, enough to drive [`list_group::release_one`].
#[derive(Debug, Clone, Copy)]
pub struct HeldChannel {
    pub device_id: u32,
    pub cu_id: u32,
    pub channel_id: u32,
    pub alloc_service_id: u64,
}

impl From<&Grant> for HeldChannel {
    fn from(g: &Grant) -> Self {
        Self {
            device_id: g.device_id,
            cu_id: g.cu_id,
            channel_id: g.channel_id,
            alloc_service_id: g.alloc_service_id,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ClientRecord {
    process_id: Option<i32>,
    channels: HashMap<u64, HeldChannel>,
    pools: HashSet<u64>,
}

/// The per-client bookkeeping table (spec.md §4.G "Per-client record").
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: HashMap<u64, ClientRecord>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly minted client id (spec.md §4.G `createContext`). A `clientId` of
    /// [`crate::identity::NO_CLIENT`] (the cap-reached sentinel) is never registered.
    pub fn register(&mut self, client_id: u64, process_id: Option<i32>) {
        if client_id == crate::identity::NO_CLIENT {
            return;
        }
        self.clients.insert(
            client_id,
            ClientRecord {
                process_id,
                ..Default::default()
            },
        );
    }

    pub fn is_registered(&self, client_id: u64) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn record_channel(&mut self, client_id: u64, channel: HeldChannel) {
        if let Some(rec) = self.clients.get_mut(&client_id) {
            rec.channels.insert(channel.alloc_service_id, channel);
        }
    }

    pub fn forget_channel(&mut self, client_id: u64, alloc_service_id: u64) {
        if let Some(rec) = self.clients.get_mut(&client_id) {
            rec.channels.remove(&alloc_service_id);
        }
    }

    pub fn record_pool(&mut self, client_id: u64, pool_id: u64) {
        if let Some(rec) = self.clients.get_mut(&client_id) {
            rec.pools.insert(pool_id);
        }
    }

    pub fn forget_pool(&mut self, client_id: u64, pool_id: u64) {
        if let Some(rec) = self.clients.get_mut(&client_id) {
            rec.pools.remove(&pool_id);
        }
    }

    pub fn process_id(&self, client_id: u64) -> Option<i32> {
        self.clients.get(&client_id).and_then(|r| r.process_id)
    }

    pub fn live_client_ids(&self) -> Vec<u64> {
        self.clients.keys().copied().collect()
    }

    /// `destroyContext` / unsolicited-disconnect (spec.md §4.G): releases every channel and
    /// relinquishes every pool the client still owns, then forgets it. Idempotent -- a client
    /// that was already dropped, or whose allocations were already explicitly released, costs
    /// nothing (spec.md §4.G "the core tolerates that some allocations may already have been
    /// explicitly released").
    pub fn drop_client(
        &mut self,
        catalog: &mut Catalog,
        identity: &mut IdentityService,
        client_id: u64,
    ) -> XrmResult<()> {
        let Some(rec) = self.clients.remove(&client_id) else {
            debug!(client_id, "dropClient on an already-unregistered client");
            return Ok(());
        };

        for channel in rec.channels.values() {
            match list_group::release_one(
                catalog,
                channel.device_id,
                channel.cu_id,
                channel.channel_id,
                channel.alloc_service_id,
            ) {
                Ok(()) => {}
                Err(XrmError::UnknownAlloc(_)) => {
                    debug!(
                        client_id,
                        alloc_service_id = channel.alloc_service_id,
                        "channel already released before drop_client ran"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        for pool_id in &rec.pools {
            match reservation::release_pool(catalog, *pool_id) {
                Ok(()) | Err(XrmError::UnknownPool(_)) => {}
                Err(e) => return Err(e),
            }
        }

        identity.retire_client();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Cu, CuKind, Device};
    use crate::driver::SimDriver;
    use crate::placement;
    use crate::request::{CuRequest, MatchKey};

    fn one_device_one_cu() -> Catalog {
        let mut dev = Device::new(0, "dev0");
        dev.is_loaded = true;
        dev.cus = vec![Cu::new(0, CuKind::IpKernel, "k", "k_a", "i0")];
        Catalog::new(vec![dev])
    }

    #[test]
    fn drop_client_releases_its_channels_and_retires_the_id() {
        let mut catalog = one_device_one_cu();
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();
        let mut table = ClientTable::new();

        let client_id = identity.new_client_id();
        table.register(client_id, Some(4242));

        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("k"),
            unified_load: 300_000,
            original_load: 30,
            client_id,
            ..Default::default()
        };
        let grant = placement::allocate(&mut catalog, &mut identity, &driver, &req).unwrap();
        table.record_channel(client_id, HeldChannel::from(&grant));

        table.drop_client(&mut catalog, &mut identity, client_id).unwrap();

        assert_eq!(catalog.device(0).unwrap().cus[0].used_load, 0);
        assert!(!table.is_registered(client_id));
        // A freed concurrency slot lets a new client claim the vacated id-space capacity.
        assert_ne!(identity.new_client_id(), crate::identity::NO_CLIENT);
    }

    #[test]
    fn drop_client_is_idempotent_after_explicit_release() {
        let mut catalog = one_device_one_cu();
        let mut identity = IdentityService::new(10);
        let driver = SimDriver::default();
        let mut table = ClientTable::new();

        let client_id = identity.new_client_id();
        table.register(client_id, None);

        let req = CuRequest {
            match_key: MatchKey::by_kernel_name("k"),
            unified_load: 300_000,
            original_load: 30,
            client_id,
            ..Default::default()
        };
        let grant = placement::allocate(&mut catalog, &mut identity, &driver, &req).unwrap();
        table.record_channel(client_id, HeldChannel::from(&grant));

        list_group::release_grants(&mut catalog, std::slice::from_ref(&grant)).unwrap();
        table.forget_channel(client_id, grant.alloc_service_id);

        // Simulate the transport also reporting the disconnect; must not error even though the
        // channel is already gone from the catalog (record was already forgotten here too, but
        // drop_client must equally tolerate a stale record still pointing at a freed channel).
        table.record_channel(client_id, HeldChannel::from(&grant));
        table.drop_client(&mut catalog, &mut identity, client_id).unwrap();
        assert!(!table.is_registered(client_id));
    }

    #[test]
    fn drop_client_on_unknown_id_is_a_no_op() {
        let mut catalog = one_device_one_cu();
        let mut identity = IdentityService::new(10);
        let mut table = ClientTable::new();
        table.drop_client(&mut catalog, &mut identity, 999).unwrap();
    }
}
