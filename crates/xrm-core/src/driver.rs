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

//! The device-driver seam (spec.md §1, §9 "Client-death detection" sibling note).
//!
//! Loading and enumerating bitstream images is explicitly out of scope for this crate (spec.md
//! §1): "the device-driver bindings that actually load bitstreams and report device capabilities"
//! are an external collaborator. [`DeviceDriver`] is the narrow interface the core consumes from
//! it. The gate (`Manager`) holds its lock while calling into the driver, matching spec.md §5:
//! "the driver call is allowed to block."

use crate::catalog::{Cu, Device, Image};

/// Errors surfaced by a driver binding; wrapped into [`crate::error::XrmError::DriverError`] by
/// the manager.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

/// The narrow interface the core consumes from the device-driver bindings.
pub trait DeviceDriver: Send {
    /// Enumerates every device at startup, in ascending device-id order.
    fn enumerate(&self) -> Result<Vec<Device>, DriverError>;

    /// Loads `path` onto `device_id`, returning the image metadata the driver resolved. Called
    /// while the gate is held; may block.
    fn load(&self, device_id: u32, path: &str) -> Result<Image, DriverError>;

    /// Loads `path` onto any currently-unloaded, enabled device, returning the device id chosen.
    fn load_any(&self, path: &str, devices: &[Device]) -> Result<(u32, Image), DriverError>;

    /// Unloads whatever image is currently on `device_id`.
    fn unload(&self, device_id: u32) -> Result<(), DriverError>;
}

/// An in-memory [`DeviceDriver`] double, used by tests and by `xrm-daemon`'s demo mode in the
/// absence of real hardware.
#[derive(Debug, Default)]
pub struct SimDriver {
    /// Canned devices returned by [`enumerate`](DeviceDriver::enumerate). Subsequent `load`
    /// calls only ever rewrite an already-enumerated device's image metadata.
    seed: Vec<Device>,
}

impl SimDriver {
    pub fn new(seed: Vec<Device>) -> Self {
        Self { seed }
    }
}

impl DeviceDriver for SimDriver {
    fn enumerate(&self) -> Result<Vec<Device>, DriverError> {
        Ok(self.seed.clone())
    }

    fn load(&self, device_id: u32, path: &str) -> Result<Image, DriverError> {
        Ok(Image {
            uuid: uuid::Uuid::new_v4().into_bytes(),
            file_name: path.to_string(),
            num_cu: self
                .seed
                .iter()
                .find(|d| d.device_id == device_id)
                .map(|d| d.cus.len() as u32)
                .unwrap_or(0),
        })
    }

    fn load_any(&self, path: &str, devices: &[Device]) -> Result<(u32, Image), DriverError> {
        let dev = devices
            .iter()
            .find(|d| d.enabled && !d.is_loaded)
            .ok_or_else(|| DriverError("no free device to load onto".to_string()))?;
        Ok((dev.device_id, self.load(dev.device_id, path)?))
    }

    fn unload(&self, _device_id: u32) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Returns a fixed set of CUs for a device, used to build [`SimDriver`] seeds in tests without
/// repeating the boilerplate of constructing [`Cu`] values by hand.
pub fn flat_cus(kernel_name: &str, count: u32) -> Vec<Cu> {
    (0..count)
        .map(|i| {
            Cu::new(
                i,
                crate::catalog::CuKind::IpKernel,
                kernel_name,
                format!("{kernel_name}_alias"),
                format!("inst{i}"),
            )
        })
        .collect()
}
