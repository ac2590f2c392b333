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

//! The compute-unit resource manager core: a device/CU catalog, a placement engine, reservation
//! pools, user-defined CU groups and client lifecycle tracking, all mutated through one
//! serialized gate (see [`manager::Manager`]).
//!
//! This crate has no transport of its own -- it is consumed by something that decodes requests
//! off the wire, calls into [`Manager`](manager::Manager), and re-encodes the result. It also has
//! no device-driver bindings of its own; [`driver::DeviceDriver`] is the seam a caller plugs a
//! real one into.

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod group;
pub mod identity;
pub mod lifecycle;
pub mod list_group;
pub mod load;
pub mod manager;
pub mod placement;
pub mod request;
pub mod reservation;

pub use error::{StatusKind, XrmError, XrmResult};
pub use manager::Manager;
