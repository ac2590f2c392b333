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

//! The external wire shape (spec.md §6): a flat key→value tree, with list fields encoded by
//! suffixing the element index (`kernelName0`, `kernelName1`, ... plus a count field).
//!
//! This module only demonstrates the shape and the status-code projection; it is not a
//! dispatcher. Decoding a specific command's parameters into an `xrm_core::request::CuRequest`
//! and re-encoding its `Grant` is the transport layer's job, built on top of these primitives.

use std::collections::BTreeMap;

use xrm_core::StatusKind;

/// A decoded request envelope (spec.md §6 "request" subtree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub name: String,
    pub request_id: u64,
    pub parameters: BTreeMap<String, String>,
}

/// An encoded response envelope (spec.md §6 "response" subtree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub name: String,
    pub request_id: u64,
    pub status_value: i32,
    pub data: BTreeMap<String, String>,
}

impl WireResponse {
    pub fn ok(name: impl Into<String>, request_id: u64, data: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            request_id,
            status_value: 0,
            data,
        }
    }

    pub fn error(name: impl Into<String>, request_id: u64, kind: StatusKind) -> Self {
        Self {
            name: name.into(),
            request_id,
            status_value: status_code(kind),
            data: BTreeMap::new(),
        }
    }
}

/// Projects a [`StatusKind`] onto the negative integer the wire format has standardized on
/// (spec.md §7 "at the transport edge, project the error kind to the stable integer code").
pub fn status_code(kind: StatusKind) -> i32 {
    match kind {
        StatusKind::Ok => 0,
        StatusKind::InvalidRequest => -1,
        StatusKind::NoDevice => -2,
        StatusKind::NoCapacity => -3,
        StatusKind::ExclusiveConflict => -4,
        StatusKind::PoolEmpty => -5,
        StatusKind::UnknownAlloc => -6,
        StatusKind::UnknownPool => -7,
        StatusKind::UnknownGroup => -8,
        StatusKind::CapReached => -9,
        StatusKind::DriverError => -10,
        StatusKind::Cancelled => -11,
    }
}

/// Encodes an ordered list of values as `{prefix}0`, `{prefix}1`, ... plus a `{countField}`
/// entry (spec.md §6 "Lists are encoded by suffixing field names with the element index").
pub fn encode_indexed_list(
    out: &mut BTreeMap<String, String>,
    prefix: &str,
    count_field: &str,
    values: &[String],
) {
    out.insert(count_field.to_string(), values.len().to_string());
    for (i, v) in values.iter().enumerate() {
        out.insert(format!("{prefix}{i}"), v.clone());
    }
}

/// Decodes a flat indexed list previously written by [`encode_indexed_list`].
pub fn decode_indexed_list(
    parameters: &BTreeMap<String, String>,
    prefix: &str,
    count_field: &str,
) -> Vec<String> {
    let count: usize = parameters
        .get(count_field)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    (0..count)
        .filter_map(|i| parameters.get(&format!("{prefix}{i}")).cloned())
        .collect()
}

/// Parses a lowercase 32-hex-character UUID string into its 16 raw bytes (spec.md §6 "UUID
/// strings arrive as lowercase hex, 32 characters").
pub fn parse_uuid_hex(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}
