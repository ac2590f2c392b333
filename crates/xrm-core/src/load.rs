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

//! Load granularity conversion (spec.md §3 "Load scale").
//!
//! A CU's capacity is accounted on a single unified scale of `[1, UNIFIED_MAX]`. Callers may
//! instead describe their request as a percentage (`[1, 100]`); this module turns either
//! encoding into the unified value the rest of the crate works with.

use crate::error::XrmError;

/// Upper bound of the unified load scale. A CU is full when its used load reaches this value.
pub const UNIFIED_MAX: u32 = 1_000_000;

/// The granularity a caller expressed `requestLoad` in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLoad {
    /// Already on the unified `[1, 1_000_000]` scale.
    Unified(u32),
    /// A percentage in `[1, 100]`.
    Percent(u32),
}

impl RequestLoad {
    /// Converts this request load to the unified scale, validating its range.
    pub fn to_unified(self) -> Result<u32, XrmError> {
        match self {
            RequestLoad::Unified(v) => {
                if v == 0 || v > UNIFIED_MAX {
                    Err(XrmError::InvalidRequest(format!(
                        "unified load {v} out of range [1, {UNIFIED_MAX}]"
                    )))
                } else {
                    Ok(v)
                }
            }
            RequestLoad::Percent(v) => {
                if v == 0 || v > 100 {
                    Err(XrmError::InvalidRequest(format!(
                        "percent load {v} out of range [1, 100]"
                    )))
                } else {
                    Ok(v * (UNIFIED_MAX / 100))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_boundaries() {
        assert_eq!(RequestLoad::Percent(1).to_unified().unwrap(), 10_000);
        assert_eq!(RequestLoad::Percent(100).to_unified().unwrap(), UNIFIED_MAX);
        assert_eq!(RequestLoad::Percent(45).to_unified().unwrap(), 450_000);
    }

    #[test]
    fn percent_out_of_range() {
        assert!(RequestLoad::Percent(0).to_unified().is_err());
        assert!(RequestLoad::Percent(101).to_unified().is_err());
    }

    #[test]
    fn unified_boundaries() {
        assert_eq!(RequestLoad::Unified(1).to_unified().unwrap(), 1);
        assert_eq!(
            RequestLoad::Unified(UNIFIED_MAX).to_unified().unwrap(),
            UNIFIED_MAX
        );
    }

    #[test]
    fn unified_out_of_range() {
        assert!(RequestLoad::Unified(0).to_unified().is_err());
        assert!(RequestLoad::Unified(UNIFIED_MAX + 1).to_unified().is_err());
    }
}
