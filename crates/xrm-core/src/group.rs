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

//! User-defined CU group registry (spec.md §4.C).

use std::collections::HashMap;

use crate::error::{XrmError, XrmResult};
use crate::request::CuListRequest;

/// A named disjunction of CU-list templates (spec.md §3 "User-defined CU group template").
/// Allocation tries `options` in declaration order and accepts the first that fits.
#[derive(Debug, Clone)]
pub struct CuGroupTemplate {
    pub name: String,
    pub options: Vec<CuListRequest>,
}

/// Mapping of group name to template.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<String, CuGroupTemplate>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, template: CuGroupTemplate) -> XrmResult<()> {
        if self.groups.contains_key(&template.name) {
            return Err(XrmError::InvalidRequest(format!(
                "cu group {:?} already declared",
                template.name
            )));
        }
        self.groups.insert(template.name.clone(), template);
        Ok(())
    }

    /// Undeclares a group. Succeeds even if live allocations still reference it -- undeclaring
    /// only forbids *new* allocations against the name (spec.md §4.C).
    pub fn undeclare(&mut self, name: &str) -> XrmResult<()> {
        self.groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| XrmError::UnknownGroup(name.to_string()))
    }

    pub fn get(&self, name: &str) -> XrmResult<&CuGroupTemplate> {
        self.groups
            .get(name)
            .ok_or_else(|| XrmError::UnknownGroup(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str) -> CuGroupTemplate {
        CuGroupTemplate {
            name: name.to_string(),
            options: vec![CuListRequest::default()],
        }
    }

    #[test]
    fn declare_then_lookup() {
        let mut reg = GroupRegistry::new();
        reg.declare(template("g1")).unwrap();
        assert!(reg.exists("g1"));
        assert_eq!(reg.get("g1").unwrap().name, "g1");
    }

    #[test]
    fn declare_twice_fails() {
        let mut reg = GroupRegistry::new();
        reg.declare(template("g1")).unwrap();
        assert!(reg.declare(template("g1")).is_err());
    }

    #[test]
    fn undeclare_unknown_fails() {
        let mut reg = GroupRegistry::new();
        assert!(matches!(
            reg.undeclare("missing"),
            Err(XrmError::UnknownGroup(_))
        ));
    }

    #[test]
    fn undeclare_known_succeeds_and_forbids_future_lookup() {
        let mut reg = GroupRegistry::new();
        reg.declare(template("g1")).unwrap();
        reg.undeclare("g1").unwrap();
        assert!(!reg.exists("g1"));
        assert!(reg.get("g1").is_err());
    }
}
