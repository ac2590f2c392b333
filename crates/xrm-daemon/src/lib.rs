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

//! Process wiring around `xrm-core`: CLI parsing, config and logging setup, and a thin
//! wire-shape demonstration. Decoding and dispatching the actual command set (spec.md §6) is
//! left to whatever transport binding sits in front of [`xrm_core::manager::Manager`].

pub mod cli;
pub mod error;
pub mod wire;
