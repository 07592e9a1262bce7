// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! GATT value codecs of the Audio Stream Control and Published Audio Capabilities services.
//!
//! Decoders return `None` on malformed input, the caller logs and drops the value.

pub mod ascs;
pub mod ltv;
pub mod pacs;

mod reader;
mod writer;
