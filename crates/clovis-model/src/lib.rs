// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod google;
mod invoker;
mod json;
mod mock;
mod types;

pub use google::GoogleInvoker;
pub use invoker::ModelInvoker;
pub use json::parse_loose_json;
pub use mock::ScriptedInvoker;
pub use types::*;

