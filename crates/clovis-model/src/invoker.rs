// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{ModelRequest, ModelResponse};

/// The black-box model boundary: one request in, text and/or function
/// calls out.  Everything above this trait (router, agents) is provider
/// agnostic; everything below it is wire format.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Provider name for status display and logging.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Perform one generation call.
    async fn generate(&self, req: ModelRequest) -> anyhow::Result<ModelResponse>;
}
