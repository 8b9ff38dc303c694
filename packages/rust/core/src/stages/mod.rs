//! The four pipeline stages, each bound to one queue.

mod enrich;
mod extract;
mod link;
mod verify;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use pedia_shared::Result;

use crate::queue::QueueName;

pub use enrich::{EnrichOutput, EnrichStage};
pub use extract::{ExtractOutput, ExtractStage};
pub use link::{LinkOutput, LinkStage};
pub use verify::{VerifyReport, VerifyStage};

/// A job handler bound to one queue.
///
/// Handlers may run more than once for the same job (at-least-once
/// delivery) and must be idempotent.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    const QUEUE: QueueName;

    type Job: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn handle(&self, job: Self::Job) -> Result<Self::Output>;
}
