//! Ordered request/response pipeline.
//!
//! A pipeline is a list of [`Stage`]s. Each stage receives the request and a
//! [`Next`] handle to the rest of the list; it may rewrite the request before
//! calling `next`, rewrite the response after it returns, or answer on its
//! own without calling `next` at all (cache hit). Running past the last stage
//! echoes the request message back, so an empty pipeline is the identity.

mod cache_stage;
mod cname;
mod dedup;
mod outbound_stage;
mod request_setting;
mod speed_sort;

use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::error::ResolveError;

pub use cache_stage::CacheStage;
pub use cname::StripCnameStage;
pub use dedup::DedupStage;
pub use outbound_stage::OutboundStage;
pub use request_setting::RequestSettingStage;
pub use speed_sort::SpeedSortStage;

/// Number of speed-check samples a live client query asks for.
pub const DEFAULT_SPEED_CHECK_SAMPLES: u32 = 1;

/// A message travelling down the pipeline plus per-invocation knobs.
#[derive(Debug, Clone)]
pub struct Request {
    pub message: Message,
    /// How many times each probe is repeated and averaged.
    pub speed_check_samples: u32,
}

impl Request {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            speed_check_samples: DEFAULT_SPEED_CHECK_SAMPLES,
        }
    }

    pub fn with_samples(message: Message, samples: u32) -> Self {
        Self {
            message,
            speed_check_samples: samples.max(1),
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn handle(&self, req: Request, next: Next<'_>) -> Result<Message, ResolveError>;

    /// Releases timers and in-flight work owned by the stage.
    async fn shutdown(&self) {}
}

/// The remainder of the pipeline after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl Next<'_> {
    pub async fn run(self, req: Request) -> Result<Message, ResolveError> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(req, Next { stages: rest }).await,
            None => Ok(req.message),
        }
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    #[inline]
    pub async fn handle(&self, req: Request) -> Result<Message, ResolveError> {
        Next {
            stages: &self.stages,
        }
        .run(req)
        .await
    }

    pub async fn shutdown(&self) {
        for stage in &self.stages {
            stage.shutdown().await;
        }
    }
}
