use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use super::{Next, Request, Stage};
use crate::config::ResponseMode;
use crate::error::ResolveError;
use crate::speedcheck::SpeedChecker;

/// Reorders A/AAAA answers by measured latency and drops the slow ones.
pub struct SpeedSortStage {
    mode: ResponseMode,
    checker: Arc<SpeedChecker>,
}

impl SpeedSortStage {
    pub fn new(mode: ResponseMode, checker: Arc<SpeedChecker>) -> Self {
        Self { mode, checker }
    }
}

#[async_trait]
impl Stage for SpeedSortStage {
    async fn handle(&self, req: Request, next: Next<'_>) -> Result<Message, ResolveError> {
        let samples = req.speed_check_samples;
        let mut resp = next.run(req).await?;
        if self.mode == ResponseMode::FastestResponse {
            return Ok(resp);
        }

        let first_only = self.mode == ResponseMode::FirstPing;
        let answers = resp.take_answers();
        let ranked = self.checker.rank(answers, samples, first_only).await;
        resp.insert_answers(ranked);
        Ok(resp)
    }
}
