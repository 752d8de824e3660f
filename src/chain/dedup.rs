use async_trait::async_trait;
use hickory_proto::op::Message;

use super::{Next, Request, Stage};
use crate::error::ResolveError;
use crate::proto_utils::{dedup_records, map_answers, map_sections};

/// Removes duplicate records from every section, then clamps the answer count.
pub struct DedupStage {
    max_answers: Option<usize>,
}

impl DedupStage {
    pub fn new(max_answers: Option<usize>) -> Self {
        Self { max_answers }
    }

    fn apply(&self, resp: &mut Message) {
        map_sections(resp, dedup_records);
        if let Some(limit) = self.max_answers {
            map_answers(resp, |mut answers| {
                answers.truncate(limit);
                answers
            });
        }
    }
}

#[async_trait]
impl Stage for DedupStage {
    async fn handle(&self, req: Request, next: Next<'_>) -> Result<Message, ResolveError> {
        let mut resp = next.run(req).await?;
        self.apply(&mut resp);
        Ok(resp)
    }
}
