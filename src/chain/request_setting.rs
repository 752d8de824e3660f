use async_trait::async_trait;
use hickory_proto::op::Message;

use super::{Next, Request, Stage};
use crate::error::ResolveError;

/// Normalizes the outgoing request: always ask upstreams to recurse.
pub struct RequestSettingStage;

#[async_trait]
impl Stage for RequestSettingStage {
    async fn handle(&self, mut req: Request, next: Next<'_>) -> Result<Message, ResolveError> {
        req.message.set_recursion_desired(true);
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::chain::Pipeline;
    use crate::proto_utils::testing::query;
    use hickory_proto::rr::RecordType;

    #[tokio::test]
    async fn forces_recursion_desired() {
        let mut msg = query("example.com.", RecordType::A);
        msg.set_recursion_desired(false);
        let pipeline = Pipeline::new(vec![Arc::new(RequestSettingStage)]);
        let echoed = pipeline.handle(Request::new(msg)).await.unwrap();
        assert!(echoed.recursion_desired());
    }
}
