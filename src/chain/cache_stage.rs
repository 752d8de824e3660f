use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::debug;

use super::{Next, Request, Stage};
use crate::cache::QueryCache;
use crate::error::ResolveError;
use crate::proto_utils::{cache_ttl, host, rewrite_ttl};

/// TTL given to a freshly resolved answer, so the client soon returns for
/// the speed-checked version the cache is preparing.
const MISS_REPLY_TTL: u32 = 3;

pub struct CacheStage {
    cache: QueryCache,
}

impl CacheStage {
    pub fn new(cache: QueryCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Stage for CacheStage {
    async fn handle(&self, req: Request, next: Next<'_>) -> Result<Message, ResolveError> {
        if let Some(mut hit) = self.cache.find(&req.message) {
            hit.set_id(req.message.id());
            debug!(qname = %host(&req.message), cache = true, "cache hit");
            return Ok(hit);
        }

        let request = req.message.clone();
        let mut resp = next.run(req).await?;
        self.cache.store(&request, &resp);
        let ttl = cache_ttl(&resp).min(MISS_REPLY_TTL);
        rewrite_ttl(&mut resp, ttl);
        Ok(resp)
    }

    async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}
