use std::sync::Arc;

use anyhow::Context;
use hickory_proto::op::Message;

use crate::cache::QueryCache;
use crate::chain::{
    CacheStage, DedupStage, OutboundStage, Pipeline, Request, RequestSettingStage, Stage,
    SpeedSortStage, StripCnameStage,
};
use crate::config::{GroupConfig, ResponseMode};
use crate::error::ResolveError;
use crate::outbound::{self, Outbound};
use crate::proto_utils::single_question;
use crate::speedcheck::SpeedChecker;

/// One configured group: its client pipeline and, behind the cache, the
/// refresh pipeline that keeps cached answers fresh.
pub struct Group {
    tag: String,
    pipeline: Pipeline,
}

impl Group {
    pub fn from_config(cfg: &GroupConfig) -> anyhow::Result<Self> {
        let outbounds = cfg
            .outbounds
            .iter()
            .map(outbound::build)
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("build outbounds for group {}", cfg.tag))?;
        let checker = Arc::new(
            SpeedChecker::from_specs(&cfg.speed_checks)
                .with_context(|| format!("build speed checks for group {}", cfg.tag))?,
        );
        Ok(Self::with_parts(cfg, outbounds, checker))
    }

    fn with_parts(
        cfg: &GroupConfig,
        outbounds: Vec<Arc<dyn Outbound>>,
        checker: Arc<SpeedChecker>,
    ) -> Self {
        let timeout = cfg.upstream_timeout();
        // 后台刷新始终等所有上游并测速所有 IP
        let refresher = Arc::new(Pipeline::new(transforms(
            cfg,
            ResponseMode::FastestIp,
            &checker,
            Arc::new(OutboundStage::new(
                ResponseMode::FastestIp,
                outbounds.clone(),
                timeout,
            )),
        )));
        let cache = QueryCache::new(cfg.cache.clone(), refresher);

        let mut stages: Vec<Arc<dyn Stage>> = vec![Arc::new(CacheStage::new(cache))];
        stages.extend(transforms(
            cfg,
            cfg.response_mode,
            &checker,
            Arc::new(OutboundStage::new(cfg.response_mode, outbounds, timeout)),
        ));
        Self {
            tag: cfg.tag.clone(),
            pipeline: Pipeline::new(stages),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn handle(&self, msg: Message) -> Result<Message, ResolveError> {
        single_question(&msg)?;
        self.pipeline.handle(Request::new(msg)).await
    }

    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }
}

/// Speed sort, dedup, CNAME strip and request normalization ahead of `upstream`.
fn transforms(
    cfg: &GroupConfig,
    mode: ResponseMode,
    checker: &Arc<SpeedChecker>,
    upstream: Arc<dyn Stage>,
) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(SpeedSortStage::new(mode, Arc::clone(checker))),
        Arc::new(DedupStage::new(cfg.max_answers)),
        Arc::new(StripCnameStage),
        Arc::new(RequestSettingStage),
        upstream,
    ]
}
