use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use hickory_proto::op::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Next, Request, Stage};
use crate::config::ResponseMode;
use crate::error::{OutboundError, ResolveError};
use crate::outbound::Outbound;
use crate::proto_utils::{host, merge_responses};

/// Terminal stage: fans the request out to every upstream of the group and
/// reduces the results according to the response mode.
pub struct OutboundStage {
    mode: ResponseMode,
    outbounds: Vec<Arc<dyn Outbound>>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl OutboundStage {
    pub fn new(mode: ResponseMode, outbounds: Vec<Arc<dyn Outbound>>, timeout: Duration) -> Self {
        Self {
            mode,
            outbounds,
            timeout,
            shutdown: CancellationToken::new(),
        }
    }

    async fn invoke_one(&self, index: usize, req: &Message) -> Result<Message, ResolveError> {
        let outbound = &self.outbounds[index];
        let start = Instant::now();
        let res = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ResolveError::Shutdown),
            res = tokio::time::timeout(self.timeout, outbound.invoke(req)) => res,
        };
        let res = match res {
            Ok(res) => res,
            Err(_) => Err(OutboundError::Timeout(self.timeout)),
        };
        match res {
            Ok(resp) => {
                debug!(
                    upstream = %outbound.label(),
                    qname = %host(req),
                    upstream_ms = start.elapsed().as_millis() as u64,
                    "upstream answered"
                );
                Ok(resp)
            }
            Err(source) => Err(ResolveError::Upstream { index, source }),
        }
    }

    fn label(&self, index: usize) -> &str {
        self.outbounds.get(index).map(|o| o.label()).unwrap_or("?")
    }
}

#[async_trait]
impl Stage for OutboundStage {
    async fn handle(&self, req: Request, _next: Next<'_>) -> Result<Message, ResolveError> {
        if self.outbounds.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }
        let msg = &req.message;
        let mut calls: FuturesUnordered<_> = (0..self.outbounds.len())
            .map(|i| self.invoke_one(i, msg))
            .collect();

        match self.mode {
            // 第一个返回的结果即为最终结果，出错也不再等待其他上游
            ResponseMode::FirstPing | ResponseMode::FastestResponse => {
                calls.next().await.unwrap_or(Err(ResolveError::NoUpstreams))
            }
            ResponseMode::FastestIp => {
                let mut answered = Vec::with_capacity(self.outbounds.len());
                while let Some(res) = calls.next().await {
                    match res {
                        Ok(resp) => answered.push(resp),
                        Err(ResolveError::Upstream { index, source }) => warn!(
                            upstream = %self.label(index),
                            qname = %host(msg),
                            error = %source,
                            "upstream failed"
                        ),
                        Err(err) => return Err(err),
                    }
                }
                let mut answered = answered.into_iter();
                let Some(mut base) = answered.next() else {
                    return Err(ResolveError::AllUpstreamsFailed {
                        attempted: self.outbounds.len(),
                    });
                };
                merge_responses(&mut base, answered.collect());
                Ok(base)
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{DedupStage, Pipeline};
    use crate::outbound::testing::MockOutbound;
    use crate::proto_utils::testing::{answer_ips, query};
    use hickory_proto::rr::RecordType;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn stage(mode: ResponseMode, outbounds: Vec<MockOutbound>) -> Arc<dyn Stage> {
        let outbounds = outbounds
            .into_iter()
            .map(|o| Arc::new(o) as Arc<dyn Outbound>)
            .collect();
        Arc::new(OutboundStage::new(mode, outbounds, TIMEOUT))
    }

    fn req() -> Request {
        Request::new(query("example.com.", RecordType::A))
    }

    #[tokio::test(start_paused = true)]
    async fn first_ping_takes_the_earliest_answer() {
        let pipeline = Pipeline::new(vec![stage(
            ResponseMode::FirstPing,
            vec![
                MockOutbound::answering(vec!["1.1.1.1"], 100),
                MockOutbound::answering(vec!["2.2.2.2"], 10),
            ],
        )]);
        let resp = pipeline.handle(req()).await.unwrap();
        assert_eq!(answer_ips(&resp), vec!["2.2.2.2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_ping_fails_when_earliest_result_is_an_error() {
        let pipeline = Pipeline::new(vec![stage(
            ResponseMode::FirstPing,
            vec![
                MockOutbound::answering(vec!["1.1.1.1"], 100),
                MockOutbound::failing(10),
            ],
        )]);
        let err = pipeline.handle(req()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Upstream { index: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_ip_survives_a_failing_upstream() {
        let pipeline = Pipeline::new(vec![stage(
            ResponseMode::FastestIp,
            vec![MockOutbound::failing(5), MockOutbound::answering(vec!["1.1.1.1"], 50)],
        )]);
        let resp = pipeline.handle(req()).await.unwrap();
        assert_eq!(answer_ips(&resp), vec!["1.1.1.1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_ip_merges_answers_without_duplicates() {
        let pipeline = Pipeline::new(vec![
            Arc::new(DedupStage::new(None)) as Arc<dyn Stage>,
            stage(
                ResponseMode::FastestIp,
                vec![
                    MockOutbound::answering(vec!["1.1.1.1", "2.2.2.2"], 5),
                    MockOutbound::answering(vec!["2.2.2.2", "3.3.3.3"], 20),
                ],
            ),
        ]);
        let resp = pipeline.handle(req()).await.unwrap();
        assert_eq!(answer_ips(&resp), vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_ip_reports_when_everything_failed() {
        let pipeline = Pipeline::new(vec![stage(
            ResponseMode::FastestIp,
            vec![MockOutbound::failing(5), MockOutbound::failing(10)],
        )]);
        let err = pipeline.handle(req()).await.unwrap_err();
        assert!(matches!(err, ResolveError::AllUpstreamsFailed { attempted: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_times_out() {
        let pipeline = Pipeline::new(vec![stage(
            ResponseMode::FirstPing,
            vec![MockOutbound::answering(vec!["1.1.1.1"], 60_000)],
        )]);
        let err = pipeline.handle(req()).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Upstream {
                source: OutboundError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_inflight_calls() {
        let pipeline = Pipeline::new(vec![stage(
            ResponseMode::FastestIp,
            vec![MockOutbound::answering(vec!["1.1.1.1"], 3_000)],
        )]);
        let (res, ()) = tokio::join!(pipeline.handle(req()), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pipeline.shutdown().await;
        });
        assert!(matches!(res, Err(ResolveError::Shutdown)));
    }

    #[tokio::test]
    async fn empty_group_has_no_upstreams() {
        let pipeline = Pipeline::new(vec![stage(ResponseMode::FirstPing, Vec::new())]);
        assert!(matches!(
            pipeline.handle(req()).await,
            Err(ResolveError::NoUpstreams)
        ));
    }
}
