use std::sync::Arc;

use hickory_proto::op::Message;
use tracing::info;

use crate::config::Config;
use crate::group::Group;

/// Picks the group that serves a query.
///
/// Routing rules are validated at load time but not matched yet; every query
/// goes to the first configured group.
pub struct GroupRouter {
    groups: Vec<Arc<Group>>,
}

impl GroupRouter {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let groups = cfg
            .groups
            .iter()
            .map(|g| Group::from_config(g).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if groups.is_empty() {
            anyhow::bail!("no groups configured");
        }
        info!(
            groups = groups.len(),
            routing_rules = cfg.routing.len(),
            default_group = %groups[0].tag(),
            "group router ready"
        );
        Ok(Self { groups })
    }

    // TODO: match `routing` domain lists (geosite:, wildcard, exact) against the query name.
    pub fn find_group(&self, _req: &Message) -> Arc<Group> {
        Arc::clone(&self.groups[0])
    }

    pub async fn shutdown(&self) {
        for group in &self.groups {
            group.shutdown().await;
        }
    }
}
