//! An in-memory [`SchedulerClient`] used by the reconciler's own test suite
//! and by any crate that wants to exercise the sweep driver without a real
//! `scontrol` binary.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_domain::{Node, NodeName};

use crate::client::SchedulerClient;
use crate::error::SchedulerError;

pub struct FakeScheduler {
    pub nodes: Mutex<BTreeMap<NodeName, Node>>,
    pub updates: Mutex<Vec<(NodeName, Vec<(String, String)>)>>,
}

impl FakeScheduler {
    pub fn new(nodes: BTreeMap<NodeName, Node>) -> Self {
        FakeScheduler {
            nodes: Mutex::new(nodes),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn node(&self, name: &NodeName) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

#[async_trait]
impl SchedulerClient for FakeScheduler {
    async fn load_nodes(&self) -> Result<BTreeMap<NodeName, Node>, SchedulerError> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn update_node(
        &self,
        name: &NodeName,
        params: &[(&str, &str)],
    ) -> Result<(), SchedulerError> {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(name) {
            for (k, v) in params {
                apply_param(node, k, v)?;
            }
        }
        drop(nodes);
        self.updates.lock().unwrap().push((
            name.clone(),
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        Ok(())
    }
}

fn apply_param(node: &mut fleet_domain::Node, key: &str, value: &str) -> Result<(), SchedulerError> {
    match key {
        // `state=` also carries transient scontrol command verbs (IDLE,
        // DRAIN, UNDRAIN, POWER_DOWN, POWER_DOWN_FORCE) that are not
        // themselves persisted NodeState flags — they mutate the flag set
        // rather than replacing it wholesale. Anything else is treated as
        // a literal '+'-joined flag set, matching `scontrol show nodes`.
        "state" => apply_state_verb(node, value)?,
        "nodeaddr" => node.node_addr = Some(value.to_string()),
        "comment" => node.comment = fleet_domain::NodeComment::parse(value)?,
        "weight" => {
            node.weight = value
                .parse()
                .map_err(|e| SchedulerError::Parse(format!("bad weight update: {e}")))?
        }
        "reason" | "nodehostname" => {} // not modeled on the in-memory Node
        other => {
            return Err(SchedulerError::Parse(format!(
                "unrecognized update param key: {other}"
            )))
        }
    }
    Ok(())
}

fn apply_state_verb(node: &mut fleet_domain::Node, value: &str) -> Result<(), SchedulerError> {
    use fleet_domain::NodeState;

    match value {
        "IDLE" => {
            let cloud = node.state_set.contains(&NodeState::Cloud);
            node.state_set.clear();
            node.state_set.insert(NodeState::Idle);
            if cloud {
                node.state_set.insert(NodeState::Cloud);
            }
        }
        "DRAIN" => {
            node.state_set.insert(NodeState::Drain);
        }
        "UNDRAIN" => {
            node.state_set.remove(&NodeState::Drain);
        }
        "POWER_DOWN" => {
            node.state_set.remove(&NodeState::PoweringUp);
            node.state_set.insert(NodeState::PoweringDown);
        }
        "POWER_DOWN_FORCE" => {
            node.state_set.remove(&NodeState::PoweringUp);
            node.state_set.insert(NodeState::PoweringDown);
        }
        other => {
            node.state_set.clear();
            for tok in other.split('+') {
                node.state_set.insert(tok.parse()?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::{NodeComment, PartitionName};
    use std::collections::BTreeSet;

    fn node(name: &str) -> Node {
        Node {
            name: NodeName::new(name),
            partition: PartitionName::new("p1"),
            state_set: BTreeSet::new(),
            node_addr: None,
            weight: 1,
            comment: NodeComment::empty(),
        }
    }

    #[tokio::test]
    async fn update_node_mutates_and_records() {
        let mut map = BTreeMap::new();
        map.insert(NodeName::new("p1-ng1-1"), node("p1-ng1-1"));
        let sched = FakeScheduler::new(map);

        sched
            .update_node(
                &NodeName::new("p1-ng1-1"),
                &[("nodeaddr", "10.0.0.5"), ("weight", "2")],
            )
            .await
            .unwrap();

        let n = sched.node(&NodeName::new("p1-ng1-1")).unwrap();
        assert_eq!(n.node_addr.as_deref(), Some("10.0.0.5"));
        assert_eq!(n.weight, 2);
        assert_eq!(sched.update_count(), 1);
    }
}
