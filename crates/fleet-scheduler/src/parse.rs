use std::collections::BTreeMap;

use fleet_domain::{Node, NodeComment, NodeName, NodeState, NodeStateSet, PartitionName};

use crate::error::SchedulerError;

/// Parses the line-oriented output of `scontrol show nodes`.
///
/// A line beginning with `NodeName=` starts a new record; every
/// subsequent line (until the next `NodeName=` or end of input)
/// contributes whitespace-separated `key=value` attributes to that
/// record. A `NodeName` seen twice is a fatal parse error.
pub fn parse_show_nodes(text: &str) -> Result<BTreeMap<NodeName, Node>, SchedulerError> {
    let mut nodes = BTreeMap::new();
    let mut current: Option<Vec<(String, String)>> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("NodeName=") {
            if let Some(attrs) = current.take() {
                let node = build_node(attrs)?;
                insert_unique(&mut nodes, node)?;
            }
            current = Some(Vec::new());
        }
        if let Some(attrs) = current.as_mut() {
            for token in line.split_whitespace() {
                if let Some((k, v)) = token.split_once('=') {
                    attrs.push((k.to_string(), v.to_string()));
                }
            }
        }
    }
    if let Some(attrs) = current.take() {
        let node = build_node(attrs)?;
        insert_unique(&mut nodes, node)?;
    }

    Ok(nodes)
}

fn insert_unique(
    nodes: &mut BTreeMap<NodeName, Node>,
    node: Node,
) -> Result<(), SchedulerError> {
    if nodes.contains_key(&node.name) {
        return Err(SchedulerError::DuplicateNodeName(node.name.0.clone()));
    }
    nodes.insert(node.name.clone(), node);
    Ok(())
}

fn build_node(attrs: Vec<(String, String)>) -> Result<Node, SchedulerError> {
    let get = |key: &str| -> Option<&str> {
        attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let name = get("NodeName")
        .ok_or_else(|| SchedulerError::Parse("record missing NodeName".into()))?;

    let partition_raw = get("Partitions").unwrap_or_default();
    let partition = partition_raw.split(',').next().unwrap_or_default();

    let mut state_set: NodeStateSet = NodeStateSet::new();
    if let Some(raw_state) = get("State") {
        for tok in raw_state.split('+') {
            if let Ok(s) = tok.parse::<NodeState>() {
                state_set.insert(s);
            }
        }
    }

    let node_addr = get("NodeAddr")
        .filter(|s| !s.is_empty() && *s != "(null)")
        .map(|s| s.to_string());

    let weight: u32 = get("Weight")
        .map(|s| s.parse::<u32>())
        .transpose()
        .map_err(|e| SchedulerError::Parse(format!("bad Weight: {e}")))?
        .unwrap_or(1);

    let comment = match get("Comment") {
        None => NodeComment::empty(),
        Some(raw) if raw.is_empty() || raw == "(null)" => NodeComment::empty(),
        Some(raw) => NodeComment::parse(raw)?,
    };

    Ok(Node {
        name: NodeName::new(name),
        partition: PartitionName::new(partition),
        state_set,
        node_addr,
        weight,
        comment,
    })
}
