use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionName(pub String);

impl PartitionName {
    pub fn new(s: impl Into<String>) -> Self {
        PartitionName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodegroupName(pub String);

impl NodegroupName {
    pub fn new(s: impl Into<String>) -> Self {
        NodegroupName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodegroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `<partition>-<nodegroup>-<ordinal>`, globally unique across the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(s: impl Into<String>) -> Self {
        NodeName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this node name is a member of `<partition>-<nodegroup>-*`.
    pub fn belongs_to(&self, partition: &PartitionName, nodegroup: &NodegroupName) -> bool {
        let prefix = format!("{}-{}-", partition.0, nodegroup.0);
        self.0.starts_with(&prefix)
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Node state ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Idle,
    Allocated,
    Down,
    Drain,
    Completing,
    NotResponding,
    Cloud,
    PoweringUp,
    PoweredDown,
    PoweringDown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Idle => "IDLE",
            NodeState::Allocated => "ALLOCATED",
            NodeState::Down => "DOWN",
            NodeState::Drain => "DRAIN",
            NodeState::Completing => "COMPLETING",
            NodeState::NotResponding => "NOT_RESPONDING",
            NodeState::Cloud => "CLOUD",
            NodeState::PoweringUp => "POWERING_UP",
            NodeState::PoweredDown => "POWERED_DOWN",
            NodeState::PoweringDown => "POWERING_DOWN",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(NodeState::Idle),
            "ALLOCATED" => Ok(NodeState::Allocated),
            "DOWN" => Ok(NodeState::Down),
            "DRAIN" => Ok(NodeState::Drain),
            "COMPLETING" => Ok(NodeState::Completing),
            "NOT_RESPONDING" => Ok(NodeState::NotResponding),
            "CLOUD" => Ok(NodeState::Cloud),
            "POWERING_UP" => Ok(NodeState::PoweringUp),
            "POWERED_DOWN" => Ok(NodeState::PoweredDown),
            "POWERING_DOWN" => Ok(NodeState::PoweringDown),
            other => Err(DomainError::UnknownNodeState(other.to_string())),
        }
    }
}

pub type NodeStateSet = BTreeSet<NodeState>;

/// `weight == 0` is a reserved sentinel: "locked by the daemon, do not mutate".
pub const WEIGHT_LOCKED: u32 = 0;

pub fn is_locked_weight(weight: u32) -> bool {
    weight == WEIGHT_LOCKED
}

// ── Comment side-channel ──────────────────────────────────────────────────────

/// Structured replacement for the scheduler's free-text `Comment` field.
///
/// The literal wire format is `InstanceId:<id>,SpotId:<id>`; either value may
/// be empty but both keys are always present. Anything else is rejected
/// rather than silently recovered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeComment {
    pub instance_id: String,
    pub spot_id: String,
}

impl NodeComment {
    pub fn empty() -> Self {
        NodeComment::default()
    }

    pub fn linked(&self) -> bool {
        !self.instance_id.is_empty()
    }

    /// Builds a `NodeComment` from a generic key/value map (as produced by a
    /// loose `k:v,k:v` split), enforcing the strict shape: exactly the keys
    /// `InstanceId` and `SpotId`, no duplicates, no extras.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, DomainError> {
        if map.len() != 2 {
            return Err(DomainError::MalformedComment(format!(
                "expected exactly 2 keys (InstanceId, SpotId), got {}",
                map.len()
            )));
        }
        let instance_id = map
            .get("InstanceId")
            .ok_or_else(|| DomainError::MalformedComment("missing InstanceId key".into()))?;
        let spot_id = map
            .get("SpotId")
            .ok_or_else(|| DomainError::MalformedComment("missing SpotId key".into()))?;
        Ok(NodeComment {
            instance_id: instance_id.clone(),
            spot_id: spot_id.clone(),
        })
    }

    /// Parses the exact wire format directly, rejecting anything that
    /// doesn't split cleanly into `k:v` pairs first.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let mut map = BTreeMap::new();
        for part in raw.split(',') {
            let mut kv = part.splitn(2, ':');
            let key = kv
                .next()
                .ok_or_else(|| DomainError::MalformedComment(format!("bad segment: {part}")))?;
            let value = kv
                .next()
                .ok_or_else(|| DomainError::MalformedComment(format!("missing ':' in: {part}")))?;
            if map.insert(key.to_string(), value.to_string()).is_some() {
                return Err(DomainError::MalformedComment(format!(
                    "duplicate key: {key}"
                )));
            }
        }
        Self::from_map(&map)
    }

    /// Renders the canonical wire format: keys always in `InstanceId,SpotId`
    /// order.
    pub fn render(&self) -> String {
        format!("InstanceId:{},SpotId:{}", self.instance_id, self.spot_id)
    }
}

// ── Node ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub partition: PartitionName,
    pub state_set: NodeStateSet,
    pub node_addr: Option<String>,
    pub weight: u32,
    pub comment: NodeComment,
}

impl Node {
    pub fn has_state(&self, s: NodeState) -> bool {
        self.state_set.contains(&s)
    }

    pub fn locked(&self) -> bool {
        is_locked_weight(self.weight)
    }
}

// ── Nodegroup (static configuration) ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurchasingOption {
    Spot,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptionBehavior {
    Terminate,
    Stop,
    Hibernate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    Rank,
    LowestPrice,
    CapacityOptimized,
    PriceCapacityOptimized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nodegroup {
    pub partition_name: PartitionName,
    pub nodegroup_name: NodegroupName,
    pub num_nodes: u32,
    pub purchasing_option: PurchasingOption,
    pub interruption_behavior: InterruptionBehavior,
    pub allocation_strategy: AllocationStrategy,
    pub launch_template_id: String,
    pub subnet_ids: Vec<String>,
    pub instances: Vec<String>,
    pub overrides: Option<serde_json::Value>,
    pub max_hibernation_min: Option<u32>,
}

impl Nodegroup {
    /// `nodegroup=<partition>-<nodegroup>`, the tag value used to enumerate
    /// this nodegroup's cloud resources.
    pub fn tag_value(&self) -> String {
        format!("{}-{}", self.partition_name.0, self.nodegroup_name.0)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.subnet_ids.is_empty() {
            return Err(DomainError::InvalidConfig(format!(
                "nodegroup {} has no subnetIds",
                self.tag_value()
            )));
        }
        if self.instances.is_empty() {
            return Err(DomainError::InvalidConfig(format!(
                "nodegroup {} has no instances",
                self.tag_value()
            )));
        }
        if matches!(self.purchasing_option, PurchasingOption::Spot)
            && matches!(self.interruption_behavior, InterruptionBehavior::Terminate)
        {
            return Err(DomainError::InvalidConfig(format!(
                "nodegroup {} combines purchasingOption=spot with interruptionBehavior=terminate",
                self.tag_value()
            )));
        }
        Ok(())
    }
}

// ── Instance ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceLifecycle {
    Spot,
    OnDemand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    pub fn is_terminal_or_stopping(&self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Stopping)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub eni_id: String,
    pub attachment_id: String,
    pub card_index: u32,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub instance_type: String,
    pub private_ip: Option<String>,
    pub lifecycle: InstanceLifecycle,
    pub state: InstanceState,
    pub state_transition_reason: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub spot_request_id: Option<String>,
}

// ── SpotRequest ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotRequestState {
    Open,
    Active,
    Cancelled,
    Closed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRequest {
    pub id: String,
    pub state: SpotRequestState,
    pub instance_id: Option<String>,
}
