//! The per-node decision table of the sweep: given a node and the instance
//! (if any) it claims via `comment.InstanceId`, decide the single action to
//! take this sweep. Rows are evaluated in order; the first match wins.

use chrono::{DateTime, NaiveDateTime, Utc};
use fleet_domain::{Instance, InstanceState, Node, NodeState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// `weight == 0`: a transplant holds this node, do nothing.
    Skip,
    SetIdle,
    Acquire,
    ClearComment,
    SetStateReason { state: &'static str, reason: &'static str },
    TerminateThenClear { instance_id: String, spot_id: Option<String> },
    DrainHibernated { schedule_transplant: bool },
    Undrain,
    UpdateNodeAddr { ip: String },
    NoAction,
}

/// `linked` per spec.md §4.5: the comment names an instance id, and that id
/// is present in the nodegroup's instance snapshot for this sweep.
pub fn linked<'a>(node: &Node, instances: &'a std::collections::BTreeMap<String, Instance>) -> Option<&'a Instance> {
    if node.comment.instance_id.is_empty() {
        return None;
    }
    instances.get(&node.comment.instance_id)
}

pub fn decide(
    node: &Node,
    instance: Option<&Instance>,
    max_hibernation_min: Option<u32>,
    now: DateTime<Utc>,
) -> Decision {
    if node.locked() {
        return Decision::Skip;
    }

    let down = node.has_state(NodeState::Down);
    let drain = node.has_state(NodeState::Drain);
    let completing = node.has_state(NodeState::Completing);
    let not_responding = node.has_state(NodeState::NotResponding);
    let powered_down = node.has_state(NodeState::PoweredDown);
    let powering_down = node.has_state(NodeState::PoweringDown);
    let powering_up = node.has_state(NodeState::PoweringUp);

    if down && powered_down {
        return Decision::SetIdle;
    }
    if drain && powered_down {
        return Decision::SetIdle;
    }

    let linked = instance.is_some();

    if !linked && powering_up {
        return Decision::Acquire;
    }
    if !linked && (powered_down || powering_down) {
        return if node.comment.instance_id.is_empty() {
            Decision::NoAction
        } else {
            Decision::ClearComment
        };
    }
    if !linked {
        return Decision::SetStateReason {
            state: "POWER_DOWN_FORCE",
            reason: "instance_terminated",
        };
    }

    let instance = instance.expect("linked implies Some");

    if powered_down || powering_down {
        return if instance.state.is_terminal_or_stopping() {
            Decision::NoAction
        } else {
            Decision::TerminateThenClear {
                instance_id: instance.id.clone(),
                spot_id: instance.spot_request_id.clone(),
            }
        };
    }

    if instance.state == InstanceState::Stopped && !drain {
        let schedule_transplant = max_hibernation_min
            .map(|max_min| {
                hibernation_age(&instance.state_transition_reason, now)
                    > chrono::Duration::minutes(max_min as i64).to_std().unwrap_or_default()
            })
            .unwrap_or(false);
        return Decision::DrainHibernated { schedule_transplant };
    }

    if drain && instance.state != InstanceState::Stopped {
        return Decision::Undrain;
    }

    if down {
        return Decision::SetStateReason {
            state: "POWER_DOWN",
            reason: "node_stuck",
        };
    }

    if completing && (drain || not_responding) {
        return Decision::SetStateReason {
            state: "POWER_DOWN_FORCE",
            reason: "node_stuck",
        };
    }

    if node.node_addr.as_deref() != instance.private_ip.as_deref() {
        if let Some(ip) = &instance.private_ip {
            return Decision::UpdateNodeAddr { ip: ip.clone() };
        }
    }

    Decision::NoAction
}

/// Parses a `YYYY-MM-DD HH:MM:SS UTC` timestamp from inside the last
/// parenthesized region of `reason` and returns the elapsed time since then.
/// Unparseable input (missing parens, bad format) is treated as "just now".
pub fn hibernation_age(reason: &str, now: DateTime<Utc>) -> std::time::Duration {
    parse_last_paren_timestamp(reason)
        .map(|ts| (now - ts).to_std().unwrap_or_default())
        .unwrap_or_default()
}

fn parse_last_paren_timestamp(reason: &str) -> Option<DateTime<Utc>> {
    let open = reason.rfind('(')?;
    let close = reason[open..].find(')')? + open;
    let inner = reason.get(open + 1..close)?;
    let stripped = inner.strip_suffix(" UTC")?;
    let naive = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::{NodeComment, NodeName, NodeStateSet, PartitionName};
    use std::collections::BTreeMap;

    fn node(states: &[NodeState], comment: NodeComment, weight: u32) -> Node {
        Node {
            name: NodeName::new("p1-ng1-1"),
            partition: PartitionName::new("p1"),
            state_set: states.iter().copied().collect::<NodeStateSet>(),
            node_addr: None,
            weight,
            comment,
        }
    }

    fn running_instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            instance_type: "m5.large".into(),
            private_ip: Some("10.0.0.5".into()),
            lifecycle: fleet_domain::InstanceLifecycle::OnDemand,
            state: InstanceState::Running,
            state_transition_reason: String::new(),
            block_device_mappings: Vec::new(),
            network_interfaces: Vec::new(),
            spot_request_id: None,
        }
    }

    #[test]
    fn locked_node_is_skipped() {
        let n = node(&[NodeState::Cloud, NodeState::PoweringUp], NodeComment::empty(), 0);
        assert_eq!(decide(&n, None, None, Utc::now()), Decision::Skip);
    }

    #[test]
    fn unlinked_powering_up_triggers_acquire() {
        let n = node(&[NodeState::Cloud, NodeState::PoweringUp], NodeComment::empty(), 1);
        assert_eq!(decide(&n, None, None, Utc::now()), Decision::Acquire);
    }

    #[test]
    fn unlinked_non_powering_up_force_powers_down() {
        let n = node(&[NodeState::Cloud, NodeState::Idle], NodeComment::empty(), 1);
        assert_eq!(
            decide(&n, None, None, Utc::now()),
            Decision::SetStateReason { state: "POWER_DOWN_FORCE", reason: "instance_terminated" }
        );
    }

    #[test]
    fn powered_down_linked_to_running_instance_terminates() {
        let comment = NodeComment { instance_id: "i-9".into(), spot_id: "sir-9".into() };
        let n = node(&[NodeState::Cloud, NodeState::Idle, NodeState::PoweredDown], comment, 1);
        let inst = running_instance("i-9");
        assert_eq!(
            decide(&n, Some(&inst), None, Utc::now()),
            Decision::TerminateThenClear { instance_id: "i-9".into(), spot_id: None }
        );
    }

    #[test]
    fn hibernation_age_parses_last_parenthesized_timestamp() {
        let reason = "User initiated (2024-10-05 09:31:33 UTC)";
        let now: DateTime<Utc> = "2024-10-05T10:15:00Z".parse().unwrap();
        let age = hibernation_age(reason, now);
        assert_eq!(age.as_secs(), 43 * 60 + 27);
    }

    #[test]
    fn hibernation_age_unparseable_is_zero() {
        let now = Utc::now();
        assert_eq!(hibernation_age("no timestamp here", now).as_secs(), 0);
    }

    #[test]
    fn stopped_instance_drains_and_schedules_transplant_past_threshold() {
        let comment = NodeComment { instance_id: "i-1".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud], comment, 1);
        let mut inst = running_instance("i-1");
        inst.state = InstanceState::Stopped;
        inst.state_transition_reason = "User initiated (2024-10-05 09:31:33 UTC)".into();
        let now: DateTime<Utc> = "2024-10-05T10:15:00Z".parse().unwrap();

        match decide(&n, Some(&inst), Some(30), now) {
            Decision::DrainHibernated { schedule_transplant } => assert!(schedule_transplant),
            other => panic!("expected DrainHibernated, got {other:?}"),
        }
    }

    #[test]
    fn drained_instance_back_to_running_undrains() {
        let comment = NodeComment { instance_id: "i-1".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud, NodeState::Drain], comment, 1);
        let inst = running_instance("i-1");
        assert_eq!(decide(&n, Some(&inst), None, Utc::now()), Decision::Undrain);
    }

    #[test]
    fn nodeaddr_mismatch_updates() {
        let comment = NodeComment { instance_id: "i-1".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud, NodeState::Idle], comment, 1);
        let inst = running_instance("i-1");
        assert_eq!(
            decide(&n, Some(&inst), None, Utc::now()),
            Decision::UpdateNodeAddr { ip: "10.0.0.5".into() }
        );
    }

    #[test]
    fn empty_map_means_unlinked_even_with_instance_id_set() {
        let comment = NodeComment { instance_id: "i-404".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud, NodeState::PoweringUp], comment, 1);
        let instances: BTreeMap<String, Instance> = BTreeMap::new();
        assert!(linked(&n, &instances).is_none());
    }
}
