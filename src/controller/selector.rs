//! Node selector evaluation
//!
//! Terms are ORed, requirements inside a term are ANDed. A selector without
//! terms matches every node.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement,
};
use std::collections::BTreeMap;

/// Whether a selector has no effective restriction
pub fn is_unrestricted(selector: Option<&NodeSelector>) -> bool {
    selector.map_or(true, |s| s.node_selector_terms.is_empty())
}

/// Evaluate a selector against a node's name and labels
pub fn node_matches(
    selector: Option<&NodeSelector>,
    node_name: &str,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    if selector.node_selector_terms.is_empty() {
        return true;
    }

    selector.node_selector_terms.iter().any(|term| {
        let expressions = term.match_expressions.as_deref().unwrap_or_default();
        let fields = term.match_fields.as_deref().unwrap_or_default();
        // An empty term matches nothing
        if expressions.is_empty() && fields.is_empty() {
            return false;
        }
        expressions
            .iter()
            .all(|req| requirement_matches(req, labels.get(&req.key).map(String::as_str)))
            && fields.iter().all(|req| {
                let value = (req.key == "metadata.name").then_some(node_name);
                requirement_matches(req, value)
            })
    })
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.map_or(false, |v| values.iter().any(|x| x == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" | "Lt" => {
            let (Some(v), Some(bound)) = (
                value.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|b| b.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                v > bound
            } else {
                v < bound
            }
        }
        _ => false,
    }
}

/// Required node affinity for a selector, `None` when unrestricted
pub fn node_affinity(selector: Option<&NodeSelector>) -> Option<Affinity> {
    if is_unrestricted(selector) {
        return None;
    }
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: selector.cloned(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSelectorTerm;

    fn selector(key: &str, op: &str, values: &[&str]) -> NodeSelector {
        NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: key.to_string(),
                    operator: op.to_string(),
                    values: Some(values.iter().map(|v| v.to_string()).collect()),
                }]),
                match_fields: None,
            }],
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_all() {
        assert!(node_matches(None, "n1", &BTreeMap::new()));
        let empty = NodeSelector {
            node_selector_terms: vec![],
        };
        assert!(node_matches(Some(&empty), "n1", &BTreeMap::new()));
        assert!(node_affinity(Some(&empty)).is_none());
    }

    #[test]
    fn test_in_and_not_in() {
        let s = selector("storage", "In", &["ssd", "nvme"]);
        assert!(node_matches(Some(&s), "n1", &labels(&[("storage", "ssd")])));
        assert!(!node_matches(Some(&s), "n1", &labels(&[("storage", "hdd")])));
        assert!(!node_matches(Some(&s), "n1", &BTreeMap::new()));

        let s = selector("storage", "NotIn", &["hdd"]);
        assert!(node_matches(Some(&s), "n1", &BTreeMap::new()));
        assert!(!node_matches(Some(&s), "n1", &labels(&[("storage", "hdd")])));
    }

    #[test]
    fn test_gt_and_match_fields() {
        let s = selector("disks", "Gt", &["2"]);
        assert!(node_matches(Some(&s), "n1", &labels(&[("disks", "4")])));
        assert!(!node_matches(Some(&s), "n1", &labels(&[("disks", "two")])));

        let by_name = NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: None,
                match_fields: Some(vec![NodeSelectorRequirement {
                    key: "metadata.name".into(),
                    operator: "In".into(),
                    values: Some(vec!["worker-1".into()]),
                }]),
            }],
        };
        assert!(node_matches(Some(&by_name), "worker-1", &BTreeMap::new()));
        assert!(!node_matches(Some(&by_name), "worker-2", &BTreeMap::new()));
        assert!(node_affinity(Some(&by_name)).is_some());
    }
}
