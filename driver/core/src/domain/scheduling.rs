// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node scheduling predicates for daemonset placement.
//!
//! Evaluates the required node affinity of a pod template against a node and
//! checks the node's hard taints against the template's tolerations. Only the
//! rules the scheduler enforces at placement time are considered: preferred
//! affinity and `PreferNoSchedule` taints never block.

use k8s_openapi::api::core::v1::{
    Node, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Taint, Toleration,
};
use std::collections::BTreeMap;

/// `Ok(())` when a pod with this affinity and these tolerations can run on
/// `node`; otherwise the reason it cannot.
pub fn check_node_schedulable(
    node: &Node,
    affinity: Option<&NodeAffinity>,
    tolerations: &[Toleration],
) -> Result<(), String> {
    let node_name = node.metadata.name.as_deref().unwrap_or_default();

    if let Some(required) = affinity.and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref()) {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        // terms are ORed
        let matched = required
            .node_selector_terms
            .iter()
            .any(|term| term_matches(term, &labels, node_name));
        if !matched {
            return Err(format!("node {node_name} does not match required node affinity"));
        }
    }

    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for taint in taints {
        if !matches!(taint.effect.as_str(), "NoSchedule" | "NoExecute") {
            continue;
        }
        if !tolerations.iter().any(|t| tolerates(t, taint)) {
            return Err(format!(
                "node {} has untolerated taint {}={}:{}",
                node_name,
                taint.key,
                taint.value.as_deref().unwrap_or_default(),
                taint.effect
            ));
        }
    }

    Ok(())
}

fn term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>, node_name: &str) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    // an empty term matches nothing
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }
    expressions.iter().all(|req| expression_matches(req, labels))
        && fields.iter().all(|req| field_matches(req, node_name))
}

fn expression_matches(req: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let actual = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
        "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
        "Exists" => actual.is_some(),
        "DoesNotExist" => actual.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), Some(bound)) = (
                actual.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|v| v.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            }
        }
        _ => false,
    }
}

fn field_matches(req: &NodeSelectorRequirement, node_name: &str) -> bool {
    if req.key != "metadata.name" {
        return false;
    }
    let values = req.values.as_deref().unwrap_or_default();
    let listed = values.iter().any(|v| v == node_name);
    match req.operator.as_str() {
        "In" => listed,
        "NotIn" => !listed,
        _ => false,
    }
}

/// Toleration matching as the scheduler does it.
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    let key = toleration.key.as_deref().unwrap_or_default();
    let operator = toleration.operator.as_deref().unwrap_or("Equal");
    if key.is_empty() {
        // empty key with Exists tolerates everything
        return operator == "Exists";
    }
    if key != taint.key {
        return false;
    }
    match operator {
        "Exists" => true,
        "Equal" => toleration.value.as_deref().unwrap_or_default() == taint.value.as_deref().unwrap_or_default(),
        _ => false,
    }
}
