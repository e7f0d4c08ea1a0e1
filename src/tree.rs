//! Display tree built from a store snapshot. Pure and stateless.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{Address, Node};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub address: Address,
    pub level: u32,
    pub total_investment: Decimal,
    pub direct_volume: Decimal,
    pub team_volume: Decimal,
    pub is_active: bool,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Nodes in this subtree, self included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }
}

/// Build the subtree under `root`, at most `max_depth` levels deep.
/// Returns `None` when `root` is not in `nodes`.
pub fn build_tree(nodes: &[Node], root: &Address, max_depth: usize) -> Option<TreeNode> {
    let by_address: HashMap<&Address, &Node> = nodes.iter().map(|n| (&n.address, n)).collect();
    let mut children: HashMap<&Address, Vec<&Node>> = HashMap::new();
    for node in nodes {
        if let Some(parent) = &node.referrer {
            children.entry(parent).or_default().push(node);
        }
    }

    let root_node = *by_address.get(root)?;
    let mut on_path = HashSet::new();
    Some(build(root_node, 0, max_depth, &children, &mut on_path))
}

fn build<'a>(
    node: &'a Node,
    level: u32,
    max_depth: usize,
    children: &HashMap<&'a Address, Vec<&'a Node>>,
    on_path: &mut HashSet<&'a Address>,
) -> TreeNode {
    on_path.insert(&node.address);

    let mut kids = Vec::new();
    if (level as usize) < max_depth {
        for child in children.get(&node.address).into_iter().flatten() {
            // A corrupted loop back into the current path is cut here
            if on_path.contains(&child.address) {
                continue;
            }
            kids.push(build(child, level + 1, max_depth, children, on_path));
        }
    }

    on_path.remove(&node.address);
    TreeNode {
        address: node.address.clone(),
        level,
        total_investment: node.total_investment,
        direct_volume: node.direct_volume,
        team_volume: node.team_volume,
        is_active: node.is_active,
        children: kids,
    }
}
