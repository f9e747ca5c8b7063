//! In-memory identity forest
//!
//! Nodes are indexed by id; parent and child links are ids, never pointers.
//! The gateway's own identity is the mandatory root: an auth chain that does
//! not reach it is incomplete and resolves to nothing.

use crate::identity::model::{AuthChain, ServiceIdentity};
use std::collections::{HashMap, HashSet};

struct Node {
    identity: ServiceIdentity,
    parent: Option<String>,
    children: HashSet<String>,
}

pub struct IdentityHierarchy {
    root_id: String,
    nodes: HashMap<String, Node>,
}

impl IdentityHierarchy {
    /// `root_id` is the gateway's own device identity
    pub fn new(root_id: &str) -> Self {
        Self {
            root_id: root_id.to_string(),
            nodes: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Insert or replace a node, preserving existing children and
    /// re-attaching any nodes whose declared parent this id is.
    pub fn insert_or_update(&mut self, identity: ServiceIdentity) {
        let id = identity.id.clone();
        let parent = identity.parent_id.clone();

        // children = everyone claiming this id as parent
        let children: HashSet<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.identity.parent_id.as_deref() == Some(id.as_str()))
            .map(|(child_id, _)| child_id.clone())
            .collect();

        if let Some(parent_id) = parent.as_deref() {
            if let Some(parent_node) = self.nodes.get_mut(parent_id) {
                parent_node.children.insert(id.clone());
            }
        }

        self.nodes.insert(
            id,
            Node {
                identity,
                parent,
                children,
            },
        );
    }

    /// Delete the node for `id`. Children stay in the forest with a dangling
    /// parent link; their auth chains resolve to nothing until the parent
    /// reappears.
    pub fn remove(&mut self, id: &str) {
        if let Some(node) = self.nodes.remove(id) {
            if let Some(parent_id) = node.parent.as_deref() {
                if let Some(parent_node) = self.nodes.get_mut(parent_id) {
                    parent_node.children.remove(id);
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ServiceIdentity> {
        self.nodes.get(id).map(|n| &n.identity)
    }

    pub fn get_all_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn get_immediate_children(&self, id: &str) -> Vec<ServiceIdentity> {
        match self.nodes.get(id) {
            Some(node) => node
                .children
                .iter()
                .filter_map(|child| self.nodes.get(child))
                .map(|n| n.identity.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Walk parents from `id` to the gateway root. `None` when any hop is
    /// missing or disabled, or the walk does not terminate at the root.
    pub fn get_auth_chain(&self, id: &str) -> Option<AuthChain> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = id;

        loop {
            if !visited.insert(current.to_string()) {
                // parent cycle; treat as broken
                return None;
            }
            let node = self.nodes.get(current)?;
            if !node.identity.is_enabled() {
                return None;
            }
            chain.push(current.to_string());
            if current == self.root_id {
                return Some(AuthChain::new(chain));
            }
            current = node.parent.as_deref()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::model::{AuthType, IdentityKind, IdentityStatus};

    fn identity(id: &str, parent: Option<&str>) -> ServiceIdentity {
        ServiceIdentity {
            id: id.to_string(),
            kind: if id.contains('/') {
                IdentityKind::Module
            } else {
                IdentityKind::Device
            },
            parent_id: parent.map(str::to_string),
            auth_type: AuthType::Sas,
            status: IdentityStatus::Enabled,
            device_scope: None,
            auth_secrets: None,
        }
    }

    fn sample() -> IdentityHierarchy {
        let mut tree = IdentityHierarchy::new("root");
        tree.insert_or_update(identity("root", None));
        tree.insert_or_update(identity("gw1", Some("root")));
        tree.insert_or_update(identity("d1", Some("gw1")));
        tree.insert_or_update(identity("d1/mod1", Some("d1")));
        tree
    }

    #[test]
    fn chain_walks_to_root() {
        let tree = sample();
        let chain = tree.get_auth_chain("d1/mod1").unwrap();
        assert_eq!(chain.to_string(), "d1/mod1;d1;gw1;root");
    }

    #[test]
    fn chain_breaks_on_disabled_hop() {
        let mut tree = sample();
        let mut gw = identity("gw1", Some("root"));
        gw.status = IdentityStatus::Disabled;
        tree.insert_or_update(gw);
        assert!(tree.get_auth_chain("d1").is_none());

        tree.insert_or_update(identity("gw1", Some("root")));
        assert!(tree.get_auth_chain("d1").is_some());
    }

    #[test]
    fn chain_requires_the_gateway_root() {
        let mut tree = IdentityHierarchy::new("root");
        tree.insert_or_update(identity("orphan", None));
        assert!(tree.get_auth_chain("orphan").is_none());
    }

    #[test]
    fn removing_a_parent_detaches_children_until_it_returns() {
        let mut tree = sample();
        tree.remove("gw1");
        assert!(tree.get_auth_chain("d1").is_none());
        assert!(tree.get("d1").is_some());

        tree.insert_or_update(identity("gw1", Some("root")));
        assert_eq!(tree.get_auth_chain("d1").unwrap().to_string(), "d1;gw1;root");
    }

    #[test]
    fn update_preserves_children() {
        let mut tree = sample();
        let mut updated = identity("d1", Some("gw1"));
        updated.auth_type = AuthType::X509Thumbprint;
        tree.insert_or_update(updated);
        let children = tree.get_immediate_children("d1");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "d1/mod1");
    }
}
