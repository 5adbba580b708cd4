//! Navigation path trees.
//!
//! A [`NavigationTree`] is the resolved form of a set of include directives:
//! an ordered tree of navigations rooted at one entity type. Store adapters
//! walk it to fetch related rows; the materializer walks it to wire the
//! resulting graph.

use crate::descriptor::{EntityDescriptor, NavigationInfo};

/// One requested navigation and the navigations requested through it.
#[derive(Debug, Clone)]
pub struct NavigationNode {
    info: &'static NavigationInfo,
    target: &'static EntityDescriptor,
    children: Vec<NavigationNode>,
}

impl NavigationNode {
    fn new(info: &'static NavigationInfo, target: &'static EntityDescriptor) -> Self {
        Self {
            info,
            target,
            children: Vec::new(),
        }
    }

    /// Navigation metadata.
    pub fn info(&self) -> &'static NavigationInfo {
        self.info
    }

    /// Navigation name.
    pub fn name(&self) -> &'static str {
        self.info.name
    }

    /// Descriptor of the related entity.
    pub fn target(&self) -> &'static EntityDescriptor {
        self.target
    }

    /// Navigations requested through this one.
    pub fn children(&self) -> &[NavigationNode] {
        &self.children
    }

    /// Find a direct child by navigation name.
    pub fn child(&self, name: &str) -> Option<&NavigationNode> {
        self.children.iter().find(|c| c.name() == name)
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        let path = if prefix.is_empty() {
            self.name().to_string()
        } else {
            format!("{}.{}", prefix, self.name())
        };
        for child in &self.children {
            child.collect_paths(&path, out);
        }
        out.push(path);
    }
}

/// Tree of navigations to load, rooted at one entity type.
#[derive(Debug, Clone)]
pub struct NavigationTree {
    root: &'static EntityDescriptor,
    children: Vec<NavigationNode>,
}

impl NavigationTree {
    /// Create an empty tree for `root`.
    pub fn new(root: &'static EntityDescriptor) -> Self {
        Self {
            root,
            children: Vec::new(),
        }
    }

    /// Descriptor of the root entity.
    pub fn root(&self) -> &'static EntityDescriptor {
        self.root
    }

    /// Top-level navigations.
    pub fn children(&self) -> &[NavigationNode] {
        &self.children
    }

    /// True when no navigation is requested.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Find a top-level navigation by name.
    pub fn child(&self, name: &str) -> Option<&NavigationNode> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Find a node by its navigation names from the root.
    pub fn find(&self, path: &[&str]) -> Option<&NavigationNode> {
        let (first, rest) = path.split_first()?;
        let mut node = self.child(first)?;
        for name in rest {
            node = node.child(name)?;
        }
        Some(node)
    }

    /// Descriptor of the entity at an index path (the root for `[]`).
    pub fn descriptor_at(&self, at: &[usize]) -> Option<&'static EntityDescriptor> {
        if at.is_empty() {
            return Some(self.root);
        }
        self.node_at(at).map(|n| n.target)
    }

    /// Node at an index path.
    pub fn node_at(&self, at: &[usize]) -> Option<&NavigationNode> {
        let (first, rest) = at.split_first()?;
        let mut node = self.children.get(*first)?;
        for i in rest {
            node = node.children.get(*i)?;
        }
        Some(node)
    }

    /// Children of the node at an index path (top-level nodes for `[]`).
    pub fn children_at(&self, at: &[usize]) -> Option<&[NavigationNode]> {
        if at.is_empty() {
            return Some(&self.children);
        }
        self.node_at(at).map(NavigationNode::children)
    }

    /// Add `info` under the node at index path `at`, merging with an existing
    /// child of the same name. Returns the child's index path.
    pub fn ensure_child(
        &mut self,
        at: &[usize],
        info: &'static NavigationInfo,
        target: &'static EntityDescriptor,
    ) -> Option<Vec<usize>> {
        let siblings = if at.is_empty() {
            &mut self.children
        } else {
            let (first, rest) = at.split_first()?;
            let mut node = self.children.get_mut(*first)?;
            for i in rest {
                node = node.children.get_mut(*i)?;
            }
            &mut node.children
        };
        let index = if let Some(i) = siblings.iter().position(|c| c.name() == info.name) {
            i
        } else {
            siblings.push(NavigationNode::new(info, target));
            siblings.len() - 1
        };
        let mut path = at.to_vec();
        path.push(index);
        Some(path)
    }

    /// Dotted paths of every node, deepest first within each branch.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for child in &self.children {
            child.collect_paths("", &mut out);
        }
        out
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        fn count(nodes: &[NavigationNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.children)).sum()
        }
        count(&self.children)
    }
}
