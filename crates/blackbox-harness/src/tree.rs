#![forbid(unsafe_code)]

//! Arena-backed consumer tree driven by hand.
//!
//! [`TestTree`] plays the role of a rendering host: it mounts boundaries
//! and consumers under a [`Provider`], hands every node the capability
//! bundle its parent scoped for it, and walks the tree root to leaf when a
//! snapshot is published. Every visit is recorded in a [`RenderLog`].
//!
//! # Propagation
//!
//! | Node       | Outcome                  | Children receive          |
//! |------------|--------------------------|---------------------------|
//! | Boundary   | `Skip`                   | nothing (`Pruned` logged) |
//! | Boundary   | `Propagate(filtered)`    | the filtered snapshot     |
//! | Consumer   | `Render` / `Skip`        | the same snapshot         |

use std::fmt;
use std::rc::Rc;

use blackbox_core::{Mapping, Value};
use blackbox_runtime::{
    Boundary, BoundaryOptions, Capabilities, Connect, ConnectError, ConsumerNode, PassError,
    Propagation, Provider, RenderDecision, Snapshot,
};

/// Index of a node in a [`TestTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// One recorded visit.
#[derive(Debug, Clone)]
pub enum RenderEvent {
    /// A consumer produced new props.
    Rendered { label: String, props: Value },
    /// A consumer was offered a snapshot and kept its props.
    Skipped { label: String },
    /// A boundary stopped the snapshot.
    Pruned { label: String },
}

/// Ordered record of visits.
#[derive(Debug, Clone, Default)]
pub struct RenderLog {
    events: Vec<RenderEvent>,
}

impl RenderLog {
    #[must_use]
    pub fn events(&self) -> &[RenderEvent] {
        &self.events
    }

    /// Labels of rendered consumers, in visit order.
    #[must_use]
    pub fn rendered(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RenderEvent::Rendered { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RenderEvent::Skipped { label } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn pruned(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RenderEvent::Pruned { label } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Props of the last render of `label`.
    #[must_use]
    pub fn last_props(&self, label: &str) -> Option<&Value> {
        self.events.iter().rev().find_map(|event| match event {
            RenderEvent::Rendered { label: l, props } if l == label => Some(props),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Errors surfaced while driving a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    Pass(PassError),
    Connect(ConnectError),
    UnknownNode(NodeId),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass(err) => write!(f, "pass failed: {err}"),
            Self::Connect(err) => write!(f, "consumer failed: {err}"),
            Self::UnknownNode(id) => write!(f, "no mounted node {}", id.0),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pass(err) => Some(err),
            Self::Connect(err) => Some(err),
            Self::UnknownNode(_) => None,
        }
    }
}

impl From<PassError> for TreeError {
    fn from(err: PassError) -> Self {
        Self::Pass(err)
    }
}

impl From<ConnectError> for TreeError {
    fn from(err: ConnectError) -> Self {
        Self::Connect(err)
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

enum NodeKind {
    Boundary(Boundary),
    Consumer(ConsumerNode),
}

struct TreeNode {
    label: String,
    kind: NodeKind,
    props: Mapping,
    /// Bundle handed to this node's children.
    child_caps: Capabilities,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A hand-driven consumer tree rooted at one provider.
pub struct TestTree {
    provider: Provider,
    nodes: Vec<Option<TreeNode>>,
    roots: Vec<NodeId>,
    log: RenderLog,
}

impl TestTree {
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            nodes: Vec::new(),
            roots: Vec::new(),
            log: RenderLog::default(),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    fn node(&self, id: NodeId) -> Result<&TreeNode, TreeError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(TreeError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut TreeNode, TreeError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(TreeError::UnknownNode(id))
    }

    fn caps_for(&self, parent: Option<NodeId>) -> Result<Capabilities, TreeError> {
        match parent {
            Some(parent) => Ok(self.node(parent)?.child_caps.clone()),
            None => Ok(self.provider.capabilities()),
        }
    }

    fn attach(&mut self, parent: Option<NodeId>, node: TreeNode) -> Result<NodeId, TreeError> {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        match parent {
            Some(parent) => self.node_mut(parent)?.children.push(id),
            None => self.roots.push(id),
        }
        Ok(id)
    }

    /// Mount a pruning boundary under `parent`, or at the root.
    pub fn mount_boundary(
        &mut self,
        parent: Option<NodeId>,
        label: &str,
        props: Mapping,
        options: BoundaryOptions,
    ) -> Result<NodeId, TreeError> {
        let caps = self.caps_for(parent)?;
        let boundary = Boundary::mount(&caps, &props, options);
        let child_caps = boundary.capabilities_for_children().clone();
        self.attach(
            parent,
            TreeNode {
                label: label.to_owned(),
                kind: NodeKind::Boundary(boundary),
                props,
                child_caps,
                parent,
                children: Vec::new(),
            },
        )
    }

    /// Mount a consumer under `parent`, or at the root.
    pub fn mount_consumer(
        &mut self,
        parent: Option<NodeId>,
        label: &str,
        connect: &Connect,
        props: Mapping,
    ) -> Result<NodeId, TreeError> {
        let caps = self.caps_for(parent)?;
        let consumer = connect.mount(&caps, &props)?;
        self.attach(
            parent,
            TreeNode {
                label: label.to_owned(),
                kind: NodeKind::Consumer(consumer),
                props,
                child_caps: caps,
                parent,
                children: Vec::new(),
            },
        )
    }

    /// Replace a node's own properties. Takes effect on the next
    /// propagation.
    pub fn set_props(&mut self, id: NodeId, props: Mapping) -> Result<(), TreeError> {
        self.node_mut(id)?.props = props;
        Ok(())
    }

    #[must_use]
    pub fn consumer(&self, id: NodeId) -> Option<&ConsumerNode> {
        match &self.nodes.get(id.0)?.as_ref()?.kind {
            NodeKind::Consumer(node) => Some(node),
            NodeKind::Boundary(_) => None,
        }
    }

    pub fn consumer_mut(&mut self, id: NodeId) -> Option<&mut ConsumerNode> {
        match &mut self.nodes.get_mut(id.0)?.as_mut()?.kind {
            NodeKind::Consumer(node) => Some(node),
            NodeKind::Boundary(_) => None,
        }
    }

    #[must_use]
    pub fn boundary(&self, id: NodeId) -> Option<&Boundary> {
        match &self.nodes.get(id.0)?.as_ref()?.kind {
            NodeKind::Boundary(boundary) => Some(boundary),
            NodeKind::Consumer(_) => None,
        }
    }

    /// Unmount `id` and its subtree, children first.
    pub fn unmount(&mut self, id: NodeId) -> Result<(), TreeError> {
        let (parent, children) = {
            let node = self.node(id)?;
            (node.parent, node.children.clone())
        };
        for child in children {
            self.unmount(child)?;
        }
        if let Some(mut node) = self.nodes.get_mut(id.0).and_then(Option::take) {
            match &mut node.kind {
                NodeKind::Boundary(boundary) => boundary.unmount(),
                NodeKind::Consumer(consumer) => consumer.unmount(),
            }
        }
        match parent {
            Some(parent) => {
                if let Ok(parent) = self.node_mut(parent) {
                    parent.children.retain(|child| *child != id);
                }
            }
            None => self.roots.retain(|root| *root != id),
        }
        Ok(())
    }

    /// Refresh the provider and propagate whatever it publishes.
    ///
    /// Returns `false` when the provider skipped the pass.
    pub fn refresh(&mut self) -> Result<bool, TreeError> {
        match self.provider.refresh()? {
            Some(snapshot) => {
                self.propagate(&snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Walk every root with `snapshot`.
    pub fn propagate(&mut self, snapshot: &Rc<Snapshot>) -> Result<(), TreeError> {
        for root in self.roots.clone() {
            self.visit(root, snapshot)?;
        }
        Ok(())
    }

    fn visit(&mut self, id: NodeId, snapshot: &Rc<Snapshot>) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(TreeError::UnknownNode(id))?;
        let children = node.children.clone();
        let label = node.label.clone();
        let props = node.props.clone();
        let forwarded = match &mut node.kind {
            NodeKind::Boundary(boundary) => match boundary.update(snapshot, &props) {
                Propagation::Skip => {
                    self.log.events.push(RenderEvent::Pruned { label });
                    return Ok(());
                }
                Propagation::Propagate(filtered) => filtered,
            },
            NodeKind::Consumer(consumer) => {
                let event = match consumer.update(snapshot, &props)? {
                    RenderDecision::Render(props) => RenderEvent::Rendered { label, props },
                    RenderDecision::Skip => RenderEvent::Skipped { label },
                };
                self.log.events.push(event);
                Rc::clone(snapshot)
            }
        };
        for child in children {
            self.visit(child, &forwarded)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn log(&self) -> &RenderLog {
        &self.log
    }

    /// The log so far, leaving an empty one behind.
    pub fn take_log(&mut self) -> RenderLog {
        std::mem::take(&mut self.log)
    }
}

impl fmt::Debug for TestTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestTree")
            .field("provider", &self.provider)
            .field("nodes", &self.nodes.iter().flatten().count())
            .field("roots", &self.roots)
            .finish()
    }
}
