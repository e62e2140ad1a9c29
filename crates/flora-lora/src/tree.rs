//! Named module trees of base models.
//!
//! The base model is consumed only as a tree of named sub-modules. Leaves
//! carry a [`LayerSlot`], the invocation path of one frozen layer. Attaching an
//! adapter routes the slot through the adapter, which in turn calls the
//! untouched base layer; detaching restores the plain path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::Array;
use tracing::debug;

use crate::io::WeightMap;
use crate::layer::{BaseLayer, LayerGeometry, SharedLayer};
use crate::module::LoraModule;
use crate::{LoraError, Result};

/// Shared handle to an adapter module.
pub type SharedAdapter = Rc<RefCell<LoraModule>>;

/// Maps a dotted module path to a block class name.
pub type Classifier = fn(&str) -> Option<&'static str>;

/// Class a classifier reports for lookup tables. Their 2-D weights are not
/// layers and stay with the extra tensors.
pub const EMBEDDING_CLASS: &str = "Embedding";

struct SlotInner {
    layer: SharedLayer,
    adapter: RefCell<Option<SharedAdapter>>,
}

/// Invocation path of one leaf layer.
///
/// Clones share the same slot.
#[derive(Clone)]
pub struct LayerSlot(Rc<SlotInner>);

impl std::fmt::Debug for LayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerSlot")
            .field("geometry", &self.geometry())
            .field("adapted", &self.is_adapted())
            .finish()
    }
}

impl LayerSlot {
    /// Create a slot around a base layer.
    pub fn new(layer: BaseLayer) -> Self {
        Self::from_shared(layer.into_shared())
    }

    /// Create a slot around an existing shared layer.
    pub fn from_shared(layer: SharedLayer) -> Self {
        Self(Rc::new(SlotInner {
            layer,
            adapter: RefCell::new(None),
        }))
    }

    /// The base layer behind this slot.
    pub fn layer(&self) -> &SharedLayer {
        &self.0.layer
    }

    /// Geometry of the base layer.
    pub fn geometry(&self) -> LayerGeometry {
        self.0.layer.borrow().geometry()
    }

    /// Run the layer, through the adapter when one is attached.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let adapter = self.0.adapter.borrow().clone();
        match adapter {
            Some(adapter) => adapter.borrow().forward(x),
            None => self.0.layer.borrow().forward(x),
        }
    }

    /// Route this slot through `adapter`.
    pub fn attach(&self, adapter: SharedAdapter) -> Result<()> {
        let mut current = self.0.adapter.borrow_mut();
        if let Some(ref existing) = *current {
            return Err(LoraError::AlreadyAttached(existing.borrow().name().to_string()));
        }
        *current = Some(adapter);
        Ok(())
    }

    /// Restore the plain invocation path, returning the detached adapter.
    pub fn detach(&self) -> Option<SharedAdapter> {
        self.0.adapter.borrow_mut().take()
    }

    /// Whether an adapter is attached.
    pub fn is_adapted(&self) -> bool {
        self.0.adapter.borrow().is_some()
    }

    /// Whether two handles refer to the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// One node of a module tree.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    class_name: String,
    children: Vec<(String, ModuleNode)>,
    slot: Option<LayerSlot>,
}

impl ModuleNode {
    /// Container node of the given class.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            children: Vec::new(),
            slot: None,
        }
    }

    /// Leaf node for a base layer, named after its geometry.
    pub fn leaf(layer: BaseLayer) -> Self {
        Self {
            class_name: layer.geometry().class_name().to_string(),
            children: Vec::new(),
            slot: Some(LayerSlot::new(layer)),
        }
    }

    /// Builder-style child insertion.
    pub fn with_child(mut self, name: impl Into<String>, child: ModuleNode) -> Self {
        self.push_child(name, child);
        self
    }

    /// Append a child.
    pub fn push_child(&mut self, name: impl Into<String>, child: ModuleNode) {
        self.children.push((name.into(), child));
    }

    /// Class name.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Layer slot, for leaves.
    pub fn slot(&self) -> Option<&LayerSlot> {
        self.slot.as_ref()
    }

    /// Direct children in insertion order.
    pub fn children(&self) -> &[(String, ModuleNode)] {
        &self.children
    }

    /// Direct child by name.
    pub fn child(&self, name: &str) -> Option<&ModuleNode> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    /// Descendant by dotted path. The empty path is this node.
    pub fn get(&self, path: &str) -> Option<&ModuleNode> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |node, name| node.child(name))
    }

    /// All nodes in pre-order with their dotted paths, this node first as `""`.
    pub fn named_modules(&self) -> Vec<(String, &ModuleNode)> {
        let mut out = Vec::new();
        self.collect_named("", &mut out);
        out
    }

    fn collect_named<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a ModuleNode)>) {
        out.push((path.to_string(), self));
        for (name, child) in &self.children {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}.{name}")
            };
            child.collect_named(&child_path, out);
        }
    }

    /// All leaf slots with their dotted paths.
    pub fn leaves(&self) -> Vec<(String, LayerSlot)> {
        self.named_modules()
            .into_iter()
            .filter_map(|(path, node)| node.slot.clone().map(|slot| (path, slot)))
            .collect()
    }

    fn child_entry(&mut self, name: &str, class_name: &str) -> &mut ModuleNode {
        let idx = match self.children.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.children
                    .push((name.to_string(), ModuleNode::new(class_name)));
                self.children.len() - 1
            }
        };
        &mut self.children[idx].1
    }
}

/// A base model as a module tree plus the tensors that are not layer weights.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    root: ModuleNode,
    extra: WeightMap,
}

impl ModuleTree {
    /// Wrap an already built root node.
    pub fn new(root: ModuleNode) -> Self {
        Self {
            root,
            extra: HashMap::new(),
        }
    }

    /// Build a tree from a flat checkpoint.
    ///
    /// Every 2-D `<path>.weight` becomes a Linear leaf and every 4-D one a
    /// Conv2d leaf; `<path>.bias` is attached to its leaf. Paths the
    /// classifier names [`EMBEDDING_CLASS`] are not leaves. Intermediate nodes
    /// are named by `classifier`, falling back to `"Module"`. Everything else
    /// is kept aside and returned by [`ModuleTree::to_weights`].
    pub fn from_weights(
        mut weights: WeightMap,
        root_class: &str,
        classifier: Classifier,
    ) -> Result<Self> {
        let mut leaf_paths: Vec<String> = weights
            .iter()
            .filter(|(key, value)| {
                key.ends_with(".weight") && matches!(value.ndim(), 2 | 4)
            })
            .map(|(key, _)| key.trim_end_matches(".weight").to_string())
            .filter(|path| classifier(path) != Some(EMBEDDING_CLASS))
            .collect();
        leaf_paths.sort();

        let mut root = ModuleNode::new(root_class);
        for path in &leaf_paths {
            let weight = weights
                .remove(&format!("{path}.weight"))
                .ok_or_else(|| LoraError::MissingWeight(format!("{path}.weight")))?;
            let bias = weights.remove(&format!("{path}.bias"));
            let geometry = LayerGeometry::from_weight_shape(weight.shape()).ok_or_else(|| {
                LoraError::ShapeMismatch(format!("{path}: unsupported weight rank"))
            })?;
            let layer = BaseLayer::new(geometry, weight, bias)?;

            let mut node = &mut root;
            let mut prefix = String::new();
            for segment in path.split('.') {
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(segment);
                let class_name = classifier(&prefix).unwrap_or("Module");
                node = node.child_entry(segment, class_name);
            }
            node.class_name = geometry.class_name().to_string();
            node.slot = Some(LayerSlot::new(layer));
        }

        debug!(
            "built {} tree: {} layers, {} extra tensors",
            root_class,
            leaf_paths.len(),
            weights.len()
        );

        Ok(Self {
            root,
            extra: weights,
        })
    }

    /// Root node.
    pub fn root(&self) -> &ModuleNode {
        &self.root
    }

    /// Slot at a dotted path.
    pub fn slot(&self, path: &str) -> Option<LayerSlot> {
        self.root.get(path).and_then(|n| n.slot().cloned())
    }

    /// Number of leaf layers.
    pub fn num_layers(&self) -> usize {
        self.root.leaves().len()
    }

    /// Flatten back into a checkpoint, with current (possibly merged) weights.
    pub fn to_weights(&self) -> WeightMap {
        let mut out = self.extra.clone();
        for (path, slot) in self.root.leaves() {
            let layer = slot.layer().borrow();
            out.insert(format!("{path}.weight"), layer.weight().clone());
            if let Some(bias) = layer.bias() {
                out.insert(format!("{path}.bias"), bias.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros(shape: &[i32]) -> Array {
        mlx_rs::ops::zeros::<f32>(shape).unwrap()
    }

    fn classify(path: &str) -> Option<&'static str> {
        path.ends_with("block").then_some("Block")
    }

    #[test]
    fn test_from_weights_builds_tree() {
        let mut weights = WeightMap::new();
        weights.insert("block.proj.weight".into(), zeros(&[4, 2]));
        weights.insert("block.proj.bias".into(), zeros(&[4]));
        weights.insert("block.conv.weight".into(), zeros(&[4, 2, 3, 3]));
        weights.insert("block.norm.scale".into(), zeros(&[4]));

        let tree = ModuleTree::from_weights(weights, "Root", classify).unwrap();
        assert_eq!(tree.root().class_name(), "Root");
        assert_eq!(tree.root().get("block").unwrap().class_name(), "Block");
        assert_eq!(tree.root().get("block.proj").unwrap().class_name(), "Linear");
        assert_eq!(tree.root().get("block.conv").unwrap().class_name(), "Conv2d");
        assert_eq!(tree.num_layers(), 2);

        let slot = tree.slot("block.proj").unwrap();
        assert!(slot.layer().borrow().bias().is_some());

        let flat = tree.to_weights();
        assert_eq!(flat.len(), 4);
        assert!(flat.contains_key("block.norm.scale"));
        assert!(flat.contains_key("block.proj.bias"));
    }

    #[test]
    fn test_embeddings_are_not_leaves() {
        fn classify_tables(path: &str) -> Option<&'static str> {
            path.ends_with("table").then_some(EMBEDDING_CLASS)
        }

        let mut weights = WeightMap::new();
        weights.insert("block.table.weight".into(), zeros(&[32, 4]));
        weights.insert("block.proj.weight".into(), zeros(&[4, 4]));

        let tree = ModuleTree::from_weights(weights, "Root", classify_tables).unwrap();
        assert_eq!(tree.num_layers(), 1);
        assert!(tree.slot("block.table").is_none());
        assert!(tree.to_weights().contains_key("block.table.weight"));
    }

    #[test]
    fn test_named_modules_preorder() {
        let layer = BaseLayer::linear(zeros(&[2, 2]), None).unwrap();
        let root = ModuleNode::new("Root")
            .with_child("a", ModuleNode::new("A").with_child("fc", ModuleNode::leaf(layer)));
        let names: Vec<String> = root.named_modules().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["", "a", "a.fc"]);
        assert!(root.get("a.missing").is_none());
    }

    #[test]
    fn test_slot_clones_share_state() {
        let slot = LayerSlot::new(BaseLayer::linear(zeros(&[2, 2]), None).unwrap());
        let other = slot.clone();
        assert!(slot.ptr_eq(&other));
        assert!(!slot.is_adapted());
        assert!(other.detach().is_none());
    }
}
