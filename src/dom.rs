use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DOCUMENT: AtomicU64 = AtomicU64::new(1);

/// Node handle, tagged with the document that issued it. Handles from another
/// document resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    doc: u64,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn left(&self) -> f64 {
        self.x
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementData {
    pub tag: String,
    pub classes: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element(ElementData),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    rect: Option<Rect>,
}

#[derive(Debug, Clone)]
pub struct Document {
    id: u64,
    nodes: Vec<Node>,
    body: Option<NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            id: NEXT_DOCUMENT.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            body: None,
        }
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Self::unloaded();
        doc.attach_body();
        doc
    }

    /// A document whose body has not been parsed yet.
    pub fn unloaded() -> Self {
        Self::default()
    }

    pub fn body(&self) -> Option<NodeId> {
        self.body
    }

    pub fn is_ready(&self) -> bool {
        self.body.is_some()
    }

    pub fn attach_body(&mut self) -> NodeId {
        if let Some(body) = self.body {
            return body;
        }
        let body = self.create_element("body");
        self.body = Some(body);
        body
    }

    pub fn owns(&self, node: NodeId) -> bool {
        self.node(node).is_some()
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        if id.doc != self.id {
            return None;
        }
        self.nodes.get(id.index)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if id.doc != self.id {
            return None;
        }
        self.nodes.get_mut(id.index)
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId {
            doc: self.id,
            index: self.nodes.len(),
        };
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
            rect: None,
        });
        id
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element(ElementData {
            tag: tag.to_ascii_lowercase(),
            ..ElementData::default()
        }))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if !self.owns(parent) || !self.owns(child) {
            return;
        }
        self.detach(child);
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
    }

    pub fn append_element(&mut self, parent: NodeId, tag: &str) -> NodeId {
        let node = self.create_element(tag);
        self.append_child(parent, node);
        node
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        let node = self.create_text(text);
        self.append_child(parent, node);
        node
    }

    pub fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.node_mut(node).and_then(|n| n.parent.take()) else {
            return;
        };
        if let Some(parent) = self.node_mut(parent) {
            parent.children.retain(|child| *child != node);
        }
    }

    /// Puts `replacements` where `node` was and detaches `node`.
    pub fn replace_with(&mut self, node: NodeId, replacements: &[NodeId]) {
        let Some(parent) = self.parent(node) else {
            return;
        };
        let replacements: Vec<NodeId> = replacements
            .iter()
            .copied()
            .filter(|&id| self.owns(id))
            .collect();
        for &replacement in &replacements {
            self.detach(replacement);
        }
        let Some(index) = self.index_in_parent(parent, node) else {
            return;
        };
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node
                .children
                .splice(index..=index, replacements.iter().copied());
        }
        for &replacement in &replacements {
            if let Some(child) = self.node_mut(replacement) {
                child.parent = Some(parent);
            }
        }
        if let Some(old) = self.node_mut(node) {
            old.parent = None;
        }
    }

    fn index_in_parent(&self, parent: NodeId, node: NodeId) -> Option<usize> {
        self.children(parent).iter().position(|child| *child == node)
    }

    pub fn kind(&self, node: NodeId) -> Option<&NodeKind> {
        self.node(node).map(|n| &n.kind)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.node(node).map_or(&[], |n| n.children.as_slice())
    }

    fn element(&self, node: NodeId) -> Option<&ElementData> {
        match self.kind(node)? {
            NodeKind::Element(data) => Some(data),
            NodeKind::Text(_) => None,
        }
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|data| data.tag.as_str())
    }

    pub fn text(&self, node: NodeId) -> Option<&str> {
        match self.kind(node)? {
            NodeKind::Text(text) => Some(text),
            NodeKind::Element(_) => None,
        }
    }

    fn element_mut(&mut self, node: NodeId) -> Option<&mut ElementData> {
        match &mut self.node_mut(node)?.kind {
            NodeKind::Element(data) => Some(data),
            NodeKind::Text(_) => None,
        }
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.element(node)
            .is_some_and(|data| data.classes.iter().any(|c| c == class))
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if let Some(data) = self.element_mut(node) {
            if !data.classes.iter().any(|c| c == class) {
                data.classes.push(class.to_string());
            }
        }
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node)?.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(data) = self.element_mut(node) {
            data.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn set_rect(&mut self, node: NodeId, rect: Rect) {
        if let Some(node) = self.node_mut(node) {
            node.rect = Some(rect);
        }
    }

    /// The node's own layout box, or the nearest ancestor's when it has none.
    pub fn bounding_rect(&self, node: NodeId) -> Rect {
        self.ancestors_inclusive(node)
            .find_map(|id| self.node(id).and_then(|n| n.rect))
            .unwrap_or_default()
    }

    pub fn ancestors_inclusive(&self, node: NodeId) -> Ancestors<'_> {
        Ancestors {
            doc: self,
            next: self.owns(node).then_some(node),
        }
    }

    pub fn closest(&self, node: NodeId, mut predicate: impl FnMut(NodeId) -> bool) -> Option<NodeId> {
        self.ancestors_inclusive(node).find(|&id| predicate(id))
    }

    pub fn closest_with_class(&self, node: NodeId, class: &str) -> Option<NodeId> {
        self.closest(node, |id| self.has_class(id, class))
    }

    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors_inclusive(node).any(|id| id == ancestor)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.body.is_some_and(|body| self.contains(body, node))
    }

    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.owns(root).then_some(root).into_iter().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    pub fn elements_with_class(&self, root: NodeId, class: &str) -> Vec<NodeId> {
        self.descendants(root)
            .into_iter()
            .filter(|&id| self.has_class(id, class))
            .collect()
    }

    pub fn text_content(&self, node: NodeId) -> String {
        self.descendants(node)
            .into_iter()
            .filter_map(|id| self.text(id))
            .collect()
    }

    /// Merges runs of adjacent text children of `parent` into one node.
    pub fn normalize(&mut self, parent: NodeId) {
        let children = self.children(parent).to_vec();
        let mut kept = Vec::with_capacity(children.len());
        let mut run: Option<NodeId> = None;
        for child in children {
            match (self.text(child).map(str::to_owned), run) {
                (Some(text), Some(head)) => {
                    if let Some(NodeKind::Text(head_text)) = self.node_mut(head).map(|n| &mut n.kind) {
                        head_text.push_str(&text);
                    }
                    if let Some(merged) = self.node_mut(child) {
                        merged.parent = None;
                    }
                }
                (Some(_), None) => {
                    run = Some(child);
                    kept.push(child);
                }
                (None, _) => {
                    run = None;
                    kept.push(child);
                }
            }
        }
        if let Some(parent) = self.node_mut(parent) {
            parent.children = kept;
        }
    }

    /// Serializes `node` with classes and attributes in a stable order.
    pub fn to_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_html(node, &mut out);
        out
    }

    fn write_html(&self, node: NodeId, out: &mut String) {
        match self.kind(node) {
            None => {}
            Some(NodeKind::Text(text)) => out.push_str(&escape_text(text)),
            Some(NodeKind::Element(data)) => {
                let _ = write!(out, "<{}", data.tag);
                if !data.classes.is_empty() {
                    let _ = write!(out, " class=\"{}\"", escape_text(&data.classes.join(" ")));
                }
                for (name, value) in &data.attributes {
                    let _ = write!(out, " {name}=\"{}\"", escape_text(value));
                }
                out.push('>');
                for &child in self.children(node) {
                    self.write_html(child, out);
                }
                let _ = write!(out, "</{}>", data.tag);
            }
        }
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

pub struct Ancestors<'a> {
    doc: &'a Document,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.doc.parent(current);
        Some(current)
    }
}
