//! Frame ancestry relative to the observing top-level context.

use pw_core::UNKNOWN;
use pw_core::WatchError;
use pw_core::WatchResult;

pub const TOP: &str = "top";
pub const DIFFERENT_WINDOW: &str = "diffwin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNode {
    pub name: String,
    pub origin: String,
    pub parent: Option<FrameId>,
    pub children: Vec<FrameId>,
    /// Traversal through this frame is refused (cross-origin isolation).
    pub isolated: bool,
    pub detached: bool,
}

/// Arena of browsing contexts. The first node is the observing top window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTree {
    nodes: Vec<FrameNode>,
    current: FrameId,
}

impl FrameTree {
    pub fn new(top_origin: impl Into<String>) -> Self {
        Self {
            nodes: vec![FrameNode {
                name: String::new(),
                origin: top_origin.into(),
                parent: None,
                children: Vec::new(),
                isolated: false,
                detached: false,
            }],
            current: FrameId(0),
        }
    }

    pub fn root(&self) -> FrameId {
        FrameId(0)
    }

    pub fn current(&self) -> FrameId {
        self.current
    }

    pub fn node(&self, id: FrameId) -> Option<&FrameNode> {
        self.nodes.get(id.0)
    }

    /// Another top-level context, e.g. a popup opened by the page.
    pub fn add_top(&mut self, origin: impl Into<String>) -> FrameId {
        self.push_node(FrameNode {
            name: String::new(),
            origin: origin.into(),
            parent: None,
            children: Vec::new(),
            isolated: false,
            detached: false,
        })
    }

    pub fn add_child(
        &mut self,
        parent: FrameId,
        name: impl Into<String>,
        origin: impl Into<String>,
    ) -> WatchResult<FrameId> {
        if self.node(parent).is_none() {
            return Err(unknown_frame(parent));
        }

        let id = self.push_node(FrameNode {
            name: name.into(),
            origin: origin.into(),
            parent: Some(parent),
            children: Vec::new(),
            isolated: false,
            detached: false,
        });
        if let Some(node) = self.nodes.get_mut(parent.0) {
            node.children.push(id);
        }
        Ok(id)
    }

    pub fn set_current(&mut self, id: FrameId) -> WatchResult<()> {
        if self.node(id).is_none() {
            return Err(unknown_frame(id));
        }
        self.current = id;
        Ok(())
    }

    pub fn set_isolated(&mut self, id: FrameId, isolated: bool) -> WatchResult<()> {
        let node = self.nodes.get_mut(id.0).ok_or_else(|| unknown_frame(id))?;
        node.isolated = isolated;
        Ok(())
    }

    pub fn detach(&mut self, id: FrameId) -> WatchResult<()> {
        let node = self.nodes.get_mut(id.0).ok_or_else(|| unknown_frame(id))?;
        node.detached = true;
        Ok(())
    }

    /// `"top"` for top-level frames, otherwise the frame's name.
    pub fn window_label(&self, id: FrameId) -> String {
        match self.node(id) {
            Some(node) if node.parent.is_none() => TOP.to_owned(),
            Some(node) => node.name.clone(),
            None => UNKNOWN.to_owned(),
        }
    }

    /// Path from the observing top window down to `frame` (default: current).
    pub fn resolve(&self, frame: Option<FrameId>) -> String {
        let target = frame.unwrap_or(self.current);
        match self.walk(target) {
            Ok(path) => path,
            Err(Hop::DifferentWindow) => DIFFERENT_WINDOW.to_owned(),
            Err(Hop::Inaccessible) => UNKNOWN.to_owned(),
        }
    }

    fn walk(&self, target: FrameId) -> Result<String, Hop> {
        let observer_top = self.top_of(self.current)?;
        let mut indices = Vec::new();
        let mut cursor = target;

        loop {
            let node = self.node(cursor).ok_or(Hop::Inaccessible)?;
            if node.detached {
                return Err(Hop::Inaccessible);
            }
            let Some(parent_id) = node.parent else {
                break;
            };
            let parent = self.node(parent_id).ok_or(Hop::Inaccessible)?;
            if node.isolated || parent.isolated {
                return Err(Hop::DifferentWindow);
            }
            let index = parent
                .children
                .iter()
                .position(|child| *child == cursor)
                .ok_or(Hop::Inaccessible)?;
            indices.push(index);
            cursor = parent_id;
        }

        if cursor != observer_top {
            return Err(Hop::DifferentWindow);
        }

        let mut path = String::from(TOP);
        for index in indices.iter().rev() {
            path.push_str(&format!(".frames[{index}]"));
        }
        Ok(path)
    }

    fn top_of(&self, id: FrameId) -> Result<FrameId, Hop> {
        let mut cursor = id;
        for _ in 0..=self.nodes.len() {
            let node = self.node(cursor).ok_or(Hop::Inaccessible)?;
            match node.parent {
                Some(parent) => cursor = parent,
                None => return Ok(cursor),
            }
        }
        Err(Hop::Inaccessible)
    }

    fn push_node(&mut self, node: FrameNode) -> FrameId {
        self.nodes.push(node);
        FrameId(self.nodes.len() - 1)
    }
}

enum Hop {
    DifferentWindow,
    Inaccessible,
}

fn unknown_frame(id: FrameId) -> WatchError {
    WatchError::new("hops.unknown_frame", format!("frame {} does not exist", id.0))
}

#[cfg(test)]
mod tests {
    use super::FrameTree;

    #[test]
    fn top_level_frame_resolves_to_top() {
        let tree = FrameTree::new("https://app.example");
        assert_eq!(tree.resolve(None), "top");
        assert_eq!(tree.window_label(tree.current()), "top");
    }

    #[test]
    fn nested_frames_report_sibling_indices() {
        let mut tree = FrameTree::new("https://app.example");
        let root = tree.root();
        let first = tree
            .add_child(root, "ads", "https://ads.example")
            .unwrap_or_else(|_| unreachable!());
        let second = tree
            .add_child(root, "widget", "https://widget.example")
            .unwrap_or_else(|_| unreachable!());
        let inner = tree
            .add_child(second, "inner", "https://widget.example")
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(tree.resolve(Some(first)), "top.frames[0]");
        assert!(tree.set_current(inner).is_ok());
        assert_eq!(tree.resolve(None), "top.frames[1].frames[0]");
        assert_eq!(tree.window_label(inner), "inner");
    }

    #[test]
    fn other_top_level_context_is_diffwin() {
        let mut tree = FrameTree::new("https://app.example");
        let popup = tree.add_top("https://popup.example");
        let child = tree
            .add_child(popup, "", "https://popup.example")
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(tree.resolve(Some(popup)), "diffwin");
        assert_eq!(tree.resolve(Some(child)), "diffwin");
    }

    #[test]
    fn isolated_boundary_is_diffwin_and_detached_is_unknown() {
        let mut tree = FrameTree::new("https://app.example");
        let root = tree.root();
        let isolated = tree
            .add_child(root, "sandbox", "https://sandbox.example")
            .unwrap_or_else(|_| unreachable!());
        assert!(tree.set_isolated(isolated, true).is_ok());
        assert_eq!(tree.resolve(Some(isolated)), "diffwin");

        let gone = tree
            .add_child(root, "gone", "https://app.example")
            .unwrap_or_else(|_| unreachable!());
        assert!(tree.detach(gone).is_ok());
        assert_eq!(tree.resolve(Some(gone)), "unknown");
    }

    #[test]
    fn adding_to_missing_parent_fails() {
        let mut tree = FrameTree::new("https://app.example");
        let other = FrameTree::new("x").add_top("y");
        let result = tree.add_child(other, "child", "z");
        assert!(result.is_err());
        if let Err(error) = result {
            assert_eq!(error.code, "hops.unknown_frame");
        }
    }
}
