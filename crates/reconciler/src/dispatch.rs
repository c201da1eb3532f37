//! Pattern-matching router from key paths to set/delete handlers, with named
//! captures — the `PathDispatcher` component (§4.C).

use std::collections::{
    BTreeMap,
    HashMap,
};

use sync_types::{
    Effect,
    Event,
};

/// Bindings captured from a matched path, keyed by capture name (e.g. the
/// `<prof>` in `/v1/profile/<prof>/tags` binds `"prof"` to the matched
/// segment).
pub type Captures = BTreeMap<String, String>;

type Handler = Box<dyn Fn(&Event, &Captures) + Send + Sync>;

#[derive(Default)]
struct Node {
    literal_children: HashMap<String, Node>,
    /// At most one capture edge per node; `(name, child)`.
    capture_child: Option<(String, Box<Node>)>,
    on_set: Option<Handler>,
    on_delete: Option<Handler>,
}

impl Node {
    fn child_for_registration(&mut self, segment: &str) -> Result<&mut Node, RegistrationConflict> {
        if let Some(capture_name) = capture_name(segment) {
            match &mut self.capture_child {
                Some((existing_name, _)) if existing_name != capture_name => {
                    return Err(RegistrationConflict {
                        existing: existing_name.clone(),
                        attempted: capture_name.to_string(),
                    });
                },
                Some((_, child)) => Ok(child),
                None => {
                    self.capture_child = Some((capture_name.to_string(), Box::default()));
                    Ok(&mut self.capture_child.as_mut().unwrap().1)
                },
            }
        } else {
            Ok(self
                .literal_children
                .entry(segment.to_string())
                .or_default())
        }
    }
}

fn capture_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
}

/// Two patterns disagree on the capture name bound at the same position in
/// the tree (e.g. `/a/<x>/c` registered after `/a/<y>/d`).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("conflicting capture name {attempted:?} vs already-registered {existing:?} at the same tree position")]
pub struct RegistrationConflict {
    pub existing: String,
    pub attempted: String,
}

/// A tree of literal/capture segments mapping key paths to `on_set`/`on_delete`
/// callbacks. Built once at agent start from a static list of registrations;
/// read-only thereafter. Dispatch always prefers a literal child match over a
/// capture child at the same node (Open Question 2: literal wins).
#[derive(Default)]
pub struct PathDispatcher {
    root: Node,
}

impl PathDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pattern (e.g. `/v1/profile/<prof>/tags`) with optional
    /// `on_set`/`on_delete` callbacks. Segments of the form `<name>` are
    /// captures; all others are matched literally.
    pub fn register(
        &mut self,
        pattern: &str,
        on_set: Option<Handler>,
        on_delete: Option<Handler>,
    ) -> Result<(), RegistrationConflict> {
        tracing::info!(pattern, "registering dispatcher path");
        let mut node = &mut self.root;
        for segment in pattern.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            node = node.child_for_registration(segment)?;
        }
        if on_set.is_some() {
            node.on_set = on_set;
        }
        if on_delete.is_some() {
            node.on_delete = on_delete;
        }
        Ok(())
    }

    /// Dispatches `event`: splits its key into segments and descends the
    /// tree, preferring a literal child match, then a capture edge (binding
    /// the segment), and otherwise silently dropping the event. At the
    /// terminal node, the action is mapped to `set`/`delete` and the matching
    /// callback, if any, is invoked with the event and the captured bindings.
    pub fn handle_event(&self, event: &Event) {
        tracing::debug!(action = %event.action, key = %event.key, "dispatching event");
        let mut node = &self.root;
        let mut captures = Captures::new();
        for segment in event.key.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            if let Some(child) = node.literal_children.get(segment) {
                node = child;
            } else if let Some((name, child)) = &node.capture_child {
                captures.insert(name.clone(), segment.to_string());
                node = child;
            } else {
                tracing::debug!(key = %event.key, "no matching sub-handler");
                return;
            }
        }
        match event.effect() {
            Some(Effect::Set) => {
                if let Some(handler) = &node.on_set {
                    handler(event, &captures);
                }
            },
            Some(Effect::Delete) => {
                if let Some(handler) = &node.on_delete {
                    handler(event, &captures);
                }
            },
            None => {
                tracing::debug!(action = %event.action, "dropping event with unmapped action");
            },
        }
    }
}
