/// The effect an [`Event`] should have on local state, after collapsing the
/// store's many action verbs down to the two effects a consumer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Set,
    Delete,
}

/// Maps a raw store action string to the effect it produces, per the
/// canonical action table. Unknown actions (e.g. `compareAndSwap` variants
/// the store hasn't told us about, or expirations of keys we don't track)
/// return `None` and the event is silently dropped.
pub fn effect_of_action(action: &str) -> Option<Effect> {
    match action {
        "set" | "create" | "update" | "compareAndSwap" => Some(Effect::Set),
        "delete" | "compareAndDelete" | "expire" => Some(Effect::Delete),
        _ => None,
    }
}

/// A single change reported by the remote store's long-poll `wait` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub action: String,
    pub key: String,
    pub value: Option<String>,
    pub modified_index: u64,
}

impl Event {
    pub fn effect(&self) -> Option<Effect> {
        effect_of_action(&self.action)
    }
}
