#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContextId(pub(crate) String);

impl ContextId {
    pub const WORKFLOW_PREFIX: &'static str = "workflow-";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The fixed tab bound to a workflow rule target.
    pub fn workflow_tab(target: &str) -> Self {
        Self(format!("{}{target}", Self::WORKFLOW_PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
