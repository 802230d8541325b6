use super::{ChatContext, ContextId, DispatchOrigin, QueuedAction};
use crate::RunConfig;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    Missing(ContextId),
    Busy(ContextId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Missing(id) => write!(f, "chat context {id} does not exist"),
            RegistryError::Busy(id) => write!(f, "chat context {id} is waiting for a response"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Open chat contexts in the order they were opened.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    contexts: HashMap<ContextId, ChatContext>,
    order: Vec<ContextId>,
    active: Option<ContextId>,
    next_chat_id: u64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            order: Vec::new(),
            active: None,
            next_chat_id: 1,
        }
    }

    /// Creates a fresh record. An existing record with the same id is replaced
    /// but keeps its position in the open order.
    pub fn create(&mut self, id: ContextId) -> &mut ChatContext {
        if !self.order.contains(&id) {
            self.order.push(id.clone());
        }
        if self.active.is_none() {
            self.active = Some(id.clone());
        }
        let fresh = ChatContext::new(id.clone());
        match self.contexts.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.insert(fresh);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(fresh),
        }
    }

    pub fn get(&self, id: &ContextId) -> Option<&ChatContext> {
        self.contexts.get(id)
    }

    pub fn get_mut(&mut self, id: &ContextId) -> Option<&mut ChatContext> {
        self.contexts.get_mut(id)
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.contexts.contains_key(id)
    }

    pub fn delete(&mut self, id: &ContextId) -> Option<ChatContext> {
        let removed = self.contexts.remove(id)?;

        let mut active_fallback: Option<ContextId> = None;
        if self.active.as_ref() == Some(id)
            && let Some(idx) = self.order.iter().position(|open| open == id)
        {
            if idx > 0 {
                active_fallback = Some(self.order[idx - 1].clone());
            } else if idx + 1 < self.order.len() {
                active_fallback = Some(self.order[idx + 1].clone());
            }
        }
        self.order.retain(|open| open != id);
        if self.active.as_ref() == Some(id) {
            self.active = active_fallback.or_else(|| self.order.first().cloned());
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> &[ContextId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatContext> {
        self.order.iter().filter_map(|id| self.contexts.get(id))
    }

    pub fn active(&self) -> Option<&ContextId> {
        self.active.as_ref()
    }

    pub fn activate(&mut self, id: &ContextId) -> bool {
        if !self.contexts.contains_key(id) {
            return false;
        }
        self.active = Some(id.clone());
        true
    }

    /// Next free `chat-N` id.
    pub fn allocate_id(&mut self) -> ContextId {
        loop {
            let id = ContextId(format!("chat-{}", self.next_chat_id));
            self.next_chat_id += 1;
            if !self.contexts.contains_key(&id) {
                return id;
            }
        }
    }

    /// The context after `id` in open order, wrapping to the first.
    pub fn next_after(&self, id: &ContextId) -> Option<ContextId> {
        if self.order.len() < 2 {
            return None;
        }
        let idx = self.order.iter().position(|open| open == id)?;
        Some(self.order[(idx + 1) % self.order.len()].clone())
    }

    pub fn begin_dispatch(
        &mut self,
        id: &ContextId,
        origin: DispatchOrigin,
    ) -> Result<u64, RegistryError> {
        let context = self
            .contexts
            .get_mut(id)
            .ok_or_else(|| RegistryError::Missing(id.clone()))?;
        context
            .begin_dispatch(origin)
            .ok_or_else(|| RegistryError::Busy(id.clone()))
    }

    pub fn assign_config(&mut self, id: &ContextId, config: RunConfig) -> bool {
        let Some(context) = self.contexts.get_mut(id) else {
            return false;
        };
        context.assigned_config = Some(config);
        true
    }

    /// Stores `action`, returning whatever was queued before.
    pub fn queue_action(
        &mut self,
        id: &ContextId,
        action: QueuedAction,
    ) -> Result<Option<QueuedAction>, RegistryError> {
        let context = self
            .contexts
            .get_mut(id)
            .ok_or_else(|| RegistryError::Missing(id.clone()))?;
        Ok(context.queued_action.replace(action))
    }

    pub fn take_queued_action(&mut self, id: &ContextId) -> Option<QueuedAction> {
        self.contexts.get_mut(id)?.queued_action.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(ids: &[&str]) -> SessionRegistry {
        let mut registry = SessionRegistry::new();
        for id in ids {
            registry.create(ContextId::new(*id));
        }
        registry
    }

    #[test]
    fn get_after_delete_is_absent() {
        let mut registry = registry_with(&["a", "b"]);
        assert!(registry.delete(&ContextId::new("a")).is_some());
        assert!(registry.get(&ContextId::new("a")).is_none());
        assert!(registry.delete(&ContextId::new("a")).is_none());
        assert_eq!(registry.ids(), &[ContextId::new("b")]);
    }

    #[test]
    fn create_overwrites_existing_record_in_place() {
        let mut registry = registry_with(&["a", "b"]);
        registry
            .get_mut(&ContextId::new("a"))
            .expect("a")
            .conversation_id = Some("c-1".to_owned());

        registry.create(ContextId::new("a"));
        assert_eq!(
            registry.get(&ContextId::new("a")).expect("a").conversation_id,
            None
        );
        assert_eq!(registry.ids(), &[ContextId::new("a"), ContextId::new("b")]);
    }

    #[test]
    fn next_after_wraps_round_robin() {
        let registry = registry_with(&["a", "b", "c"]);
        assert_eq!(
            registry.next_after(&ContextId::new("b")),
            Some(ContextId::new("c"))
        );
        assert_eq!(
            registry.next_after(&ContextId::new("c")),
            Some(ContextId::new("a"))
        );
        assert_eq!(registry.next_after(&ContextId::new("zzz")), None);
        assert_eq!(registry_with(&["a"]).next_after(&ContextId::new("a")), None);
    }

    #[test]
    fn deleting_active_context_activates_neighbour() {
        let mut registry = registry_with(&["a", "b", "c"]);
        registry.activate(&ContextId::new("b"));
        registry.delete(&ContextId::new("b"));
        assert_eq!(registry.active(), Some(&ContextId::new("a")));

        registry.activate(&ContextId::new("a"));
        registry.delete(&ContextId::new("a"));
        assert_eq!(registry.active(), Some(&ContextId::new("c")));
    }

    #[test]
    fn allocate_id_skips_taken_ids() {
        let mut registry = registry_with(&["chat-1"]);
        assert_eq!(registry.allocate_id(), ContextId::new("chat-2"));
    }

    #[test]
    fn begin_dispatch_reports_busy_and_missing() {
        let mut registry = registry_with(&["a"]);
        let a = ContextId::new("a");
        registry
            .begin_dispatch(&a, DispatchOrigin::User)
            .expect("first dispatch");
        assert_eq!(
            registry.begin_dispatch(&a, DispatchOrigin::User),
            Err(RegistryError::Busy(a.clone()))
        );
        assert_eq!(
            registry.begin_dispatch(&ContextId::new("x"), DispatchOrigin::User),
            Err(RegistryError::Missing(ContextId::new("x")))
        );
    }

    #[test]
    fn queued_action_is_taken_once() {
        let mut registry = registry_with(&["a"]);
        let a = ContextId::new("a");
        let action = QueuedAction {
            prompt_text: "p".to_owned(),
            config: RunConfig::new("m"),
        };
        assert_eq!(registry.queue_action(&a, action.clone()), Ok(None));
        assert_eq!(registry.take_queued_action(&a), Some(action));
        assert_eq!(registry.take_queued_action(&a), None);
    }
}
