use crate::{AppState, PersistedModes};

pub(crate) fn apply_persisted_modes(state: &mut AppState, persisted: &PersistedModes) {
    if let Some(enabled) = persisted.workflow_enabled {
        state.modes.workflow_enabled = enabled;
    }
    if let Some(enabled) = persisted.relay_enabled {
        state.modes.relay_enabled = enabled;
    }
}

impl AppState {
    pub fn to_persisted_modes(&self) -> PersistedModes {
        PersistedModes {
            workflow_enabled: Some(self.modes.workflow_enabled),
            relay_enabled: Some(self.modes.relay_enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_keep_current_modes() {
        let mut state = AppState::new();
        state.modes.workflow_enabled = true;
        apply_persisted_modes(&mut state, &PersistedModes::default());
        assert!(state.modes.workflow_enabled);
        assert!(!state.modes.relay_enabled);
    }

    #[test]
    fn modes_round_trip_through_persisted_form() {
        let mut state = AppState::new();
        state.modes.relay_enabled = true;
        let persisted = state.to_persisted_modes();

        let mut restored = AppState::new();
        apply_persisted_modes(&mut restored, &persisted);
        assert_eq!(restored.modes, state.modes);
    }
}
