use chatflow_api::{ModelInfo, PresetCatalog, PresetInfo};

/// What the backend offers. Each half is `None` until it has been fetched.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub models: Option<Vec<ModelInfo>>,
    pub presets: Option<PresetCatalog>,
}

impl Catalog {
    pub fn model_ids(&self) -> Vec<String> {
        self.models
            .iter()
            .flatten()
            .map(|model| model.id.clone())
            .collect()
    }

    /// Preset keys, which is what a dispatch selects by.
    pub fn preset_ids(&self) -> Vec<String> {
        self.presets.iter().flat_map(|p| p.keys().cloned()).collect()
    }

    pub fn model_list(&self) -> Vec<ModelInfo> {
        self.models.clone().unwrap_or_default()
    }

    pub fn preset_list(&self) -> Vec<PresetInfo> {
        self.presets
            .iter()
            .flat_map(|presets| presets.values().cloned())
            .collect()
    }
}
