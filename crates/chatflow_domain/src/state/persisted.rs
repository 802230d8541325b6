/// Global toggles that survive a restart.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PersistedModes {
    #[serde(default)]
    pub workflow_enabled: Option<bool>,
    #[serde(default)]
    pub relay_enabled: Option<bool>,
}
