use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One atomic instruction for the recorder, e.g. `{"name": "author-speak-before", "value": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub name: String,
    pub value: String,
}

impl WorkItem {
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.value.is_empty()
    }

    /// Form stored in a record's `workItems`
    pub fn to_value(&self) -> Value {
        serde_json::json!({"name": self.name, "value": self.value})
    }
}

/// Narration produced before recording, forwarded untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxiliaryAsset {
    pub text: String,
    #[serde(alias = "mp3Url")]
    pub resolved_media_url: String,
}

/// A job record ("manifest"), persisted as `<id>.json` in the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Filename stem and correlation key for logs and derived media
    #[serde(alias = "uuid")]
    pub id: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default, alias = "userId")]
    pub owner_id: String,
    /// Opaque to the pipeline; only the recorder interprets them
    #[serde(default, alias = "actions")]
    pub work_items: Vec<Value>,
    #[serde(default, alias = "audioItems")]
    pub auxiliary_assets: Vec<AuxiliaryAsset>,
    /// Set only when processing fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Everything else (lesson snapshots, IDE props, ...) passes through as-is
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            environment: String::new(),
            owner_id: String::new(),
            work_items: Vec::new(),
            auxiliary_assets: Vec::new(),
            error: None,
            payload: Map::new(),
        }
    }

    /// Filename this record is stored under
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Ids become file names, so path separators and dot-only names are refused
    pub fn has_valid_id(&self) -> bool {
        let id = self.id.trim();
        !id.is_empty()
            && id == self.id
            && !id.contains(['/', '\\'])
            && id != "."
            && id != ".."
    }
}
