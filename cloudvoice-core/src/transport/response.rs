//! Raw terminal responses as the service returns them, before normalization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    Intent(IntentResponse),
    KnowledgeGraph(KnowledgeGraphResponse),
    ConnectionCheck(ConnectionCheckResponse),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntentResponse {
    pub action: String,
    pub parameters: BTreeMap<String, String>,
    pub query_text: String,
    pub confidence: f32,
    pub handler: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnowledgeGraphResponse {
    pub answer: String,
    pub answer_type: String,
    pub query_text: String,
    pub domains_used: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionCheckResponse {
    pub status: String,
    pub code: u32,
}
