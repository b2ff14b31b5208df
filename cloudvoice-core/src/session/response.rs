//! Normalization of terminal service responses into `IntentResult`.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::ipc::events::IntentResult;
use crate::transport::{
    ConnectionCheckResponse, IntentResponse, KnowledgeGraphResponse, StreamResponse,
};

/// Synthetic action name for knowledge-graph answers.
pub const KNOWLEDGE_GRAPH_ACTION: &str = "intent_knowledge_response_extend";

/// Synthetic action name for connection-check results.
pub const CONNECTION_CHECK_ACTION: &str = "connection_check";

pub fn normalize(session_id: &str, response: StreamResponse) -> Result<IntentResult> {
    match response {
        StreamResponse::Intent(r) => from_intent(session_id, r),
        StreamResponse::KnowledgeGraph(r) => from_knowledge_graph(session_id, r),
        StreamResponse::ConnectionCheck(r) => from_connection_check(session_id, r),
    }
}

fn from_intent(session_id: &str, r: IntentResponse) -> Result<IntentResult> {
    let parameters = if r.parameters.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&r.parameters)?)
    };
    Ok(IntentResult {
        session_id: session_id.to_string(),
        action: r.action,
        parameters,
        metadata: format!(
            "text: {}  confidence: {:.6}  handler: {}",
            r.query_text, r.confidence, r.handler
        ),
    })
}

fn from_knowledge_graph(session_id: &str, r: KnowledgeGraphResponse) -> Result<IntentResult> {
    let mut params = BTreeMap::new();
    params.insert("answer".to_string(), r.answer);
    params.insert("answer_type".to_string(), r.answer_type);
    params.insert("query_text".to_string(), r.query_text.clone());
    for (i, domain) in r.domains_used.into_iter().enumerate() {
        params.insert(format!("domains.{i}"), domain);
    }
    Ok(IntentResult {
        session_id: session_id.to_string(),
        action: KNOWLEDGE_GRAPH_ACTION.to_string(),
        parameters: Some(serde_json::to_string(&params)?),
        metadata: format!("text: {}", r.query_text),
    })
}

fn from_connection_check(session_id: &str, r: ConnectionCheckResponse) -> Result<IntentResult> {
    let mut params = BTreeMap::new();
    params.insert("status".to_string(), r.status.clone());
    params.insert("code".to_string(), r.code.to_string());
    Ok(IntentResult {
        session_id: session_id.to_string(),
        action: CONNECTION_CHECK_ACTION.to_string(),
        parameters: Some(serde_json::to_string(&params)?),
        metadata: format!("status: {}", r.status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_of(result: &IntentResult) -> BTreeMap<String, String> {
        let raw = result.parameters.as_deref().expect("parameters present");
        serde_json::from_str(raw).expect("parameters are a JSON string map")
    }

    #[test]
    fn intent_with_parameters() {
        let mut parameters = BTreeMap::new();
        parameters.insert("name".to_string(), "timer".to_string());
        let result = normalize(
            "s-1",
            StreamResponse::Intent(IntentResponse {
                action: "intent_clock_settimer".into(),
                parameters,
                query_text: "set a timer".into(),
                confidence: 0.5,
                handler: "dialogflow".into(),
            }),
        )
        .expect("normalize intent");

        assert_eq!(result.session_id, "s-1");
        assert_eq!(result.action, "intent_clock_settimer");
        assert_eq!(params_of(&result)["name"], "timer");
        assert_eq!(
            result.metadata,
            "text: set a timer  confidence: 0.500000  handler: dialogflow"
        );
    }

    #[test]
    fn intent_without_parameters_omits_them() {
        let result = normalize(
            "s-1",
            StreamResponse::Intent(IntentResponse {
                action: "intent_greeting_hello".into(),
                ..IntentResponse::default()
            }),
        )
        .expect("normalize intent");
        assert!(result.parameters.is_none());
    }

    #[test]
    fn knowledge_graph_has_fixed_action_and_one_key_per_domain() {
        let result = normalize(
            "s-2",
            StreamResponse::KnowledgeGraph(KnowledgeGraphResponse {
                answer: "Paris".into(),
                answer_type: "InformationAnswer".into(),
                query_text: "capital of france".into(),
                domains_used: vec!["geography".into(), "wiki".into(), "facts".into()],
            }),
        )
        .expect("normalize kg");

        assert_eq!(result.action, KNOWLEDGE_GRAPH_ACTION);
        let params = params_of(&result);
        let keys: Vec<&str> = params.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "answer",
                "answer_type",
                "domains.0",
                "domains.1",
                "domains.2",
                "query_text"
            ]
        );
        assert_eq!(params["answer"], "Paris");
        assert_eq!(params["domains.1"], "wiki");
    }

    #[test]
    fn knowledge_graph_without_domains_keeps_three_keys() {
        let result = normalize(
            "s-3",
            StreamResponse::KnowledgeGraph(KnowledgeGraphResponse::default()),
        )
        .expect("normalize kg");
        assert_eq!(params_of(&result).len(), 3);
    }

    #[test]
    fn connection_check_maps_status_and_code() {
        let result = normalize(
            "s-4",
            StreamResponse::ConnectionCheck(ConnectionCheckResponse {
                status: "Available".into(),
                code: 200,
            }),
        )
        .expect("normalize connection check");
        assert_eq!(result.action, CONNECTION_CHECK_ACTION);
        let params = params_of(&result);
        assert_eq!(params["status"], "Available");
        assert_eq!(params["code"], "200");
    }
}
