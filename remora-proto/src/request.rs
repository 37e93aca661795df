//! GraphQL request and response envelopes

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{MutationSync, MutationType};

/// Error type tag for a mutation rejected because the expected version did
/// not match. An app-level signal rather than a conflict.
pub const ERROR_TYPE_CONDITIONAL_CHECK: &str = "ConditionalCheck";

/// Error type tag for a version divergence the backend could not resolve.
pub const ERROR_TYPE_CONFLICT_UNHANDLED: &str = "ConflictUnhandled";

/// A GraphQL-style operation: a document plus variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub document: String,
    pub variables: serde_json::Value,
}

impl GraphQLRequest {
    pub fn new(document: impl Into<String>, variables: serde_json::Value) -> Self {
        Self {
            document: document.into(),
            variables,
        }
    }

    /// Builds a mutation request for one record change. `expected_version`
    /// becomes the conditional-write precondition when present.
    pub fn mutation(
        model_name: &str,
        mutation_type: MutationType,
        payload: &serde_json::Value,
        expected_version: Option<u64>,
    ) -> Self {
        let document = format!(
            "mutation {{ {}{}(input: $input, expectedVersion: $expectedVersion) }}",
            mutation_type.as_str(),
            model_name
        );
        Self::new(
            document,
            json!({
                "input": payload,
                "expectedVersion": expected_version,
            }),
        )
    }

    /// Builds one page request of the base sync query for a model.
    pub fn sync(model_name: &str, limit: u32, next_token: Option<String>) -> Self {
        let document = format!("query {{ sync{}(limit: $limit, nextToken: $nextToken) }}", model_name);
        Self::new(
            document,
            json!({
                "limit": limit,
                "nextToken": next_token,
            }),
        )
    }

    /// Builds the change subscription request for a model.
    pub fn subscription(model_name: &str) -> Self {
        Self::new(format!("subscription {{ onMutate{} }}", model_name), json!({}))
    }

    /// The `expectedVersion` variable, when the request carries one.
    pub fn expected_version(&self) -> Option<u64> {
        self.variables.get("expectedVersion").and_then(|v| v.as_u64())
    }

    /// The `input` variable, when the request carries one.
    pub fn input(&self) -> Option<&serde_json::Value> {
        self.variables.get("input")
    }
}

/// One error entry in a response. The type tag is an opaque string surfaced
/// by the transport; `data` carries the authoritative remote state on
/// unhandled conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLError {
    pub message: String,
    pub error_type: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>, error_type: Option<&str>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.map(str::to_string),
            data: None,
        }
    }

    /// Attaches the remote record state to this error.
    pub fn with_remote(mut self, remote: &MutationSync) -> Self {
        self.data = serde_json::to_value(remote).ok();
        self
    }

    pub fn is_conditional_check(&self) -> bool {
        self.error_type.as_deref() == Some(ERROR_TYPE_CONDITIONAL_CHECK)
    }

    pub fn is_unhandled_conflict(&self) -> bool {
        self.error_type.as_deref() == Some(ERROR_TYPE_CONFLICT_UNHANDLED)
    }

    /// Decodes the attached remote state, if any.
    pub fn remote_model(&self) -> Option<MutationSync> {
        self.data
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

/// Response envelope for one-shot operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLResponse {
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    pub fn from_data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn from_error(error: GraphQLError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// The response error, when the response carries exactly one. Responses
    /// with zero or several errors are not actionable per mutation.
    pub fn single_error(&self) -> Option<&GraphQLError> {
        match self.errors.as_slice() {
            [error] => Some(error),
            _ => None,
        }
    }
}

/// One page of the base sync query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    pub items: Vec<MutationSync>,
    pub next_token: Option<String>,
    /// Server timestamp the page snapshot was taken at, unix seconds
    pub started_at: i64,
}

impl SyncPage {
    pub fn new(items: Vec<MutationSync>, next_token: Option<String>, started_at: i64) -> Self {
        Self {
            items,
            next_token,
            started_at,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), None, 0)
    }

    /// Wraps this page as a successful query response.
    pub fn into_response(self) -> GraphQLResponse {
        GraphQLResponse::from_data(serde_json::to_value(self).unwrap_or(serde_json::Value::Null))
    }
}
