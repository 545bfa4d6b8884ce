//! Contract of the relationship engine behind the policy agent.
//!
//! The types mirror the request/response shapes of a Zanzibar-style
//! permission service: unary check and write calls plus server-streaming
//! lookups and a change feed. Streams end with `None`; transport failures
//! surface as `Some(Err(..))`.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Object reference (`type:id`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectReference {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectReference {
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }
}

/// Subject reference, optionally narrowed to a relation of the subject
/// object (`group:g1#member`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectReference {
    pub object: ObjectReference,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub optional_relation: String,
}

/// A relation tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub resource: ObjectReference,
    pub relation: String,
    pub subject: SubjectReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    pub operation: Operation,
    pub relationship: Relationship,
}

/// Opaque page continuation token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub token: String,
}

/// Opaque snapshot token, returned by writes and carried by the change feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permissionship {
    Unspecified,
    NoPermission,
    HasPermission,
    ConditionalPermission,
}

impl Permissionship {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "PERMISSIONSHIP_UNSPECIFIED",
            Self::NoPermission => "PERMISSIONSHIP_NO_PERMISSION",
            Self::HasPermission => "PERMISSIONSHIP_HAS_PERMISSION",
            Self::ConditionalPermission => "PERMISSIONSHIP_CONDITIONAL_PERMISSION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPermissionRequest {
    pub resource: ObjectReference,
    pub permission: String,
    pub subject: SubjectReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPermissionResponse {
    pub permissionship: Permissionship,
    pub checked_at: ConsistencyToken,
}

/// Find every object of `resource_object_type` on which `subject` has
/// `permission`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResourcesRequest {
    pub resource_object_type: String,
    pub permission: String,
    pub subject: SubjectReference,
    /// Maximum number of results; 0 lets the engine choose.
    pub limit: u32,
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResourcesResponse {
    pub resource_object_id: String,
    pub after_result_cursor: Option<Cursor>,
}

/// Find every subject of `subject_object_type` that has `permission` on
/// `resource`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSubjectsRequest {
    pub resource: ObjectReference,
    pub permission: String,
    pub subject_object_type: String,
    pub optional_subject_relation: String,
    /// Maximum number of results; 0 lets the engine choose.
    pub limit: u32,
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSubjectsResponse {
    pub subject_object_id: String,
    pub after_result_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRequest {
    /// Restrict the feed to these resource types; empty watches everything.
    pub object_types: Vec<String>,
    pub start_cursor: Option<ConsistencyToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub updates: Vec<RelationshipUpdate>,
    pub changes_through: ConsistencyToken,
}

pub type EngineStream<T> = BoxStream<'static, Result<T, EngineError>>;

/// Transport or engine failure
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("cursor does not belong to this query")]
    InvalidCursor,
}

/// Relationship engine transport
///
/// Implementations are shared between concurrent callers; every stream they
/// return is owned by the caller that opened it.
#[async_trait]
pub trait PermissionEngine: Send + Sync + 'static {
    async fn check_permission(
        &self,
        request: CheckPermissionRequest,
    ) -> Result<CheckPermissionResponse, EngineError>;

    /// Apply every update atomically
    async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<ConsistencyToken, EngineError>;

    async fn lookup_resources(
        &self,
        request: LookupResourcesRequest,
    ) -> Result<EngineStream<LookupResourcesResponse>, EngineError>;

    async fn lookup_subjects(
        &self,
        request: LookupSubjectsRequest,
    ) -> Result<EngineStream<LookupSubjectsResponse>, EngineError>;

    async fn watch(&self, request: WatchRequest) -> Result<EngineStream<WatchResponse>, EngineError>;
}
