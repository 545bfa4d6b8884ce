use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorKind;

pub mod agent;
pub mod engine;
pub mod memory;
pub mod watch;

pub use agent::PolicyAgent;
pub use watch::{spawn_watcher, ChangeEvent, ChangeHandler, WatchFeed, WatchOutcome};

use engine::{
    CheckPermissionRequest, EngineError, LookupResourcesRequest, LookupSubjectsRequest,
    ObjectReference, Relationship, SubjectReference,
};

/// Relation tuple query
///
/// Reads as "does `subject` (optionally as `subject_relation`) have
/// `permission` on `object`", or, for writes, "the `relation` edge between
/// `subject` and `object`".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReq {
    #[serde(default)]
    pub namespace: String,
    pub subject_type: String,
    pub subject: String,
    #[serde(default)]
    pub subject_relation: String,
    #[serde(default)]
    pub relation: String,
    #[serde(default)]
    pub permission: String,
    pub object_type: String,
    #[serde(default)]
    pub object: String,
}

/// One lookup result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRes {
    pub namespace: String,
    pub subject: String,
    pub object: String,
}

/// One bounded page of lookup results
///
/// An empty `next_cursor` means the lookup is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub results: Vec<PolicyRes>,
    pub next_cursor: String,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("missing policy subject")]
    MissingSubject,

    #[error("missing policy object")]
    MissingObject,

    #[error("missing policy permission")]
    MissingPermission,

    #[error("missing policy relation")]
    MissingRelation,

    #[error("missing policy object type")]
    MissingObjectType,

    #[error("missing policy subject type")]
    MissingSubjectType,

    #[error("permission denied: {reason}")]
    Denied { reason: String },

    #[error("policy backend unavailable during {operation}")]
    Engine {
        operation: &'static str,
        #[source]
        source: EngineError,
    },

    /// The stream failed part way; `partial` holds what was read before it.
    #[error("policy backend failed during {operation}, results incomplete")]
    Incomplete {
        operation: &'static str,
        partial: Page,
        #[source]
        source: EngineError,
    },
}

impl PolicyError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingSubject
            | Self::MissingObject
            | Self::MissingPermission
            | Self::MissingRelation
            | Self::MissingObjectType
            | Self::MissingSubjectType => ErrorKind::Validation,
            Self::Denied { .. } => ErrorKind::Authorization,
            Self::Engine { .. } | Self::Incomplete { .. } => ErrorKind::Backend,
        }
    }

    pub(crate) const fn engine(operation: &'static str, source: EngineError) -> Self {
        Self::Engine { operation, source }
    }
}

fn require(value: &str, err: PolicyError) -> Result<(), PolicyError> {
    if value.is_empty() {
        return Err(err);
    }
    Ok(())
}

impl PolicyReq {
    fn require_subject(&self) -> Result<(), PolicyError> {
        require(&self.subject, PolicyError::MissingSubject)?;
        require(&self.subject_type, PolicyError::MissingSubjectType)
    }

    fn require_object(&self) -> Result<(), PolicyError> {
        require(&self.object, PolicyError::MissingObject)?;
        require(&self.object_type, PolicyError::MissingObjectType)
    }

    /// Shape required by `check_policy`
    pub fn validate_check(&self) -> Result<(), PolicyError> {
        self.require_subject()?;
        self.require_object()?;
        require(&self.permission, PolicyError::MissingPermission)
    }

    /// Shape required by tuple writes and deletes
    pub fn validate_write(&self) -> Result<(), PolicyError> {
        self.require_subject()?;
        self.require_object()?;
        require(&self.relation, PolicyError::MissingRelation)
    }

    /// Shape required to list objects a subject can reach
    pub fn validate_object_lookup(&self) -> Result<(), PolicyError> {
        self.require_subject()?;
        require(&self.object_type, PolicyError::MissingObjectType)?;
        require(&self.permission, PolicyError::MissingPermission)
    }

    /// Shape required to list subjects that can reach an object
    pub fn validate_subject_lookup(&self) -> Result<(), PolicyError> {
        self.require_object()?;
        require(&self.subject_type, PolicyError::MissingSubjectType)?;
        require(&self.permission, PolicyError::MissingPermission)
    }

    fn resource(&self) -> ObjectReference {
        ObjectReference::new(&self.object_type, &self.object)
    }

    fn subject_reference(&self) -> SubjectReference {
        SubjectReference {
            object: ObjectReference::new(&self.subject_type, &self.subject),
            optional_relation: self.subject_relation.clone(),
        }
    }

    pub(crate) fn relationship(&self) -> Relationship {
        Relationship {
            resource: self.resource(),
            relation: self.relation.clone(),
            subject: self.subject_reference(),
        }
    }

    pub(crate) fn check_request(&self) -> CheckPermissionRequest {
        CheckPermissionRequest {
            resource: self.resource(),
            permission: self.permission.clone(),
            subject: self.subject_reference(),
        }
    }

    pub(crate) fn resources_request(
        &self,
        limit: u32,
        cursor: &str,
    ) -> LookupResourcesRequest {
        LookupResourcesRequest {
            resource_object_type: self.object_type.clone(),
            permission: self.permission.clone(),
            subject: self.subject_reference(),
            limit,
            cursor: cursor_from(cursor),
        }
    }

    pub(crate) fn subjects_request(&self, limit: u32, cursor: &str) -> LookupSubjectsRequest {
        LookupSubjectsRequest {
            resource: self.resource(),
            permission: self.permission.clone(),
            subject_object_type: self.subject_type.clone(),
            optional_subject_relation: self.subject_relation.clone(),
            limit,
            cursor: cursor_from(cursor),
        }
    }
}

fn cursor_from(token: &str) -> Option<engine::Cursor> {
    (!token.is_empty()).then(|| engine::Cursor {
        token: token.to_owned(),
    })
}

impl From<Relationship> for PolicyReq {
    fn from(relationship: Relationship) -> Self {
        Self {
            namespace: String::new(),
            subject_type: relationship.subject.object.object_type,
            subject: relationship.subject.object.object_id,
            subject_relation: relationship.subject.optional_relation,
            relation: relationship.relation,
            permission: String::new(),
            object_type: relationship.resource.object_type,
            object: relationship.resource.object_id,
        }
    }
}
