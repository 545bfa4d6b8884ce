//! In-process relationship engine.
//!
//! Tuples live in a sorted set guarded by a read/write lock. Permissions are
//! resolved through a static schema mapping `object type -> permission ->
//! relations`; a permission missing from the schema resolves to the relation
//! of the same name. Subject sets (`group:g1#member`) are followed a bounded
//! number of hops.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::engine::{
    CheckPermissionRequest, CheckPermissionResponse, ConsistencyToken, Cursor, EngineError,
    EngineStream, LookupResourcesRequest, LookupResourcesResponse, LookupSubjectsRequest,
    LookupSubjectsResponse, ObjectReference, Operation, PermissionEngine, Permissionship,
    Relationship, RelationshipUpdate, SubjectReference, WatchRequest, WatchResponse,
};
use crate::config::EngineConfig;

const DEFAULT_LIMIT: usize = 1000;
const MAX_DEPTH: usize = 8;
const CHANGELOG_LIMIT: usize = 4096;
const WATCH_BUFFER: usize = 256;

type Schema = HashMap<String, HashMap<String, Vec<String>>>;

#[derive(Debug, Clone)]
struct Revision {
    revision: u64,
    updates: Vec<RelationshipUpdate>,
}

#[derive(Debug, Default)]
struct State {
    tuples: BTreeSet<Relationship>,
    revision: u64,
    changelog: VecDeque<Revision>,
}

pub struct MemoryEngine {
    schema: Schema,
    state: RwLock<State>,
    changes: broadcast::Sender<Revision>,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("schema", &self.schema)
            .field("revision", &self.state.read().revision)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(Schema::new())
    }
}

impl MemoryEngine {
    pub fn new(schema: Schema) -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            schema,
            state: RwLock::new(State::default()),
            changes,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.schema.clone())
    }

    fn relations(&self, object_type: &str, permission: &str) -> Vec<String> {
        self.schema
            .get(object_type)
            .and_then(|permissions| permissions.get(permission))
            .cloned()
            .unwrap_or_else(|| vec![permission.to_owned()])
    }

    fn has_permission(
        &self,
        state: &State,
        resource: &ObjectReference,
        permission: &str,
        subject: &SubjectReference,
        depth: usize,
    ) -> bool {
        let relations = self.relations(&resource.object_type, permission);

        state
            .tuples
            .iter()
            .filter(|t| &t.resource == resource && relations.contains(&t.relation))
            .any(|t| {
                if &t.subject == subject {
                    return true;
                }
                depth > 0
                    && !t.subject.optional_relation.is_empty()
                    && self.has_permission(
                        state,
                        &t.subject.object,
                        &t.subject.optional_relation,
                        subject,
                        depth - 1,
                    )
            })
    }
}

fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Position after which a page resumes, or `None` for the first page
fn resume_after(cursor: Option<&Cursor>, fingerprint: &str) -> Result<Option<String>, EngineError> {
    let Some(cursor) = cursor else {
        return Ok(None);
    };

    match cursor.token.split_once('.') {
        Some((fp, last)) if fp == fingerprint => Ok(Some(last.to_owned())),
        _ => Err(EngineError::InvalidCursor),
    }
}

/// Cut one page out of a sorted id set, attaching a cursor to every element
fn paginate(
    ids: BTreeSet<String>,
    after: Option<String>,
    limit: u32,
    fingerprint: &str,
) -> Vec<(String, Cursor)> {
    let limit = match usize::try_from(limit) {
        Ok(0) | Err(_) => DEFAULT_LIMIT,
        Ok(limit) => limit,
    };

    ids.into_iter()
        .filter(|id| after.as_ref().map_or(true, |after| id > after))
        .take(limit)
        .map(|id| {
            let cursor = Cursor {
                token: format!("{fingerprint}.{id}"),
            };
            (id, cursor)
        })
        .collect()
}

fn validate(relationship: &Relationship) -> Result<(), EngineError> {
    let fields = [
        &relationship.resource.object_type,
        &relationship.resource.object_id,
        &relationship.relation,
        &relationship.subject.object.object_type,
        &relationship.subject.object.object_id,
    ];
    if fields.iter().any(|field| field.is_empty()) {
        return Err(EngineError::InvalidArgument(format!(
            "incomplete relationship: {relationship:?}"
        )));
    }
    Ok(())
}

fn parse_revision(token: &ConsistencyToken) -> Result<u64, EngineError> {
    token
        .token
        .parse()
        .map_err(|_| EngineError::InvalidArgument(format!("bad watch cursor: {}", token.token)))
}

fn to_response(revision: Revision, object_types: &[String]) -> Option<WatchResponse> {
    let updates: Vec<_> = revision
        .updates
        .into_iter()
        .filter(|u| {
            object_types.is_empty()
                || object_types.contains(&u.relationship.resource.object_type)
        })
        .collect();

    (!updates.is_empty()).then(|| WatchResponse {
        updates,
        changes_through: ConsistencyToken {
            token: revision.revision.to_string(),
        },
    })
}

#[async_trait]
impl PermissionEngine for MemoryEngine {
    async fn check_permission(
        &self,
        request: CheckPermissionRequest,
    ) -> Result<CheckPermissionResponse, EngineError> {
        let state = self.state.read();

        let permissionship = if self.has_permission(
            &state,
            &request.resource,
            &request.permission,
            &request.subject,
            MAX_DEPTH,
        ) {
            Permissionship::HasPermission
        } else {
            Permissionship::NoPermission
        };

        Ok(CheckPermissionResponse {
            permissionship,
            checked_at: ConsistencyToken {
                token: state.revision.to_string(),
            },
        })
    }

    async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<ConsistencyToken, EngineError> {
        for update in &updates {
            validate(&update.relationship)?;
        }

        let mut state = self.state.write();

        let applied: Vec<_> = updates
            .into_iter()
            .filter(|update| match update.operation {
                Operation::Create => state.tuples.insert(update.relationship.clone()),
                Operation::Delete => state.tuples.remove(&update.relationship),
            })
            .collect();

        if !applied.is_empty() {
            state.revision += 1;
            let revision = Revision {
                revision: state.revision,
                updates: applied,
            };

            if state.changelog.len() == CHANGELOG_LIMIT {
                state.changelog.pop_front();
            }
            state.changelog.push_back(revision.clone());

            // Sent under the lock so watchers never miss or reorder revisions.
            if self.changes.send(revision).is_err() {
                debug!(revision = state.revision, "no active watchers");
            }
        }

        Ok(ConsistencyToken {
            token: state.revision.to_string(),
        })
    }

    async fn lookup_resources(
        &self,
        request: LookupResourcesRequest,
    ) -> Result<EngineStream<LookupResourcesResponse>, EngineError> {
        let subject = &request.subject;
        let fp = fingerprint(&[
            "resources",
            &request.resource_object_type,
            &request.permission,
            &subject.object.object_type,
            &subject.object.object_id,
            &subject.optional_relation,
        ]);
        let after = resume_after(request.cursor.as_ref(), &fp)?;

        let ids = {
            let state = self.state.read();
            let ids: BTreeSet<String> = state
                .tuples
                .iter()
                .filter(|t| t.resource.object_type == request.resource_object_type)
                .map(|t| &t.resource)
                .filter(|resource| {
                    self.has_permission(&state, resource, &request.permission, subject, MAX_DEPTH)
                })
                .map(|resource| resource.object_id.clone())
                .collect();
            ids
        };

        let page = paginate(ids, after, request.limit, &fp)
            .into_iter()
            .map(|(id, cursor)| {
                Ok(LookupResourcesResponse {
                    resource_object_id: id,
                    after_result_cursor: Some(cursor),
                })
            })
            .collect::<Vec<_>>();

        debug!(count = page.len(), "lookup_resources page");
        Ok(stream::iter(page).boxed())
    }

    async fn lookup_subjects(
        &self,
        request: LookupSubjectsRequest,
    ) -> Result<EngineStream<LookupSubjectsResponse>, EngineError> {
        let fp = fingerprint(&[
            "subjects",
            &request.resource.object_type,
            &request.resource.object_id,
            &request.permission,
            &request.subject_object_type,
            &request.optional_subject_relation,
        ]);
        let after = resume_after(request.cursor.as_ref(), &fp)?;

        let ids = {
            let state = self.state.read();
            let ids: BTreeSet<String> = state
                .tuples
                .iter()
                .map(|t| &t.subject)
                .filter(|s| {
                    s.object.object_type == request.subject_object_type
                        && s.optional_relation == request.optional_subject_relation
                })
                .filter(|s| {
                    self.has_permission(
                        &state,
                        &request.resource,
                        &request.permission,
                        s,
                        MAX_DEPTH,
                    )
                })
                .map(|s| s.object.object_id.clone())
                .collect();
            ids
        };

        let page = paginate(ids, after, request.limit, &fp)
            .into_iter()
            .map(|(id, cursor)| {
                Ok(LookupSubjectsResponse {
                    subject_object_id: id,
                    after_result_cursor: Some(cursor),
                })
            })
            .collect::<Vec<_>>();

        debug!(count = page.len(), "lookup_subjects page");
        Ok(stream::iter(page).boxed())
    }

    async fn watch(&self, request: WatchRequest) -> Result<EngineStream<WatchResponse>, EngineError> {
        let start = request.start_cursor.as_ref().map(parse_revision).transpose()?;

        let (mut rx, backlog, mut last) = {
            let state = self.state.read();
            let rx = self.changes.subscribe();
            let start = start.unwrap_or(state.revision);

            if let Some(oldest) = state.changelog.front() {
                if start.saturating_add(1) < oldest.revision {
                    return Err(EngineError::InvalidArgument(format!(
                        "watch cursor {start} is older than the retained changelog"
                    )));
                }
            }

            let backlog: Vec<_> = state
                .changelog
                .iter()
                .filter(|entry| entry.revision > start)
                .cloned()
                .collect();

            (rx, backlog, start.max(state.revision))
        };

        let object_types = request.object_types;

        let stream = async_stream::stream! {
            for entry in backlog {
                if let Some(response) = to_response(entry, &object_types) {
                    yield Ok(response);
                }
            }

            loop {
                match rx.recv().await {
                    Ok(entry) if entry.revision > last => {
                        last = entry.revision;
                        if let Some(response) = to_response(entry, &object_types) {
                            yield Ok(response);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%skipped, "watch subscriber fell behind");
                        yield Err(EngineError::Stream(format!(
                            "watcher lagged by {skipped} revisions"
                        )));
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
