use std::fmt;
use std::future::Future;
use std::slice;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::{
    ConsistencyToken, Cursor, EngineError, EngineStream, Operation, PermissionEngine,
    Permissionship, RelationshipUpdate, WatchRequest,
};
use super::watch::WatchFeed;
use super::{Page, PolicyError, PolicyReq, PolicyRes};
use crate::config::PolicyConfig;

/// Relation-tuple client over a [`PermissionEngine`]
///
/// Cheap to clone; clones share the engine connection. Every unary call and
/// every streamed element is bounded by the configured request timeout.
#[derive(Clone)]
pub struct PolicyAgent {
    engine: Arc<dyn PermissionEngine>,
    config: PolicyConfig,
}

impl fmt::Debug for PolicyAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyAgent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyAgent {
    pub fn new(engine: Arc<dyn PermissionEngine>, config: PolicyConfig) -> Self {
        Self { engine, config }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, EngineError>> + Send,
    ) -> Result<T, PolicyError> {
        match timeout(self.config.request_timeout(), fut).await {
            Ok(result) => result.map_err(|source| PolicyError::engine(operation, source)),
            Err(_) => Err(PolicyError::engine(operation, EngineError::Timeout)),
        }
    }

    /// Succeeds only when the engine reports the permission as held
    pub async fn check_policy(&self, req: &PolicyReq) -> Result<(), PolicyError> {
        req.validate_check()?;

        let response = self
            .call(
                "check_permission",
                self.engine.check_permission(req.check_request()),
            )
            .await?;

        match response.permissionship {
            Permissionship::HasPermission => Ok(()),
            other => {
                debug!(
                    subject = %req.subject,
                    permission = %req.permission,
                    object = %req.object,
                    permissionship = other.as_str(),
                    "policy check denied"
                );
                Err(PolicyError::Denied {
                    reason: other.as_str().to_owned(),
                })
            }
        }
    }

    pub async fn add_policy(&self, req: &PolicyReq) -> Result<(), PolicyError> {
        self.add_policies(slice::from_ref(req)).await
    }

    /// Write every tuple in one engine call; an empty batch does nothing
    pub async fn add_policies(&self, reqs: &[PolicyReq]) -> Result<(), PolicyError> {
        self.write("add_policies", Operation::Create, reqs).await
    }

    pub async fn delete_policy(&self, req: &PolicyReq) -> Result<(), PolicyError> {
        self.delete_policies(slice::from_ref(req)).await
    }

    /// Delete every tuple in one engine call; an empty batch does nothing
    pub async fn delete_policies(&self, reqs: &[PolicyReq]) -> Result<(), PolicyError> {
        self.write("delete_policies", Operation::Delete, reqs).await
    }

    async fn write(
        &self,
        operation_name: &'static str,
        operation: Operation,
        reqs: &[PolicyReq],
    ) -> Result<(), PolicyError> {
        if reqs.is_empty() {
            return Ok(());
        }

        let updates = reqs
            .iter()
            .map(|req| {
                req.validate_write()?;
                Ok(RelationshipUpdate {
                    operation,
                    relationship: req.relationship(),
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let ConsistencyToken { token } = self
            .call(operation_name, self.engine.write_relationships(updates))
            .await?;

        debug!(count = reqs.len(), written_at = %token, "{operation_name} applied");
        Ok(())
    }

    /// Read one page of objects `req.subject` can reach
    ///
    /// `limit == 0` lets the engine pick the page size.
    pub async fn retrieve_objects(
        &self,
        req: &PolicyReq,
        cursor: &str,
        limit: u32,
    ) -> Result<Page, PolicyError> {
        const OPERATION: &str = "lookup_resources";

        req.validate_object_lookup()?;

        let stream = self
            .call(
                OPERATION,
                self.engine
                    .lookup_resources(req.resources_request(limit, cursor)),
            )
            .await?;

        self.read_page(OPERATION, stream, |item| {
            let res = PolicyRes {
                namespace: req.namespace.clone(),
                subject: String::new(),
                object: item.resource_object_id,
            };
            (res, item.after_result_cursor)
        })
        .await
    }

    /// Read one page of subjects that can reach `req.object`
    pub async fn retrieve_subjects(
        &self,
        req: &PolicyReq,
        cursor: &str,
        limit: u32,
    ) -> Result<Page, PolicyError> {
        const OPERATION: &str = "lookup_subjects";

        req.validate_subject_lookup()?;

        let stream = self
            .call(
                OPERATION,
                self.engine.lookup_subjects(req.subjects_request(limit, cursor)),
            )
            .await?;

        self.read_page(OPERATION, stream, |item| {
            let res = PolicyRes {
                namespace: req.namespace.clone(),
                subject: item.subject_object_id,
                object: String::new(),
            };
            (res, item.after_result_cursor)
        })
        .await
    }

    pub async fn retrieve_all_objects(&self, req: &PolicyReq) -> Result<Vec<PolicyRes>, PolicyError> {
        let limit = self.config.retrieve_all_page_size;
        self.collect_all("retrieve_all_objects", move |cursor| async move {
            self.retrieve_objects(req, &cursor, limit).await
        })
        .await
    }

    pub async fn retrieve_all_objects_count(&self, req: &PolicyReq) -> Result<usize, PolicyError> {
        self.retrieve_all_objects(req).await.map(|all| all.len())
    }

    pub async fn retrieve_all_subjects(&self, req: &PolicyReq) -> Result<Vec<PolicyRes>, PolicyError> {
        let limit = self.config.retrieve_all_page_size;
        self.collect_all("retrieve_all_subjects", move |cursor| async move {
            self.retrieve_subjects(req, &cursor, limit).await
        })
        .await
    }

    pub async fn retrieve_all_subjects_count(&self, req: &PolicyReq) -> Result<usize, PolicyError> {
        self.retrieve_all_subjects(req).await.map(|all| all.len())
    }

    /// Open the change feed, resuming after `from` when it is not empty
    ///
    /// The feed stops pulling from the engine as soon as `cancel` fires.
    pub async fn watch(&self, from: &str, cancel: CancellationToken) -> Result<WatchFeed, PolicyError> {
        let request = WatchRequest {
            object_types: Vec::new(),
            start_cursor: (!from.is_empty()).then(|| ConsistencyToken {
                token: from.to_owned(),
            }),
        };

        let stream = self.call("watch", self.engine.watch(request)).await?;

        Ok(WatchFeed::new(stream, cancel))
    }

    /// Consume a lookup stream to its end
    ///
    /// The page cursor is the cursor of the last element read. Results read
    /// before a stream failure are returned inside the error.
    async fn read_page<T>(
        &self,
        operation: &'static str,
        mut stream: EngineStream<T>,
        mut convert: impl FnMut(T) -> (PolicyRes, Option<Cursor>),
    ) -> Result<Page, PolicyError> {
        let mut page = Page::default();

        loop {
            let next = match timeout(self.config.request_timeout(), stream.next()).await {
                Ok(next) => next,
                Err(_) => Some(Err(EngineError::Timeout)),
            };

            match next {
                None => return Ok(page),
                Some(Ok(item)) => {
                    let (res, cursor) = convert(item);
                    page.results.push(res);
                    page.next_cursor = cursor.map(|c| c.token).unwrap_or_default();
                }
                Some(Err(source)) => {
                    debug!(%operation, read = page.results.len(), %source, "lookup stream failed");
                    return Err(PolicyError::Incomplete {
                        operation,
                        partial: page,
                        source,
                    });
                }
            }
        }
    }

    /// Follow cursors from the start until the engine hands back an empty one
    async fn collect_all<F, Fut>(
        &self,
        operation: &'static str,
        mut fetch: F,
    ) -> Result<Vec<PolicyRes>, PolicyError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Page, PolicyError>>,
    {
        let mut results = Vec::new();
        let mut cursor = String::new();

        loop {
            match fetch(cursor.clone()).await {
                Ok(page) => {
                    let last = page.is_last();
                    results.extend(page.results);
                    if last {
                        return Ok(results);
                    }
                    cursor = page.next_cursor;
                }
                Err(PolicyError::Incomplete {
                    partial, source, ..
                }) => {
                    let next_cursor = if partial.is_last() {
                        cursor
                    } else {
                        partial.next_cursor.clone()
                    };
                    results.extend(partial.results);
                    return Err(PolicyError::Incomplete {
                        operation,
                        partial: Page {
                            results,
                            next_cursor,
                        },
                        source,
                    });
                }
                Err(PolicyError::Engine { source, .. }) if !results.is_empty() => {
                    return Err(PolicyError::Incomplete {
                        operation,
                        partial: Page {
                            results,
                            next_cursor: cursor,
                        },
                        source,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use futures_util::stream;

    use super::*;
    use crate::policies::engine::{
        CheckPermissionRequest, CheckPermissionResponse, LookupResourcesRequest,
        LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse, WatchResponse,
    };
    use crate::policies::memory::MemoryEngine;

    type Script = HashMap<String, Vec<Result<LookupResourcesResponse, EngineError>>>;

    /// Engine that replays canned lookup pages keyed by the incoming cursor
    struct ScriptedEngine {
        pages: Script,
    }

    fn item(id: &str, cursor: &str) -> Result<LookupResourcesResponse, EngineError> {
        Ok(LookupResourcesResponse {
            resource_object_id: id.to_owned(),
            after_result_cursor: Some(Cursor {
                token: cursor.to_owned(),
            }),
        })
    }

    #[async_trait]
    impl PermissionEngine for ScriptedEngine {
        async fn check_permission(
            &self,
            _request: CheckPermissionRequest,
        ) -> Result<CheckPermissionResponse, EngineError> {
            Err(EngineError::Unavailable("scripted".to_owned()))
        }

        async fn write_relationships(
            &self,
            _updates: Vec<RelationshipUpdate>,
        ) -> Result<ConsistencyToken, EngineError> {
            Err(EngineError::Unavailable("scripted".to_owned()))
        }

        async fn lookup_resources(
            &self,
            request: LookupResourcesRequest,
        ) -> Result<EngineStream<LookupResourcesResponse>, EngineError> {
            let cursor = request.cursor.map(|c| c.token).unwrap_or_default();
            let items = self.pages.get(&cursor).cloned().unwrap_or_default();
            Ok(stream::iter(items).boxed())
        }

        async fn lookup_subjects(
            &self,
            _request: LookupSubjectsRequest,
        ) -> Result<EngineStream<LookupSubjectsResponse>, EngineError> {
            Ok(stream::empty().boxed())
        }

        async fn watch(
            &self,
            _request: WatchRequest,
        ) -> Result<EngineStream<WatchResponse>, EngineError> {
            Ok(stream::pending().boxed())
        }
    }

    fn scripted(pages: Script) -> PolicyAgent {
        PolicyAgent::new(Arc::new(ScriptedEngine { pages }), PolicyConfig::default())
    }

    fn lookup() -> PolicyReq {
        PolicyReq {
            subject_type: "user".to_owned(),
            subject: "u1".to_owned(),
            permission: "view".to_owned(),
            object_type: "thing".to_owned(),
            ..PolicyReq::default()
        }
    }

    fn viewer(object: &str) -> PolicyReq {
        PolicyReq {
            relation: "viewer".to_owned(),
            object: object.to_owned(),
            ..lookup()
        }
    }

    fn objects(results: &[PolicyRes]) -> Vec<&str> {
        results.iter().map(|r| r.object.as_str()).collect()
    }

    #[tokio::test]
    async fn test_short_page_is_not_exhaustion() {
        let agent = scripted(HashMap::from([
            (String::new(), vec![item("a", "c1")]),
            ("c1".to_owned(), vec![item("b", "c2")]),
        ]));

        let all = agent.retrieve_all_objects(&lookup()).await.unwrap();

        assert_eq!(objects(&all), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_page_error_keeps_partial_results() {
        let agent = scripted(HashMap::from([(
            String::new(),
            vec![
                item("a", "c1"),
                Err(EngineError::Stream("reset".to_owned())),
            ],
        )]));

        let err = agent.retrieve_objects(&lookup(), "", 10).await.unwrap_err();

        let PolicyError::Incomplete { partial, .. } = err else {
            panic!("expected incomplete page, got {err:?}");
        };
        assert_eq!(objects(&partial.results), ["a"]);
        assert_eq!(partial.next_cursor, "c1");
    }

    #[tokio::test]
    async fn test_later_page_failure_keeps_accumulated_results() {
        let agent = scripted(HashMap::from([
            (String::new(), vec![item("a", "c1")]),
            (
                "c1".to_owned(),
                vec![Err(EngineError::Stream("reset".to_owned()))],
            ),
        ]));

        let err = agent.retrieve_all_objects(&lookup()).await.unwrap_err();

        let PolicyError::Incomplete {
            operation, partial, ..
        } = err
        else {
            panic!("expected incomplete result, got {err:?}");
        };
        assert_eq!(operation, "retrieve_all_objects");
        assert_eq!(objects(&partial.results), ["a"]);
        assert_eq!(partial.next_cursor, "c1");
    }

    #[tokio::test]
    async fn test_engine_failure_is_backend_error() {
        let agent = scripted(HashMap::new());

        let err = agent
            .check_policy(&PolicyReq {
                object: "t1".to_owned(),
                ..lookup()
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PolicyError::Engine {
                operation: "check_permission",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_batches_are_noops() {
        let agent = scripted(HashMap::new());

        agent.add_policies(&[]).await.unwrap();
        agent.delete_policies(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_then_check() {
        let agent = PolicyAgent::new(Arc::new(MemoryEngine::default()), PolicyConfig::default());
        let check = PolicyReq {
            object: "t1".to_owned(),
            ..lookup()
        };

        assert!(matches!(
            agent.check_policy(&check).await,
            Err(PolicyError::Denied { reason }) if reason == "PERMISSIONSHIP_NO_PERMISSION"
        ));

        let mut schema = HashMap::new();
        schema.insert(
            "thing".to_owned(),
            HashMap::from([("view".to_owned(), vec!["viewer".to_owned(), "owner".to_owned()])]),
        );
        let agent = PolicyAgent::new(Arc::new(MemoryEngine::new(schema)), PolicyConfig::default());

        agent.add_policy(&viewer("t1")).await.unwrap();
        agent.check_policy(&check).await.unwrap();

        agent.delete_policy(&viewer("t1")).await.unwrap();
        assert!(matches!(
            agent.check_policy(&check).await,
            Err(PolicyError::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn test_pages_concatenate_to_full_listing() {
        let mut schema = HashMap::new();
        schema.insert(
            "thing".to_owned(),
            HashMap::from([("view".to_owned(), vec!["viewer".to_owned()])]),
        );
        let agent = PolicyAgent::new(
            Arc::new(MemoryEngine::new(schema)),
            PolicyConfig {
                retrieve_all_page_size: 3,
                ..PolicyConfig::default()
            },
        );

        let writes: Vec<_> = (0..10).map(|i| viewer(&format!("t{i:02}"))).collect();
        agent.add_policies(&writes).await.unwrap();

        let mut paged = Vec::new();
        let mut cursor = String::new();
        loop {
            let page = agent.retrieve_objects(&lookup(), &cursor, 4).await.unwrap();
            paged.extend(page.results);
            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }

        let all = agent.retrieve_all_objects(&lookup()).await.unwrap();

        assert_eq!(paged.len(), 10);
        assert_eq!(paged, all);
        assert_eq!(agent.retrieve_all_objects_count(&lookup()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_subject_pages() {
        let agent = PolicyAgent::new(Arc::new(MemoryEngine::default()), PolicyConfig::default());
        let members: Vec<_> = ["u1", "u2", "u3"]
            .into_iter()
            .map(|subject| PolicyReq {
                subject: subject.to_owned(),
                relation: "member".to_owned(),
                object_type: "group".to_owned(),
                object: "g1".to_owned(),
                ..lookup()
            })
            .collect();
        agent.add_policies(&members).await.unwrap();

        let query = PolicyReq {
            subject: String::new(),
            permission: "member".to_owned(),
            object_type: "group".to_owned(),
            object: "g1".to_owned(),
            ..lookup()
        };

        let first = agent.retrieve_subjects(&query, "", 2).await.unwrap();
        assert_eq!(first.results.len(), 2);
        assert!(!first.next_cursor.is_empty());

        let second = agent
            .retrieve_subjects(&query, &first.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.results[0].subject, "u3");

        assert_eq!(agent.retrieve_all_subjects_count(&query).await.unwrap(), 3);
    }
}
