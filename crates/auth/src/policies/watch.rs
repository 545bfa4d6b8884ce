use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EngineStream, Operation, WatchResponse};
use super::{PolicyAgent, PolicyError, PolicyReq};

/// A single relationship change observed on the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub policy: PolicyReq,
    /// Token to resume the feed from once this revision is handled
    pub changes_through: String,
    /// Set on the last change of a revision. Resuming from `changes_through`
    /// is only safe after such an event.
    pub revision_complete: bool,
}

/// Pull-based change feed
///
/// Not restartable: once cancelled, closed by the engine or failed, the
/// underlying stream is dropped and [`WatchFeed::next`] keeps returning
/// `Ok(None)`. Reconnect with [`PolicyAgent::watch`] and the last complete
/// `changes_through` token; changes at the boundary may be seen twice.
pub struct WatchFeed {
    stream: Option<EngineStream<WatchResponse>>,
    pending: VecDeque<ChangeEvent>,
    cancel: CancellationToken,
}

impl fmt::Debug for WatchFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchFeed")
            .field("open", &self.stream.is_some())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl WatchFeed {
    pub(crate) fn new(stream: EngineStream<WatchResponse>, cancel: CancellationToken) -> Self {
        Self {
            stream: Some(stream),
            pending: VecDeque::new(),
            cancel,
        }
    }

    fn close(&mut self) {
        self.stream = None;
        self.pending.clear();
    }

    /// Wait for the next change
    ///
    /// Returns `Ok(None)` when the feed was cancelled or the engine ended it.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>, PolicyError> {
        loop {
            if self.cancel.is_cancelled() {
                self.close();
                return Ok(None);
            }

            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };

            match next {
                None | Some(None) => {
                    self.close();
                    return Ok(None);
                }
                Some(Some(Ok(response))) => self.buffer(response),
                Some(Some(Err(source))) => {
                    self.close();
                    return Err(PolicyError::engine("watch", source));
                }
            }
        }
    }

    fn buffer(&mut self, response: WatchResponse) {
        let count = response.updates.len();
        let token = response.changes_through.token;

        for (i, update) in response.updates.into_iter().enumerate() {
            self.pending.push_back(ChangeEvent {
                operation: update.operation,
                policy: PolicyReq::from(update.relationship),
                changes_through: token.clone(),
                revision_complete: i + 1 == count,
            });
        }
    }
}

/// Consumer of change events run by [`spawn_watcher`]
#[async_trait]
pub trait ChangeHandler: Send + 'static {
    async fn handle(&mut self, event: ChangeEvent);
}

/// How a watcher task ended
#[derive(Debug)]
pub struct WatchOutcome {
    /// Last fully handled `changes_through` token, or the starting token
    pub last_token: String,
    /// Set when the feed failed instead of being cancelled or closed
    pub error: Option<PolicyError>,
}

/// Open a change feed and consume it on its own task until `cancel` fires
/// or the feed fails
///
/// The feed is subscribed before this returns, so changes written afterwards
/// reach the handler.
pub async fn spawn_watcher<H: ChangeHandler>(
    agent: &PolicyAgent,
    from: String,
    cancel: CancellationToken,
    mut handler: H,
) -> Result<JoinHandle<WatchOutcome>, PolicyError> {
    let mut feed = agent.watch(&from, cancel).await?;
    info!(%from, "watching policy changes");

    Ok(tokio::spawn(async move {
        let mut last_token = from;

        loop {
            match feed.next().await {
                Ok(Some(event)) => {
                    let checkpoint = event
                        .revision_complete
                        .then(|| event.changes_through.clone());

                    handler.handle(event).await;

                    if let Some(token) = checkpoint {
                        last_token = token;
                    }
                }
                Ok(None) => {
                    debug!(%last_token, "policy change feed stopped");
                    return WatchOutcome {
                        last_token,
                        error: None,
                    };
                }
                Err(error) => {
                    warn!(%error, %last_token, "policy change feed failed");
                    return WatchOutcome {
                        last_token,
                        error: Some(error),
                    };
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::PolicyConfig;
    use crate::policies::memory::MemoryEngine;

    struct Forward(mpsc::UnboundedSender<ChangeEvent>);

    #[async_trait]
    impl ChangeHandler for Forward {
        async fn handle(&mut self, event: ChangeEvent) {
            let _ = self.0.send(event);
        }
    }

    fn viewer(object: &str) -> PolicyReq {
        PolicyReq {
            subject_type: "user".to_owned(),
            subject: "u1".to_owned(),
            relation: "viewer".to_owned(),
            object_type: "thing".to_owned(),
            object: object.to_owned(),
            ..PolicyReq::default()
        }
    }

    fn agent() -> PolicyAgent {
        PolicyAgent::new(Arc::new(MemoryEngine::default()), PolicyConfig::default())
    }

    #[tokio::test]
    async fn test_feed_stops_on_cancel() {
        let agent = agent();
        let cancel = CancellationToken::new();
        let mut feed = agent.watch("", cancel.clone()).await.unwrap();

        agent.add_policy(&viewer("t1")).await.unwrap();
        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.operation, Operation::Create);
        assert_eq!(event.policy.object, "t1");
        assert!(event.revision_complete);

        cancel.cancel();
        agent.add_policy(&viewer("t2")).await.unwrap();

        assert!(feed.next().await.unwrap().is_none());
        assert!(feed.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_shares_one_checkpoint() {
        let agent = agent();
        let mut feed = agent.watch("", CancellationToken::new()).await.unwrap();

        agent
            .add_policies(&[viewer("t1"), viewer("t2")])
            .await
            .unwrap();

        let first = feed.next().await.unwrap().unwrap();
        let second = feed.next().await.unwrap().unwrap();

        assert_eq!(first.changes_through, second.changes_through);
        assert!(!first.revision_complete);
        assert!(second.revision_complete);
    }

    #[tokio::test]
    async fn test_watcher_reports_last_token() {
        let agent = agent();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_watcher(&agent, String::new(), cancel.clone(), Forward(tx))
            .await
            .unwrap();

        agent.add_policy(&viewer("t1")).await.unwrap();
        agent.delete_policy(&viewer("t1")).await.unwrap();

        let created = rx.recv().await.unwrap();
        let deleted = rx.recv().await.unwrap();
        assert_eq!(created.operation, Operation::Create);
        assert_eq!(deleted.operation, Operation::Delete);

        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert!(outcome.error.is_none());
        assert_eq!(outcome.last_token, deleted.changes_through);
    }

    #[tokio::test]
    async fn test_watcher_rejects_malformed_token() {
        let agent = agent();

        let result = spawn_watcher(
            &agent,
            "not-a-revision".to_owned(),
            CancellationToken::new(),
            Forward(mpsc::unbounded_channel().0),
        )
        .await;

        assert!(result.is_err());
    }
}
