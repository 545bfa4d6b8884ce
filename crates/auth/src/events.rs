//! Best-effort audit events.
//!
//! [`AuditedService`] wraps any [`Service`] and, after a mutating call
//! succeeds, hands an [`Event`] to a bounded queue drained by an
//! [`EventSink`] task. A full or closed queue drops the event with a warning;
//! it never fails the call that produced it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::token::Issued;
use crate::policies::{Page, PolicyReq, PolicyRes};
use crate::service::{PageQuery, Service};
use crate::storage::models::{Key, KeyType};
use crate::AuthError;

const STREAM_ID: &str = "flux.auth";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    KeyIssued {
        key_id: String,
        key_type: KeyType,
        subject: String,
        issuer_id: String,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    },
    KeyIdentified {
        subject: String,
    },
    KeyRevoked {
        key_id: String,
    },
    PolicyAdded(PolicyReq),
    PolicyDeleted(PolicyReq),
    GroupAssigned {
        group_id: String,
        member_id: String,
        relation: String,
    },
}

impl Event {
    fn issued(key: &Key) -> Self {
        Self::KeyIssued {
            key_id: key.id.clone(),
            key_type: key.key_type,
            subject: key.subject.clone(),
            issuer_id: key.issuer_id.clone(),
            issued_at: key.issued_at,
            expires_at: key.expires_at,
        }
    }

    pub const fn operation(&self) -> &'static str {
        match self {
            Self::KeyIssued { .. } => "key.issue",
            Self::KeyIdentified { .. } => "key.identify",
            Self::KeyRevoked { .. } => "key.revoke",
            Self::PolicyAdded(_) => "policy.add",
            Self::PolicyDeleted(_) => "policy.delete",
            Self::GroupAssigned { .. } => "group.assign",
        }
    }

    /// Flatten the event into a string-keyed map with an `operation` field
    pub fn encode(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |k: &str, v: String| {
            if !v.is_empty() {
                map.insert(k.to_owned(), Value::String(v));
            }
        };

        put("operation", self.operation().to_owned());

        match self {
            Self::KeyIssued {
                key_id,
                key_type,
                subject,
                issuer_id,
                issued_at,
                expires_at,
            } => {
                put("id", key_id.clone());
                put("type", key_type.to_string());
                put("subject", subject.clone());
                put("issuer_id", issuer_id.clone());
                put("issued_at", issued_at.to_rfc3339());
                if let Some(expires_at) = expires_at {
                    put("expires_at", expires_at.to_rfc3339());
                }
            }
            Self::KeyIdentified { subject } => put("subject", subject.clone()),
            Self::KeyRevoked { key_id } => put("id", key_id.clone()),
            Self::PolicyAdded(req) | Self::PolicyDeleted(req) => {
                put("subject_type", req.subject_type.clone());
                put("subject", req.subject.clone());
                put("subject_relation", req.subject_relation.clone());
                put("relation", req.relation.clone());
                put("object_type", req.object_type.clone());
                put("object", req.object.clone());
            }
            Self::GroupAssigned {
                group_id,
                member_id,
                relation,
            } => {
                put("group_id", group_id.clone());
                put("member_id", member_id.clone());
                put("relation", relation.clone());
            }
        }

        map
    }
}

/// Destination for audit events
#[async_trait]
pub trait EventSink: Send + 'static {
    async fn publish(&mut self, event: Event) -> eyre::Result<()>;
}

/// Sink that writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&mut self, event: Event) -> eyre::Result<()> {
        let payload = serde_json::to_string(&event.encode())?;
        info!(target: "flux_auth::audit", stream = STREAM_ID, %payload, "audit event");
        Ok(())
    }
}

/// Handle used to enqueue events for the sink task
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Event>,
}

impl EventPublisher {
    /// Start the sink task; it ends once every publisher is dropped
    pub fn spawn<S: EventSink>(mut sink: S, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let operation = event.operation();
                if let Err(err) = sink.publish(event).await {
                    warn!(%operation, %err, "failed to publish audit event");
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Queue an event without waiting
    pub fn publish(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(operation = event.operation(), "audit queue full, dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(operation = event.operation(), "audit sink stopped, dropping event");
            }
        }
    }
}

/// [`Service`] decorator that publishes an event after each successful mutation
#[derive(Debug, Clone)]
pub struct AuditedService<S> {
    inner: S,
    events: EventPublisher,
}

impl<S: Service> AuditedService<S> {
    pub fn new(inner: S, events: EventPublisher) -> Self {
        Self { inner, events }
    }

    fn issued(&self, issued: &Issued) {
        self.events.publish(Event::issued(&issued.key));
        if let Some(refresh) = &issued.refresh {
            self.events.publish(Event::issued(refresh));
        }
    }
}

#[async_trait]
impl<S: Service> Service for AuditedService<S> {
    async fn issue(&self, token: &str, key: Key) -> Result<Issued, AuthError> {
        let issued = self.inner.issue(token, key).await?;
        self.issued(&issued);
        Ok(issued)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Issued, AuthError> {
        let issued = self.inner.refresh(refresh_token).await?;
        self.issued(&issued);
        Ok(issued)
    }

    async fn identify(&self, token: &str, expected: Option<KeyType>) -> Result<String, AuthError> {
        let subject = self.inner.identify(token, expected).await?;
        self.events.publish(Event::KeyIdentified {
            subject: subject.clone(),
        });
        Ok(subject)
    }

    async fn revoke(&self, token: &str, key_id: &str) -> Result<bool, AuthError> {
        let revoked = self.inner.revoke(token, key_id).await?;
        if revoked {
            self.events.publish(Event::KeyRevoked {
                key_id: key_id.to_owned(),
            });
        }
        Ok(revoked)
    }

    async fn retrieve_key(&self, token: &str, key_id: &str) -> Result<Key, AuthError> {
        self.inner.retrieve_key(token, key_id).await
    }

    async fn authorize(&self, token: &str, req: PolicyReq) -> Result<bool, AuthError> {
        self.inner.authorize(token, req).await
    }

    async fn add_policy(&self, req: PolicyReq) -> Result<(), AuthError> {
        self.inner.add_policy(req.clone()).await?;
        self.events.publish(Event::PolicyAdded(req));
        Ok(())
    }

    async fn add_policies(&self, reqs: Vec<PolicyReq>) -> Result<(), AuthError> {
        self.inner.add_policies(reqs.clone()).await?;
        for req in reqs {
            self.events.publish(Event::PolicyAdded(req));
        }
        Ok(())
    }

    async fn delete_policy(&self, req: PolicyReq) -> Result<(), AuthError> {
        self.inner.delete_policy(req.clone()).await?;
        self.events.publish(Event::PolicyDeleted(req));
        Ok(())
    }

    async fn delete_policies(&self, reqs: Vec<PolicyReq>) -> Result<(), AuthError> {
        self.inner.delete_policies(reqs.clone()).await?;
        for req in reqs {
            self.events.publish(Event::PolicyDeleted(req));
        }
        Ok(())
    }

    async fn list_objects(&self, req: PolicyReq, cursor: &str, limit: u32) -> Result<Page, AuthError> {
        self.inner.list_objects(req, cursor, limit).await
    }

    async fn list_all_objects(&self, req: PolicyReq) -> Result<Vec<PolicyRes>, AuthError> {
        self.inner.list_all_objects(req).await
    }

    async fn count_objects(&self, req: PolicyReq) -> Result<usize, AuthError> {
        self.inner.count_objects(req).await
    }

    async fn list_subjects(&self, req: PolicyReq, cursor: &str, limit: u32) -> Result<Page, AuthError> {
        self.inner.list_subjects(req, cursor, limit).await
    }

    async fn list_all_subjects(&self, req: PolicyReq) -> Result<Vec<PolicyRes>, AuthError> {
        self.inner.list_all_subjects(req).await
    }

    async fn count_subjects(&self, req: PolicyReq) -> Result<usize, AuthError> {
        self.inner.count_subjects(req).await
    }

    async fn assign(
        &self,
        token: &str,
        group_id: &str,
        member_id: &str,
        relation: &str,
    ) -> Result<(), AuthError> {
        self.inner.assign(token, group_id, member_id, relation).await?;
        self.events.publish(Event::GroupAssigned {
            group_id: group_id.to_owned(),
            member_id: member_id.to_owned(),
            relation: relation.to_owned(),
        });
        Ok(())
    }

    async fn members(&self, token: &str, group_id: &str, query: PageQuery) -> Result<Page, AuthError> {
        self.inner.members(token, group_id, query).await
    }
}
