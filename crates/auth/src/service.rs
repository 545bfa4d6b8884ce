use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::token::{Issued, TokenManager};
use crate::policies::{Page, PolicyAgent, PolicyError, PolicyReq, PolicyRes};
use crate::storage::models::{Key, KeyType};
use crate::AuthError;

pub const USER_TYPE: &str = "user";
pub const GROUP_TYPE: &str = "group";
pub const ADMIN_PERMISSION: &str = "admin";
pub const VIEW_PERMISSION: &str = "view";
pub const MEMBERSHIP_PERMISSION: &str = "membership";
pub const MEMBER_RELATION: &str = "member";

/// Paging parameters for [`Service::members`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageQuery {
    /// Subject type of the members to list, e.g. `user` or `thing`
    pub member_type: String,
    #[serde(default)]
    pub cursor: String,
    /// 0 lets the engine pick the page size
    #[serde(default)]
    pub limit: u32,
}

/// Authorization facade used by the rest of the platform
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Issue a key; see [`TokenManager::issue`]
    async fn issue(&self, token: &str, key: Key) -> Result<Issued, AuthError>;

    /// Rotate a refresh key into a new login/refresh pair
    async fn refresh(&self, refresh_token: &str) -> Result<Issued, AuthError>;

    /// Resolve the subject a token identifies
    async fn identify(&self, token: &str, expected: Option<KeyType>) -> Result<String, AuthError>;

    /// Revoke a key the caller issued; `false` when nothing was revoked
    async fn revoke(&self, token: &str, key_id: &str) -> Result<bool, AuthError>;

    async fn retrieve_key(&self, token: &str, key_id: &str) -> Result<Key, AuthError>;

    /// Check whether the token's subject satisfies `req`
    ///
    /// A denial is `Ok(false)`; only identification, validation and backend
    /// failures are errors.
    async fn authorize(&self, token: &str, req: PolicyReq) -> Result<bool, AuthError>;

    async fn add_policy(&self, req: PolicyReq) -> Result<(), AuthError>;

    async fn add_policies(&self, reqs: Vec<PolicyReq>) -> Result<(), AuthError>;

    async fn delete_policy(&self, req: PolicyReq) -> Result<(), AuthError>;

    async fn delete_policies(&self, reqs: Vec<PolicyReq>) -> Result<(), AuthError>;

    async fn list_objects(&self, req: PolicyReq, cursor: &str, limit: u32) -> Result<Page, AuthError>;

    async fn list_all_objects(&self, req: PolicyReq) -> Result<Vec<PolicyRes>, AuthError>;

    async fn count_objects(&self, req: PolicyReq) -> Result<usize, AuthError>;

    async fn list_subjects(&self, req: PolicyReq, cursor: &str, limit: u32) -> Result<Page, AuthError>;

    async fn list_all_subjects(&self, req: PolicyReq) -> Result<Vec<PolicyRes>, AuthError>;

    async fn count_subjects(&self, req: PolicyReq) -> Result<usize, AuthError>;

    /// Add `member_id` to a group the caller administers
    async fn assign(
        &self,
        token: &str,
        group_id: &str,
        member_id: &str,
        relation: &str,
    ) -> Result<(), AuthError>;

    /// List one page of a group's members, visible to anyone who can view the group
    async fn members(&self, token: &str, group_id: &str, query: PageQuery) -> Result<Page, AuthError>;
}

/// Default [`Service`] built from the token manager and the policy agent
#[derive(Debug, Clone)]
pub struct AuthService {
    tokens: TokenManager,
    policies: PolicyAgent,
}

impl AuthService {
    pub fn new(tokens: TokenManager, policies: PolicyAgent) -> Self {
        Self { tokens, policies }
    }

    async fn require(&self, token: &str, req: PolicyReq) -> Result<(), AuthError> {
        let action = format!("{} on {}:{}", req.permission, req.object_type, req.object);
        if self.authorize(token, req).await? {
            return Ok(());
        }
        Err(AuthError::AuthorizationFailed(action))
    }
}

fn group(group_id: &str, permission: &str) -> PolicyReq {
    PolicyReq {
        permission: permission.to_owned(),
        object_type: GROUP_TYPE.to_owned(),
        object: group_id.to_owned(),
        ..PolicyReq::default()
    }
}

#[async_trait]
impl Service for AuthService {
    async fn issue(&self, token: &str, key: Key) -> Result<Issued, AuthError> {
        self.tokens.issue(token, key).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Issued, AuthError> {
        self.tokens.refresh(refresh_token).await
    }

    async fn identify(&self, token: &str, expected: Option<KeyType>) -> Result<String, AuthError> {
        Ok(self.tokens.identify(token, expected).await?.subject)
    }

    async fn revoke(&self, token: &str, key_id: &str) -> Result<bool, AuthError> {
        self.tokens.revoke(token, key_id).await
    }

    async fn retrieve_key(&self, token: &str, key_id: &str) -> Result<Key, AuthError> {
        self.tokens.retrieve_key(token, key_id).await
    }

    async fn authorize(&self, token: &str, mut req: PolicyReq) -> Result<bool, AuthError> {
        let key = self.tokens.identify(token, None).await?;
        if !key.key_type.grants_access() {
            return Err(AuthError::UnacceptedKeyType(key.key_type));
        }

        req.subject = key.subject;
        if req.subject_type.is_empty() {
            req.subject_type = USER_TYPE.to_owned();
        }

        match self.policies.check_policy(&req).await {
            Ok(()) => Ok(true),
            Err(PolicyError::Denied { reason }) => {
                debug!(subject = %req.subject, permission = %req.permission, object = %req.object, %reason, "authorization denied");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn add_policy(&self, req: PolicyReq) -> Result<(), AuthError> {
        Ok(self.policies.add_policy(&req).await?)
    }

    async fn add_policies(&self, reqs: Vec<PolicyReq>) -> Result<(), AuthError> {
        Ok(self.policies.add_policies(&reqs).await?)
    }

    async fn delete_policy(&self, req: PolicyReq) -> Result<(), AuthError> {
        Ok(self.policies.delete_policy(&req).await?)
    }

    async fn delete_policies(&self, reqs: Vec<PolicyReq>) -> Result<(), AuthError> {
        Ok(self.policies.delete_policies(&reqs).await?)
    }

    async fn list_objects(&self, req: PolicyReq, cursor: &str, limit: u32) -> Result<Page, AuthError> {
        Ok(self.policies.retrieve_objects(&req, cursor, limit).await?)
    }

    async fn list_all_objects(&self, req: PolicyReq) -> Result<Vec<PolicyRes>, AuthError> {
        Ok(self.policies.retrieve_all_objects(&req).await?)
    }

    async fn count_objects(&self, req: PolicyReq) -> Result<usize, AuthError> {
        Ok(self.policies.retrieve_all_objects_count(&req).await?)
    }

    async fn list_subjects(&self, req: PolicyReq, cursor: &str, limit: u32) -> Result<Page, AuthError> {
        Ok(self.policies.retrieve_subjects(&req, cursor, limit).await?)
    }

    async fn list_all_subjects(&self, req: PolicyReq) -> Result<Vec<PolicyRes>, AuthError> {
        Ok(self.policies.retrieve_all_subjects(&req).await?)
    }

    async fn count_subjects(&self, req: PolicyReq) -> Result<usize, AuthError> {
        Ok(self.policies.retrieve_all_subjects_count(&req).await?)
    }

    async fn assign(
        &self,
        token: &str,
        group_id: &str,
        member_id: &str,
        relation: &str,
    ) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::BearerToken);
        }
        if group_id.is_empty() || member_id.is_empty() {
            return Err(AuthError::MissingId);
        }

        self.require(token, group(group_id, ADMIN_PERMISSION)).await?;

        let relation = if relation.is_empty() {
            MEMBER_RELATION
        } else {
            relation
        };

        self.policies
            .add_policy(&PolicyReq {
                subject_type: USER_TYPE.to_owned(),
                subject: member_id.to_owned(),
                relation: relation.to_owned(),
                object_type: GROUP_TYPE.to_owned(),
                object: group_id.to_owned(),
                ..PolicyReq::default()
            })
            .await?;

        info!(%group_id, %member_id, %relation, "member assigned");
        Ok(())
    }

    async fn members(&self, token: &str, group_id: &str, query: PageQuery) -> Result<Page, AuthError> {
        if token.is_empty() {
            return Err(AuthError::BearerToken);
        }
        if group_id.is_empty() {
            return Err(AuthError::MissingId);
        }
        if query.member_type.is_empty() {
            return Err(AuthError::MissingMemberType);
        }

        self.require(token, group(group_id, VIEW_PERMISSION)).await?;

        let req = PolicyReq {
            subject_type: query.member_type,
            ..group(group_id, MEMBERSHIP_PERMISSION)
        };

        Ok(self
            .policies
            .retrieve_subjects(&req, &query.cursor, query.limit)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{EngineConfig, KeysConfig, PolicyConfig};
    use crate::policies::memory::MemoryEngine;
    use crate::providers::UserPasswordProvider;
    use crate::secrets::SigningKey;
    use crate::storage::{MemoryStorage, Storage, StorageKeyStore};
    use crate::ErrorKind;

    async fn service() -> AuthService {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let identity = UserPasswordProvider::new(Arc::clone(&storage));
        for subject in ["admin", "alice", "bob"] {
            identity.register(subject, "pw").await.unwrap();
        }

        let engine = MemoryEngine::from_config(&EngineConfig::default());
        let policies = PolicyAgent::new(Arc::new(engine), PolicyConfig::default());
        let tokens = TokenManager::new(
            &KeysConfig::default(),
            SigningKey::generate(),
            Arc::new(StorageKeyStore::new(storage)),
            Arc::new(identity),
            policies.clone(),
        )
        .unwrap();

        AuthService::new(tokens, policies)
    }

    async fn login(svc: &AuthService, subject: &str) -> String {
        svc.issue("", Key::new(KeyType::Login, subject).with_secret("pw"))
            .await
            .unwrap()
            .key
            .secret
    }

    async fn make_admin(svc: &AuthService, subject: &str, group_id: &str) {
        svc.add_policy(PolicyReq {
            subject_type: USER_TYPE.to_owned(),
            subject: subject.to_owned(),
            relation: ADMIN_PERMISSION.to_owned(),
            object_type: GROUP_TYPE.to_owned(),
            object: group_id.to_owned(),
            ..PolicyReq::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_authorize_denial_is_not_an_error() {
        let svc = service().await;
        let token = login(&svc, "alice").await;

        let granted = svc
            .authorize(&token, group("g1", VIEW_PERMISSION))
            .await
            .unwrap();

        assert!(!granted);
    }

    #[tokio::test]
    async fn test_authorize_fails_fast_on_bad_token() {
        let svc = service().await;

        let err = svc
            .authorize("bogus", group("g1", VIEW_PERMISSION))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_authorize_rejects_recovery_keys() {
        let svc = service().await;
        let token = login(&svc, "alice").await;
        let recovery = svc
            .issue(&token, Key::new(KeyType::Recovery, ""))
            .await
            .unwrap()
            .key
            .secret;

        let err = svc
            .authorize(&recovery, group("g1", VIEW_PERMISSION))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuthError::UnacceptedKeyType(KeyType::Recovery)
        ));
    }

    #[tokio::test]
    async fn test_assign_and_list_members() {
        let svc = service().await;
        let admin = login(&svc, "admin").await;
        let alice = login(&svc, "alice").await;
        make_admin(&svc, "admin", "g1").await;

        let err = svc.assign(&alice, "g1", "bob", "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        svc.assign(&admin, "g1", "alice", "").await.unwrap();
        svc.assign(&admin, "g1", "bob", MEMBER_RELATION).await.unwrap();

        assert!(svc
            .authorize(&alice, group("g1", VIEW_PERMISSION))
            .await
            .unwrap());

        let query = PageQuery {
            member_type: USER_TYPE.to_owned(),
            ..PageQuery::default()
        };
        let page = svc.members(&alice, "g1", query).await.unwrap();
        let members: Vec<_> = page.results.iter().map(|r| r.subject.as_str()).collect();

        assert_eq!(members, ["admin", "alice", "bob"]);
    }

    #[tokio::test]
    async fn test_membership_request_validation() {
        let svc = service().await;
        let token = login(&svc, "alice").await;

        assert!(matches!(
            svc.assign("", "g1", "bob", "").await,
            Err(AuthError::BearerToken)
        ));
        assert!(matches!(
            svc.assign(&token, "", "bob", "").await,
            Err(AuthError::MissingId)
        ));
        assert!(matches!(
            svc.members(&token, "g1", PageQuery::default()).await,
            Err(AuthError::MissingMemberType)
        ));
    }

    #[tokio::test]
    async fn test_policy_passthrough_validates_shape() {
        let svc = service().await;

        let err = svc
            .add_policy(PolicyReq {
                subject_type: USER_TYPE.to_owned(),
                subject: "alice".to_owned(),
                object_type: GROUP_TYPE.to_owned(),
                object: "g1".to_owned(),
                ..PolicyReq::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Policy(PolicyError::MissingRelation)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
