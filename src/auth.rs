//! Authorization resolution.
//!
//! Every workflow starts by resolving which merchant context it executes
//! under. The resolved [`Auth`] is carried in the per-operation
//! [`crate::dispatch::RequestContext`], never cached on the shared client:
//! concurrent operations may resolve different merchants, and one shared
//! mutable slot would cross-talk between them.

use std::sync::Arc;

use crate::{
    error::{GatewayError, Result},
    model::{Auth, AuthStatus, CHANNEL},
    store::{AuthStore, UserStore},
};

/// Resolves the merchant/token context for one logical operation.
#[derive(Clone)]
pub struct AuthRegistry {
    auths: Arc<dyn AuthStore>,
    users: Arc<dyn UserStore>,
    service_merchant_id: String,
}

impl AuthRegistry {
    /// Creates a registry over the given stores.
    ///
    /// `service_merchant_id` is the process's own top-level merchant; an
    /// empty user ID resolves to it in single-merchant mode.
    pub fn new(
        auths: Arc<dyn AuthStore>,
        users: Arc<dyn UserStore>,
        service_merchant_id: &str,
    ) -> Self {
        Self {
            auths,
            users,
            service_merchant_id: service_merchant_id.to_owned(),
        }
    }

    /// Resolves the authorization for a call.
    ///
    /// An empty `user_id` synthesizes the single-merchant Auth (always
    /// verified, settling to the top-level merchant). Otherwise the user
    /// binding decides which merchant's persisted grant applies; when no
    /// binding exists the passed `merchant_id` is used directly.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authorization`] when no persisted grant
    /// exists for the resolved merchant.
    pub fn resolve(&self, user_id: &str, merchant_id: &str) -> Result<Auth> {
        if user_id.is_empty() {
            return Ok(Auth::single_merchant(&self.service_merchant_id));
        }
        let merchant = match self.users.get_user(user_id, CHANNEL)? {
            Some(user) if !user.merchant_id.is_empty() => user.merchant_id,
            _ => merchant_id.to_owned(),
        };
        self.auths
            .get_auth(&merchant, CHANNEL)?
            .ok_or(GatewayError::Authorization)
    }

    /// Resolves and additionally requires the grant to be verified.
    ///
    /// Workflows call this before assembling any remote request: a
    /// non-Success grant is an authorization error and the remote call must
    /// not be attempted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Authorization`] when the grant is missing or
    /// not in `Success` status.
    pub fn resolve_verified(&self, user_id: &str, merchant_id: &str) -> Result<Auth> {
        let auth = self.resolve(user_id, merchant_id)?;
        if auth.status != AuthStatus::Success {
            return Err(GatewayError::Authorization);
        }
        Ok(auth)
    }

    /// Delegation token to put on the wire for this auth, if any.
    ///
    /// Delegation applies only when the resolved merchant differs from the
    /// top-level merchant; carrying the token in single-merchant mode is a
    /// protocol error.
    #[must_use]
    pub fn delegation_token<'a>(&self, auth: &'a Auth) -> Option<&'a str> {
        if auth.merchant_id != self.service_merchant_id && !auth.token.is_empty() {
            Some(&auth.token)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("service_merchant_id", &self.service_merchant_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{User, new_record_id},
        store::MemoryLedger,
    };

    const SERVICE_MCH: &str = "2088000000000000";
    const SUB_MCH: &str = "2088999999999999";

    fn registry_with(store: Arc<MemoryLedger>) -> AuthRegistry {
        AuthRegistry::new(store.clone(), store, SERVICE_MCH)
    }

    fn seed_auth(store: &MemoryLedger, merchant_id: &str, status: AuthStatus) {
        store
            .insert_auth(&Auth {
                id: new_record_id(),
                merchant_id: merchant_id.to_owned(),
                account: String::new(),
                token: "tok-1".to_owned(),
                status,
                channel: CHANNEL.to_owned(),
            })
            .unwrap();
    }

    #[test]
    fn test_empty_user_id_synthesizes_single_merchant() {
        let store = Arc::new(MemoryLedger::new());
        let registry = registry_with(store);
        let auth = registry.resolve_verified("", "").unwrap();
        assert_eq!(auth.merchant_id, SERVICE_MCH);
        assert_eq!(auth.status, AuthStatus::Success);
        assert!(registry.delegation_token(&auth).is_none());
    }

    #[test]
    fn test_bound_user_resolves_persisted_auth() {
        let store = Arc::new(MemoryLedger::new());
        seed_auth(&store, SUB_MCH, AuthStatus::Success);
        store
            .insert_user(&User {
                id: new_record_id(),
                user_id: "u1".to_owned(),
                merchant_id: SUB_MCH.to_owned(),
                status: AuthStatus::Success,
                channel: CHANNEL.to_owned(),
            })
            .unwrap();
        let registry = registry_with(store);
        let auth = registry.resolve_verified("u1", "").unwrap();
        assert_eq!(auth.merchant_id, SUB_MCH);
        assert_eq!(registry.delegation_token(&auth), Some("tok-1"));
    }

    #[test]
    fn test_unverified_auth_is_rejected() {
        let store = Arc::new(MemoryLedger::new());
        seed_auth(&store, SUB_MCH, AuthStatus::WaitVerify);
        let registry = registry_with(store);
        let raw = registry.resolve("u1", SUB_MCH).unwrap();
        assert_eq!(raw.status, AuthStatus::WaitVerify);
        assert!(matches!(
            registry.resolve_verified("u1", SUB_MCH),
            Err(GatewayError::Authorization)
        ));
    }

    #[test]
    fn test_missing_auth_is_authorization_error() {
        let store = Arc::new(MemoryLedger::new());
        let registry = registry_with(store);
        assert!(matches!(
            registry.resolve("u1", SUB_MCH),
            Err(GatewayError::Authorization)
        ));
    }

    #[test]
    fn test_no_delegation_token_for_service_merchant() {
        let store = Arc::new(MemoryLedger::new());
        seed_auth(&store, SERVICE_MCH, AuthStatus::Success);
        let registry = registry_with(store);
        let auth = registry.resolve_verified("u1", SERVICE_MCH).unwrap();
        assert!(registry.delegation_token(&auth).is_none());
    }
}
