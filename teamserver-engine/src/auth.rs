//! Per-call authentication.
//!
//! Calls arriving over the in-process transport are trusted and attributed
//! to [`LOCAL_USER`]. Remote calls must carry `authorization: Bearer <token>`;
//! the token's hash is resolved through a cache backed by the credential
//! store. Cached entries live until their user is revoked.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use teamserver_core::error::{Error, Result};
use teamserver_core::protocol::bearer_token;
use teamserver_core::token::hash_token;
use tracing::{debug, warn};

use crate::certs::{CaType, Namespace, RevocationListener};
use crate::store::{CredentialStore, UserRecord};

/// Identity attributed to every in-process call.
pub const LOCAL_USER: &str = "local";

/// A user counts as online if it authenticated within this window.
pub const ONLINE_WINDOW: Duration = Duration::from_secs(120);

/// Where a call came from, as established by the transport that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOrigin {
    Local,
    Remote { peer: String },
}

/// The authenticated caller of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    pub origin: CallOrigin,
}

impl Caller {
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.origin == CallOrigin::Local
    }
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    cache: RwLock<HashMap<String, UserRecord>>,
    // Bumped on every revocation, under the cache write lock.
    epoch: AtomicU64,
    presence: RwLock<HashMap<String, Instant>>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            presence: RwLock::new(HashMap::new()),
        }
    }

    /// Authenticates one call. Every remote failure yields
    /// [`Error::Authentication`], whatever the cause.
    pub fn authenticate(
        &self,
        origin: &CallOrigin,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Caller> {
        match origin {
            CallOrigin::Local => Ok(Caller {
                user: LOCAL_USER.to_string(),
                origin: CallOrigin::Local,
            }),
            CallOrigin::Remote { peer } => {
                let user = self.authenticate_remote(metadata).inspect_err(|_| {
                    debug!(peer = %peer, "Rejected unauthenticated call");
                })?;
                self.record_presence(&user.name);
                Ok(Caller {
                    user: user.name,
                    origin: origin.clone(),
                })
            }
        }
    }

    fn authenticate_remote(&self, metadata: &BTreeMap<String, String>) -> Result<UserRecord> {
        let token = bearer_token(metadata).ok_or(Error::Authentication)?;
        let hash = hash_token(token);

        if let Some(user) = self.cache.read().get(&hash) {
            return Ok(user.clone());
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        let user = match self.store.user_by_token_hash(&hash) {
            Ok(Some(user)) => user,
            Ok(None) => return Err(Error::Authentication),
            Err(e) => {
                warn!(error = %e, "Credential lookup failed");
                return Err(Error::Authentication);
            }
        };

        let mut cache = self.cache.write();
        if self.epoch.load(Ordering::Acquire) == epoch {
            cache.insert(hash, user.clone());
        }
        Ok(user)
    }

    /// Drops every cached token of `name`. In-flight lookups that started
    /// before this call will not repopulate the cache.
    pub fn invalidate_user(&self, name: &str) {
        let mut cache = self.cache.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let before = cache.len();
        cache.retain(|_, user| user.name != name);
        let evicted = before - cache.len();
        drop(cache);

        self.presence.write().remove(name);
        debug!(user = name, evicted, "Invalidated cached credentials");
    }

    fn record_presence(&self, name: &str) {
        self.presence.write().insert(name.to_string(), Instant::now());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        let now: DateTime<Utc> = Utc::now();
        runtime.spawn_blocking(move || {
            if let Err(e) = store.touch_last_seen(&name, now) {
                debug!(user = %name, error = %e, "Failed to record last seen");
            }
        });
    }

    /// Whether `name` authenticated within [`ONLINE_WINDOW`].
    #[must_use]
    pub fn is_online(&self, name: &str) -> bool {
        self.presence
            .read()
            .get(name)
            .is_some_and(|at| at.elapsed() < ONLINE_WINDOW)
    }

    #[cfg(test)]
    fn cached_entries(&self) -> usize {
        self.cache.read().len()
    }
}

impl RevocationListener for Authenticator {
    fn on_revoked(&self, _ca_type: &CaType, namespace: Namespace, subject: &str) {
        if namespace == Namespace::Client {
            self.invalidate_user(subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use teamserver_core::protocol::bearer_metadata;

    use super::*;
    use crate::store::{Database, SqliteCredentialStore};

    /// Wraps the real store and counts token lookups.
    struct CountingStore {
        inner: SqliteCredentialStore,
        lookups: AtomicUsize,
        fail: bool,
        during_lookup: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl CredentialStore for CountingStore {
        fn issue_token(&self, name: &str, token_hash: &str) -> Result<UserRecord> {
            self.inner.issue_token(name, token_hash)
        }
        fn user_by_token_hash(&self, token_hash: &str) -> Result<Option<UserRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Store("disk on fire".into()));
            }
            let found = self.inner.user_by_token_hash(token_hash);
            if let Some(hook) = self.during_lookup.lock().take() {
                hook();
            }
            found
        }
        fn user_by_name(&self, name: &str) -> Result<Option<UserRecord>> {
            self.inner.user_by_name(name)
        }
        fn list_users(&self) -> Result<Vec<UserRecord>> {
            self.inner.list_users()
        }
        fn delete_user(&self, name: &str) -> Result<bool> {
            self.inner.delete_user(name)
        }
        fn touch_last_seen(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.touch_last_seen(name, at)
        }
    }

    fn setup(fail: bool) -> (Arc<CountingStore>, Authenticator) {
        let store = Arc::new(CountingStore {
            inner: SqliteCredentialStore::new(Arc::new(Database::open_in_memory().unwrap())),
            lookups: AtomicUsize::new(0),
            fail,
            during_lookup: parking_lot::Mutex::new(None),
        });
        let auth = Authenticator::new(store.clone());
        (store, auth)
    }

    fn remote() -> CallOrigin {
        CallOrigin::Remote {
            peer: "127.0.0.1:50000".into(),
        }
    }

    #[test]
    fn given_local_origin_when_authenticating_then_local_identity_without_lookup() {
        let (store, auth) = setup(false);
        let caller = auth.authenticate(&CallOrigin::Local, &BTreeMap::new()).unwrap();
        assert_eq!(caller.user, LOCAL_USER);
        assert!(caller.is_local());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn given_valid_token_when_authenticating_twice_then_store_is_queried_once() {
        let (store, auth) = setup(false);
        store.issue_token("alice", &hash_token("tok")).unwrap();

        for _ in 0..2 {
            let caller = auth.authenticate(&remote(), &bearer_metadata("tok")).unwrap();
            assert_eq!(caller.user, "alice");
        }
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        assert!(auth.is_online("alice"));
    }

    #[test]
    fn given_failures_of_every_kind_when_authenticating_then_same_error() {
        let (store, auth) = setup(false);
        store.issue_token("alice", &hash_token("tok")).unwrap();

        let mut malformed = BTreeMap::new();
        malformed.insert("authorization".to_string(), "Token tok".to_string());

        for metadata in [BTreeMap::new(), malformed, bearer_metadata("tok!")] {
            let err = auth.authenticate(&remote(), &metadata).unwrap_err();
            assert_eq!(err.to_string(), "authentication failed");
        }

        let (_, failing) = setup(true);
        let err = failing.authenticate(&remote(), &bearer_metadata("tok")).unwrap_err();
        assert!(matches!(err, Error::Authentication));
    }

    #[test]
    fn given_cached_token_when_user_deleted_and_invalidated_then_next_call_fails() {
        let (store, auth) = setup(false);
        store.issue_token("alice", &hash_token("tok")).unwrap();
        auth.authenticate(&remote(), &bearer_metadata("tok")).unwrap();
        assert_eq!(auth.cached_entries(), 1);

        store.delete_user("alice").unwrap();
        auth.invalidate_user("alice");

        assert_eq!(auth.cached_entries(), 0);
        assert!(auth.authenticate(&remote(), &bearer_metadata("tok")).is_err());
        assert!(!auth.is_online("alice"));
    }

    #[test]
    fn given_client_revocation_when_notified_then_only_that_user_is_evicted() {
        let (store, auth) = setup(false);
        store.issue_token("alice", &hash_token("a")).unwrap();
        store.issue_token("bob", &hash_token("b")).unwrap();
        auth.authenticate(&remote(), &bearer_metadata("a")).unwrap();
        auth.authenticate(&remote(), &bearer_metadata("b")).unwrap();

        auth.on_revoked(&CaType::user(), Namespace::Client, "alice");
        assert_eq!(auth.cached_entries(), 1);

        auth.on_revoked(&CaType::user(), Namespace::Server, "bob");
        assert_eq!(auth.cached_entries(), 1);
    }

    #[test]
    fn given_revocation_during_lookup_when_lookup_completes_then_entry_is_not_cached() {
        let (store, auth) = setup(false);
        let auth = Arc::new(auth);
        store.issue_token("alice", &hash_token("tok")).unwrap();

        let revoker = Arc::clone(&auth);
        *store.during_lookup.lock() = Some(Box::new(move || revoker.invalidate_user("alice")));

        // The lookup itself raced ahead of the revocation, so this call passes.
        let caller = auth.authenticate(&remote(), &bearer_metadata("tok")).unwrap();
        assert_eq!(caller.user, "alice");
        assert_eq!(auth.cached_entries(), 0);
    }

    #[tokio::test]
    async fn given_successful_remote_call_when_waiting_then_last_seen_is_recorded() {
        let (store, auth) = setup(false);
        store.issue_token("alice", &hash_token("tok")).unwrap();
        auth.authenticate(&remote(), &bearer_metadata("tok")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if store.user_by_name("alice").unwrap().unwrap().last_seen.is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "last_seen was never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
