//! Session and user identity
//!
//! ## Session id
//!
//! A UUID v4 kept in session-scoped storage next to the epoch-millisecond time of
//! the last activity. Any activity after a gap longer than the inactivity threshold
//! mints a new id. Every resolution refreshes the activity time.
//!
//! ## User id
//!
//! A 32-hex-char token kept in durable storage with a long expiry. The token is a
//! SHA-256 digest over a fresh UUID v4 (OS CSPRNG), the user agent and the current
//! time. The ambient signals only shape the digest; the entropy comes from the UUID.
//!
//! ## Unavailable storage
//!
//! Storage errors are logged once per store. After that the resolver keeps the
//! identifiers in memory for its own lifetime, so emission never fails because of
//! storage.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::{DurableStore, SessionStore};

/// Session storage key holding the session id
pub const SESSION_ID_KEY: &str = "ts_session_id";
/// Session storage key holding the last-activity epoch milliseconds
pub const LAST_ACTIVITY_KEY: &str = "ts_last_activity";
/// Durable storage key holding the user id
pub const USER_ID_KEY: &str = "ts_user_id";

/// Identifier of one browsing session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pseudo-anonymous identifier of one browser profile
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Generate a new user id.
    pub fn generate(user_agent: &str, now: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        hasher.update(user_agent.as_bytes());
        hasher.update(now.timestamp_millis().to_be_bytes());
        let digest = hasher.finalize();

        UserId(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves session and user ids against the two stores
pub struct IdentityResolver {
    session_store: Box<dyn SessionStore>,
    durable_store: Box<dyn DurableStore>,
    /// Set once session storage has failed
    session_fallback: Option<SessionState>,
    /// Set once durable storage has failed
    user_fallback: Option<UserId>,
}

#[derive(Debug, Clone)]
struct SessionState {
    id: SessionId,
    last_activity: DateTime<Utc>,
}

impl IdentityResolver {
    pub fn new(session_store: Box<dyn SessionStore>, durable_store: Box<dyn DurableStore>) -> Self {
        Self {
            session_store,
            durable_store,
            session_fallback: None,
            user_fallback: None,
        }
    }

    /// Return the current session id, renewing it after `inactivity` without activity.
    ///
    /// Always records `now` as the last activity.
    pub fn resolve_session_id(&mut self, now: DateTime<Utc>, inactivity: Duration) -> SessionId {
        if let Some(state) = self.session_fallback.as_mut() {
            if now - state.last_activity > inactivity {
                state.id = SessionId::generate();
            }
            state.last_activity = now;
            return state.id.clone();
        }

        match resolve_stored_session(&mut *self.session_store, now, inactivity) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Session storage unavailable, keeping session id in memory"
                );
                let id = SessionId::generate();
                self.session_fallback = Some(SessionState {
                    id: id.clone(),
                    last_activity: now,
                });
                id
            }
        }
    }

    /// Return the durable user id, creating it if absent or expired.
    pub fn resolve_user_id(
        &mut self,
        now: DateTime<Utc>,
        ttl: Duration,
        user_agent: &str,
    ) -> UserId {
        if let Some(id) = &self.user_fallback {
            return id.clone();
        }

        match resolve_stored_user(&mut *self.durable_store, now, ttl, user_agent) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Durable storage unavailable, keeping user id in memory"
                );
                let id = UserId::generate(user_agent, now);
                self.user_fallback = Some(id.clone());
                id
            }
        }
    }

    /// Read the stored ids without refreshing or minting anything.
    pub fn peek(&self, now: DateTime<Utc>) -> (Option<SessionId>, Option<UserId>) {
        let session = match &self.session_fallback {
            Some(state) => Some(state.id.clone()),
            None => self
                .session_store
                .get(SESSION_ID_KEY)
                .ok()
                .flatten()
                .map(SessionId),
        };
        let user = match &self.user_fallback {
            Some(id) => Some(id.clone()),
            None => self
                .durable_store
                .get(USER_ID_KEY, now)
                .ok()
                .flatten()
                .map(UserId),
        };
        (session, user)
    }
}

fn resolve_stored_session(
    store: &mut dyn SessionStore,
    now: DateTime<Utc>,
    inactivity: Duration,
) -> Result<SessionId> {
    let existing = store.get(SESSION_ID_KEY)?;
    let last_activity = store
        .get(LAST_ACTIVITY_KEY)?
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    let id = match (existing, last_activity) {
        (Some(id), Some(last)) if now - last <= inactivity => SessionId(id),
        (previous, _) => {
            let id = SessionId::generate();
            tracing::debug!(
                previous = previous.as_deref().unwrap_or("<none>"),
                session_id = %id,
                "Starting new session"
            );
            store.set(SESSION_ID_KEY, id.as_str())?;
            id
        }
    };

    store.set(LAST_ACTIVITY_KEY, &now.timestamp_millis().to_string())?;
    Ok(id)
}

fn resolve_stored_user(
    store: &mut dyn DurableStore,
    now: DateTime<Utc>,
    ttl: Duration,
    user_agent: &str,
) -> Result<UserId> {
    if let Some(id) = store.get(USER_ID_KEY, now)? {
        return Ok(UserId(id));
    }

    let id = UserId::generate(user_agent, now);
    store.set(USER_ID_KEY, id.as_str(), now + ttl)?;
    tracing::debug!(user_id = %id, "Created user id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;

    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Box::new(MemoryStore::new()), Box::new(MemoryStore::new()))
    }

    /// Store that rejects every operation, as when the host disables storage
    struct BrokenStore;

    impl SessionStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Storage("disabled".to_string()))
        }
        fn set(&mut self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Storage("disabled".to_string()))
        }
        fn remove(&mut self, _key: &str) -> Result<()> {
            Err(Error::Storage("disabled".to_string()))
        }
    }

    impl DurableStore for BrokenStore {
        fn get(&self, _key: &str, _now: DateTime<Utc>) -> Result<Option<String>> {
            Err(Error::Storage("disabled".to_string()))
        }
        fn set(&mut self, _key: &str, _value: &str, _expires_at: DateTime<Utc>) -> Result<()> {
            Err(Error::Storage("disabled".to_string()))
        }
        fn remove(&mut self, _key: &str) -> Result<()> {
            Err(Error::Storage("disabled".to_string()))
        }
    }

    #[test]
    fn test_session_id_is_uuid() {
        let id = SessionId::generate();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_user_id_is_hex_token() {
        let id = UserId::generate(UA, Utc::now());
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_user_ids_differ_with_same_signals() {
        let now = Utc::now();
        assert_ne!(UserId::generate(UA, now), UserId::generate(UA, now));
    }

    #[test]
    fn test_session_renewed_after_idle_gap() {
        let mut r = resolver();
        let t0 = Utc::now();
        let window = Duration::minutes(30);

        let first = r.resolve_session_id(t0, window);
        let same = r.resolve_session_id(t0 + Duration::minutes(29), window);
        assert_eq!(first, same);

        // Gap measured from the last activity, not the session start
        let still = r.resolve_session_id(t0 + Duration::minutes(58), window);
        assert_eq!(first, still);

        let renewed = r.resolve_session_id(t0 + Duration::minutes(89), window);
        assert_ne!(first, renewed);
    }

    #[test]
    fn test_gap_equal_to_threshold_keeps_session() {
        let mut r = resolver();
        let t0 = Utc::now();
        let window = Duration::minutes(30);
        let first = r.resolve_session_id(t0, window);
        assert_eq!(first, r.resolve_session_id(t0 + window, window));
    }

    #[test]
    fn test_activity_always_recorded() {
        let mut store = MemoryStore::new();
        let t0 = Utc::now();
        resolve_stored_session(&mut store, t0, Duration::minutes(30)).unwrap();
        assert_eq!(
            SessionStore::get(&store, LAST_ACTIVITY_KEY).unwrap(),
            Some(t0.timestamp_millis().to_string())
        );
    }

    #[test]
    fn test_unparsable_activity_starts_new_session() {
        let mut store = MemoryStore::new();
        SessionStore::set(&mut store, SESSION_ID_KEY, "old").unwrap();
        SessionStore::set(&mut store, LAST_ACTIVITY_KEY, "yesterday").unwrap();

        let id = resolve_stored_session(&mut store, Utc::now(), Duration::minutes(30)).unwrap();
        assert_ne!(id.as_str(), "old");
    }

    #[test]
    fn test_user_id_stable_across_resolvers_sharing_storage() {
        let now = Utc::now();
        let ttl = Duration::days(365);
        let mut durable = MemoryStore::new();

        let first = resolve_stored_user(&mut durable, now, ttl, UA).unwrap();
        let second = resolve_stored_user(&mut durable, now + Duration::days(100), ttl, UA).unwrap();
        assert_eq!(first, second);

        let after_expiry =
            resolve_stored_user(&mut durable, now + Duration::days(366), ttl, UA).unwrap();
        assert_ne!(first, after_expiry);
    }

    #[test]
    fn test_broken_storage_degrades_to_memory() {
        let mut r = IdentityResolver::new(Box::new(BrokenStore), Box::new(BrokenStore));
        let t0 = Utc::now();
        let window = Duration::minutes(30);

        let s1 = r.resolve_session_id(t0, window);
        let s2 = r.resolve_session_id(t0 + Duration::minutes(1), window);
        assert_eq!(s1, s2);
        let s3 = r.resolve_session_id(t0 + Duration::minutes(40), window);
        assert_ne!(s2, s3);

        let u1 = r.resolve_user_id(t0, Duration::days(365), UA);
        let u2 = r.resolve_user_id(t0, Duration::days(365), UA);
        assert_eq!(u1, u2);

        let (session, user) = r.peek(t0);
        assert_eq!(session, Some(s3));
        assert_eq!(user, Some(u1));
    }

    #[test]
    fn test_peek_does_not_mint() {
        let r = resolver();
        assert_eq!(r.peek(Utc::now()), (None, None));
    }

    proptest! {
        #[test]
        fn prop_session_constant_within_window(gaps in proptest::collection::vec(0i64..=1_800_000, 1..40)) {
            let mut r = resolver();
            let window = Duration::milliseconds(1_800_000);
            let mut now = Utc::now();
            let first = r.resolve_session_id(now, window);
            for gap in gaps {
                now += Duration::milliseconds(gap);
                prop_assert_eq!(&r.resolve_session_id(now, window), &first);
            }
        }

        #[test]
        fn prop_session_changes_after_gap(gap in 1_800_001i64..10_000_000) {
            let mut r = resolver();
            let window = Duration::milliseconds(1_800_000);
            let now = Utc::now();
            let before = r.resolve_session_id(now, window);
            let after = r.resolve_session_id(now + Duration::milliseconds(gap), window);
            prop_assert_ne!(before, after);
        }
    }
}
