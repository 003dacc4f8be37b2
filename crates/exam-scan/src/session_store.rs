use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::acquirer::AcquireSession;
use crate::scan_types::{SessionCredentials, WatchError};

/// Hands out a usable session, from cache or by running a fresh login.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Return a usable session. `force_new` discards any cached record and
    /// always re-acquires. `Ok(None)` means no session could be produced.
    async fn load(&self, force_new: bool) -> Result<Option<SessionCredentials>, WatchError>;

    /// Write the record to disk, replacing whatever was there.
    async fn persist(&self, creds: &SessionCredentials) -> Result<(), WatchError>;
}

/// File-backed session cache with a freshness TTL.
pub struct SessionStore {
    path: PathBuf,
    acquirer: Arc<dyn AcquireSession>,
}

impl SessionStore {
    /// Create a store persisting to `path`.
    pub fn new(path: PathBuf, acquirer: Arc<dyn AcquireSession>) -> Self {
        Self { path, acquirer }
    }

    /// Read the persisted record, if there is a readable one.
    async fn read_cached(&self) -> Option<SessionCredentials> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(_) => {
                debug!("No cached session at {}", self.path.display());
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("Cached session unreadable, ignoring it: {}", e);
                None
            }
        }
    }

    /// Run a fresh login and persist the result when it is complete.
    async fn reacquire(&self) -> Result<Option<SessionCredentials>, WatchError> {
        let Some(cookies) = self.acquirer.acquire().await? else {
            return Ok(None);
        };

        let Some(creds) = SessionCredentials::from_cookie_map(&cookies) else {
            error!("Login produced an incomplete cookie set, discarding it");
            return Ok(None);
        };

        self.persist(&creds).await?;
        info!("New session persisted to {}", self.path.display());
        Ok(Some(creds))
    }
}

#[async_trait]
impl SessionProvider for SessionStore {
    async fn load(&self, force_new: bool) -> Result<Option<SessionCredentials>, WatchError> {
        if force_new {
            info!("Forcing a fresh session");
            // Missing file is not an error here.
            let _ = tokio::fs::remove_file(&self.path).await;
            return self.reacquire().await;
        }

        if let Some(cached) = self.read_cached().await {
            if cached.is_fresh() {
                info!(
                    "Using cached session, age {} minute(s)",
                    cached.age_ms() / 60_000
                );
                return Ok(Some(cached));
            }
            warn!("Cached session is stale (> 2h), logging in again");
        }

        self.reacquire().await
    }

    async fn persist(&self, creds: &SessionCredentials) -> Result<(), WatchError> {
        let json = serde_json::to_vec_pretty(creds)
            .map_err(|e| WatchError::DataFormat(format!("Session not serializable: {}", e)))?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_types::{CookieMap, SESSION_TTL_MS};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedAcquirer {
        cookies: Option<CookieMap>,
        calls: AtomicU32,
    }

    impl FixedAcquirer {
        fn returning(cookies: Option<CookieMap>) -> Arc<Self> {
            Arc::new(Self {
                cookies,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AcquireSession for FixedAcquirer {
        async fn acquire(&self) -> Result<Option<CookieMap>, WatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.cookies.clone())
        }
    }

    fn full_cookies() -> CookieMap {
        let mut map = CookieMap::new();
        map.insert("cf_clearance".to_string(), "clear".to_string());
        map.insert("mod_auth_openidc_session".to_string(), "oidc".to_string());
        map.insert("__cf_bm".to_string(), "bm".to_string());
        map.insert("etuix".to_string(), "etx".to_string());
        map
    }

    fn store_at(dir: &tempfile::TempDir, acquirer: Arc<FixedAcquirer>) -> SessionStore {
        SessionStore::new(dir.path().join("cookies_session.json"), acquirer)
    }

    #[tokio::test]
    async fn fresh_cached_session_is_returned_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(Some(full_cookies()));
        let store = store_at(&dir, acquirer.clone());

        let original = SessionCredentials::from_cookie_map(&full_cookies()).unwrap();
        store.persist(&original).await.unwrap();

        let loaded = store.load(false).await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_cached_session_triggers_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(Some(full_cookies()));
        let store = store_at(&dir, acquirer.clone());

        let mut stale = SessionCredentials::from_cookie_map(&full_cookies()).unwrap();
        stale.timestamp = Utc::now().timestamp_millis() - SESSION_TTL_MS - 1;
        store.persist(&stale).await.unwrap();

        let loaded = store.load(false).await.unwrap().unwrap();
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
        assert!(loaded.is_fresh());
    }

    #[tokio::test]
    async fn missing_file_falls_through_to_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(Some(full_cookies()));
        let store = store_at(&dir, acquirer.clone());

        assert!(store.load(false).await.unwrap().is_some());
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_new_ignores_a_perfectly_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(Some(full_cookies()));
        let store = store_at(&dir, acquirer.clone());

        let fresh = SessionCredentials::from_cookie_map(&full_cookies()).unwrap();
        store.persist(&fresh).await.unwrap();

        let loaded = store.load(true).await.unwrap().unwrap();
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
        // A new record was minted, not the cached one returned.
        assert!(loaded.timestamp >= fresh.timestamp);
    }

    #[tokio::test]
    async fn force_new_with_failed_acquisition_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(None);
        let store = store_at(&dir, acquirer.clone());

        let fresh = SessionCredentials::from_cookie_map(&full_cookies()).unwrap();
        store.persist(&fresh).await.unwrap();

        assert!(store.load(true).await.unwrap().is_none());
        assert!(!dir.path().join("cookies_session.json").exists());
    }

    #[tokio::test]
    async fn incomplete_cookie_set_is_rejected_and_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut incomplete = full_cookies();
        incomplete.remove("mod_auth_openidc_session");
        let acquirer = FixedAcquirer::returning(Some(incomplete));
        let store = store_at(&dir, acquirer);

        assert!(store.load(false).await.unwrap().is_none());
        assert!(!dir.path().join("cookies_session.json").exists());
    }

    #[tokio::test]
    async fn persisted_record_round_trips_field_for_field() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(None);
        let store = store_at(&dir, acquirer);

        let original = SessionCredentials::from_cookie_map(&full_cookies()).unwrap();
        store.persist(&original).await.unwrap();

        let reloaded = store.load(false).await.unwrap().unwrap();
        assert_eq!(reloaded, original);
    }

    #[tokio::test]
    async fn corrupt_cache_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let acquirer = FixedAcquirer::returning(Some(full_cookies()));
        let store = store_at(&dir, acquirer.clone());

        tokio::fs::write(dir.path().join("cookies_session.json"), b"not json")
            .await
            .unwrap();

        assert!(store.load(false).await.unwrap().is_some());
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
    }
}
