use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::browser::{LoginBrowser, LoginBrowserFactory, PostLoginState};
use crate::captcha::ChallengeSolver;
use crate::scan_types::{CookieMap, WatchError};

/// URL fragments that mean the browser is still on the authentication side of
/// the portal (identity provider, challenge vendor, login action endpoints).
const LOGIN_URL_MARKERS: [&str; 3] = ["auth.", "cdn-cgi", "login-actions"];

/// Diagnostics dumped when the form rejects the credentials.
const ERROR_PAGE_DUMP: &str = "login_error_page.html";
/// Diagnostics dumped when the browser never left the login flow.
const DEBUG_PAGE_DUMP: &str = "login_debug_page.html";
const DEBUG_COOKIES_DUMP: &str = "login_debug_cookies.json";

/// Produces a fresh cookie set by running the full login flow.
#[async_trait]
pub trait AcquireSession: Send + Sync {
    /// Run one acquisition attempt. `Ok(None)` means the attempt produced no
    /// session; the caller decides whether and when to retry.
    async fn acquire(&self) -> Result<Option<CookieMap>, WatchError>;
}

/// How a submitted login attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// The browser left the login flow; the cookie jar holds the session
    Success,
    /// The form surfaced an error message (bad credentials, rejected token)
    CredentialsRejected(String),
    /// No error shown but the browser never left the authentication pages
    StillUnauthenticated,
}

/// Classify the post-submit page state. Checked in order, first match wins:
/// on-page error text beats URL inspection beats success.
pub fn classify_post_login(state: &PostLoginState) -> LoginOutcome {
    if let Some(ref text) = state.error_text {
        return LoginOutcome::CredentialsRejected(text.clone());
    }

    if LOGIN_URL_MARKERS
        .iter()
        .any(|marker| state.final_url.contains(marker))
    {
        return LoginOutcome::StillUnauthenticated;
    }

    LoginOutcome::Success
}

/// Configuration for the session acquirer.
#[derive(Debug, Clone)]
pub struct AcquirerConfig {
    /// Portal account username
    pub username: String,
    /// Portal account password
    pub password: String,
    /// Where diagnostics dumps land (default: current directory)
    pub diagnostics_dir: PathBuf,
}

/// Drives a login browser and the challenge solver to produce session cookies.
pub struct SessionAcquirer {
    factory: Arc<dyn LoginBrowserFactory>,
    solver: Arc<dyn ChallengeSolver>,
    config: AcquirerConfig,
}

impl SessionAcquirer {
    /// Create an acquirer over the given browser factory and solver.
    pub fn new(
        factory: Arc<dyn LoginBrowserFactory>,
        solver: Arc<dyn ChallengeSolver>,
        config: AcquirerConfig,
    ) -> Self {
        Self {
            factory,
            solver,
            config,
        }
    }

    async fn run_flow(&self, browser: &mut dyn LoginBrowser) -> Result<Option<CookieMap>, WatchError> {
        let prompt = browser
            .begin_login(&self.config.username, &self.config.password)
            .await?;

        let Some(token) = self.solver.solve(&prompt.site_key, &prompt.page_url).await? else {
            error!("Challenge unsolved, abandoning this login attempt");
            return Ok(None);
        };

        let state = browser.complete_login(&token).await?;

        match classify_post_login(&state) {
            LoginOutcome::Success => {
                info!("Login succeeded, {} cookie(s) captured", state.cookies.len());
                Ok(Some(state.cookies))
            }
            LoginOutcome::CredentialsRejected(message) => {
                error!("Login form rejected the attempt: {}", message);
                self.dump(ERROR_PAGE_DUMP, state.html.as_bytes()).await;
                Ok(None)
            }
            LoginOutcome::StillUnauthenticated => {
                error!("Still on the authentication pages after submit: {}", state.final_url);
                self.dump(DEBUG_PAGE_DUMP, state.html.as_bytes()).await;
                if let Ok(json) = serde_json::to_vec_pretty(&state.cookies) {
                    self.dump(DEBUG_COOKIES_DUMP, &json).await;
                }
                Ok(None)
            }
        }
    }

    /// Best-effort diagnostics write; a failed dump never fails the attempt.
    async fn dump(&self, name: &str, contents: &[u8]) {
        let path = self.config.diagnostics_dir.join(name);
        match tokio::fs::write(&path, contents).await {
            Ok(()) => info!("Diagnostics written to {}", path.display()),
            Err(e) => warn!("Could not write diagnostics {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl AcquireSession for SessionAcquirer {
    async fn acquire(&self) -> Result<Option<CookieMap>, WatchError> {
        if self.config.username.is_empty() || self.config.password.is_empty() {
            error!("Missing portal username or password");
            return Ok(None);
        }

        info!("Starting automated portal login");

        let mut browser = match self.factory.launch().await {
            Ok(browser) => browser,
            Err(e) => {
                error!("Could not launch login browser: {}", e);
                return Ok(None);
            }
        };

        let result = self.run_flow(browser.as_mut()).await;
        browser.close().await;

        match result {
            Ok(cookies) => Ok(cookies),
            Err(e) => {
                error!("Login attempt failed: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ChallengePrompt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn state(final_url: &str, error_text: Option<&str>) -> PostLoginState {
        PostLoginState {
            final_url: final_url.to_string(),
            error_text: error_text.map(|s| s.to_string()),
            html: "<html></html>".to_string(),
            cookies: CookieMap::new(),
        }
    }

    #[test]
    fn error_text_wins_over_url_inspection() {
        let s = state(
            "https://auth.pro.permisdeconduire.gouv.fr/realms/formation/login-actions/authenticate",
            Some("Identifiants invalides"),
        );
        assert_eq!(
            classify_post_login(&s),
            LoginOutcome::CredentialsRejected("Identifiants invalides".to_string())
        );
    }

    #[test]
    fn login_urls_mean_still_unauthenticated() {
        for url in [
            "https://auth.pro.permisdeconduire.gouv.fr/realms/formation",
            "https://pro.permisdeconduire.gouv.fr/cdn-cgi/challenge",
            "https://idp.example/realms/formation/login-actions/authenticate",
        ] {
            assert_eq!(
                classify_post_login(&state(url, None)),
                LoginOutcome::StillUnauthenticated,
                "url {url} should classify as unauthenticated"
            );
        }
    }

    #[test]
    fn any_other_url_is_a_success() {
        assert_eq!(
            classify_post_login(&state("https://pro.permisdeconduire.gouv.fr/reserver-examen", None)),
            LoginOutcome::Success
        );
    }

    /// Browser double that replays one scripted flow.
    struct ScriptedBrowser {
        prompt: Result<ChallengePrompt, String>,
        state: Option<PostLoginState>,
        complete_calls: Arc<AtomicU32>,
        closed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LoginBrowser for ScriptedBrowser {
        async fn begin_login(
            &mut self,
            _username: &str,
            _password: &str,
        ) -> Result<ChallengePrompt, WatchError> {
            self.prompt.clone().map_err(WatchError::Browser)
        }

        async fn complete_login(&mut self, _token: &str) -> Result<PostLoginState, WatchError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.state.clone().expect("scripted state"))
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        prompt: Result<ChallengePrompt, String>,
        state: Option<PostLoginState>,
        complete_calls: Arc<AtomicU32>,
        closed: Arc<AtomicU32>,
        launches: AtomicU32,
    }

    impl ScriptedFactory {
        fn new(prompt: Result<ChallengePrompt, String>, state: Option<PostLoginState>) -> Self {
            Self {
                prompt,
                state,
                complete_calls: Arc::new(AtomicU32::new(0)),
                closed: Arc::new(AtomicU32::new(0)),
                launches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LoginBrowserFactory for ScriptedFactory {
        async fn launch(&self) -> Result<Box<dyn LoginBrowser>, WatchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedBrowser {
                prompt: self.prompt.clone(),
                state: self.state.clone(),
                complete_calls: self.complete_calls.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    struct FixedSolver {
        token: Option<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChallengeSolver for FixedSolver {
        async fn solve(&self, _site_key: &str, _page_url: &str) -> Result<Option<String>, WatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }
    }

    fn prompt() -> ChallengePrompt {
        ChallengePrompt {
            site_key: "0xKEY".to_string(),
            page_url: "https://pro.permisdeconduire.gouv.fr/".to_string(),
        }
    }

    fn config(dir: &std::path::Path) -> AcquirerConfig {
        AcquirerConfig {
            username: "user@example.test".to_string(),
            password: "secret".to_string(),
            diagnostics_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn successful_flow_returns_the_cookie_jar() {
        let dir = tempfile::tempdir().unwrap();
        let mut success = state("https://pro.permisdeconduire.gouv.fr/reserver-examen", None);
        success
            .cookies
            .insert("cf_clearance".to_string(), "ok".to_string());

        let factory = Arc::new(ScriptedFactory::new(Ok(prompt()), Some(success)));
        let solver = Arc::new(FixedSolver {
            token: Some("tok".to_string()),
            calls: AtomicU32::new(0),
        });
        let acquirer = SessionAcquirer::new(factory.clone(), solver, config(dir.path()));

        let cookies = acquirer.acquire().await.unwrap().unwrap();
        assert_eq!(cookies.get("cf_clearance").map(String::as_str), Some("ok"));
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsolved_challenge_never_submits_the_form() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Ok(prompt()), None));
        let solver = Arc::new(FixedSolver {
            token: None,
            calls: AtomicU32::new(0),
        });
        let acquirer = SessionAcquirer::new(factory.clone(), solver, config(dir.path()));

        assert!(acquirer.acquire().await.unwrap().is_none());
        assert_eq!(factory.complete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_widget_fails_the_attempt_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::new(
            Err("Challenge widget never appeared".to_string()),
            None,
        ));
        let solver = Arc::new(FixedSolver {
            token: Some("tok".to_string()),
            calls: AtomicU32::new(0),
        });
        let acquirer = SessionAcquirer::new(factory.clone(), solver.clone(), config(dir.path()));

        assert!(acquirer.acquire().await.unwrap().is_none());
        assert_eq!(factory.launches.load(Ordering::SeqCst), 1);
        assert_eq!(solver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_credentials_fail_before_launching_anything() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::new(Ok(prompt()), None));
        let solver = Arc::new(FixedSolver {
            token: Some("tok".to_string()),
            calls: AtomicU32::new(0),
        });
        let mut cfg = config(dir.path());
        cfg.password = String::new();
        let acquirer = SessionAcquirer::new(factory.clone(), solver, cfg);

        assert!(acquirer.acquire().await.unwrap().is_none());
        assert_eq!(factory.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_dump_the_page_for_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let rejected = state(
            "https://auth.pro.permisdeconduire.gouv.fr/realms/formation",
            Some("Invalid username or password."),
        );
        let factory = Arc::new(ScriptedFactory::new(Ok(prompt()), Some(rejected)));
        let solver = Arc::new(FixedSolver {
            token: Some("tok".to_string()),
            calls: AtomicU32::new(0),
        });
        let acquirer = SessionAcquirer::new(factory, solver, config(dir.path()));

        assert!(acquirer.acquire().await.unwrap().is_none());
        assert!(dir.path().join(ERROR_PAGE_DUMP).exists());
    }

    #[tokio::test]
    async fn unauthenticated_end_state_dumps_page_and_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let stuck = state("https://pro.permisdeconduire.gouv.fr/cdn-cgi/challenge", None);
        let factory = Arc::new(ScriptedFactory::new(Ok(prompt()), Some(stuck)));
        let solver = Arc::new(FixedSolver {
            token: Some("tok".to_string()),
            calls: AtomicU32::new(0),
        });
        let acquirer = SessionAcquirer::new(factory, solver, config(dir.path()));

        assert!(acquirer.acquire().await.unwrap().is_none());
        assert!(dir.path().join(DEBUG_PAGE_DUMP).exists());
        assert!(dir.path().join(DEBUG_COOKIES_DUMP).exists());
    }
}
