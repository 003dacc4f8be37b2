use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::scan_types::WatchError;

/// Poll reply meaning the solution is not ready yet (the service's own
/// spelling).
const NOT_READY: &str = "CAPCHA_NOT_READY";

/// Solves the login page's anti-bot challenge.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Solve a challenge for the given site key and page URL.
    ///
    /// `Ok(None)` means the solver gave up after its bounded attempts; a
    /// partial token is never returned.
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<Option<String>, WatchError>;
}

/// Bounds for the submit/poll cycle.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Full submit+poll cycles before giving up (default: 3)
    pub max_submit_attempts: u32,

    /// Delay between submit attempts (default: 5 seconds)
    pub submit_retry_delay: Duration,

    /// Delay between result polls (default: 3 seconds)
    pub poll_interval: Duration,

    /// Polls per cycle before the cycle is considered exhausted (default: 40,
    /// roughly a two-minute ceiling)
    pub max_polls: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_submit_attempts: 3,
            submit_retry_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            max_polls: 40,
        }
    }
}

/// One reply from the solving service. `status == 1` means the submission was
/// accepted (on submit) or the token is ready (on poll); `request` carries the
/// task id, the token, or an error code.
#[derive(Debug, Clone, Deserialize)]
pub struct SolverReply {
    /// 1 on success, 0 otherwise
    pub status: i32,
    /// Task id, token, or error code depending on context
    pub request: String,
}

/// Raw HTTP exchange with the solving service, kept behind a trait so the
/// bounded retry/poll logic can be tested without network.
#[async_trait]
pub trait SolverApi: Send + Sync {
    /// Submit a challenge; on success `request` is the task id.
    async fn submit(&self, site_key: &str, page_url: &str) -> Result<SolverReply, WatchError>;

    /// Poll a submitted task for its result.
    async fn fetch(&self, task_id: &str) -> Result<SolverReply, WatchError>;
}

/// 2Captcha HTTP API.
pub struct TwoCaptchaApi {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TwoCaptchaApi {
    /// Create an API handle for the given account key.
    pub fn new(api_key: String) -> Result<Self, WatchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WatchError::Solver(format!("Failed to create solver client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://2captcha.com".to_string(),
        })
    }
}

#[async_trait]
impl SolverApi for TwoCaptchaApi {
    async fn submit(&self, site_key: &str, page_url: &str) -> Result<SolverReply, WatchError> {
        let response = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("method", "turnstile"),
                ("sitekey", site_key),
                ("pageurl", page_url),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| WatchError::Solver(format!("Submit request failed: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| WatchError::Solver(format!("Failed to parse submit reply: {}", e)))
    }

    async fn fetch(&self, task_id: &str) -> Result<SolverReply, WatchError> {
        let response = self
            .client
            .get(format!("{}/res.php", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", task_id),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| WatchError::Solver(format!("Poll request failed: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| WatchError::Solver(format!("Failed to parse poll reply: {}", e)))
    }
}

/// Challenge solver backed by the 2Captcha service.
pub struct TwoCaptchaSolver {
    api: Arc<dyn SolverApi>,
    config: SolverConfig,
}

impl TwoCaptchaSolver {
    /// Create a solver over the given API key with default bounds.
    pub fn new(api_key: String) -> Result<Self, WatchError> {
        Ok(Self {
            api: Arc::new(TwoCaptchaApi::new(api_key)?),
            config: SolverConfig::default(),
        })
    }

    /// Create a solver over a custom API implementation.
    pub fn with_api(api: Arc<dyn SolverApi>, config: SolverConfig) -> Self {
        Self { api, config }
    }

    /// Run one submit+poll cycle. `Ok(None)` means the cycle exhausted or hit
    /// an unrecoverable reply; the caller decides whether to start another.
    async fn solve_once(&self, site_key: &str, page_url: &str) -> Result<Option<String>, WatchError> {
        let submitted = self.api.submit(site_key, page_url).await?;

        if submitted.status != 1 {
            warn!("Challenge submission rejected: {}", submitted.request);
            return Ok(None);
        }

        let task_id = submitted.request;
        debug!("Challenge task created: {}", task_id);

        for poll in 0..self.config.max_polls {
            sleep(self.config.poll_interval).await;

            let reply = self.api.fetch(&task_id).await?;

            if reply.status == 1 {
                info!("Challenge solved after {} poll(s)", poll + 1);
                return Ok(Some(reply.request));
            }

            if reply.request != NOT_READY {
                warn!("Unexpected solver reply, aborting cycle: {}", reply.request);
                return Ok(None);
            }
        }

        warn!("Solver poll budget exhausted for task {}", task_id);
        Ok(None)
    }
}

#[async_trait]
impl ChallengeSolver for TwoCaptchaSolver {
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<Option<String>, WatchError> {
        for attempt in 1..=self.config.max_submit_attempts {
            debug!(
                "Challenge solve attempt {}/{}",
                attempt, self.config.max_submit_attempts
            );

            match self.solve_once(site_key, page_url).await {
                Ok(Some(token)) => return Ok(Some(token)),
                Ok(None) => {}
                Err(e) => warn!("Solver attempt {} failed: {}", attempt, e),
            }

            if attempt < self.config.max_submit_attempts {
                sleep(self.config.submit_retry_delay).await;
            }
        }

        warn!(
            "Challenge unsolved after {} attempt(s)",
            self.config.max_submit_attempts
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays scripted replies; submit and poll scripts are independent.
    struct ScriptedApi {
        submits: Mutex<Vec<SolverReply>>,
        polls: Mutex<Vec<SolverReply>>,
        submit_calls: Mutex<u32>,
        poll_calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn new(submits: Vec<SolverReply>, polls: Vec<SolverReply>) -> Self {
            Self {
                submits: Mutex::new(submits),
                polls: Mutex::new(polls),
                submit_calls: Mutex::new(0),
                poll_calls: Mutex::new(0),
            }
        }

        fn reply(status: i32, request: &str) -> SolverReply {
            SolverReply {
                status,
                request: request.to_string(),
            }
        }
    }

    #[async_trait]
    impl SolverApi for ScriptedApi {
        async fn submit(&self, _site_key: &str, _page_url: &str) -> Result<SolverReply, WatchError> {
            *self.submit_calls.lock().unwrap() += 1;
            let mut script = self.submits.lock().unwrap();
            Ok(script.remove(0))
        }

        async fn fetch(&self, _task_id: &str) -> Result<SolverReply, WatchError> {
            *self.poll_calls.lock().unwrap() += 1;
            let mut script = self.polls.lock().unwrap();
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script[0].clone())
            }
        }
    }

    fn instant_config(max_submit_attempts: u32) -> SolverConfig {
        SolverConfig {
            max_submit_attempts,
            submit_retry_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            max_polls: 40,
        }
    }

    #[tokio::test]
    async fn returns_token_when_poll_reports_ready() {
        let api = Arc::new(ScriptedApi::new(
            vec![ScriptedApi::reply(1, "task-1")],
            vec![
                ScriptedApi::reply(0, NOT_READY),
                ScriptedApi::reply(1, "the-token"),
            ],
        ));
        let solver = TwoCaptchaSolver::with_api(api.clone(), instant_config(1));

        let token = solver.solve("sitekey", "https://example.test").await.unwrap();
        assert_eq!(token.as_deref(), Some("the-token"));
        assert_eq!(*api.poll_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn exhausts_poll_budget_and_returns_none() {
        let api = Arc::new(ScriptedApi::new(
            vec![ScriptedApi::reply(1, "task-1")],
            vec![ScriptedApi::reply(0, NOT_READY)],
        ));
        let solver = TwoCaptchaSolver::with_api(api.clone(), instant_config(1));

        let token = solver.solve("sitekey", "https://example.test").await.unwrap();
        assert_eq!(token, None);
        assert_eq!(*api.poll_calls.lock().unwrap(), 40);
    }

    #[tokio::test]
    async fn unexpected_poll_reply_aborts_the_cycle_early() {
        let api = Arc::new(ScriptedApi::new(
            vec![ScriptedApi::reply(1, "task-1")],
            vec![
                ScriptedApi::reply(0, NOT_READY),
                ScriptedApi::reply(0, "ERROR_CAPTCHA_UNSOLVABLE"),
            ],
        ));
        let solver = TwoCaptchaSolver::with_api(api.clone(), instant_config(1));

        let token = solver.solve("sitekey", "https://example.test").await.unwrap();
        assert_eq!(token, None);
        // Aborted on the error reply, well before the 40-poll budget.
        assert_eq!(*api.poll_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_submission_is_retried_up_to_the_attempt_limit() {
        let api = Arc::new(ScriptedApi::new(
            vec![
                ScriptedApi::reply(0, "ERROR_WRONG_USER_KEY"),
                ScriptedApi::reply(0, "ERROR_WRONG_USER_KEY"),
                ScriptedApi::reply(0, "ERROR_WRONG_USER_KEY"),
            ],
            vec![ScriptedApi::reply(0, NOT_READY)],
        ));
        let solver = TwoCaptchaSolver::with_api(api.clone(), instant_config(3));

        let token = solver.solve("sitekey", "https://example.test").await.unwrap();
        assert_eq!(token, None);
        assert_eq!(*api.submit_calls.lock().unwrap(), 3);
        assert_eq!(*api.poll_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_cycle_resubmits_when_attempts_remain() {
        let api = Arc::new(ScriptedApi::new(
            vec![ScriptedApi::reply(1, "task-1"), ScriptedApi::reply(1, "task-2")],
            vec![ScriptedApi::reply(0, NOT_READY)],
        ));
        let solver = TwoCaptchaSolver::with_api(api.clone(), instant_config(2));

        let token = solver.solve("sitekey", "https://example.test").await.unwrap();
        assert_eq!(token, None);
        assert_eq!(*api.submit_calls.lock().unwrap(), 2);
        assert_eq!(*api.poll_calls.lock().unwrap(), 80);
    }
}
