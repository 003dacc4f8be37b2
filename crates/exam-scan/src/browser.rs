use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::scan_types::{CookieMap, WatchError};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// CSS selectors the login flow depends on.
const USERNAME_SELECTOR: &str = "#username";
const PASSWORD_SELECTOR: &str = "#password";
const LOGIN_BUTTON_SELECTOR: &str = "#kc-login";
const CHALLENGE_IFRAME_SELECTOR: &str = "iframe[src*='challenges.cloudflare.com']";
const CHALLENGE_WIDGET_SELECTOR: &str = "[data-sitekey]";

/// Options for the headless login browser.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Login page URL
    pub login_url: String,

    /// Run without a visible window (default: true)
    pub headless: bool,

    /// Leave the browser open after the flow for manual inspection
    pub keep_open: bool,

    /// Timeout for page navigations (default: 60 seconds)
    pub nav_timeout: Duration,

    /// Timeout waiting for the login form to render (default: 20 seconds)
    pub form_timeout: Duration,

    /// Timeout waiting for the challenge widget (default: 30 seconds)
    pub widget_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            login_url: "https://pro.permisdeconduire.gouv.fr/?groupe-permis=B".to_string(),
            headless: true,
            keep_open: false,
            nav_timeout: Duration::from_secs(60),
            form_timeout: Duration::from_secs(20),
            widget_timeout: Duration::from_secs(30),
        }
    }
}

/// What the browser learned before the challenge must be solved.
#[derive(Debug, Clone)]
pub struct ChallengePrompt {
    /// Site key extracted from the challenge widget
    pub site_key: String,
    /// Page URL at the time the widget rendered
    pub page_url: String,
}

/// Raw page state after the login form was submitted. Classification into an
/// outcome is the acquirer's job, not the browser's.
#[derive(Debug, Clone)]
pub struct PostLoginState {
    /// URL the browser ended up on
    pub final_url: String,
    /// Text of the first matching on-page error element, if any
    pub error_text: Option<String>,
    /// Full page HTML, kept for diagnostics
    pub html: String,
    /// Cookie jar contents
    pub cookies: CookieMap,
}

/// One browser session driving the portal's login form.
///
/// The two-phase shape exists because the challenge token is produced by an
/// external solver between the form rendering and the submit.
#[async_trait]
pub trait LoginBrowser: Send + Sync {
    /// Navigate to the login page, fill the credentials, and wait for the
    /// challenge widget; fails when the form or the widget never renders.
    async fn begin_login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ChallengePrompt, WatchError>;

    /// Inject the solved token, submit the form, and capture the final page
    /// state.
    async fn complete_login(&mut self, token: &str) -> Result<PostLoginState, WatchError>;

    /// Tear the session down (a no-op when configured to stay open).
    async fn close(&mut self);
}

/// Launches one fresh [`LoginBrowser`] per acquisition attempt.
#[async_trait]
pub trait LoginBrowserFactory: Send + Sync {
    /// Launch a new browser session.
    async fn launch(&self) -> Result<Box<dyn LoginBrowser>, WatchError>;
}

/// Pull the site key out of whatever the page exposed: either the challenge
/// iframe's src (where it travels as a query parameter) or the widget's
/// data attribute value taken verbatim.
fn extract_site_key(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }

    let re = Regex::new(r"sitekey=([^&]+)").ok()?;
    if let Some(caps) = re.captures(&raw) {
        return Some(caps[1].to_string());
    }

    // A data-sitekey attribute carries the key directly; anything that looks
    // like a URL without the parameter is useless.
    if raw.contains("://") {
        None
    } else {
        Some(raw)
    }
}

/// Truncate a site key for logging. The key comes straight off the page, so
/// it can hold multi-byte characters; counting chars keeps the cut on a
/// boundary.
fn key_preview(key: &str) -> String {
    key.chars().take(24).collect()
}

/// Factory for chromiumoxide-backed login sessions.
pub struct HeadlessLoginFactory {
    options: BrowserOptions,
}

impl HeadlessLoginFactory {
    /// Create a factory with the given options.
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl LoginBrowserFactory for HeadlessLoginFactory {
    async fn launch(&self) -> Result<Box<dyn LoginBrowser>, WatchError> {
        let session = HeadlessLogin::launch(self.options.clone()).await?;
        Ok(Box::new(session))
    }
}

/// A chromiumoxide browser session hardened against trivial bot detection.
struct HeadlessLogin {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    options: BrowserOptions,
}

impl HeadlessLogin {
    async fn launch(options: BrowserOptions) -> Result<Self, WatchError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-setuid-sandbox");

        if !options.headless {
            builder = builder.with_head();
        }

        let config = builder
            .build()
            .map_err(|e| WatchError::Browser(format!("Invalid browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to launch browser: {}", e)))?;

        // The CDP handler must be polled for the browser to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to open page: {}", e)))?;

        page.set_user_agent(USER_AGENT)
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to set user agent: {}", e)))?;

        // Same fingerprint patches the stealth plugin applies: hide webdriver,
        // fake a plugin list, expose a chrome runtime object.
        page.evaluate_on_new_document(
            "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });\
             Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });\
             window.chrome = { runtime: {} };",
        )
        .await
        .map_err(|e| WatchError::Browser(format!("Failed to install stealth script: {}", e)))?;

        Ok(Self {
            browser,
            page,
            handler_task,
            options,
        })
    }

    /// Poll for any of the given selectors until one appears or the deadline
    /// passes. chromiumoxide has no built-in selector wait, so this mirrors
    /// the heuristic polling other CDP-based scrapers use.
    async fn wait_for_any(&self, selectors: &[&str], limit: Duration) -> Result<(), WatchError> {
        let deadline = tokio::time::Instant::now() + limit;

        loop {
            for selector in selectors {
                if self.page.find_element(*selector).await.is_ok() {
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(WatchError::Browser(format!(
                    "Timed out waiting for {:?}",
                    selectors
                )));
            }

            sleep(Duration::from_millis(250)).await;
        }
    }

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), WatchError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| WatchError::Browser(format!("Element {} not found: {}", selector, e)))?;

        element
            .click()
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to focus {}: {}", selector, e)))?;
        element
            .type_str(text)
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to type into {}: {}", selector, e)))?;

        Ok(())
    }

    async fn current_url(&self) -> Result<String, WatchError> {
        self.page
            .url()
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to read URL: {}", e)))?
            .ok_or_else(|| WatchError::Browser("Page has no URL".to_string()))
    }

    /// Submit the form and wait for a navigation; returns false when the
    /// navigation never fired (the caller still inspects final page state,
    /// since a navigation can happen without the awaited event).
    async fn submit_and_wait(&self) -> bool {
        let submitted = self
            .page
            .evaluate("document.querySelector('form') && document.querySelector('form').submit()")
            .await;

        if submitted.is_ok()
            && timeout(self.options.nav_timeout, self.page.wait_for_navigation())
                .await
                .is_ok()
        {
            return true;
        }

        warn!("form.submit() produced no navigation, falling back to the login button");

        if let Ok(button) = self.page.find_element(LOGIN_BUTTON_SELECTOR).await {
            if button.click().await.is_ok()
                && timeout(self.options.nav_timeout, self.page.wait_for_navigation())
                    .await
                    .is_ok()
            {
                return true;
            }
        }

        false
    }
}

#[async_trait]
impl LoginBrowser for HeadlessLogin {
    async fn begin_login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ChallengePrompt, WatchError> {
        info!("Loading login page");

        self.page
            .goto(self.options.login_url.as_str())
            .await
            .map_err(|e| WatchError::Browser(format!("Navigation failed: {}", e)))?;
        let _ = timeout(self.options.nav_timeout, self.page.wait_for_navigation()).await;

        self.wait_for_any(&[USERNAME_SELECTOR], self.options.form_timeout)
            .await
            .map_err(|_| WatchError::Browser("Login form never rendered".to_string()))?;

        self.type_into(USERNAME_SELECTOR, username).await?;
        sleep(Duration::from_millis(400)).await;
        self.type_into(PASSWORD_SELECTOR, password).await?;

        self.wait_for_any(
            &[CHALLENGE_IFRAME_SELECTOR, CHALLENGE_WIDGET_SELECTOR],
            self.options.widget_timeout,
        )
        .await
        .map_err(|_| WatchError::Browser("Challenge widget never appeared".to_string()))?;

        let raw: Option<String> = self
            .page
            .evaluate(
                "(() => {\
                   const iframe = document.querySelector(\"iframe[src*='challenges.cloudflare.com']\");\
                   if (iframe) return iframe.getAttribute('src');\
                   const div = document.querySelector('[data-sitekey]');\
                   return div ? div.getAttribute('data-sitekey') : null;\
                 })()",
            )
            .await
            .map_err(|e| WatchError::Browser(format!("Sitekey lookup failed: {}", e)))?
            .into_value()
            .map_err(|e| WatchError::Browser(format!("Sitekey lookup returned junk: {}", e)))?;

        let site_key = extract_site_key(raw)
            .ok_or_else(|| WatchError::Browser("Challenge sitekey not found on page".to_string()))?;

        debug!("Challenge sitekey: {}...", key_preview(&site_key));

        Ok(ChallengePrompt {
            site_key,
            page_url: self.current_url().await?,
        })
    }

    async fn complete_login(&mut self, token: &str) -> Result<PostLoginState, WatchError> {
        info!("Injecting challenge token and submitting the form");

        // Cover both widget conventions for the hidden field name, fire
        // input/change so client-side validation accepts the value, and poke
        // any registered widget callback best-effort.
        let token_json = serde_json::to_string(token)
            .map_err(|e| WatchError::Browser(format!("Token not injectable: {}", e)))?;
        let inject = format!(
            "((token) => {{\
               const form = document.querySelector('form');\
               if (!form) throw new Error('login form not found');\
               const ensureHidden = (name, value) => {{\
                 let el = form.querySelector(`input[name=\"${{name}}\"]`);\
                 if (!el) {{\
                   el = document.createElement('input');\
                   el.type = 'hidden';\
                   el.name = name;\
                   form.appendChild(el);\
                 }}\
                 el.value = value;\
                 el.dispatchEvent(new Event('input', {{ bubbles: true }}));\
                 el.dispatchEvent(new Event('change', {{ bubbles: true }}));\
               }};\
               ensureHidden('cf-turnstile-response', token);\
               ensureHidden('g-recaptcha-response', token);\
               try {{\
                 const holder = form.querySelector('[data-callback]');\
                 const cbName = form.getAttribute('data-callback') ||\
                   (holder ? holder.getAttribute('data-callback') : null);\
                 if (cbName && typeof window[cbName] === 'function') {{\
                   try {{ window[cbName](token); }} catch (e) {{}}\
                 }}\
               }} catch (e) {{}}\
             }})({token_json})"
        );

        self.page
            .evaluate(inject)
            .await
            .map_err(|e| WatchError::Browser(format!("Token injection failed: {}", e)))?;

        if !self.submit_and_wait().await {
            warn!("No navigation observed after submit, inspecting final page state anyway");
        }

        sleep(Duration::from_secs(1)).await;

        let final_url = self.current_url().await?;
        debug!("Post-login URL: {}", final_url);

        let error_text: Option<String> = self
            .page
            .evaluate(
                "(() => {\
                   const selectors = ['.alert-error', '#input-error', '.kc-feedback-text',\
                                      '[class*=\"error\"]', '[class*=\"invalid\"]'];\
                   for (const sel of selectors) {\
                     const el = document.querySelector(sel);\
                     if (el && el.textContent && el.textContent.trim()) {\
                       return el.textContent.trim();\
                     }\
                   }\
                   return null;\
                 })()",
            )
            .await
            .map_err(|e| WatchError::Browser(format!("Error-element lookup failed: {}", e)))?
            .into_value()
            .unwrap_or(None);

        let html = self
            .page
            .content()
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to read page HTML: {}", e)))?;

        let mut cookies = CookieMap::new();
        for cookie in self
            .page
            .get_cookies()
            .await
            .map_err(|e| WatchError::Browser(format!("Failed to read cookies: {}", e)))?
        {
            cookies.insert(cookie.name, cookie.value);
        }

        Ok(PostLoginState {
            final_url,
            error_text,
            html,
            cookies,
        })
    }

    async fn close(&mut self) {
        if self.options.keep_open {
            info!("Debug mode: leaving the browser open for inspection");
            return;
        }

        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        self.handler_task.abort();
    }
}
