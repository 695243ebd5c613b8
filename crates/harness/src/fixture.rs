//! Per-test fixture context
//!
//! Every test owns a [`TestContext`]: variant selection, build output,
//! page servers, the browser session, and the capture registry all live in
//! it and die with it. Nothing is process-global, so test order can never
//! leak state between tests; teardown is deterministic (browser first,
//! then servers) and happens on drop.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use probelab_envelope::IngestMatcher;

use crate::assets::AssetRegistry;
use crate::browser::{
    run_in_chromium, run_in_firefox, run_in_webkit, BrowserConfig, BrowserSession,
};
use crate::builder::{BuiltPage, PageBuilder};
use crate::capture::{CaptureRegistry, CapturedRequest, EnvelopeFilter};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::server::PageServer;

/// Lifecycle of one test's fixture. Each test starts fresh at `Unbuilt`;
/// there is no cross-test carry-over of build or browser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    Unbuilt,
    Built,
    Served,
    Navigated,
    Capturing,
    Done,
}

struct ServedPage {
    built: BuiltPage,
    server: PageServer,
    url: String,
}

pub struct TestContext {
    config: HarnessConfig,
    state: Cell<FixtureState>,
    // Field order is teardown order: the browser session must die before
    // the servers it was pointed at.
    browser: Option<BrowserSession>,
    pages: Vec<ServedPage>,
    capture: CaptureRegistry,
    builder: PageBuilder,
    assets: AssetRegistry,
    _workdir: Option<tempfile::TempDir>,
}

impl TestContext {
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let (build_root, workdir): (PathBuf, Option<tempfile::TempDir>) = match &config.build_root
        {
            Some(root) => (root.clone(), None),
            None => {
                let dir = tempfile::tempdir()?;
                (dir.path().to_path_buf(), Some(dir))
            }
        };

        let assets = AssetRegistry::new(build_root.join("assets"))?;
        let builder = PageBuilder::new(
            build_root.join("pages"),
            assets.clone(),
            config.variant,
            config.dsn.clone(),
        );
        let capture = CaptureRegistry::new(IngestMatcher::for_dsn(&config.dsn));

        Ok(Self {
            config,
            state: Cell::new(FixtureState::Unbuilt),
            browser: None,
            pages: Vec::new(),
            capture,
            builder,
            assets,
            _workdir: workdir,
        })
    }

    /// Context from environment configuration.
    pub fn from_env() -> HarnessResult<Self> {
        Self::new(HarnessConfig::from_env()?)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn state(&self) -> FixtureState {
        self.state.get()
    }

    pub fn assets(&self) -> &AssetRegistry {
        &self.assets
    }

    pub fn capture(&self) -> &CaptureRegistry {
        &self.capture
    }

    pub fn builder(&self) -> &PageBuilder {
        &self.builder
    }

    /// Build the page for `test_dir` (if not already built in this
    /// context), serve it, and return its URL. Idempotent: repeated calls
    /// for the same directory return the same URL without rebuilding.
    pub async fn get_local_test_url(&mut self, test_dir: &Path) -> HarnessResult<String> {
        if let Some(page) = self.pages.iter().find(|p| p.built.test_dir == test_dir) {
            debug!(url = %page.url, "reusing served page");
            return Ok(page.url.clone());
        }

        let built = self.builder.build(test_dir)?;
        if self.state.get() == FixtureState::Unbuilt {
            self.state.set(FixtureState::Built);
        }

        let server = PageServer::serve(built.output_dir.clone()).await?;
        let url = server.url();
        if self.state.get() == FixtureState::Built {
            self.state.set(FixtureState::Served);
        }

        self.pages.push(ServedPage {
            built,
            server,
            url: url.clone(),
        });
        Ok(url)
    }

    /// Navigate the browser to the page built for `test_dir`, launching
    /// the browser session on first use.
    pub async fn navigate(&mut self, test_dir: &Path) -> HarnessResult<()> {
        let url = self.get_local_test_url(test_dir).await?;

        if self.browser.is_none() {
            let browser_config = BrowserConfig {
                kind: self.config.browser,
                ingest_pattern: self.capture.matcher().pattern().to_string(),
                ..Default::default()
            };
            self.browser =
                Some(BrowserSession::launch(&browser_config, self.capture.clone()).await?);
        }

        let browser = self
            .browser
            .as_mut()
            .ok_or_else(|| HarnessError::Driver("browser session unavailable".to_string()))?;
        browser.goto(&url).await?;
        self.state.set(FixtureState::Navigated);
        Ok(())
    }

    /// Force visibility-gated buffers in the current page to flush.
    pub async fn force_flush_replay(&mut self) -> HarnessResult<()> {
        match self.browser.as_mut() {
            Some(browser) => browser.force_flush_replay().await,
            None => Err(HarnessError::Driver(
                "no browser session; navigate first".to_string(),
            )),
        }
    }

    /// Evaluate a script in the current page.
    pub async fn eval(&mut self, script: &str) -> HarnessResult<serde_json::Value> {
        match self.browser.as_mut() {
            Some(browser) => browser.eval(script).await,
            None => Err(HarnessError::Driver(
                "no browser session; navigate first".to_string(),
            )),
        }
    }

    /// Wait for the `index`-th envelope matching `filter`, bounded by the
    /// configured default timeout. Establish waits before triggering the
    /// page action that produces them.
    pub async fn wait_for_envelope(
        &self,
        filter: &EnvelopeFilter,
        index: usize,
    ) -> HarnessResult<CapturedRequest> {
        self.state.set(FixtureState::Capturing);
        self.capture
            .wait_for_envelope(filter, index, self.config.default_timeout)
            .await
    }

    pub async fn wait_for_error(&self) -> HarnessResult<CapturedRequest> {
        self.state.set(FixtureState::Capturing);
        self.capture.wait_for_error(self.config.default_timeout).await
    }

    pub async fn wait_for_transaction(&self) -> HarnessResult<CapturedRequest> {
        self.state.set(FixtureState::Capturing);
        self.capture
            .wait_for_transaction(self.config.default_timeout)
            .await
    }

    pub async fn wait_for_session(&self) -> HarnessResult<serde_json::Value> {
        self.state.set(FixtureState::Capturing);
        self.capture.wait_for_session(self.config.default_timeout).await
    }

    pub async fn wait_for_replay_segment(&self, segment: u64) -> HarnessResult<CapturedRequest> {
        self.state.set(FixtureState::Capturing);
        self.capture
            .wait_for_replay_segment(segment, self.config.default_timeout)
            .await
    }

    /// Run `f` only under chromium.
    pub fn run_in_chromium<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        run_in_chromium(self.config.browser, f)
    }

    /// Run `f` only under firefox.
    pub fn run_in_firefox<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        run_in_firefox(self.config.browser, f)
    }

    /// Run `f` only under webkit.
    pub fn run_in_webkit<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        run_in_webkit(self.config.browser, f)
    }

    /// Graceful teardown: close the browser, stop every server. Also
    /// performed (non-gracefully for the browser) on drop.
    pub async fn finish(&mut self) -> HarnessResult<()> {
        if let Some(browser) = self.browser.take() {
            browser.close().await?;
        }
        for page in &mut self.pages {
            page.server.stop();
        }
        self.state.set(FixtureState::Done);
        Ok(())
    }

    /// Wait with an explicit timeout override for known-slow operations.
    pub async fn wait_for_envelope_with_timeout(
        &self,
        filter: &EnvelopeFilter,
        index: usize,
        timeout: Duration,
    ) -> HarnessResult<CapturedRequest> {
        self.state.set(FixtureState::Capturing);
        self.capture.wait_for_envelope(filter, index, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::BundleVariant;

    #[test]
    fn fresh_context_starts_unbuilt_with_empty_capture() {
        let ctx = TestContext::new(HarnessConfig::default()).unwrap();
        assert_eq!(ctx.state(), FixtureState::Unbuilt);
        assert!(ctx.capture().is_empty());
        assert_eq!(ctx.config().variant, BundleVariant::Esm);
    }

    #[test]
    fn conditional_helpers_follow_the_configured_browser() {
        let ctx = TestContext::new(HarnessConfig::default()).unwrap();
        assert_eq!(ctx.run_in_chromium(|| 7), Some(7));
        assert_eq!(ctx.run_in_firefox(|| 7), None);
        assert_eq!(ctx.run_in_webkit(|| 7), None);
    }

    #[tokio::test]
    async fn flushing_before_navigation_is_a_driver_error() {
        let mut ctx = TestContext::new(HarnessConfig::default()).unwrap();
        let err = ctx.force_flush_replay().await.unwrap_err();
        assert!(matches!(err, HarnessError::Driver(_)));
    }
}
