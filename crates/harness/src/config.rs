//! Harness configuration
//!
//! Tests are invoked through the standard test runner; the environment
//! selects what they run against. `PW_BUNDLE` picks the SDK build variant,
//! `CI` clamps worker concurrency, `PROBELAB_TIMEOUT_MS` overrides the
//! default envelope wait timeout, `PROBELAB_BROWSER` picks the browser.

use std::path::PathBuf;
use std::time::Duration;

use probelab_envelope::Dsn;

use crate::browser::BrowserKind;
use crate::error::{HarnessError, HarnessResult};
use crate::variant::BundleVariant;

pub const TIMEOUT_ENV: &str = "PROBELAB_TIMEOUT_MS";
pub const CI_ENV: &str = "CI";

/// Test DSN pages under test report to. The host never resolves; requests
/// to it are intercepted in the browser before they leave the page.
pub const DEFAULT_DSN: &str = "https://public@dsn.ingest.example.io/1337";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// SDK build variant under test.
    pub variant: BundleVariant,

    /// Browser the driver launches.
    pub browser: BrowserKind,

    /// DSN baked into built pages.
    pub dsn: Dsn,

    /// Default timeout for envelope waits.
    pub default_timeout: Duration,

    /// Worker concurrency hint for suite runners.
    pub workers: usize,

    /// Build output root. `None` means a per-context temporary directory.
    pub build_root: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            variant: BundleVariant::default(),
            browser: BrowserKind::default(),
            dsn: DEFAULT_DSN.parse().expect("default DSN is well-formed"),
            default_timeout: Duration::from_millis(10_000),
            workers: default_workers(),
            build_root: None,
        }
    }
}

impl HarnessConfig {
    /// Read configuration from the environment. An unknown `PW_BUNDLE` or
    /// `PROBELAB_BROWSER` value, or an unparseable timeout, is fatal here,
    /// before any build or browser work begins.
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self {
            variant: BundleVariant::from_env()?,
            browser: BrowserKind::from_env()?,
            ..Self::default()
        };

        if let Ok(raw) = std::env::var(TIMEOUT_ENV) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{} must be an integer, got {:?}", TIMEOUT_ENV, raw))
            })?;
            config.default_timeout = Duration::from_millis(ms);
        }

        if ci_active() {
            config.workers = 1;
        }

        Ok(config)
    }
}

fn ci_active() -> bool {
    std::env::var(CI_ENV)
        .map(|v| !v.trim().is_empty() && v.trim() != "0" && v.trim() != "false")
        .unwrap_or(false)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
