//! Browser driving
//!
//! The harness controls a real browser through a generated Playwright
//! bootstrap running under Node. The bootstrap installs a route
//! interceptor for the ingestion endpoint pattern (fulfilling matched
//! requests locally so nothing leaves the machine) and speaks a JSON line
//! protocol: captured requests and command acknowledgements stream out on
//! stdout, commands go in on stdin. The Rust side feeds captured requests
//! into the test's [`CaptureRegistry`] as they arrive, so envelope waits
//! can overlap page actions.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use probelab_envelope::IngestMatcher;

use crate::capture::{CaptureRegistry, CapturedRequest};
use crate::error::{HarnessError, HarnessResult};
use crate::template::Template;

pub const BROWSER_ENV: &str = "PROBELAB_BROWSER";

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }

    /// Browser selected by `PROBELAB_BROWSER`, defaulting to chromium.
    /// An unrecognized value is fatal before any browser work begins.
    pub fn from_env() -> HarnessResult<Self> {
        match std::env::var(BROWSER_ENV) {
            Ok(value) if !value.trim().is_empty() => match value.trim() {
                "chromium" => Ok(BrowserKind::Chromium),
                "firefox" => Ok(BrowserKind::Firefox),
                "webkit" => Ok(BrowserKind::Webkit),
                other => Err(HarnessError::Config(format!(
                    "{} must be chromium, firefox, or webkit; got {:?}",
                    BROWSER_ENV, other
                ))),
            },
            _ => Ok(BrowserKind::default()),
        }
    }
}

impl std::fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run `f` only when the active browser is chromium; `None` on mismatch.
/// Mismatch is a no-op, not a failure: tests use these to scope
/// browser-specific assertions without branching every test body.
pub fn run_in_chromium<T>(active: BrowserKind, f: impl FnOnce() -> T) -> Option<T> {
    (active == BrowserKind::Chromium).then(f)
}

/// Run `f` only when the active browser is firefox; `None` on mismatch.
pub fn run_in_firefox<T>(active: BrowserKind, f: impl FnOnce() -> T) -> Option<T> {
    (active == BrowserKind::Firefox).then(f)
}

/// Run `f` only when the active browser is webkit; `None` on mismatch.
pub fn run_in_webkit<T>(active: BrowserKind, f: impl FnOnce() -> T) -> Option<T> {
    (active == BrowserKind::Webkit).then(f)
}

/// Commands sent to the driver bootstrap, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DriverCommand {
    Goto { url: String },
    Eval { script: String },
    /// Override the page's visibility state to `hidden` and dispatch a
    /// `visibilitychange` event, forcing visibility-gated buffers (replay
    /// in particular) to flush without waiting out their timers.
    FlushReplay,
    Close,
}

impl DriverCommand {
    fn name(&self) -> &'static str {
        match self {
            DriverCommand::Goto { .. } => "goto",
            DriverCommand::Eval { .. } => "eval",
            DriverCommand::FlushReplay => "flush_replay",
            DriverCommand::Close => "close",
        }
    }
}

/// Events received from the driver bootstrap, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverEvent {
    Ready,
    Request {
        url: String,
        method: String,
        headers: HashMap<String, String>,
        body_b64: String,
    },
    Ack {
        cmd: String,
        #[serde(default)]
        value: Option<Value>,
    },
    Error {
        message: String,
    },
}

/// Parse one stdout line from the driver. Anything unparseable is a
/// protocol violation: the bootstrap only ever writes JSON events.
pub fn parse_driver_line(line: &str) -> HarnessResult<DriverEvent> {
    serde_json::from_str(line)
        .map_err(|e| HarnessError::Driver(format!("malformed driver output {:?}: {}", line, e)))
}

fn decode_request_event(
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body_b64: &str,
) -> HarnessResult<CapturedRequest> {
    let body = BASE64
        .decode(body_b64)
        .map_err(|e| HarnessError::Driver(format!("invalid request body encoding: {}", e)))?;
    Ok(CapturedRequest {
        url,
        method,
        headers,
        body: Bytes::from(body),
    })
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub kind: BrowserKind,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Regex source handed to the in-page route interceptor.
    pub ingest_pattern: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            kind: BrowserKind::default(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            ingest_pattern: IngestMatcher::default().pattern().to_string(),
        }
    }
}

static BOOTSTRAP_TEMPLATE: Lazy<HarnessResult<Template>> = Lazy::new(|| {
    Template::parse(
        r#"const readline = require('readline');
const { chromium, firefox, webkit } = require('playwright');

function emit(event) {
  process.stdout.write(JSON.stringify(event) + '\n');
}

(async () => {
  const browser = await {{browser}}.launch({ headless: {{headless}} });
  const context = await browser.newContext({
    viewport: { width: {{width}}, height: {{height}} }
  });
  const page = await context.newPage();
  const ingest = new RegExp({{pattern}});

  await context.route(ingest, async (route) => {
    const request = route.request();
    const body = request.postDataBuffer();
    emit({
      kind: 'request',
      url: request.url(),
      method: request.method(),
      headers: await request.allHeaders(),
      body_b64: body ? body.toString('base64') : ''
    });
    await route.fulfill({ status: 200, contentType: 'application/json', body: '{}' });
  });

  emit({ kind: 'ready' });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    let command;
    try {
      command = JSON.parse(line);
    } catch (error) {
      emit({ kind: 'error', message: 'bad command line: ' + error.message });
      continue;
    }
    try {
      if (command.cmd === 'goto') {
        await page.goto(command.url);
        emit({ kind: 'ack', cmd: 'goto' });
      } else if (command.cmd === 'eval') {
        const value = await page.evaluate(command.script);
        emit({ kind: 'ack', cmd: 'eval', value: value === undefined ? null : value });
      } else if (command.cmd === 'flush_replay') {
        await page.evaluate(() => {
          Object.defineProperty(document, 'visibilityState', {
            configurable: true,
            get: () => 'hidden'
          });
          document.dispatchEvent(new Event('visibilitychange'));
        });
        emit({ kind: 'ack', cmd: 'flush_replay' });
      } else if (command.cmd === 'close') {
        await browser.close();
        emit({ kind: 'ack', cmd: 'close' });
        process.exit(0);
      } else {
        emit({ kind: 'error', message: 'unknown command: ' + command.cmd });
      }
    } catch (error) {
      emit({ kind: 'error', message: error.message });
    }
  }
})().catch((error) => {
  process.stderr.write(String((error && error.stack) || error) + '\n');
  process.exit(1);
});
"#,
    )
});

/// A running browser session driven over the line protocol.
pub struct BrowserSession {
    child: Child,
    stdin: ChildStdin,
    events: mpsc::Receiver<DriverEvent>,
    kind: BrowserKind,
    // Keeps the generated bootstrap on disk for the child's lifetime.
    _workdir: tempfile::TempDir,
}

impl BrowserSession {
    /// Render the driver bootstrap for a configuration.
    pub fn bootstrap_script(config: &BrowserConfig) -> HarnessResult<String> {
        let template = match &*BOOTSTRAP_TEMPLATE {
            Ok(template) => template,
            Err(e) => {
                return Err(HarnessError::Driver(format!(
                    "bootstrap template invalid: {}",
                    e
                )))
            }
        };

        let pattern = serde_json::to_string(&config.ingest_pattern)?;
        template
            .render(&[
                ("browser", config.kind.as_str()),
                ("headless", if config.headless { "true" } else { "false" }),
                ("width", &config.viewport_width.to_string()),
                ("height", &config.viewport_height.to_string()),
                ("pattern", &pattern),
            ])
            .map_err(|e| HarnessError::Driver(e.to_string()))
    }

    /// Check that the Playwright CLI is available.
    pub fn check_playwright_installed() -> HarnessResult<()> {
        let status = std::process::Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(HarnessError::Driver(
                "playwright not found, install with: npx playwright install".to_string(),
            )),
        }
    }

    /// Spawn the bootstrap and wait for its ready event. Captured ingest
    /// requests flow into `registry` for the session's lifetime.
    pub async fn launch(
        config: &BrowserConfig,
        registry: CaptureRegistry,
    ) -> HarnessResult<Self> {
        Self::check_playwright_installed()?;

        let script = Self::bootstrap_script(config)?;
        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("driver.js");
        std::fs::write(&script_path, script)?;

        debug!(script = %script_path.display(), browser = %config.kind, "launching browser driver");

        let mut child = TokioCommand::new("node")
            .arg(&script_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarnessError::Driver(format!("failed to spawn node: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Driver("driver stdout not piped".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::Driver("driver stdin not piped".to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(pump_events(stdout, registry, event_tx));

        let mut session = Self {
            child,
            stdin,
            events: event_rx,
            kind: config.kind,
            _workdir: workdir,
        };

        match session.next_event(LAUNCH_TIMEOUT).await? {
            DriverEvent::Ready => {
                info!(browser = %session.kind, "browser session ready");
                Ok(session)
            }
            other => Err(HarnessError::Driver(format!(
                "expected ready event, got {:?}",
                other
            ))),
        }
    }

    pub fn kind(&self) -> BrowserKind {
        self.kind
    }

    /// Navigate the page.
    pub async fn goto(&mut self, url: &str) -> HarnessResult<()> {
        self.request(&DriverCommand::Goto { url: url.to_string() })
            .await
            .map(|_| ())
    }

    /// Evaluate a script in the page, returning its JSON value.
    pub async fn eval(&mut self, script: &str) -> HarnessResult<Value> {
        self.request(&DriverCommand::Eval {
            script: script.to_string(),
        })
        .await
        .map(|value| value.unwrap_or(Value::Null))
    }

    /// Force visibility-gated buffers in the page to flush now.
    pub async fn force_flush_replay(&mut self) -> HarnessResult<()> {
        self.request(&DriverCommand::FlushReplay).await.map(|_| ())
    }

    /// Close the browser and wait for the child to exit.
    pub async fn close(mut self) -> HarnessResult<()> {
        self.request(&DriverCommand::Close).await?;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
        Ok(())
    }

    async fn request(&mut self, command: &DriverCommand) -> HarnessResult<Option<Value>> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|e| HarnessError::Driver(format!("driver stdin closed: {}", e)))?;

        loop {
            match self.next_event(COMMAND_TIMEOUT).await? {
                DriverEvent::Ack { cmd, value } if cmd == command.name() => return Ok(value),
                DriverEvent::Error { message } => return Err(HarnessError::Driver(message)),
                other => {
                    debug!("ignoring out-of-band driver event: {:?}", other);
                }
            }
        }
    }

    async fn next_event(&mut self, timeout: Duration) -> HarnessResult<DriverEvent> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(HarnessError::Driver(
                "browser driver exited unexpectedly".to_string(),
            )),
            Err(_) => Err(HarnessError::Driver(format!(
                "no driver event within {} ms",
                timeout.as_millis()
            ))),
        }
    }
}

async fn pump_events(
    stdout: tokio::process::ChildStdout,
    registry: CaptureRegistry,
    tx: mpsc::Sender<DriverEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_driver_line(&line) {
                Ok(DriverEvent::Request {
                    url,
                    method,
                    headers,
                    body_b64,
                }) => match decode_request_event(url, method, headers, &body_b64) {
                    Ok(request) => {
                        registry.record(request);
                    }
                    Err(e) => {
                        let _ = tx
                            .send(DriverEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                    }
                },
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    let _ = tx
                        .send(DriverEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            },
            Ok(None) => return,
            Err(e) => {
                warn!("driver stdout read failed: {}", e);
                return;
            }
        }
    }
}
