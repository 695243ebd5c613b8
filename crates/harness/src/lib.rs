//! Probelab test harness
//!
//! A browser E2E harness for a telemetry SDK: it builds a per-test page
//! against a selected SDK bundle variant, serves it from an in-process
//! HTTP server, drives a real browser, intercepts outgoing ingestion
//! traffic, and hands decoded envelopes to test assertions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      TestContext (per test)                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  PageBuilder ── builds subject.js/init.js + index.html       │
//! │      │             (variant-aliased SDK artifact)            │
//! │  AssetRegistry ── shared immutable artifacts, symlinked      │
//! │      │                                                       │
//! │  PageServer ── axum, 127.0.0.1:0, one per built page         │
//! │      │                                                       │
//! │  BrowserSession ── Playwright bootstrap under node,          │
//! │      │             JSON line protocol, route interception    │
//! │      ▼                                                       │
//! │  CaptureRegistry ── ingest-matched requests only,            │
//! │                     indexed + bounded envelope waits         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Build state advances `Unbuilt → Built → Served → Navigated →
//! (Capturing | Done)` within a single test and never crosses tests.
//!
//! The one ordering rule callers must respect: establish an envelope wait
//! *before* triggering the page action that produces it.

pub mod assets;
pub mod browser;
pub mod builder;
pub mod capture;
pub mod config;
pub mod error;
pub mod fixture;
pub mod loader;
pub mod server;
pub mod template;
pub mod variant;

pub use assets::AssetRegistry;
pub use browser::{
    run_in_chromium, run_in_firefox, run_in_webkit, BrowserConfig, BrowserKind, BrowserSession,
};
pub use builder::{BuiltPage, PageBuilder, SDK_SPECIFIER};
pub use capture::{CaptureRegistry, CapturedRequest, EnvelopeFilter};
pub use config::{HarnessConfig, DEFAULT_DSN};
pub use error::{HarnessError, HarnessResult};
pub use fixture::{FixtureState, TestContext};
pub use loader::{generate_loader, LoaderPreset};
pub use server::PageServer;
pub use template::Template;
pub use variant::BundleVariant;
