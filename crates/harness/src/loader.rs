//! Loader bootstrap generation
//!
//! Loader-style variants ship a tiny bootstrap script instead of the full
//! SDK: it queues API calls made before the bundle arrives, then injects a
//! script tag for the real bundle either immediately (eager) or on first
//! use (lazy) and applies a configuration object once loaded.

use once_cell::sync::Lazy;
use serde_json::json;

use crate::error::{HarnessError, HarnessResult};
use crate::template::Template;
use crate::variant::BundleVariant;

/// Named loader presets, looked up from the active bundle variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderPreset {
    /// Lazy: fetch the bundle on the first captured call.
    Base,
    /// Eager: fetch the bundle as soon as the bootstrap runs.
    Eager,
    /// Lazy, booting the tracing bundle with tracing options.
    Tracing,
    /// Lazy, booting the replay bundle with replay options.
    Replay,
}

impl LoaderPreset {
    pub fn for_variant(variant: BundleVariant) -> Option<Self> {
        match variant {
            BundleVariant::LoaderBase => Some(LoaderPreset::Base),
            BundleVariant::LoaderEager => Some(LoaderPreset::Eager),
            BundleVariant::LoaderTracing => Some(LoaderPreset::Tracing),
            BundleVariant::LoaderReplay => Some(LoaderPreset::Replay),
            _ => None,
        }
    }

    pub fn eager(&self) -> bool {
        matches!(self, LoaderPreset::Eager)
    }

    /// Init options the bootstrap applies once the bundle has loaded.
    pub fn init_options(&self) -> serde_json::Value {
        match self {
            LoaderPreset::Base | LoaderPreset::Eager => json!({}),
            LoaderPreset::Tracing => json!({ "tracesSampleRate": 1.0 }),
            LoaderPreset::Replay => json!({
                "replaysSessionSampleRate": 1.0,
                "replaysOnErrorSampleRate": 1.0,
            }),
        }
    }
}

static LOADER_TEMPLATE: Lazy<HarnessResult<Template>> = Lazy::new(|| {
    Template::parse(
        r#"(function (window, document) {
  'use strict';

  var queue = [];
  var injected = false;

  function inject() {
    if (injected) return;
    injected = true;
    var script = document.createElement('script');
    script.src = '{{bundle_url}}';
    script.crossOrigin = 'anonymous';
    script.addEventListener('load', function () {
      var sdk = window.Telemetry;
      sdk.init({{options}});
      queue.forEach(function (callback) { callback(sdk); });
      queue = [];
    });
    document.head.appendChild(script);
  }

  window.Telemetry = {
    onLoad: function (callback) {
      if (injected && window.Telemetry.init === undefined) {
        // bundle replaced the stub already
        callback(window.Telemetry);
        return;
      }
      queue.push(callback);
      inject();
    },
    forceLoad: inject,
  };

  if ({{eager}}) {
    inject();
  }
})(window, document);
"#,
    )
});

/// Render the bootstrap for a preset against a concrete bundle URL.
///
/// Substitution goes through the slot-validated [`Template`] engine, so a
/// missing placeholder aborts generation instead of emitting a
/// partially-substituted script.
pub fn generate_loader(preset: LoaderPreset, bundle_url: &str) -> HarnessResult<String> {
    let template = match &*LOADER_TEMPLATE {
        Ok(template) => template,
        Err(e) => return Err(HarnessError::Loader(format!("loader template invalid: {}", e))),
    };

    let options = serde_json::to_string(&preset.init_options())?;
    let eager = if preset.eager() { "true" } else { "false" };

    template
        .render(&[
            ("bundle_url", bundle_url),
            ("options", &options),
            ("eager", eager),
        ])
        .map_err(|e| HarnessError::Loader(e.to_string()))
}
