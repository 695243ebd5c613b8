//! SDK bundle variants
//!
//! One SDK is distributed in several prebuilt forms (ES module, CommonJS,
//! minified CDN bundles, loader bootstraps); every test runs against the
//! variant selected through `PW_BUNDLE`. The set is a closed enumeration:
//! an unknown key is a configuration error raised before any browser work
//! begins, never a silent default.

use std::str::FromStr;

use crate::error::{HarnessError, HarnessResult};

pub const PW_BUNDLE_ENV: &str = "PW_BUNDLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BundleVariant {
    #[default]
    Esm,
    Cjs,
    BundleEs5,
    BundleEs5Min,
    BundleTracing,
    BundleTracingMin,
    BundleReplay,
    BundleTracingReplayMin,
    LoaderBase,
    LoaderEager,
    LoaderTracing,
    LoaderReplay,
}

impl BundleVariant {
    pub const ALL: [BundleVariant; 12] = [
        BundleVariant::Esm,
        BundleVariant::Cjs,
        BundleVariant::BundleEs5,
        BundleVariant::BundleEs5Min,
        BundleVariant::BundleTracing,
        BundleVariant::BundleTracingMin,
        BundleVariant::BundleReplay,
        BundleVariant::BundleTracingReplayMin,
        BundleVariant::LoaderBase,
        BundleVariant::LoaderEager,
        BundleVariant::LoaderTracing,
        BundleVariant::LoaderReplay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleVariant::Esm => "esm",
            BundleVariant::Cjs => "cjs",
            BundleVariant::BundleEs5 => "bundle_es5",
            BundleVariant::BundleEs5Min => "bundle_es5_min",
            BundleVariant::BundleTracing => "bundle_tracing",
            BundleVariant::BundleTracingMin => "bundle_tracing_min",
            BundleVariant::BundleReplay => "bundle_replay",
            BundleVariant::BundleTracingReplayMin => "bundle_tracing_replay_min",
            BundleVariant::LoaderBase => "loader_base",
            BundleVariant::LoaderEager => "loader_eager",
            BundleVariant::LoaderTracing => "loader_tracing",
            BundleVariant::LoaderReplay => "loader_replay",
        }
    }

    /// Concrete prebuilt artifact this variant resolves to. For loader
    /// variants this is the bundle the generated bootstrap fetches.
    pub fn artifact(&self) -> &'static str {
        match self {
            BundleVariant::Esm => "sdk.esm.js",
            BundleVariant::Cjs => "sdk.cjs.js",
            BundleVariant::BundleEs5 => "bundle.es5.js",
            BundleVariant::BundleEs5Min => "bundle.es5.min.js",
            BundleVariant::BundleTracing => "bundle.tracing.js",
            BundleVariant::BundleTracingMin => "bundle.tracing.min.js",
            BundleVariant::BundleReplay => "bundle.replay.js",
            BundleVariant::BundleTracingReplayMin => "bundle.tracing.replay.min.js",
            BundleVariant::LoaderBase | BundleVariant::LoaderEager => "bundle.es5.min.js",
            BundleVariant::LoaderTracing => "bundle.tracing.min.js",
            BundleVariant::LoaderReplay => "bundle.replay.js",
        }
    }

    pub fn is_loader(&self) -> bool {
        matches!(
            self,
            BundleVariant::LoaderBase
                | BundleVariant::LoaderEager
                | BundleVariant::LoaderTracing
                | BundleVariant::LoaderReplay
        )
    }

    pub fn is_cdn_bundle(&self) -> bool {
        !matches!(self, BundleVariant::Esm | BundleVariant::Cjs)
    }

    /// Whether pages built for this variant can exercise tracing.
    pub fn supports_tracing(&self) -> bool {
        matches!(
            self,
            BundleVariant::Esm
                | BundleVariant::Cjs
                | BundleVariant::BundleTracing
                | BundleVariant::BundleTracingMin
                | BundleVariant::BundleTracingReplayMin
                | BundleVariant::LoaderTracing
        )
    }

    /// Whether pages built for this variant can exercise session replay.
    pub fn supports_replay(&self) -> bool {
        matches!(
            self,
            BundleVariant::Esm
                | BundleVariant::Cjs
                | BundleVariant::BundleReplay
                | BundleVariant::BundleTracingReplayMin
                | BundleVariant::LoaderReplay
        )
    }

    /// Minified artifacts have debug logging stripped.
    pub fn has_debug_logs(&self) -> bool {
        !self.artifact().contains(".min.")
    }

    /// Variant selected by `PW_BUNDLE`, defaulting to the ES module build
    /// when unset. An unrecognized value is fatal.
    pub fn from_env() -> HarnessResult<Self> {
        match std::env::var(PW_BUNDLE_ENV) {
            Ok(value) if !value.trim().is_empty() => value.trim().parse(),
            _ => Ok(BundleVariant::default()),
        }
    }
}

impl FromStr for BundleVariant {
    type Err = HarnessError;

    fn from_str(s: &str) -> HarnessResult<Self> {
        BundleVariant::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| HarnessError::UnknownVariant(s.to_string()))
    }
}

impl std::fmt::Display for BundleVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_round_trips_through_its_key() {
        for variant in BundleVariant::ALL {
            assert_eq!(variant.as_str().parse::<BundleVariant>().unwrap(), variant);
        }
    }

    #[test]
    fn unknown_key_is_a_fatal_configuration_error() {
        let err = "bundle_es6".parse::<BundleVariant>().unwrap_err();
        assert!(matches!(err, HarnessError::UnknownVariant(_)));
    }

    #[test]
    fn loader_variants_resolve_to_minified_bundles() {
        assert!(BundleVariant::LoaderBase.is_loader());
        assert_eq!(BundleVariant::LoaderBase.artifact(), "bundle.es5.min.js");
        assert_eq!(BundleVariant::LoaderTracing.artifact(), "bundle.tracing.min.js");
        assert!(!BundleVariant::Esm.is_loader());
    }

    #[test]
    fn capability_gates_match_distribution_contents() {
        assert!(BundleVariant::Esm.supports_tracing());
        assert!(BundleVariant::Esm.supports_replay());
        assert!(!BundleVariant::BundleEs5Min.supports_tracing());
        assert!(BundleVariant::BundleTracingReplayMin.supports_tracing());
        assert!(BundleVariant::BundleTracingReplayMin.supports_replay());
        assert!(!BundleVariant::LoaderBase.supports_replay());
    }

    #[test]
    fn minified_bundles_drop_debug_logs() {
        assert!(BundleVariant::BundleEs5.has_debug_logs());
        assert!(!BundleVariant::BundleEs5Min.has_debug_logs());
    }
}
