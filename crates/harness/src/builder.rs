//! Page building
//!
//! Each test directory holds a `subject.js` (the behavior under test) and
//! optionally an `init.js` (SDK setup) plus extra page assets. The builder
//! resolves the SDK import to the artifact of the active bundle variant,
//! renders a static `index.html`, and links the artifact in from the asset
//! registry.
//!
//! Output is addressed by existence: a directory that already contains an
//! `index.html` is served as-is without rebuilding. That makes repeated
//! builds within one test free, at the documented cost that stale output
//! survives source edits until the directory is removed (see
//! [`PageBuilder::rebuild`]).

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::{debug, info};
use walkdir::WalkDir;

use probelab_envelope::Dsn;

use crate::assets::AssetRegistry;
use crate::error::{HarnessError, HarnessResult};
use crate::loader::{generate_loader, LoaderPreset};
use crate::template::Template;
use crate::variant::BundleVariant;

/// Module specifier test sources import the SDK under. The build rewrites
/// it per variant; it never reaches the browser.
pub const SDK_SPECIFIER: &str = "@telemetry/browser";

static PAGE_TEMPLATE: Lazy<HarnessResult<Template>> = Lazy::new(|| {
    Template::parse(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    {{head}}
  </head>
  <body>
{{scripts}}  </body>
</html>
"#,
    )
});

static DEFAULT_INIT_TEMPLATE: Lazy<HarnessResult<Template>> = Lazy::new(|| {
    Template::parse(
        r#"import * as Telemetry from '@telemetry/browser';

window.Telemetry = Telemetry;

Telemetry.init({
  dsn: '{{dsn}}',
  release: '0.0.0',
  sampleRate: 1.0,
});
"#,
    )
});

/// A built, servable page.
#[derive(Debug, Clone)]
pub struct BuiltPage {
    pub test_dir: PathBuf,
    pub output_dir: PathBuf,
    /// False when the build was skipped because output already existed.
    pub fresh: bool,
}

pub struct PageBuilder {
    build_root: PathBuf,
    registry: AssetRegistry,
    variant: BundleVariant,
    dsn: Dsn,
}

impl PageBuilder {
    pub fn new(
        build_root: impl Into<PathBuf>,
        registry: AssetRegistry,
        variant: BundleVariant,
        dsn: Dsn,
    ) -> Self {
        Self {
            build_root: build_root.into(),
            registry,
            variant,
            dsn,
        }
    }

    pub fn variant(&self) -> BundleVariant {
        self.variant
    }

    /// Output directory for a test, keyed by test directory and variant so
    /// concurrent tests never contend for the same build output.
    pub fn output_dir(&self, test_dir: &Path) -> PathBuf {
        self.build_root
            .join(page_key(test_dir))
            .join(self.variant.as_str())
    }

    /// Build the page for `test_dir`, or return the existing output.
    pub fn build(&self, test_dir: &Path) -> HarnessResult<BuiltPage> {
        let out = self.output_dir(test_dir);
        if out.join("index.html").is_file() {
            debug!(dir = %out.display(), "build output exists, skipping");
            return Ok(BuiltPage {
                test_dir: test_dir.to_path_buf(),
                output_dir: out,
                fresh: false,
            });
        }

        std::fs::create_dir_all(&out)?;

        let subject_path = test_dir.join("subject.js");
        let subject = std::fs::read_to_string(&subject_path).map_err(|e| {
            HarnessError::Build(format!("cannot read {}: {}", subject_path.display(), e))
        })?;
        let init = self.init_source(test_dir)?;

        let artifact = self.variant.artifact();
        std::fs::write(
            out.join("subject.js"),
            rewrite_sdk_imports(&subject, self.variant),
        )?;
        std::fs::write(out.join("init.js"), rewrite_sdk_imports(&init, self.variant))?;
        self.registry.link_into(&out, artifact)?;

        let mut scripts = String::new();
        if let Some(preset) = LoaderPreset::for_variant(self.variant) {
            let loader = generate_loader(preset, &format!("./{}", artifact))?;
            std::fs::write(out.join("loader.js"), loader)?;
            scripts.push_str("    <script src=\"./loader.js\"></script>\n");
        } else if self.variant.is_cdn_bundle() {
            scripts.push_str(&format!("    <script src=\"./{}\"></script>\n", artifact));
        }
        scripts.push_str("    <script type=\"module\" src=\"./init.js\"></script>\n");
        scripts.push_str("    <script type=\"module\" src=\"./subject.js\"></script>\n");

        let head = match std::fs::read_to_string(test_dir.join("head.html")) {
            Ok(head) => head,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let html = match &*PAGE_TEMPLATE {
            Ok(template) => template.render(&[("head", head.trim_end()), ("scripts", &scripts)])?,
            Err(e) => return Err(HarnessError::Build(format!("page template invalid: {}", e))),
        };
        std::fs::write(out.join("index.html"), html)?;

        self.copy_extra_assets(test_dir, &out)?;

        info!(
            test_dir = %test_dir.display(),
            variant = %self.variant,
            out = %out.display(),
            "built test page"
        );

        Ok(BuiltPage {
            test_dir: test_dir.to_path_buf(),
            output_dir: out,
            fresh: true,
        })
    }

    /// Discard any existing output for `test_dir` and build from scratch.
    pub fn rebuild(&self, test_dir: &Path) -> HarnessResult<BuiltPage> {
        let out = self.output_dir(test_dir);
        if out.exists() {
            std::fs::remove_dir_all(&out)?;
        }
        self.build(test_dir)
    }

    fn init_source(&self, test_dir: &Path) -> HarnessResult<String> {
        match std::fs::read_to_string(test_dir.join("init.js")) {
            Ok(source) => Ok(source),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let template = match &*DEFAULT_INIT_TEMPLATE {
                    Ok(template) => template,
                    Err(e) => {
                        return Err(HarnessError::Build(format!("init template invalid: {}", e)))
                    }
                };
                template.render(&[("dsn", &self.dsn.to_string())])
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy page assets beyond the recognized inputs (nested fixtures,
    /// extra scripts, JSON payloads) into the output directory.
    fn copy_extra_assets(&self, test_dir: &Path, out: &Path) -> HarnessResult<()> {
        for entry in WalkDir::new(test_dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            let rel = entry
                .path()
                .strip_prefix(test_dir)
                .map_err(|e| HarnessError::Build(format!("bad asset path: {}", e)))?;
            if rel == Path::new("subject.js")
                || rel == Path::new("init.js")
                || rel == Path::new("head.html")
            {
                continue;
            }
            let target = out.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

/// Resolve the SDK import per variant: module builds rewrite the specifier
/// to the served artifact path; CDN bundle and loader builds provide a
/// global instead, so the import line is dropped entirely.
pub fn rewrite_sdk_imports(source: &str, variant: BundleVariant) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        if line.contains(SDK_SPECIFIER) {
            if variant.is_cdn_bundle() {
                continue;
            }
            out.push_str(&line.replace(SDK_SPECIFIER, &format!("./{}", variant.artifact())));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Stable directory key for a test dir: its full path with separators
/// flattened, so distinct test locations never collide.
fn page_key(test_dir: &Path) -> String {
    let mut key = String::new();
    for component in test_dir.components() {
        let part = component.as_os_str().to_string_lossy();
        let clean: String = part
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        if clean.is_empty() || clean.chars().all(|c| c == '_') {
            continue;
        }
        if !key.is_empty() {
            key.push('-');
        }
        key.push_str(&clean);
    }
    if key.is_empty() {
        key.push_str("root");
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_variants_rewrite_the_sdk_specifier() {
        let source = "import * as Telemetry from '@telemetry/browser';\nTelemetry.init({});\n";
        let out = rewrite_sdk_imports(source, BundleVariant::Esm);
        assert!(out.contains("from './sdk.esm.js'"));
        assert!(!out.contains(SDK_SPECIFIER));
    }

    #[test]
    fn bundle_variants_drop_the_import_line() {
        let source = "import * as Telemetry from '@telemetry/browser';\nTelemetry.init({});\n";
        let out = rewrite_sdk_imports(source, BundleVariant::BundleEs5Min);
        assert_eq!(out, "Telemetry.init({});\n");
    }

    #[test]
    fn page_keys_for_distinct_dirs_differ() {
        let a = page_key(Path::new("/suites/errors/onerror"));
        let b = page_key(Path::new("/suites/errors/onunhandledrejection"));
        assert_ne!(a, b);
        assert!(!a.contains('/'));
    }
}
