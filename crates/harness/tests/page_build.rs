//! Page build and serve flow
//!
//! Exercises the build-once serve-many contract end to end: a test
//! directory with a subject script is built for a bundle variant, served
//! from an ephemeral localhost port, and fetched over HTTP the way a
//! navigating browser would fetch it.

use std::path::{Path, PathBuf};

use http_body_util::BodyExt;
use tower::ServiceExt;

use probelab_envelope::Dsn;
use probelab_harness::server::page_router;
use probelab_harness::{
    AssetRegistry, BundleVariant, HarnessConfig, HarnessError, PageBuilder, TestContext,
    DEFAULT_DSN, SDK_SPECIFIER,
};

fn write_test_page(root: &Path) -> PathBuf {
    let dir = root.join("suite").join("capture-once");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("subject.js"),
        "import * as Telemetry from '@telemetry/browser';\nTelemetry.captureMessage('hello');\n",
    )
    .unwrap();
    dir
}

fn default_dsn() -> Dsn {
    DEFAULT_DSN.parse().unwrap()
}

#[tokio::test]
async fn get_local_test_url_builds_once_and_serves_many() {
    let fixtures = tempfile::tempdir().unwrap();
    let test_dir = write_test_page(fixtures.path());

    let mut ctx = TestContext::new(HarnessConfig::default()).unwrap();
    ctx.assets()
        .publish("sdk.esm.js", b"export function init() {}")
        .unwrap();

    let first = ctx.get_local_test_url(&test_dir).await.unwrap();
    let second = ctx.get_local_test_url(&test_dir).await.unwrap();
    assert_eq!(
        first, second,
        "repeated calls within one test must return the same served URL"
    );

    // Output is existence-addressed: editing the source after the first
    // build must not change what this test is already serving.
    std::fs::write(test_dir.join("subject.js"), "mutated after build\n").unwrap();
    let served = reqwest::get(format!("{}subject.js", first))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(
        served.contains("captureMessage"),
        "expected the originally built subject, got: {}",
        served
    );

    ctx.finish().await.unwrap();
}

#[tokio::test]
async fn served_pages_carry_script_tags_and_content_types() {
    let fixtures = tempfile::tempdir().unwrap();
    let test_dir = write_test_page(fixtures.path());

    let mut ctx = TestContext::new(HarnessConfig::default()).unwrap();
    ctx.assets()
        .publish("sdk.esm.js", b"export function init() {}")
        .unwrap();
    let url = ctx.get_local_test_url(&test_dir).await.unwrap();

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/html");
    let html = response.text().await.unwrap();
    assert!(html.contains(r#"<script type="module" src="./init.js">"#));
    assert!(html.contains(r#"<script type="module" src="./subject.js">"#));

    // The default init is rendered with the configured DSN and the SDK
    // import rewritten to the variant artifact.
    let response = reqwest::get(format!("{}init.js", url)).await.unwrap();
    assert_eq!(response.headers()["content-type"], "application/javascript");
    let init = response.text().await.unwrap();
    assert!(init.contains("from './sdk.esm.js'"), "init: {}", init);
    assert!(init.contains("dsn.ingest.example.io"), "init: {}", init);

    ctx.finish().await.unwrap();
}

#[tokio::test]
async fn page_router_rejects_traversal_and_reports_missing_assets() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<!doctype html>").unwrap();

    let router = page_router(dir.path().to_path_buf());

    let ok = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), axum::http::StatusCode::OK);
    let body = ok.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"<!doctype html>");

    let missing = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/nope.js")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), axum::http::StatusCode::NOT_FOUND);

    let traversal = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/../outside.txt")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(traversal.status(), axum::http::StatusCode::BAD_REQUEST);
}

#[test]
fn loader_variants_emit_a_bootstrap_instead_of_module_imports() {
    let fixtures = tempfile::tempdir().unwrap();
    let test_dir = write_test_page(fixtures.path());

    let build = tempfile::tempdir().unwrap();
    let registry = AssetRegistry::new(build.path().join("assets")).unwrap();
    registry
        .publish("bundle.es5.min.js", b"var Telemetry = {};")
        .unwrap();

    let builder = PageBuilder::new(
        build.path().join("pages"),
        registry,
        BundleVariant::LoaderEager,
        default_dsn(),
    );
    let built = builder.build(&test_dir).unwrap();
    assert!(built.fresh);

    let loader = std::fs::read_to_string(built.output_dir.join("loader.js")).unwrap();
    assert!(loader.contains("script.src = './bundle.es5.min.js'"));

    let html = std::fs::read_to_string(built.output_dir.join("index.html")).unwrap();
    assert!(html.contains(r#"<script src="./loader.js">"#));

    // CDN-style builds provide a global, so the import line is dropped
    // rather than rewritten.
    let subject = std::fs::read_to_string(built.output_dir.join("subject.js")).unwrap();
    assert!(!subject.contains(SDK_SPECIFIER));
    assert!(subject.contains("captureMessage"));
}

#[test]
fn missing_subject_is_a_build_error() {
    let fixtures = tempfile::tempdir().unwrap();
    let empty_dir = fixtures.path().join("no-subject-here");
    std::fs::create_dir_all(&empty_dir).unwrap();

    let build = tempfile::tempdir().unwrap();
    let registry = AssetRegistry::new(build.path().join("assets")).unwrap();
    let builder = PageBuilder::new(
        build.path().join("pages"),
        registry,
        BundleVariant::Esm,
        default_dsn(),
    );

    let err = builder.build(&empty_dir).unwrap_err();
    match err {
        HarnessError::Build(msg) => assert!(msg.contains("subject.js"), "{}", msg),
        other => panic!("expected build error, got {:?}", other),
    }
}

#[test]
fn rebuild_discards_existing_output() {
    let fixtures = tempfile::tempdir().unwrap();
    let test_dir = write_test_page(fixtures.path());

    let build = tempfile::tempdir().unwrap();
    let registry = AssetRegistry::new(build.path().join("assets")).unwrap();
    registry.publish("sdk.esm.js", b"export {};").unwrap();
    let builder = PageBuilder::new(
        build.path().join("pages"),
        registry,
        BundleVariant::Esm,
        default_dsn(),
    );

    let built = builder.build(&test_dir).unwrap();
    std::fs::write(built.output_dir.join("subject.js"), "stale junk\n").unwrap();

    // A plain build skips because index.html exists; rebuild starts over.
    let skipped = builder.build(&test_dir).unwrap();
    assert!(!skipped.fresh);
    let rebuilt = builder.rebuild(&test_dir).unwrap();
    assert!(rebuilt.fresh);

    let subject = std::fs::read_to_string(rebuilt.output_dir.join("subject.js")).unwrap();
    assert!(subject.contains("captureMessage"), "subject: {}", subject);
}
