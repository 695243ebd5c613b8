//! Local page serving
//!
//! Built pages are served from an in-process HTTP server bound to an
//! ephemeral localhost port, one server per served page directory. The
//! handle owns the listener task and tears it down on drop, so no server
//! outlives the test that created it.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Handle to a running page server.
pub struct PageServer {
    addr: std::net::SocketAddr,
    root: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PageServer {
    /// Bind a free localhost port and serve `root`.
    pub async fn serve(root: PathBuf) -> HarnessResult<Self> {
        if !root.is_dir() {
            return Err(HarnessError::Server(format!(
                "page root is not a directory: {}",
                root.display()
            )));
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| HarnessError::Server(format!("failed to bind: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::Server(format!("no local addr: {}", e)))?;

        let router = page_router(root.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                warn!("page server exited with error: {}", e);
            }
        });

        info!(addr = %addr, root = %root.display(), "page server listening");

        Ok(Self {
            addr,
            root,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Navigable base URL for the served page.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Signal shutdown. Idempotent; also invoked on drop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!(addr = %self.addr, "stopping page server");
            let _ = tx.send(());
        }
        // The serve task exits on its own once the shutdown signal drains;
        // dropping the handle detaches it.
        self.task.take();
    }
}

impl Drop for PageServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Router serving one built page directory: `/` is `index.html`, anything
/// else resolves inside the directory with traversal components rejected.
pub fn page_router(root: PathBuf) -> Router {
    let root = Arc::new(root);
    Router::new()
        .route("/", get(serve_index))
        .route("/*path", get(serve_file))
        .layer(TraceLayer::new_for_http())
        .with_state(root)
}

async fn serve_index(State(root): State<Arc<PathBuf>>) -> Response {
    read_file(&root, "index.html").await
}

async fn serve_file(State(root): State<Arc<PathBuf>>, UrlPath(path): UrlPath<String>) -> Response {
    read_file(&root, &path).await
}

async fn read_file(root: &Path, rel: &str) -> Response {
    let rel_path = Path::new(rel);
    if rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    }

    let full = root.join(rel_path);
    match tokio::fs::read(&full).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, guess_content_type(rel))],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = rel, "page asset not found");
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(e) => {
            warn!(path = rel, "failed to read page asset: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "read error").into_response()
        }
    }
}

fn guess_content_type(path: &str) -> &'static str {
    if path.ends_with(".js") || path.ends_with(".mjs") {
        "application/javascript"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".html") {
        "text/html"
    } else if path.ends_with(".json") || path.ends_with(".map") {
        "application/json"
    } else if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else if path.ends_with(".woff2") {
        "font/woff2"
    } else {
        "application/octet-stream"
    }
}
