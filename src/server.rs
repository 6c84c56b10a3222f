use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use image::{DynamicImage, ImageError};
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::EditConfig;
use crate::persist::{self, PersistError};
use crate::pipelines::EditRequest;
use crate::service::{EditError, EditService};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

const INDEX_TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>%TITLE%</title>
<style>
body { font-family: sans-serif; margin: 2rem; }
main { display: flex; gap: 2rem; }
section { flex: 1; }
label { display: block; margin: 0.75rem 0 0.25rem; }
img { max-width: 100%; }
</style>
</head>
<body>
<h1>%TITLE% (%RESOLUTION%px)</h1>
<main>
<section>
<form id="edit">
<label for="target">Target</label>
<input id="target" name="target" type="file" accept="image/*">
<label for="reference">Reference (Same as Target = Identity Lock)</label>
<input id="reference" name="reference" type="file" accept="image/*">
<label for="prompt">Prompt</label>
<textarea id="prompt" name="prompt" rows="3" cols="48">%PROMPT%</textarea>
<p><button type="submit">RUN</button> <span id="progress"></span></p>
</form>
</section>
<section>
<label>Result</label>
<img id="result" alt="">
<p><a href="/static/result.jpg" download>Download Result</a></p>
</section>
</main>
<script>
const form = document.getElementById("edit");
const progress = document.getElementById("progress");
const result = document.getElementById("result");
form.addEventListener("submit", async (event) => {
  event.preventDefault();
  progress.textContent = "running...";
  const response = await fetch("/edit", { method: "POST", body: new FormData(form) });
  if (response.status === 204) {
    result.removeAttribute("src");
    progress.textContent = "";
    return;
  }
  if (!response.ok) {
    progress.textContent = await response.text();
    return;
  }
  result.src = URL.createObjectURL(await response.blob());
  progress.textContent = "";
});
</script>
</body>
</html>
"#;

#[derive(Clone)]
struct AppState {
    service: Arc<EditService>,
    page: Arc<String>,
}

/// Builds the form page, the edit endpoint and static serving of the result directory.
pub fn router(service: Arc<EditService>, config: &EditConfig) -> Router {
    let page = INDEX_TEMPLATE
        .replace("%TITLE%", &escape_html(&config.title))
        .replace("%RESOLUTION%", &config.resolution.to_string())
        .replace("%PROMPT%", &escape_html(&config.default_prompt));
    let results = ServeDir::new(service.result_dir());

    Router::new()
        .route("/", get(index))
        .route("/edit", post(edit))
        .nest_service("/static", results)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            service,
            page: Arc::new(page),
        })
}

pub async fn serve(router: Router, addr: SocketAddr) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router).await
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(state.page.as_ref().clone())
}

async fn edit(State(state): State<AppState>, multipart: Multipart) -> Result<Response, ServerError> {
    let request = read_request(multipart).await?;
    let service = state.service.clone();

    let jpeg = tokio::task::spawn_blocking(move || -> Result<_, ServerError> {
        let Some(image) = service.process(request)? else {
            return Ok(None);
        };
        let mut bytes: Vec<u8> = vec![];
        persist::encode_jpeg(&image, &mut bytes)?;
        Ok(Some(bytes))
    })
    .await??;

    Ok(match jpeg {
        Some(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn read_request(mut multipart: Multipart) -> Result<EditRequest, ServerError> {
    let mut request = EditRequest::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "target" => request.target = decode_upload(&field.bytes().await?)?,
            "reference" => request.reference = decode_upload(&field.bytes().await?)?,
            "prompt" => request.instruction = field.text().await?,
            _ => {}
        }
    }
    Ok(request)
}

/// An empty upload field means no file was chosen.
fn decode_upload(bytes: &[u8]) -> Result<Option<DynamicImage>, ImageError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    image::load_from_memory(bytes).map(Some)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("malformed form data: {0}")]
    Multipart(#[from] MultipartError),
    #[error("unreadable image upload: {0}")]
    Upload(#[from] ImageError),
    #[error("{0}")]
    Edit(#[from] EditError),
    #[error("{0}")]
    Encode(#[from] PersistError),
    #[error("edit task failed: {0}")]
    Join(#[from] JoinError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Multipart(_) | Self::Upload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "edit request failed");
        } else {
            warn!(error = %self, "rejected edit request");
        }
        (status, self.to_string()).into_response()
    }
}
