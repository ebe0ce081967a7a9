use std::str::FromStr;

use anyhow::anyhow;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Form, Router,
};
use axum_extra::extract::CookieJar;
use image::DynamicImage;
use minijinja::context;
use serde::Deserialize;

use crate::errors::{WebError, WebResult};
use crate::session::{ActiveSession, Sessions, UploadedImage};
use crate::speech::SpeechOutput;
use crate::vision::{self, AnalysisKind, VisionClient};

/// Convert a webp image to a data URL
/// This operates on owned options because that's much more convenient for minijinja filters.
fn webp_to_data_url(bytes: Option<Vec<u8>>) -> Option<String> {
    bytes.map(|b| vision::to_data_url(&b))
}

lazy_static::lazy_static! {
    static ref TEMPLATES: minijinja::Environment<'static> = {
        let mut env = minijinja::Environment::new();
        for (name, template) in &[
            ("index.html.jinja", include_str!("../templates/index.html.jinja")),
            ("base.html.jinja", include_str!("../templates/base.html.jinja")),
        ] {
            env.add_template(name, template)
                .expect("Failed to register template");
        }
        env.add_filter("to_data_url", webp_to_data_url);
        env
    };
}

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub sessions: Sessions,
    pub vision: VisionClient,
    pub speech: SpeechOutput,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // `GET /` goes to `index`
        .route("/", get(index))
        // `POST /upload` goes to `upload_image`
        .route("/upload", post(upload_image))
        // `POST /run` goes to `run_analyses`
        .route("/run", post(run_analyses))
        // `POST /speak/:kind` goes to `speak_result`
        .route("/speak/:kind", post(speak_result))
        // `GET /health` goes to `health`
        .route("/health", get(health))
        // serve static files from the `./static` directory
        .route("/static/*path", get(serve_static))
        // phone photos are routinely larger than the default body limit
        .layer(DefaultBodyLimit::max(32 << 20))
        .layer(
            tower_http::compression::CompressionLayer::new()
                .quality(tower_http::CompressionLevel::Fastest),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// Render the single assistant page for this browser's session
async fn index(
    State(state): State<AppState>,
    jar: CookieJar,
) -> WebResult<(CookieJar, Html<String>)> {
    let (jar, session_id) = state.sessions.ensure(jar);
    let notice = state.sessions.take_notice(session_id);
    let session = state.sessions.read(session_id).unwrap_or_default();
    let page = TEMPLATES.get_template("index.html.jinja")?.render(context! {
        image_webp => session.image.as_ref().map(|i| i.webp.clone()),
        filename => session.image.as_ref().map(|i| i.filename.clone()),
        select_scene => session.is_selected(AnalysisKind::Scene),
        select_text => session.is_selected(AnalysisKind::Text),
        select_objects => session.is_selected(AnalysisKind::Objects),
        scene_description => session.scene_description,
        extracted_text => session.extracted_text,
        object_analysis => session.object_analysis,
        notice => notice,
    })?;
    Ok((jar, Html(page)))
}

// Just reply that everything is okay
async fn health() -> StatusCode {
    StatusCode::OK
}

/// Re-encode an upload as lossy webp for inline display and the model call.
///
/// The webp encoder only takes RGB8/RGBA8, so the decoded image is normalized
/// first.
fn convert_to_webp(img: &DynamicImage, quality: f32) -> anyhow::Result<Vec<u8>> {
    let rgba = img.to_rgba8();
    let img_webp = webp::Encoder::from_rgba(&rgba, rgba.width(), rgba.height()).encode(quality);
    Ok(img_webp.to_vec())
}

/// Decode an uploaded JPEG or PNG into the session's active image.
fn decode_upload(bytes: &[u8], filename: String) -> anyhow::Result<UploadedImage> {
    let format = image::guess_format(bytes)?;
    if !matches!(format, image::ImageFormat::Jpeg | image::ImageFormat::Png) {
        return Err(anyhow!("Only JPEG and PNG images are supported"));
    }
    let img = image::load_from_memory_with_format(bytes, format)?;
    if (img.height() * img.width()) > 2 << 20 {
        tracing::warn!(
            "Image is probably larger than it needs to be. ({h}x{w}) Consider resizing.",
            h = img.height(),
            w = img.width()
        );
    }
    Ok(UploadedImage {
        webp: convert_to_webp(&img, 80.0)?,
        filename,
    })
}

/// Replace the session's active image. Prior analysis results stay on
/// screen until the next run overwrites them.
async fn upload_image(
    State(state): State<AppState>,
    ActiveSession(session_id): ActiveSession,
    mut multipart: Multipart,
) -> WebResult<Redirect> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| WebError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| WebError::BadRequest(e.to_string()))?;
        match decode_upload(&bytes, filename) {
            Ok(image) => {
                tracing::info!("Uploaded image {} ({} bytes)", image.filename, bytes.len());
                state
                    .sessions
                    .with_mut(session_id, |s| s.image = Some(image));
            }
            Err(err) => {
                tracing::warn!("Rejected upload: {:#}", err);
                state.sessions.with_mut(session_id, |s| {
                    s.notice = Some(format!("Could not read that image: {err:#}"))
                });
            }
        }
        return Ok(Redirect::to("/"));
    }
    Err(WebError::BadRequest("No image in the upload".into()))
}

#[derive(Debug, Deserialize)]
struct RunForm {
    #[serde(default)]
    scene: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    objects: Option<String>,
}

impl RunForm {
    fn selection(&self) -> Vec<AnalysisKind> {
        AnalysisKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                AnalysisKind::Scene => self.scene.is_some(),
                AnalysisKind::Text => self.text.is_some(),
                AnalysisKind::Objects => self.objects.is_some(),
            })
            .collect()
    }
}

/// Run the selected analyses against the active image, one after another in
/// a fixed order, overwriting only the selected result fields.
async fn run_analyses(
    State(state): State<AppState>,
    ActiveSession(session_id): ActiveSession,
    Form(form): Form<RunForm>,
) -> WebResult<Redirect> {
    let selection = form.selection();
    let image = state
        .sessions
        .with_mut(session_id, |s| {
            s.selection = selection.clone();
            s.image.clone()
        })
        .flatten();
    // The run control only renders once an image is up, but the route is
    // still reachable directly
    let Some(image) = image else {
        return Ok(Redirect::to("/"));
    };
    for kind in AnalysisKind::ALL {
        if selection.contains(&kind) {
            let result = state.vision.analyze(kind, &image.webp).await;
            state
                .sessions
                .with_mut(session_id, |s| s.set_result(kind, result));
        }
    }
    Ok(Redirect::to("/"))
}

/// Read one result field aloud. Playback failures become an inline notice;
/// the session stays usable.
async fn speak_result(
    State(state): State<AppState>,
    ActiveSession(session_id): ActiveSession,
    Path(kind): Path<String>,
) -> WebResult<Redirect> {
    let kind = AnalysisKind::from_str(&kind).map_err(|_| WebError::NotFound)?;
    let text = state
        .sessions
        .read(session_id)
        .ok_or(WebError::NotFound)?
        .result(kind)
        .to_string();
    if !text.is_empty() {
        if let Err(err) = state.speech.speak(&text).await {
            tracing::warn!("Speech playback failed: {:#}", err);
            state.sessions.with_mut(session_id, |s| {
                s.notice = Some(format!("Text-to-Speech error: {err:#}"))
            });
        }
    }
    Ok(Redirect::to("/"))
}

/// Serve static files from in memory using `include_dir!`
async fn serve_static(Path(path): Path<String>) -> WebResult<impl IntoResponse> {
    let dir = include_dir::include_dir!("$CARGO_MANIFEST_DIR/static");
    let bytes = dir.get_file(&path).ok_or(WebError::NotFound)?.contents();
    let header = (
        "Content-Type",
        match path.split('.').last() {
            Some("css") => "text/css",
            Some("js") => "text/javascript",
            Some("svg") => "image/svg+xml",
            _ => "application/octet-stream",
        },
    );
    Ok(([header], bytes).into_response())
}
