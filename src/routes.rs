use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::HeaderMap,
    response::{Html, Response},
    routing::{get, post},
    Router,
};
use tokio::sync::Semaphore;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::{
    config::Config,
    delivery::{self, DeliveryMode, PROCESSED_ROUTE},
    error::AppError,
    job::{Job, Operation},
    processor::{CommandProcessor, ExternalProcessor},
    upload::{self, Upload},
};

/// Slack on top of the file ceiling for multipart framing and text fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upscaler: Arc<dyn ExternalProcessor>,
    pub background_remover: Arc<dyn ExternalProcessor>,
    pub converter: Arc<dyn ExternalProcessor>,
    admission: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(
        config: Config,
        upscaler: Arc<dyn ExternalProcessor>,
        background_remover: Arc<dyn ExternalProcessor>,
        converter: Arc<dyn ExternalProcessor>,
    ) -> Self {
        let admission = (config.max_concurrent_jobs > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_jobs)));

        Self {
            config: Arc::new(config),
            upscaler,
            background_remover,
            converter,
            admission,
        }
    }

    /// Binds every route to the external command configured for it.
    pub fn from_config(config: Config) -> Self {
        let timeout = config.process_timeout;
        let upscaler = CommandProcessor::python_script(&config.python_bin, &config.upscale_script)
            .with_timeout(timeout);
        let background_remover =
            CommandProcessor::python_script(&config.python_bin, &config.remove_bg_script)
                .with_timeout(timeout);
        let converter = CommandProcessor::new(&config.convert_bin).with_timeout(timeout);

        Self::new(
            config,
            Arc::new(upscaler),
            Arc::new(background_remover),
            Arc::new(converter),
        )
    }

    fn job(&self, operation: Operation, params: Vec<String>) -> Job {
        let processor = match operation {
            Operation::Upscale => &self.upscaler,
            Operation::RemoveBackground => &self.background_remover,
            Operation::Convert => &self.converter,
        };

        Job {
            operation,
            processor: processor.clone(),
            output_dir: self.config.output_dir(self.delivery(operation)).clone(),
            params,
            admission: self.admission.clone(),
        }
    }

    fn delivery(&self, operation: Operation) -> DeliveryMode {
        match operation {
            Operation::Upscale => self.config.upscale_delivery,
            Operation::RemoveBackground => self.config.remove_bg_delivery,
            Operation::Convert => self.config.convert_delivery,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let processed = ServeDir::new(&state.config.processed_dir);
    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/", get(get_root))
        .route("/upscale", post(post_upscale))
        .route("/upload", post(post_remove_background))
        .route("/convert", post(post_convert))
        .nest_service(PROCESSED_ROUTE, processed)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_root() -> Html<&'static str> {
    Html("Image gateway is running")
}

async fn post_upscale(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let base = delivery::base_url(&state.config, &headers)?;
    let form = receive(&state, &mut multipart).await?;

    let scale = match parse_scale_factor(form.field("scaleFactor"), state.config.max_scale_factor) {
        Ok(scale) => scale,
        Err(err) => {
            form.upload.release().await;
            return Err(err);
        }
    };

    process(&state, Operation::Upscale, vec![scale.to_string()], form.upload, &base).await
}

/// Background removal; the path is kept for existing clients.
async fn post_remove_background(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let base = delivery::base_url(&state.config, &headers)?;
    let form = receive(&state, &mut multipart).await?;
    process(&state, Operation::RemoveBackground, Vec::new(), form.upload, &base).await
}

async fn post_convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let base = delivery::base_url(&state.config, &headers)?;
    let form = receive(&state, &mut multipart).await?;
    process(&state, Operation::Convert, Vec::new(), form.upload, &base).await
}

async fn receive(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<upload::UploadForm, AppError> {
    let config = &state.config;
    Ok(upload::receive(multipart, &config.upload_dir, config.max_upload_bytes).await?)
}

async fn process(
    state: &AppState,
    operation: Operation,
    params: Vec<String>,
    upload: Upload,
    base: &str,
) -> Result<Response, AppError> {
    let artifact = state.job(operation, params).dispatch(upload).await?;

    match state.delivery(operation) {
        DeliveryMode::Link => Ok(delivery::link(artifact, base)),
        DeliveryMode::Stream => delivery::stream(artifact).await,
    }
}

/// Whole numbers from 1 to `max` inclusive.
fn parse_scale_factor(raw: Option<&str>, max: u32) -> Result<u32, AppError> {
    let invalid = || AppError::BadRequest("Invalid scale factor".to_string());

    let scale: u32 = raw
        .map(str::trim)
        .ok_or_else(invalid)?
        .parse()
        .map_err(|_| invalid())?;

    match scale {
        0 => Err(invalid()),
        scale if scale > max => Err(AppError::BadRequest(format!(
            "Invalid scale factor: must be at most {max}"
        ))),
        scale => Ok(scale),
    }
}
