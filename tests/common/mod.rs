#![allow(dead_code)]

use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use image::{imageops::FilterType, DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;
use tower::ServiceExt;

use image_gateway::{
    processor::{ExternalProcessor, ProcessError, ProcessOutput},
    router, storage, AppState, Config,
};

pub const HOST: &str = "localhost:3000";

/// Resizes the input by the scale factor it is given, like the real upscaler.
pub struct Resize;

#[async_trait]
impl ExternalProcessor for Resize {
    fn name(&self) -> String {
        "resize".to_string()
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        params: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        let scale: u32 = params[0].parse().unwrap();
        let bytes = std::fs::read(input).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        img.resize_exact(img.width() * scale, img.height() * scale, FilterType::Nearest)
            .save_with_format(output, ImageFormat::Png)
            .unwrap();
        Ok(ProcessOutput::default())
    }
}

/// Copies input to output unchanged.
pub struct Passthrough;

#[async_trait]
impl ExternalProcessor for Passthrough {
    fn name(&self) -> String {
        "passthrough".to_string()
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        _params: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        std::fs::copy(input, output).unwrap();
        Ok(ProcessOutput::default())
    }
}

/// Writes half a file and then reports failure.
pub struct Crash;

#[async_trait]
impl ExternalProcessor for Crash {
    fn name(&self) -> String {
        "crash".to_string()
    }

    async fn run(
        &self,
        _input: &Path,
        output: &Path,
        _params: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        std::fs::write(output, b"\x89PNG half written").unwrap();
        Err(ProcessError::Failed {
            program: self.name(),
            code: Some(1),
            stderr: "RuntimeError: model weights missing".to_string(),
        })
    }
}

/// Copies input to output after a delay, and records that it got that far.
pub struct Slow {
    delay: Duration,
    finished: AtomicBool,
}

impl Slow {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            finished: AtomicBool::new(false),
        })
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalProcessor for Slow {
    fn name(&self) -> String {
        "slow".to_string()
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        _params: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        tokio::time::sleep(self.delay).await;
        std::fs::copy(input, output).unwrap();
        self.finished.store(true, Ordering::SeqCst);
        Ok(ProcessOutput::default())
    }
}

/// Counts invocations of the processor it wraps.
pub struct Counting<P> {
    inner: P,
    calls: AtomicUsize,
}

impl<P> Counting<P> {
    pub fn new(inner: P) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: ExternalProcessor> ExternalProcessor for Counting<P> {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn run(
        &self,
        input: &Path,
        output: &Path,
        params: &[String],
    ) -> Result<ProcessOutput, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run(input, output, params).await
    }
}

pub struct Gateway {
    pub app: Router,
    pub config: Config,
    _root: TempDir,
}

impl Gateway {
    pub async fn new(
        upscaler: Arc<dyn ExternalProcessor>,
        background_remover: Arc<dyn ExternalProcessor>,
        converter: Arc<dyn ExternalProcessor>,
    ) -> Self {
        Self::with_config(upscaler, background_remover, converter, |_| ()).await
    }

    pub async fn with_config(
        upscaler: Arc<dyn ExternalProcessor>,
        background_remover: Arc<dyn ExternalProcessor>,
        converter: Arc<dyn ExternalProcessor>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config {
            upload_dir: root.path().join("uploads"),
            processed_dir: root.path().join("processed_images"),
            converted_dir: root.path().join("converted"),
            ..Config::default()
        };
        tweak(&mut config);
        storage::prepare_directories(&config).await.unwrap();

        let state = AppState::new(config.clone(), upscaler, background_remover, converter);
        Self {
            app: router(state),
            config,
            _root: root,
        }
    }

    pub fn working() -> (Arc<Counting<Resize>>, Arc<Counting<Passthrough>>, Arc<Counting<Passthrough>>) {
        (
            Counting::new(Resize),
            Counting::new(Passthrough),
            Counting::new(Passthrough),
        )
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        self.send(
            Request::get(path)
                .header(header::HOST, HOST)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        entries(&self.config.upload_dir)
    }

    pub fn processed(&self) -> Vec<PathBuf> {
        entries(&self.config.processed_dir)
    }

    pub fn converted(&self) -> Vec<PathBuf> {
        entries(&self.config.converted_dir)
    }
}

pub fn entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|dir| dir.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 90, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Hand-built multipart/form-data body.
pub struct Form {
    boundary: &'static str,
    body: Vec<u8>,
}

impl Form {
    pub fn new() -> Self {
        Self {
            boundary: "gateway-test-boundary-7MA4YWxkTrZu0gW",
            body: Vec::new(),
        }
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn image(self, data: &[u8]) -> Self {
        self.file("image", "photo.png", "image/png", data)
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self
    }

    pub fn post(mut self, uri: &str) -> Request<Body> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());

        Request::post(uri)
            .header(header::HOST, HOST)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", self.boundary),
            )
            .body(Body::from(self.body))
            .unwrap()
    }
}
