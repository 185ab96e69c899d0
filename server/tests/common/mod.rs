#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use schemaforge::{Config, GenerationError, Generator, Runtime};
use schemaforge_server::{build_app_router, AppState, ServerConfig};

pub const BOUNDARY: &str = "schemaforge-test-boundary";

/// A running pipeline plus the router in front of it.
pub struct TestApp {
    pub app: Router,
    runtime: Runtime,
    _temp: TempDir,
}

impl TestApp {
    pub fn start(generator: Arc<dyn Generator>) -> Self {
        Self::start_with(generator, |_| {})
    }

    pub fn start_with(generator: Arc<dyn Generator>, customize: impl FnOnce(&mut Config)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config {
            data_directory: Some(temp.path().to_path_buf()),
            max_download_wait_secs: 10,
            ..Config::default()
        };
        config.queue.poll_interval_ms = 25;
        customize(&mut config);

        let runtime = Runtime::start(config, generator).unwrap();
        let server_config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            request_timeout_secs: 30,
        };
        let app = build_app_router(AppState::from_runtime(&runtime), &server_config);

        Self {
            app,
            runtime,
            _temp: temp,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .method(Method::GET)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn upload(&self, field: &str, filename: Option<&str>, content: &[u8]) -> Response<Body> {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri("/generate-code")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body(field, filename, content)))
                .unwrap(),
        )
        .await
    }

    pub async fn shutdown(self) {
        drop(self.app);
        self.runtime.shutdown().await.unwrap();
    }
}

/// Encodes a single-field `multipart/form-data` body.
pub fn multipart_body(field: &str, filename: Option<&str>, content: &[u8]) -> Vec<u8> {
    let disposition = match filename {
        Some(name) => format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, name
        ),
        None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", field),
    };

    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(disposition.as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
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

/// Writes one `client.ts` per schema.
pub fn echo_generator() -> Arc<dyn Generator> {
    Arc::new(|input: &Path, output: &Path| -> Result<(), GenerationError> {
        let schema = std::fs::read_to_string(input).map_err(|e| GenerationError::new(e.to_string()))?;
        std::fs::write(output.join("client.ts"), format!("// {} bytes\n", schema.len()))
            .map_err(|e| GenerationError::new(e.to_string()))
    })
}

pub fn failing_generator(message: &'static str) -> Arc<dyn Generator> {
    Arc::new(move |_: &Path, _: &Path| -> Result<(), GenerationError> {
        Err(GenerationError::new(message))
    })
}

pub fn slow_generator(delay: Duration) -> Arc<dyn Generator> {
    let inner = echo_generator();
    Arc::new(move |input: &Path, output: &Path| -> Result<(), GenerationError> {
        std::thread::sleep(delay);
        inner.generate(input, output)
    })
}
