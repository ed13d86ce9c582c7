//! The HTTP job status service.

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::jobs::JobOrchestrator;

pub mod error;
pub mod routes;

pub use self::routes::JobStatusResponse;

/// Default cap on request bodies: 5 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<JobOrchestrator>,
}

/// Build the application router.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/healthz", get(routes::healthz))
        .route("/upload", post(routes::upload))
        .route("/view/:id", get(routes::job_status))
        .route("/api/jobs/:id", get(routes::job_status))
        .route("/pdf/:id", get(routes::document))
        .route("/ocr/:file", get(routes::result_json))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use tower::ServiceExt as _;

    use super::*;
    use crate::{
        jobs::tests::{Harness, harness},
        prelude::*,
        testing::FAKE_PDF,
    };

    const BOUNDARY: &str = "form-ocr-test-boundary";

    /// Build a `multipart/form-data` body.
    fn multipart_body(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = vec![];
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((filename, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"pdf\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::post("/upload")
            .header(header::CONTENT_LENGTH, body.len())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn app(h: &Harness, max_upload_bytes: usize) -> Router {
        let state = AppState {
            orchestrator: h.orchestrator.clone(),
        };
        router(state, max_upload_bytes)
    }

    /// Upload and return the job's status URL.
    async fn upload(app: &Router, body: Vec<u8>) -> String {
        let response = app.clone().oneshot(upload_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned()
    }

    async fn poll_until_terminal(app: &Router, uri: &str) -> Response {
        for _ in 0..500 {
            let response = get(app, uri).await;
            if response.status() != StatusCode::ACCEPTED {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{uri} never finished");
    }

    #[tokio::test]
    async fn healthz_and_index() {
        let h = harness(None).await;
        let app = app(&h, DEFAULT_MAX_UPLOAD_BYTES);
        let response = get(&app, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"status": "ok"}));

        let response = get(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&html).contains("name=\"pdf\""));
    }

    #[tokio::test]
    async fn upload_then_poll_until_done() {
        let h = harness(None).await;
        let app = app(&h, DEFAULT_MAX_UPLOAD_BYTES);
        let location = upload(
            &app,
            multipart_body(Some(("scan.pdf", FAKE_PDF)), &[("languages", "en"), ("dpi", "200")]),
        )
        .await;
        assert!(location.starts_with("/view/"), "{location}");
        let id = location.trim_start_matches("/view/").to_owned();

        let response = poll_until_terminal(&app, &location).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "done");
        assert_eq!(body["id"], id.as_str());
        assert_eq!(body["pages"].as_array().unwrap().len(), 3);
        assert_eq!(body["pages"][0]["items"][0]["text"], "Name: Jane Doe");
        assert_eq!(body["text"], "Name: Jane Doe");

        // The same status is available under the API path.
        let response = get(&app, &format!("/api/jobs/{id}")).await;
        assert_eq!(json_body(response).await["status"], "done");

        let response = get(&app, &format!("/ocr/{id}.json")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let artifact = json_body(response).await;
        assert_eq!(artifact[0]["page"], 1);

        let response = get(&app, &format!("/pdf/{id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/pdf"
        );
        let pdf = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&pdf[..], FAKE_PDF);

        let manifest = h
            .orchestrator
            .store()
            .open(&id.parse().unwrap())
            .read_manifest()
            .unwrap();
        assert_eq!(manifest.options.dpi, 200);
    }

    #[tokio::test]
    async fn failed_job_reports_error() {
        let h = harness(None).await;
        let app = app(&h, DEFAULT_MAX_UPLOAD_BYTES);
        let location = upload(&app, multipart_body(Some(("scan.pdf", &b"GIF89a"[..])), &[])).await;
        let response = poll_until_terminal(&app, &location).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "failed");
        assert!(body["error"].as_str().unwrap().contains("not a PDF"));

        let id = location.trim_start_matches("/view/");
        let response = get(&app, &format!("/ocr/{id}.json")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn processing_job_is_accepted() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let h = harness(Some(gate.clone())).await;
        let app = app(&h, DEFAULT_MAX_UPLOAD_BYTES);
        let location = upload(&app, multipart_body(Some(("scan.pdf", FAKE_PDF)), &[])).await;
        let response = get(&app, &location).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["status"], "processing");
        gate.add_permits(3);
        let response = poll_until_terminal(&app, &location).await;
        assert_eq!(json_body(response).await["status"], "done");
    }

    #[tokio::test]
    async fn missing_file_is_bad_request() {
        let h = harness(None).await;
        let app = app(&h, DEFAULT_MAX_UPLOAD_BYTES);
        let response = app
            .clone()
            .oneshot(upload_request(multipart_body(None, &[("dpi", "300")])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["message"], "missing file");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let h = harness(None).await;
        let app = app(&h, 1024);
        let big = vec![b'x'; 4096];
        let response = app
            .clone()
            .oneshot(upload_request(multipart_body(Some(("big.pdf", &big[..])), &[])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_jobs_are_404() {
        let h = harness(None).await;
        let app = app(&h, DEFAULT_MAX_UPLOAD_BYTES);
        for uri in [
            "/view/0123456789ab",
            "/api/jobs/not-a-job",
            "/pdf/0123456789ab",
            "/ocr/0123456789ab.json",
            "/ocr/0123456789ab",
        ] {
            assert_eq!(get(&app, uri).await.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }
}
