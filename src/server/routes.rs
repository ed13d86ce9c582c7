//! Route handlers.
//!
//! - `GET /`               upload form
//! - `POST /upload`        accept a PDF, redirect to its status
//! - `GET /view/:id`       job status (also at `/api/jobs/:id`)
//! - `GET /pdf/:id`        the uploaded PDF
//! - `GET /ocr/:id.json`   the OCR result artifact
//! - `GET /healthz`        liveness

use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use schemars::JsonSchema;
use serde::Serialize;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    jobs::JobStatus,
    ocr::{DocumentResult, flat_text},
};

use super::{AppState, error::AppError};

/// Multipart field holding the uploaded document.
const DOCUMENT_FIELD: &str = "pdf";

static INDEX_HTML: &str = include_str!("index.html");

/// The body of a job status response.
#[derive(Debug, JsonSchema, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatusResponse {
    /// Still working. Poll again.
    Processing { id: String },

    /// Finished. `text` is every detection's text, one per line.
    Done {
        id: String,
        pages: DocumentResult,
        text: String,
    },

    /// The job failed with `error`.
    Failed { id: String, error: String },
}

/// GET /
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /healthz
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /upload
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Redirect, AppError> {
    let mut document: Option<Bytes> = None;
    let mut filename: Option<String> = None;
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        if name == DOCUMENT_FIELD {
            filename = field.file_name().map(str::to_owned);
            document = Some(field.bytes().await?);
        } else {
            fields.insert(name, field.text().await?);
        }
    }

    let orchestrator = state.orchestrator.clone();
    let id = spawn_blocking_propagating_panics(move || {
        orchestrator.submit_form(document.as_deref(), filename.as_deref(), &fields)
    })
    .await?;
    Ok(Redirect::to(&format!("/view/{id}")))
}

/// GET /view/:id and GET /api/jobs/:id
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let orchestrator = state.orchestrator.clone();
    let lookup_id = id.clone();
    let status =
        spawn_blocking_propagating_panics(move || orchestrator.status(&lookup_id)).await?;
    let response = match status {
        JobStatus::NotFound => return Err(AppError::NotFound(format!("no job {id:?}"))),
        JobStatus::Processing => (
            StatusCode::ACCEPTED,
            Json(JobStatusResponse::Processing { id }),
        ),
        JobStatus::Done(pages) => {
            let text = flat_text(&pages);
            (
                StatusCode::OK,
                Json(JobStatusResponse::Done { id, pages, text }),
            )
        }
        JobStatus::Failed(error) => {
            (StatusCode::OK, Json(JobStatusResponse::Failed { id, error }))
        }
    };
    Ok(response.into_response())
}

/// GET /pdf/:id
pub async fn document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let path = state
        .orchestrator
        .document_path(&id)
        .ok_or_else(|| AppError::NotFound(format!("no document for job {id:?}")))?;
    send_file(&path, "application/pdf").await
}

/// GET /ocr/:id.json
pub async fn result_json(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    let not_found = || AppError::NotFound(format!("no OCR result {file:?}"));
    let id = file.strip_suffix(".json").ok_or_else(not_found)?;
    let path = state.orchestrator.result_path(id).ok_or_else(not_found)?;
    send_file(&path, "application/json").await
}

/// Respond with the contents of `path`.
async fn send_file(
    path: &std::path::Path,
    content_type: &'static str,
) -> Result<Response, AppError> {
    let data = tokio::fs::read(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("{} is gone", path.display()))
        } else {
            AppError::Internal(
                anyhow::Error::new(err)
                    .context(format!("failed to read {:?}", path.display())),
            )
        }
    })?;
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}
