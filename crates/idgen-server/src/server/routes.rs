//! HTTP routes over [`IdentifierSourceService`].
//!
//! Every handler names the source it acts on in its path; nothing is kept
//! between requests.

use crate::server::error::ApiError;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use idgen::{
    Error, IdentifierSource, IdentifierSourceService, IdentifierType, LogEntry, PoolStatus,
    SourceId, SourceKindTag, parse_upload, write_identifiers,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

type ApiResult<T> = Result<T, ApiError>;

pub fn router(service: IdentifierSourceService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", get(list_sources).post(save_source))
        .route("/sources/types", get(source_types))
        .route("/sources/{id}", get(source_details).delete(purge_source))
        .route("/sources/{id}/retire", post(retire_source))
        .route("/sources/{id}/unretire", post(unretire_source))
        .route("/sources/{id}/generate", post(generate))
        .route("/sources/{id}/export", post(export))
        .route("/sources/{id}/pool/upload", post(upload_to_pool))
        .route("/sources/{id}/pool/refill", post(refill_pool))
        .route("/sources/{id}/log", get(log_entries))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(service)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_retired: bool,
}

async fn list_sources(
    State(service): State<IdentifierSourceService>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<BTreeMap<IdentifierType, Vec<IdentifierSource>>>> {
    Ok(Json(
        service.get_identifier_sources_by_type(query.include_retired)?,
    ))
}

#[derive(Serialize)]
struct SourceType {
    #[serde(rename = "type")]
    tag: SourceKindTag,
    description: &'static str,
}

async fn source_types(State(service): State<IdentifierSourceService>) -> Json<Vec<SourceType>> {
    Json(
        service
            .get_identifier_source_types()
            .iter()
            .map(|&tag| SourceType {
                tag,
                description: tag.description(),
            })
            .collect(),
    )
}

async fn save_source(
    State(service): State<IdentifierSourceService>,
    Json(source): Json<IdentifierSource>,
) -> ApiResult<(StatusCode, Json<IdentifierSource>)> {
    let status = if source.id.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(service.save_identifier_source(source)?)))
}

#[derive(Serialize)]
struct SourceDetails {
    source: IdentifierSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool: Option<PoolStatus>,
    compatible_sources: Vec<IdentifierSource>,
}

async fn source_details(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
) -> ApiResult<Json<SourceDetails>> {
    let source = service.get_identifier_source(id)?;
    let pool = match source.as_pool() {
        Some(_) => Some(service.pool_status(id).await?),
        None => None,
    };
    let compatible_sources = service.compatible_sources(&source)?;
    Ok(Json(SourceDetails {
        source,
        pool,
        compatible_sources,
    }))
}

async fn purge_source(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
) -> ApiResult<StatusCode> {
    service.purge_identifier_source(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RetireRequest {
    reason: String,
}

async fn retire_source(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
    Json(request): Json<RetireRequest>,
) -> ApiResult<Json<IdentifierSource>> {
    Ok(Json(service.retire_identifier_source(id, &request.reason)?))
}

async fn unretire_source(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
) -> ApiResult<Json<IdentifierSource>> {
    Ok(Json(service.unretire_identifier_source(id)?))
}

#[derive(Deserialize)]
struct GenerateQuery {
    #[serde(default)]
    comment: String,
}

async fn generate(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
    Query(query): Query<GenerateQuery>,
) -> ApiResult<String> {
    Ok(service.generate_identifier(id, &query.comment).await?)
}

#[derive(Deserialize)]
struct ExportQuery {
    number_to_generate: usize,
    #[serde(default)]
    comment: String,
}

async fn export(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<impl IntoResponse> {
    let ids = service
        .generate_identifiers(id, query.number_to_generate, &query.comment)
        .await?;

    let mut body = Vec::with_capacity(ids.iter().map(|id| id.len() + 1).sum());
    write_identifiers(&mut body, &ids).map_err(|e| Error::Storage(e.to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=identifiers.txt",
            ),
        ],
        body,
    ))
}

#[derive(Serialize)]
struct Added {
    added: usize,
}

async fn upload_to_pool(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
    contents: String,
) -> ApiResult<Json<Added>> {
    let added = service
        .add_identifiers_to_pool(id, parse_upload(&contents))
        .await?;
    Ok(Json(Added { added }))
}

#[derive(Deserialize)]
struct RefillQuery {
    batch_size: Option<usize>,
}

async fn refill_pool(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
    Query(query): Query<RefillQuery>,
) -> ApiResult<Json<Added>> {
    let batch_size = match query.batch_size {
        Some(size) => size,
        None => service
            .get_identifier_source(id)?
            .as_pool()
            .map_or(0, |pool| pool.refill_batch_size),
    };
    let added = service.add_identifiers_from_source(id, batch_size).await?;
    Ok(Json(Added { added }))
}

async fn log_entries(
    State(service): State<IdentifierSourceService>,
    Path(id): Path<SourceId>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    service.get_identifier_source(id)?;
    Ok(Json(service.log_entries(id)?))
}
