use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use crate::error::ApiError;
use crate::query::request::{ApiRequest, QueryParams, RequestedData, ResponseType};
use crate::query::respond::{self, AppContext};

pub const DOC_URL: &str = "https://github.com/piko-aegis/spectra-api/blob/main/doc/userdoc.md";

/// HTTP 查询服务。路径形态：
/// `/api/v1/<requested_data>/<response_type>/<release>/<endpoint>/<params...>`，
/// 查询串里除保留键外的键值对都当作列过滤条件。
pub struct QueryServer {
    pub ctx: Arc<AppContext>,
}

impl QueryServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, host: &str, port: u16) -> anyhow::Result<()> {
        let app = router(self.ctx);
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
        tracing::info!("HTTP query server listening on {}:{}", host, port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(show_doc))
        .route("/api", get(show_doc))
        .route("/api/v1", get(show_doc))
        .route(
            "/api/v1/:requested_data/:response_type/:release/:endpoint/*params",
            get(handle_get),
        )
        .route("/api/v1/post", post(handle_post))
        .with_state(ctx)
}

async fn show_doc() -> Redirect {
    Redirect::temporary(DOC_URL)
}

async fn handle_get(
    Path((requested_data, response_type, release, endpoint, params)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    Query(query): Query<HashMap<String, String>>,
    State(ctx): State<Arc<AppContext>>,
) -> Response {
    let filters: BTreeMap<String, String> = query.into_iter().collect();
    let req = match build_request(&requested_data, &response_type, &release, &endpoint, &params, filters)
    {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    serve_request(ctx, req).await
}

async fn handle_post(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let req = match build_request_from_json(&body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    serve_request(ctx, req).await
}

async fn serve_request(ctx: Arc<AppContext>, req: ApiRequest) -> Response {
    tracing::info!("request: {:?}", req);
    let now = Utc::now();

    // 核心流程是同步阻塞的（层读取 / 过滤 / 合并 / 落盘），丢进阻塞池
    let result = tokio::task::spawn_blocking(move || respond::exec_request(&ctx, &req, now)).await;

    let artifact = match result {
        Ok(Ok(artifact)) => artifact,
        Ok(Err(e)) => return e.into_response(),
        Err(e) => return ApiError::ServerFailed(e.to_string()).into_response(),
    };

    let content_type = match artifact.ext.as_str() {
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    };
    let download_name = format!(
        "spectra_api_{}.{}.{}",
        now.format("%Y-%m-%dT%H:%M:%S"),
        artifact.kind,
        artifact.ext
    );
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download_name),
            ),
        ],
        artifact.bytes,
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MalformedQuery(_) => StatusCode::BAD_REQUEST,
            ApiError::DataNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::CacheWrite { .. } | ApiError::ServerFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "Error": self.to_string(),
            "Help": format!("See {} for an overview of request syntax", DOC_URL),
        });
        (status, Json(body)).into_response()
    }
}

/// URL 路径段 → 结构化请求。
pub fn build_request(
    requested_data: &str,
    response_type: &str,
    release: &str,
    endpoint: &str,
    params: &str,
    filters: BTreeMap<String, String>,
) -> Result<ApiRequest, ApiError> {
    let requested_data = RequestedData::parse(requested_data)?;
    let response_type = ResponseType::parse(response_type)?;
    let params = build_params_from_path(endpoint, params)?;
    Ok(ApiRequest {
        requested_data,
        response_type,
        release: release.to_lowercase(),
        params,
        filters,
    })
}

fn build_params_from_path(endpoint: &str, params: &str) -> Result<QueryParams, ApiError> {
    let params = params.trim_matches('/');
    match endpoint.to_lowercase().as_str() {
        "radec" => {
            let v = parse_list_float(params)?;
            match v.as_slice() {
                &[ra, dec, radius] => Ok(QueryParams::Radec { ra, dec, radius }),
                _ => Err(ApiError::malformed(
                    "radec endpoint expects <ra>,<dec>,<radius>",
                )),
            }
        }
        "targets" => Ok(QueryParams::Targets {
            target_ids: parse_list_int(params)?,
        }),
        "tile" => {
            let (tile, fibers) = params.split_once('/').ok_or_else(|| {
                ApiError::malformed("tile endpoint expects <tile>/<fiber,fiber,...>")
            })?;
            Ok(QueryParams::Tile {
                tile: tile
                    .parse()
                    .map_err(|_| ApiError::malformed(format!("invalid tile id {}", tile)))?,
                fibers: parse_list_int(fibers)?,
            })
        }
        other => Err(ApiError::malformed(format!(
            "endpoint must be one of TILE, TARGETS, RADEC, not {}",
            other
        ))),
    }
}

/// POST 负载：参数键之外的键值对都是过滤条件。
pub fn build_request_from_json(body: &serde_json::Value) -> Result<ApiRequest, ApiError> {
    let obj = body
        .as_object()
        .ok_or_else(|| ApiError::malformed("payload must be a JSON object"))?;

    let field = |name: &str| -> Result<&str, ApiError> {
        obj.get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApiError::malformed(format!("missing field {}", name)))
    };

    let requested_data = RequestedData::parse(field("requested_data")?)?;
    let response_type = ResponseType::parse(field("response_type")?)?;
    let release = field("release")?.to_lowercase();
    let endpoint = field("endpoint")?;
    let params = obj
        .get("params")
        .ok_or_else(|| ApiError::malformed("missing field params"))?;
    let params = build_params_from_json(endpoint, params)?;

    const PARAM_KEYS: &[&str] = &[
        "requested_data",
        "response_type",
        "release",
        "endpoint",
        "params",
    ];
    let mut filters = BTreeMap::new();
    for (k, v) in obj {
        if PARAM_KEYS.contains(&k.as_str()) {
            continue;
        }
        let value = match v {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(ApiError::malformed(format!(
                    "filter {} must be a string, not {}",
                    k, other
                )))
            }
        };
        filters.insert(k.clone(), value);
    }

    Ok(ApiRequest {
        requested_data,
        response_type,
        release,
        params,
        filters,
    })
}

fn build_params_from_json(endpoint: &str, params: &serde_json::Value) -> Result<QueryParams, ApiError> {
    let invalid = || ApiError::malformed(format!("invalid endpoint parameters for {}", endpoint));
    match endpoint.to_lowercase().as_str() {
        "radec" => {
            let get = |k: &str| params.get(k).and_then(|v| v.as_f64()).ok_or_else(invalid);
            Ok(QueryParams::Radec {
                ra: get("ra")?,
                dec: get("dec")?,
                radius: get("radius")?,
            })
        }
        "targets" => {
            let ids = params
                .get("target_ids")
                .and_then(|v| v.as_array())
                .ok_or_else(invalid)?
                .iter()
                .map(|v| v.as_i64().ok_or_else(invalid))
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(QueryParams::Targets { target_ids: ids })
        }
        "tile" => {
            let tile = params.get("tile").and_then(|v| v.as_i64()).ok_or_else(invalid)?;
            let fibers = params
                .get("fibers")
                .and_then(|v| v.as_array())
                .ok_or_else(invalid)?
                .iter()
                .map(|v| v.as_i64().ok_or_else(invalid))
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(QueryParams::Tile { tile, fibers })
        }
        other => Err(ApiError::malformed(format!(
            "endpoint must be one of TILE, TARGETS, RADEC, not {}",
            other
        ))),
    }
}

fn parse_list_int(s: &str) -> Result<Vec<i64>, ApiError> {
    s.split(',')
        .map(|p| {
            p.trim()
                .parse::<i64>()
                .map_err(|_| ApiError::malformed(format!("invalid integer {}", p)))
        })
        .collect()
}

fn parse_list_float(s: &str) -> Result<Vec<f64>, ApiError> {
    s.split(',')
        .map(|p| {
            p.trim()
                .parse::<f64>()
                .map_err(|_| ApiError::malformed(format!("invalid number {}", p)))
        })
        .collect()
}
