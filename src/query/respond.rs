use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::cache::ResponseCache;
use crate::catalog::table::{ColumnData, Table};
use crate::catalog::{zcat, CatalogService};
use crate::error::ApiError;
use crate::query::request::{ApiRequest, RequestedData, ResponseType};
use crate::spectra;

/// zcat 响应的缺省输出格式
pub const DEFAULT_FILETYPE: &str = "json";

/// 请求处理的共享上下文（进程级，worker 间共享只读）。
pub struct AppContext {
    pub catalog: CatalogService,
    pub cache: ResponseCache,
    pub cache_max_age: Duration,
}

/// 一次响应：字节 + 种类标签 + 扩展名。缓存写失败时 cached_path 为 None，
/// 字节照常交付。
#[derive(Debug)]
pub struct ResponseArtifact {
    pub bytes: Vec<u8>,
    pub kind: String,
    pub ext: String,
    pub cached_path: Option<PathBuf>,
}

/// 目录行查询入口：解析 → 层级加载 → 行选择 → 过滤。
pub fn get_rows(svc: &CatalogService, req: &ApiRequest) -> Result<Table, ApiError> {
    zcat::handle_zcatalog(svc, req)
}

/// 派生制品查询入口：目录行之上按需取谱、合并、编码。
pub fn get_artifact(
    svc: &CatalogService,
    req: &ApiRequest,
) -> Result<(Vec<u8>, String, String), ApiError> {
    match req.requested_data {
        RequestedData::Zcat => {
            let rows = get_rows(svc, req)?;
            let (bytes, ext) = encode_zcat(&rows, &req.filters)?;
            Ok((bytes, "zcat".to_string(), ext))
        }
        RequestedData::Spectra => {
            let stacked = spectra::handle_spectra(svc, req)?;
            let bytes = bincode::serialize(&stacked)
                .map_err(|e| ApiError::ServerFailed(format!("unable to encode spectra: {}", e)))?;
            Ok((bytes, "spectra".to_string(), "bin".to_string()))
        }
    }
}

/// 完整请求流程：缓存命中直接回放，miss 则计算并尝试落盘。
///
/// 同键并发 miss 会重复计算、各自写一个时间戳文件——设计如此，
/// 不做进程内去重。落盘失败只记日志，制品照常返回。
pub fn exec_request(
    ctx: &AppContext,
    req: &ApiRequest,
    now: DateTime<Utc>,
) -> Result<ResponseArtifact, ApiError> {
    if req.response_type == ResponseType::Plot {
        return Err(ApiError::malformed("plot rendering is not supported"));
    }
    req.validate()?;
    // 过滤串必须在进缓存之前就能解析；坏请求不允许留下缓存痕迹
    crate::query::filter::compile_filters(&req.filters)?;
    let key = req.cache_key()?;

    if let Some(path) = ctx.cache.lookup(&key, now, ctx.cache_max_age) {
        // 并发清理可能刚删掉这个文件：读失败按 miss 继续
        match std::fs::read(&path) {
            Ok(bytes) => {
                if let Some((kind, ext)) = kind_and_ext(&path) {
                    tracing::info!("cache hit for {}", key);
                    return Ok(ResponseArtifact {
                        bytes,
                        kind,
                        ext,
                        cached_path: Some(path),
                    });
                }
            }
            Err(e) => tracing::debug!("cached entry vanished ({}), recomputing", e),
        }
    }
    tracing::info!("cache miss for {}, rebuilding", key);

    let (bytes, kind, ext) = get_artifact(&ctx.catalog, req)?;
    let cached_path = match ctx.cache.store(&key, &bytes, &kind, &ext, now) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!("{}", e);
            None
        }
    };

    Ok(ResponseArtifact {
        bytes,
        kind,
        ext,
        cached_path,
    })
}

fn kind_and_ext(path: &Path) -> Option<(String, String)> {
    let name = path.file_name()?.to_str()?;
    let mut it = name.rsplitn(3, '.');
    let ext = it.next()?.to_string();
    let kind = it.next()?.to_string();
    it.next()?;
    Some((kind, ext))
}

/// zcat 表编码。格式由保留过滤键 `filetype` 挑选：json（缺省）/ bin / csv。
fn encode_zcat(
    table: &Table,
    filters: &BTreeMap<String, String>,
) -> Result<(Vec<u8>, String), ApiError> {
    let filetype = filters
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("filetype"))
        .map(|(_, v)| v.to_lowercase())
        .unwrap_or_else(|| DEFAULT_FILETYPE.to_string());

    let bytes = match filetype.as_str() {
        "json" => serde_json::to_vec(&table_to_json(table))
            .map_err(|e| ApiError::ServerFailed(format!("unable to encode rows: {}", e)))?,
        "bin" => bincode::serialize(table)
            .map_err(|e| ApiError::ServerFailed(format!("unable to encode rows: {}", e)))?,
        "csv" => table_to_csv(table).into_bytes(),
        other => {
            return Err(ApiError::malformed(format!(
                "invalid filetype requested: {}",
                other
            )))
        }
    };
    Ok((bytes, filetype))
}

/// 行数组形式（每行一个 {列名: 值} 对象），列序与表一致。
pub fn table_to_json(table: &Table) -> serde_json::Value {
    let mut rows = Vec::with_capacity(table.n_rows());
    for i in 0..table.n_rows() {
        let mut obj = serde_json::Map::new();
        for col in table.columns() {
            let v = match &col.data {
                ColumnData::Int(v) => serde_json::json!(v[i]),
                ColumnData::Float(v) => serde_json::json!(v[i]),
                ColumnData::Str(v) => serde_json::json!(v[i]),
                ColumnData::Bool(v) => serde_json::json!(v[i]),
            };
            obj.insert(col.name.clone(), v);
        }
        rows.push(serde_json::Value::Object(obj));
    }
    serde_json::Value::Array(rows)
}

fn table_to_csv(table: &Table) -> String {
    let mut out = String::new();
    out.push_str(&table.column_names().join(","));
    out.push('\n');
    for i in 0..table.n_rows() {
        let cells: Vec<String> = table
            .columns()
            .iter()
            .map(|col| match &col.data {
                ColumnData::Int(v) => v[i].to_string(),
                ColumnData::Float(v) => v[i].to_string(),
                ColumnData::Str(v) => v[i].clone(),
                ColumnData::Bool(v) => v[i].to_string(),
            })
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}
