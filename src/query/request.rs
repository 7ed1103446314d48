use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// 响应里要的是目录行还是叠好的光谱
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedData {
    Zcat,
    Spectra,
}

impl RequestedData {
    pub fn parse(s: &str) -> Result<Self, ApiError> {
        match s.to_lowercase().as_str() {
            "zcat" => Ok(RequestedData::Zcat),
            "spectra" => Ok(RequestedData::Spectra),
            other => Err(ApiError::malformed(format!(
                "requested_data must be one of ZCAT or SPECTRA, not {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestedData::Zcat => "zcat",
            RequestedData::Spectra => "spectra",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Download,
    Plot,
}

impl ResponseType {
    pub fn parse(s: &str) -> Result<Self, ApiError> {
        match s.to_lowercase().as_str() {
            "download" => Ok(ResponseType::Download),
            "plot" => Ok(ResponseType::Plot),
            other => Err(ApiError::malformed(format!(
                "response_type must be one of DOWNLOAD or PLOT, not {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Download => "download",
            ResponseType::Plot => "plot",
        }
    }
}

/// 三种固定查询形态。构造后不可变。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryParams {
    /// 以 (ra, dec) 为圆心、radius 角秒为半径的位置检索
    Radec { ra: f64, dec: f64, radius: f64 },
    /// 显式 target id 列表（响应保持调用方给出的顺序）
    Targets { target_ids: Vec<i64> },
    /// 单个 tile 加 fiber 子索引
    Tile { tile: i64, fibers: Vec<i64> },
}

impl QueryParams {
    pub fn endpoint(&self) -> &'static str {
        match self {
            QueryParams::Radec { .. } => "radec",
            QueryParams::Targets { .. } => "targets",
            QueryParams::Tile { .. } => "tile",
        }
    }

    /// 规范形：无序输入（id 列表）先排序，保证语义相同的查询收敛到同一个键。
    fn canonical(&self) -> String {
        match self {
            QueryParams::Radec { ra, dec, radius } => format!("{},{},{}", ra, dec, radius),
            QueryParams::Targets { target_ids } => {
                let mut ids = target_ids.clone();
                ids.sort_unstable();
                join_ints(&ids)
            }
            QueryParams::Tile { tile, fibers } => {
                let mut f = fibers.clone();
                f.sort_unstable();
                format!("{}:{}", tile, join_ints(&f))
            }
        }
    }
}

fn join_ints(v: &[i64]) -> String {
    v.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// 一次结构化查询。请求期创建、只读、请求结束即丢弃。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub requested_data: RequestedData,
    pub response_type: ResponseType,
    pub release: String,
    pub params: QueryParams,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

/// 请求体量上限（与公开接口文档一致）
pub const MAX_IDS: usize = 500;
pub const MAX_RADIUS_ARCSEC: f64 = 60.0;

impl ApiRequest {
    /// 确定性缓存键。等价查询（id 乱序、过滤键乱序、release 别名）必须同键。
    pub fn cache_key(&self) -> Result<CacheKey, ApiError> {
        let release = canonise_release_name(&self.release)?;

        // 过滤键按大写规范形升序排；大小写只是写法差异，不参与身份
        let mut pairs: Vec<(String, &String)> = self
            .filters
            .iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        pairs.sort();
        let filters = pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let raw = format!(
            "{}-{}-{}-{}-params-{}-filters-{}",
            self.requested_data.as_str(),
            self.response_type.as_str(),
            release,
            self.params.endpoint(),
            self.params.canonical(),
            filters,
        );
        Ok(CacheKey(sanitise_key(&raw)))
    }

    /// 请求体量与取值校验（在进入核心流程前挡掉）。
    pub fn validate(&self) -> Result<(), ApiError> {
        match &self.params {
            QueryParams::Radec { radius, .. } => {
                if !radius.is_finite() || *radius <= 0.0 {
                    return Err(ApiError::malformed("radius must be a positive number"));
                }
                if *radius > MAX_RADIUS_ARCSEC {
                    return Err(ApiError::malformed(format!(
                        "radius must be <= {} arcseconds",
                        MAX_RADIUS_ARCSEC
                    )));
                }
            }
            QueryParams::Targets { target_ids } => {
                if target_ids.is_empty() {
                    return Err(ApiError::malformed("target_ids must not be empty"));
                }
                if target_ids.len() > MAX_IDS {
                    return Err(ApiError::malformed(format!(
                        "cannot have more than {} target IDs",
                        MAX_IDS
                    )));
                }
                if has_duplicates(target_ids) {
                    return Err(ApiError::malformed("target_ids must be unique"));
                }
            }
            QueryParams::Tile { fibers, .. } => {
                if fibers.is_empty() {
                    return Err(ApiError::malformed("fibers must not be empty"));
                }
                if fibers.len() > MAX_IDS {
                    return Err(ApiError::malformed(format!(
                        "cannot have more than {} fiber IDs",
                        MAX_IDS
                    )));
                }
                if has_duplicates(fibers) {
                    return Err(ApiError::malformed("fibers must be unique"));
                }
            }
        }
        Ok(())
    }
}

fn has_duplicates(v: &[i64]) -> bool {
    let mut sorted = v.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).any(|w| w[0] == w[1])
}

/// 确定性路径段净化：去掉对底层存储不安全的字符
/// （括号/花括号/方括号/空白/引号）。净化前相等的键净化后仍相等。
fn sanitise_key(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | ' ' | '\t' | '\'' | '"'))
        .collect()
}

/// 缓存键：可直接用作缓存根下的目录名。
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// release 名称规范化。历史别名映射到生产名；其余要求是合法标识符
/// （字母/数字/下划线、非数字开头），否则 MalformedQuery。
pub fn canonise_release_name(release: &str) -> Result<String, ApiError> {
    let lower = release.to_lowercase();
    let translated = match lower.as_str() {
        "edr" => "fuji",
        "dr1" => "iron",
        other => other,
    };
    let mut chars = translated.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(translated.to_string())
    } else {
        Err(ApiError::malformed(format!(
            "release must be alphanumeric, cannot be {}",
            release
        )))
    }
}
