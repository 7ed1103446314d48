use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 服务配置（TOML）。示例见 etc/config.toml。
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub preload: PreloadConfig,
    pub cache: CacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DataConfig {
    /// 各 release 目录树的根（canonical store 与分区 coadd 文件都挂在这里）
    pub spectro_redux: String,
    /// 派生的 mmap 层文件所在目录（convert 子命令的输出）
    pub derived_dir: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PreloadConfig {
    /// 启动时预载的 release 白名单；进程生命周期内不刷新
    #[serde(default)]
    pub releases: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    pub path: String,
    /// 响应过期时间（分钟）。0 = 永不过期。
    #[serde(default)]
    pub max_age: i64,
    /// 紧急清空阈值，人类可读写法："500mb"、"10gb"
    #[serde(default = "default_max_size")]
    pub max_size: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6061
}

fn default_max_size() -> String {
    "10gb".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {:?}: {}", path, e))?;
        let mut cfg: Config = toml::from_str(&raw)?;
        cfg.data.spectro_redux = expand_path(&cfg.data.spectro_redux);
        cfg.data.derived_dir = expand_path(&cfg.data.derived_dir);
        cfg.cache.path = expand_path(&cfg.cache.path);
        Ok(cfg)
    }

    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(&self.cache.path)
    }

    pub fn max_cache_size_bytes(&self) -> anyhow::Result<u64> {
        parse_size(&self.cache.max_size)
            .ok_or_else(|| anyhow::anyhow!("invalid cache.max_size: {}", self.cache.max_size))
    }
}

/// `~/...` 与 `$HOME` 风格的展开（只处理前缀 `~`，环境变量交给部署层）。
pub fn expand_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    p.to_string()
}

/// "1gb" / "512mb" / "4kib" -> bytes。未知后缀返回 None。
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_lowercase();
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, suffix) = s.split_at(split);
    let value: f64 = num.trim().parse().ok()?;
    let mult: u64 = match suffix.trim() {
        "b" => 1,
        "kb" | "kib" => 1 << 10,
        "mb" | "mib" => 1 << 20,
        "gb" | "gib" => 1 << 30,
        "tb" | "tib" => 1 << 40,
        _ => return None,
    };
    Some((value * mult as f64) as u64)
}
