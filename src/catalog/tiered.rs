use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::mmap_table::MappedTable;
use crate::catalog::preload::PreloadCache;
use crate::catalog::release::{ReleaseLayout, TableKind};
use crate::catalog::store;
use crate::catalog::table::Table;
use crate::config::DataConfig;
use crate::error::ApiError;

/// 层级目录加载：预载缓存 → mmap 定宽二进制 → canonical 存储（ground truth）。
///
/// 层按性能排序而不是按正确性排序：同一 release 的各层在语义上等价，
/// 任何一层都可以独立服务任何请求。层内部的 I/O / 解码错误一律按该层
/// miss 处理并继续向下，只有全部层耗尽才是可上报的失败。
pub struct CatalogService {
    data_root: PathBuf,
    derived_dir: PathBuf,
    preload: Arc<PreloadCache>,
    /// 已打开的 mmap 句柄（进程内共享；convert 重跑换文件后按 stat 失效重开）
    mapped: RwLock<HashMap<PathBuf, Arc<MappedTable>>>,
}

impl CatalogService {
    pub fn new(cfg: &DataConfig, preload: Arc<PreloadCache>) -> Self {
        Self {
            data_root: PathBuf::from(&cfg.spectro_redux),
            derived_dir: PathBuf::from(&cfg.derived_dir),
            preload,
            mapped: RwLock::new(HashMap::new()),
        }
    }

    pub fn release(&self, canonical_name: &str) -> ReleaseLayout {
        ReleaseLayout::new(&self.data_root, &self.derived_dir, canonical_name)
    }

    /// 按层序解析 `(release, kind)` 的目录表，投影到 desired 列。
    /// 任何层返回缺列的表都算该层 miss —— 不允许静默吐出残缺结果。
    pub fn resolve(
        &self,
        release: &ReleaseLayout,
        kind: TableKind,
        desired: &[String],
    ) -> Result<Arc<Table>, ApiError> {
        let desired: Vec<String> = {
            let mut seen = std::collections::HashSet::new();
            desired
                .iter()
                .map(|s| s.to_uppercase())
                .filter(|s| seen.insert(s.clone()))
                .collect()
        };

        match self.preload.probe(&release.name, kind, &desired) {
            Ok(table) => {
                tracing::debug!("preload hit for {}/{:?}", release.name, kind);
                return Ok(table);
            }
            Err(e) => tracing::debug!("preload miss for {}/{:?}: {}", release.name, kind, e),
        }

        match self.probe_mmap(release, kind, &desired) {
            Ok(table) => {
                tracing::debug!("mmap tier hit for {}/{:?}", release.name, kind);
                return Ok(Arc::new(table));
            }
            Err(e) => tracing::debug!("mmap tier miss for {}/{:?}: {}", release.name, kind, e),
        }

        match self.probe_canonical(release, kind, &desired) {
            Ok(table) => {
                tracing::debug!("canonical store hit for {}/{:?}", release.name, kind);
                Ok(Arc::new(table))
            }
            Err(e) => {
                tracing::warn!(
                    "all tiers exhausted for {}/{:?}: {}",
                    release.name,
                    kind,
                    e
                );
                Err(ApiError::not_found(format!(
                    "unable to read {:?} catalog for release {}",
                    kind, release.name
                )))
            }
        }
    }

    fn probe_mmap(
        &self,
        release: &ReleaseLayout,
        kind: TableKind,
        desired: &[String],
    ) -> anyhow::Result<Table> {
        let data_path = release.mmap_data(kind);
        let layout_path = release.mmap_layout(kind);

        let cached = self.mapped.read().get(&data_path).cloned();
        if let Some(mapped) = cached {
            if mapped.still_valid(&data_path) {
                return mapped.read_columns(desired);
            }
        }

        let mapped = Arc::new(MappedTable::open(&data_path, &layout_path)?);
        let table = mapped.read_columns(desired)?;
        self.mapped.write().insert(data_path, mapped);
        Ok(table)
    }

    fn probe_canonical(
        &self,
        release: &ReleaseLayout,
        kind: TableKind,
        desired: &[String],
    ) -> anyhow::Result<Table> {
        let full: Table = store::read_framed(&release.canonical_table(kind))?;
        full.project(desired)
    }
}
