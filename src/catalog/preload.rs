use std::path::Path;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::catalog::release::{ReleaseLayout, TableKind};
use crate::catalog::store;
use crate::catalog::table::Table;

static GLOBAL: OnceLock<Arc<PreloadCache>> = OnceLock::new();

/// 进程级预载层：启动时按白名单把两种目录表的基础列集读进内存，
/// 之后整个进程生命周期只读、永不刷新（刷新 = 重启进程）。
pub struct PreloadCache {
    tables: DashMap<(String, TableKind), Arc<Table>>,
}

impl PreloadCache {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            tables: DashMap::new(),
        })
    }

    /// 一次性初始化守卫：重复调用拿到的是第一次构建的实例。
    pub fn init_global(releases: &[String], data_root: &Path, derived_dir: &Path) -> Arc<Self> {
        GLOBAL
            .get_or_init(|| Self::build(releases, data_root, derived_dir))
            .clone()
    }

    /// 直接构建（测试用，不经过全局守卫）。
    /// 单个 release 读取失败只记日志并跳过，不阻塞启动。
    pub fn build(releases: &[String], data_root: &Path, derived_dir: &Path) -> Arc<Self> {
        let cache = Self::empty();
        for name in releases {
            let layout = ReleaseLayout::new(data_root, derived_dir, name);
            for kind in [TableKind::Healpix, TableKind::Tile] {
                let path = layout.canonical_table(kind);
                match store::read_framed::<Table>(&path) {
                    Ok(full) => match full.project(&kind.base_columns()) {
                        Ok(projected) => {
                            tracing::info!(
                                "preloaded {:?}/{:?}: {} rows",
                                layout.name,
                                kind,
                                projected.n_rows()
                            );
                            cache
                                .tables
                                .insert((layout.name.clone(), kind), Arc::new(projected));
                        }
                        Err(e) => {
                            tracing::warn!("preload {:?}/{:?} projection failed: {}", name, kind, e)
                        }
                    },
                    Err(e) => tracing::warn!("preload {:?}/{:?} skipped: {}", name, kind, e),
                }
            }
        }
        cache
    }

    /// 只认预载时的那组固定列：请求多一列都按 miss 处理，交给下一层。
    pub fn probe(
        &self,
        release: &str,
        kind: TableKind,
        desired: &[String],
    ) -> anyhow::Result<Arc<Table>> {
        let mut want: Vec<String> = desired.iter().map(|s| s.to_uppercase()).collect();
        want.sort();
        want.dedup();
        let mut have = kind.base_columns();
        have.sort();
        if want != have {
            anyhow::bail!("preload only serves the fixed base column set");
        }

        self.tables
            .get(&(release.to_string(), kind))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("release {} not preloaded", release))
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, release: &str, kind: TableKind, table: Table) {
        self.tables
            .insert((release.to_string(), kind), Arc::new(table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::table::ColumnData;

    fn base_table(kind: TableKind) -> Table {
        let mut t = Table::new();
        t.push_column("TARGETID", ColumnData::Int(vec![1])).unwrap();
        t.push_column("SURVEY", ColumnData::Str(vec!["main".into()])).unwrap();
        t.push_column("PROGRAM", ColumnData::Str(vec!["dark".into()])).unwrap();
        t.push_column("ZCAT_PRIMARY", ColumnData::Bool(vec![true])).unwrap();
        t.push_column("TARGET_RA", ColumnData::Float(vec![1.0])).unwrap();
        t.push_column("TARGET_DEC", ColumnData::Float(vec![2.0])).unwrap();
        match kind {
            TableKind::Healpix => t.push_column("HEALPIX", ColumnData::Int(vec![2761])).unwrap(),
            TableKind::Tile => {
                t.push_column("TILEID", ColumnData::Int(vec![80605])).unwrap();
                t.push_column("FIBER", ColumnData::Int(vec![10])).unwrap();
            }
        }
        t
    }

    #[test]
    fn probe_requires_exact_column_set() {
        let cache = PreloadCache::empty();
        cache.insert_for_test("fuji", TableKind::Healpix, base_table(TableKind::Healpix));

        let base = TableKind::Healpix.base_columns();
        assert!(cache.probe("fuji", TableKind::Healpix, &base).is_ok());

        // 多一个过滤列：必须落空
        let mut extra = base.clone();
        extra.push("Z".to_string());
        assert!(cache.probe("fuji", TableKind::Healpix, &extra).is_err());

        // 顺序无关
        let mut shuffled = base;
        shuffled.reverse();
        assert!(cache.probe("fuji", TableKind::Healpix, &shuffled).is_ok());
    }

    #[test]
    fn unknown_release_misses() {
        let cache = PreloadCache::empty();
        let base = TableKind::Tile.base_columns();
        assert!(cache.probe("iron", TableKind::Tile, &base).is_err());
    }
}
