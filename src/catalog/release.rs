use std::path::{Path, PathBuf};

/// 每个 release 有两种目录表，基础列集固定。
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TableKind {
    /// 按 healpix 分组的对象目录（targets / radec 查询走这里）
    Healpix,
    /// 按 tile 累积的目录（tile 查询走这里）
    Tile,
}

/// 所有目录表共有的基础列
pub const BASE_COLUMNS: &[&str] = &[
    "TARGETID",
    "SURVEY",
    "PROGRAM",
    "ZCAT_PRIMARY",
    "TARGET_RA",
    "TARGET_DEC",
];

impl TableKind {
    /// 预载层使用的历史固定列集；请求超出这个集合时预载层必须落空。
    pub fn base_columns(self) -> Vec<String> {
        let mut cols: Vec<String> = BASE_COLUMNS.iter().map(|s| s.to_string()).collect();
        match self {
            TableKind::Healpix => cols.push("HEALPIX".to_string()),
            TableKind::Tile => {
                cols.push("TILEID".to_string());
                cols.push("FIBER".to_string());
            }
        }
        cols
    }

    /// 文件名里的表名片段（沿用 zcatalog 的命名习惯）
    pub fn stem(self) -> &'static str {
        match self {
            TableKind::Healpix => "zall-pix",
            TableKind::Tile => "zall-tilecumulative",
        }
    }
}

/// 一个 release 的磁盘布局：canonical 表、派生 mmap 层、分区 coadd 文件。
#[derive(Clone, Debug)]
pub struct ReleaseLayout {
    pub name: String,
    pub directory: PathBuf,
    derived_dir: PathBuf,
}

impl ReleaseLayout {
    pub fn new(data_root: &Path, derived_dir: &Path, name: &str) -> Self {
        let name = name.to_lowercase();
        Self {
            directory: data_root.join(&name),
            derived_dir: derived_dir.to_path_buf(),
            name,
        }
    }

    /// canonical 表（ground truth）：`<root>/<release>/zcatalog/<stem>-<release>.tbl`
    pub fn canonical_table(&self, kind: TableKind) -> PathBuf {
        self.directory
            .join("zcatalog")
            .join(format!("{}-{}.tbl", kind.stem(), self.name))
    }

    /// mmap 层定宽数据文件
    pub fn mmap_data(&self, kind: TableKind) -> PathBuf {
        self.derived_dir
            .join(format!("{}-{}.dat", kind.stem(), self.name))
    }

    /// mmap 层布局描述文件（列名/类型/宽度/行数）
    pub fn mmap_layout(&self, kind: TableKind) -> PathBuf {
        self.derived_dir
            .join(format!("{}-{}.layout", kind.stem(), self.name))
    }

    /// 分区 coadd 文件：healpix 按百分组，survey/program 逐级目录。
    pub fn spectra_file(&self, healpix: i64, survey: &str, program: &str) -> PathBuf {
        self.directory
            .join("healpix")
            .join((healpix / 100).to_string())
            .join(healpix.to_string())
            .join(survey)
            .join(program)
            .join(format!("coadd-{}-{}-{}.bin", survey, program, healpix))
    }

    /// tile 的累积 coadd 根目录（下一级是观测日期目录）
    pub fn tile_dir(&self, tile: i64) -> PathBuf {
        self.directory
            .join("tiles")
            .join("cumulative")
            .join(tile.to_string())
    }

    /// tile 分区 coadd 文件：按 petal 切分
    pub fn tile_spectra_file(&self, tile: i64, date: &str, petal: i64) -> PathBuf {
        self.tile_dir(tile)
            .join(date)
            .join(format!("coadd-{}-{}-{}.bin", petal, tile, date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let rel = ReleaseLayout::new(Path::new("/srv/redux"), Path::new("/srv/derived"), "Fuji");
        assert_eq!(
            rel.canonical_table(TableKind::Healpix),
            PathBuf::from("/srv/redux/fuji/zcatalog/zall-pix-fuji.tbl")
        );
        assert_eq!(
            rel.mmap_data(TableKind::Tile),
            PathBuf::from("/srv/derived/zall-tilecumulative-fuji.dat")
        );
        assert_eq!(
            rel.spectra_file(2761, "sv1", "dark"),
            PathBuf::from("/srv/redux/fuji/healpix/27/2761/sv1/dark/coadd-sv1-dark-2761.bin")
        );
    }

    #[test]
    fn tile_columns_extend_base() {
        let cols = TableKind::Tile.base_columns();
        assert!(cols.contains(&"TILEID".to_string()));
        assert!(cols.contains(&"FIBER".to_string()));
        assert!(!TableKind::Healpix.base_columns().contains(&"FIBER".to_string()));
    }
}
