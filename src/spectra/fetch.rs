use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::catalog::release::ReleaseLayout;
use crate::catalog::store;
use crate::catalog::table::Table;
use crate::error::ApiError;

/// 等距波长网格。分区文件之间网格必须一致才能叠加。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaveGrid {
    pub start: f64,
    pub step: f64,
    pub count: u32,
}

/// 一个分区 coadd 文件的内容：红移表 + 每行一条光谱。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionFile {
    pub wave: WaveGrid,
    pub zbest: Table,
    pub flux: Vec<Vec<f32>>,
    pub ivar: Vec<Vec<f32>>,
}

/// 读一个分区后留下的片段：行键按文件内顺序（合并阶段再重排）。
#[derive(Clone, Debug)]
pub struct PartitionResult {
    pub label: String,
    pub row_ids: Vec<i64>,
    pub table: Table,
    pub wave: WaveGrid,
    pub flux: Vec<Vec<f32>>,
    pub ivar: Vec<Vec<f32>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct HealpixPartition {
    survey: String,
    program: String,
    healpix: i64,
}

/// healpix 方案：被选中的目录行按 (survey, program, healpix) 归组，
/// 每组一个 coadd 文件，组间并行读取。
pub fn fetch_healpix_partitions(
    release: &ReleaseLayout,
    targets: &Table,
) -> Result<Vec<PartitionResult>, ApiError> {
    let internal = |e: anyhow::Error| ApiError::ServerFailed(e.to_string());
    let tids = targets.int_column("TARGETID").map_err(internal)?;
    let surveys = targets.str_column("SURVEY").map_err(internal)?;
    let programs = targets.str_column("PROGRAM").map_err(internal)?;
    let healpix = targets.int_column("HEALPIX").map_err(internal)?;

    let mut groups: BTreeMap<HealpixPartition, Vec<i64>> = BTreeMap::new();
    for i in 0..targets.n_rows() {
        let key = HealpixPartition {
            survey: surveys[i].clone(),
            program: programs[i].clone(),
            healpix: healpix[i],
        };
        groups.entry(key).or_default().push(tids[i]);
    }
    tracing::debug!("fetching {} spectra partitions", groups.len());

    groups
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(key, ids)| {
            let path = release.spectra_file(key.healpix, &key.survey, &key.program);
            let label = format!("{}/{}/{}", key.survey, key.program, key.healpix);
            read_partition(&path, &label, &ids, "TARGETID")
        })
        .collect()
}

/// tile 方案：取最新观测日期目录，fiber 按 petal (fiber / 500) 归组。
pub fn fetch_tile_partitions(
    release: &ReleaseLayout,
    tile: i64,
    fibers: &[i64],
) -> Result<Vec<PartitionResult>, ApiError> {
    let date = latest_tile_date(&release.tile_dir(tile)).ok_or_else(|| {
        ApiError::not_found(format!("unable to locate tile {} spectra", tile))
    })?;

    let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for &f in fibers {
        groups.entry(f / 500).or_default().push(f);
    }

    groups
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(petal, ids)| {
            let path = release.tile_spectra_file(tile, &date, petal);
            let label = format!("tile {}/{}/petal {}", tile, date, petal);
            read_partition(&path, &label, &ids, "FIBER")
        })
        .collect()
}

/// 累积 coadd 目录下可能有多个观测日期，始终取数值最大（最新）的那个。
fn latest_tile_date(dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i64>().ok()))
        .max()
        .map(|d| d.to_string())
}

fn read_partition(
    path: &PathBuf,
    label: &str,
    wanted: &[i64],
    id_column: &str,
) -> Result<PartitionResult, ApiError> {
    let pf: PartitionFile = store::read_framed(path).map_err(|e| {
        tracing::warn!("partition {} unreadable: {}", label, e);
        ApiError::not_found(format!("unable to read spectra partition {}", label))
    })?;

    let ids = pf
        .zbest
        .int_column(id_column)
        .map_err(|e| ApiError::ServerFailed(e.to_string()))?;
    if pf.flux.len() != ids.len() || pf.ivar.len() != ids.len() {
        return Err(ApiError::ServerFailed(format!(
            "partition {} has {} rows but {}/{} spectra",
            label,
            ids.len(),
            pf.flux.len(),
            pf.ivar.len()
        )));
    }

    let wanted_set: HashSet<i64> = wanted.iter().copied().collect();
    let rows: Vec<usize> = ids
        .iter()
        .enumerate()
        .filter(|(_, id)| wanted_set.contains(id))
        .map(|(i, _)| i)
        .collect();

    let row_ids: Vec<i64> = rows.iter().map(|&i| ids[i]).collect();
    let table = pf
        .zbest
        .take(&rows)
        .map_err(|e| ApiError::ServerFailed(e.to_string()))?;
    let flux = rows.iter().map(|&i| pf.flux[i].clone()).collect();
    let ivar = rows.iter().map(|&i| pf.ivar[i].clone()).collect();

    Ok(PartitionResult {
        label: label.to_string(),
        row_ids,
        table,
        wave: pf.wave,
        flux,
        ivar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::table::ColumnData;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("spectra-api-{}-{}", tag, nanos))
    }

    pub fn partition_file(id_column: &str, ids: &[i64]) -> PartitionFile {
        let mut zbest = Table::new();
        zbest.push_column(id_column, ColumnData::Int(ids.to_vec())).unwrap();
        zbest
            .push_column("Z", ColumnData::Float(ids.iter().map(|&i| i as f64 / 100.0).collect()))
            .unwrap();
        zbest
            .push_column("SPECTYPE", ColumnData::Str(vec!["GALAXY".into(); ids.len()]))
            .unwrap();
        let flux: Vec<Vec<f32>> = ids.iter().map(|&i| vec![i as f32; 4]).collect();
        let ivar: Vec<Vec<f32>> = ids.iter().map(|_| vec![1.0; 4]).collect();
        PartitionFile {
            wave: WaveGrid {
                start: 3600.0,
                step: 0.8,
                count: 4,
            },
            zbest,
            flux,
            ivar,
        }
    }

    fn healpix_targets(rows: &[(i64, &str, &str, i64)]) -> Table {
        let mut t = Table::new();
        t.push_column("TARGETID", ColumnData::Int(rows.iter().map(|r| r.0).collect()))
            .unwrap();
        t.push_column(
            "SURVEY",
            ColumnData::Str(rows.iter().map(|r| r.1.to_string()).collect()),
        )
        .unwrap();
        t.push_column(
            "PROGRAM",
            ColumnData::Str(rows.iter().map(|r| r.2.to_string()).collect()),
        )
        .unwrap();
        t.push_column("HEALPIX", ColumnData::Int(rows.iter().map(|r| r.3).collect()))
            .unwrap();
        t
    }

    #[test]
    fn healpix_fetch_groups_by_partition() {
        let root = unique_tmp_dir("fetch-hpx");
        let release = ReleaseLayout::new(&root.join("redux"), &root.join("derived"), "fuji");

        // 两个分区：hpx 100 放 {10, 20}（外加一个未请求的 77），hpx 205 放 {30}
        let a = partition_file("TARGETID", &[20, 77, 10]);
        store::write_framed(&release.spectra_file(100, "main", "dark"), &a).unwrap();
        let b = partition_file("TARGETID", &[30]);
        store::write_framed(&release.spectra_file(205, "main", "bright"), &b).unwrap();

        let targets = healpix_targets(&[
            (30, "main", "bright", 205),
            (10, "main", "dark", 100),
            (20, "main", "dark", 100),
        ]);
        let parts = fetch_healpix_partitions(&release, &targets).unwrap();
        assert_eq!(parts.len(), 2);

        let all_ids: Vec<i64> = parts.iter().flat_map(|p| p.row_ids.clone()).collect();
        let mut sorted = all_ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![10, 20, 30]);
        // 未请求的 77 不进入结果
        assert!(!all_ids.contains(&77));
        // 表与 flux 行一一对应
        for p in &parts {
            assert_eq!(p.table.n_rows(), p.flux.len());
        }
    }

    #[test]
    fn unreadable_partition_is_not_found() {
        let root = unique_tmp_dir("fetch-missing");
        let release = ReleaseLayout::new(&root.join("redux"), &root.join("derived"), "fuji");
        let targets = healpix_targets(&[(10, "main", "dark", 100)]);
        let err = fetch_healpix_partitions(&release, &targets).unwrap_err();
        assert!(matches!(err, ApiError::DataNotFound(_)));
    }

    #[test]
    fn tile_fetch_uses_latest_date_and_petal_grouping() {
        let root = unique_tmp_dir("fetch-tile");
        let release = ReleaseLayout::new(&root.join("redux"), &root.join("derived"), "fuji");

        // 两个日期目录：必须选 20210610
        let old = partition_file("FIBER", &[10]);
        store::write_framed(&release.tile_spectra_file(80605, "20200101", 0), &old).unwrap();
        let newer = partition_file("FIBER", &[10, 234]);
        store::write_framed(&release.tile_spectra_file(80605, "20210610", 0), &newer).unwrap();
        let petal7 = partition_file("FIBER", &[3951]);
        store::write_framed(&release.tile_spectra_file(80605, "20210610", 7), &petal7).unwrap();

        let parts = fetch_tile_partitions(&release, 80605, &[10, 3951, 234]).unwrap();
        assert_eq!(parts.len(), 2);
        let all_ids: Vec<i64> = parts.iter().flat_map(|p| p.row_ids.clone()).collect();
        let mut sorted = all_ids;
        sorted.sort_unstable();
        assert_eq!(sorted, vec![10, 234, 3951]);
    }

    #[test]
    fn missing_tile_dir_is_not_found() {
        let root = unique_tmp_dir("fetch-tile-missing");
        let release = ReleaseLayout::new(&root.join("redux"), &root.join("derived"), "fuji");
        let err = fetch_tile_partitions(&release, 1, &[10]).unwrap_err();
        assert!(matches!(err, ApiError::DataNotFound(_)));
    }
}
