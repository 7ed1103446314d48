use serde::{Deserialize, Serialize};

use crate::catalog::table::Table;
use crate::error::ApiError;
use crate::spectra::fetch::{PartitionResult, WaveGrid};
use crate::spectra::merge;

/// 叠好的光谱制品：目录元数据 + 合并红移表 + 按调用方顺序排布的光谱矩阵。
/// 这是派生制品变换的输出，调用方拿到的是它的 bincode 字节。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StackedSpectra {
    pub wave: WaveGrid,
    /// 选中的目录行（选择 + 过滤之后，调用方顺序）
    pub targets: Table,
    /// 分区红移表合并结果，行序与 targets 对齐
    pub zbest: Table,
    pub flux: Vec<Vec<f32>>,
    pub ivar: Vec<Vec<f32>>,
}

/// 把分区片段拼接并重排成调用方的 id 顺序，再与目录行装配成制品。
///
/// 拼接顺序 = 分区顺序；重排用双排列合并，行键由 `id_column` 指定。
/// flux/ivar 与红移表行共用同一个重排序列，三者始终对齐。
pub fn stack_partitions(
    requested_ids: &[i64],
    targets: Table,
    parts: Vec<PartitionResult>,
    id_column: &str,
) -> Result<StackedSpectra, ApiError> {
    if requested_ids.is_empty() {
        return Err(ApiError::not_found("no objects selected for spectra"));
    }

    let Some(wave) = parts.first().map(|p| p.wave.clone()) else {
        return Err(ApiError::not_found("no spectra partitions resolved"));
    };
    for p in &parts {
        if p.wave != wave {
            return Err(ApiError::ServerFailed(format!(
                "partition {} wavelength grid differs",
                p.label
            )));
        }
        for row in p.flux.iter().chain(p.ivar.iter()) {
            if row.len() != wave.count as usize {
                return Err(ApiError::ServerFailed(format!(
                    "partition {} spectrum length {} != grid {}",
                    p.label,
                    row.len(),
                    wave.count
                )));
            }
        }
    }

    let joined =
        Table::concat(parts.iter().map(|p| &p.table)).map_err(|e| ApiError::ServerFailed(e.to_string()))?;
    let all_ids: Vec<i64> = parts.iter().flat_map(|p| p.row_ids.iter().copied()).collect();
    debug_assert_eq!(joined.n_rows(), all_ids.len());

    let order = merge::merge_order(&all_ids, requested_ids)?;
    let zbest = joined
        .take(&order)
        .map_err(|e| ApiError::ServerFailed(e.to_string()))?;

    let all_flux: Vec<&Vec<f32>> = parts.iter().flat_map(|p| p.flux.iter()).collect();
    let all_ivar: Vec<&Vec<f32>> = parts.iter().flat_map(|p| p.ivar.iter()).collect();
    let flux: Vec<Vec<f32>> = order.iter().map(|&i| all_flux[i].clone()).collect();
    let ivar: Vec<Vec<f32>> = order.iter().map(|&i| all_ivar[i].clone()).collect();

    Ok(StackedSpectra {
        wave,
        targets,
        zbest,
        flux,
        ivar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::table::ColumnData;

    fn part(label: &str, ids: &[i64]) -> PartitionResult {
        let mut table = Table::new();
        table.push_column("TARGETID", ColumnData::Int(ids.to_vec())).unwrap();
        table
            .push_column("Z", ColumnData::Float(ids.iter().map(|&i| i as f64).collect()))
            .unwrap();
        PartitionResult {
            label: label.to_string(),
            row_ids: ids.to_vec(),
            table,
            wave: WaveGrid {
                start: 3600.0,
                step: 0.8,
                count: 2,
            },
            flux: ids.iter().map(|&i| vec![i as f32, i as f32]).collect(),
            ivar: ids.iter().map(|_| vec![1.0, 1.0]).collect(),
        }
    }

    fn targets_for(ids: &[i64]) -> Table {
        let mut t = Table::new();
        t.push_column("TARGETID", ColumnData::Int(ids.to_vec())).unwrap();
        t
    }

    #[test]
    fn stacked_rows_follow_caller_order() {
        let requested = vec![30, 10, 20];
        let parts = vec![part("a", &[10, 20]), part("b", &[30])];
        let stacked =
            stack_partitions(&requested, targets_for(&requested), parts, "TARGETID").unwrap();

        assert_eq!(stacked.zbest.int_column("TARGETID").unwrap(), &[30, 10, 20]);
        assert_eq!(stacked.flux[0][0], 30.0);
        assert_eq!(stacked.flux[1][0], 10.0);
        assert_eq!(stacked.flux[2][0], 20.0);
    }

    #[test]
    fn grid_mismatch_is_server_failure() {
        let requested = vec![10, 30];
        let mut bad = part("b", &[30]);
        bad.wave.step = 1.6;
        let err = stack_partitions(
            &requested,
            targets_for(&requested),
            vec![part("a", &[10]), bad],
            "TARGETID",
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::ServerFailed(_)));
    }

    #[test]
    fn missing_id_propagates_not_found() {
        let requested = vec![10, 99];
        let err = stack_partitions(
            &requested,
            targets_for(&requested),
            vec![part("a", &[10])],
            "TARGETID",
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::DataNotFound(_)));
    }

    #[test]
    fn empty_selection_is_not_found() {
        let err = stack_partitions(&[], targets_for(&[]), vec![], "TARGETID").unwrap_err();
        assert!(matches!(err, ApiError::DataNotFound(_)));
    }
}
