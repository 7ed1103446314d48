use std::collections::HashMap;

use crate::catalog::table::Table;
use crate::error::ApiError;

/// 排列求逆：`invert(p)[p[i]] = i`。
pub fn invert(p: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; p.len()];
    for (i, &v) in p.iter().enumerate() {
        inverse[v] = i;
    }
    inverse
}

/// 稳定 argsort：返回把 ids 排成升序的排列。
/// 稳定性是合并正确性的一部分——重复 id 保持分区到达顺序。
fn argsort(ids: &[i64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by_key(|&i| ids[i]);
    order
}

/// 双排列合并：把按分区顺序拼出来的行重排成调用方的 id 顺序。
///
/// 先把拼接行按 id 排序（P1），再对调用方的 id 序列 argsort（P2），
/// 结果序 = P1 ∘ invert(P2)：行先进入 id 有序空间，再按调用方序“反排序”
/// 回去。整体 O(n log n)，避免逐 id 查找的 O(n²)。
///
/// 任何一侧缺 id 都必须报错，不允许静默截断。
pub fn merge_order(available: &[i64], requested: &[i64]) -> Result<Vec<usize>, ApiError> {
    let mut counts: HashMap<i64, i64> = HashMap::new();
    for &id in available {
        *counts.entry(id).or_insert(0) += 1;
    }
    let mut missing = Vec::new();
    for &id in requested {
        let c = counts.entry(id).or_insert(0);
        *c -= 1;
        if *c < 0 {
            missing.push(id);
        }
    }
    if !missing.is_empty() {
        missing.dedup();
        return Err(ApiError::not_found(format!(
            "unable to find rows for identifiers: {:?}",
            missing
        )));
    }
    if available.len() != requested.len() {
        return Err(ApiError::ServerFailed(format!(
            "partition rows ({}) do not match requested identifiers ({})",
            available.len(),
            requested.len()
        )));
    }

    let p1 = argsort(available);
    let p2 = argsort(requested);
    let inv2 = invert(&p2);
    Ok(inv2.into_iter().map(|j| p1[j]).collect())
}

/// 把若干分区结果表合并成一张按 requested 顺序排布的表。
/// `id_column` 是行键列（targets/radec 查询是 TARGETID，tile 查询是 FIBER）。
pub fn merge_tables<'a>(
    requested: &[i64],
    tables: impl IntoIterator<Item = &'a Table>,
    id_column: &str,
) -> Result<Table, ApiError> {
    let joined = Table::concat(tables).map_err(|e| ApiError::ServerFailed(e.to_string()))?;
    let ids = joined
        .int_column(id_column)
        .map_err(|e| ApiError::ServerFailed(e.to_string()))?;
    let order = merge_order(ids, requested)?;
    joined
        .take(&order)
        .map_err(|e| ApiError::ServerFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::table::ColumnData;

    fn part(ids: &[i64], marker: &str) -> Table {
        let mut t = Table::new();
        t.push_column("TARGETID", ColumnData::Int(ids.to_vec())).unwrap();
        t.push_column("PART", ColumnData::Str(vec![marker.to_string(); ids.len()]))
            .unwrap();
        t
    }

    #[test]
    fn invert_is_inverse() {
        let p = vec![2, 0, 3, 1];
        let inv = invert(&p);
        for (i, &v) in p.iter().enumerate() {
            assert_eq!(inv[v], i);
        }
    }

    #[test]
    fn merge_restores_caller_order() {
        // 分区内部顺序任意：{10,20} 与 {30}，调用方要 [30,10,20]
        let a = part(&[20, 10], "a");
        let b = part(&[30], "b");
        let merged = merge_tables(&[30, 10, 20], [&a, &b], "TARGETID").unwrap();
        assert_eq!(merged.int_column("TARGETID").unwrap(), &[30, 10, 20]);
        assert_eq!(
            merged.str_column("PART").unwrap(),
            &["b".to_string(), "a".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn missing_identifier_raises() {
        let a = part(&[10, 20], "a");
        let b = part(&[30], "b");
        let err = merge_tables(&[30, 10, 99], [&a, &b], "TARGETID").unwrap_err();
        assert!(matches!(err, ApiError::DataNotFound(_)));
    }

    #[test]
    fn surplus_rows_raise_instead_of_truncating() {
        let a = part(&[10, 20, 30], "a");
        let err = merge_tables(&[10, 20], [&a], "TARGETID").unwrap_err();
        assert!(matches!(err, ApiError::ServerFailed(_)));
    }

    #[test]
    fn duplicate_ids_keep_arrival_order() {
        // 同一 id 在两个分区各有一行：稳定排序保证先到的分区行排在前
        let a = part(&[10], "a");
        let b = part(&[10], "b");
        let merged = merge_tables(&[10, 10], [&a, &b], "TARGETID").unwrap();
        assert_eq!(
            merged.str_column("PART").unwrap(),
            &["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn single_partition_identity() {
        let a = part(&[1, 2, 3], "a");
        let merged = merge_tables(&[1, 2, 3], [&a], "TARGETID").unwrap();
        assert_eq!(merged.int_column("TARGETID").unwrap(), &[1, 2, 3]);
    }
}
