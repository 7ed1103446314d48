use std::collections::BTreeMap;

use roaring::RoaringBitmap;

use crate::catalog::table::{ColumnData, Table};
use crate::error::ApiError;

/// 不参与过滤的查询键（输出格式提示等），组合掩码时必须剔除。
pub const SPECIAL_QUERY_PARAMS: &[&str] = &["filetype"];

pub fn is_special_key(key: &str) -> bool {
    SPECIAL_QUERY_PARAMS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(key))
}

/// 过滤键（剔除特殊键、统一大写）——这些列要并入层解析的目标列集。
pub fn data_filter_columns(filters: &BTreeMap<String, String>) -> Vec<String> {
    filters
        .keys()
        .filter(|k| !is_special_key(k))
        .map(|k| k.to_uppercase())
        .collect()
}

/// `<op><literal>` 里的操作符。无前导操作符时回落为等值比较。
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterOp {
    Greater,
    Less,
    Equal,
    Wildcard,
}

/// 字面量在构造期解析一次：保留原始文本，数值解析成功则带上数值形式。
#[derive(Clone, Debug, PartialEq)]
pub struct Literal {
    raw: String,
    num: Option<f64>,
}

impl Literal {
    fn parse(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            num: raw.parse::<f64>().ok(),
        }
    }

    fn as_bool(&self) -> Option<bool> {
        if self.raw.eq_ignore_ascii_case("true") {
            Some(true)
        } else if self.raw.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            self.num.map(|n| n != 0.0)
        }
    }
}

/// 编译好的单列谓词。比较时按列的原生元素类型取值。
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: FilterOp,
    literal: Literal,
}

impl Predicate {
    /// 解析 `<op><literal>` 形式的过滤串。op ∈ {>, <, =, *}；
    /// 无前导操作符时整串按等值字面量处理。
    pub fn compile(column: &str, spec: &str) -> Result<Predicate, ApiError> {
        if spec.is_empty() {
            return Err(ApiError::malformed(format!(
                "empty filter for column {}",
                column
            )));
        }
        let mut chars = spec.chars();
        let (op, rest) = match chars.next() {
            Some('>') => (FilterOp::Greater, chars.as_str()),
            Some('<') => (FilterOp::Less, chars.as_str()),
            Some('=') => (FilterOp::Equal, chars.as_str()),
            Some('*') => (FilterOp::Wildcard, ""),
            _ => (FilterOp::Equal, spec),
        };
        Ok(Predicate {
            column: column.to_uppercase(),
            op,
            literal: Literal::parse(rest),
        })
    }

    /// 逐行求值成行选择掩码。引用的列不存在是 MalformedQuery。
    pub fn eval(&self, table: &Table) -> Result<RoaringBitmap, ApiError> {
        let col = table.column(&self.column).ok_or_else(|| {
            ApiError::malformed(format!("filter references unknown column {}", self.column))
        })?;

        // 通配：列必须在投影里，但永不剔除行；不扫描任何数据。
        if self.op == FilterOp::Wildcard {
            return Ok(table.full_mask());
        }

        let mut mask = RoaringBitmap::new();
        match &col.data {
            ColumnData::Int(v) => {
                let Some(n) = self.literal.num else {
                    // 数值列对非数值字面量：等值恒空，排序比较无意义
                    return match self.op {
                        FilterOp::Equal => Ok(mask),
                        _ => Err(ApiError::malformed(format!(
                            "cannot order column {} against {:?}",
                            self.column, self.literal.raw
                        ))),
                    };
                };
                for (i, &x) in v.iter().enumerate() {
                    let keep = match self.op {
                        FilterOp::Greater => (x as f64) > n,
                        FilterOp::Less => (x as f64) < n,
                        FilterOp::Equal => (x as f64) == n,
                        FilterOp::Wildcard => unreachable!(),
                    };
                    if keep {
                        mask.insert(i as u32);
                    }
                }
            }
            ColumnData::Float(v) => {
                let Some(n) = self.literal.num else {
                    return match self.op {
                        FilterOp::Equal => Ok(mask),
                        _ => Err(ApiError::malformed(format!(
                            "cannot order column {} against {:?}",
                            self.column, self.literal.raw
                        ))),
                    };
                };
                for (i, &x) in v.iter().enumerate() {
                    let keep = match self.op {
                        FilterOp::Greater => x > n,
                        FilterOp::Less => x < n,
                        FilterOp::Equal => x == n,
                        FilterOp::Wildcard => unreachable!(),
                    };
                    if keep {
                        mask.insert(i as u32);
                    }
                }
            }
            ColumnData::Str(v) => {
                let lit = self.literal.raw.as_str();
                for (i, x) in v.iter().enumerate() {
                    let keep = match self.op {
                        FilterOp::Greater => x.as_str() > lit,
                        FilterOp::Less => x.as_str() < lit,
                        FilterOp::Equal => x == lit,
                        FilterOp::Wildcard => unreachable!(),
                    };
                    if keep {
                        mask.insert(i as u32);
                    }
                }
            }
            ColumnData::Bool(v) => {
                let Some(b) = self.literal.as_bool() else {
                    return match self.op {
                        FilterOp::Equal => Ok(mask),
                        _ => Err(ApiError::malformed(format!(
                            "cannot order column {} against {:?}",
                            self.column, self.literal.raw
                        ))),
                    };
                };
                if self.op != FilterOp::Equal {
                    return Err(ApiError::malformed(format!(
                        "column {} only supports equality",
                        self.column
                    )));
                }
                for (i, &x) in v.iter().enumerate() {
                    if x == b {
                        mask.insert(i as u32);
                    }
                }
            }
        }
        Ok(mask)
    }
}

/// 过滤集合编译：特殊键剔除，其余各列一条谓词。
pub fn compile_filters(filters: &BTreeMap<String, String>) -> Result<Vec<Predicate>, ApiError> {
    filters
        .iter()
        .filter(|(k, _)| !is_special_key(k))
        .map(|(k, v)| Predicate::compile(k, v))
        .collect()
}

/// 组合规则：各谓词掩码按 AND 相交，行必须满足全部过滤条件。
/// 空过滤集走快路径：不扫描，整表原样返回。
pub fn apply_filters(
    table: &Table,
    filters: &BTreeMap<String, String>,
) -> Result<Table, ApiError> {
    let predicates = compile_filters(filters)?;
    if predicates.is_empty() {
        return Ok(table.clone());
    }

    let mut acc = table.full_mask();
    for p in &predicates {
        acc &= p.eval(table)?;
        if acc.is_empty() {
            break;
        }
    }
    table
        .filter(&acc)
        .map_err(|e| ApiError::ServerFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new();
        t.push_column("X", ColumnData::Int(vec![1, 2, 3, 4, 5])).unwrap();
        t.push_column("Y", ColumnData::Bool(vec![true, true, false, true, false]))
            .unwrap();
        t.push_column("Z", ColumnData::Float(vec![0.1, 0.2, 0.3, 0.4, 0.5])).unwrap();
        t.push_column("SURVEY", ColumnData::Str(vec![
            "cmx".into(),
            "main".into(),
            "sv1".into(),
            "sv2".into(),
            "main".into(),
        ]))
        .unwrap();
        t
    }

    fn filters(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn and_combination_keeps_rows_satisfying_all() {
        let t = sample();
        let out = apply_filters(&t, &filters(&[("x", ">2"), ("y", "=true")])).unwrap();
        assert_eq!(out.int_column("X").unwrap(), &[4]);
    }

    #[test]
    fn wildcard_never_excludes() {
        let t = sample();
        let out = apply_filters(&t, &filters(&[("x", "*anything")])).unwrap();
        assert_eq!(out.n_rows(), 5);
        let out = apply_filters(&t, &filters(&[("x", "*")])).unwrap();
        assert_eq!(out.n_rows(), 5);
    }

    #[test]
    fn missing_operator_defaults_to_equality() {
        let t = sample();
        let out = apply_filters(&t, &filters(&[("survey", "main")])).unwrap();
        assert_eq!(out.n_rows(), 2);
        let out = apply_filters(&t, &filters(&[("x", "3")])).unwrap();
        assert_eq!(out.int_column("X").unwrap(), &[3]);
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        let t = sample();
        let out = apply_filters(&t, &filters(&[("survey", ">main")])).unwrap();
        assert_eq!(out.str_column("SURVEY").unwrap(), &["sv1".to_string(), "sv2".to_string()]);
    }

    #[test]
    fn float_threshold() {
        let t = sample();
        let out = apply_filters(&t, &filters(&[("z", "<0.25")])).unwrap();
        assert_eq!(out.n_rows(), 2);
    }

    #[test]
    fn special_keys_are_not_predicates() {
        let t = sample();
        // filetype 不是数据列；若未被剔除会因缺列而报错
        let out = apply_filters(&t, &filters(&[("filetype", "json"), ("x", ">4")])).unwrap();
        assert_eq!(out.int_column("X").unwrap(), &[5]);
        assert_eq!(data_filter_columns(&filters(&[("filetype", "json"), ("x", ">4")])), vec!["X"]);
    }

    #[test]
    fn unknown_column_is_malformed() {
        let t = sample();
        let err = apply_filters(&t, &filters(&[("nope", ">1")])).unwrap_err();
        assert!(matches!(err, ApiError::MalformedQuery(_)));
    }

    #[test]
    fn empty_filter_map_is_identity() {
        let t = sample();
        let out = apply_filters(&t, &BTreeMap::new()).unwrap();
        assert_eq!(out, t);
    }

    #[test]
    fn empty_spec_is_malformed() {
        assert!(Predicate::compile("x", "").is_err());
    }

    #[test]
    fn ordering_against_text_on_numeric_column_is_malformed() {
        let t = sample();
        let err = apply_filters(&t, &filters(&[("x", ">abc")])).unwrap_err();
        assert!(matches!(err, ApiError::MalformedQuery(_)));
        // 等值则是恒空，不是错误
        let out = apply_filters(&t, &filters(&[("x", "=abc")])).unwrap();
        assert_eq!(out.n_rows(), 0);
    }
}
