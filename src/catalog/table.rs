use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

/// 列元素类型（固定四种；目录表不含嵌套/数组列）
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    Str,
    Bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
    Bool(Vec<bool>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Str(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> ColumnType {
        match self {
            ColumnData::Int(_) => ColumnType::Int,
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Str(_) => ColumnType::Str,
            ColumnData::Bool(_) => ColumnType::Bool,
        }
    }

    /// 按行号 gather。行号越界返回 Err（调用方负责传入合法排列）。
    pub fn take(&self, rows: &[usize]) -> anyhow::Result<ColumnData> {
        fn gather<T: Clone>(v: &[T], rows: &[usize]) -> anyhow::Result<Vec<T>> {
            rows.iter()
                .map(|&i| {
                    v.get(i)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("row index {} out of bounds ({})", i, v.len()))
                })
                .collect()
        }
        Ok(match self {
            ColumnData::Int(v) => ColumnData::Int(gather(v, rows)?),
            ColumnData::Float(v) => ColumnData::Float(gather(v, rows)?),
            ColumnData::Str(v) => ColumnData::Str(gather(v, rows)?),
            ColumnData::Bool(v) => ColumnData::Bool(gather(v, rows)?),
        })
    }

    fn append(&mut self, other: &ColumnData) -> anyhow::Result<()> {
        match (self, other) {
            (ColumnData::Int(a), ColumnData::Int(b)) => a.extend_from_slice(b),
            (ColumnData::Float(a), ColumnData::Float(b)) => a.extend_from_slice(b),
            (ColumnData::Str(a), ColumnData::Str(b)) => a.extend_from_slice(b),
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.extend_from_slice(b),
            (a, b) => anyhow::bail!("column type mismatch: {:?} vs {:?}", a.dtype(), b.dtype()),
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

/// 行数齐平的列式表：层与层之间、过滤与合并之间交换的基本单元。
///
/// 列名统一大写存储（与过滤引擎的大小写规范一致）。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_column(&mut self, name: &str, data: ColumnData) -> anyhow::Result<()> {
        let name = name.to_uppercase();
        if self.columns.iter().any(|c| c.name == name) {
            anyhow::bail!("duplicate column {}", name);
        }
        if let Some(first) = self.columns.first() {
            if first.data.len() != data.len() {
                anyhow::bail!(
                    "column {} has {} rows, table has {}",
                    name,
                    data.len(),
                    first.data.len()
                );
            }
        }
        self.columns.push(Column { name, data });
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(|c| c.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        let upper = name.to_uppercase();
        self.columns.iter().find(|c| c.name == upper)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn int_column(&self, name: &str) -> anyhow::Result<&[i64]> {
        match self.column(name).map(|c| &c.data) {
            Some(ColumnData::Int(v)) => Ok(v),
            Some(other) => anyhow::bail!("column {} is {:?}, expected Int", name, other.dtype()),
            None => anyhow::bail!("missing column {}", name),
        }
    }

    pub fn float_column(&self, name: &str) -> anyhow::Result<&[f64]> {
        match self.column(name).map(|c| &c.data) {
            Some(ColumnData::Float(v)) => Ok(v),
            Some(other) => anyhow::bail!("column {} is {:?}, expected Float", name, other.dtype()),
            None => anyhow::bail!("missing column {}", name),
        }
    }

    pub fn str_column(&self, name: &str) -> anyhow::Result<&[String]> {
        match self.column(name).map(|c| &c.data) {
            Some(ColumnData::Str(v)) => Ok(v),
            Some(other) => anyhow::bail!("column {} is {:?}, expected Str", name, other.dtype()),
            None => anyhow::bail!("missing column {}", name),
        }
    }

    pub fn bool_column(&self, name: &str) -> anyhow::Result<&[bool]> {
        match self.column(name).map(|c| &c.data) {
            Some(ColumnData::Bool(v)) => Ok(v),
            Some(other) => anyhow::bail!("column {} is {:?}, expected Bool", name, other.dtype()),
            None => anyhow::bail!("missing column {}", name),
        }
    }

    /// 投影到给定列集。任何缺列都是 Err —— 层不允许静默返回残缺的列。
    pub fn project(&self, names: &[String]) -> anyhow::Result<Table> {
        let mut out = Table::new();
        for n in names {
            let col = self
                .column(n)
                .ok_or_else(|| anyhow::anyhow!("missing column {}", n.to_uppercase()))?;
            out.push_column(&col.name, col.data.clone())?;
        }
        Ok(out)
    }

    /// 按掩码保留行（掩码里的 bit 是行号）。
    pub fn filter(&self, mask: &RoaringBitmap) -> anyhow::Result<Table> {
        let rows: Vec<usize> = mask.iter().map(|i| i as usize).collect();
        self.take(&rows)
    }

    /// 按行号序列 gather（允许重复与重排，用于排列合并）。
    pub fn take(&self, rows: &[usize]) -> anyhow::Result<Table> {
        let mut out = Table::new();
        for c in &self.columns {
            out.push_column(&c.name, c.data.take(rows)?)?;
        }
        Ok(out)
    }

    /// 纵向拼接同构表。schema（列名与类型、顺序）必须一致。
    pub fn concat<'a>(tables: impl IntoIterator<Item = &'a Table>) -> anyhow::Result<Table> {
        let mut iter = tables.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Table::new());
        };
        let mut out = first.clone();
        for t in iter {
            if t.column_names() != out.column_names() {
                anyhow::bail!(
                    "cannot concat tables with schemas {:?} vs {:?}",
                    out.column_names(),
                    t.column_names()
                );
            }
            for (dst, src) in out.columns.iter_mut().zip(t.columns.iter()) {
                dst.data.append(&src.data)?;
            }
        }
        Ok(out)
    }

    /// 全选掩码：不扫描任何列，直接铺满 [0, n_rows)。
    pub fn full_mask(&self) -> RoaringBitmap {
        let mut mask = RoaringBitmap::new();
        let n = self.n_rows() as u32;
        if n > 0 {
            mask.insert_range(0..n);
        }
        mask
    }
}
