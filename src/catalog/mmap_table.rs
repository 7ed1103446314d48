use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::catalog::store;
use crate::catalog::table::{ColumnData, ColumnType, Table};

/// 定宽编码宽度：Int/Float 8B LE，Bool 1B，Str 为布局声明的字节宽度。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: ColumnType,
    pub width: u32,
}

/// 持久化的元素布局描述：mmap 数据文件的唯一解码依据。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    pub row_count: u64,
    pub columns: Vec<ColumnSpec>,
}

impl TableLayout {
    pub fn row_size(&self) -> usize {
        self.columns.iter().map(|c| c.width as usize).sum()
    }

    /// 列在一条记录内的字节偏移
    fn offset_of(&self, name: &str) -> Option<(usize, &ColumnSpec)> {
        let mut off = 0usize;
        for spec in &self.columns {
            if spec.name == name {
                return Some((off, spec));
            }
            off += spec.width as usize;
        }
        None
    }
}

/// 只读映射的定宽表。列数据在 probe 期间拷贝成自有 Table，
/// 不允许任何引用活过映射本身。
pub struct MappedTable {
    layout: TableLayout,
    mmap: Mmap,
    file_len: u64,
    mtime: Option<SystemTime>,
}

impl MappedTable {
    pub fn open(data_path: &Path, layout_path: &Path) -> anyhow::Result<Self> {
        let layout: TableLayout = store::read_framed(layout_path)?;

        let file = std::fs::File::open(data_path)?;
        let meta = file.metadata()?;
        let expected = layout.row_count * layout.row_size() as u64;
        if meta.len() != expected {
            anyhow::bail!(
                "mmap data {:?} has {} bytes, layout expects {}",
                data_path,
                meta.len(),
                expected
            );
        }

        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            layout,
            mmap,
            file_len: meta.len(),
            mtime: meta.modified().ok(),
        })
    }

    /// 映射建立后文件被替换（convert 重跑）则句柄失效，需要重开。
    pub fn still_valid(&self, data_path: &Path) -> bool {
        match std::fs::metadata(data_path) {
            Ok(meta) => meta.len() == self.file_len && meta.modified().ok() == self.mtime,
            Err(_) => false,
        }
    }

    pub fn row_count(&self) -> u64 {
        self.layout.row_count
    }

    /// 把请求的列拷贝出来。缺列即 Err（调用方按 miss 处理）。
    pub fn read_columns(&self, desired: &[String]) -> anyhow::Result<Table> {
        let row_size = self.layout.row_size();
        let n = self.layout.row_count as usize;
        let bytes: &[u8] = &self.mmap;

        let mut out = Table::new();
        for name in desired {
            let upper = name.to_uppercase();
            let Some((off, spec)) = self.layout.offset_of(&upper) else {
                anyhow::bail!("layout has no column {}", upper);
            };
            let width = spec.width as usize;

            let data = match spec.dtype {
                ColumnType::Int => {
                    let mut v = Vec::with_capacity(n);
                    for row in 0..n {
                        let i = row * row_size + off;
                        let rec = bytes
                            .get(i..i + 8)
                            .ok_or_else(|| anyhow::anyhow!("record {} truncated", row))?;
                        v.push(i64::from_le_bytes(rec.try_into()?));
                    }
                    ColumnData::Int(v)
                }
                ColumnType::Float => {
                    let mut v = Vec::with_capacity(n);
                    for row in 0..n {
                        let i = row * row_size + off;
                        let rec = bytes
                            .get(i..i + 8)
                            .ok_or_else(|| anyhow::anyhow!("record {} truncated", row))?;
                        v.push(f64::from_le_bytes(rec.try_into()?));
                    }
                    ColumnData::Float(v)
                }
                ColumnType::Bool => {
                    let mut v = Vec::with_capacity(n);
                    for row in 0..n {
                        let i = row * row_size + off;
                        let b = bytes
                            .get(i)
                            .ok_or_else(|| anyhow::anyhow!("record {} truncated", row))?;
                        v.push(*b != 0);
                    }
                    ColumnData::Bool(v)
                }
                ColumnType::Str => {
                    let mut v = Vec::with_capacity(n);
                    for row in 0..n {
                        let i = row * row_size + off;
                        let rec = bytes
                            .get(i..i + width)
                            .ok_or_else(|| anyhow::anyhow!("record {} truncated", row))?;
                        let end = rec.iter().position(|&b| b == 0).unwrap_or(width);
                        v.push(std::str::from_utf8(&rec[..end])?.to_string());
                    }
                    ColumnData::Str(v)
                }
            };
            out.push_column(&upper, data)?;
        }
        Ok(out)
    }
}

/// 从内存 Table 物化 mmap 层（convert 子命令与测试夹具共用）。
///
/// 字符串列宽取实际最大长度（至少 1B），写入时 NUL 填充。
pub fn write_mmap_pair(data_path: &Path, layout_path: &Path, table: &Table) -> anyhow::Result<()> {
    let mut specs = Vec::with_capacity(table.columns().len());
    for col in table.columns() {
        let width = match &col.data {
            ColumnData::Int(_) | ColumnData::Float(_) => 8,
            ColumnData::Bool(_) => 1,
            ColumnData::Str(v) => v.iter().map(|s| s.len()).max().unwrap_or(0).max(1) as u32,
        };
        specs.push(ColumnSpec {
            name: col.name.clone(),
            dtype: col.data.dtype(),
            width,
        });
    }
    let layout = TableLayout {
        row_count: table.n_rows() as u64,
        columns: specs,
    };

    if let Some(parent) = data_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = data_path.with_extension("dat.tmp");
    {
        let mut w = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
        for row in 0..table.n_rows() {
            for (col, spec) in table.columns().iter().zip(layout.columns.iter()) {
                match &col.data {
                    ColumnData::Int(v) => w.write_all(&v[row].to_le_bytes())?,
                    ColumnData::Float(v) => w.write_all(&v[row].to_le_bytes())?,
                    ColumnData::Bool(v) => w.write_all(&[v[row] as u8])?,
                    ColumnData::Str(v) => {
                        let s = v[row].as_bytes();
                        if s.len() > spec.width as usize {
                            anyhow::bail!("string wider than layout in column {}", col.name);
                        }
                        w.write_all(s)?;
                        for _ in s.len()..spec.width as usize {
                            w.write_all(&[0u8])?;
                        }
                    }
                }
            }
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, data_path)?;

    store::write_framed(layout_path, &layout)?;
    Ok(())
}
