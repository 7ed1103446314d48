use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

/// 帧式文件：`magic | version | state | body_len | xxh3(body)` + bincode body。
///
/// canonical 表、mmap 布局描述、分区 coadd 文件共用同一套框架。
///
/// 落盘流程（原子替换）：
/// 1) 序列化 body，计算 len/checksum
/// 2) 写 `<path>.tmp`（header + body），fsync
/// 3) rename(tmp, target) —— POSIX 原子替换
/// 4) fsync(dir) —— 目录项落盘
///
/// 读取时校验 magic + version + state + len + checksum，任何不一致都返回
/// Err —— 上层把它当作该层 miss，而不是致命错误。
const MAGIC: u32 = 0x5AC4_0001;
const VERSION: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8;

pub fn write_framed<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let body = bincode::serialize(value)?;
    let checksum = xxh3_64(&body);

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&STATE_COMMITTED.to_le_bytes());
    header[12..20].copy_from_slice(&(body.len() as u64).to_le_bytes());
    header[20..28].copy_from_slice(&checksum.to_le_bytes());

    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&header)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn read_framed<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = std::fs::read(path)?;
    if data.len() < HEADER_SIZE {
        anyhow::bail!("framed file too small: {:?}", path);
    }

    let magic = u32::from_le_bytes(data[0..4].try_into()?);
    let version = u32::from_le_bytes(data[4..8].try_into()?);
    let state = u32::from_le_bytes(data[8..12].try_into()?);
    let body_len = u64::from_le_bytes(data[12..20].try_into()?) as usize;
    let stored_checksum = u64::from_le_bytes(data[20..28].try_into()?);

    if magic != MAGIC {
        anyhow::bail!("magic mismatch in {:?}: {:#x}", path, magic);
    }
    if version != VERSION {
        anyhow::bail!("version mismatch in {:?}: {}", path, version);
    }
    if state != STATE_COMMITTED {
        anyhow::bail!("file {:?} not committed", path);
    }

    let body = &data[HEADER_SIZE..];
    if body.len() != body_len {
        anyhow::bail!("body length mismatch in {:?}", path);
    }
    let computed = xxh3_64(body);
    if computed != stored_checksum {
        anyhow::bail!(
            "checksum mismatch in {:?}: {:#x} != {:#x}",
            path,
            computed,
            stored_checksum
        );
    }

    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::table::{ColumnData, Table};

    fn unique_tmp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("spectra-api-{}-{}", tag, nanos))
    }

    fn sample_table() -> Table {
        let mut t = Table::new();
        t.push_column("TARGETID", ColumnData::Int(vec![1, 2, 3])).unwrap();
        t.push_column("Z", ColumnData::Float(vec![0.5, 1.5, 2.5])).unwrap();
        t
    }

    #[test]
    fn roundtrip() {
        let dir = unique_tmp_dir("framed");
        let path = dir.join("zcatalog").join("zall-pix-test.tbl");
        let table = sample_table();

        write_framed(&path, &table).unwrap();
        let loaded: Table = read_framed(&path).unwrap();
        assert_eq!(loaded, table);
    }

    #[test]
    fn corrupt_body_is_rejected() {
        let dir = unique_tmp_dir("framed-corrupt");
        let path = dir.join("t.tbl");
        write_framed(&path, &sample_table()).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        assert!(read_framed::<Table>(&path).is_err());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = unique_tmp_dir("framed-trunc");
        let path = dir.join("t.tbl");
        write_framed(&path, &sample_table()).unwrap();

        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() / 2]).unwrap();

        assert!(read_framed::<Table>(&path).is_err());
    }
}
