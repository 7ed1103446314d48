use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use ignore::WalkBuilder;

use crate::error::ApiError;
use crate::query::request::CacheKey;

/// 时间戳文件名格式：定宽小数秒，保证字典序 == 时间序。
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// 磁盘响应缓存。
///
/// 布局：每个缓存键一个目录，每次计算结果一个文件
/// `<key>/<ISO-8601 时间戳>.<kind>.<ext>`。同键并发写各写各的时间戳文件，
/// 不做去重——lookup 永远选最新，浪费但安全。
///
/// clean / emergency_evict 与请求流量并发运行；"文件已经没了" 在这里
/// 是良性竞态，一律当 miss / 已清理处理。
pub struct ResponseCache {
    root: PathBuf,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// 取键目录下时间戳前缀字典序最大（= 最新）的文件；
    /// 过旧返回 None。目录不存在或为空是 miss，不是错误。
    /// `max_age` 为零表示永不过期。
    pub fn lookup(&self, key: &CacheKey, now: DateTime<Utc>, max_age: Duration) -> Option<PathBuf> {
        let dir = self.key_dir(key);
        let entries = std::fs::read_dir(&dir).ok()?;

        let mut newest: Option<(String, PathBuf)> = None;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(ts) = timestamp_prefix(name) else { continue };
            match &newest {
                Some((best, _)) if best.as_str() >= ts => {}
                _ => newest = Some((ts.to_string(), entry.path())),
            }
        }

        let (ts, path) = newest?;
        let created = NaiveDateTime::parse_from_str(&ts, TS_FORMAT).ok()?.and_utc();
        let age = now - created;
        tracing::debug!("cache entry {:?} age {}", path, age);
        if max_age.is_zero() || age < max_age {
            Some(path)
        } else {
            tracing::debug!("cache entry stale, rebuilding");
            None
        }
    }

    /// 写入一个新的时间戳文件。文件系统错误包装成 CacheWrite，
    /// 调用方记日志后照常返回计算结果。
    pub fn store(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        kind: &str,
        ext: &str,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, ApiError> {
        let dir = self.key_dir(key);
        std::fs::create_dir_all(&dir).map_err(|e| ApiError::CacheWrite {
            path: dir.clone(),
            source: e,
        })?;

        let name = format!("{}.{}.{}", now.format(TS_FORMAT), kind, ext);
        let path = dir.join(name);
        std::fs::write(&path, bytes).map_err(|e| ApiError::CacheWrite {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }

    /// 周期性清扫（小时/天级节奏）：删除访问时间超过 max_age 的文件，
    /// 顺手摘掉空掉的键目录。返回删除的文件数。
    pub fn clean(&self, max_age: Duration) -> anyhow::Result<u64> {
        if !self.root.exists() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut removed = 0u64;
        let mut dirs: Vec<PathBuf> = Vec::new();

        for entry in WalkBuilder::new(&self.root)
            .standard_filters(false)
            .build()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                if path != self.root {
                    dirs.push(path.to_path_buf());
                }
                continue;
            }
            let stamp = meta.accessed().or_else(|_| meta.modified());
            let Ok(stamp) = stamp else { continue };
            let age = now - DateTime::<Utc>::from(stamp);
            if age > max_age {
                // 并发清理下文件可能已经没了：良性
                if std::fs::remove_file(path).is_ok() {
                    removed += 1;
                }
            }
        }

        for dir in dirs {
            if let Ok(mut it) = std::fs::read_dir(&dir) {
                if it.next().is_none() {
                    let _ = std::fs::remove_dir(&dir);
                }
            }
        }

        tracing::info!("cache clean removed {} files", removed);
        Ok(removed)
    }

    /// 紧急清空：总量超限时整树删除。粗暴但可接受——缓存只是性能优化，
    /// 正在 lookup 的读者把消失的条目当 miss。返回是否触发。
    pub fn emergency_evict(&self, max_size_bytes: u64) -> anyhow::Result<bool> {
        let total = self.total_size();
        if total < max_size_bytes {
            tracing::debug!("cache size {} within bound {}", total, max_size_bytes);
            return Ok(false);
        }
        tracing::warn!(
            "cache size {} exceeds bound {}, evicting entire cache root",
            total,
            max_size_bytes
        );
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn total_size(&self) -> u64 {
        if !self.root.exists() {
            return 0;
        }
        WalkBuilder::new(&self.root)
            .standard_filters(false)
            .build()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// `<ts>.<kind>.<ext>` 去掉最后两段就是时间戳前缀
/// （时间戳自身含一个小数点，必须从右侧切）。
fn timestamp_prefix(name: &str) -> Option<&str> {
    let mut it = name.rsplitn(3, '.');
    let _ext = it.next()?;
    let _kind = it.next()?;
    it.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::request::{ApiRequest, QueryParams, RequestedData, ResponseType};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("spectra-api-{}-{}", tag, nanos))
    }

    fn key() -> CacheKey {
        ApiRequest {
            requested_data: RequestedData::Zcat,
            response_type: ResponseType::Download,
            release: "fuji".to_string(),
            params: QueryParams::Targets {
                target_ids: vec![1, 2],
            },
            filters: Default::default(),
        }
        .cache_key()
        .unwrap()
    }

    #[test]
    fn lookup_on_empty_key_is_miss_not_error() {
        let cache = ResponseCache::new(unique_tmp_dir("cache-empty"));
        assert!(cache.lookup(&key(), Utc::now(), Duration::minutes(60)).is_none());
    }

    #[test]
    fn staleness_boundaries() {
        let cache = ResponseCache::new(unique_tmp_dir("cache-stale"));
        let k = key();
        let t0 = Utc::now();
        cache.store(&k, b"payload", "zcat", "json", t0).unwrap();

        let max_age = Duration::minutes(60);
        assert!(cache
            .lookup(&k, t0 + max_age - Duration::seconds(1), max_age)
            .is_some());
        assert!(cache
            .lookup(&k, t0 + max_age + Duration::seconds(1), max_age)
            .is_none());
        // max_age == 0：永不过期
        assert!(cache
            .lookup(&k, t0 + Duration::days(3650), Duration::zero())
            .is_some());
    }

    #[test]
    fn lookup_picks_newest_entry() {
        let cache = ResponseCache::new(unique_tmp_dir("cache-newest"));
        let k = key();
        let t0 = Utc::now();
        cache.store(&k, b"old", "zcat", "json", t0).unwrap();
        let newer = cache
            .store(&k, b"new", "zcat", "json", t0 + Duration::seconds(5))
            .unwrap();

        let hit = cache.lookup(&k, t0 + Duration::seconds(6), Duration::zero()).unwrap();
        assert_eq!(hit, newer);
        assert_eq!(std::fs::read(hit).unwrap(), b"new");
    }

    #[test]
    fn clean_removes_old_files_and_keeps_fresh() {
        let cache = ResponseCache::new(unique_tmp_dir("cache-clean"));
        let k = key();
        cache.store(&k, b"x", "zcat", "json", Utc::now()).unwrap();

        // 足够长的期限：什么都不删
        assert_eq!(cache.clean(Duration::hours(1)).unwrap(), 0);
        assert!(cache.lookup(&k, Utc::now(), Duration::zero()).is_some());

        std::thread::sleep(std::time::Duration::from_millis(30));
        let removed = cache.clean(Duration::milliseconds(1)).unwrap();
        assert_eq!(removed, 1);
        assert!(cache.lookup(&k, Utc::now(), Duration::zero()).is_none());
    }

    #[test]
    fn eviction_wipes_all_keys() {
        let cache = ResponseCache::new(unique_tmp_dir("cache-evict"));
        let k = key();
        cache.store(&k, b"0123456789", "zcat", "json", Utc::now()).unwrap();

        // 限额远大于用量：不触发
        assert!(!cache.emergency_evict(1 << 30).unwrap());
        assert!(cache.lookup(&k, Utc::now(), Duration::zero()).is_some());

        assert!(cache.emergency_evict(1).unwrap());
        assert!(cache.lookup(&k, Utc::now(), Duration::zero()).is_none());
        // root 已不存在：用量归零，不再触发，也不报错
        assert!(!cache.emergency_evict(1).unwrap());
    }

    #[test]
    fn timestamp_prefix_strips_kind_and_ext() {
        assert_eq!(
            timestamp_prefix("2026-08-07T12:00:00.123456.zcat.json"),
            Some("2026-08-07T12:00:00.123456")
        );
        assert_eq!(timestamp_prefix("noise"), None);
    }
}
