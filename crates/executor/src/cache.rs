//! 执行结果缓存
//!
//! 以「指令 + 规范化配置 JSON」的 SHA-256 指纹为键，缓存成功结果，
//! 相同任务在 TTL 内重复下发时直接命中，跳过真实执行。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use webtask_domain::ExecutionConfig;

/// 计算任务的缓存指纹
///
/// 配置先序列化为 JSON 再参与散列。`serde_json::Value` 的对象键
/// 有序，因此字段顺序不同的等价配置会得到相同指纹。
pub fn fingerprint(instruction: &str, config: &ExecutionConfig) -> String {
    let config_json = serde_json::to_value(config)
        .map(|v| v.to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(instruction.as_bytes());
    hasher.update(b"\n");
    hasher.update(config_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
}

/// 带 TTL 的内存结果缓存，只存放成功结果
pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 查询缓存，过期条目在查询时惰性剔除
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                debug!("缓存命中: {}", &key[..12.min(key.len())]);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: Value) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// 清理所有过期条目，返回剔除数量
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use webtask_domain::ExecutionOverrides;

    #[test]
    fn test_fingerprint_deterministic() {
        let config = ExecutionConfig::default();
        let a = fingerprint("打开首页", &config);
        let b = fingerprint("打开首页", &config);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_varies_with_instruction_and_config() {
        let config = ExecutionConfig::default();
        let base = fingerprint("打开首页", &config);
        assert_ne!(base, fingerprint("打开设置页", &config));

        let overrides = ExecutionOverrides {
            navigation_timeout_ms: Some(60_000),
            ..Default::default()
        };
        let changed = config.overlay(&overrides);
        assert_ne!(base, fingerprint("打开首页", &changed));
    }

    #[test]
    fn test_get_put_and_miss() {
        let cache = ResultCache::new(Duration::from_secs(60));
        assert!(cache.get("k1").is_none());

        cache.put("k1".to_string(), json!({"ok": true}));
        assert_eq!(cache.get("k1"), Some(json!({"ok": true})));
        assert!(cache.get("k2").is_none());
    }

    #[test]
    fn test_expired_entry_removed_on_get() {
        let cache = ResultCache::new(Duration::from_millis(0));
        cache.put("k1".to_string(), json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_expired() {
        let cache = ResultCache::new(Duration::from_millis(10));
        cache.put("old".to_string(), json!(1));
        std::thread::sleep(Duration::from_millis(20));
        cache.put("fresh".to_string(), json!(2));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fresh"), Some(json!(2)));
    }
}
