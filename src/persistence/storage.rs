//! 存储端口
//!
//! 续传记录只通过 `StoragePort` 读写，具体后端由调用方注入：
//! - `MemoryStorage`: 进程内 DashMap，测试和临时会话使用
//! - `FileStorage`: 每个键一个 JSON 文件，先写临时文件再原子重命名

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("存储 I/O 失败: {0}")]
    Io(#[from] io::Error),

    #[error("存储后端不可用: {0}")]
    Unavailable(String),
}

/// 键值存储端口
///
/// 不要求事务语义，多个备份之间允许最终一致
#[async_trait]
pub trait StoragePort: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

// =====================================================
// 内存存储
// =====================================================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.get(key).map(|v| v.value().clone()))
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.iter().map(|e| e.key().clone()).collect())
    }
}

// =====================================================
// 文件存储
// =====================================================

/// 存储文件扩展名
const ITEM_EXTENSION: &str = "json";

/// 文件存储
///
/// 键经过 hex 编码作为文件名，避免 `:` 等字符在不同平台上的兼容问题
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// 创建文件存储（目录不存在时自动创建）
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!("文件存储目录: {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(key.as_bytes()), ITEM_EXTENSION))
    }

    fn decode_key(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(ITEM_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl StoragePort for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.item_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
        let path = self.item_path(key);
        // 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.item_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match Self::decode_key(&path) {
                Some(key) => keys.push(key),
                None => {
                    if path.extension().and_then(|e| e.to_str()) == Some(ITEM_EXTENSION) {
                        warn!("跳过无法解析键名的存储文件: {:?}", path);
                    }
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert!(storage.get_item("a").await.unwrap().is_none());

        storage.set_item("a", "1".to_string()).await.unwrap();
        storage.set_item("b", "2".to_string()).await.unwrap();
        assert_eq!(storage.get_item("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(storage.len(), 2);

        storage.remove_item("a").await.unwrap();
        let keys = storage.keys().await.unwrap();
        assert_eq!(keys, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::open(temp.path().join("resume")).await.unwrap();

        let key = "uploader:record:file-1";
        storage.set_item(key, "{\"x\":1}".to_string()).await.unwrap();
        assert_eq!(
            storage.get_item(key).await.unwrap().as_deref(),
            Some("{\"x\":1}")
        );

        // 覆盖写
        storage.set_item(key, "{\"x\":2}".to_string()).await.unwrap();
        assert_eq!(
            storage.get_item(key).await.unwrap().as_deref(),
            Some("{\"x\":2}")
        );

        assert_eq!(storage.keys().await.unwrap(), vec![key.to_string()]);

        storage.remove_item(key).await.unwrap();
        assert!(storage.get_item(key).await.unwrap().is_none());
        // 删除不存在的键不报错
        storage.remove_item(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_storage_ignores_foreign_files() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::open(temp.path()).await.unwrap();
        std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(temp.path().join("zz.json"), "{}").unwrap();

        storage.set_item("k", "v".to_string()).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["k".to_string()]);
    }
}
