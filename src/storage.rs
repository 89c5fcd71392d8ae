use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::debug;

/// Ёмкость канала уведомлений. Отставшие получатели переподтянут
/// состояние сами, поэтому маленькой ёмкости достаточно.
const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// Переменная окружения, переопределяющая путь к файлу хранилища.
pub const STORE_PATH_ENV: &str = "TM_STORE";

/// Событие изменения: имя области и затронутые ключи.
#[derive(Debug, Clone)]
pub struct StorageChange {
    pub area: &'static str,
    pub keys: Vec<String>,
}

impl StorageChange {
    pub fn touches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Асинхронное key-value хранилище с подпиской на изменения.
///
/// Событие уходит только когда значение реально поменялось; запись
/// того же значения и удаление отсутствующего ключа события не дают.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Подписка на события изменения ключей этой области.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Имя области хранения.
    fn area(&self) -> &'static str;
}

/// Хранилище в памяти: для тестов и для нескольких видов поверх
/// одного набора данных в одном процессе.
pub struct MemoryBackend {
    map: Mutex<Map<String, Value>>,
    tx: broadcast::Sender<StorageChange>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            map: Mutex::new(Map::new()),
            tx,
        }
    }

    fn notify(&self, key: &str) {
        // Получателей может не быть, это не ошибка.
        let _ = self.tx.send(StorageChange {
            area: self.area(),
            keys: vec![key.to_string()],
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let changed = {
            let mut map = self.map.lock();
            let changed = map.get(key) != Some(&value);
            map.insert(key.to_string(), value);
            changed
        };
        if changed {
            self.notify(key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = self.map.lock().remove(key).is_some();
        if existed {
            self.notify(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }

    fn area(&self) -> &'static str {
        "memory"
    }
}

/// Файловое хранилище: один JSON-объект на диске.
///
/// Чтение-изменение-запись файла сериализуется внутренним замком,
/// поэтому конкурентные операции одного процесса не теряют правок.
/// Изменения файла чужим процессом событий не дают.
pub struct FileBackend {
    path: PathBuf,
    io: tokio::sync::Mutex<()>,
    tx: broadcast::Sender<StorageChange>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            io: tokio::sync::Mutex::new(()),
            tx,
        }
    }

    /// Отсутствующий и пустой файл читаются как пустой объект.
    async fn read_map(&self) -> Result<Map<String, Value>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(map)?;
        tokio::fs::write(&self.path, data).await?;
        set_perms_restrictive(&self.path)?;
        Ok(())
    }

    fn notify(&self, key: &str) {
        let _ = self.tx.send(StorageChange {
            area: self.area(),
            keys: vec![key.to_string()],
        });
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let _io = self.io.lock().await;
        Ok(self.read_map().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let changed = {
            let _io = self.io.lock().await;
            let mut map = self.read_map().await?;
            let changed = map.get(key) != Some(&value);
            map.insert(key.to_string(), value);
            self.write_map(&map).await?;
            changed
        };
        if changed {
            debug!(key, path = %self.path.display(), "value persisted");
            self.notify(key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = {
            let _io = self.io.lock().await;
            let mut map = self.read_map().await?;
            let existed = map.remove(key).is_some();
            if existed {
                self.write_map(&map).await?;
            }
            existed
        };
        if existed {
            self.notify(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }

    fn area(&self) -> &'static str {
        "local"
    }
}

/// Путь по умолчанию: `$TM_STORE`, иначе `<data_dir>/tm-store/storage.json`.
pub fn default_store_path() -> Result<PathBuf, StoreError> {
    if let Ok(path) = std::env::var(STORE_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let mut dir = dirs::data_dir().ok_or_else(|| {
        StoreError::Storage(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "cannot determine user data dir",
        ))
    })?;
    dir.push("tm-store");
    dir.push("storage.json");
    Ok(dir)
}

// Файл с секретами держим недоступным для группы и остальных
#[cfg(unix)]
fn set_perms_restrictive(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_perms_restrictive(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn expect_change(
        rx: &mut broadcast::Receiver<StorageChange>,
        key: &str,
    ) -> StorageChange {
        let change = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("change event should arrive")
            .unwrap();
        assert!(change.touches(key));
        change
    }

    #[tokio::test]
    async fn memory_set_get_remove() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("k").await.unwrap(), None);

        backend.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(json!({"a": 1})));

        backend.remove("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn events_fire_only_on_real_change() {
        let backend = MemoryBackend::new();
        let mut rx = backend.subscribe();

        backend.set("k", json!(1)).await.unwrap();
        let change = expect_change(&mut rx, "k").await;
        assert_eq!(change.area, "memory");

        // То же значение: событие не уходит.
        backend.set("k", json!(1)).await.unwrap();
        // Удаление отсутствующего ключа: событие не уходит.
        backend.remove("missing").await.unwrap();

        backend.set("k", json!(2)).await.unwrap();
        expect_change(&mut rx, "k").await;
        assert!(
            rx.try_recv().is_err(),
            "no-op writes must not produce events"
        );
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_change() {
        let backend = MemoryBackend::new();
        let mut first = backend.subscribe();
        let mut second = backend.subscribe();

        backend.set("k", json!("v")).await.unwrap();

        expect_change(&mut first, "k").await;
        expect_change(&mut second, "k").await;
    }

    #[tokio::test]
    async fn file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let writer = FileBackend::new(&path);
        writer.set("k", json!({"secret": "S"})).await.unwrap();
        assert_eq!(writer.area(), "local");

        let reader = FileBackend::new(&path);
        assert_eq!(
            reader.get("k").await.unwrap(),
            Some(json!({"secret": "S"}))
        );

        writer.remove("k").await.unwrap();
        assert_eq!(reader.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("absent.json"));
        assert_eq!(backend.get("anything").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let backend = FileBackend::new(&path);
        assert!(matches!(
            backend.get("k").await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stored_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let backend = FileBackend::new(&path);
        backend.set("k", json!(1)).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
