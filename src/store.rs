use crate::entry::{StoredValue, TokenCollection};
use crate::error::StoreError;
use crate::storage::{StorageBackend, StorageChange};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Единственный ключ хранилища, под которым лежит вся коллекция токенов.
pub const STORAGE_KEY: &str = "TOTP";

/// Адаптер над key-value хранилищем: читает и пишет коллекцию токенов
/// целиком и прячет от остального кода старый строковый формат значений.
#[derive(Clone)]
pub struct SecretStore {
    backend: Arc<dyn StorageBackend>,
}

impl SecretStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Прочитать коллекцию. Отсутствие ключа читается как пустая
    /// коллекция; каждое значение нормализуется к каноническому виду.
    pub async fn load(&self) -> Result<TokenCollection, StoreError> {
        let Some(value) = self.backend.get(STORAGE_KEY).await? else {
            return Ok(TokenCollection::new());
        };
        let raw: BTreeMap<String, StoredValue> = serde_json::from_value(value)?;
        Ok(raw
            .into_iter()
            .map(|(label, value)| (label, value.normalize()))
            .collect())
    }

    /// Записать коллекцию целиком, всегда в каноническом виде записи.
    pub async fn save(&self, tokens: &TokenCollection) -> Result<(), StoreError> {
        let value = serde_json::to_value(tokens)?;
        self.backend.set(STORAGE_KEY, value).await?;
        debug!(count = tokens.len(), "token collection saved");
        Ok(())
    }

    /// Подписка на события нижнего хранилища (все ключи области).
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StorageChange> {
        self.backend.subscribe()
    }

    /// Касается ли событие коллекции токенов.
    pub fn touches_tokens(change: &StorageChange) -> bool {
        change.touches(STORAGE_KEY)
    }
}
