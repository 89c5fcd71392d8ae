use crate::entry::{TokenCollection, TokenRecord, effective_period};
use crate::error::StoreError;
use crate::store::SecretStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Реестр токенов: проекция коллекции в памяти плюс команды add/remove.
///
/// Каждое перечитывание получает порядковый номер до обращения к
/// хранилищу, и проекция принимает только результаты новее уже
/// применённых: опоздавший ответ не затирает более свежий. Мутации
/// одного реестра сериализованы; два независимых реестра работают по
/// принципу «последняя запись побеждает».
pub struct TokenRegistry {
    store: SecretStore,
    projection: Mutex<Projection>,
    next_seq: AtomicU64,
    write_gate: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<TokenCollection>,
}

#[derive(Default)]
struct Projection {
    tokens: TokenCollection,
    applied_seq: u64,
}

impl TokenRegistry {
    pub fn new(store: SecretStore) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            store,
            projection: Mutex::new(Projection::default()),
            next_seq: AtomicU64::new(0),
            write_gate: tokio::sync::Mutex::new(()),
            updates,
        }
    }

    /// Перечитать коллекцию из хранилища и заменить проекцию целиком.
    /// Возвращает проекцию после применения; при отказе чтения прежняя
    /// проекция остаётся нетронутой.
    pub async fn refresh(&self) -> Result<TokenCollection, StoreError> {
        // Номер резервируется до чтения: что прочитано позже по началу,
        // то и устареет, даже если ответ пришёл раньше.
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let tokens = self.store.load().await?;

        let (current, applied) = {
            let mut projection = self.projection.lock();
            if seq > projection.applied_seq {
                projection.applied_seq = seq;
                projection.tokens = tokens;
                (projection.tokens.clone(), true)
            } else {
                debug!(
                    seq,
                    applied = projection.applied_seq,
                    "stale refresh discarded"
                );
                (projection.tokens.clone(), false)
            }
        };

        if applied {
            // Получателей может не быть, это не ошибка.
            let _ = self.updates.send(current.clone());
        }
        Ok(current)
    }

    /// Добавить запись или заменить одноимённую. Пустые метка и секрет
    /// отклоняются до какого-либо обращения к хранилищу.
    pub async fn add(&self, label: &str, record: TokenRecord) -> Result<(), StoreError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(StoreError::validation("label must not be empty"));
        }
        let secret = record.secret.trim();
        if secret.is_empty() {
            return Err(StoreError::validation("secret must not be empty"));
        }
        let record = TokenRecord {
            secret: secret.to_string(),
            period: effective_period(record.period),
            url: record.url,
        };

        // Чтение-изменение-запись всей коллекции под одним замком:
        // добавления разных меток подряд не теряют друг друга.
        let _gate = self.write_gate.lock().await;
        let mut tokens = self.store.load().await?;
        tokens.insert(label.to_string(), record);
        self.store.save(&tokens).await?;
        debug!(label, "token stored");
        Ok(())
    }

    /// Удалить запись. Отсутствие метки не ошибка.
    pub async fn remove(&self, label: &str) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        let mut tokens = self.store.load().await?;
        if tokens.remove(label.trim()).is_none() {
            debug!(label, "token absent, nothing to remove");
            return Ok(());
        }
        self.store.save(&tokens).await?;
        debug!(label, "token removed");
        Ok(())
    }

    /// Запись по метке из текущей проекции.
    pub fn get(&self, label: &str) -> Option<TokenRecord> {
        self.projection.lock().tokens.get(label.trim()).cloned()
    }

    /// Снимок текущей проекции.
    pub fn snapshot(&self) -> TokenCollection {
        self.projection.lock().tokens.clone()
    }

    /// Подписка на снимки; один снимок на каждое применённое
    /// перечитывание.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenCollection> {
        self.updates.subscribe()
    }

    /// Фоновая синхронизация: каждое событие хранилища с ключом
    /// коллекции запускает перечитывание. Других путей согласования
    /// между видами нет.
    pub fn spawn_sync(self: Arc<Self>) -> JoinHandle<()> {
        let registry = self;
        let mut changes = registry.store.subscribe_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if SecretStore::touches_tokens(&change) => {
                        if let Err(e) = registry.refresh().await {
                            warn!("refresh after storage change failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change events lagged, refreshing anyway");
                        if let Err(e) = registry.refresh().await {
                            warn!("refresh after lag failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
