//! Local outbox: append-only record of notifications that were not
//! transmitted, kept as one JSON array under a single store key.
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::compose::ComposedMessage;
use crate::model::{NotificationPayload, OutboxEntry, Recipient};
use crate::store::KvStore;

pub const OUTBOX_KEY: &str = "specimen_notify.outbox";

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox store error: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("outbox encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Outbox {
    store: Arc<dyn KvStore>,
    key: String,
    // Serializes the read-modify-write in `append` and `clear_all`.
    write_lock: Mutex<()>,
    last_id: AtomicI64,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_key(store, OUTBOX_KEY)
    }

    pub fn with_key(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            write_lock: Mutex::new(()),
            last_id: AtomicI64::new(0),
        }
    }

    /// Millisecond timestamp, bumped when needed so ids never repeat within
    /// this process.
    fn next_id(&self, now_ms: i64) -> String {
        let mut prev = self.last_id.load(Ordering::Relaxed);
        loop {
            let candidate = now_ms.max(prev + 1);
            match self.last_id.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate.to_string(),
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn new_entry(
        &self,
        recipient: &Recipient,
        message: &ComposedMessage,
        payload: &NotificationPayload,
    ) -> OutboxEntry {
        let now = Utc::now();
        OutboxEntry {
            id: self.next_id(now.timestamp_millis()),
            timestamp: now,
            recipient_address: recipient.address.clone(),
            recipient_name: recipient.name.clone(),
            subject: message.subject.clone(),
            html: message.html.clone(),
            text: message.text.clone(),
            payload: payload.clone(),
        }
    }

    /// Stored entries. Unreadable or corrupt data is logged and read as empty.
    async fn load(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<OutboxEntry>>(&raw) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(?err, key = %self.key, "outbox contents unreadable; treating as empty");
                Ok(Vec::new())
            }
        }
    }

    #[instrument(skip_all, fields(id = %entry.id))]
    pub async fn append(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await.map_err(|err| {
            error!(%err, "failed to read outbox; dropping write");
            err
        })?;
        entries.push(entry);
        let encoded = serde_json::to_string(&entries)?;
        if let Err(err) = self.store.set(&self.key, &encoded).await {
            error!(?err, "failed to write outbox");
            return Err(err.into());
        }
        info!(total = entries.len(), "saved notification to outbox");
        Ok(())
    }

    /// Every stored entry, oldest first. The returned vector is a fresh copy.
    pub async fn list_all(&self) -> Vec<OutboxEntry> {
        match self.load().await {
            Ok(entries) => entries,
            Err(err) => {
                error!(%err, "failed to read outbox");
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.list_all().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear_all(&self) -> Result<(), OutboxError> {
        let _guard = self.write_lock.lock().await;
        if let Err(err) = self.store.remove(&self.key).await {
            error!(?err, "failed to clear outbox");
            return Err(err.into());
        }
        info!("outbox cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{compose, Branding};
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;

    fn payload() -> NotificationPayload {
        NotificationPayload {
            collection_name: "Amostra 3".into(),
            collection_date: "2024-02-10".into(),
            suggester_name: "Ana".into(),
            suggester_address: "ana@example.org".into(),
            justification: "tricomas".into(),
            confidence: Some(2),
            ..Default::default()
        }
    }

    fn recipient() -> Recipient {
        Recipient {
            address: "owner@example.org".into(),
            name: "Owner".into(),
        }
    }

    fn entry(outbox: &Outbox) -> OutboxEntry {
        let p = payload();
        outbox.new_entry(&recipient(), &compose(&p, &Branding::default()), &p)
    }

    #[tokio::test]
    async fn append_then_list_returns_entry_last() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        let first = entry(&outbox);
        let second = entry(&outbox);
        outbox.append(first.clone()).await.unwrap();
        outbox.append(second.clone()).await.unwrap();
        let all = outbox.list_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all.last(), Some(&second));
        assert_eq!(all[0], first);
    }

    #[tokio::test]
    async fn clear_then_list_is_empty() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        outbox.append(entry(&outbox)).await.unwrap();
        outbox.clear_all().await.unwrap();
        assert!(outbox.list_all().await.is_empty());
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn listed_copy_does_not_alias_storage() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        outbox.append(entry(&outbox)).await.unwrap();
        let mut copy = outbox.list_all().await;
        copy[0].subject = "changed".into();
        copy.clear();
        let stored = outbox.list_all().await;
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0].subject, "changed");
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        let ids: Vec<i64> = (0..50)
            .map(|_| entry(&outbox).id.parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn corrupt_contents_read_as_empty_and_are_replaced() {
        let store = Arc::new(MemoryStore::new());
        store.set(OUTBOX_KEY, "{not json").await.unwrap();
        let outbox = Outbox::new(store.clone());
        assert!(outbox.list_all().await.is_empty());
        outbox.append(entry(&outbox)).await.unwrap();
        assert_eq!(outbox.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let outbox = Arc::new(Outbox::new(Arc::new(MemoryStore::new())));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let outbox = outbox.clone();
            handles.push(tokio::spawn(async move {
                let e = entry(&outbox);
                outbox.append(e).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(outbox.len().await, 20);
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Err(anyhow!("disk unavailable"))
        }
        async fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            Err(anyhow!("disk unavailable"))
        }
        async fn remove(&self, _key: &str) -> anyhow::Result<()> {
            Err(anyhow!("disk unavailable"))
        }
    }

    #[tokio::test]
    async fn store_failures_do_not_panic() {
        let outbox = Outbox::new(Arc::new(BrokenStore));
        assert!(outbox.list_all().await.is_empty());
        assert!(matches!(
            outbox.append(entry(&outbox)).await,
            Err(OutboxError::Store(_))
        ));
        assert!(matches!(
            outbox.clear_all().await,
            Err(OutboxError::Store(_))
        ));
    }
}
