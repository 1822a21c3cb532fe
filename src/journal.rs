//! Append-only sales journal.
//!
//! One JSON document per line; records are flushed and synced before the
//! append returns so a crash never loses an acknowledged sale.

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleStatus {
    /// payment approved, dispense not yet attempted
    Approved,
    Declined,
    /// product dispensed
    Success,
    /// dispense failed
    Error,
    /// payment refunded after a failed dispense
    Reversed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleRecord {
    pub sale_id: Uuid,
    pub txn_id: String,
    pub selection: u16,
    pub status: SaleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub product_name: String,
    pub amount_minor: u32,
    pub date: String,
    pub time: String,
    /// epoch seconds, for ordering
    pub epoch: i64,
}

impl SaleRecord {
    pub fn now(
        txn_id: &str,
        selection: u16,
        status: SaleStatus,
        reason: Option<String>,
        product_name: &str,
        amount_minor: u32,
    ) -> Self {
        let stamp = Local::now();
        Self {
            sale_id: Uuid::new_v4(),
            txn_id: txn_id.to_owned(),
            selection,
            status,
            reason,
            product_name: product_name.to_owned(),
            amount_minor,
            date: stamp.format("%Y-%m-%d").to_string(),
            time: stamp.format("%H:%M:%S").to_string(),
            epoch: stamp.timestamp(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    file: File,
}

#[derive(Debug, Clone)]
pub struct SalesJournal {
    inner: Arc<Mutex<Inner>>,
}

impl SalesJournal {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { path, file })),
        })
    }

    pub async fn append(&self, record: &SaleRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut inner = self.inner.lock().await;
        inner.file.write_all(line.as_bytes()).await?;
        inner.file.flush().await?;
        inner.file.sync_data().await?;
        debug!(txn = %record.txn_id, status = ?record.status, "sale journaled");
        Ok(())
    }

    /// Every record in append order. Lines that fail to parse are skipped
    /// with a warning rather than poisoning the export.
    pub async fn list(&self) -> Result<Vec<SaleRecord>> {
        let path = self.inner.lock().await.path.clone();
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping malformed journal line: {e}"),
            }
        }
        Ok(records)
    }
}
