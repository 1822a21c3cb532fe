//! Persistent selection catalogue: the local source of truth for prices,
//! inventory and capacity.

use std::{collections::BTreeMap, io::ErrorKind, ops::RangeInclusive, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};

pub const SELECTION_MIN: u16 = 1;
pub const SELECTION_MAX: u16 = 100;
pub const TRAY_MAX: u8 = 9;

/// Initial slot depth for entries created before the VMC reports theirs.
const DEFAULT_CAPACITY: u8 = 5;

pub fn tray_of(selection: u16) -> u8 {
    ((selection - 1) / 10) as u8
}

/// The ten selections making up one tray: `10·tray+1 ..= 10·tray+10`.
pub fn tray_selections(tray: u8) -> RangeInclusive<u16> {
    let first = tray as u16 * 10 + 1;
    first..=first + 9
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub selection: u16,
    pub tray: u8,
    pub price_minor: u32,
    pub inventory: u8,
    pub capacity: u8,
    pub product_id: u16,
    pub product_name: String,
}

impl CatalogueEntry {
    fn empty(selection: u16) -> Self {
        Self {
            selection,
            tray: tray_of(selection),
            price_minor: 0,
            inventory: 0,
            capacity: DEFAULT_CAPACITY,
            product_id: 0,
            product_name: String::new(),
        }
    }
}

/// A partial write; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub price_minor: Option<u32>,
    pub inventory: Option<u8>,
    pub capacity: Option<u8>,
    pub product_id: Option<u16>,
    pub product_name: Option<String>,
}

impl EntryPatch {
    pub fn price(price_minor: u32) -> Self {
        Self {
            price_minor: Some(price_minor),
            ..Self::default()
        }
    }

    pub fn inventory(inventory: u8) -> Self {
        Self {
            inventory: Some(inventory),
            ..Self::default()
        }
    }

    pub fn capacity(capacity: u8) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    entries: BTreeMap<u16, CatalogueEntry>,
}

/// Handle to the shared store. Readers proceed concurrently; writers are
/// serialized by the lock and every write hits disk before returning.
#[derive(Debug, Clone)]
pub struct Catalogue {
    inner: Arc<RwLock<Inner>>,
}

impl Catalogue {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = match fs::read_to_string(&path).await {
            Ok(raw) => {
                let listed: Vec<CatalogueEntry> = serde_json::from_str(&raw)?;
                listed.into_iter().map(|e| (e.selection, e)).collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(Inner { path, entries })),
        })
    }

    pub async fn get(&self, selection: u16) -> Option<CatalogueEntry> {
        self.inner.read().await.entries.get(&selection).cloned()
    }

    pub async fn list(&self) -> Vec<CatalogueEntry> {
        self.inner.read().await.entries.values().cloned().collect()
    }

    pub async fn upsert(&self, selection: u16, patch: EntryPatch) -> Result<CatalogueEntry> {
        check_selection(selection)?;
        let mut inner = self.inner.write().await;
        let entry = apply(&mut inner.entries, selection, &patch);
        persist(&inner).await?;
        Ok(entry)
    }

    /// Update all ten selections of `tray` in one durable write.
    pub async fn upsert_tray(&self, tray: u8, patch: EntryPatch) -> Result<Vec<CatalogueEntry>> {
        if tray > TRAY_MAX {
            bail!("tray {tray} out of range 0..={TRAY_MAX}");
        }
        let mut inner = self.inner.write().await;
        let updated = tray_selections(tray)
            .map(|s| apply(&mut inner.entries, s, &patch))
            .collect();
        persist(&inner).await?;
        Ok(updated)
    }

    /// Update every selection in one durable write.
    pub async fn upsert_all(&self, patch: EntryPatch) -> Result<Vec<CatalogueEntry>> {
        let mut inner = self.inner.write().await;
        let updated = (SELECTION_MIN..=SELECTION_MAX)
            .map(|s| apply(&mut inner.entries, s, &patch))
            .collect();
        persist(&inner).await?;
        Ok(updated)
    }

    /// Take one unit out of a slot after a successful vend, stopping at zero.
    /// Returns the remaining inventory.
    pub async fn decrement_inventory(&self, selection: u16) -> Result<u8> {
        check_selection(selection)?;
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(&selection) else {
            bail!("selection {selection} not in catalogue");
        };
        entry.inventory = entry.inventory.saturating_sub(1);
        let remaining = entry.inventory;
        persist(&inner).await?;
        Ok(remaining)
    }
}

fn check_selection(selection: u16) -> Result<()> {
    if !(SELECTION_MIN..=SELECTION_MAX).contains(&selection) {
        bail!("selection {selection} out of range {SELECTION_MIN}..={SELECTION_MAX}");
    }
    Ok(())
}

fn apply(
    entries: &mut BTreeMap<u16, CatalogueEntry>,
    selection: u16,
    patch: &EntryPatch,
) -> CatalogueEntry {
    let entry = entries
        .entry(selection)
        .or_insert_with(|| CatalogueEntry::empty(selection));
    if let Some(price) = patch.price_minor {
        entry.price_minor = price;
    }
    if let Some(capacity) = patch.capacity {
        entry.capacity = capacity;
    }
    if let Some(inventory) = patch.inventory {
        entry.inventory = inventory;
    }
    // inventory never exceeds capacity
    entry.inventory = entry.inventory.min(entry.capacity);
    if let Some(product_id) = patch.product_id {
        entry.product_id = product_id;
    }
    if let Some(name) = &patch.product_name {
        entry.product_name = name.clone();
    }
    entry.clone()
}

/// Durable write: serialize to a sibling temp file, sync, then rename over
/// the live document so a crash leaves either the old or the new contents.
async fn persist(inner: &Inner) -> Result<()> {
    let listed: Vec<&CatalogueEntry> = inner.entries.values().collect();
    let serialized = serde_json::to_string_pretty(&listed)?;
    let tmp = inner.path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(serialized.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, &inner.path).await?;
    Ok(())
}
