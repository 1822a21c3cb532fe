//! Small shared utilities.

use std::{
    ops::Deref,
    path::{Path, PathBuf},
};

use anyhow::Result;

/// A value that is moved out exactly once, but can still be borrowed through
/// `Deref` until then.
#[derive(Debug)]
pub struct Take<T> {
    inner: Option<T>,
}

impl<T> Take<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Some(value) }
    }

    /// # Panics
    /// if the value was already taken
    pub fn take(&mut self) -> T {
        self.inner.take().expect("value already taken")
    }
}

impl<T> Deref for Take<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_ref().expect("value already taken")
    }
}

/// Path helper for files living in the persistent data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_exists(&self) -> Result<()> {
        if self.root.exists() {
            if !self.root.is_dir() {
                error!("data directory path {:?} exists and is a file", self.root);
                bail!("data dir exists as a file");
            }
        } else {
            info!("creating data directory at {:?}", self.root);
            tokio::fs::create_dir_all(&self.root).await?;
        }
        Ok(())
    }

    pub fn file<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.root.join(name.as_ref())
    }
}
