//! Config writer contract and implementations.
//!
//! A writer accepts one named section at a time and answers asynchronously:
//! `send_section` returns a done channel and an error channel, and is free to
//! respond on either, or never. Callers bound their wait.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;

/// Completion channels for a submitted section.
pub type WriteHandle = (oneshot::Receiver<()>, oneshot::Receiver<String>);

pub trait ConfigWriter: Send + Sync {
    fn send_section(&self, name: &str, payload: Value) -> Result<WriteHandle, Error>;
}

/// Assembles sections into one JSON document and writes it atomically to a
/// file via temp-file-and-rename, answering on the done channel once the
/// rename lands.
pub struct FileWriter {
    path: PathBuf,
    sections: Mutex<BTreeMap<String, Value>>,
}

impl FileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileWriter {
            path: path.into(),
            sections: Mutex::new(BTreeMap::new()),
        }
    }
}

impl ConfigWriter for FileWriter {
    fn send_section(&self, name: &str, payload: Value) -> Result<WriteHandle, Error> {
        let document = {
            let mut sections = self
                .sections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sections.insert(name.to_string(), payload);
            Value::Object(
                sections
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            )
        };

        let (done_tx, done_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        let path = self.path.clone();
        tokio::spawn(async move {
            match write_document(&path, &document).await {
                Ok(()) => {
                    let _ = done_tx.send(());
                }
                Err(err) => {
                    let _ = err_tx.send(err.to_string());
                }
            }
        });
        Ok((done_rx, err_rx))
    }
}

async fn write_document(path: &Path, document: &Value) -> Result<(), Error> {
    let bytes = serde_json::to_vec(document)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "wrote config document");
    Ok(())
}

/// How [`MockWriter`] responds to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStyle {
    Success,
    ImmediateFail,
    AsyncFail,
    /// Never answers on either channel.
    Timeout,
}

/// Test writer recording every section it is handed.
pub struct MockWriter {
    fail_style: FailStyle,
    written: AtomicUsize,
    sections: Mutex<BTreeMap<String, Value>>,
}

impl MockWriter {
    pub fn new(fail_style: FailStyle) -> Self {
        MockWriter {
            fail_style,
            written: AtomicUsize::new(0),
            sections: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn written_times(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    pub fn section(&self, name: &str) -> Option<Value> {
        self.sections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

impl ConfigWriter for MockWriter {
    fn send_section(&self, name: &str, payload: Value) -> Result<WriteHandle, Error> {
        self.sections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), payload);
        self.written.fetch_add(1, Ordering::SeqCst);

        let (done_tx, done_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        match self.fail_style {
            FailStyle::ImmediateFail => {
                return Err(Error::Writer("mock writer configured to fail".to_string()));
            }
            FailStyle::Success => {
                let _ = done_tx.send(());
                drop(err_tx);
            }
            FailStyle::AsyncFail => {
                drop(done_tx);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = err_tx.send("mock writer async failure".to_string());
                });
            }
            FailStyle::Timeout => {
                drop(done_tx);
                drop(err_tx);
            }
        }
        Ok((done_rx, err_rx))
    }
}
