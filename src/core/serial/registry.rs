//! Running links, keyed by device name

use super::handler::{LinkError, LinkHandle, LinkSettings, PortOpener, SerialPortHandler};
use super::lock::SerialPortLock;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Registry of serial port handlers
///
/// Owns nothing but handles: each link is owned by its own task, which
/// removes its entry when it stops.
pub struct SerialPortHandlerCollection {
    links: Arc<RwLock<HashMap<String, LinkHandle>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lock_dir: PathBuf,
    cancel: CancellationToken,
}

impl SerialPortHandlerCollection {
    /// Empty registry; links stop when `cancel` fires
    pub fn new(lock_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            lock_dir: lock_dir.into(),
            cancel,
        }
    }

    /// Directory holding device lock files
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Lock and open the device, then start its link task
    ///
    /// Fails with [`LinkError::Lock`] when another process owns the device
    /// and with [`LinkError::Open`] when it cannot be opened.
    pub fn start<O: PortOpener>(&self, settings: LinkSettings, opener: O) -> Result<LinkHandle, LinkError> {
        let device = settings.device.clone();
        if self.links.read().contains_key(&device) {
            return Err(LinkError::DuplicateDevice(device));
        }

        let lock = SerialPortLock::acquire(&self.lock_dir, &device)?;
        let (handler, handle) = SerialPortHandler::new(settings, opener, lock, self.cancel.child_token());
        let port = handler.open_device()?;

        self.links.write().insert(device.clone(), handle.clone());
        let links = self.links.clone();
        let task = tokio::spawn(async move {
            handler.run(port).await;
            links.write().remove(&device);
            debug!(device, "Link removed from registry");
        });
        self.tasks.lock().push(task);
        Ok(handle)
    }

    /// Link for `name`, matching the full device path or its file name
    pub fn get(&self, name: &str) -> Option<LinkHandle> {
        let links = self.links.read();
        if let Some(handle) = links.get(name) {
            return Some(handle.clone());
        }
        links
            .iter()
            .find(|(device, _)| Path::new(device).file_name().is_some_and(|file| file == name))
            .map(|(_, handle)| handle.clone())
    }

    /// Devices currently served
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.links.read().keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Number of running links
    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    /// No running links?
    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Stop every link and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "Link task ended abnormally");
            }
        }
    }
}
