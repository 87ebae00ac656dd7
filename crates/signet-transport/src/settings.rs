//! Persisted transport settings

use async_trait::async_trait;
use signet_core::{Result, TransportKind};
use tokio::sync::RwLock;

/// Where the host keeps the chosen transport between sessions
#[async_trait]
pub trait TransportSettings: Send + Sync {
    /// Transport used by the last session
    async fn current_transport(&self) -> TransportKind;

    async fn set_current_transport(&self, kind: TransportKind) -> Result<()>;

    /// USB flavour the user runs: bridge daemon or direct USB
    async fn usb_transport(&self) -> TransportKind;

    async fn set_usb_transport(&self, kind: TransportKind) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct StoredTransport {
    current: TransportKind,
    usb: TransportKind,
}

/// Settings kept for the lifetime of the process
pub struct InMemoryTransportSettings {
    inner: RwLock<StoredTransport>,
}

impl InMemoryTransportSettings {
    pub fn new(usb: TransportKind) -> Self {
        Self {
            inner: RwLock::new(StoredTransport { current: usb, usb }),
        }
    }
}

impl Default for InMemoryTransportSettings {
    fn default() -> Self {
        Self::new(TransportKind::Bridge)
    }
}

#[async_trait]
impl TransportSettings for InMemoryTransportSettings {
    async fn current_transport(&self) -> TransportKind {
        self.inner.read().await.current
    }

    async fn set_current_transport(&self, kind: TransportKind) -> Result<()> {
        self.inner.write().await.current = kind;
        Ok(())
    }

    async fn usb_transport(&self) -> TransportKind {
        self.inner.read().await.usb
    }

    async fn set_usb_transport(&self, kind: TransportKind) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.usb = kind;
        if inner.current.is_usb() {
            inner.current = kind;
        }
        Ok(())
    }
}
