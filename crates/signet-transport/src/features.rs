//! Feature cache and access gate
//!
//! Every status read goes through one slot, so the device never sees two
//! reads at once. The cached path additionally shares in-flight reads and
//! memoizes results per connect id.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use signet_core::{FeatureSnapshot, HardwareError, Result, TtlCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::driver::{DeviceDriver, StatusOptions};

type SharedRead = Shared<BoxFuture<'static, Result<FeatureSnapshot>>>;

#[derive(Debug, Clone)]
pub struct FeatureGateConfig {
    pub read_timeout: Duration,
    pub memo_ttl: Duration,
    pub memo_max_entries: usize,
}

impl Default for FeatureGateConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            memo_ttl: Duration::from_secs(15),
            memo_max_entries: 10,
        }
    }
}

pub struct FeatureGate {
    driver: Arc<dyn DeviceDriver>,
    config: FeatureGateConfig,
    slot: Arc<Mutex<()>>,
    memo: Mutex<TtlCache<String, SharedRead>>,
}

impl FeatureGate {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: FeatureGateConfig) -> Self {
        let memo = TtlCache::new(config.memo_ttl, config.memo_max_entries);
        Self {
            driver,
            config,
            slot: Arc::new(Mutex::new(())),
            memo: Mutex::new(memo),
        }
    }

    /// Cached status read. Concurrent callers for the same device share one read.
    pub async fn get_status(
        &self,
        connect_id: Option<&str>,
        opts: &StatusOptions,
    ) -> Result<FeatureSnapshot> {
        let connect_id = Self::require_connect_id(connect_id, opts)?;

        let read = {
            let mut memo = self.memo.lock().await;
            match memo.get(&connect_id) {
                Some(read) => {
                    debug!(connect_id = %connect_id, "Sharing cached status read");
                    read
                }
                None => {
                    let read = self.exclusive_read(connect_id.clone(), opts.clone());
                    memo.insert(connect_id.clone(), read.clone());
                    read
                }
            }
        };

        let result = read.clone().await;
        if result.is_err() {
            let mut memo = self.memo.lock().await;
            if memo.get(&connect_id).is_some_and(|cur| cur.ptr_eq(&read)) {
                memo.remove(&connect_id);
            }
        }
        result
    }

    /// Status read that skips sharing and memo, but still takes the slot
    pub async fn get_status_fresh(
        &self,
        connect_id: Option<&str>,
        opts: &StatusOptions,
    ) -> Result<FeatureSnapshot> {
        let connect_id = Self::require_connect_id(connect_id, opts)?;
        self.exclusive_read(connect_id, opts.clone()).await
    }

    /// Forget memoized reads for one device, or for all when `None`
    pub async fn invalidate(&self, connect_id: Option<&str>) {
        let mut memo = self.memo.lock().await;
        match connect_id {
            Some(id) => {
                memo.remove(&id.to_string());
            }
            None => memo.invalidate(),
        }
    }

    fn require_connect_id(connect_id: Option<&str>, opts: &StatusOptions) -> Result<String> {
        match connect_id {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ if opts.allow_empty_connect_id => Ok(String::new()),
            _ => Err(HardwareError::ConnectIdRequired),
        }
    }

    fn exclusive_read(&self, connect_id: String, opts: StatusOptions) -> SharedRead {
        let driver = self.driver.clone();
        let slot = self.slot.clone();
        let read_timeout = self.config.read_timeout;
        async move {
            let _guard = slot.lock().await;
            match tokio::time::timeout(read_timeout, driver.read_status(&connect_id, &opts)).await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(connect_id = %connect_id, "Status read timed out");
                    Err(HardwareError::timed_out("get_features", read_timeout))
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;
    use std::sync::atomic::Ordering;

    fn make_gate(driver: Arc<FakeDriver>) -> FeatureGate {
        FeatureGate::new(driver, FeatureGateConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_share_one_device_call() {
        let driver = FakeDriver::new();
        driver.set_read_delay(Duration::from_millis(500));
        let gate = Arc::new(make_gate(driver.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.get_status(Some("usb-1"), &StatusOptions::default()).await
            }));
        }
        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(driver.read_calls.load(Ordering::SeqCst), 1);
        assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memo_expires_after_ttl() {
        let driver = FakeDriver::new();
        let gate = make_gate(driver.clone());
        let opts = StatusOptions::default();

        gate.get_status(Some("usb-1"), &opts).await.unwrap();
        gate.get_status(Some("usb-1"), &opts).await.unwrap();
        assert_eq!(driver.read_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        gate.get_status(Some("usb-1"), &opts).await.unwrap();
        assert_eq!(driver.read_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_read_bypasses_memo() {
        let driver = FakeDriver::new();
        let gate = make_gate(driver.clone());
        let opts = StatusOptions::default();

        gate.get_status(Some("usb-1"), &opts).await.unwrap();
        gate.get_status_fresh(Some("usb-1"), &opts).await.unwrap();
        assert_eq!(driver.read_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_serialized() {
        let driver = FakeDriver::new();
        driver.set_read_delay(Duration::from_millis(100));
        let gate = Arc::new(make_gate(driver.clone()));
        let opts = StatusOptions::default();

        let (a, b, c) = tokio::join!(
            gate.get_status(Some("usb-1"), &opts),
            gate.get_status(Some("usb-2"), &opts),
            gate.get_status_fresh(Some("usb-1"), &opts),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(driver.max_concurrent_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_typed_and_not_memoized() {
        let driver = FakeDriver::new();
        driver.set_read_delay(Duration::from_secs(120));
        let gate = make_gate(driver.clone());
        let opts = StatusOptions::default();

        let err = gate.get_status(Some("usb-1"), &opts).await.unwrap_err();
        assert!(matches!(err, HardwareError::TimedOut { .. }));

        driver.set_read_delay(Duration::ZERO);
        assert!(gate.get_status(Some("usb-1"), &opts).await.is_ok());
        assert_eq!(driver.read_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_id_required() {
        let gate = make_gate(FakeDriver::new());
        let err = gate
            .get_status(None, &StatusOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, HardwareError::ConnectIdRequired);

        let opts = StatusOptions {
            allow_empty_connect_id: true,
        };
        assert!(gate.get_status(None, &opts).await.is_ok());
    }
}
