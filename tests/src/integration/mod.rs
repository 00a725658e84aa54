//! Integration scenarios. Everything runs in-process: the in-memory broker
//! or a `BrokerHub` on a loopback port, and channels on 127.0.0.1.

pub mod codec;
pub mod messaging;
pub mod pipeline;
pub mod server;
pub mod validation;

#[cfg(test)]
pub(crate) mod support {
    use std::future::Future;
    use std::time::Duration;

    use karabo_bus::SignalSlotableConfig;

    pub const WAIT: Duration = Duration::from_secs(5);

    pub fn quick() -> SignalSlotableConfig {
        SignalSlotableConfig {
            check_uniqueness: false,
            request_timeout: Duration::from_secs(2),
            ..SignalSlotableConfig::default()
        }
    }

    /// Poll `condition` until it holds or [`WAIT`] passes.
    pub async fn eventually<F, Fut>(mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(WAIT, async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }
}
