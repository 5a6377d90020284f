//! Background job: purge token rows whose expiry has passed.
//!
//! Validation already treats expired rows as invalid; this only reclaims
//! storage. Disabled unless `PRICEGATE_SWEEP_INTERVAL_SECS` is non-zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::ledger::TokenLedger;

/// Spawn the sweep task. Call this once at startup.
pub fn spawn(ledger: Arc<dyn TokenLedger>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        // the first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = sweep_once(ledger.as_ref()).await {
                tracing::error!("expiry sweep failed: {}", e);
            }
        }
    })
}

pub async fn sweep_once(ledger: &dyn TokenLedger) -> anyhow::Result<u64> {
    let purged = ledger.purge_expired().await?;
    if purged > 0 {
        tracing::info!(rows = purged, "purged expired tokens");
    }
    Ok(purged)
}
