//! Connectivity supervisor: wait for the network, then for a broker session,
//! retrying each step forever on its own fixed delay.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between network association probes.
    pub network_probe: Duration,
    /// Delay after a failed session attempt.
    pub session_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_probe: Duration::from_millis(500),
            session_backoff: Duration::from_secs(5),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Network {
    async fn is_up(&mut self) -> bool;
}

#[allow(async_fn_in_trait)]
pub trait SessionFactory {
    type Session;

    /// Connect and subscribe. `Ok` means the session is ready for traffic.
    async fn open(&mut self) -> Result<Self::Session>;
}

/// Block until both network and session exist. Never gives up.
pub async fn ensure_connected<N, F>(net: &mut N, factory: &mut F, policy: &RetryPolicy) -> F::Session
where
    N: Network,
    F: SessionFactory,
{
    loop {
        let mut probes = 0u32;
        while !net.is_up().await {
            if probes == 0 {
                tracing::warn!("network down, waiting");
            }
            probes += 1;
            sleep(policy.network_probe).await;
        }
        if probes > 0 {
            tracing::info!(probes, "network up");
        }

        match factory.open().await {
            Ok(session) => {
                tracing::info!("session established");
                return session;
            }
            Err(e) => {
                tracing::warn!(
                    retry_in = ?policy.session_backoff,
                    "session attempt failed: {e:#}"
                );
                sleep(policy.session_backoff).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
