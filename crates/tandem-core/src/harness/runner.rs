//! Multi-endpoint orchestration.

use super::endpoint::Endpoint;
use crate::Result;
use tracing::{info, warn};

/// Run endpoints through a full scenario.
///
/// Servers start first and each is waited on until its channel exists, so
/// no client can connect before its server listens. Clients start next.
/// Once every endpoint has signaled done, all of them are shut down in
/// reverse order, which shuts endpoints sharing a listener loop down before
/// the loop's owner as long as the owner was listed first.
///
/// If startup fails, every endpoint's shutdown signal fires first so that
/// calls blocked on a peer that never arrived are released.
pub fn run_scenario(mut endpoints: Vec<Endpoint>) -> Result<()> {
    let outcome = start_and_wait(&mut endpoints);
    if let Err(e) = &outcome {
        warn!("Scenario aborted: {}", e);
        for endpoint in &endpoints {
            endpoint.shutdown_signal().signal();
        }
    }

    for endpoint in endpoints.iter_mut().rev() {
        endpoint.shutdown();
    }
    outcome
}

fn start_and_wait(endpoints: &mut [Endpoint]) -> Result<()> {
    for endpoint in endpoints.iter_mut().filter(|e| e.mode().is_server()) {
        endpoint.start()?;
        endpoint.wait_for_channel_creation()?;
    }

    for endpoint in endpoints.iter_mut().filter(|e| e.mode().is_client()) {
        endpoint.start()?;
    }

    for endpoint in endpoints.iter() {
        endpoint.wait_done();
    }
    info!("All {} endpoint(s) done", endpoints.len());
    Ok(())
}
