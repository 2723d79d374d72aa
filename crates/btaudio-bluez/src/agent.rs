//! "Just works" pairing agent.
//!
//! Registers one agent with `NoInputNoOutput` semantics: every
//! authorization request from a speaker is approved without user
//! interaction. PIN/passkey flows are deliberately absent — a device
//! that demands one fails pairing.

use futures::FutureExt;
use tracing::info;

use btaudio_core::{Error, Result};

/// Holds the agent registration; dropping it unregisters the agent.
pub struct PairingAgent {
    _handle: bluer::agent::AgentHandle,
}

impl PairingAgent {
    /// Register with BlueZ as the default agent. Failure here is fatal
    /// at startup — without an agent no speaker can pair.
    pub async fn register(session: &bluer::Session) -> Result<Self> {
        let agent = bluer::agent::Agent {
            request_default: true,
            request_confirmation: Some(Box::new(|req| {
                async move {
                    info!(device = %req.device, "auto-confirming pairing");
                    Ok(())
                }
                .boxed()
            })),
            request_authorization: Some(Box::new(|req| {
                async move {
                    info!(device = %req.device, "auto-authorizing pairing");
                    Ok(())
                }
                .boxed()
            })),
            authorize_service: Some(Box::new(|req| {
                async move {
                    info!(device = %req.device, service = %req.service, "auto-authorizing service");
                    Ok(())
                }
                .boxed()
            })),
            ..Default::default()
        };
        let handle = session
            .register_agent(agent)
            .await
            .map_err(|e| Error::DbusUnavailable(format!("agent registration failed: {e}")))?;
        info!("pairing agent registered (just-works)");
        Ok(Self { _handle: handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires BlueZ"]
    async fn agent_registers_and_unregisters() {
        let session = bluer::Session::new().await.unwrap();
        let agent = PairingAgent::register(&session).await.unwrap();
        drop(agent);
    }
}
