//! Orchestrator client interface.
//!
//! The transport is an external collaborator; the loop only needs these
//! four operations. A REST or gRPC implementation lives outside this crate.

use async_trait::async_trait;

use cplane_model::{Agent, Payload};

use crate::error::OrchError;

#[async_trait]
pub trait OrchClient: Send + Sync {
    /// Register the agent with the orchestrator.
    async fn register_agent(&self, agent: &Agent) -> Result<(), OrchError>;

    /// Update the registration of an already-known agent (capabilities or
    /// facts changed).
    async fn update_agent(&self, agent: &Agent) -> Result<(), OrchError>;

    /// Fetch the target payload for this agent.
    ///
    /// `version` and `hash` are the agent's last-seen values; the
    /// orchestrator answers `None` when nothing changed, so an idle control
    /// plane costs one cheap round-trip per tick.
    async fn get_payload(
        &self,
        agent: &Agent,
        version: u64,
        hash: &str,
    ) -> Result<Option<Payload>, OrchError>;

    /// Report the realized data-plane state (capability values and facts)
    /// upstream for status tracking.
    async fn report(&self, agent: &Agent, actual: &Payload) -> Result<(), OrchError>;
}
