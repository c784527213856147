//! Capability scheduler: assigns target resources to agents.
//!
//! Selection is capability matching only — no load awareness, no bidding.
//! Agents declare capability kinds as exact strings or glob-style patterns
//! (`*` and `?`), and the first matching agent in a stable enumeration
//! order wins. Determinism matters more than balance here: given the same
//! agent set, a resource always lands on the same agent, which is what makes
//! scheduling decisions reproducible in tests and across restarts.
//!
//! Once assigned, a resource's `agent` field is never changed by the
//! scheduler; re-scheduling happens only through an external event (agent
//! removal, capability change) clearing the assignment first.

use tracing::{debug, warn};
use uuid::Uuid;

use cplane_model::{Agent, Payload, ResKey, TargetResource};

/// Match a capability pattern against a kind.
///
/// Patterns support `*` (any run of characters) and `?` (any single
/// character); everything else matches literally.
pub fn capability_matches(pattern: &str, kind: &str) -> bool {
    fn matches(pattern: &[u8], kind: &[u8]) -> bool {
        match pattern.split_first() {
            None => kind.is_empty(),
            Some((b'*', rest)) => (0..=kind.len()).any(|i| matches(rest, &kind[i..])),
            Some((b'?', rest)) => !kind.is_empty() && matches(rest, &kind[1..]),
            Some((c, rest)) => kind.first() == Some(c) && matches(rest, &kind[1..]),
        }
    }
    matches(pattern.as_bytes(), kind.as_bytes())
}

/// Deterministic first-match scheduler.
#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Select the agent responsible for a capability kind.
    ///
    /// Agents are enumerated in ascending `(name, uuid)` order so the result
    /// does not depend on the caller's list order. Disabled agents never
    /// match.
    pub fn select_agent<'a>(&self, agents: &'a [Agent], kind: &str) -> Option<&'a Agent> {
        let mut ordered: Vec<&Agent> = agents.iter().filter(|a| !a.is_disabled()).collect();
        ordered.sort_by(|a, b| (&a.name, a.uuid).cmp(&(&b.name, b.uuid)));

        ordered.into_iter().find(|agent| {
            agent
                .capabilities
                .iter()
                .any(|pattern| capability_matches(pattern, kind))
        })
    }

    /// Assign an agent to a single target resource.
    ///
    /// Returns the assigned agent uuid, or `None` if no agent matches.
    /// An existing assignment is left untouched.
    pub fn schedule_resource(
        &self,
        agents: &[Agent],
        resource: &mut TargetResource,
    ) -> Option<Uuid> {
        if let Some(existing) = resource.agent {
            return Some(existing);
        }

        match self.select_agent(agents, &resource.resource.kind) {
            Some(agent) => {
                debug!(
                    kind = %resource.resource.kind,
                    uuid = %resource.resource.uuid,
                    agent = %agent.uuid,
                    "Scheduled resource"
                );
                resource.agent = Some(agent.uuid);
                Some(agent.uuid)
            }
            None => None,
        }
    }

    /// Assign agents across a whole payload.
    ///
    /// Returns the identities of resources no agent could take; callers
    /// surface those upstream as scheduling errors.
    pub fn schedule_payload(&self, agents: &[Agent], payload: &mut Payload) -> Vec<ResKey> {
        let mut unschedulable = Vec::new();

        for resources in payload.capabilities.values_mut() {
            for resource in resources.iter_mut() {
                if self.schedule_resource(agents, resource).is_none() {
                    warn!(
                        kind = %resource.resource.kind,
                        uuid = %resource.resource.uuid,
                        "No agent matches resource kind"
                    );
                    unschedulable.push(resource.res_key());
                }
            }
        }

        unschedulable
    }
}
