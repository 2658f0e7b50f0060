//! Tenant and agent lookups.
//!
//! Tenant provisioning and the agent hierarchy live in an external identity
//! service. The engine only needs a few read-only queries from it, modelled
//! by the [`Directory`] trait. [`StaticDirectory`] serves them from a JSON
//! seed file and doubles as the test fixture.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Operator brand with its own currency and jurisdiction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub base_currency: String,
    pub country_code: String,
    /// Rule profile within the country, e.g. "standard"
    pub profile_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub parent_agent_id: Option<Uuid>,
    /// Percentage override of the rule's agent rate
    #[serde(default)]
    pub commission_rate: Option<Decimal>,
    #[serde(default)]
    pub status: AgentStatus,
    /// Players referred directly by this agent
    #[serde(default)]
    pub player_ids: Vec<Uuid>,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn tenant(&self, tenant_id: Uuid) -> AppResult<Option<Tenant>>;

    async fn agent(&self, agent_id: Uuid) -> AppResult<Option<Agent>>;

    async fn agents_for_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Agent>>;

    /// Every tenant the settlement batch should visit
    async fn tenant_ids(&self) -> AppResult<Vec<Uuid>>;

    /// Players attributed to an agent: their own plus every downline
    /// agent's, each player once
    async fn attributed_players(&self, agent_id: Uuid) -> AppResult<Vec<Uuid>> {
        let root = self
            .agent(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Agent {} not found", agent_id)))?;
        let agents = self.agents_for_tenant(root.tenant_id).await?;
        Ok(downline_players(&root, &agents))
    }

    /// Tenant or `NotFound`
    async fn require_tenant(&self, tenant_id: Uuid) -> AppResult<Tenant> {
        self.tenant(tenant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Tenant {} not found", tenant_id)))
    }
}

/// Breadth-first walk of the agent tree below `root`. A parent cycle in the
/// seed data stops the walk instead of looping.
pub fn downline_players(root: &Agent, agents: &[Agent]) -> Vec<Uuid> {
    let mut children: HashMap<Uuid, Vec<&Agent>> = HashMap::new();
    for agent in agents {
        if let Some(parent) = agent.parent_agent_id {
            children.entry(parent).or_default().push(agent);
        }
    }

    let mut visited = HashSet::from([root.id]);
    let mut seen_players = HashSet::new();
    let mut players = Vec::new();
    let mut queue = VecDeque::from([root]);

    while let Some(agent) = queue.pop_front() {
        for player in &agent.player_ids {
            if seen_players.insert(*player) {
                players.push(*player);
            }
        }
        for child in children.get(&agent.id).into_iter().flatten() {
            if visited.insert(child.id) {
                queue.push_back(*child);
            } else {
                warn!(agent_id = %child.id, "Agent hierarchy cycle, skipping");
            }
        }
    }

    players
}

#[derive(Debug, Default, Deserialize)]
struct DirectorySeed {
    #[serde(default)]
    tenants: Vec<Tenant>,
    #[serde(default)]
    agents: Vec<Agent>,
}

/// In-memory directory, immutable once built
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    tenants: HashMap<Uuid, Tenant>,
    agents: HashMap<Uuid, Agent>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{ "tenants": [...], "agents": [...] }`
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read directory file {}: {}", path.display(), e))
        })?;
        let seed: DirectorySeed = serde_json::from_str(&raw)?;

        let directory = seed
            .tenants
            .into_iter()
            .fold(Self::new(), Self::with_tenant);
        let directory = seed.agents.into_iter().fold(directory, Self::with_agent);

        info!(
            tenants = directory.tenants.len(),
            agents = directory.agents.len(),
            "Directory loaded from {}",
            path.display()
        );
        Ok(directory)
    }

    pub fn with_tenant(mut self, mut tenant: Tenant) -> Self {
        tenant.base_currency = tenant.base_currency.to_uppercase();
        tenant.country_code = tenant.country_code.to_uppercase();
        self.tenants.insert(tenant.id, tenant);
        self
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.insert(agent.id, agent);
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn tenant(&self, tenant_id: Uuid) -> AppResult<Option<Tenant>> {
        Ok(self.tenants.get(&tenant_id).cloned())
    }

    async fn agent(&self, agent_id: Uuid) -> AppResult<Option<Agent>> {
        Ok(self.agents.get(&agent_id).cloned())
    }

    async fn agents_for_tenant(&self, tenant_id: Uuid) -> AppResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self
            .agents
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        Ok(agents)
    }

    async fn tenant_ids(&self) -> AppResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.tenants.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
