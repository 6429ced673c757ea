//! Team roster - the agent directory the router resolves recipients against
//!
//! A `Team` is an immutable snapshot: every mutation returns a new team with a
//! bumped `version`, so a caller can keep the old snapshot around for retries
//! or compare versions to detect concurrent edits.

pub mod agent;

pub use agent::{AgentDefinition, AgentKind, AgentUpdate, ModelArgs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum TeamError {
    #[error("agent name must not be empty")]
    EmptyName,
    #[error("an agent named '{0}' already exists in this team")]
    DuplicateName(String),
    #[error("no agent named '{0}' in this team")]
    UnknownAgent(String),
}

/// A named roster of agents sharing objectives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub name: String,
    #[serde(default)]
    pub objectives: String,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub version: u64,
}

impl Team {
    pub fn new(name: impl Into<String>, objectives: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objectives: objectives.into(),
            agents: Vec::new(),
            version: 0,
        }
    }

    /// Resolve an agent by name. Duplicate names resolve to the first match.
    pub fn find_agent(&self, name: &str) -> Option<(usize, &AgentDefinition)> {
        let found = self.agents.iter().enumerate().find(|(_, a)| a.is_named(name));
        match found {
            Some((idx, _)) => debug!("Team '{}': resolved '{}' → #{}", self.name, name, idx),
            None => debug!("Team '{}': no agent named '{}'", self.name, name),
        }
        found
    }

    pub fn agent_at(&self, index: usize) -> Option<&AgentDefinition> {
        self.agents.get(index)
    }

    /// Every agent other than `name`, i.e. the peers it may hand work to
    pub fn peers_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a AgentDefinition> + 'a {
        self.agents.iter().filter(move |a| !a.is_named(name))
    }

    /// Check that agent names are non-empty and unique (case-insensitive)
    pub fn validate(&self) -> Result<(), Vec<TeamError>> {
        let mut errors = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for agent in &self.agents {
            let key = agent.name.trim().to_lowercase();
            if key.is_empty() {
                errors.push(TeamError::EmptyName);
                continue;
            }
            if seen.contains(&key) {
                warn!("Team '{}': duplicate agent name '{}'", self.name, agent.name);
                errors.push(TeamError::DuplicateName(agent.name.clone()));
            } else {
                seen.push(key);
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Returns a new team with `agent` appended
    pub fn add_agent(&self, agent: AgentDefinition) -> Result<Team, TeamError> {
        if agent.name.trim().is_empty() {
            return Err(TeamError::EmptyName);
        }
        if self.find_agent(&agent.name).is_some() {
            return Err(TeamError::DuplicateName(agent.name));
        }
        info!("Team '{}': added agent '{}'", self.name, agent.name);
        let mut next = self.next_version();
        next.agents.push(agent);
        Ok(next)
    }

    /// Returns a new team without the named agent
    pub fn remove_agent(&self, name: &str) -> Result<Team, TeamError> {
        let (idx, _) = self
            .find_agent(name)
            .ok_or_else(|| TeamError::UnknownAgent(name.to_string()))?;
        let mut next = self.next_version();
        let removed = next.agents.remove(idx);
        info!("Team '{}': removed agent '{}'", self.name, removed.name);
        Ok(next)
    }

    /// Returns a new team with a field-level update applied to the named agent
    pub fn update_agent(&self, name: &str, update: AgentUpdate) -> Result<Team, TeamError> {
        let (idx, _) = self
            .find_agent(name)
            .ok_or_else(|| TeamError::UnknownAgent(name.to_string()))?;

        if let AgentUpdate::Name(new_name) = &update {
            if new_name.trim().is_empty() {
                return Err(TeamError::EmptyName);
            }
            let clash = self
                .agents
                .iter()
                .enumerate()
                .any(|(i, a)| i != idx && a.is_named(new_name));
            if clash {
                return Err(TeamError::DuplicateName(new_name.clone()));
            }
        }

        let mut next = self.next_version();
        next.agents[idx].apply(update);
        Ok(next)
    }

    fn next_version(&self) -> Team {
        let mut next = self.clone();
        next.version = self.version + 1;
        next
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
