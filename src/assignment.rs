//! Lead distribution math: the rotation cursor, agent eligibility, strategy
//! selection, the dry-run preview and the even split.
//!
//! Nothing here touches the database. `assignment_storage` loads the
//! cursor and agents, asks for a decision, and persists it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AssignmentMethod, CheckedInAgent, HistoryMethod};

/// Persisted pointer to the agent that receives the next lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RotationCursor {
    index: i32,
}

impl RotationCursor {
    pub fn new(index: i32) -> Self {
        Self {
            index: index.max(0),
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    /// Position in a rotation of `eligible` entries, or `None` when empty.
    pub fn next(&self, eligible: usize) -> Option<usize> {
        if eligible == 0 {
            return None;
        }
        Some(self.index as usize % eligible)
    }

    /// Moves past the entry just used.
    pub fn advance(&mut self, eligible: usize) {
        if eligible == 0 {
            return;
        }
        self.index = ((self.index as usize + 1) % eligible) as i32;
    }
}

/// How the rotation is laid out over eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// One turn per agent; `weight` is ignored.
    #[default]
    RoundRobin,
    /// `weight` consecutive turns per agent, clamped to `1..=MAX_AGENT_WEIGHT`.
    /// Only used when the
    /// settings row explicitly selects it.
    Weighted,
}

impl AssignmentStrategy {
    pub fn history_method(&self) -> HistoryMethod {
        match self {
            AssignmentStrategy::RoundRobin => HistoryMethod::AutoRoundRobin,
            AssignmentStrategy::Weighted => HistoryMethod::AutoWeighted,
        }
    }

    /// Turns a single agent gets in one pass of the rotation.
    fn turns(&self, agent: &AgentLoad) -> usize {
        match self {
            AssignmentStrategy::RoundRobin => 1,
            AssignmentStrategy::Weighted => agent.weight.clamp(1, MAX_AGENT_WEIGHT) as usize,
        }
    }

    /// Length of one full pass over `eligible`.
    fn rotation_len(&self, eligible: &[AgentLoad]) -> usize {
        eligible.iter().map(|agent| self.turns(agent)).sum()
    }

    /// Index into `eligible` of the agent owning rotation slot `position`.
    fn slot_owner(&self, eligible: &[AgentLoad], position: usize) -> Option<usize> {
        let mut end = 0;
        eligible.iter().position(|agent| {
            end += self.turns(agent);
            position < end
        })
    }
}

/// Upper bound for a check-in weight; keeps one weighted pass short.
pub const MAX_AGENT_WEIGHT: i32 = 100;

impl From<AssignmentMethod> for AssignmentStrategy {
    fn from(method: AssignmentMethod) -> Self {
        match method {
            AssignmentMethod::RoundRobin => AssignmentStrategy::RoundRobin,
            AssignmentMethod::Weighted => AssignmentStrategy::Weighted,
        }
    }
}

/// Assignment-relevant view of a checked-in agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentLoad {
    pub check_in_id: i64,
    pub agent_id: Uuid,
    pub lead_capacity: i32,
    pub weight: i32,
    pub current_lead_count: i32,
    pub is_active: bool,
}

impl AgentLoad {
    pub fn has_capacity(&self) -> bool {
        self.is_active && self.current_lead_count < self.lead_capacity
    }
}

impl From<&CheckedInAgent> for AgentLoad {
    fn from(agent: &CheckedInAgent) -> Self {
        Self {
            check_in_id: agent.id,
            agent_id: agent.agent_id,
            lead_capacity: agent.lead_capacity,
            weight: agent.weight,
            current_lead_count: agent.current_lead_count,
            is_active: agent.is_active,
        }
    }
}

/// Active agents below capacity, ordered by check-in row id so rotation is
/// reproducible.
pub fn eligible_agents(agents: &[AgentLoad]) -> Vec<AgentLoad> {
    let mut eligible: Vec<AgentLoad> = agents.iter().filter(|a| a.has_capacity()).cloned().collect();
    eligible.sort_by_key(|a| a.check_in_id);
    eligible
}

/// The agent picked for one lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentDecision {
    pub agent: AgentLoad,
    pub eligible_count: usize,
    pub method: HistoryMethod,
}

/// Picks the next agent and advances `cursor`. Returns `None` (cursor
/// untouched) when nobody has capacity left.
pub fn select_agent(
    agents: &[AgentLoad],
    cursor: &mut RotationCursor,
    strategy: AssignmentStrategy,
) -> Option<AssignmentDecision> {
    let eligible = eligible_agents(agents);
    let len = strategy.rotation_len(&eligible);
    let position = cursor.next(len)?;
    let agent = eligible[strategy.slot_owner(&eligible, position)?].clone();
    cursor.advance(len);

    Some(AssignmentDecision {
        agent,
        eligible_count: eligible.len(),
        method: strategy.history_method(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub agent_id: Uuid,
    pub current_lead_count: i32,
    pub lead_capacity: i32,
    pub incoming: usize,
}

/// Result of replaying the rotation without persisting anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentPreview {
    pub lead_count: usize,
    pub assignable: usize,
    pub unassignable: usize,
    pub final_index: i32,
    pub agents: Vec<PreviewEntry>,
}

/// Simulates `lead_count` consecutive single assignments, including agents
/// dropping out as they hit capacity.
pub fn preview(
    agents: &[AgentLoad],
    cursor: RotationCursor,
    strategy: AssignmentStrategy,
    lead_count: usize,
) -> AssignmentPreview {
    let mut working: Vec<AgentLoad> = agents.to_vec();
    working.sort_by_key(|a| a.check_in_id);
    let mut incoming = vec![0usize; working.len()];
    let mut cursor = cursor;
    let mut assignable = 0;

    for _ in 0..lead_count {
        let Some(decision) = select_agent(&working, &mut cursor, strategy) else {
            break;
        };
        if let Some(i) = working
            .iter()
            .position(|a| a.check_in_id == decision.agent.check_in_id)
        {
            working[i].current_lead_count += 1;
            incoming[i] += 1;
        }
        assignable += 1;
    }

    AssignmentPreview {
        lead_count,
        assignable,
        unassignable: lead_count - assignable,
        final_index: cursor.index(),
        agents: working
            .iter()
            .zip(incoming)
            .map(|(agent, incoming)| PreviewEntry {
                agent_id: agent.agent_id,
                current_lead_count: agent.current_lead_count - incoming as i32,
                lead_capacity: agent.lead_capacity,
                incoming,
            })
            .collect(),
    }
}

/// Splits `leads` into contiguous slices: every agent gets `n / agents`
/// leads and the first `n % agents` agents get one extra.
///
/// Capacity and the rotation cursor play no part here.
pub fn even_split<'a>(agents: &[Uuid], leads: &'a [Uuid]) -> Vec<(Uuid, &'a [Uuid])> {
    if agents.is_empty() {
        return Vec::new();
    }

    let base = leads.len() / agents.len();
    let remainder = leads.len() % agents.len();
    let mut offset = 0;

    agents
        .iter()
        .enumerate()
        .map(|(i, agent)| {
            let take = base + usize::from(i < remainder);
            let slice = &leads[offset..offset + take];
            offset += take;
            (*agent, slice)
        })
        .collect()
}
