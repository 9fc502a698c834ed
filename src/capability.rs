//! Scores agents against a required capability set and tie-breaks on cost.
//!
//! Generalizes the orchestrator's per-`AgentType` static capability table
//! (`AgentType::capabilities()`) into a dynamic `HashSet<String>` carried on
//! each [`AgentProfile`].

use crate::models::{AgentId, AgentProfile, AgentStatus};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityScore {
    pub agent_id: AgentId,
    pub score: f64,
    pub matched: HashSet<String>,
    pub missing: HashSet<String>,
}

#[derive(Debug, Default, Clone)]
pub struct FindBestAgentOptions {
    pub exclude_agent_ids: HashSet<AgentId>,
    pub min_score: f64,
}

/// `score = |matched ∩ required| / |required|`, or `1.0` when required is
/// empty. Always in `[0, 1]`.
pub fn score_capability_match(agent: &AgentProfile, required: &HashSet<String>) -> CapabilityScore {
    if required.is_empty() {
        return CapabilityScore {
            agent_id: agent.id.clone(),
            score: 1.0,
            matched: HashSet::new(),
            missing: HashSet::new(),
        };
    }

    let matched: HashSet<String> = required
        .intersection(&agent.capabilities)
        .cloned()
        .collect();
    let missing: HashSet<String> = required.difference(&matched).cloned().collect();
    let score = matched.len() as f64 / required.len() as f64;

    CapabilityScore {
        agent_id: agent.id.clone(),
        score,
        matched,
        missing,
    }
}

/// Selects the best candidate agent for a required capability set.
///
/// Filters out offline/blocked agents and any explicitly excluded id, scores
/// the rest, drops scores below `min_score`, then picks the maximum score,
/// breaking ties on lower estimated cost per token and finally on
/// lexicographic agent id.
pub fn find_best_agent<'a>(
    agents: &'a [AgentProfile],
    required: &HashSet<String>,
    options: &FindBestAgentOptions,
) -> Option<(&'a AgentProfile, CapabilityScore)> {
    let mut candidates: Vec<(&AgentProfile, CapabilityScore)> = agents
        .iter()
        .filter(|agent| {
            !matches!(agent.status, AgentStatus::Offline | AgentStatus::Blocked)
                && !options.exclude_agent_ids.contains(&agent.id)
        })
        .map(|agent| (agent, score_capability_match(agent, required)))
        .filter(|(_, score)| score.score >= options.min_score)
        .collect();

    candidates.sort_by(|(agent_a, score_a), (agent_b, score_b)| {
        score_b
            .score
            .partial_cmp(&score_a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                agent_a
                    .estimated_cost_per_token()
                    .partial_cmp(&agent_b.estimated_cost_per_token())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| agent_a.id.cmp(&agent_b.id))
    });

    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentProvider, CostPerToken};
    use chrono::Utc;
    use std::collections::HashMap;

    fn agent(id: &str, capabilities: &[&str], input: f64, output: f64) -> AgentProfile {
        AgentProfile {
            id: id.to_string(),
            name: id.to_string(),
            provider: AgentProvider::Anthropic,
            model: "test".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            cost_per_token: CostPerToken { input, output },
            status: AgentStatus::Idle,
            last_heartbeat: Some(Utc::now()),
            metadata: HashMap::new(),
        }
    }

    fn required(caps: &[&str]) -> HashSet<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn empty_required_scores_one() {
        let a = agent("a", &[], 0.0, 0.0);
        let score = score_capability_match(&a, &HashSet::new());
        assert_eq!(score.score, 1.0);
    }

    #[test]
    fn scenario_perfect_match_cheapest_wins() {
        let claude = agent("claude", &["ts", "test", "react"], 0.015, 0.075);
        let gemini = agent("gemini", &["ts", "frontend"], 0.001, 0.004);
        let codex = agent("codex", &["ts", "test"], 0.01, 0.03);
        let agents = vec![claude, gemini, codex];

        let best = find_best_agent(&agents, &required(&["ts", "test"]), &Default::default());
        assert_eq!(best.unwrap().0.id, "codex");
    }

    #[test]
    fn scenario_only_full_match_wins() {
        let claude = agent("claude", &["ts", "test", "react"], 0.015, 0.075);
        let gemini = agent("gemini", &["ts", "frontend"], 0.001, 0.004);
        let codex = agent("codex", &["ts", "test"], 0.01, 0.03);
        let agents = vec![claude, gemini, codex];

        let best = find_best_agent(
            &agents,
            &required(&["ts", "test", "react"]),
            &Default::default(),
        );
        assert_eq!(best.unwrap().0.id, "claude");
    }

    #[test]
    fn offline_agents_are_excluded() {
        let mut a = agent("a", &["ts"], 0.01, 0.01);
        a.status = AgentStatus::Offline;
        let best = find_best_agent(&[a], &required(&["ts"]), &Default::default());
        assert!(best.is_none());
    }

    #[test]
    fn min_score_filters_partial_matches() {
        let a = agent("a", &["ts"], 0.01, 0.01);
        let options = FindBestAgentOptions {
            min_score: 0.9,
            ..Default::default()
        };
        let best = find_best_agent(&[a], &required(&["ts", "test"]), &options);
        assert!(best.is_none());
    }
}
