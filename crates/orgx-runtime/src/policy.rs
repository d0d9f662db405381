//! Execution policy derivation (§4.5 step 1) and the small validation /
//! normalization rules the dispatch engine enforces before it ever talks
//! to the cloud plane or spawns a process.

use once_cell::sync::Lazy;
use orgx_types::MissionControlNode;
use regex::Regex;

const DOMAIN_KEYWORDS: &[&str] = &[
    "marketing",
    "design",
    "sales",
    "operations",
    "product",
    "orchestration",
    "engineering",
];

static AGENT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

/// `agentId` must match `^[A-Za-z0-9_-]+$` (§4.5 "Inputs validated").
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    AGENT_ID_RE.is_match(agent_id)
}

/// Maps a free-form provider name to its canonical form, or `None` if it
/// doesn't match any known alias.
pub fn normalize_provider(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        "claude" | "anthropic" => Some("anthropic"),
        "openrouter" | "open-router" => Some("openrouter"),
        "openai" => Some("openai"),
        _ => None,
    }
}

fn keyword_domain(text: &str) -> Option<&'static str> {
    let lowered = text.to_ascii_lowercase();
    DOMAIN_KEYWORDS
        .iter()
        .find(|kw| lowered.contains(*kw))
        .copied()
}

/// Derives the execution domain for a task: first from its own assigned
/// agent, then the workstream's, then by keyword-matching titles, falling
/// back to `"engineering"` when nothing matches (a dispatchable task
/// always needs *some* domain).
pub fn derive_domain(
    task: &MissionControlNode,
    workstream: Option<&MissionControlNode>,
    initiative: &MissionControlNode,
) -> &'static str {
    if let Some(agent) = task.assigned_agents.first() {
        if let Some(domain) = agent.domain.as_deref().and_then(|d| {
            DOMAIN_KEYWORDS
                .iter()
                .find(|kw| d.eq_ignore_ascii_case(kw))
                .copied()
        }) {
            return domain;
        }
    }
    if let Some(workstream) = workstream {
        if let Some(agent) = workstream.assigned_agents.first() {
            if let Some(domain) = agent.domain.as_deref().and_then(|d| {
                DOMAIN_KEYWORDS
                    .iter()
                    .find(|kw| d.eq_ignore_ascii_case(kw))
                    .copied()
            }) {
                return domain;
            }
        }
    }
    let combined = format!(
        "{} {} {}",
        task.title,
        workstream.map(|w| w.title.as_str()).unwrap_or(""),
        initiative.title
    );
    keyword_domain(&combined).unwrap_or("engineering")
}

pub fn required_skill(domain: &str) -> String {
    format!("orgx-{domain}-agent")
}

/// Billing gate (§4.5 "Billing gate"): BYOK model strings require a paid
/// plan.
pub fn implies_byok(model: &str) -> bool {
    let lowered = model.to_ascii_lowercase();
    ["openrouter", "anthropic", "openai"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgx_types::EntityType;

    fn node(title: &str) -> MissionControlNode {
        MissionControlNode {
            id: "n1".to_string(),
            node_type: EntityType::Task,
            title: title.to_string(),
            status: "todo".to_string(),
            parent_id: None,
            initiative_id: None,
            workstream_id: None,
            milestone_id: None,
            priority_num: 50,
            priority_label: "medium".to_string(),
            dependency_ids: vec![],
            due_date: None,
            eta_end_at: None,
            expected_duration_hours: 2.0,
            expected_budget_usd: 0.0,
            assigned_agents: vec![],
            updated_at: None,
        }
    }

    #[test]
    fn agent_id_validation_rejects_special_characters() {
        assert!(is_valid_agent_id("agent_one-2"));
        assert!(!is_valid_agent_id("agent one"));
        assert!(!is_valid_agent_id("agent/2"));
    }

    #[test]
    fn provider_normalization_maps_aliases() {
        assert_eq!(normalize_provider("Claude"), Some("anthropic"));
        assert_eq!(normalize_provider("open-router"), Some("openrouter"));
        assert_eq!(normalize_provider("bogus"), None);
    }

    #[test]
    fn domain_falls_back_to_keyword_match_then_engineering() {
        let task = node("Design the new onboarding flow");
        let initiative = node("Initiative");
        assert_eq!(derive_domain(&task, None, &initiative), "design");

        let task = node("Write some code");
        assert_eq!(derive_domain(&task, None, &initiative), "engineering");
    }

    #[test]
    fn byok_detection_matches_known_model_substrings() {
        assert!(implies_byok("openrouter/mistral-large"));
        assert!(!implies_byok("local-model"));
    }
}
