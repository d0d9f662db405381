//! Prompt construction (§4.5 step 3).

/// Prefixes `base_message` with the execution-policy header lines, then a
/// blank line, then the message itself.
pub fn build_prompt(domain: &str, required_skill: &str, tier: Option<&str>, base_message: &str) -> String {
    let mut header = vec![
        format!("Execution policy: {domain}"),
        format!("Required skills: {required_skill}"),
    ];
    if let Some(tier) = tier {
        header.push(format!("Spawn guard model tier: {tier}"));
    }
    format!("{}\n\n{}", header.join("\n"), base_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_header_with_tier() {
        let prompt = build_prompt("engineering", "orgx-engineering-agent", Some("opus"), "Do the thing");
        assert_eq!(
            prompt,
            "Execution policy: engineering\nRequired skills: orgx-engineering-agent\nSpawn guard model tier: opus\n\nDo the thing"
        );
    }

    #[test]
    fn omits_tier_line_when_absent() {
        let prompt = build_prompt("design", "orgx-design-agent", None, "Do the thing");
        assert_eq!(
            prompt,
            "Execution policy: design\nRequired skills: orgx-design-agent\n\nDo the thing"
        );
    }
}
