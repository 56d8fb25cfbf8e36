//! Copilot model-name normalization (C2). A pure, deterministic string pipeline: arbitrary
//! model ids (Anthropic names, legacy aliases, dated snapshots) in, the Copilot-accepted
//! model id plus a reasoning bit out.

use regex::Regex;
use std::sync::OnceLock;

/// The set of model ids Copilot accepts verbatim, version-stamped alongside the override
/// map below. Exact members short-circuit the whole pipeline (step 1).
const KNOWN_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1",
    "gpt-4.5",
    "gpt-5",
    "gpt-5-mini",
    "gpt-5-codex",
    "o3-mini",
    "o4-mini",
    "claude-opus-41",
    "claude-opus-4",
    "claude-sonnet-4",
    "claude-sonnet-4.5",
    "claude-haiku-4.5",
    "gemini-2.5-pro",
];

/// Case-insensitive aliases, checked both before and after suffix-stripping (steps 2, 6).
const OVERRIDE_MAP: &[(&str, &str)] = &[
    ("claude-opus-4-1", "claude-opus-41"),
    ("claude-3-5-sonnet", "claude-sonnet-4"),
    ("claude-3-opus", "claude-opus-4"),
    ("claude-3-haiku", "claude-haiku-4.5"),
    ("claude-3-5-haiku", "claude-haiku-4.5"),
    ("o1", "gpt-5-mini"),
    ("o1-preview", "gpt-5-mini"),
    ("o3", "gpt-5-mini"),
    ("o3-preview", "gpt-5-mini"),
    ("gpt-4-turbo", "gpt-4.1"),
    ("gpt-4", "gpt-4o"),
];

/// Model names whose literal hyphenated form must never be dot-collapsed by step 8.
const NEVER_COLLAPSE: &[&str] = &["gpt-5-mini", "gpt-5-codex"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeResult {
    pub name: String,
    pub is_thinking: bool,
    /// False if the pipeline fell through without landing on a known model id. The
    /// request still proceeds; the caller logs a warning.
    pub known: bool,
}

fn date_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-\d{8}$").unwrap())
}

fn claude_hyphen_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^claude-(sonnet|opus|haiku)-(\d+)-(\d+)$").unwrap())
}

fn gpt_hyphen_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^gpt-(\d+)-(\d+)(-.*)?$").unwrap())
}

fn override_lookup(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    OVERRIDE_MAP.iter().find(|(k, _)| *k == lower).map(|(_, v)| *v)
}

/// Apply the nine-step pipeline described in §4.2. The first rule that completes returns.
pub fn normalize(model_name: &str) -> NormalizeResult {
    // Step 1: exact member of the known set.
    if KNOWN_MODELS.contains(&model_name) {
        return NormalizeResult { name: model_name.to_string(), is_thinking: false, known: true };
    }

    // Step 2: case-insensitive override match on the raw input.
    if let Some(mapped) = override_lookup(model_name) {
        return finish(mapped.to_string(), false);
    }

    let mut working = model_name.to_string();

    // Steps 3-5: strip trailing -YYYYMMDD, -latest/-0, and -thinking, looping until none
    // apply. A date stamp can follow a -thinking/-latest suffix in the raw input (e.g.
    // "...-20260101-thinking"), so stripping the date only once before the suffix loop
    // would leave it stranded once the suffix in front of it is removed; re-checking the
    // date suffix on every pass handles either ordering.
    let mut is_thinking = false;
    loop {
        let stripped_date = date_suffix_re().replace(&working, "").to_string();
        if stripped_date != working {
            working = stripped_date;
            continue;
        }
        if let Some(stripped) = working.strip_suffix("-thinking") {
            is_thinking = true;
            working = stripped.to_string();
            continue;
        }
        if let Some(stripped) = working.strip_suffix("-latest") {
            working = stripped.to_string();
            continue;
        }
        if let Some(stripped) = working.strip_suffix("-0") {
            working = stripped.to_string();
            continue;
        }
        break;
    }

    // Step 6: re-check the override map on the stripped form.
    if let Some(mapped) = override_lookup(&working) {
        return finish_with_thinking(mapped.to_string(), is_thinking);
    }

    // Step 7: collapse Claude version hyphens.
    if let Some(caps) = claude_hyphen_re().captures(&working) {
        working = format!("claude-{}-{}.{}", &caps[1], &caps[2], &caps[3]);
    } else if !NEVER_COLLAPSE.contains(&working.as_str()) {
        // Step 8: collapse GPT version hyphens, skipping the protected literals.
        if let Some(caps) = gpt_hyphen_re().captures(&working) {
            let suffix = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            working = format!("gpt-{}.{}{}", &caps[1], &caps[2], suffix);
        }
    }

    finish_with_thinking(working, is_thinking)
}

fn finish(name: String, is_thinking: bool) -> NormalizeResult {
    finish_with_thinking(name, is_thinking)
}

fn finish_with_thinking(name: String, is_thinking: bool) -> NormalizeResult {
    // Step 9: final membership check; unknown results still proceed.
    let known = KNOWN_MODELS.contains(&name.as_str());
    if !known {
        tracing::warn!(model = %name, "copilot: normalized model id not in known set");
    }
    NormalizeResult { name, is_thinking, known }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_returned_as_is() {
        let r = normalize("gpt-5-mini");
        assert_eq!(r.name, "gpt-5-mini");
        assert!(!r.is_thinking);
        assert!(r.known);
    }

    #[test]
    fn legacy_opus_alias_maps_directly() {
        let r = normalize("claude-opus-4-1");
        assert_eq!(r.name, "claude-opus-41");
    }

    #[test]
    fn o_series_maps_to_gpt_5_mini() {
        assert_eq!(normalize("o1").name, "gpt-5-mini");
        assert_eq!(normalize("o3").name, "gpt-5-mini");
    }

    #[test]
    fn dated_thinking_snapshot_strips_in_order() {
        let r = normalize("claude-opus-4-1-20260101-thinking");
        assert_eq!(r.name, "claude-opus-41");
        assert!(r.is_thinking);
    }

    #[test]
    fn gpt_5_mini_never_dot_collapsed() {
        let r = normalize("gpt-5-mini");
        assert_eq!(r.name, "gpt-5-mini");
    }

    #[test]
    fn gpt_5_codex_never_dot_collapsed() {
        let r = normalize("gpt-5-codex");
        assert_eq!(r.name, "gpt-5-codex");
    }

    #[test]
    fn claude_hyphen_collapses_to_dot() {
        let r = normalize("claude-sonnet-4-5");
        assert_eq!(r.name, "claude-sonnet-4.5");
        assert!(r.known);
    }

    #[test]
    fn gpt_hyphen_collapses_to_dot() {
        let r = normalize("gpt-4-1");
        assert_eq!(r.name, "gpt-4.1");
    }

    #[test]
    fn latest_suffix_is_stripped() {
        let r = normalize("claude-sonnet-4-5-latest");
        assert_eq!(r.name, "claude-sonnet-4.5");
    }

    #[test]
    fn unknown_model_proceeds_marked_unknown() {
        let r = normalize("totally-unheard-of-model");
        assert_eq!(r.name, "totally-unheard-of-model");
        assert!(!r.known);
    }

    #[test]
    fn latest_and_thinking_suffixes_combine_in_either_order() {
        let r = normalize("claude-3-5-sonnet-latest-thinking");
        assert_eq!(r.name, "claude-sonnet-4");
        assert!(r.is_thinking);
    }

    #[test]
    fn normalize_is_idempotent_on_the_name() {
        for input in ["claude-opus-4-1-20260101-thinking", "gpt-4-1", "o3", "gpt-5-mini"] {
            let once = normalize(input);
            let twice = normalize(&once.name);
            assert_eq!(once.name, twice.name, "not idempotent for {input}");
        }
    }
}
