//! Model mapping: short tokens like "sonnet" resolve to concrete upstream
//! model ids. Account mappings are matched case-insensitively by substring,
//! longest key first; the sorted key order is cached per mapping content.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use crate::accounts::ProviderKind;
use crate::constants::DEFAULT_MODEL_MAPPINGS;

/// Sorted-key cache keyed by a hash of the mapping contents, so runtime
/// mapping edits invalidate naturally.
static SORTED_KEYS: Mutex<Option<HashMap<u64, Vec<String>>>> = Mutex::new(None);

fn mapping_hash(mappings: &HashMap<String, String>) -> u64 {
    let mut entries: Vec<_> = mappings.iter().collect();
    entries.sort();
    let mut hasher = DefaultHasher::new();
    for (k, v) in entries {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

fn sorted_keys(mappings: &HashMap<String, String>) -> Vec<String> {
    let hash = mapping_hash(mappings);
    let mut guard = SORTED_KEYS.lock().expect("model map cache lock");
    let cache = guard.get_or_insert_with(HashMap::new);
    if let Some(keys) = cache.get(&hash) {
        return keys.clone();
    }
    let mut keys: Vec<String> = mappings.keys().cloned().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    cache.insert(hash, keys.clone());
    keys
}

/// Resolve the upstream model id for an inbound model name.
pub fn map_model(
    mappings: Option<&HashMap<String, String>>,
    model: &str,
    kind: ProviderKind,
) -> String {
    if let Some(mappings) = mappings {
        let lowered = model.to_ascii_lowercase();
        for key in sorted_keys(mappings) {
            if lowered.contains(&key.to_ascii_lowercase()) {
                return mappings[&key].clone();
            }
        }
        return model.to_string();
    }

    // Providers that need concrete ids resolve bare aliases through the
    // built-in defaults; everything else passes through unchanged.
    if matches!(
        kind,
        ProviderKind::AnthropicOauth | ProviderKind::AnthropicConsoleKey
    ) && let Some((_, target)) = DEFAULT_MODEL_MAPPINGS
        .iter()
        .find(|(alias, _)| model.eq_ignore_ascii_case(alias))
    {
        return (*target).to_string();
    }

    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_longest_key_wins() {
        let m = mappings(&[
            ("sonnet", "provider/sonnet-generic"),
            ("sonnet-4-5", "provider/sonnet-45"),
        ]);
        assert_eq!(
            map_model(Some(&m), "claude-sonnet-4-5", ProviderKind::OpenaiCompatible),
            "provider/sonnet-45"
        );
        assert_eq!(
            map_model(Some(&m), "claude-sonnet-4-0", ProviderKind::OpenaiCompatible),
            "provider/sonnet-generic"
        );
    }

    #[test]
    fn test_case_insensitive_substring() {
        let m = mappings(&[("OPUS", "provider/opus")]);
        assert_eq!(
            map_model(Some(&m), "claude-opus-4-5", ProviderKind::OpenaiCompatible),
            "provider/opus"
        );
    }

    #[test]
    fn test_no_match_passes_through() {
        let m = mappings(&[("opus", "provider/opus")]);
        assert_eq!(
            map_model(Some(&m), "claude-haiku-4-5", ProviderKind::OpenaiCompatible),
            "claude-haiku-4-5"
        );
    }

    #[test]
    fn test_builtin_default_for_bare_alias() {
        assert_eq!(
            map_model(None, "sonnet", ProviderKind::AnthropicOauth),
            "claude-sonnet-4-5"
        );
        // Concrete ids and non-anthropic kinds pass through
        assert_eq!(
            map_model(None, "claude-sonnet-4-5", ProviderKind::AnthropicOauth),
            "claude-sonnet-4-5"
        );
        assert_eq!(
            map_model(None, "sonnet", ProviderKind::OpenaiCompatible),
            "sonnet"
        );
    }
}
