/// Recovery of malformed extraction responses.
///
/// The enrichment service is expected to answer with
/// `{"concepts": [...], "summary": "..."}`. When it does not, recovery is
/// attempted in order:
///
/// 1. Structural repair: strip code fences, keep the outermost `{...}`,
///    drop trailing commas
/// 2. Partial extraction: pull the `concepts` array (and `summary`) out
///    with regexes
/// 3. Safe default: no concepts, no summary
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("invalid regex"));

static CONCEPTS_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""concepts"\s*:\s*\[([^\]]*)"#).expect("invalid regex"));

static SUMMARY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""summary"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("invalid regex")
});

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("invalid regex"));

/// How an extraction response was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Well-formed
    Clean,
    /// Parsed after structural repair
    Repaired,
    /// Fields pulled out of unparseable text
    Partial,
    /// Nothing usable; empty default substituted
    SafeDefault,
}

/// Parsed extraction payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Extraction {
    /// Normalized concept set: trimmed, lowercased, non-empty, at most `limit`.
    pub fn concept_set(&self, limit: usize) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        for concept in &self.concepts {
            let normalized = concept.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            seen.insert(normalized);
            if seen.len() >= limit {
                break;
            }
        }
        seen
    }
}

/// Parse a raw extraction response, recovering what can be recovered.
pub fn parse_extraction(raw: &str) -> (Extraction, Recovery) {
    if let Ok(parsed) = serde_json::from_str::<Extraction>(raw) {
        return (parsed, Recovery::Clean);
    }
    if let Some(parsed) = repair(raw) {
        return (parsed, Recovery::Repaired);
    }
    if let Some(parsed) = partial(raw) {
        return (parsed, Recovery::Partial);
    }
    (Extraction::default(), Recovery::SafeDefault)
}

fn repair(raw: &str) -> Option<Extraction> {
    let unfenced = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```");
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    let body = TRAILING_COMMA.replace_all(&unfenced[start..=end], "$1");
    serde_json::from_str(&body).ok()
}

fn partial(raw: &str) -> Option<Extraction> {
    let list = CONCEPTS_ARRAY.captures(raw)?.get(1)?.as_str();
    let concepts: Vec<String> = QUOTED
        .captures_iter(list)
        .filter_map(|c| c.get(1).map(|m| unescape(m.as_str())))
        .collect();
    if concepts.is_empty() {
        return None;
    }
    let summary = SUMMARY_FIELD
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()));
    Some(Extraction { concepts, summary })
}

fn unescape(s: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{s}\"")).unwrap_or_else(|_| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_response() {
        let (parsed, recovery) = parse_extraction(r#"{"concepts": ["Rust", "memory"], "summary": "ok"}"#);
        assert_eq!(recovery, Recovery::Clean);
        assert_eq!(parsed.summary.as_deref(), Some("ok"));
        let set = parsed.concept_set(8);
        assert!(set.contains("rust"));
    }

    #[test]
    fn test_fenced_with_trailing_comma() {
        let raw = "```json\n{\"concepts\": [\"a\", \"b\",], \"summary\": \"s\",}\n```";
        let (parsed, recovery) = parse_extraction(raw);
        assert_eq!(recovery, Recovery::Repaired);
        assert_eq!(parsed.concepts, vec!["a", "b"]);
    }

    #[test]
    fn test_prose_wrapped_object() {
        let raw = "Sure! Here you go: {\"concepts\": [\"sleep\"]} hope that helps";
        let (parsed, recovery) = parse_extraction(raw);
        assert_eq!(recovery, Recovery::Repaired);
        assert_eq!(parsed.concepts, vec!["sleep"]);
    }

    #[test]
    fn test_partial_extraction_from_truncated_json() {
        let raw = r#"{"summary": "cut \"short\"", "concepts": ["graph", "hebb"], "extra": {"#;
        let (parsed, recovery) = parse_extraction(raw);
        assert_eq!(recovery, Recovery::Partial);
        assert_eq!(parsed.concepts, vec!["graph", "hebb"]);
        assert_eq!(parsed.summary.as_deref(), Some("cut \"short\""));
    }

    #[test]
    fn test_garbage_yields_safe_default() {
        let (parsed, recovery) = parse_extraction("<html>502 Bad Gateway</html>");
        assert_eq!(recovery, Recovery::SafeDefault);
        assert!(parsed.concepts.is_empty());
        assert!(parsed.summary.is_none());
    }

    #[test]
    fn test_concept_set_limit_and_normalization() {
        let extraction = Extraction {
            concepts: vec![" A ".into(), "a".into(), "".into(), "b".into(), "c".into()],
            summary: None,
        };
        let set = extraction.concept_set(2);
        assert_eq!(set.len(), 2);
        assert!(set.contains("a") && set.contains("b"));
    }
}
