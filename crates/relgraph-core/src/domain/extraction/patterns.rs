//! Text pattern rules
//!
//! Typed rules (closing keywords, "blocked by") run first. Reference rules (URLs and
//! bare ticket keys) only fill in targets no typed rule already claimed.

use std::collections::{BTreeMap, HashSet};

use regex::{Captures, Regex};

use crate::config::ExtractionConfig;
use crate::domain::documents::DocumentKey;
use crate::domain::relationships::RelationshipType;
use crate::error::{Error, Result};

/// Version of the rule set below; documents processed under an older version are stale
pub const EXTRACTION_RULE_VERSION: u32 = 1;

const TICKET_KEY: &str = r"[A-Z][A-Z0-9]{1,9}-\d+";

/// A compiled text rule
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    pub name: &'static str,
    regex: Regex,
    pub relationship_type: RelationshipType,
    pub confidence: f32,
    /// Only applies to targets not claimed by a typed rule
    pub fallback: bool,
    /// Bare keys need a configured prefix
    known_prefix_only: bool,
}

/// One rule hit
#[derive(Debug, Clone, PartialEq)]
pub struct TextMatch {
    pub rule: &'static str,
    pub relationship_type: RelationshipType,
    pub target: DocumentKey,
    pub confidence: f32,
    /// Matched span
    pub quote: String,
    pub start: usize,
    pub end: usize,
}

/// Per-document context for resolving short references like `#42`
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    /// `owner/repo` of the document, if known
    pub repository: Option<String>,
}

/// The compiled rule set
#[derive(Debug, Clone)]
pub struct TextRules {
    rules: Vec<ExtractionRule>,
    key_prefixes: BTreeMap<String, String>,
    default_ticket_source: String,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Fatal(format!("invalid extraction rule: {}", e)))
}

impl TextRules {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let github_ref =
            r"https?://github\.com/(?P<owner>[\w.-]+)/(?P<repo>[\w.-]+)/(?:issues|pull)/(?P<number>\d+)";

        let rules = vec![
            ExtractionRule {
                name: "closing_keyword",
                regex: compile(&format!(
                    r"(?i:\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?))\s*:?\s+(?:{}|#(?P<local>\d+)\b|\b(?P<key>{})\b)",
                    github_ref, TICKET_KEY
                ))?,
                relationship_type: RelationshipType::Resolves,
                confidence: 0.95,
                fallback: false,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "issue_key_mention",
                regex: compile(&format!(
                    r"(?i:\bblocked\s+by)\s+(?:#(?P<local>\d+)\b|\b(?P<key>{})\b)",
                    TICKET_KEY
                ))?,
                relationship_type: RelationshipType::BlockedBy,
                confidence: 0.92,
                fallback: false,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "github_issue_url",
                regex: compile(
                    r"https?://github\.com/(?P<owner>[\w.-]+)/(?P<repo>[\w.-]+)/issues/(?P<number>\d+)",
                )?,
                relationship_type: RelationshipType::References,
                confidence: 0.98,
                fallback: true,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "github_pull_url",
                regex: compile(
                    r"https?://github\.com/(?P<owner>[\w.-]+)/(?P<repo>[\w.-]+)/pull/(?P<number>\d+)",
                )?,
                relationship_type: RelationshipType::References,
                confidence: 0.98,
                fallback: true,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "linear_url",
                regex: compile(r"https?://linear\.app/[\w-]+/issue/(?P<linear>[A-Za-z][A-Za-z0-9]*-\d+)")?,
                relationship_type: RelationshipType::References,
                confidence: 0.97,
                fallback: true,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "jira_url",
                regex: compile(r"https?://[\w-]+\.atlassian\.net/browse/(?P<jira>[A-Z][A-Z0-9]*-\d+)")?,
                relationship_type: RelationshipType::References,
                confidence: 0.97,
                fallback: true,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "sentry_url",
                regex: compile(
                    r"https?://(?:[\w-]+\.)?sentry\.io/(?:organizations/[\w-]+/)?issues/(?P<sentry>\d+)",
                )?,
                relationship_type: RelationshipType::References,
                confidence: 0.96,
                fallback: true,
                known_prefix_only: false,
            },
            ExtractionRule {
                name: "bare_issue_key",
                regex: compile(&format!(r"\b(?P<key>{})\b", TICKET_KEY))?,
                relationship_type: RelationshipType::References,
                confidence: 0.90,
                fallback: true,
                known_prefix_only: true,
            },
        ];

        let key_prefixes = config
            .key_prefixes
            .iter()
            .map(|(prefix, source)| (prefix.to_uppercase(), source.to_lowercase()))
            .collect();

        Ok(Self {
            rules,
            key_prefixes,
            default_ticket_source: config.default_ticket_source.to_lowercase(),
        })
    }

    pub fn rules(&self) -> &[ExtractionRule] {
        &self.rules
    }

    /// Source type for a ticket key, e.g. `LIN-12` -> `linear`
    pub fn ticket_source(&self, key: &str, known_prefix_only: bool) -> Option<String> {
        let (prefix, _) = key.split_once('-')?;
        match self.key_prefixes.get(&prefix.to_uppercase()) {
            Some(source) => Some(source.clone()),
            None if known_prefix_only => None,
            None => Some(self.default_ticket_source.clone()),
        }
    }

    fn target(&self, rule: &ExtractionRule, caps: &Captures, ctx: &ScanContext) -> Option<DocumentKey> {
        if let (Some(owner), Some(repo), Some(number)) =
            (caps.name("owner"), caps.name("repo"), caps.name("number"))
        {
            return Some(DocumentKey::new(
                "github",
                format!("{}/{}#{}", owner.as_str(), repo.as_str(), number.as_str()),
            ));
        }
        if let Some(local) = caps.name("local") {
            let repo = ctx.repository.as_ref()?;
            return Some(DocumentKey::new("github", format!("{}#{}", repo, local.as_str())));
        }
        if let Some(key) = caps.name("key") {
            let key = key.as_str().to_uppercase();
            let source = self.ticket_source(&key, rule.known_prefix_only)?;
            return Some(DocumentKey::new(source, key));
        }
        if let Some(key) = caps.name("linear") {
            return Some(DocumentKey::new("linear", key.as_str().to_uppercase()));
        }
        if let Some(key) = caps.name("jira") {
            return Some(DocumentKey::new("jira", key.as_str()));
        }
        if let Some(id) = caps.name("sentry") {
            return Some(DocumentKey::new("sentry", id.as_str()));
        }
        None
    }

    /// Run every rule over `text`
    pub fn scan(&self, text: &str, ctx: &ScanContext) -> Vec<TextMatch> {
        let mut matches = Vec::new();
        let mut claimed: HashSet<DocumentKey> = HashSet::new();

        for pass_fallback in [false, true] {
            for rule in self.rules.iter().filter(|r| r.fallback == pass_fallback) {
                for caps in rule.regex.captures_iter(text) {
                    let Some(whole) = caps.get(0) else { continue };
                    let Some(target) = self.target(rule, &caps, ctx) else {
                        continue;
                    };
                    if pass_fallback && claimed.contains(&target) {
                        continue;
                    }
                    if !pass_fallback {
                        claimed.insert(target.clone());
                    }
                    matches.push(TextMatch {
                        rule: rule.name,
                        relationship_type: rule.relationship_type,
                        target,
                        confidence: rule.confidence,
                        quote: whole.as_str().to_string(),
                        start: whole.start(),
                        end: whole.end(),
                    });
                }
            }
        }

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> TextRules {
        TextRules::new(&ExtractionConfig::default()).unwrap()
    }

    fn ctx() -> ScanContext {
        ScanContext {
            repository: Some("acme/api".to_string()),
        }
    }

    #[test]
    fn test_closing_keyword_with_key() {
        let matches = rules().scan("This PR Closes LIN-123 for good", &ctx());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule, "closing_keyword");
        assert_eq!(matches[0].relationship_type, RelationshipType::Resolves);
        assert_eq!(matches[0].target, DocumentKey::new("linear", "LIN-123"));
        assert_eq!(matches[0].confidence, 0.95);
        assert_eq!(matches[0].quote, "Closes LIN-123");
    }

    #[test]
    fn test_closing_keyword_local_number() {
        let matches = rules().scan("fixes #42", &ctx());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].target, DocumentKey::new("github", "acme/api#42"));

        let none = rules().scan("fixes #42", &ScanContext::default());
        assert!(none.is_empty());
    }

    #[test]
    fn test_closing_keyword_with_url_claims_target() {
        let matches = rules().scan("Resolves https://github.com/Acme/API/issues/7", &ctx());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].relationship_type, RelationshipType::Resolves);
        assert_eq!(matches[0].target, DocumentKey::new("github", "acme/api#7"));
    }

    #[test]
    fn test_urls() {
        let text = "See https://github.com/acme/web/pull/9, \
                    https://linear.app/acme/issue/LIN-9/some-title, \
                    https://acme.atlassian.net/browse/OPS-1 and \
                    https://sentry.io/organizations/acme/issues/123/";
        let matches = rules().scan(text, &ctx());
        let targets: Vec<String> = matches.iter().map(|m| m.target.to_string()).collect();

        assert!(targets.contains(&"github/acme/web#9".to_string()));
        assert!(targets.contains(&"linear/LIN-9".to_string()));
        assert!(targets.contains(&"jira/OPS-1".to_string()));
        assert!(targets.contains(&"sentry/123".to_string()));
        assert!(matches.iter().all(|m| m.relationship_type == RelationshipType::References));
    }

    #[test]
    fn test_blocked_by() {
        let matches = rules().scan("This is blocked by OPS-12.", &ctx());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].relationship_type, RelationshipType::BlockedBy);
        assert_eq!(matches[0].target, DocumentKey::new("jira", "OPS-12"));
        assert_eq!(matches[0].confidence, 0.92);
    }

    #[test]
    fn test_bare_key_needs_known_prefix() {
        let matches = rules().scan("see LIN-77 and UTF-8 and SHA-256", &ctx());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule, "bare_issue_key");
        assert_eq!(matches[0].target, DocumentKey::new("linear", "LIN-77"));
        assert_eq!(matches[0].confidence, 0.90);
    }

    #[test]
    fn test_custom_prefixes() {
        let mut config = ExtractionConfig::default();
        config.key_prefixes.insert("eng".into(), "Linear".into());
        let rules = TextRules::new(&config).unwrap();

        assert_eq!(rules.ticket_source("ENG-4", true).as_deref(), Some("linear"));
        assert_eq!(rules.ticket_source("OPS-4", true), None);
        assert_eq!(rules.ticket_source("OPS-4", false).as_deref(), Some("jira"));
    }

    #[test]
    fn test_span_offsets() {
        let text = "prefix Closes LIN-5";
        let matches = rules().scan(text, &ctx());
        assert_eq!(&text[matches[0].start..matches[0].end], "Closes LIN-5");
    }
}
