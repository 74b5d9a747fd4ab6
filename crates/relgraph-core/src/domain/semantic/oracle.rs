//! Judgment oracle seam and output validation
//!
//! The oracle's reply is untrusted text. [`parse_judgments`] accepts fenced JSON, an
//! object with a `judgments` array, or a bare array, and validates every item on its
//! own so one bad item does not sink the rest.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::documents::DocumentKey;
use crate::domain::relationships::RelationshipType;
use crate::error::{Error, Result};

/// Text of a document as shown to the oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentDocument {
    /// Internal document id; used as `candidate_id` in the reply
    pub id: String,
    pub key: DocumentKey,
    pub title: String,
    pub text: String,
}

/// A candidate with its retrieval similarity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentCandidate {
    #[serde(flatten)]
    pub document: JudgmentDocument,
    pub similarity: f32,
}

/// One oracle call: a source document and the candidates to judge against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentRequest {
    pub workspace_id: String,
    pub source: JudgmentDocument,
    pub candidates: Vec<JudgmentCandidate>,
}

impl JudgmentRequest {
    fn knows_candidate(&self, id: &str) -> bool {
        self.candidates.iter().any(|c| c.document.id == id)
    }

    /// System and user prompt for a chat-style oracle
    pub fn prompt(&self) -> (String, String) {
        let types: Vec<String> = RelationshipType::all().iter().map(|t| t.label()).collect();
        let system = format!(
            "You judge whether a source document is related to candidate documents.\n\
             For every candidate return one JSON object with fields: candidate_id, \
             relationship_type (one of {} or NONE), confidence (0.0-1.0), reasoning, \
             source_evidence (a short quote from the source), target_evidence (a short \
             quote from the candidate).\n\
             Reply with JSON only: {{\"judgments\": [...]}}",
            types.join(", ")
        );

        let mut user = format!(
            "SOURCE {} ({})\nTitle: {}\n{}\n\nCANDIDATES:\n",
            self.source.id, self.source.key, self.source.title, self.source.text
        );
        for candidate in &self.candidates {
            user.push_str(&format!(
                "\n---\ncandidate_id: {}\nkey: {}\nsimilarity: {:.2}\nTitle: {}\n{}\n",
                candidate.document.id,
                candidate.document.key,
                candidate.similarity,
                candidate.document.title,
                candidate.document.text
            ));
        }
        (system, user)
    }
}

/// Pluggable relationship judge
#[async_trait]
pub trait JudgmentOracle: Send + Sync {
    /// Raw reply for a request; validated by [`parse_judgments`]
    async fn judge(&self, request: &JudgmentRequest) -> Result<String>;
}

/// A validated judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub candidate_id: String,
    /// `None` when the oracle answered NONE
    pub relationship_type: Option<RelationshipType>,
    pub confidence: f32,
    pub reasoning: String,
    pub source_evidence: String,
    pub target_evidence: String,
}

/// Valid judgments plus a reason for each discarded item
#[derive(Debug, Clone, Default)]
pub struct ParsedJudgments {
    pub judgments: Vec<Judgment>,
    pub violations: Vec<String>,
}

/// Validate a raw oracle reply against the request
///
/// Fails with [`Error::SchemaViolation`] only when the reply holds no judgment list at
/// all.
pub fn parse_judgments(raw: &str, request: &JudgmentRequest) -> Result<ParsedJudgments> {
    let json = extract_json_from_response(raw);
    let value: Value = serde_json::from_str(&json)
        .map_err(|e| Error::SchemaViolation(format!("reply is not JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("judgments") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::SchemaViolation(
                    "reply has no `judgments` array".to_string(),
                ));
            }
        },
        _ => {
            return Err(Error::SchemaViolation(
                "reply is neither an array nor an object".to_string(),
            ));
        }
    };

    let mut parsed = ParsedJudgments::default();
    for (i, item) in items.iter().enumerate() {
        match validate_item(item, request) {
            Ok(judgment) => parsed.judgments.push(judgment),
            Err(reason) => parsed.violations.push(format!("item {}: {}", i, reason)),
        }
    }
    Ok(parsed)
}

fn validate_item(item: &Value, request: &JudgmentRequest) -> std::result::Result<Judgment, String> {
    let obj = item.as_object().ok_or("not an object")?;
    let text = |names: &[&str]| -> String {
        names
            .iter()
            .find_map(|n| obj.get(*n).and_then(Value::as_str))
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    let candidate_id = match obj.get("candidate_id").or_else(|| obj.get("candidateId")) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("missing candidate_id".to_string()),
    };
    if !request.knows_candidate(&candidate_id) {
        return Err(format!("unknown candidate `{}`", candidate_id));
    }

    let type_name = text(&["relationship_type", "relationshipType", "type"]);
    let relationship_type = if type_name.is_empty() {
        return Err("missing relationship_type".to_string());
    } else if type_name.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(
            RelationshipType::parse(&type_name)
                .ok_or_else(|| format!("unknown relationship type `{}`", type_name))?,
        )
    };

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or("missing numeric confidence")? as f32;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {} out of range", confidence));
    }

    Ok(Judgment {
        candidate_id,
        relationship_type,
        confidence,
        reasoning: text(&["reasoning"]),
        source_evidence: text(&["source_evidence", "sourceEvidence"]),
        target_evidence: text(&["target_evidence", "targetEvidence"]),
    })
}

/// Extract JSON from a response that might contain markdown or other text
fn extract_json_from_response(response: &str) -> String {
    if let Some(start) = response.find("```json") {
        let json_start = start + 7;
        if let Some(end) = response[json_start..].find("```") {
            return response[json_start..json_start + end].trim().to_string();
        }
    }

    if let Some(start) = response.find("```") {
        let potential_start = start + 3;
        if let Some(newline) = response[potential_start..].find('\n') {
            let json_start = potential_start + newline + 1;
            if let Some(end) = response[json_start..].find("```") {
                return response[json_start..json_start + end].trim().to_string();
            }
        }
    }

    let trimmed = response.trim();
    let object = trimmed.find('{').zip(trimmed.rfind('}'));
    let array = trimmed.find('[').zip(trimmed.rfind(']'));
    match (object, array) {
        (Some((os, _)), Some((as_, ae))) if as_ < os => trimmed[as_..=ae].to_string(),
        (Some((os, oe)), _) if os < oe => trimmed[os..=oe].to_string(),
        (None, Some((as_, ae))) if as_ < ae => trimmed[as_..=ae].to_string(),
        _ => trimmed.to_string(),
    }
}
