//! Client for the external structured-output reasoning service.
//!
//! One prompt per request, one attempt, bounded by a hard timeout.  The
//! reply must satisfy the response-shape contract exactly (one finding per
//! submitted code with every field in range) or the whole reply is
//! discarded as unusable.  This client never fabricates or trims findings;
//! degraded content is the fallback synthesizer's job alone.

use serde_json::{json, Value};

use crate::validate::DiagnosticRequest;
use crate::DiagnosticFinding;

const SYSTEM_PROMPT: &str = "You are an automotive diagnostics expert. You receive OBD-II trouble \
     codes together with the vehicle's identity and reply with structured \
     JSON only: no prose, no markdown fences, no commentary.";

/// Signals that no usable result could be obtained.  Every variant triggers
/// the fallback path; none of them surfaces to the caller as a failure.
#[derive(Debug, thiserror::Error)]
pub enum ReasonerError {
    #[error("reasoner disabled: no endpoint configured")]
    Disabled,
    #[error("reasoner request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("reasoner replied with status {0}")]
    Status(u16),
    #[error("reasoner reply violated the output contract: {0}")]
    Contract(String),
}

/// Seam for the analysis stage, so the orchestrator can be exercised
/// without a live reasoning service.
#[async_trait::async_trait]
pub trait Reasoner: Send + Sync {
    async fn analyze(
        &self,
        request: &DiagnosticRequest,
    ) -> Result<Vec<DiagnosticFinding>, ReasonerError>;
}

/// Always-unusable reasoner used when no endpoint is configured; the
/// pipeline then runs permanently on the fallback synthesizer.
pub struct DisabledReasoner;

#[async_trait::async_trait]
impl Reasoner for DisabledReasoner {
    async fn analyze(
        &self,
        _request: &DiagnosticRequest,
    ) -> Result<Vec<DiagnosticFinding>, ReasonerError> {
        Err(ReasonerError::Disabled)
    }
}

/// Chat-completions client with a constrained-JSON response contract.
pub struct HttpReasoner {
    url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl HttpReasoner {
    pub fn new(url: String, api_key: Option<String>, model: String, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        HttpReasoner {
            url,
            api_key,
            model,
            client,
        }
    }

    fn build_prompt(request: &DiagnosticRequest) -> String {
        let codes = request.trouble_codes.join(", ");
        format!(
            "Vehicle: {brand} {model}, year {year}.\n\
             Trouble codes: {codes}.\n\n\
             Return a JSON object with a single key \"diagnostics\" whose value is an \
             array containing exactly one object per trouble code, in the order given. \
             Each object must have exactly this shape:\n\
             {{\"code\": string, \"description\": string (plain-language explanation in \
             Brazilian Portuguese), \"priority\": \"critical\" | \"attention\" | \
             \"preventive\", \"severity\": integer 1-10, \"canDiy\": boolean, \
             \"diyDifficulty\": integer 1-5 or null, \"probableCauses\": array of \
             strings, \"solutionUrl\": string or null}}",
            brand = request.vehicle_brand,
            model = request.vehicle_model,
            year = request.vehicle_year,
            codes = codes,
        )
    }
}

#[async_trait::async_trait]
impl Reasoner for HttpReasoner {
    async fn analyze(
        &self,
        request: &DiagnosticRequest,
    ) -> Result<Vec<DiagnosticFinding>, ReasonerError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::build_prompt(request)},
            ],
            "temperature": 0.2,
            "response_format": {"type": "json_object"},
        });
        let mut rb = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ReasonerError::Status(status.as_u16()));
        }
        let payload: Value = resp.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ReasonerError::Contract("missing message content".into()))?;
        parse_findings(content, &request.trouble_codes)
    }
}

/// Parse the constrained-JSON reply and enforce the contract: valid shape,
/// in-range fields, and exactly one finding per submitted code.  Findings
/// are reordered to submission order.
pub fn parse_findings(
    content: &str,
    codes: &[String],
) -> Result<Vec<DiagnosticFinding>, ReasonerError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| ReasonerError::Contract(format!("content is not JSON: {}", e)))?;

    // Accept the requested {"diagnostics": [...]} wrapper or a bare array.
    let items = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .values()
            .find_map(Value::as_array)
            .cloned()
            .ok_or_else(|| ReasonerError::Contract("no findings array in reply".into()))?,
        _ => return Err(ReasonerError::Contract("reply is neither array nor object".into())),
    };

    let mut pool: Vec<DiagnosticFinding> = Vec::with_capacity(items.len());
    for item in items {
        let finding: DiagnosticFinding = serde_json::from_value(item)
            .map_err(|e| ReasonerError::Contract(format!("malformed finding: {}", e)))?;
        if !(1..=10).contains(&finding.severity) {
            return Err(ReasonerError::Contract(format!(
                "severity {} outside 1-10 for code {}",
                finding.severity, finding.code
            )));
        }
        if let Some(difficulty) = finding.diy_difficulty {
            if !(1..=5).contains(&difficulty) {
                return Err(ReasonerError::Contract(format!(
                    "diyDifficulty {} outside 1-5 for code {}",
                    difficulty, finding.code
                )));
            }
        }
        pool.push(finding);
    }

    // One finding per submitted code, reordered to submission order.
    let mut ordered = Vec::with_capacity(codes.len());
    for code in codes {
        let position = pool
            .iter()
            .position(|f| &f.code == code)
            .ok_or_else(|| ReasonerError::Contract(format!("no finding for code {}", code)))?;
        ordered.push(pool.swap_remove(position));
    }
    if !pool.is_empty() {
        return Err(ReasonerError::Contract(format!(
            "{} finding(s) for codes that were not submitted",
            pool.len()
        )));
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;

    fn request() -> DiagnosticRequest {
        DiagnosticRequest {
            trouble_codes: vec!["P0171".into(), "P0300".into()],
            vehicle_brand: "Toyota".into(),
            vehicle_model: "Corolla".into(),
            vehicle_year: 2015,
            diagnostic_id: None,
            user_id: None,
            vehicle_id: None,
        }
    }

    fn finding_json(code: &str, priority: &str) -> serde_json::Value {
        json!({
            "code": code,
            "description": "Mistura pobre detectada",
            "priority": priority,
            "severity": 6,
            "canDiy": true,
            "diyDifficulty": 3,
            "probableCauses": ["vacuum leak"],
            "solutionUrl": null,
        })
    }

    #[test]
    fn prompt_embeds_vehicle_and_codes() {
        let prompt = HttpReasoner::build_prompt(&request());
        assert!(prompt.contains("Toyota Corolla, year 2015"));
        assert!(prompt.contains("P0171, P0300"));
        assert!(prompt.contains("\"diagnostics\""));
    }

    #[test]
    fn parses_wrapped_reply_in_submission_order() {
        // Reply deliberately reversed relative to submission.
        let content = json!({
            "diagnostics": [finding_json("P0300", "critical"), finding_json("P0171", "attention")]
        })
        .to_string();
        let codes = request().trouble_codes;
        let findings = parse_findings(&content, &codes).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].code, "P0171");
        assert_eq!(findings[0].priority, Priority::Attention);
        assert_eq!(findings[1].code, "P0300");
        assert_eq!(findings[1].priority, Priority::Critical);
    }

    #[test]
    fn parses_bare_array_reply() {
        let content = json!([finding_json("P0171", "preventive")]).to_string();
        let findings = parse_findings(&content, &["P0171".to_string()]).unwrap();
        assert_eq!(findings[0].priority, Priority::Preventive);
    }

    #[test]
    fn missing_code_is_unusable() {
        let content = json!({"diagnostics": [finding_json("P0171", "attention")]}).to_string();
        let err = parse_findings(&content, &request().trouble_codes).unwrap_err();
        assert!(matches!(err, ReasonerError::Contract(_)));
        assert!(err.to_string().contains("P0300"));
    }

    #[test]
    fn surplus_finding_is_unusable() {
        let content = json!({
            "diagnostics": [finding_json("P0171", "attention"), finding_json("C0001", "attention")]
        })
        .to_string();
        let err = parse_findings(&content, &["P0171".to_string()]).unwrap_err();
        assert!(matches!(err, ReasonerError::Contract(_)));
    }

    #[test]
    fn out_of_range_fields_are_unusable() {
        let mut bad_severity = finding_json("P0171", "attention");
        bad_severity["severity"] = json!(11);
        let content = json!({"diagnostics": [bad_severity]}).to_string();
        assert!(parse_findings(&content, &["P0171".to_string()]).is_err());

        let mut bad_difficulty = finding_json("P0171", "attention");
        bad_difficulty["diyDifficulty"] = json!(0);
        let content = json!({"diagnostics": [bad_difficulty]}).to_string();
        assert!(parse_findings(&content, &["P0171".to_string()]).is_err());
    }

    #[test]
    fn unknown_priority_is_unusable() {
        let content =
            json!({"diagnostics": [finding_json("P0171", "urgent")]}).to_string();
        assert!(parse_findings(&content, &["P0171".to_string()]).is_err());
    }

    #[test]
    fn prose_reply_is_unusable() {
        let err = parse_findings("Sorry, I cannot help.", &["P0171".to_string()]).unwrap_err();
        assert!(matches!(err, ReasonerError::Contract(_)));
    }

    #[test]
    fn duplicate_submitted_codes_each_get_a_finding() {
        let content = json!({
            "diagnostics": [finding_json("P0171", "attention"), finding_json("P0171", "attention")]
        })
        .to_string();
        let codes = vec!["P0171".to_string(), "P0171".to_string()];
        let findings = parse_findings(&content, &codes).unwrap();
        assert_eq!(findings.len(), 2);
    }
}
