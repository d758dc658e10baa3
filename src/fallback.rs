//! Deterministic degradation path for reasoner outages.
//!
//! Downstream classification and notification logic never special-cases a
//! degraded run: the synthesizer honours the same one-finding-per-code
//! cardinality as a successful reasoner reply.

use crate::{DiagnosticFinding, Priority};

/// Probable cause recorded on every synthesized finding.
pub const UNAVAILABLE_CAUSE: &str = "analysis service unavailable";

/// Produce one generic finding per submitted code, in submission order.
pub fn synthesize(codes: &[String]) -> Vec<DiagnosticFinding> {
    codes
        .iter()
        .map(|code| DiagnosticFinding {
            code: code.clone(),
            description: format!(
                "A análise automática do código {} está temporariamente indisponível. \
                 Recomendamos avaliação com um mecânico de confiança.",
                code
            ),
            priority: Priority::Attention,
            severity: 5,
            can_diy: false,
            diy_difficulty: None,
            probable_causes: vec![UNAVAILABLE_CAUSE.to_string()],
            solution_url: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn one_finding_per_code_in_order() {
        let codes: Vec<String> = vec!["P0171".into(), "C1234".into(), "B0005".into()];
        let findings = synthesize(&codes);
        assert_eq!(findings.len(), codes.len());
        let returned: Vec<&str> = findings.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(returned, vec!["P0171", "C1234", "B0005"]);
        let unique: HashSet<&str> = returned.into_iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn findings_carry_safe_defaults() {
        let findings = synthesize(&["P0300".to_string()]);
        let f = &findings[0];
        assert_eq!(f.priority, Priority::Attention);
        assert_eq!(f.severity, 5);
        assert!(!f.can_diy);
        assert!(f.diy_difficulty.is_none());
        assert_eq!(f.probable_causes, vec![UNAVAILABLE_CAUSE.to_string()]);
        assert!(f.solution_url.is_none());
        assert!(f.description.contains("P0300"));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(synthesize(&[]).is_empty());
    }
}
