//! Static validation of inbound diagnostic submissions.
//!
//! A [`DiagnosticRequest`] can only be obtained through
//! [`Validator::validate`]; nothing downstream (reasoner, fallback,
//! notifications) ever sees unvalidated input.  Validation aggregates every
//! field problem into a single [`ValidationError`] instead of failing on the
//! first, so callers receive one complete, actionable message.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::DiagnoseBody;

/// OBD-II trouble code shape: one uppercase letter followed by four digits.
static DTC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][0-9]{4}$").unwrap());

/// Bounds applied to the submission.
pub const MIN_CODES: usize = 1;
pub const MAX_CODES: usize = 20;
pub const MIN_YEAR: i32 = 1900;
const MAX_NAME_LEN: usize = 80;

/// A single field problem, in caller-facing terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Aggregate of every field problem found in one submission.  The rendered
/// message is the body of the 400 response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Dados inválidos: {}", join_fields(.fields))]
pub struct ValidationError {
    pub fields: Vec<FieldError>,
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A fully validated diagnostic submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRequest {
    pub trouble_codes: Vec<String>,
    pub vehicle_brand: String,
    pub vehicle_model: String,
    pub vehicle_year: i32,
    pub diagnostic_id: Option<String>,
    pub user_id: Option<String>,
    pub vehicle_id: Option<String>,
}

/// Pure validator.  The upper year bound is fixed at construction so that
/// `validate` itself is deterministic.
#[derive(Debug, Clone)]
pub struct Validator {
    max_year: i32,
}

impl Validator {
    pub fn new(max_year: i32) -> Self {
        Validator { max_year }
    }

    /// Upper bound of `current year + 2` covers next-model-year vehicles.
    pub fn for_current_year() -> Self {
        use chrono::Datelike;
        Validator::new(chrono::Utc::now().year() + 2)
    }

    pub fn validate(&self, raw: &DiagnoseBody) -> Result<DiagnosticRequest, ValidationError> {
        let mut fields = Vec::new();

        if raw.dtc_codes.is_empty() {
            fields.push(FieldError {
                field: "dtcCodes",
                message: "informe ao menos um código de diagnóstico".into(),
            });
        } else if raw.dtc_codes.len() > MAX_CODES {
            fields.push(FieldError {
                field: "dtcCodes",
                message: format!(
                    "máximo de {} códigos por análise (recebidos {})",
                    MAX_CODES,
                    raw.dtc_codes.len()
                ),
            });
        } else {
            let invalid: Vec<&str> = raw
                .dtc_codes
                .iter()
                .map(String::as_str)
                .filter(|c| !DTC_RE.is_match(c))
                .collect();
            if !invalid.is_empty() {
                fields.push(FieldError {
                    field: "dtcCodes",
                    message: format!(
                        "códigos fora do padrão letra maiúscula + 4 dígitos: {}",
                        invalid.join(", ")
                    ),
                });
            }
        }

        let vehicle_brand = self.required_name(raw.vehicle_brand.as_deref(), "vehicleBrand", &mut fields);
        let vehicle_model = self.required_name(raw.vehicle_model.as_deref(), "vehicleModel", &mut fields);

        let vehicle_year = match raw.vehicle_year {
            None => {
                fields.push(FieldError {
                    field: "vehicleYear",
                    message: "campo obrigatório".into(),
                });
                0
            }
            Some(year) if year < MIN_YEAR as i64 || year > self.max_year as i64 => {
                fields.push(FieldError {
                    field: "vehicleYear",
                    message: format!("deve estar entre {} e {}", MIN_YEAR, self.max_year),
                });
                0
            }
            Some(year) => year as i32,
        };

        if !fields.is_empty() {
            return Err(ValidationError { fields });
        }

        Ok(DiagnosticRequest {
            trouble_codes: raw.dtc_codes.clone(),
            vehicle_brand,
            vehicle_model,
            vehicle_year,
            diagnostic_id: normalize_id(raw.diagnostic_id.as_deref()),
            user_id: normalize_id(raw.user_id.as_deref()),
            vehicle_id: normalize_id(raw.vehicle_id.as_deref()),
        })
    }

    fn required_name(
        &self,
        value: Option<&str>,
        field: &'static str,
        fields: &mut Vec<FieldError>,
    ) -> String {
        match value.map(str::trim) {
            None => {
                fields.push(FieldError {
                    field,
                    message: "campo obrigatório".into(),
                });
                String::new()
            }
            Some("") => {
                fields.push(FieldError {
                    field,
                    message: "não pode ser vazio".into(),
                });
                String::new()
            }
            Some(s) if s.chars().count() > MAX_NAME_LEN => {
                fields.push(FieldError {
                    field,
                    message: format!("máximo de {} caracteres", MAX_NAME_LEN),
                });
                String::new()
            }
            Some(s) => s.to_string(),
        }
    }
}

fn normalize_id(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
