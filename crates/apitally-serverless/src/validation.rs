//! Extraction of field-level validation errors from 422 response bodies

use apitally_core::ValidationError;
use serde::Deserialize;
use serde_json::Value;

/// Turns a raw 422 response body into a list of validation errors.
///
/// Implementations return `None` for bodies they do not understand; they
/// must not panic.
pub trait ValidationErrorExtractor: Send + Sync + 'static {
    fn extract(&self, body: &[u8]) -> Option<Vec<ValidationError>>;
}

impl<F> ValidationErrorExtractor for F
where
    F: Fn(&[u8]) -> Option<Vec<ValidationError>> + Send + Sync + 'static,
{
    fn extract(&self, body: &[u8]) -> Option<Vec<ValidationError>> {
        self(body)
    }
}

/// Understands the two common JSON shapes:
///
/// - `{"detail": [{"loc": [...], "msg": "...", "type": "..."}]}`
/// - `{"error": {"fields": [{"field": "a.b", "code": "...", "message": "..."}]}}`
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultValidationExtractor;

impl ValidationErrorExtractor for DefaultValidationExtractor {
    fn extract(&self, body: &[u8]) -> Option<Vec<ValidationError>> {
        extract_validation_errors(body)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detail { detail: Vec<Value> },
    Fields { error: FieldsBody },
}

#[derive(Deserialize)]
struct FieldsBody {
    fields: Vec<FieldError>,
}

#[derive(Deserialize)]
struct FieldError {
    #[serde(default)]
    field: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Parse a response body with [`DefaultValidationExtractor`]'s rules.
pub fn extract_validation_errors(body: &[u8]) -> Option<Vec<ValidationError>> {
    let errors: Vec<ValidationError> = match serde_json::from_slice(body).ok()? {
        ErrorBody::Detail { detail } => detail.iter().filter_map(detail_error).collect(),
        ErrorBody::Fields { error } => error
            .fields
            .into_iter()
            .map(|field| ValidationError {
                loc: field
                    .field
                    .split('.')
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect(),
                msg: field.message,
                error_type: field.code,
            })
            .collect(),
    };

    (!errors.is_empty()).then_some(errors)
}

fn detail_error(detail: &Value) -> Option<ValidationError> {
    let detail = detail.as_object()?;
    let loc = match detail.get("loc") {
        Some(Value::Array(items)) => items.iter().map(stringify).collect(),
        _ => Vec::new(),
    };

    Some(ValidationError {
        loc,
        msg: detail.get("msg").map(stringify).unwrap_or_default(),
        error_type: detail.get("type").map(stringify).unwrap_or_default(),
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
