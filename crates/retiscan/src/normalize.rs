//! Response normalization.
//!
//! Backends disagree on payload shape. Every accepted field name lives in the
//! alias tables below, tried in order; adding a backend variant means adding
//! an alias here and nowhere else.
//!
//! Percent rule, applied once at this boundary to confidence and every
//! probability: a number in `[0, 1]` is a fraction and is scaled by 100, any
//! other number is already a percentage, anything non-numeric is 0. Exact 0
//! and 1 are read as fractions, so a backend reporting a literal "1%" shows up
//! as 100%.

use std::collections::BTreeMap;

use base64::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

pub const INVALID_RESPONSE_MESSAGE: &str = "Invalid server response.";
pub const GENERIC_FAILURE_MESSAGE: &str = "Analysis failed. Please try again.";
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Nested prediction object.
const PREDICTION_OBJECT: &[&str] = &["prediction", "result"];
/// Label inside the nested prediction object.
const NESTED_LABEL: &[&str] = &["class", "label", "class_name"];
/// Label at top level (a string `prediction` or an alternate name).
const FLAT_LABEL: &[&str] = &["prediction", "predicted_class", "class", "label", "class_name"];
/// Confidence inside the nested prediction object.
const NESTED_CONFIDENCE: &[&str] = &["confidence", "score"];
/// Confidence at top level.
const FLAT_CONFIDENCE: &[&str] = &["confidence", "score"];
const DESCRIPTION: &[&str] = &["description", "class_description"];
/// Probability maps; the first non-empty object wins.
const PROBABILITIES: &[&str] = &[
    "probabilities",
    "all_probabilities",
    "class_probabilities",
    "probs",
];
const GRADCAM: &[&str] = &["gradcam_image", "gradcam"];
const SECURITY: &[&str] = &["security"];
const STORAGE: &[&str] = &["storage"];
const SESSION_ID: &[&str] = &["session_id"];
const ELAPSED_MS: &[&str] = &["elapsed_ms", "processing_time_ms"];
const FAILURE_MESSAGE: &[&str] = &["error", "message"];

/// Canonical prediction result.
///
/// `confidence_percent` and every value of `probabilities` are in percent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub class_label: String,
    pub confidence_percent: f64,
    pub description: String,
    pub probabilities: BTreeMap<String, f64>,
    pub gradcam_image: Option<String>,
    pub security_flags: Option<Value>,
    pub storage_flags: Option<Value>,
    /// Passed through as sent; usually a number of milliseconds.
    pub elapsed_ms: Option<Value>,
    /// Set iff `success` is false.
    pub error_message: Option<String>,
    pub dev_mode: bool,
    pub model_load_error: Option<String>,
}

impl PredictionResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            class_label: String::new(),
            confidence_percent: 0.0,
            description: String::new(),
            probabilities: BTreeMap::new(),
            gradcam_image: None,
            security_flags: None,
            storage_flags: None,
            elapsed_ms: None,
            error_message: Some(message.into()),
            dev_mode: false,
            model_load_error: None,
        }
    }

    /// Probabilities sorted by descending percent, ties by label.
    pub fn ranked_probabilities(&self) -> Vec<(&str, f64)> {
        let mut ranked: Vec<(&str, f64)> = self
            .probabilities
            .iter()
            .map(|(label, pct)| (label.as_str(), *pct))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
    }

    /// Decode the Grad-CAM overlay (bare base64 or a `data:` URL).
    pub fn gradcam_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        let image = self.gradcam_image.as_deref()?;
        let encoded = match image.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => image,
        };
        Some(base64::engine::general_purpose::STANDARD.decode(encoded.trim()))
    }
}

/// Percent rule: `[0, 1]` scales by 100, other numbers pass, non-numbers are 0.
pub fn to_percent(value: Option<&Value>) -> f64 {
    match value.and_then(Value::as_f64) {
        Some(v) if (0.0..=1.0).contains(&v) => v * 100.0,
        Some(v) => v,
        None => 0.0,
    }
}

/// Normalize a raw backend payload. Never fails: malformed payloads become
/// failure results.
pub fn normalize(raw: Option<&Value>) -> PredictionResult {
    let Some(payload) = raw.and_then(Value::as_object) else {
        tracing::warn!("Prediction response is not a JSON object");
        return PredictionResult::failure(INVALID_RESPONSE_MESSAGE);
    };

    if payload.get("success").and_then(Value::as_bool) == Some(false) {
        return normalize_failure(payload);
    }

    let nested = PREDICTION_OBJECT
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_object));

    let class_label = nested
        .and_then(|p| first_str(p, NESTED_LABEL))
        .or_else(|| first_str(payload, FLAT_LABEL))
        .unwrap_or(UNKNOWN_LABEL)
        .to_string();

    let confidence_percent = to_percent(
        nested
            .and_then(|p| first(p, NESTED_CONFIDENCE))
            .or_else(|| first(payload, FLAT_CONFIDENCE)),
    );

    let description = nested
        .and_then(|p| first_str(p, DESCRIPTION))
        .or_else(|| first_str(payload, DESCRIPTION))
        .unwrap_or_default()
        .to_string();

    let probabilities: BTreeMap<String, f64> = nested
        .and_then(probability_map)
        .or_else(|| probability_map(payload))
        .map(|map| {
            map.iter()
                .map(|(label, v)| (label.clone(), to_percent(Some(v))))
                .collect()
        })
        .unwrap_or_default();

    PredictionResult {
        success: true,
        session_id: first_str(payload, SESSION_ID).map(str::to_string),
        class_label,
        confidence_percent,
        description,
        probabilities,
        gradcam_image: first_str(payload, GRADCAM).map(str::to_string),
        security_flags: first(payload, SECURITY).cloned(),
        storage_flags: first(payload, STORAGE).cloned(),
        elapsed_ms: first(payload, ELAPSED_MS).cloned(),
        error_message: None,
        dev_mode: payload
            .get("dev_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        model_load_error: None,
    }
}

fn normalize_failure(payload: &Map<String, Value>) -> PredictionResult {
    let message = FAILURE_MESSAGE
        .iter()
        .find_map(|key| {
            payload
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or(GENERIC_FAILURE_MESSAGE);

    let mut result = PredictionResult::failure(message);
    result.dev_mode = payload
        .get("dev_mode")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    result.model_load_error = payload
        .get("model_load_error")
        .and_then(Value::as_str)
        .map(str::to_string);
    result.session_id = first_str(payload, SESSION_ID).map(str::to_string);
    result
}

/// First alias present with a non-null value.
fn first<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
}

fn first_str<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
}

fn probability_map(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    PROBABILITIES.iter().find_map(|key| {
        obj.get(*key)
            .and_then(Value::as_object)
            .filter(|m| !m.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn percent_rule_scales_fractions() {
        for v in [0.0, 0.001, 0.25, 0.5, 0.875, 0.999, 1.0] {
            assert!(approx(to_percent(Some(&json!(v))), v * 100.0), "{v}");
        }
    }

    #[test]
    fn percent_rule_passes_other_numbers() {
        for v in [1.0001, 1.5, 42.0, 87.5, 100.0, 250.0, -0.5, -3.0] {
            assert_eq!(to_percent(Some(&json!(v))), v, "{v}");
        }
        assert_eq!(to_percent(Some(&json!(73))), 73.0);
    }

    #[test]
    fn percent_rule_non_numeric_is_zero() {
        assert_eq!(to_percent(None), 0.0);
        assert_eq!(to_percent(Some(&json!(null))), 0.0);
        assert_eq!(to_percent(Some(&json!("0.9"))), 0.0);
        assert_eq!(to_percent(Some(&json!(true))), 0.0);
        assert_eq!(to_percent(Some(&json!({"v": 1}))), 0.0);
    }

    // Known ambiguity: a literal 1 (meaning 1%) and 0 cannot be told apart
    // from fractions; both are read as fractions.
    #[test]
    fn percent_rule_boundaries_are_fractions() {
        assert_eq!(to_percent(Some(&json!(1))), 100.0);
        assert_eq!(to_percent(Some(&json!(0))), 0.0);
    }

    #[test]
    fn missing_or_non_object_payload_is_invalid() {
        for raw in [None, Some(json!(null)), Some(json!([1, 2])), Some(json!("ok"))] {
            let result = normalize(raw.as_ref());
            assert!(!result.success);
            assert_eq!(result.error_message.as_deref(), Some(INVALID_RESPONSE_MESSAGE));
        }
    }

    #[test]
    fn failure_payload_carries_message_and_passthrough() {
        let result = normalize(Some(&json!({
            "success": false,
            "error": "Model failed to load",
            "dev_mode": true,
            "model_load_error": "weights not found"
        })));
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("Model failed to load"));
        assert!(result.dev_mode);
        assert_eq!(result.model_load_error.as_deref(), Some("weights not found"));
    }

    #[test]
    fn failure_payload_always_has_message() {
        let payloads = [
            json!({"success": false}),
            json!({"success": false, "message": "quota"}),
            json!({"success": false, "error": ""}),
            json!({"success": false, "error": 17}),
        ];
        for payload in payloads {
            let result = normalize(Some(&payload));
            assert!(!result.success);
            let message = result.error_message.expect("failure has message");
            assert!(!message.is_empty(), "{payload}");
        }
        let result = normalize(Some(&json!({"success": false})));
        assert_eq!(result.error_message.as_deref(), Some(GENERIC_FAILURE_MESSAGE));
    }

    #[test]
    fn blank_error_falls_through_to_message() {
        let result = normalize(Some(&json!({
            "success": false,
            "error": "  ",
            "message": "Daily quota exceeded"
        })));
        assert_eq!(result.error_message.as_deref(), Some("Daily quota exceeded"));
    }

    #[test]
    fn elapsed_time_passes_through_unchanged() {
        let result = normalize(Some(&json!({
            "prediction": "Normal",
            "processing_time_ms": "1.2s"
        })));
        assert_eq!(result.elapsed_ms, Some(json!("1.2s")));
    }

    #[test]
    fn nested_prediction_shape() {
        let result = normalize(Some(&json!({
            "success": true,
            "prediction": {
                "class": "Diabetic Retinopathy",
                "confidence": 0.875,
                "description": "Damage to retinal blood vessels."
            },
            "probabilities": {"Normal": 0.1, "Diabetic Retinopathy": 0.875, "Glaucoma": 0.025},
            "gradcam_image": "aGVsbG8=",
            "security": {"exif_stripped": true},
            "storage": {"persisted": false},
            "session_id": "s-123",
            "elapsed_ms": 1234.5
        })));

        assert!(result.success);
        assert_eq!(result.class_label, "Diabetic Retinopathy");
        assert!(approx(result.confidence_percent, 87.5));
        assert_eq!(result.description, "Damage to retinal blood vessels.");
        assert!(approx(result.probabilities["Normal"], 10.0));
        assert!(approx(result.probabilities["Glaucoma"], 2.5));
        assert_eq!(result.probabilities.len(), 3);
        assert_eq!(result.gradcam_image.as_deref(), Some("aGVsbG8="));
        assert_eq!(result.security_flags, Some(json!({"exif_stripped": true})));
        assert_eq!(result.storage_flags, Some(json!({"persisted": false})));
        assert_eq!(result.session_id.as_deref(), Some("s-123"));
        assert_eq!(result.elapsed_ms, Some(json!(1234.5)));
        assert!(result.error_message.is_none());
    }

    #[test]
    fn nested_label_alias() {
        let result = normalize(Some(&json!({"prediction": {"label": "Cataract", "score": 64}})));
        assert_eq!(result.class_label, "Cataract");
        assert_eq!(result.confidence_percent, 64.0);
    }

    #[test]
    fn flat_prediction_shape() {
        let result = normalize(Some(&json!({
            "prediction": "Glaucoma",
            "confidence": 92.3,
            "all_probabilities": {"Glaucoma": 92.3, "Normal": 7.7}
        })));
        assert!(result.success);
        assert_eq!(result.class_label, "Glaucoma");
        assert_eq!(result.confidence_percent, 92.3);
        assert_eq!(result.probabilities["Normal"], 7.7);
    }

    #[test]
    fn flat_alternate_label_and_score() {
        let result = normalize(Some(&json!({"predicted_class": "Normal", "score": 0.5})));
        assert_eq!(result.class_label, "Normal");
        assert_eq!(result.confidence_percent, 50.0);
    }

    #[test]
    fn nested_object_without_confidence_falls_back_to_top_level() {
        let result = normalize(Some(&json!({
            "prediction": {"class": "Normal"},
            "confidence": 0.2
        })));
        assert_eq!(result.confidence_percent, 20.0);
    }

    #[test]
    fn missing_fields_default() {
        let result = normalize(Some(&json!({"success": true})));
        assert!(result.success);
        assert_eq!(result.class_label, UNKNOWN_LABEL);
        assert_eq!(result.confidence_percent, 0.0);
        assert_eq!(result.description, "");
        assert!(result.probabilities.is_empty());
        assert!(result.gradcam_image.is_none());
        assert!(result.security_flags.is_none());
        assert!(result.storage_flags.is_none());
        assert!(result.session_id.is_none());
        assert!(result.elapsed_ms.is_none());
    }

    #[test]
    fn first_populated_probability_alias_wins() {
        let result = normalize(Some(&json!({
            "prediction": "Normal",
            "probabilities": {},
            "class_probabilities": {"Normal": 1, "AMD": "n/a"},
            "probs": {"ignored": 0.3}
        })));
        assert_eq!(result.probabilities.len(), 2);
        assert_eq!(result.probabilities["Normal"], 100.0);
        assert_eq!(result.probabilities["AMD"], 0.0);
        assert!(!result.probabilities.contains_key("ignored"));
    }

    #[test]
    fn normalized_values_are_percentages() {
        let result = normalize(Some(&json!({
            "prediction": {"class": "Normal", "confidence": 0.66},
            "probabilities": {"Normal": 0.66, "Other": 0.34}
        })));
        assert!((0.0..=100.0).contains(&result.confidence_percent));
        for pct in result.probabilities.values() {
            assert!((0.0..=100.0).contains(pct));
        }
    }

    #[test]
    fn ranked_probabilities_descending() {
        let result = normalize(Some(&json!({
            "prediction": "B",
            "probabilities": {"A": 0.2, "B": 0.5, "C": 0.2, "D": 0.1}
        })));
        let ranked: Vec<&str> = result
            .ranked_probabilities()
            .into_iter()
            .map(|(label, _)| label)
            .collect();
        assert_eq!(ranked, vec!["B", "A", "C", "D"]);
    }

    #[test]
    fn gradcam_bytes_decodes_data_url_and_bare_base64() {
        let mut result = PredictionResult::failure("x");
        assert!(result.gradcam_bytes().is_none());

        result.gradcam_image = Some("data:image/png;base64,aGVsbG8=".into());
        assert_eq!(result.gradcam_bytes().unwrap().unwrap(), b"hello");

        result.gradcam_image = Some("aGVsbG8=".into());
        assert_eq!(result.gradcam_bytes().unwrap().unwrap(), b"hello");

        result.gradcam_image = Some("not base64!".into());
        assert!(result.gradcam_bytes().unwrap().is_err());
    }

    #[test]
    fn failure_result_serializes_camel_case() {
        let result = normalize(Some(&json!({"success": false, "message": "busy"})));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorMessage"], "busy");
        assert_eq!(json["classLabel"], "");
        assert!(json["sessionId"].is_null());
        assert!(json["modelLoadError"].is_null());
        assert_eq!(json["devMode"], false);
    }
}
