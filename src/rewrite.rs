use rustc_hash::FxHashMap;
use serde_json::Value;

/// Rewrite the top-level `model` field of a JSON request body according to a
/// route's model map. Nested `model` fields are never touched.
///
/// Returns `Ok(None)` when nothing changed, so the caller can forward the
/// original bytes without a copy.
///
/// # Errors
///
/// Returns the decode error when the route has mappings but `body` is not a
/// JSON object. Callers log the error and forward the original body.
pub fn rewrite_model(
    body: &[u8],
    model_map: &FxHashMap<String, String>,
) -> Result<Option<Vec<u8>>, serde_json::Error> {
    if model_map.is_empty() {
        return Ok(None);
    }

    let mut payload: serde_json::Map<String, Value> = serde_json::from_slice(body)?;
    let Some(Value::String(model)) = payload.get("model") else {
        return Ok(None);
    };
    let Some(mapped) = model_map.get(model) else {
        return Ok(None);
    };
    if mapped.is_empty() || mapped == model {
        return Ok(None);
    }

    let mapped = mapped.clone();
    payload.insert("model".to_string(), Value::String(mapped));
    serde_json::to_vec(&payload).map(Some)
}
