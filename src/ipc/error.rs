use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

/// Error envelope. `http_status` lands in `details.httpStatus` so callers
/// fronting this process with HTTP can pass it through unchanged.
pub fn err(
    id: &str,
    code: &str,
    http_status: u16,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut details = match details {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("info".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    details.insert("httpStatus".to_string(), json!(http_status));
    json!({
        "id": id,
        "ok": false,
        "error": {
            "code": code,
            "message": message.into(),
            "details": details,
        },
    })
}
