use super::classify::InfraError;
use crate::attendee::Credentials;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct OutputValue {
    value: serde_json::Value,
}

fn as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `terraform output -json` into attendee credentials.
///
/// `project_id` is required; every other output is optional.
pub fn parse_credentials(json: &str) -> Result<Credentials, InfraError> {
    let trimmed = json.trim();
    let outputs: BTreeMap<String, OutputValue> = if trimmed.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_str(trimmed)
            .map_err(|e| InfraError::permanent(format!("unreadable outputs: {}", e)))?
    };

    let get = |name: &str| outputs.get(name).and_then(|o| as_string(&o.value));

    let project_id = get("project_id")
        .ok_or_else(|| InfraError::permanent("template produced no project_id output"))?;

    Ok(Credentials {
        project_id,
        project_urn: get("project_urn"),
        user_urn: get("user_urn"),
        username: get("username"),
        password: get("password"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_known_outputs() {
        let json = r#"{
            "project_id": {"sensitive": false, "type": "string", "value": "abc123"},
            "project_urn": {"sensitive": false, "type": "string", "value": "urn:v1:eu:resource:publicCloudProject:abc123"},
            "user_urn": {"sensitive": false, "type": "string", "value": "urn:v1:eu:identity:user:max"},
            "username": {"sensitive": false, "type": "string", "value": "max-mustermann"},
            "password": {"sensitive": true, "type": "string", "value": "s3cret"}
        }"#;

        let creds = parse_credentials(json).unwrap();
        assert_eq!(creds.project_id, "abc123");
        assert_eq!(creds.username.as_deref(), Some("max-mustermann"));
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn missing_project_id_is_permanent() {
        let err = parse_credentials("{}").unwrap_err();
        assert!(!err.is_transient());
        assert!(parse_credentials("").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_credentials("not json").is_err());
    }
}
