//! Bridge API response handling.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::Error;
use crate::transport::HttpResponse;

type Result<T> = std::result::Result<T, Error>;

/// Bridge error type for a rejected credential.
pub const ERROR_UNAUTHORIZED: u32 = 1;
/// Bridge error type returned while the link button has not been pressed.
pub const ERROR_LINK_BUTTON: u32 = 101;

/// The `error` object of a failed API call.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
}

impl From<ApiErrorBody> for Error {
    fn from(body: ApiErrorBody) -> Self {
        match body.kind {
            ERROR_UNAUTHORIZED => Error::NotRegistered(body.description),
            ERROR_LINK_BUTTON => Error::LinkButtonNotPressed,
            kind => Error::api(kind, &body.address, &body.description),
        }
    }
}

/// Check the status of a bridge response and parse its JSON body.
///
/// The API reports errors with a 200 status and a body like
/// `[{"error": {"type": 1, ...}}]`; the first such entry becomes the error.
pub(crate) fn check_json(response: &HttpResponse) -> Result<Value> {
    if !response.is_success() {
        return Err(Error::HttpStatus(response.status));
    }

    let value: Value = serde_json::from_str(&response.body).map_err(Error::json_load)?;
    if let Some(err) = first_error(&value) {
        return Err(err.into());
    }
    Ok(value)
}

fn first_error(value: &Value) -> Option<ApiErrorBody> {
    value
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("error"))
        .find_map(|err| ApiErrorBody::deserialize(err).ok())
}

/// Find `key` inside the first `success` entry of an API result.
pub(crate) fn success_value<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("success"))
        .find_map(|success| success.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unauthorized() {
        let resp = HttpResponse::new(
            200,
            r#"[{"error":{"type":1,"address":"/","description":"unauthorized user"}}]"#,
        );
        assert_eq!(
            check_json(&resp).unwrap_err(),
            Error::NotRegistered("unauthorized user".into())
        );
    }

    #[test]
    fn test_link_button() {
        let resp = HttpResponse::new(
            200,
            r#"[{"error":{"type":101,"address":"","description":"link button not pressed"}}]"#,
        );
        assert_eq!(check_json(&resp).unwrap_err(), Error::LinkButtonNotPressed);
    }

    #[test]
    fn test_other_api_error() {
        let resp = HttpResponse::new(
            200,
            r#"[{"success":{"/lights/2/state/on":true}},{"error":{"type":6,"address":"/lights/2/state/zfhue","description":"parameter, zfhue, not available"}}]"#,
        );
        assert_eq!(
            check_json(&resp).unwrap_err(),
            Error::api(6, "/lights/2/state/zfhue", "parameter, zfhue, not available")
        );
    }

    #[test]
    fn test_bad_status_and_body() {
        assert_eq!(check_json(&HttpResponse::new(503, "")).unwrap_err(), Error::HttpStatus(503));
        assert!(matches!(
            check_json(&HttpResponse::new(200, "<html>")),
            Err(Error::JsonLoad(_))
        ));
    }

    #[test]
    fn test_success_value() {
        let value = json!([{"success": {"username": "abc123"}}]);
        assert_eq!(success_value(&value, "username"), Some(&json!("abc123")));
        assert_eq!(success_value(&json!({"lights": {}}), "username"), None);
    }
}
