//! Signed JSON envelope client for the serverless endpoint
//!
//! Every call is a POST of `{method, params, spaceId, timestamp, token?}` where
//! `params` is itself a JSON string, with the signature of those fields in the
//! `x-serverless-sign` header.

use super::{normalize_device_id, ApiError, CloudApi, DeviceRecord};
use crate::auth::signing::sign;
use crate::auth::Credential;
use crate::config::ApiSection;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const METHOD_ANONYMOUS_AUTHORIZE: &str = "serverless.auth.user.anonymousAuthorize";
const METHOD_INVOKE: &str = "serverless.function.runtime.invoke";

const ROUTE_LOGIN: &str = "user/pub/login";
const ROUTE_MQTT_TOKEN: &str = "common/emqx.getAccessToken";
const ROUTE_DEVICE_LIST: &str = "client/device/kh/getList";

pub const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; SM-A426B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/87.0.4280.86 Mobile Safari/537.36";

const APP_ID: &str = "__UNI__55F5E7F";

/// Synthetic mobile-app identity sent with every routed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFingerprint {
    /// 32 uppercase hex characters
    pub device_id: String,
}

impl ClientFingerprint {
    pub fn random() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
        }
    }

    pub fn client_info(&self) -> Value {
        json!({
            "PLATFORM": "app",
            "OS": "android",
            "APPID": APP_ID,
            "DEVICEID": self.device_id,
            "channel": "google",
            "scene": 1001,
            "appId": APP_ID,
            "appLanguage": "en",
            "appName": "BrightEMS",
            "appVersion": "1.2.3",
            "appVersionCode": 123,
            "appWgtVersion": "1.2.3",
            "browserName": "chrome",
            "browserVersion": "130.0.6723.86",
            "deviceBrand": "Samsung",
            "deviceId": self.device_id,
            "deviceModel": "SM-A426B",
            "deviceType": "phone",
            "osName": "android",
            "osVersion": "10",
            "romName": "Android",
            "romVersion": "10",
            "ua": USER_AGENT,
            "uniPlatform": "app",
            "uniRuntimeVersion": "4.24",
            "locale": "en",
            "LOCALE": "en",
        })
    }
}

/// Request body posted to the endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub method: String,
    pub params: String,
    pub space_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Envelope {
    pub fn signature(&self, secret: &str) -> String {
        let timestamp = self.timestamp.to_string();
        sign(
            [
                ("method", self.method.as_str()),
                ("params", self.params.as_str()),
                ("spaceId", self.space_id.as_str()),
                ("timestamp", timestamp.as_str()),
                ("token", self.token.as_deref().unwrap_or("")),
            ],
            secret,
        )
    }
}

/// Walk a dotted path and return the string found there
fn extract_str(body: &Value, path: &str) -> Result<String, ApiError> {
    path.split('.')
        .try_fold(body, |node, key| node.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::MissingField {
            field: path.to_string(),
        })
}

/// reqwest implementation of [`CloudApi`]
pub struct HttpCloudApi {
    config: ApiSection,
    client: Client,
    fingerprint: ClientFingerprint,
}

impl HttpCloudApi {
    pub fn new(config: ApiSection) -> Result<Self, ApiError> {
        Self::with_fingerprint(config, ClientFingerprint::random())
    }

    pub fn with_fingerprint(
        config: ApiSection,
        fingerprint: ClientFingerprint,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::Request(e.to_string()))?;

        Ok(Self {
            config,
            client,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &ClientFingerprint {
        &self.fingerprint
    }

    fn envelope(&self, method: &str, params: String, token: Option<&str>) -> Envelope {
        Envelope {
            method: method.to_string(),
            params,
            space_id: self.config.space_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            token: token.map(str::to_string),
        }
    }

    /// `params` for a routed cloud-function call
    fn router_params(&self, url: &str, data: Value, access_token: Option<&str>) -> String {
        let mut args = json!({
            "$url": url,
            "data": data,
            "clientInfo": self.fingerprint.client_info(),
        });
        if let Some(token) = access_token {
            args["uniIdToken"] = Value::String(token.to_string());
        }

        json!({
            "functionTarget": "router",
            "functionArgs": args,
        })
        .to_string()
    }

    async fn post(&self, envelope: Envelope) -> Result<Value, ApiError> {
        let signature = envelope.signature(&self.config.client_secret);
        debug!(method = %envelope.method, "POST serverless envelope");

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json")
            .header("x-serverless-sign", signature)
            .json(&envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn anonymous_authorize(&self) -> Result<String, ApiError> {
        let body = self
            .post(self.envelope(METHOD_ANONYMOUS_AUTHORIZE, "{}".to_string(), None))
            .await?;
        extract_str(&body, "data.accessToken")
    }

    async fn login(
        &self,
        authorize_token: &str,
        credential: &Credential,
    ) -> Result<String, ApiError> {
        let params = self.router_params(
            ROUTE_LOGIN,
            json!({
                "locale": "en",
                "username": credential.username(),
                "password": credential.password(),
            }),
            None,
        );
        let body = self
            .post(self.envelope(METHOD_INVOKE, params, Some(authorize_token)))
            .await?;
        extract_str(&body, "data.token")
    }

    async fn mqtt_token(
        &self,
        authorize_token: Option<&str>,
        access_token: &str,
    ) -> Result<String, ApiError> {
        let params = self.router_params(
            ROUTE_MQTT_TOKEN,
            json!({ "locale": "en" }),
            Some(access_token),
        );
        let body = self
            .post(self.envelope(METHOD_INVOKE, params, authorize_token))
            .await?;
        extract_str(&body, "data.access_token")
    }

    async fn device_list(
        &self,
        authorize_token: Option<&str>,
        access_token: &str,
    ) -> Result<Vec<DeviceRecord>, ApiError> {
        let params = self.router_params(
            ROUTE_DEVICE_LIST,
            json!({ "locale": "en", "pageIndex": 1, "pageSize": 100 }),
            Some(access_token),
        );
        let body = self
            .post(self.envelope(METHOD_INVOKE, params, authorize_token))
            .await?;

        let rows = body
            .get("data")
            .and_then(|data| data.get("rows"))
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::MissingField {
                field: "data.rows".to_string(),
            })?;

        let devices = rows
            .iter()
            .filter_map(|row| {
                let Some(raw_id) = row.get("device_id").and_then(Value::as_str) else {
                    warn!("Skipping device row without device_id");
                    return None;
                };
                let name = row
                    .get("device_name")
                    .and_then(Value::as_str)
                    .unwrap_or(raw_id);
                Some(DeviceRecord {
                    device_id: normalize_device_id(raw_id),
                    display_name: name.to_string(),
                })
            })
            .collect();

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer) -> HttpCloudApi {
        let config = ApiSection {
            endpoint: format!("{}/client", server.uri()),
            ..ApiSection::default()
        };
        HttpCloudApi::with_fingerprint(
            config,
            ClientFingerprint {
                device_id: "0123456789ABCDEF0123456789ABCDEF".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_random_fingerprint_shape() {
        let fingerprint = ClientFingerprint::random();
        assert_eq!(fingerprint.device_id.len(), 32);
        assert!(fingerprint
            .device_id
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_eq!(fingerprint.client_info()["appName"], "BrightEMS");
    }

    #[test]
    fn test_envelope_signature_covers_truthy_fields() {
        let envelope = Envelope {
            method: "m".to_string(),
            params: "{}".to_string(),
            space_id: "s".to_string(),
            timestamp: 1_700_000_000_000,
            token: None,
        };
        assert_eq!(
            envelope.signature("secret"),
            crate::auth::signing::hmac_md5_hex(
                "secret",
                "method=m&params={}&spaceId=s&timestamp=1700000000000"
            )
        );
    }

    #[test]
    fn test_extract_str() {
        let body = json!({"data": {"token": "abc", "empty": ""}});
        assert_eq!(extract_str(&body, "data.token").unwrap(), "abc");
        assert!(matches!(
            extract_str(&body, "data.empty"),
            Err(ApiError::MissingField { .. })
        ));
        assert!(extract_str(&body, "data.missing.deeper").is_err());
    }

    #[tokio::test]
    async fn test_anonymous_authorize_signs_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/client"))
            .and(header_exists("x-serverless-sign"))
            .and(body_partial_json(json!({
                "method": METHOD_ANONYMOUS_AUTHORIZE,
                "spaceId": "mp-6c382a98-49b8-40ba-b761-645d83e8ee74",
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"accessToken": "auth-1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let token = api_for(&server).anonymous_authorize().await.unwrap();
        assert_eq!(token, "auth-1");
    }

    #[tokio::test]
    async fn test_device_list_normalizes_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/client"))
            .and(body_partial_json(json!({"token": "auth-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"rows": [
                    {"device_id": "7C:2C:67:AB:5F:0E", "device_name": "F2400"},
                    {"device_name": "broken row"},
                    {"device_id": "AA:BB"}
                ]}
            })))
            .mount(&server)
            .await;

        let devices = api_for(&server)
            .device_list(Some("auth-1"), "access-1")
            .await
            .unwrap();

        assert_eq!(
            devices,
            vec![
                DeviceRecord::new("7C2C67AB5F0E", "F2400"),
                DeviceRecord::new("AABB", "AA:BB"),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_rows_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": {"message": "token expired"}})),
            )
            .mount(&server)
            .await;

        let error = api_for(&server)
            .device_list(None, "stale")
            .await
            .unwrap_err();
        assert!(error.is_auth_failure());
    }

    #[tokio::test]
    async fn test_http_status_maps_to_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let error = api_for(&server).mqtt_token(None, "a").await.unwrap_err();
        assert!(matches!(error, ApiError::Http { status: 403 }));
        assert!(error.is_auth_failure());
    }
}
