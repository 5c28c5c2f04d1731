//! Per-endpoint access checks. Missing credentials answer 401, credentials
//! that do not check out answer 403.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::dto::dispatch_dto::InboundRequest;
use crate::error::{Error, Result};
use crate::middleware::auth::decode_claims;
use crate::models::endpoint::{Endpoint, PermissionType};
use crate::services::extensions::{Extensions, TokenValidator};
use crate::utils::crypto::{self, constant_time_eq, DigestFormat, SignatureAlgorithm};
use crate::utils::ip;

fn default_signature_header() -> String {
    "x-webhook-signature".to_string()
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_api_key_param() -> String {
    "api_key".to_string()
}

fn default_token_header() -> String {
    "authorization".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SignatureRule {
    #[serde(default = "default_signature_header")]
    header: String,
    secret: Option<String>,
    #[serde(default)]
    algorithm: SignatureAlgorithm,
    #[serde(default)]
    format: DigestFormat,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiKeyRule {
    #[serde(default = "default_api_key_header")]
    header: String,
    #[serde(default = "default_api_key_param")]
    query_param: String,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenRule {
    #[serde(default = "default_token_header")]
    header: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IpRule {
    #[serde(default, alias = "allowed_ips")]
    whitelist: Vec<String>,
}

fn rule<T: for<'de> Deserialize<'de>>(raw: &JsonValue) -> Result<T> {
    let raw = if raw.is_null() {
        JsonValue::Object(Default::default())
    } else {
        raw.clone()
    };
    serde_json::from_value(raw)
        .map_err(|e| Error::Config(format!("invalid permission configuration: {}", e)))
}

/// Validates HS256 bearer tokens signed with the application secret. An
/// endpoint may demand a role through `permission_config.required_role`.
pub struct JwtTokenValidator {
    secret: String,
}

impl JwtTokenValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl TokenValidator for JwtTokenValidator {
    fn validate(&self, token: &str, endpoint: &Endpoint) -> bool {
        let Some(claims) = decode_claims(token, &self.secret) else {
            return false;
        };
        match endpoint
            .permission_config
            .get("required_role")
            .and_then(JsonValue::as_str)
        {
            Some(role) => claims.has_role(role),
            None => true,
        }
    }
}

#[derive(Clone)]
pub struct PermissionService {
    extensions: Arc<Extensions>,
    default_validator: Arc<JwtTokenValidator>,
}

impl PermissionService {
    pub fn new(extensions: Arc<Extensions>, jwt_secret: &str) -> Self {
        Self {
            extensions,
            default_validator: Arc::new(JwtTokenValidator::new(jwt_secret)),
        }
    }

    pub async fn check(&self, request: &InboundRequest, endpoint: &Endpoint) -> Result<()> {
        let config = &endpoint.permission_config;
        match endpoint.permission_type {
            PermissionType::Public => Ok(()),
            PermissionType::Signature => check_signature(request, &rule(config)?),
            PermissionType::ApiKey => check_api_key(request, &rule(config)?),
            PermissionType::Token => {
                let rule: TokenRule = rule(config)?;
                let Some(raw) = request.header(&rule.header).filter(|v| !v.trim().is_empty()) else {
                    return Err(Error::Unauthorized("missing token".into()));
                };
                let token = raw.trim();
                let token = token.strip_prefix("Bearer ").unwrap_or(token);
                let valid = match self.extensions.token_validator() {
                    Some(validator) => validator.validate(token, endpoint),
                    None => self.default_validator.validate(token, endpoint),
                };
                if valid {
                    Ok(())
                } else {
                    Err(Error::Forbidden("invalid token".into()))
                }
            }
            PermissionType::IpWhitelist => {
                let rule: IpRule = rule(config)?;
                let client = request.client_ip();
                if ip::ip_allowed(client.as_deref(), &rule.whitelist) {
                    Ok(())
                } else {
                    tracing::warn!(endpoint_id = endpoint.id, ip = ?client, "ip not whitelisted");
                    Err(Error::Forbidden("address not allowed".into()))
                }
            }
            PermissionType::Custom => {
                if self.extensions.check_custom_permission(request, endpoint).await {
                    Ok(())
                } else {
                    Err(Error::Forbidden("access denied".into()))
                }
            }
        }
    }
}

fn check_signature(request: &InboundRequest, rule: &SignatureRule) -> Result<()> {
    let Some(secret) = rule.secret.as_deref().filter(|s| !s.is_empty()) else {
        return Err(Error::Forbidden("signature secret is not configured".into()));
    };
    let Some(provided) = request.header(&rule.header) else {
        return Err(Error::Unauthorized("missing signature".into()));
    };
    if crypto::verify_signature(rule.algorithm, rule.format, secret, &request.body, provided) {
        Ok(())
    } else {
        Err(Error::Forbidden("invalid signature".into()))
    }
}

fn check_api_key(request: &InboundRequest, rule: &ApiKeyRule) -> Result<()> {
    let provided = request
        .header(&rule.header)
        .map(str::to_string)
        .or_else(|| {
            request
                .query
                .get(&rule.query_param)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
        .filter(|k| !k.is_empty());
    let Some(provided) = provided else {
        return Err(Error::Unauthorized("missing api key".into()));
    };
    // Every key is compared so timing does not reveal which one matched.
    let matched = rule.keys.iter().fold(false, |found, key| {
        constant_time_eq(key.as_bytes(), provided.as_bytes()) | found
    });
    if matched {
        Ok(())
    } else {
        Err(Error::Forbidden("invalid api key".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::endpoint::{HandlerType, HttpMethod};
    use async_trait::async_trait;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use crate::middleware::auth::Claims;
    use crate::services::extensions::CustomPermission;

    fn endpoint(permission_type: PermissionType, permission_config: JsonValue) -> Endpoint {
        Endpoint {
            id: 1,
            name: "orders".into(),
            slug: "orders".into(),
            route: String::new(),
            method: HttpMethod::Post,
            handler_type: HandlerType::Webhook,
            handler_config: json!({}),
            permission_type,
            permission_config,
            is_active: true,
            description: None,
            rate_limit_requests: 0,
            rate_limit_window: 60,
            cache_ttl: 0,
            timeout: 30,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn request(headers: &[(&str, &str)], body: &str) -> InboundRequest {
        InboundRequest {
            method: "POST".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: bytes::Bytes::from(body.to_string()),
            ..Default::default()
        }
    }

    fn service() -> PermissionService {
        PermissionService::new(Arc::new(Extensions::new()), "secret")
    }

    fn status(result: Result<()>) -> u16 {
        match result {
            Ok(()) => 200,
            Err(e) => e.status_code().as_u16(),
        }
    }

    #[tokio::test]
    async fn signature_permission() {
        let ep = endpoint(PermissionType::Signature, json!({"secret": "s"}));
        let signature = crypto::hmac_sha256_hex(b"b", "s");
        let svc = service();

        let ok = request(&[("x-webhook-signature", &format!("sha256={}", signature))], "b");
        assert_eq!(status(svc.check(&ok, &ep).await), 200);

        let mut mutated = signature.clone().into_bytes();
        mutated[0] = if mutated[0] == b'0' { b'1' } else { b'0' };
        let bad = request(&[("x-webhook-signature", &String::from_utf8(mutated).unwrap())], "b");
        assert_eq!(status(svc.check(&bad, &ep).await), 403);

        assert_eq!(status(svc.check(&request(&[], "b"), &ep).await), 401);
    }

    #[tokio::test]
    async fn api_key_from_header_or_query() {
        let ep = endpoint(PermissionType::ApiKey, json!({"keys": ["k1", "k2"]}));
        let svc = service();
        assert_eq!(status(svc.check(&request(&[("x-api-key", "k2")], ""), &ep).await), 200);

        let mut via_query = request(&[], "");
        via_query.query.insert("api_key".into(), json!("k1"));
        assert_eq!(status(svc.check(&via_query, &ep).await), 200);

        assert_eq!(status(svc.check(&request(&[("x-api-key", "nope")], ""), &ep).await), 403);
        assert_eq!(status(svc.check(&request(&[], ""), &ep).await), 401);
    }

    #[tokio::test]
    async fn token_permission_uses_jwt_by_default() {
        let exp = (Utc::now().timestamp() + 600) as usize;
        let token = encode(
            &Header::default(),
            &Claims { sub: "u".into(), exp, role: Some("partner".into()) },
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let svc = service();
        let bearer = format!("Bearer {}", token);

        let ep = endpoint(PermissionType::Token, json!({"required_role": "partner"}));
        assert_eq!(status(svc.check(&request(&[("authorization", &bearer)], ""), &ep).await), 200);

        let admin_only = endpoint(PermissionType::Token, json!({"required_role": "admin"}));
        assert_eq!(
            status(svc.check(&request(&[("authorization", &bearer)], ""), &admin_only).await),
            403
        );
        assert_eq!(status(svc.check(&request(&[], ""), &ep).await), 401);
    }

    #[tokio::test]
    async fn ip_whitelist_supports_cidr() {
        let ep = endpoint(PermissionType::IpWhitelist, json!({"whitelist": ["192.168.1.0/24"]}));
        let svc = service();
        let inside = request(&[("x-real-ip", "192.168.1.5")], "");
        let outside = request(&[("x-real-ip", "192.168.2.5")], "");
        assert_eq!(status(svc.check(&inside, &ep).await), 200);
        assert_eq!(status(svc.check(&outside, &ep).await), 403);

        let open = endpoint(PermissionType::IpWhitelist, json!({}));
        assert_eq!(status(svc.check(&outside, &open).await), 200);
    }

    struct AllowHeader;

    #[async_trait]
    impl CustomPermission for AllowHeader {
        async fn check(&self, request: &InboundRequest, _endpoint: &Endpoint) -> Option<bool> {
            request.header("x-partner").map(|v| v == "yes")
        }
    }

    #[tokio::test]
    async fn custom_permission_defaults_to_deny() {
        let ep = endpoint(PermissionType::Custom, json!({}));
        let extensions = Arc::new(Extensions::new());
        let svc = PermissionService::new(extensions.clone(), "secret");
        assert_eq!(status(svc.check(&request(&[], ""), &ep).await), 403);

        extensions.add_permission_hook(Arc::new(AllowHeader));
        assert_eq!(status(svc.check(&request(&[("x-partner", "yes")], ""), &ep).await), 200);
        assert_eq!(status(svc.check(&request(&[], ""), &ep).await), 403);
    }
}
