use crate::{
    config::Config,
    error::{AppError, Result},
    models::auth::{Claims, IssuedToken, Principal},
    services::kv::SharedStore,
};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ACTIVE_TOKEN_PREFIX: &str = "token:";
const BLACKLIST_PREFIX: &str = "blacklist:token:";
/// 令牌有效期上限（一年）
const MAX_VALIDITY_SECS: i64 = 365 * 24 * 60 * 60;

/// 认证失败的具体原因
///
/// 只用于服务端日志，对客户端统一表现为未认证。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("credential missing")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("token is not the active session for its subject")]
    NotActive,
    #[error("token store unavailable")]
    StoreUnavailable,
}

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        AppError::Authentication(failure.to_string())
    }
}

/// 令牌签发、校验与吊销
///
/// 签名令牌本身无状态；可吊销性来自键值存储中的两类记录：
/// `token:{sub}` 记录当前有效令牌，`blacklist:token:{jwt}` 记录已吊销令牌。
/// 两者的 TTL 都等于令牌剩余有效期，到期自动消失。
#[derive(Clone)]
pub struct TokenAuthority {
    store: SharedStore,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validity_secs: i64,
}

impl TokenAuthority {
    pub fn new(config: &Config, store: SharedStore) -> Result<Self> {
        let secret = Self::secret_bytes(&config.jwt_secret)?;
        if config.jwt_expiry <= 0 || config.jwt_expiry > MAX_VALIDITY_SECS {
            return Err(AppError::validation(&format!(
                "JWT_EXPIRY must be between 1 and {} seconds",
                MAX_VALIDITY_SECS
            )));
        }

        Ok(Self {
            store,
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
            validity_secs: config.jwt_expiry,
        })
    }

    // 以 "base64:" 开头的密钥按 Base64 解码，其余按原始字节使用
    fn secret_bytes(secret: &str) -> Result<Vec<u8>> {
        let bytes = match secret.strip_prefix("base64:") {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| AppError::validation(&format!("JWT_SECRET is not valid base64: {}", e)))?,
            None => secret.as_bytes().to_vec(),
        };
        if bytes.is_empty() {
            return Err(AppError::validation("JWT_SECRET must not be empty"));
        }
        Ok(bytes)
    }

    fn active_key(subject: &str) -> String {
        format!("{}{}", ACTIVE_TOKEN_PREFIX, subject)
    }

    fn blacklist_key(token: &str) -> String {
        format!("{}{}", BLACKLIST_PREFIX, token)
    }

    fn strict_validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = 0;
        validation
    }

    /// 签发令牌并登记为该用户的当前有效令牌
    pub async fn issue(&self, subject: &str, authorities: &[String]) -> Result<IssuedToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            auth: authorities.join(","),
            iat: now,
            exp: now.saturating_add(self.validity_secs),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS512), &claims, &self.encoding_key)?;
        let ttl = Duration::from_secs(self.validity_secs as u64);
        self.store
            .set_with_ttl(&Self::active_key(subject), &token, ttl)
            .await?;

        info!("Issued token for subject: {}", subject);
        Ok(IssuedToken {
            token,
            expires_at: timestamp_to_datetime(claims.exp),
        })
    }

    /// 只校验签名与过期时间
    pub fn verify_signature(&self, token: &str) -> std::result::Result<Claims, AuthFailure> {
        match decode::<Claims>(token, &self.decoding_key, &Self::strict_validation()) {
            Ok(data) => Ok(data.claims),
            Err(e) => {
                let failure = match e.kind() {
                    ErrorKind::ExpiredSignature => AuthFailure::Expired,
                    ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthFailure::BadSignature,
                    _ => AuthFailure::Malformed,
                };
                match failure {
                    AuthFailure::Expired => debug!("Expired JWT presented: {}", e),
                    _ => warn!("Invalid JWT presented ({}): {}", failure, e),
                }
                Err(failure)
            }
        }
    }

    /// 完整校验：签名与过期、黑名单、当前有效令牌记录
    ///
    /// 任何失败（包括存储不可用）都视为未认证。
    pub async fn validate(&self, token: &str) -> std::result::Result<Principal, AuthFailure> {
        let claims = self.verify_signature(token)?;

        match self.store.exists(&Self::blacklist_key(token)).await {
            Ok(true) => {
                warn!("Blacklisted token presented for subject: {}", claims.sub);
                return Err(AuthFailure::Revoked);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Token blacklist lookup failed: {}", e);
                return Err(AuthFailure::StoreUnavailable);
            }
        }

        match self.store.get(&Self::active_key(&claims.sub)).await {
            Ok(Some(active)) if active == token => {}
            Ok(_) => {
                debug!("Token is not the active session for subject: {}", claims.sub);
                return Err(AuthFailure::NotActive);
            }
            Err(e) => {
                warn!("Active token lookup failed: {}", e);
                return Err(AuthFailure::StoreUnavailable);
            }
        }

        Ok(Principal {
            authorities: claims.authorities(),
            expires_at: timestamp_to_datetime(claims.exp),
            subject: claims.sub,
        })
    }

    /// 吊销令牌
    ///
    /// 无法解析或已过期的令牌直接忽略。
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let mut validation = Self::strict_validation();
        validation.validate_exp = false;

        let claims = match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!("Ignoring revoke of unparseable token: {}", e);
                return Ok(());
            }
        };

        let remaining = match remaining_validity(claims.exp) {
            Some(remaining) => remaining,
            None => {
                debug!("Ignoring revoke of expired token for subject: {}", claims.sub);
                return Ok(());
            }
        };

        let active_key = Self::active_key(&claims.sub);
        if self.store.get(&active_key).await?.as_deref() == Some(token) {
            self.store.delete(&active_key).await?;
        }

        self.store
            .set_with_ttl(&Self::blacklist_key(token), "true", remaining)
            .await?;

        info!("Revoked token for subject: {}", claims.sub);
        Ok(())
    }

    pub async fn is_blacklisted(&self, token: &str) -> bool {
        match self.store.exists(&Self::blacklist_key(token)).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Token blacklist lookup failed: {}", e);
                false
            }
        }
    }
}

fn timestamp_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

/// 距离过期的剩余时间，已过期返回 None
fn remaining_validity(exp: i64) -> Option<Duration> {
    let millis = exp.saturating_mul(1000).saturating_sub(Utc::now().timestamp_millis());
    if millis <= 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    }
}
