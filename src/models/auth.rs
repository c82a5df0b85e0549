use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// JWT 载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // 用户ID
    pub auth: String, // 逗号分隔的权限
    pub iat: i64,     // 签发时间
    pub exp: i64,     // 过期时间
    #[serde(default)]
    pub jti: String,  // 令牌ID
}

impl Claims {
    pub fn authorities(&self) -> Vec<String> {
        let authorities: Vec<String> = self
            .auth
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();

        if authorities.is_empty() {
            vec!["ROLE_USER".to_string()]
        } else {
            authorities
        }
    }
}

/// 已认证的调用方
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub subject: String,
    pub authorities: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// 登录流程调用的签发请求（密码校验由主服务完成）
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IssueTokenRequest {
    #[validate(length(min = 1, max = 200))]
    pub subject: String,
    #[serde(default)]
    pub authorities: Vec<String>,
}
