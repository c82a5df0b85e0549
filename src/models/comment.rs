use serde::{Deserialize, Serialize};
use validator::Validate;

/// 已持久化的评论（由博客主服务提供）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub comment_id: i64,
    pub post_id: i64,
    pub user_id: String,
    pub parent_id: Option<i64>,
    pub content: String,
}

/// 评论所属的文章
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub post_id: i64,
    pub user_id: String,
    pub title: Option<String>,
}

/// 用户资料，只用于填充通知的发送者字段
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// 主服务在评论保存后回调的请求体
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CommentCreatedRequest {
    pub comment_id: i64,
    pub post_id: i64,
    #[validate(length(min = 1, max = 200))]
    pub user_id: String,
    pub parent_id: Option<i64>,
    pub parent_author_id: Option<String>,
    // 目录中查不到时使用的提示信息
    pub post_author_id: Option<String>,
    #[validate(length(max = 100))]
    pub user_name: Option<String>,
    pub user_avatar_url: Option<String>,
    #[validate(length(min = 1, max = 10000))]
    pub content: String,
}

impl CommentCreatedRequest {
    pub fn comment(&self) -> Comment {
        Comment {
            comment_id: self.comment_id,
            post_id: self.post_id,
            user_id: self.user_id.clone(),
            parent_id: self.parent_id,
            content: self.content.clone(),
        }
    }
}

/// 主服务在文章被点赞后回调的请求体
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PostLikedRequest {
    pub post_id: i64,
    pub post_title: Option<String>,
    pub post_author_id: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub user_id: String,
    #[validate(length(max = 100))]
    pub user_name: Option<String>,
    pub user_avatar_url: Option<String>,
}
