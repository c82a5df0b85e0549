use crate::{
    config::Config,
    error::Result,
    models::{
        comment::{Comment, CommentCreatedRequest, Post, PostLikedRequest, UserProfile},
        notification::{NotificationDraft, NotificationEvent, NotificationIdGenerator, NotificationType},
    },
    services::{directory::SharedDirectory, publisher::EventPublisher},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_SENDER_ID: &str = "system";
const SYSTEM_SENDER_NAME: &str = "System";

/// 业务事件到通知的转换入口
///
/// 所有 trigger 方法在抑制或发布降级时返回 `None`，从不返回错误。
#[derive(Clone)]
pub struct NotificationService {
    publisher: EventPublisher,
    directory: SharedDirectory,
    ids: Arc<NotificationIdGenerator>,
    preview_chars: usize,
}

impl NotificationService {
    pub fn new(
        publisher: EventPublisher,
        directory: SharedDirectory,
        ids: Arc<NotificationIdGenerator>,
        config: &Config,
    ) -> Self {
        Self {
            publisher,
            directory,
            ids,
            preview_chars: config.comment_preview_chars,
        }
    }

    /// 文章收到评论时通知作者
    pub async fn trigger_comment_notification(
        &self,
        comment: &Comment,
        post: &Post,
        commenter: &UserProfile,
    ) -> Option<NotificationEvent> {
        if comment.user_id == post.user_id {
            debug!("Skipping self-comment notification on post {}", post.post_id);
            return None;
        }

        let content = format!(
            "{} commented on your post: {}",
            commenter.display_name,
            self.preview(&comment.content)
        );
        self.publish(NotificationDraft {
            recipient_id: post.user_id.clone(),
            sender_id: commenter.user_id.clone(),
            sender_name: commenter.display_name.clone(),
            sender_avatar_url: commenter.avatar_url.clone(),
            kind: NotificationType::Comment,
            content,
            post_id: Some(post.post_id),
            comment_id: Some(comment.comment_id),
        })
        .await
    }

    /// 回复评论时通知被回复的评论作者
    pub async fn trigger_reply_notification(
        &self,
        reply: &Comment,
        parent_author_id: &str,
        replier: &UserProfile,
    ) -> Option<NotificationEvent> {
        if reply.user_id == parent_author_id {
            debug!("Skipping self-reply notification on comment {}", reply.comment_id);
            return None;
        }

        let content = format!(
            "{} replied to your comment: {}",
            replier.display_name,
            self.preview(&reply.content)
        );
        self.publish(NotificationDraft {
            recipient_id: parent_author_id.to_string(),
            sender_id: replier.user_id.clone(),
            sender_name: replier.display_name.clone(),
            sender_avatar_url: replier.avatar_url.clone(),
            kind: NotificationType::Reply,
            content,
            post_id: Some(reply.post_id),
            comment_id: Some(reply.comment_id),
        })
        .await
    }

    pub async fn trigger_like_notification(&self, post: &Post, liker: &UserProfile) -> Option<NotificationEvent> {
        if liker.user_id == post.user_id {
            return None;
        }

        let content = match &post.title {
            Some(title) => format!("{} liked your post: {}", liker.display_name, self.preview(title)),
            None => format!("{} liked your post", liker.display_name),
        };
        self.publish(NotificationDraft {
            recipient_id: post.user_id.clone(),
            sender_id: liker.user_id.clone(),
            sender_name: liker.display_name.clone(),
            sender_avatar_url: liker.avatar_url.clone(),
            kind: NotificationType::Like,
            content,
            post_id: Some(post.post_id),
            comment_id: None,
        })
        .await
    }

    pub async fn send_system_notification(&self, recipient_id: &str, content: &str) -> Option<NotificationEvent> {
        self.publish(NotificationDraft {
            recipient_id: recipient_id.to_string(),
            sender_id: SYSTEM_SENDER_ID.to_string(),
            sender_name: SYSTEM_SENDER_NAME.to_string(),
            sender_avatar_url: None,
            kind: NotificationType::System,
            content: content.to_string(),
            post_id: None,
            comment_id: None,
        })
        .await
    }

    /// 评论保存后的回调：查出文章作者和评论者后触发通知
    ///
    /// 回复同时通知被回复者；若被回复者就是文章作者，只发一条回复通知。
    pub async fn notify_comment_created(&self, request: &CommentCreatedRequest) -> Vec<NotificationEvent> {
        let comment = request.comment();
        let mut sent = Vec::new();

        let commenter = match self
            .resolve_user(&request.user_id, request.user_name.as_deref(), request.user_avatar_url.as_deref())
            .await
        {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!("Unknown commenter {} for comment {}", request.user_id, request.comment_id);
                return sent;
            }
            Err(e) => {
                warn!("User lookup failed for comment {}: {}", request.comment_id, e);
                return sent;
            }
        };

        let mut replied_to = None;
        if let (Some(_), Some(parent_author)) = (request.parent_id, request.parent_author_id.as_deref()) {
            replied_to = Some(parent_author.to_string());
            sent.extend(self.trigger_reply_notification(&comment, parent_author, &commenter).await);
        }

        match self.resolve_post_author(request.post_id, request.post_author_id.as_deref()).await {
            Ok(Some(author)) if replied_to.as_deref() != Some(author.as_str()) => {
                let post = Post {
                    post_id: request.post_id,
                    user_id: author,
                    title: None,
                };
                sent.extend(self.trigger_comment_notification(&comment, &post, &commenter).await);
            }
            Ok(Some(_)) => {}
            Ok(None) => warn!("No author found for post {}", request.post_id),
            Err(e) => warn!("Post author lookup failed for post {}: {}", request.post_id, e),
        }

        info!(
            "Comment {} on post {} produced {} notification(s)",
            request.comment_id,
            request.post_id,
            sent.len()
        );
        sent
    }

    /// 点赞回调：查出文章作者和点赞者后触发通知
    pub async fn notify_post_liked(&self, request: &PostLikedRequest) -> Option<NotificationEvent> {
        let liker = match self
            .resolve_user(&request.user_id, request.user_name.as_deref(), request.user_avatar_url.as_deref())
            .await
        {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!("Unknown liker {} for post {}", request.user_id, request.post_id);
                return None;
            }
            Err(e) => {
                warn!("User lookup failed for like on post {}: {}", request.post_id, e);
                return None;
            }
        };

        let author = match self.resolve_post_author(request.post_id, request.post_author_id.as_deref()).await {
            Ok(Some(author)) => author,
            Ok(None) => {
                warn!("No author found for post {}", request.post_id);
                return None;
            }
            Err(e) => {
                warn!("Post author lookup failed for post {}: {}", request.post_id, e);
                return None;
            }
        };

        let post = Post {
            post_id: request.post_id,
            user_id: author,
            title: request.post_title.clone(),
        };
        self.trigger_like_notification(&post, &liker).await
    }

    // 目录优先，查不到时退回请求里附带的信息
    async fn resolve_user(
        &self,
        user_id: &str,
        name_hint: Option<&str>,
        avatar_hint: Option<&str>,
    ) -> Result<Option<UserProfile>> {
        if let Some(profile) = self.directory.find_user(user_id).await? {
            return Ok(Some(profile));
        }
        Ok(name_hint.map(|name| UserProfile {
            user_id: user_id.to_string(),
            display_name: name.to_string(),
            avatar_url: avatar_hint.map(str::to_string),
        }))
    }

    async fn resolve_post_author(&self, post_id: i64, author_hint: Option<&str>) -> Result<Option<String>> {
        if let Some(author) = self.directory.get_post_author(post_id).await? {
            return Ok(Some(author));
        }
        Ok(author_hint.map(str::to_string))
    }

    async fn publish(&self, draft: NotificationDraft) -> Option<NotificationEvent> {
        let event = self.ids.build(draft);
        if self.publisher.publish(&event).await.is_appended() {
            Some(event)
        } else {
            None
        }
    }

    fn preview(&self, text: &str) -> String {
        let mut chars = text.chars();
        let head: String = chars.by_ref().take(self.preview_chars).collect();
        if chars.next().is_some() {
            format!("{}...", head)
        } else {
            head
        }
    }
}
