use crate::{
    config::Config,
    error::AppError,
    models::auth::Principal,
    services::{
        hub::{Delivery, NotificationHub, Subscription},
        token::{AuthFailure, TokenAuthority},
    },
};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 流式连接的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Streaming,
    Closed,
    Rejected(Rejection),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Streaming => f.write_str("streaming"),
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Rejected(reason) => write!(f, "rejected ({:?})", reason),
        }
    }
}

/// 拒绝连接的原因，仅记录在服务端日志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingCredential,
    Unauthenticated,
    RecipientMismatch,
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::MissingCredential | Rejection::Unauthenticated => AppError::unauthorized("Unauthorized"),
            Rejection::RecipientMismatch => AppError::forbidden("Forbidden"),
        }
    }
}

/// 候选令牌：Authorization 头在前，查询参数在后；空字符串视为缺失
pub fn candidate_tokens(header: Option<&str>, query: Option<&str>) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::with_capacity(2);
    for token in [header, query].into_iter().flatten().map(str::trim) {
        if !token.is_empty() && !candidates.iter().any(|c| c == token) {
            candidates.push(token.to_string());
        }
    }
    candidates
}

/// 认证通过的调用方及其使用的令牌
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    pub token: String,
}

/// 一个已认证并完成订阅的流式连接
pub struct StreamSession {
    id: Uuid,
    state: ConnectionState,
    principal: Principal,
    token: String,
    subscription: Subscription,
}

impl StreamSession {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Stream {} for {}: {} -> {}", self.id, self.principal.subject, self.state, next);
        self.state = next;
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.transition(ConnectionState::Closed);
        info!("Notification stream {} closed for {}", self.id, self.principal.subject);
    }
}

enum Step {
    Delivery(Option<Delivery>),
    Revalidate,
}

/// 实时通知流的入口：认证、授权、订阅并以 SSE 推送
#[derive(Clone)]
pub struct StreamGateway {
    tokens: TokenAuthority,
    hub: NotificationHub,
    keepalive: Duration,
    revalidate: Option<Duration>,
}

impl StreamGateway {
    pub fn new(tokens: TokenAuthority, hub: NotificationHub, config: &Config) -> Self {
        Self {
            tokens,
            hub,
            keepalive: Duration::from_secs(config.sse_keepalive_secs.max(1)),
            revalidate: (config.stream_revalidate_secs > 0)
                .then(|| Duration::from_secs(config.stream_revalidate_secs)),
        }
    }

    /// 依次校验候选令牌，第一个有效的令牌决定调用方身份
    pub async fn authenticate(&self, candidates: &[String]) -> Result<Authenticated, Rejection> {
        if candidates.is_empty() {
            return Err(Rejection::MissingCredential);
        }
        for token in candidates {
            match self.tokens.validate(token).await {
                Ok(principal) => {
                    return Ok(Authenticated {
                        principal,
                        token: token.clone(),
                    })
                }
                Err(failure) => debug!("Authentication failed: {}", failure),
            }
        }
        Err(Rejection::Unauthenticated)
    }

    /// 调用方只能访问自己的通知
    pub fn authorize(principal: &Principal, requested_user: Option<&str>) -> Result<(), Rejection> {
        match requested_user {
            Some(user) if user != principal.subject => {
                warn!("{} requested notifications of {}", principal.subject, user);
                Err(Rejection::RecipientMismatch)
            }
            _ => Ok(()),
        }
    }

    /// 完成连接握手并注册订阅
    pub async fn open(&self, candidates: &[String], requested_user: Option<&str>) -> Result<StreamSession, Rejection> {
        let id = Uuid::new_v4();
        let mut state = ConnectionState::Connecting;
        debug!("Stream {}: {}", id, state);

        state = ConnectionState::Authenticating;
        debug!("Stream {}: {}", id, state);

        let Authenticated { principal, token } = match self.authenticate(candidates).await {
            Ok(authenticated) => authenticated,
            Err(rejection) => {
                info!("Stream {} {}", id, ConnectionState::Rejected(rejection));
                return Err(rejection);
            }
        };
        if let Err(rejection) = Self::authorize(&principal, requested_user) {
            info!("Stream {} {}", id, ConnectionState::Rejected(rejection));
            return Err(rejection);
        }

        let subscription = self.hub.subscribe(&principal.subject);
        let mut session = StreamSession {
            id,
            state,
            principal,
            token,
            subscription,
        };
        session.transition(ConnectionState::Streaming);
        info!("Notification stream {} opened for {}", id, session.principal.subject);
        Ok(session)
    }

    /// 把会话转换为 SSE 事件流；客户端断开时流被丢弃，订阅随之注销
    pub fn events(&self, mut session: StreamSession) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        let tokens = self.tokens.clone();
        let mut ticker = self.revalidate.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        async_stream::stream! {
            yield Ok(connected_event(&session));

            loop {
                let step = tokio::select! {
                    delivery = session.subscription.recv() => Step::Delivery(delivery),
                    _ = next_tick(&mut ticker) => Step::Revalidate,
                };

                match step {
                    Step::Delivery(Some(Delivery::Event(event))) => {
                        match Event::default()
                            .event("notification")
                            .id(event.id.to_string())
                            .json_data(event.payload())
                        {
                            Ok(sse) => yield Ok(sse),
                            Err(e) => warn!("Failed to encode notification {}: {}", event.id, e),
                        }
                    }
                    Step::Delivery(Some(Delivery::Lagged(skipped))) => {
                        warn!(
                            "Stream {} for {} lagged, {} notification(s) dropped",
                            session.id, session.principal.subject, skipped
                        );
                    }
                    Step::Delivery(None) => break,
                    Step::Revalidate => match tokens.validate(&session.token).await {
                        Ok(_) => {}
                        Err(AuthFailure::StoreUnavailable) => {
                            warn!("Could not revalidate stream {}, keeping it open", session.id);
                        }
                        Err(failure) => {
                            info!("Closing stream {}: {}", session.id, failure);
                            break;
                        }
                    },
                }
            }
        }
    }

    pub fn sse(&self, session: StreamSession) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
        Sse::new(self.events(session)).keep_alive(KeepAlive::new().interval(self.keepalive))
    }
}

fn connected_event(session: &StreamSession) -> Event {
    Event::default()
        .event("connected")
        .json_data(json!({
            "connectionId": session.id,
            "userId": session.principal.subject,
        }))
        .unwrap_or_else(|_| Event::default().event("connected").data("connected"))
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
