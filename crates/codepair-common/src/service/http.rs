//! Session service client over the REST API and its WebSocket push channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use n0_future::boxed::BoxStream;
use n0_future::stream;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{JoinResponse, SessionService};
use crate::error::{ServiceError, ValidationError};
use crate::session::{Language, Session, validate_session_id};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Talks to the session REST API rooted at `api_url` (e.g. `http://host/api/v1/`).
#[derive(Debug, Clone)]
pub struct HttpSessionService {
    client: Client,
    api_url: Url,
    reconnect_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Availability {
    available: bool,
}

#[derive(Debug, Deserialize)]
struct PushFrame {
    event: Option<String>,
    data: Option<Session>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest<'a> {
    username: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRequest<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CodeRequest<'a> {
    code: &'a str,
    user_id: &'a str,
}

#[derive(Serialize)]
struct LanguageRequest<'a> {
    language: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingRequest<'a> {
    user_id: &'a str,
    is_typing: bool,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    language: &'a str,
}

impl HttpSessionService {
    pub fn new(api_url: Url, reconnect_interval: Duration) -> Self {
        Self {
            client: Client::new(),
            api_url,
            reconnect_interval,
        }
    }

    pub fn from_config(config: &crate::config::ClientConfig) -> Self {
        Self::new(config.api_url.clone(), config.reconnect_interval)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.api_url.join(path).map_err(|e| ServiceError::Request {
            message: format!("bad endpoint {path}: {e}"),
        })
    }

    fn session_endpoint(&self, session_id: &str, rest: &str) -> Result<Url, ServiceError> {
        validate_session_id(session_id)?;
        self.endpoint(&format!("sessions/{session_id}{rest}"))
    }

    /// WebSocket URL of the session push channel.
    pub fn push_url(&self, session_id: &str) -> Result<Url, ServiceError> {
        validate_session_id(session_id)?;
        let mut url = self.endpoint(&format!("ws/sessions/{session_id}"))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| ServiceError::Request {
            message: format!("cannot derive websocket URL from {}", self.api_url),
        })?;
        Ok(url)
    }

    /// Map a non-success response to a typed error.
    async fn check(
        response: Response,
        session_id: &str,
        username: Option<&str>,
    ) -> Result<Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body
                .detail
                .or(body.error)
                .unwrap_or_else(|| status.to_string()),
            Err(_) => status.to_string(),
        };

        Err(match status {
            StatusCode::NOT_FOUND if message == "Session not found" => {
                ValidationError::SessionNotFound {
                    id: session_id.into(),
                }
                .into()
            }
            StatusCode::BAD_REQUEST if message == "Username is already taken" => {
                ValidationError::UsernameTaken {
                    username: username.unwrap_or_default().into(),
                }
                .into()
            }
            _ => ServiceError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }
}

impl SessionService for HttpSessionService {
    async fn create_session(&self, language: Option<Language>) -> Result<Session, ServiceError> {
        let language = language.unwrap_or_default();
        let url = self.endpoint("sessions")?;
        let response = self
            .client
            .post(url)
            .json(&CreateRequest {
                language: language.as_str(),
            })
            .send()
            .await?;
        let session = Self::check(response, "", None)
            .await?
            .json::<Session>()
            .await?;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, ServiceError> {
        let url = self.session_endpoint(session_id, "")?;
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response, session_id, None)
            .await?
            .json::<Session>()
            .await?)
    }

    async fn join_session(
        &self,
        session_id: &str,
        username: &str,
    ) -> Result<JoinResponse, ServiceError> {
        let username = crate::session::validate_username(username)?;
        let url = self.session_endpoint(session_id, "/join")?;
        let response = self
            .client
            .post(url)
            .json(&JoinRequest { username })
            .send()
            .await?;
        Ok(Self::check(response, session_id, Some(username))
            .await?
            .json::<JoinResponse>()
            .await?)
    }

    async fn leave_session(&self, session_id: &str, participant_id: &str) -> Result<(), ServiceError> {
        let url = self.session_endpoint(session_id, "/leave")?;
        let response = self
            .client
            .post(url)
            .json(&LeaveRequest {
                user_id: participant_id,
            })
            .send()
            .await?;
        Self::check(response, session_id, None).await?;
        Ok(())
    }

    async fn update_code(
        &self,
        session_id: &str,
        code: &str,
        author_id: &str,
    ) -> Result<(), ServiceError> {
        let url = self.session_endpoint(session_id, "/code")?;
        let response = self
            .client
            .put(url)
            .json(&CodeRequest {
                code,
                user_id: author_id,
            })
            .send()
            .await?;
        Self::check(response, session_id, None).await?;
        Ok(())
    }

    async fn update_language(&self, session_id: &str, language: &Language) -> Result<(), ServiceError> {
        let url = self.session_endpoint(session_id, "/language")?;
        let response = self
            .client
            .put(url)
            .json(&LanguageRequest {
                language: language.as_str(),
            })
            .send()
            .await?;
        Self::check(response, session_id, None).await?;
        Ok(())
    }

    async fn set_typing(
        &self,
        session_id: &str,
        participant_id: &str,
        is_typing: bool,
    ) -> Result<(), ServiceError> {
        let url = self.session_endpoint(session_id, "/typing")?;
        let response = self
            .client
            .put(url)
            .json(&TypingRequest {
                user_id: participant_id,
                is_typing,
            })
            .send()
            .await?;
        Self::check(response, session_id, None).await?;
        Ok(())
    }

    async fn check_username(&self, session_id: &str, username: &str) -> Result<bool, ServiceError> {
        let mut url = self.session_endpoint(session_id, "/username/check")?;
        url.query_pairs_mut().append_pair("username", username);
        let response = self.client.get(url).send().await?;
        let availability = Self::check(response, session_id, None)
            .await?
            .json::<Availability>()
            .await?;
        Ok(availability.available)
    }

    fn subscribe(&self, session_id: &str) -> BoxStream<Session> {
        let url = match self.push_url(session_id) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "cannot subscribe to session updates");
                return Box::pin(stream::empty());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(push_loop(url, tx, self.reconnect_interval));

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|session| (session, rx))
        }))
    }
}

/// Keep the push socket open until the subscriber goes away.
async fn push_loop(url: Url, tx: mpsc::UnboundedSender<Session>, reconnect_interval: Duration) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::debug!(%url, "session push channel connected");
                let (mut write, mut read) = ws.split();
                let mut ping = tokio::time::interval(PING_INTERVAL);
                ping.tick().await;

                loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            let _ = write.close().await;
                            return;
                        }
                        _ = ping.tick() => {
                            let ping = Message::Text(r#"{"type":"ping"}"#.into());
                            if write.send(ping).await.is_err() {
                                break;
                            }
                        }
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(session) = decode_push(&text) {
                                    if tx.send(session).is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::debug!(error = ?e, "session push read failed");
                                break;
                            }
                        },
                    }
                }
                tracing::warn!(%url, "session push channel closed");
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "failed to connect session push channel");
            }
        }

        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }
}

fn decode_push(text: &str) -> Option<Session> {
    match serde_json::from_str::<PushFrame>(text) {
        Ok(PushFrame {
            event: Some(event),
            data: Some(session),
        }) if event == "session_update" => Some(session),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "malformed session push frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> HttpSessionService {
        HttpSessionService::new(
            Url::parse("https://example.com/api/v1/").unwrap(),
            Duration::from_secs(3),
        )
    }

    #[test]
    fn test_endpoints() {
        let service = service();
        assert_eq!(
            service
                .session_endpoint("abcd1234", "/join")
                .unwrap()
                .as_str(),
            "https://example.com/api/v1/sessions/abcd1234/join"
        );
        assert_eq!(
            service.push_url("abcd1234").unwrap().as_str(),
            "wss://example.com/api/v1/ws/sessions/abcd1234"
        );
        assert!(service.session_endpoint("../admin", "").is_err());
    }

    #[test]
    fn test_decode_push() {
        let frame = r#"{"event":"session_update","data":{"id":"abcd1234","code":"x","language":"python","users":[],"createdAt":1}}"#;
        let session = decode_push(frame).unwrap();
        assert_eq!(session.id, "abcd1234");
        assert_eq!(session.revision, 0);

        assert!(decode_push(r#"{"type":"pong"}"#).is_none());
        assert!(decode_push("not json").is_none());
    }
}
