// expo.rs
use anyhow::{Context, Result};
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto::token_fingerprint;
use crate::error::DeliveryError;
use crate::models::{Payload, PushMessage};
use crate::policy::Priority;
use crate::push::PushSender;

pub const DEFAULT_EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Debug, Serialize)]
struct ExpoMessage<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    badge: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
    priority: &'static str,
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    data: Vec<ExpoTicket>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    message: Option<String>,
    details: Option<ExpoTicketDetails>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicketDetails {
    error: Option<String>,
}

pub struct ExpoSender {
    http_client: HttpClient,
    push_url: String,
    access_token: Option<String>,
}

impl ExpoSender {
    pub fn new(push_url: &str, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http_client,
            push_url: push_url.to_string(),
            access_token,
        })
    }
}

fn expo_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::High | Priority::Urgent => "high",
        Priority::Normal => "normal",
        Priority::Low => "default",
    }
}

fn classify_status(status: StatusCode) -> DeliveryError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryError::Transient(format!("Expo push API returned {status}"))
    } else {
        DeliveryError::Permanent(format!("Expo push API returned {status}"))
    }
}

fn classify_ticket(ticket: ExpoTicket) -> Result<(), DeliveryError> {
    if ticket.status == "ok" {
        return Ok(());
    }
    let code = ticket.details.and_then(|d| d.error).unwrap_or_default();
    let message = ticket.message.unwrap_or_else(|| "no message".to_string());
    match code.as_str() {
        "DeviceNotRegistered" | "InvalidCredentials" | "MessageTooBig" => {
            Err(DeliveryError::Permanent(format!("{code}: {message}")))
        }
        _ => Err(DeliveryError::Transient(format!("{code}: {message}"))),
    }
}

impl PushSender for ExpoSender {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), DeliveryError> {
        let body = [ExpoMessage {
            to: token,
            title: &message.title,
            body: &message.body,
            data: &message.data,
            badge: message.badge,
            sound: message.sound.as_deref(),
            priority: expo_priority(message.priority),
        }];

        let mut request = self.http_client.post(&self.push_url).json(&body);
        if let Some(access_token) = &self.access_token {
            request = request.bearer_auth(access_token);
        }

        debug!(token = %token_fingerprint(token), "Sending Expo push");
        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("Expo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }

        let parsed: ExpoResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("Unreadable Expo response: {e}")))?;

        match parsed.data.into_iter().next() {
            Some(ticket) => classify_ticket(ticket),
            None => {
                warn!(token = %token_fingerprint(token), "Expo response carried no ticket");
                Err(DeliveryError::Transient("empty Expo response".to_string()))
            }
        }
    }
}
