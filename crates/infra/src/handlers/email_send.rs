//! Transactional email: render a named template and hand it to a transport.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;

use pricekeep_core::{ExecutionError, JobPayload, JobType, JsonMap};

use crate::jobs::{JobHandler, JobOutput, ProgressReporter};

pub const DEFAULT_TEMPLATE: &str = "generic";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

struct Template {
    name: &'static str,
    subject: &'static str,
    body: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        name: "generic",
        subject: "pricekeep notification",
        body: "{{message}}",
    },
    Template {
        name: "price_alert",
        subject: "Price drop: {{product}}",
        body: "{{product}} is now {{price}} at {{store}} (was {{previous}}).",
    },
    Template {
        name: "welcome",
        subject: "Welcome to pricekeep, {{name}}",
        body: "Hi {{name}},\n\nyour account is ready. Add products to your list to start tracking prices.",
    },
];

/// Substitute `{{name}}` placeholders from `vars`.
///
/// Missing variables render as empty strings; an unterminated `{{` is kept as is.
pub fn render(template: &str, vars: &JsonMap) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };

        match vars.get(after[..close].trim()) {
            Some(JsonValue::String(s)) => out.push_str(s),
            Some(JsonValue::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    out
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Deliver `message`; returns a transport-specific message id.
    async fn send(&self, message: &EmailMessage) -> Result<String, ExecutionError>;
}

pub struct EmailSendHandler {
    transport: Arc<dyn EmailTransport>,
}

impl EmailSendHandler {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }

    fn compose(
        to: &str,
        template: &str,
        subject: Option<&str>,
        vars: &JsonMap,
    ) -> Result<EmailMessage, ExecutionError> {
        let template = TEMPLATES
            .iter()
            .find(|t| t.name == template)
            .ok_or_else(|| ExecutionError::fatal(format!("unknown email template '{template}'")))?;

        Ok(EmailMessage {
            to: to.to_string(),
            subject: render(subject.unwrap_or(template.subject), vars),
            body: render(template.body, vars),
        })
    }
}

#[async_trait]
impl JobHandler for EmailSendHandler {
    fn job_type(&self) -> JobType {
        JobType::EmailSend
    }

    async fn execute(
        &self,
        payload: &JsonMap,
        report: &ProgressReporter,
    ) -> Result<JobOutput, ExecutionError> {
        let JobPayload::EmailSend(payload) = JobPayload::parse(JobType::EmailSend, payload)
            .map_err(|e| ExecutionError::fatal(e.to_string()))?
        else {
            return Err(ExecutionError::fatal("payload does not describe an email"));
        };

        let template = payload.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        report.running(10, "rendering template");
        let message = Self::compose(
            &payload.to,
            template,
            payload.subject.as_deref(),
            &payload.vars,
        )?;

        report.running(40, "sending");
        let message_id = self.transport.send(&message).await?;
        report.finalizing(100, "sent");

        info!(to = %message.to, template, message_id = %message_id, "email sent");
        Ok(JobOutput::new(format!("sent '{}' to {}", message.subject, message.to))
            .with_info("to", message.to)
            .with_info("template", template)
            .with_info("messageId", message_id))
    }
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailTransport;

#[async_trait]
impl EmailTransport for LogEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, ExecutionError> {
        let message_id = format!("log-{}", uuid::Uuid::now_v7());
        info!(
            to = %message.to,
            subject = %message.subject,
            body_len = message.body.len(),
            message_id = %message_id,
            "email delivered to log transport"
        );
        Ok(message_id)
    }
}

/// Keeps sent messages for inspection; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingEmailTransport {
    sent: Mutex<Vec<EmailMessage>>,
    failure: Option<ExecutionError>,
}

impl RecordingEmailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: ExecutionError) -> Self {
        Self {
            sent: Mutex::default(),
            failure: Some(error),
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<String, ExecutionError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| ExecutionError::fatal("recording transport lock poisoned"))?;
        sent.push(message.clone());
        Ok(format!("recorded-{}", sent.len()))
    }
}
