use std::{fs, io, time::Duration};

use crate::{
    action::{Action, ActionError, ActionOutcome, StepContext, Validator},
    controller::{delivery_path, Controller, ControllerError, MailQueue},
    generator::{GeneratedEmail, ParsedMessage},
};

/// Simulated time the receiving side gets to deliver a message.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends a generated message from a pooled user through the sending MTA and
/// defers the delivery check.
#[derive(Debug, Clone)]
pub struct SendEmail {
    pub queue_timeout: Duration,
}

impl Default for SendEmail {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(30),
        }
    }
}

impl Action for SendEmail {
    fn name(&self) -> &str {
        "SendEmail"
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<ActionOutcome, ActionError> {
        let controller = ctx.controller;
        let now = controller.get_time()?;
        let email = GeneratedEmail::new(ctx.generator, &ctx.rng, now)?;
        controller.submit_message(&email.to_message())?;
        tracing::info!(
            step = ctx.step,
            from = %email.sender.email,
            to = %email.recipient.email,
            "Sending email"
        );

        // the MTAs only move a queued message on once time passes
        if controller.stages_messages() {
            controller.wait_for_queue_depth(MailQueue::Send, 1, self.queue_timeout)?;
        }
        controller.advance_time(&ctx.rng, 50, 100)?;
        if controller.stages_messages() {
            controller.wait_for_queue_depth(MailQueue::Receive, 1, self.queue_timeout)?;
        }
        controller.advance_time(&ctx.rng, 50, 100)?;

        Ok(ActionOutcome::deferred(EmailValidator::new(&email)))
    }
}

/// Checks the delivered copy of a message against what was sent.
#[derive(Debug, Clone)]
pub struct EmailValidator {
    recipient: String,
    subject: String,
    date: String,
    text_content: String,
    html_content: String,
}

impl EmailValidator {
    pub fn new(email: &GeneratedEmail) -> Self {
        Self {
            recipient: email.recipient.email.clone(),
            subject: email.subject.clone(),
            date: email.date_header(),
            text_content: email.text_content.clone(),
            html_content: email.html_content.clone(),
        }
    }

    fn mismatch(&self, field: &str, expected: &str, received: Option<&str>) -> bool {
        if received == Some(expected) {
            return false;
        }
        tracing::error!(
            recipient = %self.recipient,
            subject = %self.subject,
            expected,
            received = received.unwrap_or("<missing>"),
            "{field} mismatch"
        );
        true
    }
}

impl Validator for EmailValidator {
    fn name(&self) -> &str {
        "EmailValidator"
    }

    fn timeout(&self) -> Duration {
        DELIVERY_TIMEOUT
    }

    fn validate(&self, controller: &dyn Controller) -> Result<bool, ActionError> {
        let path = delivery_path(controller.artifact_dir(), &self.recipient, &self.subject);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::error!(?path, "Email not found");
                return Ok(false);
            }
            Err(err) => return Err(ControllerError::io(&path)(err).into()),
        };
        let message = ParsedMessage::parse(&String::from_utf8_lossy(&content));

        let text = message.part("text/plain").map(|p| p.body.as_str());
        let html = message.part("text/html").map(|p| p.body.as_str());
        let failed = self.mismatch("Subject", &self.subject, message.header("Subject"))
            || self.mismatch("Date", &self.date, message.header("Date"))
            || self.mismatch("Text content", &self.text_content, text)
            || self.mismatch("HTML content", &self.html_content, html);
        Ok(!failed)
    }
}
