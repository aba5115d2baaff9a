//! Built-in provider connectors.

pub mod slack;
pub mod smtp;
pub mod webhook;

pub use slack::SlackConnector;
pub use smtp::{SmtpConfig, SmtpConnector, SmtpReply, SmtpSession, SmtpTransport, TcpSmtpTransport};
pub use webhook::WebhookConnector;
