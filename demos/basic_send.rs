//! Basic Email Sending Example
//!
//! This example demonstrates how to:
//! - Describe the server with `ServerTarget`
//! - Build a plain text message
//! - Send it with one end-to-end deadline and inspect the result
//!
//! Set `SMTP_HOST`, `SMTP_USER` and `SMTP_PASSWORD` to try it against a real
//! submission server.

use std::time::Duration;
use very_simple_smtps::{Message, SecurityMode, ServerTarget, SessionComposer, SessionResult};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "very_simple_smtps=debug".into()),
        )
        .init();

    let host = std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.example.com".to_string());
    let user = std::env::var("SMTP_USER").unwrap_or_else(|_| "user@example.com".to_string());
    let password = std::env::var("SMTP_PASSWORD").unwrap_or_else(|_| "your-password".to_string());

    // Port 587 with STARTTLS is the default submission setup
    let target = ServerTarget::builder()
        .host(host)
        .security(SecurityMode::StartTls)
        .credentials(user.clone(), password)
        .build()?;

    let message = Message::builder()
        .from(format!("Sender Name <{}>", user))
        .to("Recipient Name <recipient@example.com>")
        .subject("Hello from Rust SMTP!")
        .text("This is a simple text email.\n\nBest regards,\nThe SMTP Bot")
        .build();

    println!("Sending email to {}:{}...", target.host, target.port);

    let composer = SessionComposer::new();
    match composer.send(&target, &message, Duration::from_secs(30)).await {
        SessionResult::Sent(report) => {
            println!("Email sent successfully!");
            println!("  Message ID: {}", report.message_id);
            println!("  Accepted: {}", report.accepted.join(", "));
            println!("  Server reply: {}", report.response);
            println!("  Took: {:?}", report.duration);
            for rejected in &report.partial {
                println!("  Rejected: {}", rejected);
            }
        }
        SessionResult::Failed(err) => {
            eprintln!("Failed to send email: {}", err);
            eprintln!("  Transient: {}", err.is_transient());
            return Err(err.into());
        }
    }

    println!("Metrics: {}", composer.metrics().snapshot().to_json());
    Ok(())
}
