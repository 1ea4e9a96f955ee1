//! Email with Attachments Example
//!
//! This example demonstrates how to:
//! - Attach in-memory data and files from disk
//! - Let the content type be guessed from the file name
//! - Cancel a send from another task

use std::time::Duration;
use very_simple_smtps::{
    Attachment, CancellationToken, Message, SecurityMode, ServerTarget, SessionComposer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    // Implicit TLS on port 465
    let target = ServerTarget::builder()
        .host("smtp.example.com")
        .security(SecurityMode::ImplicitTls)
        .credentials("user@example.com", "your-password")
        .build()?;

    let text_body = r#"
Monthly Report - December 2025

Please find attached the monthly report for December 2025.

Best regards,
Analytics Team
"#
    .trim();

    let mut builder = Message::builder()
        .from("analytics@example.com")
        .to("team@example.com")
        .cc("manager@example.com")
        .subject("Monthly Report - December 2025")
        .text(text_body)
        .attachment(Attachment::from_file(
            "summary.csv",
            b"region,sales\nnorth,1200\nsouth,950\n".to_vec(),
        ));

    // Attach a file from disk when one is given
    if let Some(path) = std::env::args().nth(1) {
        let data = std::fs::read(&path)?;
        let name = std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment.bin".to_string());
        println!("Attaching {} ({} bytes)", name, data.len());
        builder = builder.attachment(Attachment::from_file(name, data));
    }

    let message = builder.build();

    // Give up after 20 seconds or on Ctrl-C, whichever comes first
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = SessionComposer::new()
        .send_with_cancellation(&target, &message, Duration::from_secs(20), token)
        .await;

    match result.into_result() {
        Ok(report) => println!("Sent {} to {:?}", report.message_id, report.accepted),
        Err(err) => eprintln!("Send failed: {}", err.diagnostic()),
    }

    Ok(())
}
