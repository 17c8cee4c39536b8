//! Discord webhook notifications for job outcomes.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::properties;

const COLOR_RED: u32 = 16_711_680;
const COLOR_GREEN: u32 = 65_280;

#[derive(Serialize)]
struct DiscordMessage {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
}

async fn post_webhook(url: &str, message: &DiscordMessage) -> Result<()> {
    if url.is_empty() {
        // Notifications are optional; an unset webhook is not an error.
        return Ok(());
    }
    let response = reqwest::Client::new().post(url).json(message).send().await?;
    let status = response.status();
    if status != reqwest::StatusCode::NO_CONTENT && status != reqwest::StatusCode::OK {
        return Err(Error::Network(format!(
            "failed to send Discord notification, status code: {status}"
        )));
    }
    Ok(())
}

/// Post an error report to the error webhook.
pub async fn send_error_notification(error_message: &str) -> Result<()> {
    let message = DiscordMessage {
        embeds: vec![DiscordEmbed {
            title: "🚨 Error Notification".to_string(),
            description: format!("An error occurred: {error_message}"),
            color: COLOR_RED,
        }],
    };
    post_webhook(&properties::discord_error_notification_url(), &message).await
}

/// Post a success report to the success webhook.
pub async fn send_success_notification(success_message: &str) -> Result<()> {
    let message = DiscordMessage {
        embeds: vec![DiscordEmbed {
            title: "✅ Success Notification".to_string(),
            description: success_message.to_string(),
            color: COLOR_GREEN,
        }],
    };
    post_webhook(&properties::discord_success_notification_url(), &message).await
}
