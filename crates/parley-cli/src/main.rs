//! # parley
//!
//! Terminal chat client: connect with an API key, open or resume a
//! conversation, send text, and print whatever the agent sends back.

#![deny(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use parley_client::{ConversationMode, ConversationOptions, ParleyClient};
use parley_core::UserId;
use parley_core::content::{self, InboundMessage};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Chat with a Parley agent.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Chat with a Parley agent from the terminal")]
struct Cli {
    /// API key. Falls back to `PARLEY_API_KEY`.
    #[arg(long)]
    api_key: Option<String>,

    /// User id for a new conversation.
    #[arg(long, default_value = "cli-user")]
    user: String,

    /// Resume this conversation instead of starting one.
    #[arg(long)]
    conversation: Option<String>,

    /// Let the agent speak first.
    #[arg(long)]
    bot_first: bool,

    /// Send one message and exit after `--wait` seconds. Without it, lines
    /// are read from stdin until EOF or ctrl-c.
    #[arg(long)]
    message: Option<String>,

    /// Seconds to wait for replies after `--message`.
    #[arg(long, default_value = "10")]
    wait: u64,

    /// Log level (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("PARLEY_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    fn mode(&self) -> ConversationMode {
        if self.bot_first {
            ConversationMode::BotFirst
        } else {
            ConversationMode::UserFirst
        }
    }
}

fn render(message: &InboundMessage) -> String {
    let body = message
        .text()
        .map_or_else(|| message.content.to_string(), str::to_string);
    format!("[{}] {body}", message.origin.as_str())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = parley_settings::load_settings().unwrap_or_default();
    parley_core::logging::init_subscriber(args.log_level.as_deref().unwrap_or(&settings.log_level));

    let Some(api_key) = args.api_key() else {
        bail!("no API key: pass --api-key or set PARLEY_API_KEY");
    };
    let client = ParleyClient::builder(api_key)
        .settings(settings)
        .build()
        .context("Invalid client configuration")?;

    let socket_id = client.connect().await.context("Failed to connect")?;
    tracing::info!(%socket_id, "connected");

    let conversation = match &args.conversation {
        Some(id) => client.get_conversation(id.as_str()).await?,
        None => {
            let options = ConversationOptions {
                mode: args.mode(),
                ..Default::default()
            };
            client
                .create_conversation(&UserId::from(args.user.as_str()), options)
                .await
                .context("Failed to start conversation")?
        }
    };
    println!("conversation {}", conversation.get_conversation_id());

    let _ = conversation.on_message(|message: &InboundMessage| println!("{}", render(message)));
    let _ = conversation.on_error(|error: &parley_core::ParleyError| eprintln!("error: {error}"));

    if let Some(text) = &args.message {
        let _ = conversation.send_message(content::text(text.as_str())).await?;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(args.wait)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read stdin")? else {
                        break;
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = conversation.send_message(content::text(line)).await {
                        eprintln!("send failed: {e}");
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    client.close().await?;
    tracing::info!("closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::content::MessageOrigin;
    use serde_json::json;

    #[test]
    fn parses_defaults() {
        let cli = Cli::try_parse_from(["parley", "--api-key", "k"]).unwrap();
        assert_eq!(cli.user, "cli-user");
        assert_eq!(cli.wait, 10);
        assert_eq!(cli.mode(), ConversationMode::UserFirst);
        assert_eq!(cli.api_key().as_deref(), Some("k"));
    }

    #[test]
    fn parses_bot_first_and_resume() {
        let cli = Cli::try_parse_from([
            "parley",
            "--bot-first",
            "--conversation",
            "c1",
            "--message",
            "hi",
        ])
        .unwrap();
        assert_eq!(cli.mode(), ConversationMode::BotFirst);
        assert_eq!(cli.conversation.as_deref(), Some("c1"));
        assert_eq!(cli.message.as_deref(), Some("hi"));
    }

    #[test]
    fn renders_text_and_structured_content() {
        let text = InboundMessage {
            content: content::text("hello"),
            origin: MessageOrigin::AiAgent,
            conversation_id: None,
            message_id: None,
        };
        assert_eq!(render(&text), "[ai_agent] hello");

        let card = InboundMessage {
            content: json!({"type": "card", "title": "t"}),
            origin: MessageOrigin::Livechat,
            conversation_id: None,
            message_id: None,
        };
        assert_eq!(render(&card), r#"[livechat] {"title":"t","type":"card"}"#);
    }
}
