use crate::api::{ApiClient, ImageUpload, InboxBackend};
use crate::config::{Config, Presentation};
use crate::error::InboxError;
use crate::inbox::Inbox;
use crate::merge::{merge_messages, MessageMerge};
use crate::messenger_types::{ConversationId, ConversationSummary, InboxEvent, Message};
use crate::session::Session;
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PREVIEW_WIDTH: usize = 48;

/// Shared CLI implementation for the `cli` binary.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("cli")
        .to_string();

    if args.len() < 2 {
        print_usage(&bin);
        return Ok(());
    }

    let command = args[1].as_str();
    let result = match command {
        "conversations" | "ls" => {
            let filter = args[2..].join(" ");
            list_conversations(&filter).await
        }
        "thread" => {
            let Some(id) = args.get(2) else {
                eprintln!("{}", format!("Usage: {} thread <conversation_id>", bin).yellow());
                return Ok(());
            };
            show_thread(&ConversationId(id.clone())).await
        }
        "send" => {
            if args.len() < 4 {
                eprintln!("{}", format!("Usage: {} send <phone> <message>", bin).yellow());
                return Ok(());
            }
            send_text(&args[2], &args[3..].join(" ")).await
        }
        "send-image" => {
            if args.len() < 4 {
                eprintln!(
                    "{}",
                    format!("Usage: {} send-image <phone> <path> [caption]", bin).yellow()
                );
                return Ok(());
            }
            let caption = args[4..].join(" ");
            send_image(&args[2], Path::new(&args[3]), &caption).await
        }
        "watch" => {
            let mobile = args[2..].iter().any(|a| a == "--mobile");
            watch(mobile).await
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
            return Ok(());
        }
    };

    if let Err(e) = result {
        report_error(&e);
        std::process::exit(1);
    }
    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "💬 WhatsApp Inbox CLI".bright_green().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!(
        "  {} [filter]                 List conversations",
        "conversations".cyan()
    );
    println!(
        "  {} <conversation_id>               Show a conversation thread",
        "thread".cyan()
    );
    println!(
        "  {} <phone> <message>                 Send a text message",
        "send".cyan()
    );
    println!(
        "  {} <phone> <path> [caption]    Send an image",
        "send-image".cyan()
    );
    println!(
        "  {} [--mobile]                       Poll and print inbox events",
        "watch".cyan()
    );
    println!();
    println!("{}", "Environment:".bright_white().bold());
    println!("  INBOX_BASE_URL, INBOX_TENANT_ID, INBOX_TOKEN (or INBOX_SESSION_FILE)");
}

fn load_config(presentation: Presentation) -> Result<Config, InboxError> {
    let base_url = std::env::var("INBOX_BASE_URL")
        .map_err(|_| InboxError::Config("INBOX_BASE_URL is not set".to_string()))?;
    let config = Config {
        base_url,
        presentation,
        session_file: std::env::var("INBOX_SESSION_FILE").ok().map(PathBuf::from),
        ..Default::default()
    };
    config.validate()?;
    Ok(config)
}

fn client(presentation: Presentation) -> Result<(Config, ApiClient), InboxError> {
    let config = load_config(presentation)?;
    let session = Session::load(config.session_file.as_deref())?;
    let client = ApiClient::new(&config, session)?;
    Ok((config, client))
}

async fn list_conversations(filter: &str) -> Result<(), InboxError> {
    let (_, client) = client(Presentation::Desktop)?;
    let page = client.fetch_conversations().await?;
    let rows: Vec<&ConversationSummary> = page
        .conversations
        .iter()
        .filter(|c| c.matches(filter))
        .collect();

    println!(
        "{} {} conversation(s) ({} total)",
        "💬".bright_green(),
        rows.len().to_string().cyan(),
        page.total
    );
    for c in rows {
        let marker = if c.is_unread { "●".green().bold() } else { " ".normal() };
        println!(
            "{} {:>8}  {:<24} {:<16} {:>10}  {}",
            marker,
            c.id.to_string().bright_black(),
            truncate(&c.display_name, 24).bright_white(),
            c.phone,
            c.last_message_time.bright_black(),
            truncate(&c.last_message_preview, PREVIEW_WIDTH)
        );
    }
    Ok(())
}

async fn show_thread(id: &ConversationId) -> Result<(), InboxError> {
    let (_, client) = client(Presentation::Desktop)?;
    let fetched = client.fetch_messages(id).await?;
    let messages = match merge_messages(&[], fetched) {
        MessageMerge::Updated { messages, .. } => messages,
        MessageMerge::Unchanged => {
            println!("{}", "No messages yet".yellow());
            return Ok(());
        }
    };
    for m in &messages {
        print_message(m);
    }
    Ok(())
}

fn print_message(m: &Message) {
    let time = m.timestamp.with_timezone(&chrono::Local).format("%d/%m %H:%M");
    let body = if m.is_image {
        format!(
            "[image] {} {}",
            m.image_url.as_deref().unwrap_or(""),
            m.text
        )
    } else {
        m.text.clone()
    };
    if m.is_outbound {
        println!("{} {} {}", time.to_string().bright_black(), "→".blue(), body);
    } else {
        println!("{} {} {}", time.to_string().bright_black(), "←".green(), body.bright_white());
    }
}

async fn send_text(phone: &str, message: &str) -> Result<(), InboxError> {
    if message.trim().is_empty() {
        return Err(InboxError::Validation("message text is empty".to_string()));
    }
    let (_, client) = client(Presentation::Desktop)?;
    client.send_message(phone, message).await?;
    println!("{} Message sent to {}", "✓".green(), phone.cyan());
    Ok(())
}

async fn send_image(phone: &str, path: &Path, caption: &str) -> Result<(), InboxError> {
    let (_, client) = client(Presentation::Desktop)?;
    let image = ImageUpload::from_path(path).await?;
    let caption = (!caption.trim().is_empty()).then_some(caption);
    client.send_image(phone, image, caption).await?;
    println!("{} Image sent to {}", "✓".green(), phone.cyan());
    Ok(())
}

async fn watch(mobile: bool) -> Result<(), InboxError> {
    let presentation = if mobile {
        Presentation::Mobile
    } else {
        Presentation::Desktop
    };
    let (config, client) = client(presentation)?;
    let inbox = Inbox::new(config, Arc::new(client));
    let mut events = inbox.subscribe();

    inbox.start().await;
    println!("{} Watching inbox (Ctrl+C to stop)", "👀".bright_cyan());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            },
        }
    }

    inbox.shutdown().await;
    Ok(())
}

fn print_event(event: &InboxEvent) {
    match event {
        InboxEvent::ConversationsUpdated { total, unread, .. } => {
            println!(
                "{} {} conversations, {} unread",
                "↻".bright_black(),
                total,
                unread.to_string().green()
            );
        }
        InboxEvent::NewContent {
            conversation_ids,
            notified,
        } => {
            let ids: Vec<String> = conversation_ids.iter().map(|id| id.to_string()).collect();
            let label = if *notified { "🔔 new" } else { "new" };
            println!("{} {}", label.bright_yellow().bold(), ids.join(", "));
        }
        InboxEvent::ActiveConversationChanged { conversation_id } => match conversation_id {
            Some(id) => println!("{} {}", "▶".cyan(), id),
            None => println!("{}", "▶ (none)".bright_black()),
        },
        InboxEvent::MessagesUpdated {
            conversation_id,
            added,
            ..
        } => println!("{} +{} in {}", "✉".green(), added, conversation_id),
        InboxEvent::StatusChanged { status } => {
            println!("{} {:?}", "!".yellow().bold(), status);
        }
        InboxEvent::LoadingChanged { loading } => {
            if *loading {
                println!("{}", "… refreshing".bright_black());
            }
        }
        InboxEvent::MessageSent { phone } => println!("{} sent to {}", "✓".green(), phone),
        InboxEvent::SendFailed { error } => println!("{} {}", "✗".red(), error.red()),
        InboxEvent::SendErrorCleared => {}
    }
}

fn report_error(e: &InboxError) {
    match e {
        InboxError::NotConfigured(_) => {
            eprintln!(
                "{}",
                "✗ WhatsApp integration is not configured for this tenant".red().bold()
            );
            eprintln!("  Configure the WhatsApp API settings in the CRM and try again.");
        }
        InboxError::PermissionDenied(_) => {
            eprintln!("{}", "✗ Access restricted".red().bold());
            eprintln!("  Your account does not have permission to use the inbox.");
        }
        other => eprintln!("{} {}", "✗ Error:".red().bold(), other),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
