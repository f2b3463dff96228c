use crate::backend::DocumentStore;
use crate::document_store::LocalDocumentStore;
use crate::message_store::MessageStore;
use crate::messenger_types::{AttachmentKind, ChatEvent, Message};
use crate::mutation::{ComposeMode, SubmitOutcome};
use crate::session::ChatSession;
use colored::*;
use serde_json::json;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

enum Flow {
    Continue,
    Quit,
}

/// Interactive terminal client driving one chat session.
pub async fn run(mut session: ChatSession, store: LocalDocumentStore) -> anyhow::Result<()> {
    let me = session.user().clone();
    let profile = serde_json::to_value(&me)?
        .as_object()
        .cloned()
        .unwrap_or_default();
    let users = session.config().users_collection.clone();
    store.set_document(&users, &me.uid, profile).await?;

    print_usage();

    let render = {
        let mut events = session.events();
        let view = session.store().clone();
        let uid = me.uid.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChatEvent::ViewUpdated { .. }) => render_view(&view, &uid).await,
                    Ok(ChatEvent::SubscriptionFailed { error, .. }) => {
                        eprintln!("{} live feed: {} (showing last known messages)", "✗".red().bold(), error.red());
                    }
                    // Failed commands are reported by the prompt loop itself
                    Ok(ChatEvent::OperationFailed { operation, error })
                        if operation == "resolve_counterpart" =>
                    {
                        eprintln!("{} {}: {}", "✗".red().bold(), operation, error.red());
                    }
                    Ok(ChatEvent::ConversationSelected { conversation_id, counterpart_id }) => {
                        println!(
                            "{} Opened {} with {}",
                            "✓".green(),
                            conversation_id.cyan(),
                            counterpart_id.as_deref().unwrap_or("?").cyan()
                        );
                    }
                    Ok(ChatEvent::ConversationClosed { conversation_id }) => {
                        println!("{} Closed {}", "•".dimmed(), conversation_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Renderer lagged {} events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match handle_line(&mut session, &store, line.trim()).await {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
        }
    }

    session.deselect_conversation().await;
    render.abort();
    Ok(())
}

async fn handle_line(
    session: &mut ChatSession,
    store: &LocalDocumentStore,
    line: &str,
) -> anyhow::Result<Flow> {
    if line.is_empty() {
        return Ok(Flow::Continue);
    }

    if !line.starts_with('/') {
        session.engine_mut().set_draft(line);
        match session.engine_mut().submit().await? {
            SubmitOutcome::Sent(_) | SubmitOutcome::Edited(_) => {}
            SubmitOutcome::Skipped => println!("{}", "Nothing to send".yellow()),
        }
        return Ok(Flow::Continue);
    }

    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    match command {
        "/new" => {
            if arg.is_empty() {
                println!("{}", "Usage: /new <user_id>".yellow());
                return Ok(Flow::Continue);
            }
            let profile = json!({ "uid": arg, "displayName": arg })
                .as_object()
                .cloned()
                .unwrap_or_default();
            let users = session.config().users_collection.clone();
            if store.read_document(&users, arg).await?.is_none() {
                store.set_document(&users, arg, profile).await?;
            }
            let id = session.start_conversation(arg).await?;
            session.select_conversation(&id).await?;
        }
        "/open" => {
            if arg.is_empty() {
                println!("{}", "Usage: /open <conversation_id>".yellow());
                return Ok(Flow::Continue);
            }
            session.select_conversation(arg).await?;
        }
        "/close" => session.deselect_conversation().await,
        "/reply" => {
            let target = message_at(session.store(), arg).await?;
            session.engine_mut().begin_reply(&target);
            println!("Replying to {}", quote(&target.reply_snapshot()).italic());
        }
        "/edit" => {
            let target = message_at(session.store(), arg).await?;
            session.engine_mut().begin_edit(&target)?;
            println!(
                "Editing {}. Type the new text, or /cancel.",
                quote(&target.content).italic()
            );
        }
        "/delete" => {
            let target = message_at(session.store(), arg).await?;
            session.engine_mut().delete(&target.id).await?;
        }
        "/cancel" => {
            let engine = session.engine_mut();
            let mode = engine.composition().mode().clone();
            match mode {
                ComposeMode::Replying(_) => engine.cancel_reply(),
                ComposeMode::Editing(_) => engine.cancel_edit(),
                ComposeMode::Idle => {}
            }
        }
        "/attach" => {
            session.attach_file(Path::new(arg)).await?;
            if let Some(att) = session.engine().composition().pending_attachment() {
                println!("Attached {} (send a message to post it)", att.name.cyan());
            }
        }
        "/detach" => session.engine_mut().clear_attachment(),
        "/send" => {
            // Posts an attachment without text
            session.engine_mut().submit().await?;
        }
        "/offline" => store.set_offline(true).await,
        "/online" => store.set_offline(false).await,
        "/who" => {
            println!("You: {} ({})", session.user().display_name, session.user().uid);
            match (session.conversation_id(), session.counterpart()) {
                (Some(id), Some(p)) => println!("In {} with {} ({})", id.cyan(), p.display_name, p.uid),
                (Some(id), None) => println!(
                    "In {} with {}",
                    id.cyan(),
                    session.counterpart_id().unwrap_or("unknown")
                ),
                (None, _) => println!("No conversation open"),
            }
        }
        "/help" => print_usage(),
        "/quit" | "/exit" => return Ok(Flow::Quit),
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
        }
    }

    Ok(Flow::Continue)
}

/// 1-based index into the current view
async fn message_at(view: &MessageStore, arg: &str) -> anyhow::Result<Message> {
    let n: usize = arg
        .parse()
        .map_err(|_| anyhow::anyhow!("expected a message number, got {:?}", arg))?;
    let messages = view.ordered_view().await;
    n.checked_sub(1)
        .and_then(|i| messages.get(i).cloned())
        .ok_or_else(|| anyhow::anyhow!("no message #{}", n))
}

async fn render_view(view: &MessageStore, uid: &str) {
    let messages = view.ordered_view().await;
    println!("{:-<60}", "");
    if let Some(start) = view.conversation_start_date().await {
        println!(
            "{}",
            format!("Conversation started on {}", start.format("%Y-%m-%d")).dimmed()
        );
    }
    for (i, msg) in messages.iter().enumerate() {
        let time = msg
            .timestamp
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|| "--:--".to_string());
        let name = if msg.sender_id == uid {
            msg.sender_name.cyan().bold()
        } else {
            msg.sender_name.magenta().bold()
        };

        if let Some(reply) = &msg.reply_ref {
            println!("      {}", format!("↳ {}", quote(&reply.target_content_snapshot)).dimmed());
        }

        let mut line = format!("[{}] {} {}: {}", i + 1, time.dimmed(), name, msg.content);
        if let Some(att) = &msg.attachment {
            let label = match att.kind {
                AttachmentKind::Image => "image",
                AttachmentKind::File => "file",
            };
            line.push_str(&format!(" [{}: {}]", label, att.name).blue().to_string());
        }
        if msg.edited {
            line.push_str(&" (edited)".dimmed().to_string());
        }
        if msg.is_pending() {
            line.push_str(&" (sending…)".yellow().to_string());
        }
        println!("{}", line);
    }
}

fn quote(text: &str) -> String {
    const MAX: usize = 40;
    if text.chars().count() > MAX {
        let cut: String = text.chars().take(MAX).collect();
        format!("\"{}…\"", cut)
    } else {
        format!("\"{}\"", text)
    }
}

fn print_usage() {
    println!("{}", "⚡ chatsync".bright_cyan().bold());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <user_id>        Start a conversation and open it", "/new".cyan());
    println!("  {} <id>            Open a conversation", "/open".cyan());
    println!("  {}                 Close the conversation", "/close".cyan());
    println!("  {} <n>            Reply to message n", "/reply".cyan());
    println!("  {} <n>             Edit your message n", "/edit".cyan());
    println!("  {} <n>           Delete your message n", "/delete".cyan());
    println!("  {}                Leave reply/edit mode", "/cancel".cyan());
    println!("  {} <path>        Attach a file", "/attach".cyan());
    println!("  {}                Drop the pending attachment", "/detach".cyan());
    println!("  {}                  Post the pending attachment alone", "/send".cyan());
    println!("  {} | {}     Simulate connection loss", "/offline".cyan(), "/online".cyan());
    println!("  {}                   Show who you are talking to", "/who".cyan());
    println!("  {}                  Quit", "/quit".cyan());
    println!("  Anything else is sent as a message.");
}
