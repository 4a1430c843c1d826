//! Chat recorder: every stdin line becomes a conversation turn.
//!
//! Commands:
//!   /new                 end the current conversation, start another
//!   /event <name>        track a named event
//!   /identify <user>     identify the session's user
//!   /alias <user> <old>  link a previous id to a user
//!   /stats               print delivery counters
//!   /quit                end the session and flush

use std::rc::Rc;
use tokio::io::{AsyncBufReadExt, BufReader};

use beacon_core::{Callbacks, EventOptions, Session};
use beacon_platform::{connect, connect_recording, RecordingTransport};
use beacon_types::{
    Result,
    config::{ClientConfig, SessionConfig},
    properties::Properties,
};
use crate::env;

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Turn(&'a str),
    New,
    Event(&'a str),
    Identify(&'a str),
    Alias { user_id: &'a str, previous_id: &'a str },
    Stats,
    Quit,
    Empty,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Turn(line);
        };
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("quit" | "exit"), None, None) => Command::Quit,
            (Some("new"), None, None) => Command::New,
            (Some("stats"), None, None) => Command::Stats,
            (Some("event"), Some(name), None) => Command::Event(name),
            (Some("identify"), Some(user), None) => Command::Identify(user),
            (Some("alias"), Some(user_id), Some(previous_id)) => {
                Command::Alias { user_id, previous_id }
            }
            _ => Command::Unknown(line),
        }
    }
}

pub async fn run(config: ClientConfig, dry_run: bool) -> Result<()> {
    let (client, recording): (_, Option<Rc<RecordingTransport>>) = if dry_run {
        let (client, transport) = connect_recording(config)?;
        (client, Some(transport))
    } else {
        (connect(config)?, None)
    };

    let handler = Callbacks::new()
        .with_on_event(|event| {
            let origin = event.origin_event_id.as_deref().unwrap_or("-");
            println!("  <- {} (origin {}) {:?}", event.event, origin, event.properties);
        })
        .with_on_error(|error| eprintln!("  !! {}", error));

    let mut session_config = SessionConfig::default();
    session_config.device_id = env::device_id();
    let session = client.create_session(session_config, Some(Rc::new(handler)))?;
    println!("Recording session {}. Type a message, or /quit.", session.id());

    session.scope(chat).await?;

    let stats = session.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).unwrap_or_else(|_| format!("{:?}", stats))
    );
    for failure in session.failures() {
        eprintln!("undelivered: {}", failure);
    }
    if let Some(transport) = recording {
        println!(
            "Dry run recorded {} events in {} batches",
            transport.accepted_events().len(),
            transport.accepted_batches().len()
        );
    }
    Ok(())
}

async fn chat(session: Session) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut conversation: Option<String> = None;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Turn(text) => {
                let reply = respond(text);
                let opts = EventOptions::new().property("chars", text.chars().count() as i64);
                let id = session
                    .track_conversation_turn(conversation.as_deref(), text, &reply, opts)
                    .await?;
                conversation = Some(id);
                println!("{}", reply);
            }
            Command::New => {
                if let Some(id) = conversation.take() {
                    session.end_conversation(Some(&id), EventOptions::new()).await?;
                }
                conversation = Some(session.start_conversation(None, EventOptions::new()).await?);
            }
            Command::Event(name) => {
                session
                    .track_event(name, conversation.as_deref(), EventOptions::new())
                    .await?;
            }
            Command::Identify(user_id) => {
                session
                    .user_identify(user_id, Properties::new(), EventOptions::new())
                    .await?;
            }
            Command::Alias { user_id, previous_id } => {
                session
                    .user_alias(user_id, previous_id, EventOptions::new())
                    .await?;
            }
            Command::Stats => println!("{:?} ({} pending)", session.stats(), session.pending()),
            Command::Unknown(input) => eprintln!("Unknown command: {}", input),
        }
    }
    Ok(())
}

/// Stand-in assistant.
pub fn respond(text: &str) -> String {
    format!("Noted: {} words.", text.split_whitespace().count())
}
