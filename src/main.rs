#![deny(dead_code)]
use anyhow::Result;
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::io;
use std::path::PathBuf;
use tokio::sync::mpsc;

mod session;
mod ui;
mod utils;

use crate::{
    session::{load_session, save_session, Session},
    ui::{ChatView, Intent},
};
use portal_chat::{ChatConfig, ChatSynchronizer, ConversationRef, ErrorKind, Identity, TransportClient};

const DEFAULT_ROLE: &str = "jobSeeker";

/// Command line arguments for portal-chat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "portal-chat: terminal client for the recruitment portal's real-time chat.",
    long_about = "portal-chat connects to the portal's chat gateway and REST API.\n\n\
    Without --user-id the identity from the last session is reused, or you are prompted for one.\n\
    Endpoints come from --config, the per-user config file, or CHAT_GATEWAY_URL / CHAT_API_URL."
)]
struct Args {
    /// Your portal user id
    #[arg(long, value_name = "ID")]
    user_id: Option<String>,

    /// Your portal role (jobSeeker or organization)
    #[arg(long, value_name = "ROLE")]
    role: Option<String>,

    /// Display name sent to the gateway
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where to write the log
    #[arg(long, value_name = "PATH", default_value = "portal-chat.log")]
    log_file: PathBuf,

    /// Open the conversation with this participant on start
    #[arg(long, value_name = "USER_ID")]
    with: Option<String>,
}

/// Identity from the command line, else the saved session, else a prompt.
fn resolve_session(args: &Args) -> Result<Session> {
    let saved = match load_session() {
        Ok(saved) => saved,
        Err(e) => {
            warn!("Ignoring unreadable session file: {}", e);
            None
        }
    };

    if let Some(user_id) = &args.user_id {
        let role = args.role.as_deref().unwrap_or(DEFAULT_ROLE);
        let name = args.name.as_deref().unwrap_or(user_id);
        let identity = Identity::new(user_id, role, name);
        let last_participant = saved
            .filter(|s| s.identity.user_id == identity.user_id)
            .and_then(|s| s.last_participant);
        return Ok(Session {
            identity,
            last_participant,
        });
    }

    if let Some(session) = saved {
        info!("Using saved session for {}", session.identity.user_id);
        return Ok(session);
    }

    let user_id = utils::prompt("User id")?;
    if user_id.is_empty() {
        return Err(anyhow::anyhow!("A user id is required"));
    }
    let role = utils::prompt(&format!("Role [{}]", DEFAULT_ROLE))?;
    let name = utils::prompt("Display name")?;
    let role = if role.is_empty() { DEFAULT_ROLE.to_string() } else { role };
    let name = if name.is_empty() { user_id.clone() } else { name };
    Ok(Session::new(Identity::new(&user_id, &role, &name)))
}

/// Hand an intent to the synchronizer on its own task. Validation failures
/// come back as notices for the status line; everything else is already in
/// the snapshot.
fn dispatch(sync: &ChatSynchronizer, intent: Intent, notices: &mpsc::UnboundedSender<String>) {
    let sync = sync.clone();
    let notices = notices.clone();
    tokio::spawn(async move {
        let result = match intent {
            Intent::Select(reference) => sync.select_conversation(reference).await,
            Intent::Send(text) => sync.send(&text).await,
            Intent::Typing => {
                sync.set_typing(true).await;
                Ok(())
            }
            Intent::Delete(message_id) => sync.delete_message(&message_id).await,
            Intent::Edit { message_id, text } => sync.edit_message(&message_id, &text).await,
            Intent::Retry(message_id) => sync.retry_send(&message_id).await,
            Intent::Block(user_id) => sync.block(&user_id).await,
            Intent::Unblock(user_id) => sync.unblock(&user_id).await,
            Intent::Older => sync.load_older_messages().await,
            Intent::ClearError => {
                sync.clear_error().await;
                Ok(())
            }
            Intent::Quit => Ok(()),
        };
        if let Err(e) = result {
            if e.kind() == ErrorKind::Validation {
                let _ = notices.send(e.to_string());
            } else {
                debug!("Intent failed: {}", e);
            }
        }
    });
}

async fn run_main_loop(
    view: &mut ChatView,
    terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>,
    sync: &ChatSynchronizer,
) -> Result<()> {
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<String>();
    let mut snapshots = sync.watch();
    view.update(snapshots.borrow_and_update().clone());

    loop {
        if snapshots.has_changed().unwrap_or(false) {
            let snapshot = snapshots.borrow_and_update().clone();
            view.update(snapshot);
        }
        while let Ok(notice) = notice_rx.try_recv() {
            view.set_notice(notice);
        }

        terminal.draw(|f| view.draw(f))?;

        match view.handle_input()? {
            Some(Intent::Quit) => {
                info!("Quit requested");
                break;
            }
            Some(intent) => dispatch(sync, intent, &notice_tx),
            None => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    utils::setup_logging(args.log_file.to_str(), LevelFilter::Debug)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", args.log_file.display());

    let config = ChatConfig::load(args.config.as_deref())?;
    let mut session = resolve_session(&args)?;
    if let Err(e) = save_session(&session) {
        eprintln!("Warning: Failed to save session: {}", e);
    }

    println!(
        "Connecting to {} as {}... please wait...",
        config.transport.gateway_url, session.identity.user_id
    );

    let transport = TransportClient::with_http(config.transport.clone());
    let sync = ChatSynchronizer::new(session.identity.clone(), transport, config.sync.clone());
    if let Err(e) = sync.start().await {
        // the view shows the error; the transport keeps reconnecting
        error!("Startup incomplete: {}", e);
    }

    if let Some(participant) = args.with.clone().or_else(|| session.last_participant.clone()) {
        let sync = sync.clone();
        tokio::spawn(async move {
            if let Err(e) = sync
                .select_conversation(ConversationRef::with_participant(&participant))
                .await
            {
                warn!("Could not open conversation with {}: {}", participant, e);
            }
        });
    }

    let mut terminal = ui::setup_terminal()?;
    let mut view = ChatView::new(&session.identity.user_id);
    let result = run_main_loop(&mut view, &mut terminal, &sync).await;
    ui::restore_terminal(terminal)?;

    session.last_participant = view
        .snapshot()
        .selected
        .as_ref()
        .map(|c| c.other_participant_id.clone())
        .or(session.last_participant);
    if let Err(e) = save_session(&session) {
        warn!("Failed to save session: {}", e);
    }

    sync.shutdown().await;
    info!("portal-chat shut down");
    result
}
