use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use salon::{
    ChatSession, ParamsStore, SessionConfig, SessionStores, SettingsStore, StdoutStreamingPrinter,
};
use salon_chat::{
    ChatMessage, CitationStore, ConversationStore, MemoryCitationStore, MemoryConversationStore,
};
use salon_transport::HttpChatTransport;

/// Terminal chat client: reads prompts from stdin and streams responses to
/// stdout. All chat behavior lives in the session; this is wiring only.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    let transport = match HttpChatTransport::new(settings.to_transport_config()) {
        Ok(transport) => Arc::new(transport),
        Err(error) => {
            tracing::error!(error = %error, "failed to initialize chat transport");
            std::process::exit(1);
        }
    };

    let params = Arc::new(ParamsStore::default());
    let headers = settings.deployment_headers();
    params.update(|current| {
        current.deployment = headers.name.clone();
        current.deployment_config = headers.config.clone();
    });

    let conversation = Arc::new(MemoryConversationStore::new());
    let citations = Arc::new(MemoryCitationStore::new());
    let streaming = Arc::new(StdoutStreamingPrinter::new());

    let session = ChatSession::new(
        transport,
        SessionStores {
            conversation: conversation.clone(),
            citations: citations.clone(),
            streaming,
        },
        params,
        SessionConfig {
            agent_id: settings.agent_id(),
            title_timings: None,
        },
    );

    println!("salon chat — {}", settings.base_url);
    println!("commands: /stop /retry /regenerate /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };

        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/stop" => {
                session.stop();
                continue;
            }
            "/retry" => {
                session.retry();
            }
            "/regenerate" => {
                session.regenerate();
            }
            input => {
                session.send_message(input);
            }
        }

        drive_turn(&session, &mut lines).await;
        session.wait_for_title().await;
        print_turn_summary(&conversation, &citations);
    }
}

/// Pumps stdin while a stream is active so `/stop` works mid-response.
async fn drive_turn(session: &ChatSession, lines: &mut Lines<BufReader<Stdin>>) {
    loop {
        tokio::select! {
            _ = session.wait_for_idle() => break,
            line = lines.next_line() => {
                if let Ok(Some(line)) = line {
                    if line.trim() == "/stop" {
                        session.stop();
                    }
                } else {
                    session.stop();
                    break;
                }
            }
        }
    }
}

fn print_turn_summary(conversation: &MemoryConversationStore, citations: &MemoryCitationStore) {
    let snapshot = conversation.snapshot();

    match snapshot.messages.last() {
        Some(ChatMessage::Bot(bot)) => {
            if let Some(error) = &bot.error {
                println!("! {error}");
            }
            if !bot.tool_events.is_empty() {
                println!("tool events: {}", bot.tool_events.len());
            }
            if let Some(generation_id) = &bot.generation_id {
                let spans = citations.citations_for(generation_id);
                if !spans.is_empty() {
                    println!("citations: {}", spans.len());
                }
            }
        }
        Some(ChatMessage::User(user)) => {
            if let Some(error) = &user.error {
                println!("! {error}");
            }
        }
        None => {}
    }

    if !snapshot.title.is_empty() {
        println!("[{}]", snapshot.title);
    }
}
