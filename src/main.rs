use std::io::Write;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use tutor_relay::client::{ChatSession, TranscriptEvent, TurnState};
use tutor_relay::domains::conversation::MessageRole;
use tutor_relay::error::Result;

#[derive(Parser, Debug)]
#[command(name = "tutor-relay")]
#[command(about = "Chat with a tutor relay from the terminal")]
struct Cli {
    #[arg(long, env = "TUTOR_RELAY_URL", default_value = "http://127.0.0.1:7879")]
    server: String,

    /// Assistant role, e.g. `coding` or `mental-support`.
    #[arg(long)]
    role: Option<String>,

    /// List the roles the relay offers and exit.
    #[arg(long, default_value_t = false)]
    roles: bool,

    /// Send one message and exit instead of starting a prompt loop.
    message: Option<String>,
}

const PROMPT: &str = "> ";

fn print_prompt() {
    print!("{PROMPT}");
    let _ = std::io::stdout().flush();
}

/// Turns transcript events into terminal output. The assistant reply is
/// printed as it grows, writing only the new suffix. With `interactive`, the
/// next prompt follows the end of a turn so it never lands inside a reply.
#[derive(Debug)]
struct ReplyPrinter {
    interactive: bool,
    current: Option<(String, usize)>,
}

#[derive(Debug, PartialEq, Eq)]
enum Output {
    Stdout(String),
    Stderr(String),
    Nothing,
}

impl ReplyPrinter {
    fn new(interactive: bool) -> Self {
        Self {
            interactive,
            current: None,
        }
    }

    fn apply(&mut self, event: TranscriptEvent) -> Output {
        match event {
            TranscriptEvent::Upserted(message) if message.role == MessageRole::Assistant => {
                let printed = match &self.current {
                    Some((id, printed)) if *id == message.id => *printed,
                    _ => 0,
                };
                let suffix = message.content.get(printed..).unwrap_or_default().to_string();
                self.current = Some((message.id, message.content.len()));
                Output::Stdout(suffix)
            }
            TranscriptEvent::StateChanged(TurnState::Settled | TurnState::Errored) => {
                let mut out = String::new();
                if self.current.take().is_some() {
                    out.push('\n');
                }
                if self.interactive {
                    out.push_str(PROMPT);
                }
                Output::Stdout(out)
            }
            TranscriptEvent::Banner(banner) => Output::Stderr(format!("[error] {banner}")),
            _ => Output::Nothing,
        }
    }
}

async fn render(mut events: broadcast::Receiver<TranscriptEvent>, interactive: bool) {
    let mut printer = ReplyPrinter::new(interactive);
    loop {
        match events.recv().await {
            Ok(event) => match printer.apply(event) {
                Output::Stdout(text) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                Output::Stderr(text) => eprintln!("{text}"),
                Output::Nothing => {}
            },
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn send(session: &ChatSession, text: &str, role: Option<&str>) -> Result<()> {
    let report = session.send_turn(text, role).await?;
    tracing::debug!(state = ?report.state, "turn finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tutor_relay::logging::init_tracing("tutor_relay");
    let cli = Cli::parse();
    let session = ChatSession::new(cli.server);

    if cli.roles {
        for role in session.fetch_roles().await? {
            println!("{:<16} {}", role.id, role.label);
        }
        return Ok(());
    }

    let interactive = cli.message.is_none();
    let renderer = tokio::spawn(render(session.subscribe(), interactive));

    if let Some(message) = cli.message {
        send(&session, &message, cli.role.as_deref()).await?;
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        print_prompt();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| tutor_relay::error::TutorRelayError::Runtime(e.to_string()))?
        {
            let text = line.trim();
            if text == "/quit" {
                break;
            }
            if text.is_empty() {
                print_prompt();
            } else {
                send(&session, text, cli.role.as_deref()).await?;
            }
        }
    }

    drop(session);
    let _ = renderer.await;
    Ok(())
}
