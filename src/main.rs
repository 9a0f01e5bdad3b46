use clap::{CommandFactory, Parser};
use colored::*;
use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use stock_chat::cli::{parse_repl_line, Args, ReplCommand, TransportArg, REPL_HELP};
use stock_chat::mock::{MockReply, MockServer};
use stock_chat::render::{self, Renderer};
use stock_chat::session::{SendOutcome, QUICK_ACTIONS};
use stock_chat::socket::{self, SocketEvent};
use stock_chat::{sources, ChatConfig, ChatError, ChatSession, QueryClient, SessionEvent, Transport};

type SocketEvents = Option<mpsc::UnboundedReceiver<SocketEvent>>;

fn init_tracing(verbose: bool) {
    let default = if verbose { "stock_chat=debug" } else { "stock_chat=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "stock-chat", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(port) = args.mock {
        let server = MockServer::bind(&format!("127.0.0.1:{port}"), MockReply::default()).await?;
        eprintln!(
            "{}",
            format!("  Mock query service at http://{}", server.local_addr()?).bright_green()
        );
        eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
        tokio::select! {
            r = server.run() => r?,
            _ = tokio::signal::ctrl_c() => {}
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut cfg = ChatConfig::load(args.config.as_deref())?;
    cfg.apply_env();
    args.apply_to(&mut cfg);
    cfg.validate()?;

    if args.health {
        return Ok(health(&cfg, args.json).await);
    }

    let (transport, mut socket_events): (Transport, SocketEvents) = match args.transport {
        TransportArg::Http => (Transport::Http, None),
        TransportArg::Stream => (Transport::HttpStream, None),
        TransportArg::Socket => {
            let (handle, events) = socket::spawn(cfg.socket.clone());
            (Transport::Socket(handle), Some(events))
        }
    };

    let mut session = ChatSession::new(cfg)?.with_transport(transport);
    session.instant = args.instant;

    let render_task = if args.json {
        None
    } else {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        session.events = Some(tx);
        Some(tokio::spawn(async move {
            let mut renderer = Renderer::stdout();
            while let Some(event) = rx.recv().await {
                if renderer.handle(&event).is_err() {
                    break;
                }
            }
        }))
    };

    let answering = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c(&session, Arc::clone(&answering));

    if matches!(session.transport(), Transport::Socket(_)) {
        wait_connected(&mut session, &mut socket_events).await;
    }

    let code = match args.question.clone() {
        Some(question) => one_shot(&mut session, &mut socket_events, &question, &answering).await,
        None => {
            render::print_header(session.client().base_url(), session.transport().name());
            if !session.check_health().await {
                info!("continuing without a healthy backend");
            }
            session.push_welcome();
            repl(&mut session, &mut socket_events, &answering).await?;
            render::print_footer();
            ExitCode::SUCCESS
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(session.transcript().messages())?);
    }
    if let Transport::Socket(handle) = session.transport() {
        handle.close();
    }
    // Dropping the sender ends the render task once it drains.
    session.events = None;
    if let Some(task) = render_task {
        let _ = task.await;
    }
    Ok(code)
}

async fn health(cfg: &ChatConfig, json: bool) -> ExitCode {
    let client = QueryClient::new(cfg.api.clone());
    match client.health().await {
        Ok(status) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
            } else {
                let label = status.status.as_deref().unwrap_or("healthy");
                println!("{}: {}", "Service".bright_yellow(), client.base_url());
                println!("{}: {}", "Status".bright_yellow(), label);
                if let Some(err) = &status.error {
                    println!("{}: {}", "Error".bright_red(), err);
                }
            }
            if status.is_healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("{}", e.user_message().bright_red());
            debug!(error = %e, "health check failed");
            ExitCode::FAILURE
        }
    }
}

/// First Ctrl-C while an answer is in flight stops it; otherwise exit.
fn spawn_ctrl_c(session: &ChatSession, answering: Arc<AtomicBool>) {
    let stop = session.stop_handle();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if answering.load(Ordering::Acquire) {
                stop.stop();
            } else {
                std::process::exit(130);
            }
        }
    });
}

async fn next_socket_event(events: &mut SocketEvents) -> Option<SocketEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_connected(session: &mut ChatSession, events: &mut SocketEvents) {
    while let Some(event) = next_socket_event(events).await {
        let done = matches!(event, SocketEvent::Connected { .. } | SocketEvent::GaveUp { .. });
        session.handle_socket_event(event);
        if done {
            return;
        }
    }
    *events = None;
}

/// Feed socket events to the session until no answer is pending, the user
/// stops it, or the request timeout passes.
async fn drain_socket(session: &mut ChatSession, events: &mut SocketEvents) {
    let deadline = tokio::time::sleep(session.config().api.timeout());
    tokio::pin!(deadline);
    let mut signal = session.stop_handle().signal();
    while session.transcript().is_busy() {
        tokio::select! {
            event = next_socket_event(events) => match event {
                Some(event) => session.handle_socket_event(event),
                None => {
                    *events = None;
                    session.abandon_pending(&ChatError::NotConnected);
                }
            },
            _ = signal.stopped() => {
                session.cancel_pending();
            }
            _ = &mut deadline => {
                session.abandon_pending(&ChatError::Application("timed out waiting for the answer".into()));
            }
        }
    }
}

async fn ask(session: &mut ChatSession, events: &mut SocketEvents, question: &str, answering: &AtomicBool) -> SendOutcome {
    // Re-arm before Ctrl-C can target this question.
    session.stop_handle().reset();
    answering.store(true, Ordering::Release);
    let outcome = session.send(question).await;
    if let SendOutcome::Dispatched(_) = outcome {
        drain_socket(session, events).await;
    }
    answering.store(false, Ordering::Release);
    outcome
}

async fn one_shot(session: &mut ChatSession, events: &mut SocketEvents, question: &str, answering: &AtomicBool) -> ExitCode {
    match ask(session, events, question, answering).await {
        SendOutcome::Ignored(reason) => {
            eprintln!("nothing to ask ({reason:?})");
            ExitCode::FAILURE
        }
        SendOutcome::Failed(_) => ExitCode::FAILURE,
        SendOutcome::Answered(_) | SendOutcome::Cancelled(_) => ExitCode::SUCCESS,
        SendOutcome::Dispatched(id) => match session.transcript().get(&id) {
            Some(m) if m.is_error || m.is_streaming => ExitCode::FAILURE,
            _ => ExitCode::SUCCESS,
        },
    }
}

fn prompt() {
    print!("{} ", ">".bright_green().bold());
    let _ = std::io::stdout().flush();
}

async fn repl(
    session: &mut ChatSession,
    events: &mut SocketEvents,
    answering: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    prompt();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_repl_line(&line) {
                    ReplCommand::Quit => break,
                    ReplCommand::Empty => {}
                    ReplCommand::Ask(q) => {
                        ask(session, events, &q, answering).await;
                    }
                    ReplCommand::Quick(Some(n)) => match QUICK_ACTIONS.get(n.wrapping_sub(1)) {
                        Some((_, q)) => {
                            ask(session, events, q, answering).await;
                        }
                        None => println!("no quick question {n}"),
                    },
                    ReplCommand::Quick(None) => {
                        for (i, (label, q)) in QUICK_ACTIONS.iter().enumerate() {
                            println!("  {} {} {}", format!("{}.", i + 1).bright_yellow(), label, q.bright_black());
                        }
                    }
                    ReplCommand::Sources(n) => show_sources(session, n),
                    ReplCommand::Health => {
                        if session.check_health().await {
                            println!("{}", "service is healthy".bright_green());
                        }
                    }
                    ReplCommand::Clear => {
                        session.clear();
                        println!("{}", "conversation cleared".bright_black());
                    }
                    ReplCommand::Help => println!("{REPL_HELP}"),
                    ReplCommand::Unknown(cmd) => println!("unknown command :{cmd} (try :help)"),
                }
                prompt();
            }
            event = next_socket_event(events) => match event {
                Some(event) => session.handle_socket_event(event),
                None => *events = None,
            },
        }
    }
    Ok(())
}

fn show_sources(session: &ChatSession, n: Option<usize>) {
    let with_sources: Vec<_> = session.transcript().with_sources().collect();
    let picked = match n {
        Some(n) => with_sources.get(n.wrapping_sub(1)).copied(),
        None => with_sources.last().copied(),
    };
    let Some(src) = picked.and_then(|m| m.sources.as_ref()) else {
        println!("no sources to show");
        return;
    };
    for view in sources::views(src) {
        println!("{}", view.title().bright_yellow().bold());
        println!("{}", sources::render_view(&view));
    }
}
