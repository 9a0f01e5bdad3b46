use crate::config::ChatConfig;
use crate::protocol::QueryType;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// How questions are delivered to the query service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    /// POST /query, then reveal the answer locally
    Http,
    /// POST /query/stream with NDJSON chunks
    Stream,
    /// WebSocket with automatic reconnect
    Socket,
}

#[derive(Parser, Debug)]
#[command(name = "stock-chat")]
#[command(version)]
#[command(about = "Terminal chat client for the stock analysis query service")]
pub struct Args {
    /// Question to ask once and exit (starts an interactive session when omitted)
    pub question: Option<String>,

    /// Path to a TOML config file (defaults to ./stock-chat.toml when present)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Base URL of the query service, e.g. http://localhost:8000
    #[arg(long)]
    pub api_url: Option<String>,

    /// WebSocket URL; `{client_id}` is replaced with the generated id
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Transport used to send questions
    #[arg(long, short, value_enum, default_value = "http")]
    pub transport: TransportArg,

    /// Force a query type instead of detecting it from the question
    #[arg(long, value_enum)]
    pub query_type: Option<QueryType>,

    /// Number of documents retrieved for RAG queries
    #[arg(long)]
    pub top_k: Option<u32>,

    /// Print answers at once instead of revealing them gradually
    #[arg(long)]
    pub instant: bool,

    /// Check service health and exit
    #[arg(long)]
    pub health: bool,

    /// Print the final transcript as JSON (one-shot mode)
    #[arg(long)]
    pub json: bool,

    /// Log at debug level
    #[arg(long, short)]
    pub verbose: bool,

    /// Print shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<clap_complete::Shell>,

    /// Run a local mock query service on this port instead of a client
    #[arg(long)]
    pub mock: Option<u16>,
}

impl Args {
    /// Apply command line overrides on top of file and environment config.
    pub fn apply_to(&self, cfg: &mut ChatConfig) {
        if let Some(url) = &self.api_url {
            cfg.api.base_url = url.clone();
        }
        if let Some(url) = &self.ws_url {
            cfg.socket.url = url.clone();
        }
        if let Some(qt) = self.query_type {
            cfg.query.query_type = qt.as_str().to_string();
        }
        if let Some(k) = self.top_k {
            cfg.query.top_k = k;
        }
    }
}

/// A line typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Ask(String),
    Quit,
    Health,
    Clear,
    Help,
    /// Show sources of the n-th answer that has any (1-based); latest when omitted.
    Sources(Option<usize>),
    /// Send quick action n (1-based); list them when omitted.
    Quick(Option<usize>),
    Unknown(String),
    Empty,
}

pub const REPL_HELP: &str = "\
:quit            leave the session
:health          check the query service
:clear           clear the conversation
:sources [n]     show the sources of an answer
:quick [n]       list or send a quick question
:help            show this help
Ctrl-C           stop the answer being shown";

pub fn parse_repl_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(rest) = line.strip_prefix(':') else {
        return ReplCommand::Ask(line.to_string());
    };
    let mut parts = rest.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let num = parts.next().and_then(|n| n.parse::<usize>().ok());
    match cmd {
        "q" | "quit" | "exit" => ReplCommand::Quit,
        "health" => ReplCommand::Health,
        "clear" => ReplCommand::Clear,
        "help" | "h" | "?" => ReplCommand::Help,
        "sources" | "s" => ReplCommand::Sources(num),
        "quick" => ReplCommand::Quick(num),
        other => ReplCommand::Unknown(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["stock-chat"]);
        assert_eq!(args.question, None);
        assert_eq!(args.transport, TransportArg::Http);
        assert_eq!(args.query_type, None);
        assert!(!args.instant);
        assert!(!args.health);
        assert!(!args.json);
        assert_eq!(args.mock, None);
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "stock-chat",
            "A股市值排名前10",
            "--api-url",
            "http://10.0.0.2:8000",
            "--ws-url",
            "ws://10.0.0.2:8000/ws/{client_id}",
            "--transport",
            "socket",
            "--query-type",
            "financial",
            "--top-k",
            "8",
            "--instant",
            "--json",
            "-v",
        ]);
        assert_eq!(args.question.as_deref(), Some("A股市值排名前10"));
        assert_eq!(args.transport, TransportArg::Socket);
        assert_eq!(args.query_type, Some(QueryType::FinancialAnalysis));
        assert_eq!(args.top_k, Some(8));
        assert!(args.instant && args.json && args.verbose);
    }

    #[test]
    fn test_args_reject_unknown_transport() {
        assert!(Args::try_parse_from(["stock-chat", "--transport", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn test_apply_overrides_config() {
        let args = Args::parse_from([
            "stock-chat",
            "--api-url",
            "http://api:9000",
            "--query-type",
            "money_flow",
            "--top-k",
            "2",
        ]);
        let mut cfg = ChatConfig::default();
        args.apply_to(&mut cfg);
        assert_eq!(cfg.api.base_url, "http://api:9000");
        assert_eq!(cfg.query.fixed_type().unwrap(), Some(QueryType::MoneyFlow));
        assert_eq!(cfg.query.top_k, 2);
        assert_eq!(cfg.socket, ChatConfig::default().socket);
    }

    #[test]
    fn test_repl_lines() {
        assert_eq!(parse_repl_line("  "), ReplCommand::Empty);
        assert_eq!(parse_repl_line(" 茅台 "), ReplCommand::Ask("茅台".into()));
        assert_eq!(parse_repl_line(":quit"), ReplCommand::Quit);
        assert_eq!(parse_repl_line(":sources 2"), ReplCommand::Sources(Some(2)));
        assert_eq!(parse_repl_line(":sources"), ReplCommand::Sources(None));
        assert_eq!(parse_repl_line(":quick x"), ReplCommand::Quick(None));
        assert_eq!(parse_repl_line(":frobnicate"), ReplCommand::Unknown("frobnicate".into()));
    }
}
