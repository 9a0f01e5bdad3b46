//! Terminal rendering of session events.

use colored::*;
use std::collections::HashMap;
use std::io::Write;

use crate::message::{Message, MessageId, Role};
use crate::session::SessionEvent;
use crate::sources;

/// Prints transcript changes incrementally, one message at a time.
pub struct Renderer<W: Write> {
    out: W,
    /// Content of each streaming message already written.
    printed: HashMap<MessageId, String>,
}

impl Renderer<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: HashMap::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle(&mut self, event: &SessionEvent) -> std::io::Result<()> {
        match event {
            SessionEvent::MessageAdded(msg) => self.added(msg),
            SessionEvent::ContentUpdated { id, content } => self.update(id, content),
            SessionEvent::MessageFinished(msg) => self.finished(msg),
            SessionEvent::Status(text) => {
                writeln!(self.out, "{}", format!("  [{text}]").bright_black())?;
                self.out.flush()
            }
        }
    }

    fn added(&mut self, msg: &Message) -> std::io::Result<()> {
        match msg.role {
            Role::User => {
                writeln!(self.out, "{} {}", "you".bright_yellow().bold(), msg.content)?;
            }
            Role::Assistant if msg.is_error => {
                writeln!(self.out, "{} {}", "bot".bright_cyan().bold(), msg.content.bright_red())?;
            }
            Role::Assistant if msg.is_streaming => {
                write!(self.out, "{} ", "bot".bright_cyan().bold())?;
                self.printed.insert(msg.id.clone(), String::new());
                self.update(&msg.id, &msg.content)?;
            }
            Role::Assistant => {
                writeln!(self.out, "{} {}", "bot".bright_cyan().bold(), msg.content)?;
            }
        }
        self.out.flush()
    }

    fn update(&mut self, id: &MessageId, content: &str) -> std::io::Result<()> {
        let done = self.printed.entry(id.clone()).or_default();
        write_delta(&mut self.out, done, content)?;
        *done = content.to_string();
        self.out.flush()
    }

    fn finished(&mut self, msg: &Message) -> std::io::Result<()> {
        match self.printed.remove(&msg.id) {
            Some(done) if msg.is_error => {
                if !done.is_empty() {
                    writeln!(self.out)?;
                }
                writeln!(self.out, "{}", msg.content.bright_red())?;
            }
            Some(done) => {
                write_delta(&mut self.out, &done, &msg.content)?;
                writeln!(self.out)?;
            }
            None => {
                writeln!(self.out, "{} {}", "bot".bright_cyan().bold(), msg.content)?;
            }
        }
        if let Some(src) = &msg.sources {
            writeln!(
                self.out,
                "{}",
                format!("  sources: {} (:sources to view)", sources::summary(src)).bright_black()
            )?;
        }
        self.out.flush()
    }
}

/// Write what `content` adds to `done`, or all of it on a new line when it
/// no longer extends what was printed.
fn write_delta<W: Write>(out: &mut W, done: &str, content: &str) -> std::io::Result<()> {
    match content.strip_prefix(done) {
        Some(rest) => write!(out, "{rest}"),
        None => write!(out, "\n{content}"),
    }
}

pub fn print_header(base_url: &str, transport: &str) {
    println!("{}", "=".repeat(50).bright_blue());
    println!("{}", "STOCK ANALYSIS CHAT".bright_cyan().bold());
    println!("{}: {}", "Service".bright_yellow(), base_url);
    println!("{}: {}", "Transport".bright_yellow(), transport);
    println!("{}", "Type :help for commands, Ctrl-C stops an answer.".bright_black());
    println!("{}", "=".repeat(50).bright_blue());
}

pub fn print_footer() {
    println!("{}", "=".repeat(50).bright_blue());
}
