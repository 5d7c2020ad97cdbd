//! Line-oriented prompts on stdin
//!
//! Every reader returns `Ok(None)` once stdin is closed, so callers can bail
//! out instead of spinning on an empty stream.

use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

pub struct Prompter {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompter {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Next trimmed input line. Cancel safe.
    pub async fn line(&mut self) -> io::Result<Option<String>> {
        Ok(self
            .lines
            .next_line()
            .await?
            .map(|line| line.trim().to_string()))
    }

    pub async fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
        print!("{}", question);
        io::stdout().flush()?;
        self.line().await
    }

    /// Ask until a non-empty answer arrives
    pub async fn ask_required(
        &mut self,
        question: &str,
        retry: &str,
    ) -> io::Result<Option<String>> {
        let mut answer = self.ask(question).await?;
        while let Some(text) = &answer {
            if !text.is_empty() {
                break;
            }
            answer = self.ask(retry).await?;
        }
        Ok(answer)
    }

    /// Ask for a port; blank or invalid input falls back to `default`
    pub async fn ask_port(&mut self, question: &str, default: u16) -> io::Result<Option<u16>> {
        let Some(answer) = self.ask(question).await? else {
            return Ok(None);
        };
        let (port, valid) = parse_port(&answer, default);
        if !valid {
            println!("Invalid port, using {}", default);
        }
        Ok(Some(port))
    }

    /// y/N question; anything but yes is no
    pub async fn confirm(&mut self, question: &str) -> io::Result<bool> {
        Ok(self
            .ask(question)
            .await?
            .map(|answer| is_yes(&answer))
            .unwrap_or(false))
    }

    /// Ask until the answer is one of `options`
    pub async fn choose(&mut self, question: &str, options: &[&str]) -> io::Result<Option<String>> {
        loop {
            let Some(answer) = self.ask(question).await? else {
                return Ok(None);
            };
            if options.contains(&answer.as_str()) {
                return Ok(Some(answer));
            }
            println!("Invalid choice!");
        }
    }
}

/// Parse a port answer. Returns the port and whether the input was usable.
pub fn parse_port(input: &str, default: u16) -> (u16, bool) {
    let input = input.trim();
    if input.is_empty() {
        return (default, true);
    }
    match input.parse::<u16>() {
        Ok(port) if port > 0 => (port, true),
        _ => (default, false),
    }
}

pub fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}
