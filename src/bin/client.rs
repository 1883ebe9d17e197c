//! Console client for the fuzzy search server.
//!
//! Logs in, keeps a WebSocket listener attached to `/ws` and submits
//! searches, either from prompts or from a script file:
//!
//! ```text
//! username: alice
//! password: secret
//! search: kitten, 1, levenshtein
//! search: sitting, 1, damerau-levenshtein
//! ```

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fuzzy_search_server::events::NotificationEvent;

#[derive(Parser, Debug)]
#[command(name = "fuzzy-search-client", about = "Console client for the fuzzy search server")]
struct Cli {
    /// Base URL of the server
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    server: String,

    /// Run the commands in this file instead of prompting
    #[arg(long)]
    script: Option<PathBuf>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,
}

/// Delay before each reconnect attempt: starts at `initial`, doubles up to
/// `max`, and starts over after a connection succeeds.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchCommand {
    word: String,
    corpus_id: i64,
    algorithm: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Script {
    username: Option<String>,
    password: Option<String>,
    searches: Vec<SearchCommand>,
}

fn parse_script(text: &str) -> anyhow::Result<Script> {
    let mut script = Script::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("username:") {
            script.username = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("password:") {
            script.password = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("search:") {
            let parts: Vec<&str> = value.split(',').map(str::trim).collect();
            let [word, corpus_id, algorithm] = parts[..] else {
                bail!(
                    "line {}: expected `search: word, corpus_id, algorithm`",
                    index + 1
                );
            };
            let corpus_id = corpus_id
                .parse::<i64>()
                .with_context(|| format!("line {}: bad corpus id {:?}", index + 1, corpus_id))?;
            script.searches.push(SearchCommand {
                word: word.to_string(),
                corpus_id,
                algorithm: algorithm.to_string(),
            });
        }
    }

    Ok(script)
}

fn ws_url(server: &str) -> String {
    let base = server.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws", base)
}

// === HTTP ===

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct ApiClient {
    http: reqwest::Client,
    server: String,
}

impl ApiClient {
    fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
        }
    }

    async fn login(&self, username: &str, password: &str) -> anyhow::Result<String> {
        let response = self
            .http
            .post(format!("{}/login", self.server))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .context("Login request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Login rejected ({}): {}", status, body);
        }
        Ok(response.json::<TokenResponse>().await?.access_token)
    }

    /// Returns the task id when the server accepted the search.
    async fn submit(&self, token: &str, search: &SearchCommand) -> anyhow::Result<Option<String>> {
        let response = self
            .http
            .post(format!("{}/search_algorithm", self.server))
            .bearer_auth(token)
            .json(&json!({
                "word": search.word,
                "corpus_id": search.corpus_id,
                "algorithm": search.algorithm,
            }))
            .send()
            .await
            .context("Search request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        println!("Request sent ({}): {}", status, body);
        Ok(body["task_id"].as_str().map(str::to_string))
    }
}

// === WebSocket listener ===

#[derive(Debug)]
enum Notice {
    Connected,
    Event(NotificationEvent),
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(url: &str, token: &str) -> Result<Socket, tungstenite::Error> {
    let mut request = url.into_client_request()?;
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?;
    request.headers_mut().insert(AUTHORIZATION, value);

    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

fn is_unauthorized(error: &tungstenite::Error) -> bool {
    match error {
        tungstenite::Error::Http(response) => response.status() == StatusCode::UNAUTHORIZED,
        _ => false,
    }
}

/// Keep a connection to `url` open until `notices` is dropped, reconnecting
/// with [`Backoff`] whenever it drops. Events missed while disconnected are
/// not replayed by the server.
async fn listen(url: String, token: String, notices: mpsc::UnboundedSender<Notice>) {
    let mut backoff = Backoff::default();

    loop {
        match connect(&url, &token).await {
            Ok(socket) => {
                backoff.reset();
                println!("Connected to {}. Waiting for notifications...", url);
                if notices.send(Notice::Connected).is_err() {
                    return;
                }
                match relay(socket, &notices).await {
                    Ok(()) => println!("WebSocket closed."),
                    Err(e) => tracing::warn!("WebSocket error: {}", e),
                }
            }
            Err(e) if is_unauthorized(&e) => {
                eprintln!("Server rejected the token, not reconnecting.");
                return;
            }
            Err(e) => tracing::warn!("Could not connect to {}: {}", url, e),
        }

        if notices.is_closed() {
            return;
        }
        let delay = backoff.next_delay();
        tracing::info!("Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

/// Heartbeat pings and anything else that is not an event yield `None`.
fn event_from_frame(text: &str) -> Option<NotificationEvent> {
    serde_json::from_str(text).ok()
}

async fn relay(
    mut socket: Socket,
    notices: &mpsc::UnboundedSender<Notice>,
) -> Result<(), tungstenite::Error> {
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => match event_from_frame(&text) {
                Some(event) => {
                    print_event(&event);
                    if notices.send(Notice::Event(event)).is_err() {
                        break;
                    }
                }
                None => tracing::trace!("Skipping frame {:?}", text),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

fn print_event(event: &NotificationEvent) {
    match serde_json::to_string_pretty(event) {
        Ok(pretty) => println!("Notification: {}", pretty),
        Err(_) => println!("Notification: {:?}", event),
    }
}

async fn wait_connected(notices: &mut mpsc::UnboundedReceiver<Notice>) -> anyhow::Result<()> {
    loop {
        match notices.recv().await {
            Some(Notice::Connected) => return Ok(()),
            Some(Notice::Event(_)) => {}
            None => bail!("Could not attach to the notification stream"),
        }
    }
}

// === Modes ===

type Lines = tokio::io::Lines<BufReader<tokio::io::Stdin>>;

async fn prompt(lines: &mut Lines, label: &str) -> anyhow::Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;
    match lines.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => bail!("Input closed"),
    }
}

async fn interactive(
    api: ApiClient,
    username: Option<String>,
    password: Option<String>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let username = match username {
        Some(username) => username,
        None => prompt(&mut lines, "Username: ").await?,
    };
    let password = match password {
        Some(password) => password,
        None => prompt(&mut lines, "Password: ").await?,
    };
    let token = api.login(&username, &password).await?;

    let (notices, _received) = mpsc::unbounded_channel();
    let listener = tokio::spawn(listen(ws_url(&api.server), token.clone(), notices));

    loop {
        println!("\nCommands: search, exit");
        let command = prompt(&mut lines, "> ").await?.to_lowercase();
        match command.as_str() {
            "exit" => break,
            "search" => {
                let word = prompt(&mut lines, "Word: ").await?;
                let corpus_id = prompt(&mut lines, "Corpus id: ").await?;
                let Ok(corpus_id) = corpus_id.parse::<i64>() else {
                    println!("Corpus id must be a number.");
                    continue;
                };
                let algorithm =
                    prompt(&mut lines, "Algorithm (levenshtein, damerau-levenshtein): ").await?;
                let search = SearchCommand {
                    word,
                    corpus_id,
                    algorithm,
                };
                if let Err(e) = api.submit(&token, &search).await {
                    eprintln!("{:#}", e);
                }
            }
            "" => {}
            _ => println!("Unknown command."),
        }
    }

    listener.abort();
    Ok(())
}

async fn run_script(api: ApiClient, path: PathBuf) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Cannot read script {}", path.display()))?;
    let script = parse_script(&text)?;
    let (Some(username), Some(password)) = (script.username, script.password) else {
        bail!("Script must set both username and password");
    };
    let token = api.login(&username, &password).await?;

    let (notices, mut received) = mpsc::unbounded_channel();
    let listener = tokio::spawn(listen(ws_url(&api.server), token.clone(), notices));
    wait_connected(&mut received).await?;

    let mut pending = HashSet::new();
    for search in &script.searches {
        if let Some(task_id) = api.submit(&token, search).await? {
            pending.insert(task_id);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    while !pending.is_empty() {
        match received.recv().await {
            Some(Notice::Event(event)) if event.status().is_terminal() => {
                pending.remove(&event.task_id);
            }
            Some(_) => {}
            None => bail!("Notification stream ended with {} searches unfinished", pending.len()),
        }
    }

    listener.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let api = ApiClient::new(&cli.server);

    match cli.script {
        Some(path) => run_script(api, path).await,
        None => interactive(api, cli.username, cli.password).await,
    }
}
