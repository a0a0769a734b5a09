//! StepWeave CLI - 命令行交互接口

use std::io::{self, BufRead, Write};

use anyhow::Context;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 守护进程地址的环境变量
const URL_ENV: &str = "STEPWEAVE_URL";
const DEFAULT_URL: &str = "http://127.0.0.1:3000";

/// 一条已解析的命令
#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Health,
    Functions,
    Send { event: String, data: Value },
    Status(String),
    Steps(String),
    Cancel(String),
    Clear,
    Quit,
    Unknown(String),
    Usage(&'static str),
}

fn parse_command(input: &str) -> Command {
    let (command, rest) = match input.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (input, ""),
    };

    match command {
        "help" => Command::Help,
        "health" => Command::Health,
        "functions" => Command::Functions,
        "send" => {
            let (event, data) = match rest.split_once(char::is_whitespace) {
                Some((event, data)) => (event, data.trim()),
                None => (rest, ""),
            };
            if event.is_empty() {
                return Command::Usage("send <event> [json]");
            }
            let data = if data.is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(data) {
                    Ok(data) => data,
                    Err(_) => return Command::Usage("send <event> [json]  (data must be valid JSON)"),
                }
            };
            Command::Send { event: event.to_string(), data }
        }
        "status" | "steps" | "cancel" if rest.is_empty() => Command::Usage(match command {
            "status" => "status <execution-id>",
            "steps" => "steps <execution-id>",
            _ => "cancel <execution-id>",
        }),
        "status" => Command::Status(rest.to_string()),
        "steps" => Command::Steps(rest.to_string()),
        "cancel" => Command::Cancel(rest.to_string()),
        "clear" => Command::Clear,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// 守护进程 HTTP 客户端
struct DaemonClient {
    base: String,
    http: reqwest::Client,
}

impl DaemonClient {
    fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .with_context(|| format!("cannot reach daemon at {}", self.base))?;
        Self::read(response).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let mut request = self.http.post(format!("{}{path}", self.base));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach daemon at {}", self.base))?;
        Self::read(response).await
    }

    async fn read(response: reqwest::Response) -> anyhow::Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            Ok(body)
        } else {
            let message = body["message"].as_str().unwrap_or("request failed");
            anyhow::bail!("{status}: {message}")
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

async fn execute(client: &DaemonClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Help => {
            println!("Available commands:");
            println!("  help                   - Show this help message");
            println!("  health                 - Check the daemon");
            println!("  functions              - List registered functions");
            println!("  send <event> [json]    - Send an event, e.g. send test/hello-world {{\"name\":\"Ada\"}}");
            println!("  status <id>            - Show an execution");
            println!("  steps <id>             - Show the step records of an execution");
            println!("  cancel <id>            - Cancel an execution");
            println!("  clear                  - Clear the screen");
            println!("  quit / exit            - Exit the CLI");
        }
        Command::Health => print_json(&client.get("/").await?),
        Command::Functions => {
            let functions = client.get("/functions").await?;
            match functions.as_array() {
                Some(list) if !list.is_empty() => {
                    println!("Registered functions:");
                    for f in list {
                        println!("  {:<28} <- {}", f["id"].as_str().unwrap_or("?"), f["trigger"].as_str().unwrap_or("?"));
                    }
                }
                _ => println!("Registered functions: (none)"),
            }
        }
        Command::Send { event, data } => {
            let accepted = client
                .post("/events", Some(serde_json::json!({ "name": event, "data": data })))
                .await?;
            match accepted["executionIds"].as_array() {
                Some(ids) if !ids.is_empty() => {
                    println!("Started {} execution(s):", ids.len());
                    for id in ids {
                        println!("  {}", id.as_str().unwrap_or("?"));
                    }
                }
                _ => println!("Event accepted, no function subscribed."),
            }
        }
        Command::Status(id) => print_json(&client.get(&format!("/executions/{id}")).await?),
        Command::Steps(id) => {
            let steps = client.get(&format!("/executions/{id}/steps")).await?;
            for step in steps.as_array().into_iter().flatten() {
                println!(
                    "  {:<20} {:<10} {}",
                    step["name"].as_str().unwrap_or("?"),
                    step["status"].as_str().unwrap_or("?"),
                    step["result"]
                );
            }
        }
        Command::Cancel(id) => {
            let execution = client.post(&format!("/executions/{id}/cancel"), None).await?;
            println!("Execution {} is {}", id, execution["status"].as_str().unwrap_or("?"));
        }
        Command::Clear => print!("\x1B[2J\x1B[1;1H"),
        Command::Usage(usage) => println!("Usage: {usage}"),
        Command::Unknown(command) => {
            println!("Unknown command: {}", command);
            println!("Type 'help' for available commands.");
        }
        Command::Quit => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sw=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let base = std::env::var(URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_string());
    let client = DaemonClient::new(base);

    println!("StepWeave CLI v{}", env!("CARGO_PKG_VERSION"));
    println!("Daemon: {}", client.base);
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("sw> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        let command = parse_command(input);
        if command == Command::Quit {
            println!("Goodbye!");
            break;
        }
        if let Err(err) = execute(&client, command).await {
            tracing::debug!(error = ?err, "Command failed");
            println!("Error: {err:#}");
        }
    }

    Ok(())
}
