//! Operator console: registry status, channel tables and outbound connects.

use std::io::{stdout, Write};
use std::sync::Arc;
use std::time::Duration;

use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event};
use crossterm::style::Stylize;
use crossterm::terminal::{self, Clear, ClearType};
use crossterm::QueueableCommand;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use url::Url;

use lattice_mesh::{Channel, ChannelManager};

use crate::cli::ConsoleCommand;
use crate::signaling_ws::WsSignaling;

const STREAM_REFRESH: Duration = Duration::from_millis(100);

pub struct Console {
    manager: Arc<ChannelManager>,
    max_latency: Duration,
}

struct Row {
    kind: &'static str,
    key: String,
    state: String,
    stable: bool,
    polite: bool,
    latency_ms: u64,
}

impl Console {
    pub fn new(manager: Arc<ChannelManager>, max_latency: Duration) -> Self {
        Console {
            manager,
            max_latency,
        }
    }

    pub async fn run(&self, start_streaming: bool) -> anyhow::Result<()> {
        if start_streaming {
            self.stream().await?;
        }
        println!("lattice console ready; type 'help' for commands");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match ConsoleCommand::parse(line) {
                Err(err) => println!("{err}"),
                Ok(ConsoleCommand::Status) => self.status(),
                Ok(ConsoleCommand::Help) => help(),
                Ok(ConsoleCommand::Stream) => self.stream().await?,
                Ok(ConsoleCommand::List {
                    nodes,
                    accounts,
                    skip,
                    take,
                }) => self.list(nodes, accounts, skip, take),
                Ok(ConsoleCommand::Connect { endpoint, signer }) => {
                    self.connect(&endpoint, signer.as_deref()).await;
                }
                Ok(ConsoleCommand::Exit) => break,
            }
        }
        Ok(())
    }

    fn status(&self) {
        println!(
            "signer {}  nodes {}  account channels {}",
            self.manager.local_signer(),
            self.manager.node_count(),
            self.manager.account_channel_count()
        );
    }

    fn rows(&self, nodes: bool, accounts: bool) -> Vec<Row> {
        let mut rows = Vec::new();
        if nodes {
            let mut entries: Vec<_> = self.manager.get_node_channels().into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
            for (signer, channel) in entries {
                rows.push(self.row("node", signer.to_string(), &channel));
            }
        }
        if accounts {
            let mut entries: Vec<_> = self
                .manager
                .get_account_channels()
                .into_iter()
                .flat_map(|(account, devices)| {
                    devices
                        .into_iter()
                        .map(move |(signer, channel)| (account.clone(), signer, channel))
                })
                .collect();
            entries.sort_by(|a, b| (a.0.as_str(), a.1.as_str()).cmp(&(b.0.as_str(), b.1.as_str())));
            for (account, signer, channel) in entries {
                rows.push(self.row(
                    "account",
                    format!("{}@{}", signer.short(), account),
                    &channel,
                ));
            }
        }
        rows
    }

    fn row(&self, kind: &'static str, key: String, channel: &Arc<Channel>) -> Row {
        Row {
            kind,
            key,
            state: channel.state().to_string(),
            stable: channel.is_stable(),
            polite: channel.is_polite(),
            latency_ms: channel.latency_ms(),
        }
    }

    fn list(&self, nodes: bool, accounts: bool, skip: usize, take: usize) {
        let rows = self.rows(nodes, accounts);
        let total = rows.len();
        print!("{}", self.render_table(rows.into_iter().skip(skip).take(take)));
        println!("{total} channel(s)");
    }

    fn render_table<I: Iterator<Item = Row>>(&self, rows: I) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<8} {:<44} {:<11} {:<7} {:<7} {:>8}\n",
            "kind", "peer", "state", "stable", "polite", "latency"
        ));
        for row in rows {
            let latency = if row.latency_ms == 0 {
                "-".to_string()
            } else if row.latency_ms > self.max_latency.as_millis() as u64 {
                format!("{}ms", row.latency_ms).red().to_string()
            } else {
                format!("{}ms", row.latency_ms)
            };
            out.push_str(&format!(
                "{:<8} {:<44} {:<11} {:<7} {:<7} {:>8}\n",
                row.kind, row.key, row.state, row.stable, row.polite, latency
            ));
        }
        out
    }

    /// Redraw the channel table every 100 ms until a key is pressed.
    async fn stream(&self) -> anyhow::Result<()> {
        terminal::enable_raw_mode()?;
        let outcome = self.stream_loop().await;
        terminal::disable_raw_mode()?;
        println!();
        outcome
    }

    async fn stream_loop(&self) -> anyhow::Result<()> {
        let mut out = stdout();
        loop {
            let table = self.render_table(self.rows(true, true).into_iter());
            out.queue(Clear(ClearType::All))?.queue(MoveTo(0, 0))?;
            for line in table.lines() {
                write!(out, "{line}\r\n")?;
            }
            write!(out, "press any key to leave stream mode\r\n")?;
            out.flush()?;
            if event::poll(Duration::from_millis(0))? {
                if let Event::Key(_) = event::read()? {
                    return Ok(());
                }
            }
            tokio::time::sleep(STREAM_REFRESH).await;
        }
    }

    async fn connect(&self, endpoint: &str, signer: Option<&str>) {
        let Some(signer) = signer else {
            println!("node discovery is out of scope here; pass --signer <40-hex address>");
            return;
        };
        let signer = match signer.parse() {
            Ok(signer) => signer,
            Err(err) => {
                println!("bad signer address: {err}");
                return;
            }
        };
        let url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(err) => {
                println!("bad endpoint {endpoint:?}: {err}");
                return;
            }
        };
        let transport = WsSignaling::new(url);
        match self.manager.dial_node_channel(signer, transport).await {
            Ok(channel) => {
                println!(
                    "connecting to {} (state {})",
                    channel.destination_signer(),
                    channel.state()
                );
            }
            Err(err) => {
                warn!(error = %err, "outbound connect failed");
                println!("connect failed: {err}");
            }
        }
    }
}

fn help() {
    println!("commands:");
    println!("  status                                   registry counts");
    println!("  list [--nodes] [--accounts] [--skip N] [--take M]");
    println!("  stream                                   live table, any key exits");
    println!("  connect --node <ws-url> --signer <addr>  dial another node");
    println!("  exit");
}
