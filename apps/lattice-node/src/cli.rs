use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "lattice-node")]
#[command(about = "Lattice mesh node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node and its operator console
    Run {
        /// Open directly into the live channel table
        #[arg(long)]
        stream: bool,
    },
    /// Print the version
    V,
}

/// Commands accepted on the interactive console inside `run`.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Stream,
    List {
        nodes: bool,
        accounts: bool,
        skip: usize,
        take: usize,
    },
    Connect {
        endpoint: String,
        signer: Option<String>,
    },
    Exit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
        let mut words = line.split_whitespace();
        let head = words.next().ok_or_else(|| "empty command".to_string())?;
        match head {
            "status" => Ok(ConsoleCommand::Status),
            "stream" => Ok(ConsoleCommand::Stream),
            "exit" | "quit" => Ok(ConsoleCommand::Exit),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "list" => {
                let mut nodes = false;
                let mut accounts = false;
                let mut skip = 0usize;
                let mut take = usize::MAX;
                let mut words = words.peekable();
                while let Some(flag) = words.next() {
                    match flag {
                        "--nodes" => nodes = true,
                        "--accounts" => accounts = true,
                        "--skip" => {
                            skip = parse_count(words.next(), "--skip")?;
                        }
                        "--take" => {
                            take = parse_count(words.next(), "--take")?;
                        }
                        other => return Err(format!("unknown list flag {other:?}")),
                    }
                }
                if !nodes && !accounts {
                    nodes = true;
                    accounts = true;
                }
                Ok(ConsoleCommand::List {
                    nodes,
                    accounts,
                    skip,
                    take,
                })
            }
            "connect" => {
                let mut endpoint = None;
                let mut signer = None;
                let mut words = words.peekable();
                while let Some(flag) = words.next() {
                    match flag {
                        "--node" => {
                            endpoint = Some(
                                words
                                    .next()
                                    .ok_or_else(|| "--node needs an endpoint".to_string())?
                                    .to_string(),
                            );
                        }
                        "--signer" => {
                            signer = Some(
                                words
                                    .next()
                                    .ok_or_else(|| "--signer needs an address".to_string())?
                                    .to_string(),
                            );
                        }
                        other => return Err(format!("unknown connect flag {other:?}")),
                    }
                }
                let endpoint = endpoint.ok_or_else(|| "connect requires --node".to_string())?;
                Ok(ConsoleCommand::Connect { endpoint, signer })
            }
            other => Err(format!("unknown command {other:?}")),
        }
    }
}

fn parse_count(value: Option<&str>, flag: &str) -> Result<usize, String> {
    value
        .ok_or_else(|| format!("{flag} needs a number"))?
        .parse()
        .map_err(|_| format!("{flag} needs a number"))
}
