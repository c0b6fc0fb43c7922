//! CLI for cluster operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ringkv::common::utils::display_bytes;
use ringkv::common::Config;
use ringkv::{AppendAck, MembershipView, ReplicaAcks, ReplicationClient, TcpConnector};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ringkv")]
#[command(about = "ringkv replicated key-value store CLI")]
#[command(version)]
struct Cli {
    /// Storage node addresses (comma separated)
    #[arg(long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replication factor (overrides the config file)
    #[arg(long)]
    replicas: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a value to every replica
    Put {
        /// Column family
        cf: String,

        /// Key
        key: String,

        /// Value (or use --file)
        value: Option<String>,

        /// Read the value from a file
        #[arg(long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },

    /// Read a value (hedged across two replicas)
    Get {
        /// Column family
        cf: String,

        /// Key
        key: String,

        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete a key on every replica
    Delete {
        /// Column family
        cf: String,

        /// Key
        key: String,
    },

    /// Drop a whole column family
    DropCf {
        /// Column family
        cf: String,
    },

    /// Stream a column family from one replica
    Stream {
        /// Column family
        cf: String,

        /// Start key, hex encoded
        #[arg(long)]
        offset: Option<String>,
    },

    /// Stream a column family from every node
    Aggregate {
        /// Column family (default family if omitted)
        cf: Option<String>,

        /// Start key, hex encoded
        #[arg(long)]
        offset: Option<String>,
    },

    /// Append time-series values for a key
    Append {
        /// Key
        key: String,

        /// Values, appended in order
        #[arg(required = true)]
        values: Vec<String>,

        /// Column family to route by (the key itself if omitted)
        #[arg(long)]
        cf: Option<String>,

        /// Flush threshold in bytes (overrides the config file)
        #[arg(long)]
        flush_threshold: Option<usize>,
    },

    /// Show the membership view and, optionally, a routing key's replicas
    Members {
        /// Routing key (column family) to place
        routing_key: Option<String>,
    },
}

fn print_acks(op: &str, acks: &ReplicaAcks) {
    println!(
        "{}: {}/{} replicas acknowledged",
        op,
        acks.acknowledged(),
        acks.len()
    );
    for (i, slot) in acks.slots().iter().enumerate() {
        println!("  [{}] {}", i, if slot.is_some() { "ack" } else { "absent" });
    }
}

fn decode_offset(offset: Option<&str>) -> anyhow::Result<Option<Vec<u8>>> {
    offset
        .map(|hex_offset| hex::decode(hex_offset).context("offset must be hex"))
        .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(replicas) = cli.replicas {
        config.client.replicas = replicas;
    }
    if let Commands::Append {
        flush_threshold: Some(threshold),
        ..
    } = &cli.command
    {
        config.client.append_flush_threshold = *threshold;
    }

    let client = ReplicationClient::new(
        config.client,
        MembershipView::fixed(cli.nodes),
        TcpConnector::new(),
    )?;

    match cli.command {
        Commands::Put {
            cf,
            key,
            value,
            file,
        } => {
            let value = match (value, file) {
                (Some(value), None) => value.into_bytes(),
                (None, Some(path)) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                _ => bail!("provide a value or --file"),
            };
            let acks = client.write(cf.as_bytes(), key.as_bytes(), &value).await?;
            print_acks("PUT", &acks);
        }

        Commands::Get { cf, key, output } => {
            match client.read(cf.as_bytes(), key.as_bytes()).await? {
                Some(value) => match output {
                    Some(path) => {
                        tokio::fs::write(&path, &value).await?;
                        println!("Wrote {} bytes to {}", value.len(), path.display());
                    }
                    None => {
                        let mut stdout = std::io::stdout();
                        stdout.write_all(&value)?;
                        stdout.write_all(b"\n")?;
                    }
                },
                None => {
                    eprintln!("{}/{} not found", cf, key);
                    std::process::exit(1);
                }
            }
        }

        Commands::Delete { cf, key } => {
            let acks = client.delete(cf.as_bytes(), key.as_bytes()).await?;
            print_acks("DELETE", &acks);
        }

        Commands::DropCf { cf } => {
            let acks = client.delete_column_family(cf.as_bytes()).await?;
            print_acks("DROP", &acks);
        }

        Commands::Stream { cf, offset } => {
            let offset = decode_offset(offset.as_deref())?;
            let records = client.stream(cf.as_bytes(), offset.as_deref()).await?;
            let mut count = 0;
            for record in records {
                println!("{}\t{}", display_bytes(&record.key), display_bytes(&record.value));
                count += 1;
            }
            eprintln!("{} records", count);
        }

        Commands::Aggregate { cf, offset } => {
            let offset = decode_offset(offset.as_deref())?;
            let aggregated = client
                .aggregated_stream(cf.as_deref().map(str::as_bytes), offset.as_deref())
                .await?;
            let (contributors, dropped) = (aggregated.contributors(), aggregated.dropped());
            let mut count = 0;
            for record in aggregated {
                println!("{}\t{}", display_bytes(&record.key), display_bytes(&record.value));
                count += 1;
            }
            eprintln!(
                "{} records from {} nodes ({} dropped)",
                count, contributors, dropped
            );
        }

        Commands::Append {
            key,
            values,
            cf,
            flush_threshold: _,
        } => {
            for value in &values {
                match client
                    .append(key.as_bytes(), value.as_bytes(), cf.as_deref().map(str::as_bytes))
                    .await?
                {
                    AppendAck::Buffered { pending_bytes } => {
                        println!("buffered ({} bytes pending)", pending_bytes)
                    }
                    AppendAck::Flushed(acks) => print_acks("FLUSH", &acks),
                }
            }
            let pending = client.pending_append_bytes(key.as_bytes());
            if pending > 0 {
                eprintln!(
                    "{} bytes below the flush threshold were not sent",
                    pending
                );
            }
        }

        Commands::Members { routing_key } => {
            for member in client.members() {
                println!("{}", member);
            }
            if let Some(routing_key) = routing_key {
                let replicas = client.replicas_for(routing_key.as_bytes());
                println!("replicas for {}:", routing_key);
                for (i, node) in replicas.iter().enumerate() {
                    let role = match i {
                        0 => "primary",
                        1 => "backup",
                        _ => "replica",
                    };
                    println!("  [{}] {} ({})", i, node, role);
                }
            }
        }
    }

    client.close();
    Ok(())
}
