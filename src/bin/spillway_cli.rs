use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use spillway::journal::JournalRecord;
use spillway::paging::address_dir;
use spillway::paging::page::decode_page_header;
use spillway::paging::store::page_ids;
use spillway::storage::{discover_segments, SegmentCursor, SegmentKind};
use spillway::{Broker, BrokerConfig, TxId};

#[derive(Parser)]
#[command(name = "spillway-cli", version, about = "Spillway broker data directory tooling")]
struct Cli {
    /// Broker data directory holding `journal/` and `paging/`.
    #[arg(long = "data-dir")]
    data_dir: PathBuf,
    /// JSON broker configuration; its `data_dir` is replaced by `--data-dir`.
    #[arg(long = "config")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the broker and print its snapshot as JSON.
    Stats,
    /// List prepared transactions waiting for a decision.
    InDoubt,
    /// Commit or roll back an in-doubt transaction.
    Resolve {
        #[arg(long = "tx")]
        tx: u64,
        #[arg(long = "commit", conflicts_with = "rollback")]
        commit: bool,
        #[arg(long = "rollback")]
        rollback: bool,
    },
    /// Dump journal records without opening the broker.
    Journal {
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// List the page files and records of an address.
    Pages {
        #[arg(long = "address")]
        address: String,
        #[arg(long = "records")]
        records: bool,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.data_dir, cli.config.as_deref())?;
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Stats => cmd_stats(config, &mut out)?,
        Commands::InDoubt => cmd_in_doubt(config, &mut out)?,
        Commands::Resolve {
            tx,
            commit,
            rollback,
        } => cmd_resolve(config, TxId(tx), commit, rollback, &mut out)?,
        Commands::Journal { limit } => cmd_journal(&config, limit, &mut out)?,
        Commands::Pages { address, records } => cmd_pages(&config, &address, records, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn load_config(data_dir: &Path, path: Option<&Path>) -> Result<BrokerConfig> {
    let mut config = match path {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BrokerConfig::new(data_dir),
    };
    config.data_dir = data_dir.to_path_buf();
    Ok(config)
}

fn cmd_stats(config: BrokerConfig, out: &mut dyn Write) -> Result<()> {
    let broker = Broker::open(config)?;
    writeln!(out, "{}", broker.snapshot()?.to_json()?)?;
    Ok(())
}

fn cmd_in_doubt(config: BrokerConfig, out: &mut dyn Write) -> Result<()> {
    let broker = Broker::open(config)?;
    let in_doubt = broker.in_doubt()?;
    if in_doubt.is_empty() {
        writeln!(out, "no in-doubt transactions")?;
    }
    for tx in in_doubt {
        match &tx.xid {
            Some(xid) => writeln!(out, "tx={} xid={} acks={}", tx.tx, xid, tx.acks)?,
            None => writeln!(out, "tx={} acks={}", tx.tx, tx.acks)?,
        }
    }
    Ok(())
}

fn cmd_resolve(
    config: BrokerConfig,
    tx: TxId,
    commit: bool,
    rollback: bool,
    out: &mut dyn Write,
) -> Result<()> {
    if commit == rollback {
        bail!("pass exactly one of --commit or --rollback");
    }
    let broker = Broker::open(config)?;
    if !broker.in_doubt()?.iter().any(|found| found.tx == tx) {
        bail!("transaction {tx} is not in doubt");
    }
    if commit {
        broker.commit(tx)?;
        writeln!(out, "committed {tx}")?;
    } else {
        broker.rollback(tx)?;
        writeln!(out, "rolled back {tx}")?;
    }
    broker.shutdown()?;
    Ok(())
}

fn cmd_journal(config: &BrokerConfig, limit: Option<usize>, out: &mut dyn Write) -> Result<()> {
    let dir = config.journal_dir();
    let segments = discover_segments(&dir, SegmentKind::Journal)?;
    writeln!(out, "journal={} segments={}", dir.display(), segments.len())?;
    let mut cursor = SegmentCursor::open(&dir, SegmentKind::Journal, segments);
    let mut count = 0usize;
    while let Some(record) = cursor.next_record()? {
        if limit.is_some_and(|limit| count >= limit) {
            break;
        }
        let decoded = JournalRecord::decode(record.kind, &record.payload);
        let text = match decoded {
            Ok(record) => describe(&record),
            Err(err) => format!("undecodable kind={} ({err})", record.kind),
        };
        writeln!(
            out,
            "{}:{} seq={} ts={} {}",
            record.segment_id, record.offset, record.seq, record.timestamp_ns, text
        )?;
        count += 1;
    }
    Ok(())
}

fn describe(record: &JournalRecord) -> String {
    let tx = |tx: &Option<TxId>| tx.map_or_else(|| "-".to_string(), |tx| tx.to_string());
    match record {
        JournalRecord::QueueBinding {
            queue,
            address,
            name,
        } => format!("binding queue={queue} address={address} name={name}"),
        JournalRecord::AddMessage {
            tx: id,
            queues,
            message,
        } => format!(
            "add tx={} message={} queues={:?} bytes={}",
            tx(id),
            message.id,
            queues.iter().map(|queue| queue.0).collect::<Vec<_>>(),
            message.body.len()
        ),
        JournalRecord::Ack {
            tx: id,
            queue,
            message,
        } => format!("ack tx={} queue={queue} message={message}", tx(id)),
        JournalRecord::PageAck {
            tx: id,
            queue,
            position,
        } => format!("page-ack tx={} queue={queue} position={position}", tx(id)),
        JournalRecord::DeliveryCount {
            queue,
            message,
            count,
        } => format!("delivery-count queue={queue} message={message} count={count}"),
        JournalRecord::Prepare { tx, xid } => match xid {
            Some(xid) => format!("prepare tx={tx} xid={xid}"),
            None => format!("prepare tx={tx}"),
        },
        JournalRecord::Commit { tx, id_shift } => format!("commit tx={tx} id_shift={id_shift}"),
        JournalRecord::Rollback { tx } => format!("rollback tx={tx}"),
        JournalRecord::IdCheckpoint {
            next_message,
            next_tx,
            next_queue,
        } => format!("checkpoint message={next_message} tx={next_tx} queue={next_queue}"),
    }
}

fn cmd_pages(config: &BrokerConfig, address: &str, records: bool, out: &mut dyn Write) -> Result<()> {
    let dir = address_dir(&config.paging_dir(), address);
    if !dir.exists() {
        bail!("address {address} has no paging directory");
    }
    let pages = page_ids(&dir)?;
    writeln!(out, "address={} dir={} pages={}", address, dir.display(), pages.len())?;
    for page in pages {
        let mut cursor = SegmentCursor::open(&dir, SegmentKind::Page, vec![page]);
        let mut count = 0u64;
        let mut bytes = 0u64;
        while let Some(record) = cursor.next_record()? {
            count += 1;
            bytes += record.payload.len() as u64;
            if !records {
                continue;
            }
            match decode_page_header(&record.payload) {
                Ok(header) => writeln!(
                    out,
                    "  {}@{} message={} tx={} queues={:?}",
                    page,
                    record.offset,
                    header.message_id,
                    header.tx.map_or_else(|| "-".to_string(), |tx| tx.to_string()),
                    header.queues.iter().map(|queue| queue.0).collect::<Vec<_>>()
                )?,
                Err(err) => writeln!(out, "  {}@{} undecodable ({err})", page, record.offset)?,
            }
        }
        writeln!(out, "page={} records={} payload_bytes={}", page, count, bytes)?;
    }
    Ok(())
}
