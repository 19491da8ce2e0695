use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use jokeboard_core::{
    already_voted_line, confirmation_line, rank_change_line, BoardConfig, MessageId, UserId,
    VoteOutcome,
};
use jokeboard_engine::{RankCommand, ReactionEvent, ScoringEngine};
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "jokeboard")]
#[command(about = "Joke scoring board CLI")]
struct Cli {
    #[arg(long, default_value = "./jokeboard.sqlite3")]
    db: PathBuf,

    /// Optional JSON file overriding reaction weights and vote policy.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Vote(VoteArgs),
    React(ReactArgs),
    Leaderboard(LeaderboardArgs),
    RandomJoke,
    BestJoke,
    MyRank(MyRankArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct VoteArgs {
    #[arg(long)]
    message_id: String,
    #[arg(long)]
    author_id: String,
    #[arg(long)]
    author_name: String,
    #[arg(long)]
    content: String,
    #[arg(long)]
    voter_id: String,
    #[arg(long)]
    points: i64,
}

#[derive(Debug, Args)]
struct ReactArgs {
    #[arg(long)]
    message_id: String,
    #[arg(long)]
    author_id: String,
    #[arg(long)]
    author_name: String,
    #[arg(long)]
    content: String,
    #[arg(long)]
    voter_id: String,
    #[arg(long)]
    emoji: String,
}

#[derive(Debug, Args)]
struct LeaderboardArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct MyRankArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn vote_notices(author_name: &str, delta: i64, outcome: &VoteOutcome) -> Vec<String> {
    match outcome {
        VoteOutcome::AlreadyVoted => vec![already_voted_line()],
        VoteOutcome::Accepted(receipt) => {
            let mut notices = vec![confirmation_line(author_name, delta, receipt)];
            if let Some(change) = receipt.rank_change {
                notices.push(rank_change_line(author_name, receipt.author_rank, change));
            }
            notices
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BoardConfig::load(path)?,
        None => BoardConfig::default(),
    };
    let engine = ScoringEngine::new(cli.db, config);

    match cli.command {
        Command::Vote(args) => run_vote(&args, &engine),
        Command::React(args) => run_react(&args, &engine),
        Command::Leaderboard(args) => run_leaderboard(&args, &engine),
        Command::RandomJoke => run_random_joke(&engine),
        Command::BestJoke => run_best_joke(&engine),
        Command::MyRank(args) => run_my_rank(&args, &engine),
        Command::Db { command } => run_db(command, &engine),
    }
}

fn run_vote(args: &VoteArgs, engine: &ScoringEngine) -> Result<()> {
    let command = RankCommand {
        message_id: MessageId::new(&args.message_id),
        author_id: UserId::new(&args.author_id),
        author_name: args.author_name.clone(),
        content: args.content.clone(),
        voter_id: UserId::new(&args.voter_id),
        points: args.points,
    };
    let outcome = engine.rank_command(&command)?;
    let notices = vote_notices(&args.author_name, args.points, &outcome);
    emit_json(serde_json::json!({
        "outcome": outcome,
        "notices": notices
    }))
}

fn run_react(args: &ReactArgs, engine: &ScoringEngine) -> Result<()> {
    let reaction = ReactionEvent {
        message_id: MessageId::new(&args.message_id),
        author_id: UserId::new(&args.author_id),
        author_name: args.author_name.clone(),
        content: args.content.clone(),
        voter_id: UserId::new(&args.voter_id),
        reaction: args.emoji.clone(),
    };
    let weight = engine.config().weight_for(&args.emoji);
    match engine.rank_reaction(&reaction)? {
        Some(outcome) => {
            let delta = weight.unwrap_or_default();
            let notices = vote_notices(&args.author_name, delta, &outcome);
            emit_json(serde_json::json!({
                "applied": true,
                "outcome": outcome,
                "notices": notices
            }))
        }
        None => emit_json(serde_json::json!({
            "applied": false,
            "notices": Vec::<String>::new()
        })),
    }
}

fn run_leaderboard(args: &LeaderboardArgs, engine: &ScoringEngine) -> Result<()> {
    let entries = engine.leaderboard(args.limit)?;
    emit_json(serde_json::json!({ "entries": entries }))
}

fn run_random_joke(engine: &ScoringEngine) -> Result<()> {
    let Some(joke) = engine.random_joke()? else {
        return Err(anyhow!("no jokes recorded yet"));
    };
    emit_json(serde_json::json!({ "joke": joke }))
}

fn run_best_joke(engine: &ScoringEngine) -> Result<()> {
    let Some(joke) = engine.best_joke()? else {
        return Err(anyhow!("no jokes recorded yet"));
    };
    emit_json(serde_json::json!({ "joke": joke }))
}

fn run_my_rank(args: &MyRankArgs, engine: &ScoringEngine) -> Result<()> {
    let user_id = UserId::new(&args.user_id);
    let Some(user) = engine.user_rank(&user_id)? else {
        return Err(anyhow!("user {} has no jokes yet", args.user_id));
    };
    emit_json(serde_json::json!({ "user": user }))
}

fn run_db(command: DbCommand, engine: &ScoringEngine) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = engine.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = engine.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result)?)
        }
        DbCommand::Export(args) => {
            let manifest = engine.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = engine.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            engine.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            engine.restore_database(&args.input)?;
            let status = engine.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = engine.integrity_check()?;
            emit_json(serde_json::to_value(&report)?)
        }
    }
}
