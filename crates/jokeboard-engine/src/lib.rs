use std::path::PathBuf;

use anyhow::{Context, Result};
use jokeboard_core::{
    BoardConfig, MessageId, RankTier, ScoringError, UserId, VoteEvent, VoteOutcome, VoteReceipt,
};
use jokeboard_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, JokeAggregate, SchemaStatus, SqliteStore,
    UserAggregate,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const ENGINE_CONTRACT_VERSION: &str = "engine.v1";

/// A reply-command submission before normalization.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankCommand {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub voter_id: UserId,
    pub points: i64,
}

/// An emoji reaction before normalization through the weight table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReactionEvent {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub voter_id: UserId,
    pub reaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeaderboardEntry {
    pub position: usize,
    pub user_id: UserId,
    pub user_name: String,
    pub score: i64,
    pub rank: RankTier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Orchestrates one vote event end to end: ledger dedup, the two
/// aggregate upserts, and the rank transition. Single-process; all
/// cross-task serialization is pushed down to the store's atomic
/// insert and upsert-with-increment primitives, so the engine holds no
/// locks and opens a fresh store handle per call.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    db_path: PathBuf,
    config: BoardConfig,
}

impl ScoringEngine {
    #[must_use]
    pub fn new(db_path: PathBuf, config: BoardConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Apply one pre-validated vote event.
    ///
    /// The ledger insert is the only serialization point: of concurrent
    /// calls for the same (joke, voter) pair exactly one proceeds past it,
    /// the rest terminate as [`VoteOutcome::AlreadyVoted`] without any
    /// mutation. Once that insert commits, a failure in a later step
    /// leaves the vote durably recorded while the aggregates lag; there is
    /// no cross-store transaction. Two racing accepted votes for one
    /// author may both observe a tier boundary crossing and both report a
    /// rank change; the persisted rank still converges because it is
    /// recomputed from the post-increment score.
    ///
    /// Callers are expected to have excluded self-votes and zero-weight
    /// reactions already; the engine is voter-agnostic.
    ///
    /// # Errors
    /// Returns an error for an invalid delta, a store failure, or a joke
    /// aggregate attributed to a different author than the event names.
    pub fn apply_vote(&self, event: &VoteEvent) -> Result<VoteOutcome> {
        event.validate()?;

        let mut store = self.open_store()?;
        store.migrate()?;

        if !store.try_record_vote(&event.message_id, &event.voter_id)? {
            info!(
                message_id = %event.message_id,
                voter_id = %event.voter_id,
                "duplicate vote ignored"
            );
            return Ok(VoteOutcome::AlreadyVoted);
        }

        let joke_score = store
            .apply_joke_delta(event)
            .context("vote recorded but joke aggregate update failed")?;
        self.assert_joke_attribution(&store, event)?;

        let credit = store
            .credit_author(event)
            .context("vote recorded but author aggregate update failed")?;

        let new_rank = RankTier::for_score(credit.score_after);
        let rank_change = RankTier::change_between(credit.rank_before, new_rank);
        if rank_change.is_some() {
            store
                .set_user_rank(&event.author_id, new_rank)
                .context("vote applied but rank transition write failed")?;
        }

        info!(
            message_id = %event.message_id,
            voter_id = %event.voter_id,
            delta = event.delta,
            joke_score,
            author_score = credit.score_after,
            rank = %new_rank,
            "vote accepted"
        );

        Ok(VoteOutcome::Accepted(VoteReceipt {
            joke_score,
            author_score: credit.score_after,
            author_rank: new_rank,
            rank_change,
        }))
    }

    /// Normalize and apply a reply-command vote.
    ///
    /// # Errors
    /// Returns an error for a self-vote under the configured policy, an
    /// invalid delta, or a store failure.
    pub fn rank_command(&self, command: &RankCommand) -> Result<VoteOutcome> {
        let event = VoteEvent::from_command(
            command.message_id.clone(),
            command.author_id.clone(),
            command.author_name.clone(),
            command.content.clone(),
            command.voter_id.clone(),
            command.points,
            &self.config,
        )?;
        self.apply_vote(&event)
    }

    /// Normalize and apply a reaction vote. `Ok(None)` means the reaction
    /// was filtered at the boundary (unknown emoji, zero weight, or a
    /// policy-excluded self-vote) and never reached the scoring pipeline.
    ///
    /// # Errors
    /// Returns an error for a malformed weight table or a store failure.
    pub fn rank_reaction(&self, reaction: &ReactionEvent) -> Result<Option<VoteOutcome>> {
        let Some(event) = VoteEvent::from_reaction(
            reaction.message_id.clone(),
            reaction.author_id.clone(),
            reaction.author_name.clone(),
            reaction.content.clone(),
            reaction.voter_id.clone(),
            &reaction.reaction,
            &self.config,
        )?
        else {
            return Ok(None);
        };

        self.apply_vote(&event).map(Some)
    }

    /// Top users by score descending. `limit` defaults to the configured
    /// leaderboard size.
    ///
    /// # Errors
    /// Returns an error when the store query fails.
    pub fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<LeaderboardEntry>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let users = store.top_users(limit.unwrap_or(self.config.leaderboard_limit))?;
        Ok(users
            .into_iter()
            .enumerate()
            .map(|(index, user)| LeaderboardEntry {
                position: index + 1,
                user_id: user.user_id,
                user_name: user.user_name,
                score: user.score,
                rank: user.rank,
            })
            .collect())
    }

    /// Fetch one random stored joke.
    ///
    /// # Errors
    /// Returns an error when the store query fails.
    pub fn random_joke(&self) -> Result<Option<JokeAggregate>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.random_joke()
    }

    /// Fetch the highest scoring joke.
    ///
    /// # Errors
    /// Returns an error when the store query fails.
    pub fn best_joke(&self) -> Result<Option<JokeAggregate>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.best_joke()
    }

    /// Fetch one user's aggregate (score, rank, authored set).
    ///
    /// # Errors
    /// Returns an error when the store query fails.
    pub fn user_rank(&self, user_id: &UserId) -> Result<Option<UserAggregate>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_user(user_id)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Export the three record kinds as NDJSON with a digest manifest.
    ///
    /// # Errors
    /// Returns an error when the export fails.
    pub fn export_snapshot(&self, out_dir: &std::path::Path) -> Result<ExportManifest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.export_snapshot(out_dir)
    }

    /// Import a verified snapshot directory.
    ///
    /// # Errors
    /// Returns an error when manifest validation or any insert fails.
    pub fn import_snapshot(
        &self,
        in_dir: &std::path::Path,
        skip_existing: bool,
    ) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.import_snapshot(in_dir, skip_existing)
    }

    /// Copy the live database into a standalone backup file.
    ///
    /// # Errors
    /// Returns an error when the backup fails.
    pub fn backup_database(&self, out_file: &std::path::Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// Replace the database contents from a backup file.
    ///
    /// # Errors
    /// Returns an error when the restore or the follow-up migration fails.
    pub fn restore_database(&self, in_file: &std::path::Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// Run store integrity probes, including the ledger/aggregate
    /// consistency report.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    // First-write-wins means a later event naming a different author for
    // an existing joke signals a gateway-level bug, not a score update.
    fn assert_joke_attribution(&self, store: &SqliteStore, event: &VoteEvent) -> Result<()> {
        let Some(joke) = store.get_joke(&event.message_id)? else {
            return Err(ScoringError::Inconsistent(format!(
                "joke aggregate missing immediately after upsert for {}",
                event.message_id
            ))
            .into());
        };
        if joke.author_id != event.author_id {
            warn!(
                message_id = %event.message_id,
                stored_author = %joke.author_id,
                event_author = %event.author_id,
                "joke attribution mismatch"
            );
            return Err(ScoringError::Inconsistent(format!(
                "joke {} is attributed to {} but the event names {}",
                event.message_id, joke.author_id, event.author_id
            ))
            .into());
        }
        Ok(())
    }
}
