use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use jokeboard_core::{MessageId, RankTier, UserId, VoteEvent};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS votes (
  joke_message_id TEXT NOT NULL,
  voter_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(joke_message_id, voter_id)
);

CREATE TABLE IF NOT EXISTS jokes (
  message_id TEXT PRIMARY KEY,
  author_id TEXT NOT NULL,
  author_name TEXT NOT NULL,
  content TEXT NOT NULL,
  score INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  user_name TEXT NOT NULL,
  score INTEGER NOT NULL DEFAULT 0,
  rank TEXT NOT NULL CHECK (rank IN ('Bronze','Silver','Gold','Platinum','Diamond','Ascendant','Grandmaster'))
);

CREATE TABLE IF NOT EXISTS user_jokes (
  user_id TEXT NOT NULL,
  joke_message_id TEXT NOT NULL,
  UNIQUE(user_id, joke_message_id)
);

CREATE INDEX IF NOT EXISTS idx_jokes_score ON jokes(score);
CREATE INDEX IF NOT EXISTS idx_users_score ON users(score);
CREATE INDEX IF NOT EXISTS idx_user_jokes_user ON user_jokes(user_id);
";

pub struct SqliteStore {
    conn: Connection,
}

/// Ledger row: one accepted (joke, voter) pair. Written once, never
/// updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteRecord {
    pub joke_message_id: MessageId,
    pub voter_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Per-joke aggregate. Snapshot fields are captured from the first
/// accepted vote and never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JokeAggregate {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub score: i64,
}

/// Per-user aggregate. `jokes` is a set of authored message ids.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserAggregate {
    pub user_id: UserId,
    pub user_name: String,
    pub jokes: Vec<MessageId>,
    pub score: i64,
    pub rank: RankTier,
}

/// Result of the atomic author-credit upsert: the score after the
/// increment and the rank that was stored before it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AuthorCredit {
    pub score_after: i64,
    pub rank_before: RankTier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_jokes: usize,
    pub skipped_existing_jokes: usize,
    pub imported_users: usize,
    pub skipped_existing_users: usize,
    pub imported_votes: usize,
    pub skipped_existing_votes: usize,
}

/// A user whose aggregate score disagrees with the sum of their jokes'
/// scores.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreMismatch {
    pub user_id: UserId,
    pub aggregate_score: i64,
    pub jokes_score_sum: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Ledger entries whose joke aggregate is missing. This is the
    /// tolerated window between a committed ledger insert and the
    /// aggregate upserts; reported, never fatal.
    pub unaggregated_votes: usize,
    pub score_mismatches: Vec<ScoreMismatch>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed board store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Attempt to create the ledger record for a (joke, voter) pair.
    ///
    /// The pair uniqueness constraint makes the insert the single
    /// serialization point for duplicate votes: of any number of
    /// overlapping calls with the same pair, exactly one observes `true`.
    /// A conflict means "already voted", never an error.
    ///
    /// # Errors
    /// Returns an error when the insert fails for any reason other than
    /// the uniqueness constraint.
    pub fn try_record_vote(&mut self, message_id: &MessageId, voter_id: &UserId) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO votes(joke_message_id, voter_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![message_id.as_str(), voter_id.as_str(), now_rfc3339()?],
            )
            .context("failed to insert vote record")?;
        Ok(inserted == 1)
    }

    /// Apply a signed delta to the joke aggregate, creating it from the
    /// event snapshot when absent. Snapshot fields are written only on
    /// insert (first-write-wins); on conflict only the score moves, as a
    /// single atomic add at the store. Returns the score after the delta.
    ///
    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn apply_joke_delta(&mut self, event: &VoteEvent) -> Result<i64> {
        let score = self
            .conn
            .query_row(
                "INSERT INTO jokes(message_id, author_id, author_name, content, score)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id) DO UPDATE SET score = score + excluded.score
                 RETURNING score",
                params![
                    event.message_id.as_str(),
                    event.author_id.as_str(),
                    event.author_name,
                    event.content,
                    event.delta,
                ],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to upsert joke aggregate")?;
        Ok(score)
    }

    /// Credit the author aggregate with the event's delta and record the
    /// joke in their authored set. The increment and the read-back of
    /// `(score, rank)` happen in one statement, so `score_after` is the
    /// post-increment value and `rank_before` is the rank stored prior to
    /// any transition write. New authors start at the lowest tier.
    ///
    /// # Errors
    /// Returns an error when the upsert fails or a stored rank label does
    /// not decode.
    pub fn credit_author(&mut self, event: &VoteEvent) -> Result<AuthorCredit> {
        let tx = self.conn.transaction().context("failed to start credit transaction")?;

        let (score_after, rank_raw) = tx
            .query_row(
                "INSERT INTO users(user_id, user_name, score, rank)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET score = score + excluded.score
                 RETURNING score, rank",
                params![
                    event.author_id.as_str(),
                    event.author_name,
                    event.delta,
                    RankTier::Bronze.as_str(),
                ],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .context("failed to upsert user aggregate")?;

        tx.execute(
            "INSERT OR IGNORE INTO user_jokes(user_id, joke_message_id) VALUES (?1, ?2)",
            params![event.author_id.as_str(), event.message_id.as_str()],
        )
        .context("failed to record authored joke")?;

        tx.commit().context("failed to commit credit transaction")?;

        let rank_before = parse_rank(&rank_raw)?;
        Ok(AuthorCredit { score_after, rank_before })
    }

    /// Persist a recomputed rank for a user.
    ///
    /// # Errors
    /// Returns an error when the update fails or the user row is missing.
    pub fn set_user_rank(&mut self, user_id: &UserId, rank: RankTier) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE users SET rank = ?1 WHERE user_id = ?2",
                params![rank.as_str(), user_id.as_str()],
            )
            .context("failed to update user rank")?;
        if updated == 0 {
            return Err(anyhow!("no user aggregate exists for {user_id}"));
        }
        Ok(())
    }

    /// Fetch one uniformly random joke aggregate, if any exist.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn random_joke(&self) -> Result<Option<JokeAggregate>> {
        self.joke_query("SELECT message_id, author_id, author_name, content, score
             FROM jokes ORDER BY RANDOM() LIMIT 1")
    }

    /// Fetch the single highest-score joke, tie-broken by message id.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn best_joke(&self) -> Result<Option<JokeAggregate>> {
        self.joke_query(
            "SELECT message_id, author_id, author_name, content, score
             FROM jokes ORDER BY score DESC, message_id ASC LIMIT 1",
        )
    }

    /// Fetch a joke aggregate by message id.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_joke(&self, message_id: &MessageId) -> Result<Option<JokeAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, author_id, author_name, content, score
             FROM jokes WHERE message_id = ?1",
        )?;
        let joke = stmt
            .query_row(params![message_id.as_str()], |row| {
                Ok(JokeAggregate {
                    message_id: MessageId::new(row.get::<_, String>(0)?),
                    author_id: UserId::new(row.get::<_, String>(1)?),
                    author_name: row.get(2)?,
                    content: row.get(3)?,
                    score: row.get(4)?,
                })
            })
            .optional()?;
        Ok(joke)
    }

    /// Fetch the top users by score descending, tie-broken by user id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn top_users(&self, limit: usize) -> Result<Vec<UserAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, user_name, score, rank
             FROM users ORDER BY score DESC, user_id ASC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (user_id_raw, user_name, score, rank_raw) = row?;
            let user_id = UserId::new(user_id_raw);
            let jokes = self.authored_jokes(&user_id)?;
            users.push(UserAggregate {
                user_id,
                user_name,
                jokes,
                score,
                rank: parse_rank(&rank_raw)?,
            });
        }
        Ok(users)
    }

    /// Fetch one user aggregate by id.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored rank label does
    /// not decode.
    pub fn get_user(&self, user_id: &UserId) -> Result<Option<UserAggregate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_name, score, rank FROM users WHERE user_id = ?1")?;
        let row = stmt
            .query_row(params![user_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })
            .optional()?;

        match row {
            Some((user_name, score, rank_raw)) => Ok(Some(UserAggregate {
                user_id: user_id.clone(),
                user_name,
                jokes: self.authored_jokes(user_id)?,
                score,
                rank: parse_rank(&rank_raw)?,
            })),
            None => Ok(None),
        }
    }

    /// Export all three record kinds as deterministic NDJSON plus a
    /// sha256 manifest. Field names in the NDJSON rows are the wire
    /// contract for store migration and round-trip exactly.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created or written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let jokes = self.list_jokes()?;
        let users = self.list_users()?;
        let votes = self.list_votes()?;

        let joke_digest = write_ndjson_file(&out_dir.join("jokes.ndjson"), &jokes)?;
        let user_digest = write_ndjson_file(&out_dir.join("users.ndjson"), &users)?;
        let vote_digest = write_ndjson_file(&out_dir.join("votes.ndjson"), &votes)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "jokes.ndjson".to_string(),
                    sha256: joke_digest.0,
                    records: joke_digest.1,
                },
                ExportFileDigest {
                    path: "users.ndjson".to_string(),
                    sha256: user_digest.0,
                    records: user_digest.1,
                },
                ExportFileDigest {
                    path: "votes.ndjson".to_string(),
                    sha256: vote_digest.0,
                    records: vote_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database after
    /// verifying the manifest digests.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing, or
    /// (with `skip_existing = false`) duplicate keys fail the import.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let mut summary = ImportSummary::default();

        for joke in read_ndjson_file::<JokeAggregate>(&in_dir.join("jokes.ndjson"))? {
            if self.get_joke(&joke.message_id)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_jokes += 1;
                    continue;
                }
                return Err(anyhow!("joke already exists for message_id {}", joke.message_id));
            }
            self.conn
                .execute(
                    "INSERT INTO jokes(message_id, author_id, author_name, content, score)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        joke.message_id.as_str(),
                        joke.author_id.as_str(),
                        joke.author_name,
                        joke.content,
                        joke.score,
                    ],
                )
                .context("failed to import joke aggregate")?;
            summary.imported_jokes += 1;
        }

        for user in read_ndjson_file::<UserAggregate>(&in_dir.join("users.ndjson"))? {
            if self.get_user(&user.user_id)?.is_some() {
                if skip_existing {
                    summary.skipped_existing_users += 1;
                    continue;
                }
                return Err(anyhow!("user already exists for user_id {}", user.user_id));
            }
            self.conn
                .execute(
                    "INSERT INTO users(user_id, user_name, score, rank) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        user.user_id.as_str(),
                        user.user_name,
                        user.score,
                        user.rank.as_str()
                    ],
                )
                .context("failed to import user aggregate")?;
            for joke_message_id in &user.jokes {
                self.conn
                    .execute(
                        "INSERT OR IGNORE INTO user_jokes(user_id, joke_message_id)
                         VALUES (?1, ?2)",
                        params![user.user_id.as_str(), joke_message_id.as_str()],
                    )
                    .context("failed to import authored joke set")?;
            }
            summary.imported_users += 1;
        }

        for vote in read_ndjson_file::<VoteRecord>(&in_dir.join("votes.ndjson"))? {
            let inserted = self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO votes(joke_message_id, voter_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![
                        vote.joke_message_id.as_str(),
                        vote.voter_id.as_str(),
                        rfc3339(vote.created_at)?,
                    ],
                )
                .context("failed to import vote record")?;
            if inserted == 1 {
                summary.imported_votes += 1;
            } else if skip_existing {
                summary.skipped_existing_votes += 1;
            } else {
                return Err(anyhow!(
                    "vote already exists for ({}, {})",
                    vote.joke_message_id,
                    vote.voter_id
                ));
            }
        }

        Ok(summary)
    }

    /// Copy the live database into a standalone `SQLite` file.
    ///
    /// # Errors
    /// Returns an error when the destination cannot be created or the
    /// backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check plus aggregate consistency probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let unaggregated_votes: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM votes v
                 WHERE NOT EXISTS (SELECT 1 FROM jokes j WHERE j.message_id = v.joke_message_id)",
                [],
                |row| row.get(0),
            )
            .context("failed to count unaggregated votes")?;

        let mut stmt = self.conn.prepare(
            "SELECT u.user_id, u.score, COALESCE(SUM(j.score), 0) AS joke_sum
             FROM users u
             LEFT JOIN user_jokes uj ON uj.user_id = u.user_id
             LEFT JOIN jokes j ON j.message_id = uj.joke_message_id
             GROUP BY u.user_id, u.score
             HAVING u.score != COALESCE(SUM(j.score), 0)
             ORDER BY u.user_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ScoreMismatch {
                user_id: UserId::new(row.get::<_, String>(0)?),
                aggregate_score: row.get(1)?,
                jokes_score_sum: row.get(2)?,
            })
        })?;

        let mut score_mismatches = Vec::new();
        for row in rows {
            score_mismatches.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            unaggregated_votes: usize::try_from(unaggregated_votes).unwrap_or(0),
            score_mismatches,
            schema_status,
        })
    }

    fn joke_query(&self, sql: &str) -> Result<Option<JokeAggregate>> {
        let mut stmt = self.conn.prepare(sql)?;
        let joke = stmt
            .query_row([], |row| {
                Ok(JokeAggregate {
                    message_id: MessageId::new(row.get::<_, String>(0)?),
                    author_id: UserId::new(row.get::<_, String>(1)?),
                    author_name: row.get(2)?,
                    content: row.get(3)?,
                    score: row.get(4)?,
                })
            })
            .optional()?;
        Ok(joke)
    }

    fn authored_jokes(&self, user_id: &UserId) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn.prepare(
            "SELECT joke_message_id FROM user_jokes
             WHERE user_id = ?1 ORDER BY joke_message_id ASC",
        )?;
        let rows = stmt
            .query_map(params![user_id.as_str()], |row| Ok(MessageId::new(row.get::<_, String>(0)?)))?;

        let mut jokes = Vec::new();
        for row in rows {
            jokes.push(row?);
        }
        Ok(jokes)
    }

    fn list_jokes(&self) -> Result<Vec<JokeAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, author_id, author_name, content, score
             FROM jokes ORDER BY message_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(JokeAggregate {
                message_id: MessageId::new(row.get::<_, String>(0)?),
                author_id: UserId::new(row.get::<_, String>(1)?),
                author_name: row.get(2)?,
                content: row.get(3)?,
                score: row.get(4)?,
            })
        })?;

        let mut jokes = Vec::new();
        for row in rows {
            jokes.push(row?);
        }
        Ok(jokes)
    }

    fn list_users(&self) -> Result<Vec<UserAggregate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, user_name, score, rank FROM users ORDER BY user_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (user_id_raw, user_name, score, rank_raw) = row?;
            let user_id = UserId::new(user_id_raw);
            let jokes = self.authored_jokes(&user_id)?;
            users.push(UserAggregate {
                user_id,
                user_name,
                jokes,
                score,
                rank: parse_rank(&rank_raw)?,
            });
        }
        Ok(users)
    }

    fn list_votes(&self) -> Result<Vec<VoteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT joke_message_id, voter_id, created_at
             FROM votes ORDER BY joke_message_id ASC, voter_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut votes = Vec::new();
        for row in rows {
            let (joke_message_id, voter_id, created_at) = row?;
            votes.push(VoteRecord {
                joke_message_id: MessageId::new(joke_message_id),
                voter_id: UserId::new(voter_id),
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(votes)
    }
}

fn parse_rank(raw: &str) -> Result<RankTier> {
    RankTier::parse(raw).ok_or_else(|| anyhow!("stored rank label does not decode: {raw}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in ["jokes.ndjson", "users.ndjson", "votes.ndjson"] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
