use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const MIN_DELTA: i64 = -100;
pub const MAX_DELTA: i64 = 100;

pub const DEFAULT_LEADERBOARD_LIMIT: usize = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ScoringError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("inconsistent aggregate: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The seven score tiers. Variant order is the tier order used for
/// promotion/demotion classification; never compare tiers by score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RankTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
    Ascendant,
    Grandmaster,
}

impl RankTier {
    pub const ALL: [Self; 7] = [
        Self::Bronze,
        Self::Silver,
        Self::Gold,
        Self::Platinum,
        Self::Diamond,
        Self::Ascendant,
        Self::Grandmaster,
    ];

    /// Inclusive lower score bound of the tier.
    #[must_use]
    pub fn min_score(self) -> i64 {
        match self {
            Self::Bronze => i64::MIN,
            Self::Silver => 501,
            Self::Gold => 1001,
            Self::Platinum => 1501,
            Self::Diamond => 2001,
            Self::Ascendant => 2501,
            Self::Grandmaster => 3001,
        }
    }

    /// Highest tier whose lower bound is `<= score`. Total and monotonic.
    #[must_use]
    pub fn for_score(score: i64) -> Self {
        let mut tier = Self::Bronze;
        for candidate in Self::ALL {
            if score >= candidate.min_score() {
                tier = candidate;
            }
        }
        tier
    }

    /// Direction of a rank recomputation, classified by tier order.
    #[must_use]
    pub fn change_between(before: Self, after: Self) -> Option<RankChange> {
        match before.cmp(&after) {
            std::cmp::Ordering::Less => Some(RankChange::Promoted),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(RankChange::Demoted),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "Bronze",
            Self::Silver => "Silver",
            Self::Gold => "Gold",
            Self::Platinum => "Platinum",
            Self::Diamond => "Diamond",
            Self::Ascendant => "Ascendant",
            Self::Grandmaster => "Grandmaster",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Bronze" => Some(Self::Bronze),
            "Silver" => Some(Self::Silver),
            "Gold" => Some(Self::Gold),
            "Platinum" => Some(Self::Platinum),
            "Diamond" => Some(Self::Diamond),
            "Ascendant" => Some(Self::Ascendant),
            "Grandmaster" => Some(Self::Grandmaster),
            _ => None,
        }
    }
}

impl Display for RankTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RankChange {
    Promoted,
    Demoted,
}

impl RankChange {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promoted => "promoted",
            Self::Demoted => "demoted",
        }
    }
}

/// Whether a voter may rank their own joke. The original bot rejected
/// self-votes on the reply-command path but not on the reaction path;
/// here the policy is explicit and applied uniformly at both normalizers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SelfVotePolicy {
    #[default]
    Reject,
    Allow,
}

/// Immutable process configuration: the reaction weight table, the
/// self-vote policy, and the leaderboard size. Loaded once at startup and
/// passed by reference; never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BoardConfig {
    #[serde(default = "default_reaction_weights")]
    pub reaction_weights: BTreeMap<String, i64>,
    #[serde(default)]
    pub self_vote: SelfVotePolicy,
    #[serde(default = "default_leaderboard_limit")]
    pub leaderboard_limit: usize,
}

fn default_leaderboard_limit() -> usize {
    DEFAULT_LEADERBOARD_LIMIT
}

fn default_reaction_weights() -> BTreeMap<String, i64> {
    let weights = [
        ("\u{1f602}", 40),
        ("1_Hentai", 50),
        ("dp", 10),
        ("ME", 15),
        ("boss", 30),
        ("kodak", -20),
        ("\u{1f913}", -10),
        ("mikejak", 3),
        ("\u{1f612}", -15),
    ];
    weights.into_iter().map(|(name, weight)| (name.to_string(), weight)).collect()
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            reaction_weights: default_reaction_weights(),
            self_vote: SelfVotePolicy::default(),
            leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }
}

impl BoardConfig {
    /// Check weight-table and limit invariants. A zero weight is rejected
    /// here so a zero-delta event can never be constructed from a reaction.
    ///
    /// # Errors
    /// Returns [`ScoringError::Validation`] for zero or out-of-range weights
    /// or a zero leaderboard limit.
    pub fn validate(&self) -> Result<(), ScoringError> {
        for (name, weight) in &self.reaction_weights {
            if *weight == 0 {
                return Err(ScoringError::Validation(format!(
                    "reaction {name} has zero weight; remove it instead"
                )));
            }
            if !(MIN_DELTA..=MAX_DELTA).contains(weight) {
                return Err(ScoringError::Validation(format!(
                    "reaction {name} weight {weight} is outside [{MIN_DELTA}, {MAX_DELTA}]"
                )));
            }
        }

        if self.leaderboard_limit == 0 {
            return Err(ScoringError::Validation(
                "leaderboard_limit MUST be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load and validate a configuration file (JSON). Missing fields fall
    /// back to the built-in defaults.
    ///
    /// # Errors
    /// Returns [`ScoringError::Validation`] when the file cannot be read,
    /// parsed, or fails [`BoardConfig::validate`].
    pub fn load(path: &Path) -> Result<Self, ScoringError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ScoringError::Validation(format!("failed to read config {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            ScoringError::Validation(format!("failed to parse config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn weight_for(&self, reaction: &str) -> Option<i64> {
        self.reaction_weights.get(reaction).copied()
    }
}

/// The single normalized event shape both event sources reduce to.
///
/// Contract with the scoring engine: the constructor paths
/// ([`VoteEvent::from_command`] and [`VoteEvent::from_reaction`]) have
/// already excluded self-votes per policy and zero-weight reactions; the
/// engine itself is voter-agnostic and only re-checks the delta range.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteEvent {
    pub message_id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub voter_id: UserId,
    pub delta: i64,
}

impl VoteEvent {
    /// Validate identity and delta-range invariants.
    ///
    /// # Errors
    /// Returns [`ScoringError::Validation`] for empty ids, a zero delta, or
    /// a delta outside `[MIN_DELTA, MAX_DELTA]`.
    pub fn validate(&self) -> Result<(), ScoringError> {
        if self.message_id.as_str().trim().is_empty() {
            return Err(ScoringError::Validation("message_id MUST be non-empty".to_string()));
        }
        if self.author_id.as_str().trim().is_empty() {
            return Err(ScoringError::Validation("author_id MUST be non-empty".to_string()));
        }
        if self.voter_id.as_str().trim().is_empty() {
            return Err(ScoringError::Validation("voter_id MUST be non-empty".to_string()));
        }
        if self.delta == 0 {
            return Err(ScoringError::Validation("delta MUST be non-zero".to_string()));
        }
        if !(MIN_DELTA..=MAX_DELTA).contains(&self.delta) {
            return Err(ScoringError::Validation(format!(
                "delta {} is outside [{MIN_DELTA}, {MAX_DELTA}]",
                self.delta
            )));
        }

        Ok(())
    }

    /// Normalize a reply-command submission (`!rankjoke [points]` in the
    /// original bot) into a vote event.
    ///
    /// # Errors
    /// Returns [`ScoringError::Validation`] for a self-vote under the
    /// configured policy or for an invalid delta.
    #[allow(clippy::too_many_arguments)]
    pub fn from_command(
        message_id: MessageId,
        author_id: UserId,
        author_name: impl Into<String>,
        content: impl Into<String>,
        voter_id: UserId,
        points: i64,
        config: &BoardConfig,
    ) -> Result<Self, ScoringError> {
        if config.self_vote == SelfVotePolicy::Reject && voter_id == author_id {
            return Err(ScoringError::Validation(
                "you cannot rank your own joke".to_string(),
            ));
        }

        let event = Self {
            message_id,
            author_id,
            author_name: author_name.into(),
            content: content.into(),
            voter_id,
            delta: points,
        };
        event.validate()?;
        Ok(event)
    }

    /// Normalize an emoji reaction into a vote event via the configured
    /// weight table. `Ok(None)` means the reaction is a no-op signal:
    /// unknown emoji, a (defensively filtered) zero weight, or a self-vote
    /// excluded by policy.
    ///
    /// # Errors
    /// Returns [`ScoringError::Validation`] when a configured weight falls
    /// outside the delta range (a config that escaped validation).
    #[allow(clippy::too_many_arguments)]
    pub fn from_reaction(
        message_id: MessageId,
        author_id: UserId,
        author_name: impl Into<String>,
        content: impl Into<String>,
        voter_id: UserId,
        reaction: &str,
        config: &BoardConfig,
    ) -> Result<Option<Self>, ScoringError> {
        let Some(weight) = config.weight_for(reaction) else {
            return Ok(None);
        };
        if weight == 0 {
            return Ok(None);
        }
        if config.self_vote == SelfVotePolicy::Reject && voter_id == author_id {
            return Ok(None);
        }

        let event = Self {
            message_id,
            author_id,
            author_name: author_name.into(),
            content: content.into(),
            voter_id,
            delta: weight,
        };
        event.validate()?;
        Ok(Some(event))
    }
}

/// Data handed to the notification sink for an accepted vote.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VoteReceipt {
    pub joke_score: i64,
    pub author_score: i64,
    pub author_rank: RankTier,
    pub rank_change: Option<RankChange>,
}

/// Terminal state of one vote event.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "result", content = "receipt", rename_all = "snake_case")]
pub enum VoteOutcome {
    AlreadyVoted,
    Accepted(VoteReceipt),
}

impl VoteOutcome {
    #[must_use]
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

#[must_use]
pub fn confirmation_line(author_name: &str, delta: i64, receipt: &VoteReceipt) -> String {
    format!(
        "Added {delta} point(s) to {author_name}'s joke. They now have {} total point(s) and are {}.",
        receipt.author_score, receipt.author_rank
    )
}

#[must_use]
pub fn rank_change_line(author_name: &str, rank: RankTier, change: RankChange) -> String {
    match change {
        RankChange::Promoted => {
            format!("\u{1f389} Congratulations {author_name}, you've been promoted to {rank}!")
        }
        RankChange::Demoted => {
            format!("\u{1f622} Uh oh, {author_name}, you've been demoted to {rank}. Keep trying!")
        }
    }
}

#[must_use]
pub fn already_voted_line() -> String {
    "You have already ranked this joke.".to_string()
}
