//! Key-value backend contract.
//!
//! The mapper talks to the store exclusively through [`Connector`]:
//! single commands and atomic pipelines of [`Command`]s, answered by
//! [`Reply`]s. Composite operations that must observe and mutate state
//! atomically (unique resolution, multi-model commits) are expressed as
//! server-side [`Script`]s.
//!
//! All operations integrate with asupersync's structured concurrency via
//! `Cx` for cancellation.

use asupersync::{Cx, Outcome};

use crate::commit::{CommitReply, ModelCommit};
use crate::error::{BackendError, BackendErrorKind, Error, Result};

/// Score combination for sorted-set store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    #[default]
    Sum,
    Min,
    Max,
}

/// Server-side atomic scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// Look up `values` in the unique hash and store the ids found into
    /// `dest`. With `ids` set, found ids are promoted to a sorted set
    /// scored from that sorted set. Missing values resolve to nothing.
    ResolveUnique {
        hash: String,
        values: Vec<String>,
        dest: String,
        ids: Option<String>,
    },
    /// Apply one model's deletes and writes.
    Commit(ModelCommit),
}

/// A single store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get(String),
    Set(String, String),
    Del(Vec<String>),
    Exists(String),
    /// Expire after the given number of seconds.
    Expire(String, u64),
    Ttl(String),
    Incr(String),

    SAdd(String, Vec<String>),
    SRem(String, Vec<String>),
    SMembers(String),
    SCard(String),
    SIsMember(String, String),
    SInterStore { dest: String, keys: Vec<String> },
    SUnionStore { dest: String, keys: Vec<String> },
    SDiffStore { dest: String, keys: Vec<String> },

    ZAdd(String, Vec<(f64, String)>),
    ZRem(String, Vec<String>),
    ZRange { key: String, start: i64, stop: i64, rev: bool },
    ZCard(String),
    ZScore(String, String),
    ZInterStore {
        dest: String,
        keys: Vec<String>,
        weights: Option<Vec<f64>>,
        aggregate: Aggregate,
    },
    ZUnionStore {
        dest: String,
        keys: Vec<String>,
        weights: Option<Vec<f64>>,
        aggregate: Aggregate,
    },
    ZDiffStore { dest: String, keys: Vec<String> },

    HSet(String, Vec<(String, String)>),
    HGet(String, String),
    HDel(String, Vec<String>),
    HGetAll(String),
    HMGet(String, Vec<String>),

    RPush(String, Vec<String>),
    LRange { key: String, start: i64, stop: i64 },
    LLen(String),

    /// `SORT key [BY pattern] [ALPHA] [DESC] [STORE dest]`
    Sort {
        key: String,
        by: Option<String>,
        desc: bool,
        alpha: bool,
        store: Option<String>,
    },

    Eval(Script),
}

impl Command {
    /// Command name as the store would log it.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get(_) => "GET",
            Command::Set(..) => "SET",
            Command::Del(_) => "DEL",
            Command::Exists(_) => "EXISTS",
            Command::Expire(..) => "EXPIRE",
            Command::Ttl(_) => "TTL",
            Command::Incr(_) => "INCR",
            Command::SAdd(..) => "SADD",
            Command::SRem(..) => "SREM",
            Command::SMembers(_) => "SMEMBERS",
            Command::SCard(_) => "SCARD",
            Command::SIsMember(..) => "SISMEMBER",
            Command::SInterStore { .. } => "SINTERSTORE",
            Command::SUnionStore { .. } => "SUNIONSTORE",
            Command::SDiffStore { .. } => "SDIFFSTORE",
            Command::ZAdd(..) => "ZADD",
            Command::ZRem(..) => "ZREM",
            Command::ZRange { .. } => "ZRANGE",
            Command::ZCard(_) => "ZCARD",
            Command::ZScore(..) => "ZSCORE",
            Command::ZInterStore { .. } => "ZINTERSTORE",
            Command::ZUnionStore { .. } => "ZUNIONSTORE",
            Command::ZDiffStore { .. } => "ZDIFFSTORE",
            Command::HSet(..) => "HSET",
            Command::HGet(..) => "HGET",
            Command::HDel(..) => "HDEL",
            Command::HGetAll(_) => "HGETALL",
            Command::HMGet(..) => "HMGET",
            Command::RPush(..) => "RPUSH",
            Command::LRange { .. } => "LRANGE",
            Command::LLen(_) => "LLEN",
            Command::Sort { .. } => "SORT",
            Command::Eval(_) => "EVAL",
        }
    }
}

/// Reply to one command.
#[derive(Debug, Clone)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
    Optional(Vec<Option<String>>),
    Pairs(Vec<(String, String)>),
    Commit(CommitReply),
    /// Command-level failure; the rest of the pipeline still ran.
    Error(String),
}

impl Reply {
    fn unexpected(self, expected: &str) -> Error {
        match self {
            Reply::Error(message) => reply_error(message),
            other => Error::protocol(format!("expected {expected} reply, got {other:?}")),
        }
    }

    /// Fail on `Reply::Error`, accept anything else.
    pub fn check(self) -> Result<Self> {
        match self {
            Reply::Error(message) => Err(reply_error(message)),
            other => Ok(other),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            Reply::Int(v) => Ok(v),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        self.into_int().map(|v| v != 0)
    }

    /// `Nil` reads as `None`.
    pub fn into_opt_float(self) -> Result<Option<f64>> {
        match self {
            Reply::Float(v) => Ok(Some(v)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected("float")),
        }
    }

    pub fn into_opt_text(self) -> Result<Option<String>> {
        match self {
            Reply::Text(v) => Ok(Some(v)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected("text")),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>> {
        match self {
            Reply::List(v) => Ok(v),
            other => Err(other.unexpected("list")),
        }
    }

    pub fn into_optional(self) -> Result<Vec<Option<String>>> {
        match self {
            Reply::Optional(v) => Ok(v),
            other => Err(other.unexpected("optional list")),
        }
    }

    pub fn into_pairs(self) -> Result<Vec<(String, String)>> {
        match self {
            Reply::Pairs(v) => Ok(v),
            other => Err(other.unexpected("pairs")),
        }
    }

    pub fn into_commit(self) -> Result<CommitReply> {
        match self {
            Reply::Commit(v) => Ok(v),
            other => Err(other.unexpected("commit")),
        }
    }
}

fn reply_error(message: String) -> Error {
    let kind = if message.starts_with("WRONGTYPE") {
        BackendErrorKind::WrongType
    } else {
        BackendErrorKind::Script
    };
    Error::Backend(BackendError {
        kind,
        key: None,
        message,
    })
}

/// A client of a single-threaded, multi-client key-value store.
///
/// Implementations are cheap to clone; clones share the underlying
/// connection or pool.
pub trait Connector: Clone + Send + Sync + 'static {
    /// Run commands as one atomic batch. Replies are in command order;
    /// a failing command yields `Reply::Error` without aborting the batch.
    fn pipeline(
        &self,
        cx: &Cx,
        commands: Vec<Command>,
    ) -> impl Future<Output = Outcome<Vec<Reply>, Error>> + Send;

    /// Run a single command.
    fn execute(&self, cx: &Cx, command: Command) -> impl Future<Output = Outcome<Reply, Error>> + Send {
        let batch = self.pipeline(cx, vec![command]);
        async move {
            match batch.await {
                Outcome::Ok(mut replies) => match replies.pop() {
                    Some(reply) => Outcome::Ok(reply),
                    None => Outcome::Err(Error::protocol("empty reply to single command")),
                },
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}
