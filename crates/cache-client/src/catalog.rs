//! Allow-listed command catalog.
//!
//! The dispatch table is built once from a list of command names minus
//! [`DENY_LIST`]. Lookups are case-insensitive, so `ECHO` and `echo` resolve
//! to the same entry. Deny-list entries of the form `"client kill"` refuse a
//! subcommand while leaving the parent command available.

use crate::{CacheError, CacheResult};
use cache_protocol_types::{actions, Value};
use std::collections::{HashMap, HashSet};

/// Commands the service refuses to expose.
pub const DENY_LIST: &[&str] = &[
    "bgrewriteaof",
    "bgsave",
    "client kill",
    "client list",
    "client getname",
    "client pause",
    "client setname",
    "config get",
    "config rewrite",
    "config set",
    "config resetstat",
    "dbsize",
    "auth",
    "debug object",
    "debug segfault",
    "dump",
    "restore",
    "info",
    "migrate",
    "monitor",
    "move",
    "pubsub",
    "script exists",
    "script flush",
    "script kill",
    "script load",
    "select",
    "shutdown",
    "slaveof",
    "slowlog",
    "sync",
    "unwatch",
    "watch",
];

/// Command names known to the service.
pub const BUILTIN_COMMANDS: &[&str] = &[
    "append", "auth", "bgrewriteaof", "bgsave", "bitcount", "bitop", "bitpos", "blpop", "brpop",
    "brpoplpush", "client", "config", "dbsize", "debug", "decr", "decrby", "del", "dump", "echo",
    "eval", "evalsha", "exists", "expire", "expireat", "flushall", "flushdb", "get", "getbit",
    "getrange", "getset", "hdel", "hexists", "hget", "hgetall", "hincrby", "hincrbyfloat",
    "hkeys", "hlen", "hmget", "hmset", "hscan", "hset", "hsetnx", "hstrlen", "hvals", "incr",
    "incrby", "incrbyfloat", "info", "keys", "lastsave", "lindex", "linsert", "llen", "lpop",
    "lpush", "lpushx", "lrange", "lrem", "lset", "ltrim", "mget", "migrate", "monitor", "move",
    "mset", "msetnx", "object", "persist", "pexpire", "pexpireat", "pfadd", "pfcount",
    "pfmerge", "ping", "psetex", "psubscribe", "pttl", "publish", "pubsub", "punsubscribe",
    "randomkey", "rename", "renamenx", "restore", "role", "rpop", "rpoplpush", "rpush",
    "rpushx", "sadd", "save", "scan", "scard", "script", "sdiff", "sdiffstore", "select", "set",
    "setbit", "setex", "setnx", "setrange", "shutdown", "sinter", "sinterstore", "sismember",
    "slaveof", "slowlog", "smembers", "smove", "sort", "spop", "srandmember", "srem", "sscan",
    "strlen", "subscribe", "sunion", "sunionstore", "sync", "time", "ttl", "type",
    "unsubscribe", "unwatch", "watch", "zadd", "zcard", "zcount", "zincrby", "zinterstore",
    "zlexcount", "zrange", "zrangebylex", "zrangebyscore", "zrank", "zrem", "zremrangebylex",
    "zremrangebyrank", "zremrangebyscore", "zrevrange", "zrevrangebylex", "zrevrangebyscore",
    "zrevrank", "zscan", "zscore", "zunionstore",
];

/// How a resolved command is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Plain request/reply through the executor.
    Generic,
    Lock,
    Unlock,
    Extend,
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    /// Batch submission; only reachable through `Multi`.
    Multi,
}

impl CommandKind {
    fn for_name(name: &str) -> Self {
        match name {
            "subscribe" => CommandKind::Subscribe,
            "unsubscribe" => CommandKind::Unsubscribe,
            "psubscribe" => CommandKind::PSubscribe,
            "punsubscribe" => CommandKind::PUnsubscribe,
            _ => CommandKind::Generic,
        }
    }
}

/// Case-insensitive dispatch table.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: HashMap<String, CommandKind>,
    denied_subcommands: HashSet<String>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CommandTable {
    /// Table over [`BUILTIN_COMMANDS`].
    pub fn builtin() -> Self {
        Self::from_catalog(BUILTIN_COMMANDS.iter().copied())
    }

    /// Table over an external catalog. The deny list and the internal
    /// lock/batch actions are applied on top.
    pub fn from_catalog<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let denied: HashSet<&str> = DENY_LIST.iter().copied().collect();
        let mut entries = HashMap::new();
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            if name.is_empty() || denied.contains(name.as_str()) {
                continue;
            }
            // Transactions go through `Multi`, never as loose commands.
            if matches!(name.as_str(), "multi" | "exec" | "discard") {
                continue;
            }
            let kind = CommandKind::for_name(&name);
            entries.insert(name, kind);
        }

        entries.insert(actions::LOCK.to_string(), CommandKind::Lock);
        entries.insert(actions::UNLOCK.to_string(), CommandKind::Unlock);
        entries.insert(actions::EXTEND.to_string(), CommandKind::Extend);
        entries.insert(actions::MULTI.to_string(), CommandKind::Multi);

        let denied_subcommands = DENY_LIST
            .iter()
            .filter(|entry| entry.contains(' '))
            .map(|entry| entry.to_string())
            .collect();

        Self {
            entries,
            denied_subcommands,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted canonical names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve `name` to its canonical lower-case action and kind, refusing
    /// anything outside the catalog or a denied subcommand.
    pub fn resolve(&self, name: &str, args: &[Value]) -> CacheResult<(String, CommandKind)> {
        let canonical = name.trim().to_ascii_lowercase();
        let kind = *self
            .entries
            .get(&canonical)
            .ok_or_else(|| CacheError::UnknownCommand(name.to_string()))?;

        if let Some(sub) = args.first().and_then(|a| a.as_bytes()) {
            let full = format!(
                "{} {}",
                canonical,
                String::from_utf8_lossy(sub).to_ascii_lowercase()
            );
            if self.denied_subcommands.contains(&full) {
                return Err(CacheError::UnknownCommand(full));
            }
        }

        Ok((canonical, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_list_is_applied() {
        let table = CommandTable::builtin();
        for denied in ["select", "auth", "info", "watch", "monitor", "shutdown"] {
            assert!(!table.contains(denied), "{} should be denied", denied);
        }
        assert!(table.contains("get"));
        assert!(table.contains("eval"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = CommandTable::builtin();
        let (action, kind) = table.resolve("ECHO", &[Value::from("OK")]).unwrap();
        assert_eq!(action, "echo");
        assert_eq!(kind, CommandKind::Generic);
    }

    #[test]
    fn test_denied_subcommands() {
        let table = CommandTable::builtin();
        let err = table
            .resolve("client", &[Value::from("KILL"), Value::from("1.2.3.4:5")])
            .unwrap_err();
        assert!(matches!(err, CacheError::UnknownCommand(ref c) if c == "client kill"));
        assert!(table.resolve("config", &[Value::from("get")]).is_err());
        assert!(table.resolve("script", &[Value::from("exists")]).is_err());
        assert!(table.resolve("debug", &[Value::from("jmap")]).is_ok());
    }

    #[test]
    fn test_internal_actions_and_kinds() {
        let table = CommandTable::from_catalog(["get", "subscribe", "multi", "exec"]);
        assert_eq!(table.resolve("lock", &[]).unwrap().1, CommandKind::Lock);
        assert_eq!(table.resolve("unlock", &[]).unwrap().1, CommandKind::Unlock);
        assert_eq!(table.resolve("extend", &[]).unwrap().1, CommandKind::Extend);
        assert_eq!(table.resolve("multi", &[]).unwrap().1, CommandKind::Multi);
        assert_eq!(
            table.resolve("subscribe", &[]).unwrap().1,
            CommandKind::Subscribe
        );
        assert!(!table.contains("exec"));
        assert!(matches!(
            table.resolve("set", &[]),
            Err(CacheError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_names_sorted() {
        let table = CommandTable::from_catalog(["zadd", "get"]);
        assert_eq!(
            table.names(),
            vec!["extend", "get", "lock", "multi", "unlock", "zadd"]
        );
        assert_eq!(table.len(), 6);
    }
}
