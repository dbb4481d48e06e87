// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Server-side Lua scripts and their `EVALSHA` plumbing.
//!
//! Every script takes the item hash as `KEYS[1]` and, when the item lives in a
//! region, the region lookup hash as `KEYS[2]`.

use std::collections::HashMap;

use parking_lot::RwLock;
use redis::{FromRedisValue, RedisResult, aio::ConnectionManager};

/// `ARGV`: value, type, expiration, timeout, created, defaultExpiration, ttl ms.
///
/// Returns 1 when the item was stored and 0 when the key already existed.
const ADD: &str = r"
local stored = redis.call('HSETNX', KEYS[1], 'value', ARGV[1])
if stored == 1 then
    redis.call('HMSET', KEYS[1], 'type', ARGV[2], 'expiration', ARGV[3], 'timeout', ARGV[4], 'created', ARGV[5], 'defaultExpiration', ARGV[6], 'version', 1)
    if tonumber(ARGV[7]) > 0 then
        redis.call('PEXPIRE', KEYS[1], ARGV[7])
    end
    if KEYS[2] then
        redis.call('HSET', KEYS[2], KEYS[1], 'regionKey')
    end
end
return stored
";

/// Same `ARGV` as [`ADD`]. Returns the new version.
const PUT: &str = r"
redis.call('HMSET', KEYS[1], 'value', ARGV[1], 'type', ARGV[2], 'expiration', ARGV[3], 'timeout', ARGV[4], 'created', ARGV[5], 'defaultExpiration', ARGV[6])
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
if tonumber(ARGV[7]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[7])
else
    redis.call('PERSIST', KEYS[1])
end
if KEYS[2] then
    redis.call('HSET', KEYS[2], KEYS[1], 'regionKey')
end
return version
";

/// `ARGV`: new value, expected version, sliding ttl ms (0 keeps the current TTL).
///
/// Returns -1 for a missing item, nil when the version moved and the new version otherwise.
const UPDATE: &str = r"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
    return -1
end
if current ~= ARGV[2] then
    return false
end
redis.call('HSET', KEYS[1], 'value', ARGV[1])
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
if tonumber(ARGV[3]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return version
";

/// Reads the item fields and renews the TTL of sliding items.
const GET: &str = r"
local fields = redis.call('HMGET', KEYS[1], 'value', 'expiration', 'timeout', 'created', 'version', 'defaultExpiration', 'type')
if fields[1] and fields[2] == '2' and tonumber(fields[3]) and tonumber(fields[3]) > 0 then
    redis.call('PEXPIRE', KEYS[1], fields[3])
end
return fields
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Script {
    Add,
    Put,
    Update,
    Get,
}

impl Script {
    const ALL: [Self; 4] = [Self::Add, Self::Put, Self::Update, Self::Get];

    fn source(self) -> &'static str {
        match self {
            Self::Add => ADD,
            Self::Put => PUT,
            Self::Update => UPDATE,
            Self::Get => GET,
        }
    }
}

/// Loaded script hashes for one connection.
#[derive(Debug, Default)]
pub(crate) struct ScriptSet {
    hashes: RwLock<HashMap<Script, String>>,
}

impl ScriptSet {
    /// Loads every script into the server script cache.
    pub(crate) async fn load_all(&self, conn: &mut ConnectionManager) -> RedisResult<()> {
        let mut loaded = HashMap::with_capacity(Script::ALL.len());
        for script in Script::ALL {
            let sha: String = redis::cmd("SCRIPT").arg("LOAD").arg(script.source()).query_async(conn).await?;
            loaded.insert(script, sha);
        }

        tracing::debug!(scripts = loaded.len(), "loaded redis scripts");
        *self.hashes.write() = loaded;
        Ok(())
    }

    /// Runs `script` by hash, reloading every script once if the server lost them.
    pub(crate) async fn run<T: FromRedisValue>(
        &self,
        conn: &mut ConnectionManager,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> RedisResult<T> {
        if self.hash(script).is_none() {
            self.load_all(conn).await?;
        }

        match self.eval(conn, script, keys, args).await {
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                tracing::warn!(?script, "redis script cache was flushed, reloading scripts");
                self.load_all(conn).await?;
                self.eval(conn, script, keys, args).await
            }
            result => result,
        }
    }

    async fn eval<T: FromRedisValue>(
        &self,
        conn: &mut ConnectionManager,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> RedisResult<T> {
        let sha = self.hash(script).unwrap_or_default();
        redis::cmd("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .arg(keys)
            .arg(args)
            .query_async(conn)
            .await
    }

    fn hash(&self, script: Script) -> Option<String> {
        self.hashes.read().get(&script).cloned()
    }
}
