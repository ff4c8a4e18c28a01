//! Lease store backed by Redis.
//!
//! Every mutation is one Lua script, which Redis runs atomically, so a claim
//! is a conditional write and never a read followed by a write. The scripts
//! read the clock with `TIME` so hosts with skewed clocks agree on expiry.
//!
//! Layout, for prefix `ipam` and network `vxlan-net`:
//!
//! - `ipam:{vxlan-net}:lease:<ip>` hash with `owner`, `acquired_at` &
//!   `expires_at` (unix millis, empty when permanent)
//! - `ipam:{vxlan-net}:leases` set of leased addresses
//!
//! The `{...}` hash tag keeps both keys in the same cluster slot.
use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::{Script, aio::ConnectionManager};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{Claim, Lease, LeaseStore, LeaseStream, Release, Renewal};

/// record fetches kept in flight while listing
const LIST_CONCURRENCY: usize = 32;

const NOW_MS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
";

const CLAIM: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  local exp = redis.call('HGET', KEYS[1], 'expires_at')
  if not exp or exp == '' or tonumber(exp) > now then
    return {'leased'}
  end
  redis.call('DEL', KEYS[1])
end
local acquired = string.format('%.0f', now)
local expires = ''
if ARGV[3] ~= '' then
  expires = string.format('%.0f', now + tonumber(ARGV[3]))
end
redis.call('HSET', KEYS[1], 'owner', ARGV[2], 'acquired_at', acquired, 'expires_at', expires)
redis.call('SADD', KEYS[2], ARGV[1])
return {'claimed', ARGV[2], acquired, expires}
";

const RELEASE: &str = r"
local f = redis.call('HMGET', KEYS[1], 'owner', 'acquired_at', 'expires_at')
if not f[1] then
  return {'missing'}
end
local exp = f[3] or ''
if exp ~= '' and tonumber(exp) <= now then
  return {'missing'}
end
if f[1] ~= ARGV[2] then
  return {'not_owner'}
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
return {'released', f[1], f[2] or '', exp}
";

const RENEW: &str = r"
local f = redis.call('HMGET', KEYS[1], 'owner', 'acquired_at', 'expires_at')
if not f[1] then
  return {'missing'}
end
local exp = f[3] or ''
if exp ~= '' and tonumber(exp) <= now then
  return {'missing'}
end
if f[1] ~= ARGV[1] then
  return {'not_owner'}
end
local expires = string.format('%.0f', now + tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'expires_at', expires)
return {'renewed', f[1], f[2] or '', expires}
";

const RECLAIM: &str = r"
local f = redis.call('HMGET', KEYS[1], 'owner', 'expires_at')
if f[1] ~= ARGV[2] or f[2] ~= ARGV[3] then
  return 0
end
if f[2] == '' or tonumber(f[2]) > now then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
return 1
";

#[derive(Debug, Error)]
pub enum RedisError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed lease record for {ip}: {reason}")]
    Malformed { ip: String, reason: String },
    #[error("unexpected script reply {0:?}")]
    UnexpectedReply(Vec<String>),
    #[error("ttl {0:?} is out of range")]
    InvalidTtl(Duration),
}

/// Lease store shared by every ipam instance pointed at the same redis
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Scripts {
    claim: Script,
    release: Script,
    renew: Script,
    reclaim: Script,
}

impl Scripts {
    fn new() -> Self {
        let script = |body: &str| Script::new(&format!("{NOW_MS}{body}"));
        Self {
            claim: script(CLAIM),
            release: script(RELEASE),
            renew: script(RENEW),
            reclaim: script(RECLAIM),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn new(key_prefix: &str, network: &str) -> Self {
        Self {
            prefix: format!("{key_prefix}:{{{}}}", sanitize_key_component(network)),
        }
    }
    fn lease(&self, ip: Ipv4Addr) -> String {
        format!("{}:lease:{ip}", self.prefix)
    }
    fn index(&self) -> String {
        format!("{}:leases", self.prefix)
    }
}

fn sanitize_key_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn ttl_ms(ttl: Duration) -> Result<String, RedisError> {
    // lua numbers are doubles, stay well inside the exact integer range
    match u64::try_from(ttl.as_millis()) {
        Ok(ms) if ms < (1 << 50) => Ok(ms.to_string()),
        _ => Err(RedisError::InvalidTtl(ttl)),
    }
}

fn parse_millis(ip: Ipv4Addr, field: &str, value: &str) -> Result<DateTime<Utc>, RedisError> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| RedisError::Malformed {
            ip: ip.to_string(),
            reason: format!("invalid {field} {value:?}"),
        })
}

fn parse_expiry(ip: Ipv4Addr, value: &str) -> Result<Option<DateTime<Utc>>, RedisError> {
    if value.is_empty() {
        Ok(None)
    } else {
        parse_millis(ip, "expires_at", value).map(Some)
    }
}

/// builds a lease from a `{status, owner, acquired_at, expires_at}` script reply
fn lease_from_reply(ip: Ipv4Addr, reply: &[String]) -> Result<Lease, RedisError> {
    match reply {
        [_, owner, acquired, expires] => Ok(Lease::new(
            ip,
            owner.clone(),
            parse_millis(ip, "acquired_at", acquired)?,
            parse_expiry(ip, expires)?,
        )),
        _ => Err(RedisError::UnexpectedReply(reply.to_vec())),
    }
}

fn lease_from_hash(ip: Ipv4Addr, hash: &HashMap<String, String>) -> Result<Lease, RedisError> {
    let field = |name: &str| {
        hash.get(name).ok_or_else(|| RedisError::Malformed {
            ip: ip.to_string(),
            reason: format!("missing {name}"),
        })
    };
    Ok(Lease::new(
        ip,
        field("owner")?.clone(),
        parse_millis(ip, "acquired_at", field("acquired_at")?)?,
        parse_expiry(ip, field("expires_at")?)?,
    ))
}

impl RedisStore {
    /// connect to redis at `url`. `network` namespaces the keys so several
    /// networks can share one database
    pub async fn new(
        url: impl AsRef<str>,
        key_prefix: &str,
        network: &str,
    ) -> Result<Self, RedisError> {
        let client = redis::Client::open(url.as_ref())?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self {
            conn,
            keys: Keys::new(key_prefix, network),
            scripts: Scripts::new(),
        };
        info!(prefix = %store.keys.prefix, "connected to redis lease store");
        Ok(store)
    }

    async fn invoke(
        &self,
        script: &Script,
        ip: Ipv4Addr,
        args: &[&str],
    ) -> Result<Vec<String>, RedisError> {
        let mut conn = self.conn.clone();
        let mut invocation = script.key(self.keys.lease(ip));
        invocation.key(self.keys.index()).arg(ip.to_string());
        for arg in args {
            invocation.arg(*arg);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        trace!(?ip, ?reply, "script reply");
        Ok(reply)
    }
}

#[async_trait]
impl LeaseStore for RedisStore {
    type Error = RedisError;

    async fn try_claim(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Claim, Self::Error> {
        let ttl = ttl.map(ttl_ms).transpose()?.unwrap_or_default();
        let reply = self.invoke(&self.scripts.claim, ip, &[owner, &ttl]).await?;
        match reply.first().map(String::as_str) {
            Some("claimed") => Ok(Claim::Claimed(lease_from_reply(ip, &reply)?)),
            Some("leased") => Ok(Claim::AlreadyLeased),
            _ => Err(RedisError::UnexpectedReply(reply)),
        }
    }

    async fn release(&self, ip: Ipv4Addr, owner: &str) -> Result<Release, Self::Error> {
        let reply = self.invoke(&self.scripts.release, ip, &[owner]).await?;
        match reply.first().map(String::as_str) {
            Some("released") => Ok(Release::Released(lease_from_reply(ip, &reply)?.released())),
            Some("not_owner") => Ok(Release::NotOwner),
            Some("missing") => Ok(Release::NotFound),
            _ => Err(RedisError::UnexpectedReply(reply)),
        }
    }

    async fn renew(
        &self,
        ip: Ipv4Addr,
        owner: &str,
        ttl: Duration,
    ) -> Result<Renewal, Self::Error> {
        let ttl = ttl_ms(ttl)?;
        // renew passes no address arg, owner & ttl are ARGV[1], ARGV[2]
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .scripts
            .renew
            .key(self.keys.lease(ip))
            .arg(owner)
            .arg(&ttl)
            .invoke_async(&mut conn)
            .await?;
        match reply.first().map(String::as_str) {
            Some("renewed") => Ok(Renewal::Renewed(lease_from_reply(ip, &reply)?)),
            Some("not_owner") => Ok(Renewal::NotOwner),
            Some("missing") => Ok(Renewal::NotFound),
            _ => Err(RedisError::UnexpectedReply(reply)),
        }
    }

    async fn list_leases(&self) -> Result<LeaseStream<Self::Error>, Self::Error> {
        let mut conn = self.conn.clone();
        // the key set is fixed here, records are fetched as the stream is polled
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.index())
            .query_async(&mut conn)
            .await?;
        let mut addrs = members
            .iter()
            .filter_map(|member| member.parse::<Ipv4Addr>().ok())
            .collect::<Vec<_>>();
        addrs.sort();
        debug!(count = addrs.len(), "listing leases");

        let keys = self.keys.clone();
        let stream = futures::stream::iter(addrs)
            .map(move |ip| {
                let mut conn = conn.clone();
                let key = keys.lease(ip);
                async move {
                    let hash: HashMap<String, String> =
                        redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
                    if hash.is_empty() {
                        // removed after the snapshot was taken
                        return Ok(None);
                    }
                    lease_from_hash(ip, &hash).map(Some)
                }
            })
            // keeps snapshot order, overlaps the round trips
            .buffered(LIST_CONCURRENCY)
            .filter_map(|res| futures::future::ready(res.transpose()));
        Ok(stream.boxed())
    }

    async fn reclaim(&self, lease: &Lease) -> Result<bool, Self::Error> {
        let Some(expires) = lease.expires_at() else {
            return Ok(false);
        };
        let expires = expires.timestamp_millis().to_string();
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .reclaim
            .key(self.keys.lease(lease.address()))
            .key(self.keys.index())
            .arg(lease.address().to_string())
            .arg(lease.owner())
            .arg(expires)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn is_free(&self, ip: Ipv4Addr) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        let (expires, now): (Option<String>, (i64, i64)) = redis::pipe()
            .cmd("HGET")
            .arg(self.keys.lease(ip))
            .arg("expires_at")
            .cmd("TIME")
            .query_async(&mut conn)
            .await?;
        let now_ms = now.0 * 1000 + now.1 / 1000;
        Ok(match expires {
            None => true,
            Some(exp) if exp.is_empty() => false,
            Some(exp) => parse_millis(ip, "expires_at", &exp)?.timestamp_millis() <= now_ms,
        })
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn now(&self) -> Result<DateTime<Utc>, Self::Error> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
        DateTime::from_timestamp_millis(secs * 1000 + micros / 1000)
            .ok_or_else(|| RedisError::UnexpectedReply(vec![secs.to_string(), micros.to_string()]))
    }
}
