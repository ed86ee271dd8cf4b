//! Atomic pool scripts.
//!
//! Every mutation of a pool's keyspace is a single server-side Lua script,
//! so the set/queue/claim invariants hold after each store round trip and
//! producers, consumers and the janitor never interleave mid-operation.
//! The scripts are the authoritative pool semantics; the Rust layer only
//! marshals arguments and decodes results.

use redis::Script;

// Queue objects, optionally tagged, optionally delayed.
//
// KEYS[1]: all set
// KEYS[2]: queued set
// KEYS[3]: queue list
// KEYS[4]: delayed-queue list
// ARGV[1]: pool key prefix
// ARGV[2]: delay seconds (0 = immediately claimable)
// ARGV[3]: number of tag/value pairs
// ARGV[4..]: tag/value pairs, then the objects to queue
//
// Returns the objects that were not already tracked, in input order.
// Publishes one message on the queued channel when anything became
// claimable; delayed objects notify at promotion time instead.
const QUEUE_TAGGED_SRC: &str = r#"
local all_key     = KEYS[1]
local queued_key  = KEYS[2]
local queue_key   = KEYS[3]
local delayed_key = KEYS[4]

local prefix = ARGV[1]
local delay  = tonumber(ARGV[2])
local ntags  = tonumber(ARGV[3])

local tags = {}
local argi = 4
for i = 1, ntags do
    tags[ARGV[argi]] = ARGV[argi + 1]
    argi = argi + 2
end

local added = {}
for i = argi, #ARGV do
    local obj = ARGV[i]
    if redis.call('SADD', all_key, obj) == 1 then
        added[#added + 1] = obj
    end
end

for _, obj in ipairs(added) do
    for tag, value in pairs(tags) do
        redis.call('HSET', prefix .. ':tags:' .. obj, tag, value)
    end
    if delay > 0 then
        redis.call('RPUSH', delayed_key, obj)
        redis.call('SETEX', prefix .. ':delay:' .. obj, delay, '')
    else
        redis.call('SADD', queued_key, obj)
        redis.call('RPUSH', queue_key, obj)
        for tag, value in pairs(tags) do
            redis.call('RPUSH', prefix .. ':tagged-queue:' .. tag .. ':' .. value, obj)
        end
    end
end

if #added > 0 and delay == 0 then
    redis.call('PUBLISH', queued_key, #added)
end

return added
"#;

// Claim up to max_count objects under a fresh session.
//
// KEYS[1]: queued set
// KEYS[2]: queue list
// KEYS[3]: claimed list
// ARGV[1]: pool key prefix
// ARGV[2]: session id (chosen by the caller, stored verbatim)
// ARGV[3]: lease expiration seconds
// ARGV[4]: max object count
// ARGV[5]: tag name, or '' for an untagged claim
//
// The tagged path pops one head object, then fills the batch from the
// head's tagged queue so related objects land in a single claim. A head
// without the tag yields a batch of one. Every claimed object is
// appended to the tail of the claimed list, which keeps that list
// ordered by lease expiry.
//
// Returns the claimed objects in claim order.
const CLAIM_SRC: &str = r#"
local queued_key  = KEYS[1]
local queue_key   = KEYS[2]
local claimed_key = KEYS[3]

local prefix     = ARGV[1]
local session    = ARGV[2]
local expiration = tonumber(ARGV[3])
local max_count  = tonumber(ARGV[4])
local tag        = ARGV[5]

local picked = {}
if max_count > 0 then
    if tag ~= '' and max_count > 1 then
        local head = redis.call('LPOP', queue_key)
        if head then
            picked[1] = head
            local value = redis.call('HGET', prefix .. ':tags:' .. head, tag)
            if value then
                local tagged_key = prefix .. ':tagged-queue:' .. tag .. ':' .. value
                redis.call('LREM', tagged_key, 1, head)
                while #picked < max_count do
                    local obj = redis.call('LPOP', tagged_key)
                    if not obj then break end
                    redis.call('LREM', queue_key, 1, obj)
                    picked[#picked + 1] = obj
                end
            end
        end
    else
        while #picked < max_count do
            local obj = redis.call('LPOP', queue_key)
            if not obj then break end
            picked[#picked + 1] = obj
        end
    end
end

for _, obj in ipairs(picked) do
    redis.call('SREM', queued_key, obj)
    redis.call('SETEX', prefix .. ':session:' .. obj, expiration, session)
    local tags = redis.call('HGETALL', prefix .. ':tags:' .. obj)
    for i = 1, #tags, 2 do
        redis.call('LREM', prefix .. ':tagged-queue:' .. tags[i] .. ':' .. tags[i + 1], 0, obj)
    end
    redis.call('RPUSH', claimed_key, obj)
end

return picked
"#;

// Extend the lease on claimed objects.
//
// KEYS[1]: claimed list
// ARGV[1]: pool key prefix
// ARGV[2]: session id
// ARGV[3]: lease expiration seconds
// ARGV[4..]: objects
//
// Fails without mutation unless every object's lease is held by the
// session. Each extended object is reinserted at the tail of the claimed
// list; the janitor's head-prefix walk depends on this.
//
// Returns 1 on success, 0 on any session mismatch.
const EXTEND_SRC: &str = r#"
local claimed_key = KEYS[1]

local prefix  = ARGV[1]
local session = ARGV[2]
local ttl     = tonumber(ARGV[3])

for i = 4, #ARGV do
    if redis.call('GET', prefix .. ':session:' .. ARGV[i]) ~= session then
        return 0
    end
end

for i = 4, #ARGV do
    local obj = ARGV[i]
    redis.call('SETEX', prefix .. ':session:' .. obj, ttl, session)
    redis.call('LREM', claimed_key, 1, obj)
    redis.call('RPUSH', claimed_key, obj)
end

return 1
"#;

// Permanently remove claimed objects from the pool.
//
// KEYS[1]: all set
// KEYS[2]: claimed list
// ARGV[1]: pool key prefix
// ARGV[2]: session id
// ARGV[3..]: objects
//
// Returns 1 on success, 0 on any session mismatch (no mutation).
const RELEASE_SRC: &str = r#"
local all_key     = KEYS[1]
local claimed_key = KEYS[2]

local prefix  = ARGV[1]
local session = ARGV[2]

for i = 3, #ARGV do
    if redis.call('GET', prefix .. ':session:' .. ARGV[i]) ~= session then
        return 0
    end
end

for i = 3, #ARGV do
    local obj = ARGV[i]
    redis.call('DEL', prefix .. ':session:' .. obj, prefix .. ':tags:' .. obj)
    redis.call('SREM', all_key, obj)
    redis.call('LREM', claimed_key, 1, obj)
end

return 1
"#;

// Return claimed objects to the queue, optionally after a delay.
//
// KEYS[1]: queued set
// KEYS[2]: queue list
// KEYS[3]: claimed list
// KEYS[4]: delayed-queue list
// ARGV[1]: pool key prefix
// ARGV[2]: session id
// ARGV[3]: delay seconds (0 = immediately claimable)
// ARGV[4..]: objects
//
// Tag metadata survives in the tags hash; the tagged-queue indices are
// rebuilt here for immediate requeues, or at promotion time for delayed
// ones. Returns 1 on success, 0 on any session mismatch (no mutation).
const REQUEUE_SRC: &str = r#"
local queued_key  = KEYS[1]
local queue_key   = KEYS[2]
local claimed_key = KEYS[3]
local delayed_key = KEYS[4]

local prefix  = ARGV[1]
local session = ARGV[2]
local delay   = tonumber(ARGV[3])

for i = 4, #ARGV do
    if redis.call('GET', prefix .. ':session:' .. ARGV[i]) ~= session then
        return 0
    end
end

for i = 4, #ARGV do
    local obj = ARGV[i]
    redis.call('DEL', prefix .. ':session:' .. obj)
    redis.call('LREM', claimed_key, 1, obj)
    if delay > 0 then
        redis.call('RPUSH', delayed_key, obj)
        redis.call('SETEX', prefix .. ':delay:' .. obj, delay, '')
    else
        redis.call('SADD', queued_key, obj)
        redis.call('RPUSH', queue_key, obj)
        local tags = redis.call('HGETALL', prefix .. ':tags:' .. obj)
        for t = 1, #tags, 2 do
            redis.call('RPUSH', prefix .. ':tagged-queue:' .. tags[t] .. ':' .. tags[t + 1], obj)
        end
    end
end

if delay == 0 and #ARGV > 3 then
    redis.call('PUBLISH', queued_key, #ARGV - 3)
end

return 1
"#;

// Return objects whose lease has expired to the queue.
//
// KEYS[1]: queued set
// KEYS[2]: queue list
// KEYS[3]: claimed list
// ARGV[1]: pool key prefix
//
// Walks the claimed list from the head and pops the prefix of entries
// whose session key no longer exists. Because every lease touch
// reinserts at the tail, the first live entry ends the walk.
//
// Returns the requeued objects.
const CLEAN_EXPIRED_SRC: &str = r#"
local queued_key  = KEYS[1]
local queue_key   = KEYS[2]
local claimed_key = KEYS[3]

local prefix = ARGV[1]

local moved = {}
while true do
    local head = redis.call('LINDEX', claimed_key, 0)
    if not head then break end
    if redis.call('EXISTS', prefix .. ':session:' .. head) == 1 then break end
    redis.call('LPOP', claimed_key)
    redis.call('SADD', queued_key, head)
    redis.call('RPUSH', queue_key, head)
    local tags = redis.call('HGETALL', prefix .. ':tags:' .. head)
    for i = 1, #tags, 2 do
        redis.call('RPUSH', prefix .. ':tagged-queue:' .. tags[i] .. ':' .. tags[i + 1], head)
    end
    moved[#moved + 1] = head
end

if #moved > 0 then
    redis.call('PUBLISH', queued_key, #moved)
end

return moved
"#;

// Promote delay-matured objects to the queue.
//
// KEYS[1]: queued set
// KEYS[2]: queue list
// KEYS[3]: delayed-queue list
// ARGV[1]: pool key prefix
//
// Symmetric to the expired walk, probing the delay marker key instead of
// the session key. Returns the promoted objects.
const CLEAN_DELAYED_SRC: &str = r#"
local queued_key  = KEYS[1]
local queue_key   = KEYS[2]
local delayed_key = KEYS[3]

local prefix = ARGV[1]

local moved = {}
while true do
    local head = redis.call('LINDEX', delayed_key, 0)
    if not head then break end
    if redis.call('EXISTS', prefix .. ':delay:' .. head) == 1 then break end
    redis.call('LPOP', delayed_key)
    redis.call('SADD', queued_key, head)
    redis.call('RPUSH', queue_key, head)
    local tags = redis.call('HGETALL', prefix .. ':tags:' .. head)
    for i = 1, #tags, 2 do
        redis.call('RPUSH', prefix .. ':tagged-queue:' .. tags[i] .. ':' .. tags[i + 1], head)
    end
    moved[#moved + 1] = head
end

if #moved > 0 then
    redis.call('PUBLISH', queued_key, #moved)
end

return moved
"#;

/// Prepared script handles for one process. `redis::Script` invokes via
/// EVALSHA and reloads on NOSCRIPT, so constructing these once per client
/// is enough.
pub struct PoolScripts {
    pub queue_tagged: Script,
    pub claim: Script,
    pub extend: Script,
    pub release: Script,
    pub requeue: Script,
    pub clean_expired: Script,
    pub clean_delayed: Script,
}

impl PoolScripts {
    pub fn new() -> Self {
        Self {
            queue_tagged: Script::new(QUEUE_TAGGED_SRC),
            claim: Script::new(CLAIM_SRC),
            extend: Script::new(EXTEND_SRC),
            release: Script::new(RELEASE_SRC),
            requeue: Script::new(REQUEUE_SRC),
            clean_expired: Script::new(CLEAN_EXPIRED_SRC),
            clean_delayed: Script::new(CLEAN_DELAYED_SRC),
        }
    }
}

impl Default for PoolScripts {
    fn default() -> Self {
        Self::new()
    }
}
