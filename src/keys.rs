/// The set of every object currently tracked by a pool (queued, claimed or delayed).
pub fn all_key(pool: &str) -> String {
    format!("{}:all", pool)
}

/// FIFO list of objects available for claim, in insertion order.
pub fn queue_key(pool: &str) -> String {
    format!("{}:queue", pool)
}

/// Membership set mirroring the queue list, for O(1) presence checks.
pub fn queued_key(pool: &str) -> String {
    format!("{}:queued", pool)
}

/// List of claimed objects, ordered by earliest lease expiry first.
pub fn claimed_key(pool: &str) -> String {
    format!("{}:claimed", pool)
}

/// FIFO list of objects still waiting out their queue delay.
pub fn delayed_key(pool: &str) -> String {
    format!("{}:delayed-queue", pool)
}

/// Lease key for one claimed object. The value is the claim session id;
/// the TTL is the remaining lease.
pub fn session_key(pool: &str, object: &str) -> String {
    format!("{}:session:{}", pool, object)
}

/// Marker key for a delayed object. Existence means the object is still in
/// delay; the TTL is the remaining delay.
pub fn delay_key(pool: &str, object: &str) -> String {
    format!("{}:delay:{}", pool, object)
}

/// Hash of tag -> value assignments for one object.
pub fn tags_key(pool: &str, object: &str) -> String {
    format!("{}:tags:{}", pool, object)
}

/// Subsequence of the queue list holding only objects bearing tag=value.
pub fn tagged_queue_key(pool: &str, tag: &str, value: &str) -> String {
    format!("{}:tagged-queue:{}:{}", pool, tag, value)
}

/// Pub/sub channel on which "work may be available" is signalled.
/// Shares its name with the queued membership set.
pub fn queued_channel(pool: &str) -> String {
    queued_key(pool)
}
