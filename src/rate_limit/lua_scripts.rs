/// Lua script reading a bucket's state atomically
///
/// KEYS[1] = the bucket key
///
/// Returns: [tokens, last_access_nanos] or nil when the key holds no complete state
pub const GET_STATE_SCRIPT: &str = r#"
local tokens = redis.call('HGET', KEYS[1], 'tokens')
local last_access = redis.call('HGET', KEYS[1], 'lastAccess')
if tokens and last_access then
    return {tokens, last_access}
end
return nil
"#;

/// Lua script writing a bucket's state and re-arming its expiry
///
/// KEYS[1] = the bucket key
/// ARGV[1] = tokens
/// ARGV[2] = last access (Unix nanoseconds)
/// ARGV[3] = time to live (seconds)
///
/// Returns: 1
pub const SET_STATE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], 'tokens', ARGV[1], 'lastAccess', ARGV[2])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
return 1
"#;

/// Lua script deleting every key under a prefix
///
/// ARGV[1] = key pattern (e.g. `ratelimit:*`)
///
/// Returns: number of deleted keys
pub const PURGE_PREFIX_SCRIPT: &str = r#"
local cursor = '0'
local deleted = 0
repeat
    local reply = redis.call('SCAN', cursor, 'MATCH', ARGV[1], 'COUNT', 500)
    cursor = reply[1]
    local keys = reply[2]
    if #keys > 0 then
        deleted = deleted + redis.call('DEL', unpack(keys))
    end
until cursor == '0'
return deleted
"#;
