/// Protocol id for the peer request-response service
pub const PROTOCOL_VERSION: &str = "/loom/1.0.0";

/// Protocol id of the cafe service, also used as the session token audience
pub const CAFE_PROTOCOL: &str = "/loom/cafe/1.0.0";

/// Cafe API version advertised in inbox records
pub const CAFE_API_VERSION: &str = "v1";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum envelope size accepted from the network (4 MiB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4001;

/// Default HTTP API port (cafe)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_THREAD_KEY: &str = "loom-thread-key-v1";
pub const KDF_CONTEXT_SEAL: &str = "loom-seal-v1";
pub const KDF_CONTEXT_DB_KEY: &str = "loom-db-key-v1";

/// Items loaded per page when draining a delivery queue
pub const QUEUE_BATCH_SIZE: usize = 16;

/// Inbox messages returned or deleted per cafe round trip
pub const CAFE_PAGE_SIZE: usize = 10;

/// Failed handling attempts after which an inbox message is dropped
pub const MAX_INBOX_ATTEMPTS: i64 = 5;

/// Default access token lifetime (1 week)
pub const ACCESS_TOKEN_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Default refresh token lifetime (4 weeks)
pub const REFRESH_TOKEN_TTL_SECS: i64 = 4 * ACCESS_TOKEN_TTL_SECS;

/// Grace period for a direct peer send before falling back to cafe inboxes
pub const DIRECT_SEND_TIMEOUT_SECS: u64 = 5;

/// Bound on fetching one ancestor block during back-propagation
pub const CONTENT_FETCH_TIMEOUT_SECS: u64 = 5;

/// Bound on any request-response round trip
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
