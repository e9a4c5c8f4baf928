/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric conversation key size in bytes
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Timeout for the initial "connected" acknowledgment, in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Base delay for reconnection backoff, in milliseconds
pub const RECONNECT_BASE_DELAY_MS: u64 = 300;

/// Cap for reconnection backoff, in seconds
pub const RECONNECT_MAX_DELAY_SECS: u64 = 10;

/// Number of automatic reconnection attempts before settling into `Failed`
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Typing indicator TTL in milliseconds; a `typing` record with no refresh
/// inside this window expires back to idle
pub const TYPING_TTL_MS: u64 = 5_000;

/// Typing publishes per second per client (token bucket refill rate)
pub const TYPING_PUBLISH_RATE: f64 = 2.0;

/// Typing publish burst capacity
pub const TYPING_PUBLISH_BURST: f64 = 2.0;

/// Outbound chat message publishes per second per conversation
pub const MESSAGE_PUBLISH_RATE: f64 = 3.0;

/// Outbound chat message burst capacity
pub const MESSAGE_PUBLISH_BURST: f64 = 3.0;

/// Maximum characters of plaintext kept in a conversation's preview
pub const LAST_MESSAGE_PREVIEW_CHARS: usize = 50;

/// Content substituted when an envelope cannot be decrypted
pub const DECRYPT_FAILED_PLACEHOLDER: &str = "[Encrypted message - unable to decrypt]";

/// Channel event carrying a chat message envelope
pub const EVENT_MESSAGE: &str = "message";

/// Channel event announcing a client started typing
pub const EVENT_TYPING_START: &str = "typing:start";

/// Channel event announcing a client stopped typing
pub const EVENT_TYPING_STOP: &str = "typing:stop";

// Local storage keys (all values JSON-encoded)

/// `chat_conversations_<workspaceId>` -> `Vec<Conversation>`
pub const KEY_CONVERSATIONS_PREFIX: &str = "chat_conversations_";

/// `chat_current_conversation_<workspaceId>` -> conversation id string
pub const KEY_CURRENT_CONVERSATION_PREFIX: &str = "chat_current_conversation_";

/// `chat_conversation_<conversationId>` -> `ConversationRecord`
pub const KEY_CONVERSATION_PREFIX: &str = "chat_conversation_";

/// `pullse_offline_messages_<conversationId>` -> `Vec<ChatMessage>`
pub const KEY_OFFLINE_QUEUE_PREFIX: &str = "pullse_offline_messages_";

/// `pullse_sync_status` -> `SyncStatus`
pub const KEY_SYNC_STATUS: &str = "pullse_sync_status";

/// `pullse_conversation_key_<conversationId>` -> hex-encoded 32-byte key
pub const KEY_CONVERSATION_KEY_PREFIX: &str = "pullse_conversation_key_";
