pub mod api;
pub mod config;
pub mod ledger;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
pub mod updater;

use std::time::Duration;

/// Maximum number of rounds retained in the rolling history.
pub const HISTORY_LIMIT: usize = 500;

/// Fixed delay between the end of one poll cycle and the start of the next.
pub const POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Upstream page index requested on every poll (the feed is newest-first).
pub const UPSTREAM_PAGE: u32 = 1;

/// Upstream page size requested on every poll.
pub const UPSTREAM_PAGE_SIZE: u32 = 20;

/// Credential sent upstream until the updater has pushed a real one.
pub const FALLBACK_CREDENTIAL: &str = "guest";

/// Store keys. One relay instance owns one store.
pub mod keys {
    pub const HISTORY: &str = "history";
    pub const LAST_ID: &str = "last_id";
    pub const AUTH_COOKIE: &str = "auth_cookie";
    pub const NEXT_POLL_AT: &str = "next_poll_at";
}

/// Header carrying the shared secret on internal endpoints.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

/// Render a credential for logs without leaking it: a short prefix plus its length.
pub fn mask_credential(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}… ({} chars)", token.chars().count())
}
