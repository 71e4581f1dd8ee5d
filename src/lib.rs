//! Watches a public page for the current brand invite link, follows it
//! through its intermediate redirect page and announces every new link
//! exactly once.

pub mod announcer;
pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod providers;
pub mod proxy;
pub mod resolver;
pub mod scheduler;
pub mod stealth;
pub mod store;
pub mod telegram;
pub mod votes;
pub mod watcher;
