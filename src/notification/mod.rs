//! The webhook notification engine.
//!
//! Registration validates and persists subscriptions; the scheduler is a
//! single background task that owns the change cache, polls the store for
//! the next due webhook and hands it to the invoker. The HTTP handlers and
//! the scheduler share nothing but the store.
pub mod change_cache;
pub mod invoker;
pub mod scheduler;
pub mod webhook;

pub use change_cache::ChangeCache;
pub use invoker::Invoker;
pub use scheduler::{select_target, Cycle, Scheduler};
pub use webhook::{register, validate, WebhookRequest};
