//! # Ticket Counter
//!
//! One client of the shared ticket counter: a [`SyncSession`] that shows the
//! current value, applies mutations optimistically, commits them to the
//! authoritative store and keeps in step with every other client through the
//! propagation fanout.
//!
//! ## Modules
//!
//! - [`session`]: State, actions and the reducer (busy gate, commit, undo)
//! - [`effects`]: Store and propagation effects the reducer returns
//! - [`client`]: [`SyncSession`], the owned handle on a running session
//! - [`config`]: Environment configuration
//!
//! ## Example
//!
//! ```ignore
//! let env = SessionEnvironment::new(store, Arc::new(fanout), Arc::new(SystemClock));
//! let session = SyncSession::connect(env, SessionOptions::default()).await?;
//!
//! session.increment().await?;
//! println!("{}", session.displayed_value().await);
//! ```

pub mod client;
pub mod config;
pub mod effects;
pub mod session;

pub use client::{SessionError, SessionOptions, SyncSession};
pub use config::Config;
pub use session::{
    CommitStage, SessionAction, SessionEnvironment, SessionReducer, SessionState, UndoError,
};
