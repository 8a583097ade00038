//! Parley core
//!
//! Types, errors, configuration helpers and logging setup shared by the
//! voice provider and the Discord adaptor.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    get_env_bool, get_env_id, get_env_int, get_env_or, get_optional_env, get_required_env,
    load_env,
};
pub use error::{
    ConnectError, ParleyError, PlaybackError, Result, SynthesisError, TranscodeError,
};
pub use logging::init_tracing;
pub use types::{ChatCommand, MessageEvent, PresenceEvent, TargetDescriptor};
