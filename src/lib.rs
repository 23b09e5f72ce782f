//! Streaming reward join.
//!
//! Joins a partitioned stream of interactions with a partitioned
//! stream of observations (rewards) by event id inside a time window,
//! producing joined batches for training and billing them exactly
//! once.
//!
//! Start at [`joiner::JoinerEventHub`], which wires the stages in
//! [`operators`] together over a [`inputs::Transport`] and resumes
//! from checkpoints kept in a [`recovery::BlobStore`].
//!
//! Host processes usually:
//!
//! 1. load a [`config::JoinerConfig`],
//! 2. call [`crate::tracing::setup_tracing`] and [`metrics::initialize_metrics`],
//! 3. build a [`joiner::JoinerEventHub`], load its checkpoint and
//!    start it,
//! 4. consume the outputs, committing each joined batch through the
//!    [`joiner::CheckpointHandle`].

pub mod backoff;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod errors;
pub mod inputs;
pub mod joiner;
pub mod metrics;
pub mod model;
pub mod operators;
pub mod outputs;
pub mod recovery;
pub mod source;
pub mod tracing;
pub mod webserver;
pub mod window;

pub use config::JoinerConfig;
pub use errors::JoinerError;
pub use joiner::JoinerEventHub;
pub use joiner::RunningJoiner;
