//! External move-search engine
//!
//! - [`protocol`]: line protocol, search options and FEN shape validation
//! - [`transport`]: child-process and in-memory pipes
//! - [`adapter`]: the async client with cancellation and deadlines
//!
//! # Usage
//!
//! ```rust,ignore
//! use chess_agents::engine::{EngineAdapter, SearchOptions};
//!
//! let adapter = EngineAdapter::spawn_process(config.engine.clone())?;
//! adapter.initialize().await?;
//! adapter.set_position(&fen).await?;
//! let result = adapter.get_best_move(&SearchOptions::default()).await?;
//! println!("{} ({} candidates)", result.best, result.candidates.len());
//! ```

pub mod adapter;
pub mod protocol;
pub mod transport;

pub use adapter::{
    AdapterStatus, EngineAdapter, EngineError, EngineResult, SearchResult, ThinkingCandidate,
};
pub use protocol::{
    EngineMove, Score, SearchBudget, SearchOptions, SearchOptionsPatch, MATE_SENTINEL,
};
pub use transport::{ChannelTransport, EngineEndpoint, EngineTransport, ProcessTransport};
