//! FlowCore - session continuity and flow control for conversational AI backends

pub mod budget;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fork;
pub mod limiter;
pub mod session;
pub mod transport;

pub use budget::{BudgetTracker, ContextHeadroom, HeadroomLevel, TokenEstimator, WordCountEstimator};
pub use config::FlowConfig;
pub use dispatch::{
    Dispatch, DispatchRouter, GenerateOptions, Generation, ProviderAdapter, ProviderProfile,
};
pub use error::{FlowError, Result};
pub use fork::{ForkEngine, ForkOutcome, ForkPreview, ForkResult, NextStep, Summarizer};
pub use limiter::{Decision, EndpointClass, RateLimiter};
pub use session::{MemoryStore, Message, Role, Session, SessionState, SessionStore, TokenUsage};
pub use transport::{
    ClientChannel, DeliveryMode, Frame, StreamOutcome, StreamRequest, TransportManager,
};
