pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod evolution;
pub mod goal;
pub mod graph;
pub mod traits;
pub mod types;
pub mod wait;

pub use config::AppConfig;
pub use error::{Result, WaypointError};
pub use event::EventBus;
pub use graph::{EdgeCondition, EdgeSpec, GraphSpec, NodeSpec};
pub use types::*;
