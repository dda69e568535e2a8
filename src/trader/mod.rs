//! Trading core: decision tick, lot books, maker-first execution and
//! crash-safe state.

pub mod book;
pub mod broker;
pub mod closer;
pub mod config;
pub mod engine;
pub mod filters;
pub mod notify;
pub mod opener;
pub mod oracle;
pub mod pnl;
pub mod pyramid;
pub mod sizing;
pub mod state;
pub mod types;

pub use broker::{Broker, PaperBroker};
pub use config::Config;
pub use engine::Trader;
pub use notify::{LogNotifier, Notifier};
pub use oracle::{DecisionOracle, MomentumOracle};
pub use types::{Candle, Side, Signal};
