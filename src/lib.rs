pub mod trader;

pub use trader::{Broker, Candle, Config, LogNotifier, MomentumOracle, PaperBroker, Side, Signal, Trader};
