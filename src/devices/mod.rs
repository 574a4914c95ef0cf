// Source connectivity: keeping capture sources alive

pub mod reconnect;

pub use reconnect::{LinkState, ReconnectOutcome, ReconnectPolicy, ReconnectionManager};
