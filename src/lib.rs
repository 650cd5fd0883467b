// Latticenet - Gossip-Synchronized Propagation Network Runtime

pub mod gossip;
pub mod merge;
pub mod model;
pub mod runtime;
pub mod storage;
