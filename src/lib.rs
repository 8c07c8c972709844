pub mod config;
pub mod daemon;
pub mod igmp;
pub mod querier;
pub mod responder;
pub mod timer;
