pub mod brain;
pub mod bus;
pub mod config;
pub mod lifecycle;
pub mod llm;
pub mod parser;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod terminal;
pub mod workflow;
