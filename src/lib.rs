pub mod backend;
pub mod compose;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod outbox;
pub mod store;
