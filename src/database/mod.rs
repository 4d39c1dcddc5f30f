pub mod matcher;
pub mod repo;
pub mod schema;
pub mod session;
