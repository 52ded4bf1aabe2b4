#![allow(dead_code)]

pub mod builders;
pub mod clock;
pub mod db;
pub mod server;

pub use builders::{SessionBuilder, UserBuilder};
pub use clock::ManualClock;
pub use db::TestDb;
pub use server::TestServer;
