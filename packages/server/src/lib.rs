// PostgreSQL sync platform - core library
//
// Operators register source/destination databases and define sync jobs;
// the kernel executes them: schema replication, streaming data transfer,
// cron dispatch and live progress fan-out. Entities and their SQL live in
// domains/, infrastructure services in kernel/, the HTTP surface in
// server/.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
