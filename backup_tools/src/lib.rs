//! Point-in-time backup and recovery engine for MySQL-family servers.
//!
//! One invocation does one of three things:
//! - take a full logical backup of a database and make it the active anchor
//!   ([`backup`]);
//! - capture the binary log segments that accumulated since the active
//!   anchor ([`binlog`]);
//! - restore a database to an arbitrary moment by replaying the captured
//!   logs on top of the right full backup ([`recovery`]).
//!
//! The moving parts: [`producer`] turns an external byte source into a
//! chunk stream, `remote_storage` persists such streams, [`pipeline`] wires
//! one producer to one destination with backpressure and mutual failure
//! abort, and [`catalog`] keeps the durable record that ties artifacts to
//! databases and points in time. [`rdbms`] wraps the administrative SQL
//! surface of the server, and [`server_config`] owns the server-side
//! logging configuration fragment.

pub mod backup;
pub mod binlog;
pub mod catalog;
pub mod config;
pub mod pipeline;
mod process;
pub mod producer;
pub mod rdbms;
pub mod recovery;
pub mod server_config;
