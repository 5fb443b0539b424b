pub mod binlog;
pub mod config;
pub mod connector;
pub mod ddl;
pub mod decoding;

pub use config::MySQLSourceConfig;
pub use connector::MySQLSourceConnector;
