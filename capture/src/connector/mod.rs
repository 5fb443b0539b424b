pub mod mysql_source;
pub mod source_connector;
