use crate::error::{CaptureError, CaptureResult};
use mysql_async::{Opts, OptsBuilder};
use serde::{Deserialize, Serialize};

fn default_watermarks_table() -> String {
    "flow_watermarks".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MySQLSourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
    pub server_id: u32,
    #[serde(default = "default_watermarks_table")]
    pub watermarks_table: String,
}

impl MySQLSourceConfig {
    pub fn new(
        host: String,
        port: u16,
        user: String,
        password: String,
        db: String,
        server_id: u32,
    ) -> Self {
        MySQLSourceConfig {
            host,
            port,
            user,
            password,
            db,
            server_id,
            watermarks_table: default_watermarks_table(),
        }
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.host.is_empty() {
            return Err(CaptureError::InvalidConfig("MySQL host is empty".into()));
        }
        if self.db.is_empty() {
            return Err(CaptureError::InvalidConfig("MySQL database is empty".into()));
        }
        if self.server_id == 0 {
            return Err(CaptureError::InvalidConfig(
                "MySQL server_id must be non-zero to register as a replica".into(),
            ));
        }
        if self.watermarks_table.is_empty() || self.watermarks_table.contains('`') {
            return Err(CaptureError::InvalidConfig(format!(
                "Invalid watermarks table name '{}'",
                self.watermarks_table
            )));
        }
        Ok(())
    }

    pub fn opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.db.clone()))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MySQLSourceConfig {
        MySQLSourceConfig::new(
            "localhost".to_string(),
            3306,
            "user".to_string(),
            "password".to_string(),
            "test_db".to_string(),
            1234,
        )
    }

    #[test]
    fn test_new_mysql_source_config() {
        let config = config();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.db, "test_db");
        assert_eq!(config.server_id, 1234);
        assert_eq!(config.watermarks_table, "flow_watermarks");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watermarks_table_defaults_when_absent() {
        let json = r#"{"host":"db","port":3306,"user":"u","password":"p","db":"shop","server_id":7}"#;
        let config: MySQLSourceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.watermarks_table, "flow_watermarks");
    }

    #[test]
    fn test_validate_rejects_zero_server_id() {
        let mut config = config();
        config.server_id = 0;
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_config");
    }

    #[test]
    fn test_opts() {
        let opts = config().opts();
        assert_eq!(opts.ip_or_hostname(), "localhost");
        assert_eq!(opts.tcp_port(), 3306);
        assert_eq!(opts.db_name(), Some("test_db"));
        assert_eq!(opts.user(), Some("user"));
    }
}
