use crate::event::table_id::TableId;
use log::debug;
use regex::Regex;
use sqlparser::ast::{AlterTableOperation, Ident, ObjectName, ObjectType, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::sync::LazyLock;

/// What a binlog query event means for the capture.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryClass {
    /// BEGIN, COMMIT, ROLLBACK, XA and savepoint markers.
    Transaction,
    /// Tables touched by a DDL statement, each flagged destructive or not.
    SchemaChange(Vec<(TableId, bool)>),
    /// Parsed, but touches no table data (CREATE DATABASE, GRANT, ...).
    Other,
    /// Data changes written in statement format, or unparseable SQL.
    Unsupported(String),
}

static TRANSACTION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(BEGIN|COMMIT|ROLLBACK|XA\s+\w+|SAVEPOINT\s+|RELEASE\s+SAVEPOINT\s+)")
        .unwrap()
});

// sqlparser does not know MySQL's RENAME TABLE a TO b[, c TO d].
static RENAME_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*RENAME\s+TABLES?\s+(.+)$").unwrap());

pub fn classify(default_schema: &str, query: &str) -> QueryClass {
    if TRANSACTION_MARKER.is_match(query) {
        return QueryClass::Transaction;
    }
    if let Some(captures) = RENAME_TABLE.captures(query) {
        let tables = captures[1]
            .split(',')
            .filter_map(|pair| pair.split_whitespace().next())
            .map(|name| table_from_text(default_schema, name))
            .map(|table| (table, true))
            .collect();
        return QueryClass::SchemaChange(tables);
    }

    let statements = match Parser::parse_sql(&MySqlDialect {}, query) {
        Ok(statements) => statements,
        Err(e) => {
            debug!("Query not supported by parser: {}: {}", query, e);
            return QueryClass::Unsupported(format!("unparseable query: {}", query));
        }
    };
    let stmt = match statements.first() {
        Some(stmt) => stmt,
        None => return QueryClass::Other,
    };

    match stmt {
        Statement::CreateTable { name, .. } => {
            QueryClass::SchemaChange(vec![(table_from_object(default_schema, name), false)])
        }
        Statement::CreateIndex { table_name, .. } => {
            QueryClass::SchemaChange(vec![(table_from_object(default_schema, table_name), false)])
        }
        Statement::AlterTable {
            name, operation, ..
        } => {
            let table = table_from_object(default_schema, name);
            QueryClass::SchemaChange(vec![(table, is_destructive_alter(operation))])
        }
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => QueryClass::SchemaChange(
            names
                .iter()
                .map(|n| (table_from_object(default_schema, n), true))
                .collect(),
        ),
        Statement::Truncate { table_name, .. } => {
            QueryClass::SchemaChange(vec![(table_from_object(default_schema, table_name), true)])
        }
        Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. } => {
            QueryClass::Unsupported(format!(
                "statement-based data change, binlog_format must be ROW: {}",
                query
            ))
        }
        _ => QueryClass::Other,
    }
}

fn is_destructive_alter(operation: &AlterTableOperation) -> bool {
    matches!(
        operation,
        AlterTableOperation::DropColumn { .. }
            | AlterTableOperation::RenameColumn { .. }
            | AlterTableOperation::ChangeColumn { .. }
            | AlterTableOperation::DropPrimaryKey
            | AlterTableOperation::RenameTable { .. }
    )
}

fn table_from_object(default_schema: &str, name: &ObjectName) -> TableId {
    let idents: &Vec<Ident> = &name.0;
    match idents.as_slice() {
        [schema, table] => TableId::new(&schema.value, &table.value),
        [.., table] => TableId::new(default_schema, &table.value),
        [] => TableId::new(default_schema, ""),
    }
}

fn table_from_text(default_schema: &str, name: &str) -> TableId {
    let name = name.replace('`', "");
    match name.split_once('.') {
        Some((schema, table)) => TableId::new(schema, table),
        None => TableId::new(default_schema, &name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(schema: &str, table: &str, destructive: bool) -> (TableId, bool) {
        (TableId::new(schema, table), destructive)
    }

    #[test]
    fn test_transaction_markers() {
        assert_eq!(classify("shop", "BEGIN"), QueryClass::Transaction);
        assert_eq!(classify("shop", "commit"), QueryClass::Transaction);
        assert_eq!(classify("shop", "XA END 'x'"), QueryClass::Transaction);
    }

    #[test]
    fn test_additive_ddl() {
        assert_eq!(
            classify("shop", "CREATE TABLE orders (id INT PRIMARY KEY)"),
            QueryClass::SchemaChange(vec![change("shop", "orders", false)])
        );
        assert_eq!(
            classify("shop", "ALTER TABLE `crm`.`users` ADD COLUMN age INT"),
            QueryClass::SchemaChange(vec![change("crm", "users", false)])
        );
    }

    #[test]
    fn test_destructive_ddl() {
        assert_eq!(
            classify("shop", "ALTER TABLE orders DROP COLUMN total"),
            QueryClass::SchemaChange(vec![change("shop", "orders", true)])
        );
        assert_eq!(
            classify("shop", "ALTER TABLE orders DROP PRIMARY KEY"),
            QueryClass::SchemaChange(vec![change("shop", "orders", true)])
        );
        assert_eq!(
            classify("shop", "DROP TABLE `orders`, crm.users /* generated by server */"),
            QueryClass::SchemaChange(vec![
                change("shop", "orders", true),
                change("crm", "users", true)
            ])
        );
        assert_eq!(
            classify("shop", "TRUNCATE TABLE orders"),
            QueryClass::SchemaChange(vec![change("shop", "orders", true)])
        );
        assert_eq!(
            classify("shop", "RENAME TABLE orders TO old_orders, `crm`.`users` TO crm.people"),
            QueryClass::SchemaChange(vec![
                change("shop", "orders", true),
                change("crm", "users", true)
            ])
        );
    }

    #[test]
    fn test_non_table_statements() {
        assert_eq!(classify("shop", "CREATE DATABASE other"), QueryClass::Other);
        assert!(matches!(
            classify("shop", "INSERT INTO orders VALUES (1)"),
            QueryClass::Unsupported(_)
        ));
        assert!(matches!(
            classify("shop", "THIS IS NOT SQL"),
            QueryClass::Unsupported(_)
        ));
    }
}
