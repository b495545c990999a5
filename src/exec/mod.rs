//! Command and query dispatch over a database.
//!
//! Mutations and reads are reified as plain enums so callers can build
//! them up front, log them uniformly, and run commands either inline or on
//! a background thread. This is deliberately thin glue: every operation
//! maps one-to-one onto a `Database` call.

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::db::{Database, DatabaseStatus};
use crate::error::Result;

/// A state-changing operation.
#[derive(Clone, Debug)]
pub enum Command {
    CreateTable {
        table: String,
    },
    DropTable {
        table: String,
    },
    Insert {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
}

impl Command {
    fn describe(&self) -> &'static str {
        match self {
            Command::CreateTable { .. } => "create_table",
            Command::DropTable { .. } => "drop_table",
            Command::Insert { .. } => "insert",
            Command::Delete { .. } => "delete",
        }
    }
}

/// Executes commands against a database, synchronously or as tasks.
pub struct CommandHandler {
    db: Arc<Database>,
}

impl CommandHandler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Runs a command to completion on the calling thread.
    pub fn execute(&self, command: Command) -> Result<()> {
        let kind = command.describe();
        tracing::debug!(database = %self.db.name(), command = kind, "executing command");

        let result = match command {
            Command::CreateTable { table } => self.db.create_table(&table),
            Command::DropTable { table } => self.db.drop_table(&table),
            Command::Insert { table, key, value } => self.db.insert(&table, &key, value),
            Command::Delete { table, key } => self.db.delete(&table, &key),
        };

        if let Err(e) = &result {
            tracing::error!(
                database = %self.db.name(),
                command = kind,
                error = %e,
                "command failed"
            );
        }
        result
    }

    /// Runs a command on a spawned task thread. The handle yields the
    /// command's result; dropping it detaches the task.
    pub fn submit(&self, command: Command) -> JoinHandle<Result<()>> {
        let db = Arc::clone(&self.db);
        std::thread::spawn(move || {
            let handler = CommandHandler { db };
            handler.execute(command)
        })
    }
}

/// A read-only operation.
#[derive(Clone, Debug)]
pub enum Query {
    Get { table: String, key: Vec<u8> },
    Status,
    Tables,
}

/// The answer to a [`Query`].
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Value(Vec<u8>),
    Status(DatabaseStatus),
    Tables(Vec<String>),
}

/// Executes queries against a database.
pub struct QueryHandler {
    db: Arc<Database>,
}

impl QueryHandler {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn execute(&self, query: Query) -> Result<QueryResult> {
        match query {
            Query::Get { table, key } => {
                let value = self.db.get(&table, &key)?;
                Ok(QueryResult::Value(value))
            }
            Query::Status => Ok(QueryResult::Status(self.db.status())),
            Query::Tables => Ok(QueryResult::Tables(self.db.tables())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BtreeConfig;
    use crate::db::{BackendConfig, DatabaseConfig};
    use crate::error::Error;

    fn open_db(dir: &tempfile::TempDir) -> Arc<Database> {
        let config = DatabaseConfig::new(
            "testdb",
            BackendConfig::Btree {
                path: dir.path().join("test.db"),
                config: BtreeConfig::default(),
            },
        );
        Arc::new(Database::open(config).unwrap())
    }

    #[test]
    fn test_command_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let commands = CommandHandler::new(Arc::clone(&db));
        let queries = QueryHandler::new(Arc::clone(&db));

        commands
            .execute(Command::CreateTable {
                table: "users".to_string(),
            })
            .unwrap();
        commands
            .execute(Command::Insert {
                table: "users".to_string(),
                key: b"user1".to_vec(),
                value: b"Alice".to_vec(),
            })
            .unwrap();

        let result = queries
            .execute(Query::Get {
                table: "users".to_string(),
                key: b"user1".to_vec(),
            })
            .unwrap();
        assert!(matches!(result, QueryResult::Value(v) if v == b"Alice"));

        commands
            .execute(Command::Delete {
                table: "users".to_string(),
                key: b"user1".to_vec(),
            })
            .unwrap();
        assert_eq!(
            queries.execute(Query::Get {
                table: "users".to_string(),
                key: b"user1".to_vec(),
            }),
            Err(Error::KeyNotFound)
        );
    }

    #[test]
    fn test_failed_command_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let commands = CommandHandler::new(open_db(&dir));

        let result = commands.execute(Command::Insert {
            table: "missing".to_string(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_submitted_commands_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let commands = CommandHandler::new(Arc::clone(&db));

        commands
            .execute(Command::CreateTable {
                table: "numbers".to_string(),
            })
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                commands.submit(Command::Insert {
                    table: "numbers".to_string(),
                    key: format!("key{i}").into_bytes(),
                    value: format!("value{i}").into_bytes(),
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        for i in 0..8 {
            let key = format!("key{i}");
            assert_eq!(
                db.get("numbers", key.as_bytes()).unwrap(),
                format!("value{i}").into_bytes()
            );
        }
    }

    #[test]
    fn test_status_and_tables_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let commands = CommandHandler::new(Arc::clone(&db));
        let queries = QueryHandler::new(db);

        commands
            .execute(Command::CreateTable {
                table: "a".to_string(),
            })
            .unwrap();
        commands
            .execute(Command::CreateTable {
                table: "b".to_string(),
            })
            .unwrap();

        match queries.execute(Query::Tables).unwrap() {
            QueryResult::Tables(tables) => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("unexpected result: {other:?}"),
        }
        match queries.execute(Query::Status).unwrap() {
            QueryResult::Status(status) => {
                assert_eq!(status.table_count, 2);
                assert!(status.ready);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
