//! PostgreSQL warehouse destination.
//!
//! Each batch is appended with one statement: the records travel as a
//! single `jsonb` array and `jsonb_populate_recordset` maps keys onto the
//! table's columns. Keys without a column are ignored by Postgres.

use std::sync::LazyLock;

use async_trait::async_trait;
use lovelace_types::error::ConnectorError;
use lovelace_types::record::Record;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::{Client, Config as PgConfig, NoTls};

use super::Destination;

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,62}$").expect("identifier regex is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresSinkConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

impl PostgresSinkConfig {
    /// Typed view of a job's `destination.config` block.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or mistyped.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("invalid postgres destination config: {e}"))
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.host.trim().is_empty() {
            errors.push("postgres: host must not be empty".to_string());
        }
        if self.database.trim().is_empty() {
            errors.push("postgres: database must not be empty".to_string());
        }
        for (name, ident) in [("schema", &self.schema), ("table", &self.table)] {
            if !is_valid_identifier(ident) {
                errors.push(format!("postgres: invalid {name} identifier '{ident}'"));
            }
        }
    }

    /// `"schema"."table"`.
    #[must_use]
    pub fn qualified_table(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }

    /// The append statement for this table.
    #[must_use]
    pub fn insert_statement(&self) -> String {
        let table = self.qualified_table();
        format!("INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)")
    }
}

/// Plain SQL identifier: letter or underscore, then letters, digits,
/// `_` or `$`, at most 63 bytes.
#[must_use]
pub fn is_valid_identifier(ident: &str) -> bool {
    IDENTIFIER_RE.is_match(ident)
}

/// Classify a driver error by SQLSTATE class.
#[must_use]
pub fn classify_pg_error(error: &tokio_postgres::Error) -> ConnectorError {
    let Some(db_error) = error.as_db_error() else {
        return ConnectorError::transient_network("PG_CONNECTION", error.to_string());
    };
    let sqlstate = db_error.code().code();
    let message = format!(
        "{} (sqlstate={} detail={})",
        db_error.message(),
        sqlstate,
        db_error.detail().unwrap_or("n/a")
    );
    let code = format!("PG_{sqlstate}");
    match &sqlstate[..2.min(sqlstate.len())] {
        "08" | "40" | "53" | "57" => ConnectorError::transient_db(code, message),
        "28" => ConnectorError::auth(code, message),
        "42" | "3F" => ConnectorError::config(code, message),
        "22" | "23" => ConnectorError::data(code, message),
        _ => ConnectorError::internal(code, message),
    }
}

pub struct PostgresWarehouse {
    config: PostgresSinkConfig,
    client: Option<Client>,
}

impl PostgresWarehouse {
    /// The connection is opened on first delivery.
    #[must_use]
    pub fn new(config: PostgresSinkConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    async fn connect(&self) -> Result<Client, ConnectorError> {
        let mut pg = PgConfig::new();
        pg.host(&self.config.host);
        pg.port(self.config.port);
        pg.user(&self.config.user);
        if !self.config.password.is_empty() {
            pg.password(&self.config.password);
        }
        pg.dbname(&self.config.database);

        let (client, connection) = pg.connect(NoTls).await.map_err(|e| classify_pg_error(&e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection error");
            }
        });
        tracing::debug!(
            host = %self.config.host,
            database = %self.config.database,
            table = %self.config.qualified_table(),
            "Connected to PostgreSQL destination"
        );
        Ok(client)
    }

    async fn client(&mut self) -> Result<&Client, ConnectorError> {
        if self.client.as_ref().map_or(true, Client::is_closed) {
            self.client = Some(self.connect().await?);
        }
        self.client
            .as_ref()
            .ok_or_else(|| ConnectorError::internal("PG_NO_CLIENT", "client not initialized"))
    }
}

#[async_trait]
impl Destination for PostgresWarehouse {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn deliver(&mut self, batch: &[Record]) -> Result<(), ConnectorError> {
        let rows = Value::Array(batch.iter().map(Record::to_value).collect());
        let statement = self.config.insert_statement();
        let client = self.client().await?;
        let inserted = client
            .execute(statement.as_str(), &[&rows])
            .await
            .map_err(|e| classify_pg_error(&e))?;
        tracing::debug!(
            table = %self.config.qualified_table(),
            inserted,
            "Appended batch"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ConnectorError> {
        self.client = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> PostgresSinkConfig {
        PostgresSinkConfig::from_value(&json!({
            "host": "localhost",
            "user": "lovelace",
            "database": "warehouse",
            "table": "discord_messages",
        }))
        .unwrap()
    }

    #[test]
    fn defaults_and_statement() {
        let config = config();
        assert_eq!(config.port, 5432);
        assert_eq!(config.schema, "public");
        assert_eq!(
            config.insert_statement(),
            "INSERT INTO \"public\".\"discord_messages\" SELECT * FROM \
             jsonb_populate_recordset(NULL::\"public\".\"discord_messages\", $1)"
        );
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(is_valid_identifier("raw_reviews"));
        assert!(is_valid_identifier("_t1$"));
        assert!(!is_valid_identifier("1table"));
        assert!(!is_valid_identifier("users\"; DROP TABLE x; --"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(64)));

        let mut config = config();
        config.table = "bad table".into();
        let mut errors = Vec::new();
        config.validate(&mut errors);
        assert_eq!(errors, vec!["postgres: invalid table identifier 'bad table'"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PostgresSinkConfig::from_value(&json!({
            "host": "h", "user": "u", "database": "d", "table": "t", "tabel": "x",
        }))
        .is_err());
    }
}
