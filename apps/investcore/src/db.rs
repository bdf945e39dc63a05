use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Thin connection holder shared by every `Postgres*Store`. One live
/// connection backed by a mutex, matching the teacher's single-connection
/// dev/test shape rather than a pool; a production deployment swaps this for
/// `deadpool-postgres` without changing the `Store` trait surface.
#[derive(Clone)]
pub struct InvestDb {
    client: Arc<Mutex<Client>>,
}

impl InvestDb {
    pub async fn connect(database_url: &str, timeout_ms: u64) -> Result<Self> {
        let (client, connection) = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            tokio_postgres::connect(database_url, NoTls),
        )
        .await
        .map_err(|_| anyhow!("postgres connection timed out after {timeout_ms}ms"))?
        .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "investcore postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
