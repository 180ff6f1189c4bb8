//! Pooled TDS connections to a SQL Server store

use async_trait::async_trait;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::domain::RelationalConnection;
use crate::infrastructure::config::RelationalConfig;

pub type TdsClient = Client<Compat<TcpStream>>;
pub type TdsPool = bb8::Pool<TdsConnectionManager>;

pub struct TdsConnectionManager {
    config: Config,
}

impl TdsConnectionManager {
    pub fn new(connection: &RelationalConnection, settings: &RelationalConfig) -> Self {
        let mut config = Config::new();
        config.host(&connection.host);
        config.port(connection.port);
        config.database(&connection.database);
        config.application_name(env!("CARGO_PKG_NAME"));
        config.authentication(AuthMethod::sql_server(&connection.username, &connection.password));
        config.encryption(if settings.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::Off
        });
        if settings.trust_server_certificate {
            config.trust_cert();
        }
        Self { config }
    }

    /// Lazy pool; the first checkout opens a connection.
    pub fn into_pool(self, max_size: u32, connect_timeout: Duration) -> TdsPool {
        bb8::Pool::builder()
            .max_size(max_size.max(1))
            .connection_timeout(connect_timeout)
            .build_unchecked(self)
    }
}

#[async_trait]
impl bb8::ManageConnection for TdsConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let tcp = TcpStream::connect(self.config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Client::connect(self.config.clone(), tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
