//! Cluster and session: the asynchronous request surface.
//!
//! Every session operation returns a future immediately. Statements are
//! encoded on the calling thread; network I/O and decoding run on the
//! cluster's background runtime.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::auth::{AuthProvider, PlainTextAuthProvider};
use super::config::ClusterConfig;
use super::connection::{Connection, Connector, TcpConnector};
use super::error::{CqlError, CqlResult};
use super::future::{CqlFuture, PrepareFuture, ResultFuture, SessionFuture, ShutdownFuture};
use super::protocol::{EncodedRequest, FrontendMessage, PrepareMessage};
use super::result::{ResultKind, ResultSet};
use super::statement::{BatchStatement, Prepared, Statement, StatementCache};

// ============================================================================
// Cluster
// ============================================================================

/// Configuration plus the background I/O runtime shared by its sessions.
///
/// Dropping the cluster stops the runtime; requests still in flight
/// resolve as abandoned.
pub struct Cluster {
    config: ClusterConfig,
    runtime: Option<Runtime>,
    handle: Handle,
    connector: Arc<dyn Connector>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> CqlResult<Self> {
        config.validate()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("cqlkit-io")
            .enable_all()
            .build()?;

        let auth = config.username.as_ref().map(|user| {
            let password = config.password.as_deref().unwrap_or("");
            Arc::new(PlainTextAuthProvider::new(user, password)) as Arc<dyn AuthProvider>
        });

        debug!(
            contact_points = ?config.contact_points,
            io_threads = config.io_threads,
            "Cluster created"
        );

        Ok(Self {
            config,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            connector: Arc::new(TcpConnector),
            auth,
        })
    }

    /// Parse a `cql://` URL and create the cluster.
    pub fn from_url(url: &str) -> CqlResult<Self> {
        Self::new(ClusterConfig::from_url(url)?)
    }

    /// Replace the transport used to open connections.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace the authentication provider.
    pub fn with_auth_provider(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Create an unconnected session.
    pub fn session(&self) -> Session {
        Session {
            handle: self.handle.clone(),
            shared: Arc::new(Shared {
                config: self.config.clone(),
                connector: Arc::clone(&self.connector),
                auth: self.auth.clone(),
                connection: tokio::sync::Mutex::new(None),
                cache: Mutex::new(StatementCache::new(self.config.statement_cache_capacity)),
            }),
        }
    }

    /// Create a session and connect it to the configured keyspace.
    pub fn connect(&self) -> SessionFuture {
        let session = self.session();
        let keyspace = self.config.keyspace.clone();
        session.connect(keyspace.as_deref())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Shutting down cluster runtime");
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .finish()
    }
}

// ============================================================================
// Session
// ============================================================================

struct Shared {
    config: ClusterConfig,
    connector: Arc<dyn Connector>,
    auth: Option<Arc<dyn AuthProvider>>,
    /// One request in flight at a time
    connection: tokio::sync::Mutex<Option<Connection>>,
    cache: Mutex<StatementCache>,
}

impl Shared {
    async fn connect(&self, keyspace: Option<&str>) -> CqlResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() {
            return Err(CqlError::AlreadyConnected);
        }

        let connect_timeout = self.config.connect_timeout_duration();
        let mut conn = match timeout(connect_timeout, self.open()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout_ms = self.config.connect_timeout_ms, "Connect timed out");
                return Err(CqlError::Timeout);
            }
        };

        if let Some(keyspace) = keyspace {
            let request_timeout = self.config.request_timeout_duration();
            match timeout(request_timeout, conn.use_keyspace(keyspace)).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => return Err(CqlError::Timeout),
            }
        }

        *guard = Some(conn);
        Ok(())
    }

    /// Try every contact point in order.
    async fn open(&self) -> CqlResult<Connection> {
        let mut last_error = CqlError::NotConnected;
        for address in self.config.addresses() {
            match Connection::connect(
                self.connector.as_ref(),
                &address,
                &self.config.cql_version,
                self.auth.as_deref(),
            )
            .await
            {
                Ok(conn) => return Ok(conn),
                Err(e @ (CqlError::Auth(_) | CqlError::Server { .. })) => return Err(e),
                Err(e) => {
                    warn!(address = %address, error = %e, "Contact point unavailable");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn query(&self, request: &EncodedRequest) -> CqlResult<ResultSet> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or(CqlError::NotConnected)?;

        let outcome = timeout(self.config.request_timeout_duration(), conn.query(request)).await;
        let broken = conn.is_closed();

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    opcode = ?request.opcode,
                    timeout_ms = self.config.request_timeout_ms,
                    "Request timed out"
                );
                Err(CqlError::Timeout)
            }
        };

        if broken {
            warn!("Connection lost");
            *guard = None;
        }
        result
    }

    async fn prepare(&self, query: String, request: EncodedRequest) -> CqlResult<Arc<Prepared>> {
        let result = self.query(&request).await?;
        let metadata = match result.kind() {
            ResultKind::Prepared(metadata) => metadata.clone(),
            other => {
                return Err(CqlError::protocol(format!(
                    "Unexpected result to PREPARE: {:?}",
                    other
                )))
            }
        };

        let prepared = Arc::new(Prepared::new(query, metadata));
        if let Some(evicted) = self.cache.lock().insert(Arc::clone(&prepared)) {
            debug!(query = %evicted, "Evicted prepared statement from cache");
        }
        Ok(prepared)
    }

    async fn shutdown(&self) -> CqlResult<()> {
        let mut conn = self
            .connection
            .lock()
            .await
            .take()
            .ok_or(CqlError::NotConnected)?;
        self.cache.lock().clear();
        conn.close().await?;
        info!("Session closed");
        Ok(())
    }
}

/// A connection to the cluster that executes statements.
///
/// Cloning is cheap and clones share the connection and the prepared
/// statement cache.
#[derive(Clone)]
pub struct Session {
    handle: Handle,
    shared: Arc<Shared>,
}

impl Session {
    /// Connect, optionally switching to `keyspace`.
    pub fn connect(&self, keyspace: Option<&str>) -> SessionFuture {
        let (promise, future) = CqlFuture::pending();
        let session = self.clone();
        let keyspace = keyspace.map(str::to_string);

        self.handle.spawn(async move {
            let result = session.shared.connect(keyspace.as_deref()).await;
            let _ = promise.complete_with(result.map(|()| session));
        });
        future
    }

    /// Prepare `query`, reusing the cached statement when there is one.
    pub fn prepare(&self, query: &str) -> PrepareFuture {
        if let Some(prepared) = self.shared.cache.lock().get_and_touch(query) {
            debug!(query, "Prepared statement cache hit");
            return CqlFuture::ready(prepared);
        }

        let request = match (PrepareMessage {
            query: query.to_string(),
        })
        .encode()
        {
            Ok(request) => request,
            Err(e) => return CqlFuture::failed(e),
        };

        let shared = Arc::clone(&self.shared);
        let query = query.to_string();
        self.spawn(async move { shared.prepare(query, request).await })
    }

    /// Execute a query or bound statement.
    ///
    /// Fails immediately if a parameter is unbound.
    pub fn execute(&self, statement: &Statement) -> ResultFuture {
        match statement.encode() {
            Ok(request) => self.send(request),
            Err(e) => CqlFuture::failed(e),
        }
    }

    /// Execute every statement of `batch` in one BATCH request.
    pub fn execute_batch(&self, batch: &BatchStatement<'_>) -> ResultFuture {
        match batch.encode() {
            Ok(request) => self.send(request),
            Err(e) => CqlFuture::failed(e),
        }
    }

    /// Execute a query without parameters at the configured consistency.
    pub fn query(&self, query: &str) -> ResultFuture {
        self.execute(&Statement::new(query, 0, self.shared.config.consistency))
    }

    /// Close the connection.
    pub fn shutdown(&self) -> ShutdownFuture {
        let shared = Arc::clone(&self.shared);
        self.spawn(async move { shared.shutdown().await })
    }

    /// Number of prepared statements currently cached.
    pub fn cached_statements(&self) -> usize {
        self.shared.cache.lock().len()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.shared.config
    }

    fn send(&self, request: EncodedRequest) -> ResultFuture {
        let shared = Arc::clone(&self.shared);
        self.spawn(async move { shared.query(&request).await })
    }

    fn spawn<T, F>(&self, task: F) -> CqlFuture<T>
    where
        T: Send + Sync + 'static,
        F: std::future::Future<Output = CqlResult<T>> + Send + 'static,
    {
        let (promise, future) = CqlFuture::pending();
        self.handle.spawn(async move {
            let _ = promise.complete_with(task.await);
        });
        future
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("contact_points", &self.shared.config.contact_points)
            .finish()
    }
}
