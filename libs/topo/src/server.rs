//! Per-cell connection registry.
//!
//! A [`TopoServer`] owns the global cell's facade and lazily opens one
//! [`StatsConn`] per cell through a [`Factory`]. Every facade it hands out
//! shares the same [`ReadGate`], giving the process one read budget.
use std::{
    collections::HashMap,
    fmt,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    Conn,
    config::Config,
    error::{TopoError, TopoResult},
    gate::ReadGate,
    metrics::{PrometheusStats, StatsSink},
    stats_conn::StatsConn,
};

/// Name of the cell holding cluster-wide data.
pub const GLOBAL_CELL: &str = "global";

/// Opens raw connections to a coordination store implementation.
pub trait Factory: Send + Sync + fmt::Debug {
    fn create(&self, cell: &str, server_addr: &str, root: &str) -> TopoResult<Box<dyn Conn>>;
}

/// Registered factories keyed by implementation name.
#[derive(Debug, Default)]
pub struct Factories {
    factories: HashMap<String, Arc<dyn Factory>>,
}

impl Factories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn Factory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> TopoResult<Arc<dyn Factory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| TopoError::NoImplementation(name.to_owned()))
    }
}

/// Where a cell's store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellInfo {
    pub server_address: String,
    pub root: String,
}

/// Facades for the global cell and every local cell opened so far.
pub struct TopoServer {
    factory: Arc<dyn Factory>,
    global: Arc<StatsConn>,
    read_gate: ReadGate,
    sink: Arc<dyn StatsSink>,
    read_only: AtomicBool,
    cells: RwLock<HashMap<String, Arc<StatsConn>>>,
}

impl TopoServer {
    /// Opens the global cell with `factory`.
    pub fn open(
        factory: Arc<dyn Factory>,
        global: CellInfo,
        read_concurrency: NonZeroU32,
    ) -> TopoResult<Self> {
        Self::open_with_sink(factory, global, read_concurrency, Arc::new(PrometheusStats))
    }

    pub fn open_with_sink(
        factory: Arc<dyn Factory>,
        global: CellInfo,
        read_concurrency: NonZeroU32,
        sink: Arc<dyn StatsSink>,
    ) -> TopoResult<Self> {
        let read_gate = ReadGate::new(read_concurrency);
        let conn = factory.create(GLOBAL_CELL, &global.server_address, &global.root)?;
        info!(
            server_address = %global.server_address,
            root = %global.root,
            read_concurrency = read_concurrency.get(),
            "opened global topology connection"
        );
        let global = Arc::new(StatsConn::with_sink(
            GLOBAL_CELL,
            conn,
            read_gate.clone(),
            Arc::clone(&sink),
        ));
        Ok(Self {
            factory,
            global,
            read_gate,
            sink,
            read_only: AtomicBool::new(false),
            cells: RwLock::new(HashMap::new()),
        })
    }

    /// Resolves the configured implementation from `factories` and opens the
    /// global cell, applying the configured read-only mode.
    pub fn from_config(config: &Config, factories: &Factories) -> TopoResult<Self> {
        let factory = factories.get(&config.implementation)?;
        let server = Self::open(
            factory,
            CellInfo {
                server_address: config.global_server_address.clone(),
                root: config.global_root.clone(),
            },
            config.read_concurrency,
        )?;
        server.set_read_only(config.read_only);
        Ok(server)
    }

    pub fn global(&self) -> Arc<StatsConn> {
        Arc::clone(&self.global)
    }

    pub fn read_gate(&self) -> &ReadGate {
        &self.read_gate
    }

    /// Facade for `cell`, opening it on first use.
    pub fn conn_for_cell(&self, cell: &str, info: &CellInfo) -> TopoResult<Arc<StatsConn>> {
        if cell == GLOBAL_CELL {
            return Ok(self.global());
        }
        if let Some(conn) = self.cells.read().get(cell) {
            return Ok(Arc::clone(conn));
        }

        let mut cells = self.cells.write();
        // raced with another opener
        if let Some(conn) = cells.get(cell) {
            return Ok(Arc::clone(conn));
        }
        let raw = self.factory.create(cell, &info.server_address, &info.root)?;
        let conn = Arc::new(StatsConn::with_sink(
            cell,
            raw,
            self.read_gate.clone(),
            Arc::clone(&self.sink),
        ));
        conn.set_read_only(self.is_read_only());
        debug!(cell, server_address = %info.server_address, "opened cell topology connection");
        cells.insert(cell.to_owned(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Names of the local cells opened so far.
    pub fn cells(&self) -> Vec<String> {
        let mut cells = self.cells.read().keys().cloned().collect::<Vec<_>>();
        cells.sort();
        cells
    }

    /// Applies to the global facade, every open cell, and cells opened later.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
        self.global.set_read_only(read_only);
        for conn in self.cells.read().values() {
            conn.set_read_only(read_only);
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Closes every cell connection, then the global one.
    pub fn close(&self) {
        let cells = std::mem::take(&mut *self.cells.write());
        for (cell, conn) in cells {
            debug!(cell, "closing cell topology connection");
            conn.close();
        }
        self.global.close();
        info!("closed topology server");
    }
}

impl fmt::Debug for TopoServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopoServer")
            .field("factory", &self.factory)
            .field("global", &self.global)
            .field("read_gate", &self.read_gate)
            .field("read_only", &self.is_read_only())
            .field("cells", &self.cells())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, memory::MemoryTopo};

    fn info() -> CellInfo {
        CellInfo {
            server_address: "memory".into(),
            root: "/topo".into(),
        }
    }

    fn server(read_concurrency: u32) -> (MemoryTopo, TopoServer) {
        let topo = MemoryTopo::new();
        let read_concurrency = NonZeroU32::new(read_concurrency).expect("non-zero");
        let server =
            TopoServer::open(Arc::new(topo.clone()), info(), read_concurrency).expect("open");
        (topo, server)
    }

    #[tokio::test]
    async fn cell_conns_are_cached() {
        let (_, server) = server(4);
        let a = server.conn_for_cell("zone1", &info()).expect("zone1");
        let b = server.conn_for_cell("zone1", &info()).expect("zone1 again");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.cell(), "zone1");
        assert!(Arc::ptr_eq(
            &server.global(),
            &server.conn_for_cell(GLOBAL_CELL, &info()).expect("global")
        ));
        assert_eq!(server.cells(), ["zone1"]);
    }

    #[tokio::test]
    async fn cells_share_the_read_gate() {
        let (topo, server) = server(1);
        topo.conn("zone2")
            .create(&Context::background(), "/k", b"v")
            .await
            .expect("seed");
        let zone2 = server.conn_for_cell("zone2", &info()).expect("zone2");

        // the server's gate is the one every cell facade waits on
        let held = server
            .read_gate()
            .acquire(&Context::background())
            .await
            .expect("slot");
        let timed = Context::background().with_timeout(std::time::Duration::from_millis(20));
        assert!(matches!(
            zone2.get(&timed, "/k").await,
            Err(TopoError::Timeout(_))
        ));
        drop(held);
        zone2
            .get(&Context::background(), "/k")
            .await
            .expect("admitted");
    }

    #[tokio::test]
    async fn read_only_applies_to_existing_and_new_cells() {
        let (_, server) = server(4);
        let zone1 = server.conn_for_cell("zone1", &info()).expect("zone1");
        server.set_read_only(true);
        assert!(zone1.is_read_only());
        assert!(server.global().is_read_only());

        let zone2 = server.conn_for_cell("zone2", &info()).expect("zone2");
        assert!(zone2.is_read_only());
        let err = zone2
            .create(&Context::background(), "/k", b"v")
            .await
            .unwrap_err();
        assert!(err.is_read_only());

        server.set_read_only(false);
        assert!(!zone1.is_read_only() && !zone2.is_read_only());
    }

    #[tokio::test]
    async fn close_drops_cells() {
        let (_, server) = server(4);
        let zone1 = server.conn_for_cell("zone1", &info()).expect("zone1");
        server.close();
        assert!(server.cells().is_empty());
        assert!(matches!(
            zone1.get(&Context::background(), "/k").await,
            Err(TopoError::Interrupted(_))
        ));
    }

    #[test]
    fn unknown_implementation() {
        let mut factories = Factories::new();
        factories.register("memory", Arc::new(MemoryTopo::new()));
        assert!(factories.get("memory").is_ok());
        assert!(matches!(
            factories.get("etcd2"),
            Err(TopoError::NoImplementation(_))
        ));
    }

    #[test]
    fn from_config_applies_read_only() {
        let mut factories = Factories::new();
        factories.register("memory", Arc::new(MemoryTopo::new()));
        let config = Config::new(r#"{"read_only": true, "read_concurrency": 2}"#).expect("config");
        let server = TopoServer::from_config(&config, &factories).expect("server");
        assert!(server.is_read_only());
        assert!(server.global().is_read_only());
        assert_eq!(server.read_gate().capacity(), 2);
    }
}
