//! OPC UA server publishing the within-tolerance state as a single read-only
//! Boolean node, `ns=1;s=ColorAreaReading`, organized under the Objects
//! folder. Clients connect anonymously over `opc.tcp` with security mode None.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use opcua::server::prelude::*;
use opcua::sync::RwLock;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::variable::{PolledVariable, Sample, VariableSink};

pub const NAMESPACE: u16 = 1;
pub const READING_NODE: &str = "ColorAreaReading";

const APPLICATION_NAME: &str = "colorcheck";
const APPLICATION_URI: &str = "urn:colorcheck";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("variable server is already running")]
    AlreadyRunning,
    #[error("variable server is not running")]
    NotRunning,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid OPC UA server configuration")]
    Config,
    #[error("OPC UA server did not come up on {0}")]
    Startup(SocketAddr),
    #[error("failed to spawn server thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("server thread panicked")]
    Join,
}

pub fn reading_node_id() -> NodeId {
    NodeId::new(NAMESPACE, READING_NODE)
}

/// Mirrors the polled variable into the address space.
struct ReadingNode {
    address_space: Arc<RwLock<AddressSpace>>,
}

impl VariableSink for ReadingNode {
    fn write(&self, sample: &Sample) {
        let now = DateTime::now();
        let mut space = self.address_space.write();
        if !space.set_variable_value(reading_node_id(), sample.value, &now, &now) {
            warn!("Node {} missing from the address space", reading_node_id());
        }
    }
}

fn add_reading_node(space: &mut AddressSpace, initial: bool) -> Result<(), ServerError> {
    // The server's own URI, so this resolves to namespace 1 either way
    let ns = space
        .register_namespace(APPLICATION_URI)
        .map_err(|_| ServerError::Config)?;
    if ns != NAMESPACE {
        warn!("Application namespace registered at index {}", ns);
    }
    let inserted = VariableBuilder::new(&reading_node_id(), READING_NODE, READING_NODE)
        .data_type(DataTypeId::Boolean)
        .value(initial)
        .access_level(AccessLevel::CURRENT_READ)
        .user_access_level(UserAccessLevel::CURRENT_READ)
        .organized_by(ObjectId::ObjectsFolder)
        .insert(space);
    if inserted {
        Ok(())
    } else {
        Err(ServerError::Config)
    }
}

struct Running {
    server: Arc<RwLock<Server>>,
    address_space: Arc<RwLock<AddressSpace>>,
    handle: JoinHandle<()>,
    addr: SocketAddr,
}

struct Lifecycle {
    state: ServerState,
    running: Option<Running>,
}

/// Owns the OPC UA server thread and its Stopped → Starting → Running
/// lifecycle.
pub struct VariableServer {
    host: String,
    pki_dir: PathBuf,
    variable: Arc<PolledVariable>,
    lifecycle: Mutex<Lifecycle>,
}

impl VariableServer {
    pub fn new(host: impl Into<String>, variable: Arc<PolledVariable>) -> Self {
        Self {
            host: host.into(),
            pki_dir: PathBuf::from("pki"),
            variable,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                running: None,
            }),
        }
    }

    /// Certificate store location; created on launch.
    pub fn with_pki_dir(mut self, pki_dir: impl Into<PathBuf>) -> Self {
        self.pki_dir = pki_dir.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Address the server is listening on while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().running.as_ref().map(|r| r.addr)
    }

    /// `opc.tcp` URL of the only endpoint while running.
    pub fn endpoint_url(&self) -> Option<String> {
        self.local_addr().map(|addr| endpoint_url(&self.host, addr.port()))
    }

    pub fn variable(&self) -> &Arc<PolledVariable> {
        &self.variable
    }

    /// Value clients currently read from the reading node.
    pub fn published_value(&self) -> Option<bool> {
        let lifecycle = self.lock();
        let running = lifecycle.running.as_ref()?;
        let space = running.address_space.read();
        match space.get_variable_value(reading_node_id()).ok()?.value? {
            Variant::Boolean(value) => Some(value),
            _ => None,
        }
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub fn launch(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let mut lifecycle = self.lock();
        if lifecycle.state != ServerState::Stopped {
            return Err(ServerError::AlreadyRunning);
        }
        lifecycle.state = ServerState::Starting;

        match self.start_server(port) {
            Ok(running) => {
                let addr = running.addr;
                self.variable.attach(Arc::new(ReadingNode {
                    address_space: Arc::clone(&running.address_space),
                }));
                lifecycle.running = Some(running);
                lifecycle.state = ServerState::Running;
                info!("OPC UA server listening on {}", endpoint_url(&self.host, addr.port()));
                Ok(addr)
            }
            Err(e) => {
                lifecycle.state = ServerState::Stopped;
                Err(e)
            }
        }
    }

    fn start_server(&self, port: u16) -> Result<Running, ServerError> {
        let addr = self.reserve_port(port)?;
        let url = endpoint_url(&self.host, addr.port());

        let server = ServerBuilder::new_anonymous(APPLICATION_NAME)
            .application_uri(APPLICATION_URI)
            .product_uri(APPLICATION_URI)
            .host_and_port(self.host.clone(), addr.port())
            .discovery_urls(vec![url])
            .discovery_server_url(None)
            .pki_dir(self.pki_dir.clone())
            .create_sample_keypair(false)
            .server()
            .ok_or(ServerError::Config)?;

        let address_space = server.address_space();
        add_reading_node(&mut address_space.write(), self.variable.read())?;

        let server = Arc::new(RwLock::new(server));
        let handle = thread::Builder::new()
            .name("opcua-server".into())
            .spawn({
                let server = Arc::clone(&server);
                move || {
                    Server::run_server(server);
                }
            })
            .map_err(ServerError::Spawn)?;

        let running = Running {
            server,
            address_space,
            handle,
            addr,
        };
        match wait_until_listening(&running) {
            Ok(()) => Ok(running),
            Err(e) => {
                stop(running);
                Err(e)
            }
        }
    }

    /// Resolve `port` (0 picks a free one) and check it can be bound.
    fn reserve_port(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.host, port);
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.local_addr().map_err(|source| ServerError::Bind { addr, source })
    }

    /// Clear the running flag and join the server thread.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lock();
        if lifecycle.state != ServerState::Running {
            return Err(ServerError::NotRunning);
        }
        self.variable.detach();
        let joined = match lifecycle.running.take() {
            Some(running) => stop(running),
            None => Ok(()),
        };
        lifecycle.state = ServerState::Stopped;
        info!("OPC UA server stopped");
        joined
    }

    /// Stop if running, then launch on `port`.
    pub fn restart(&self, port: u16) -> Result<SocketAddr, ServerError> {
        info!("Restarting OPC UA server on port {}", port);
        match self.shutdown() {
            Ok(()) | Err(ServerError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.launch(port)
    }
}

impl Drop for VariableServer {
    fn drop(&mut self) {
        if self.state() == ServerState::Running {
            if let Err(e) = self.shutdown() {
                warn!("OPC UA server shutdown failed: {}", e);
            }
        }
    }
}

fn endpoint_url(host: &str, port: u16) -> String {
    format!("opc.tcp://{}:{}/", host, port)
}

fn stop(running: Running) -> Result<(), ServerError> {
    running.server.write().abort();
    running.handle.join().map_err(|_| ServerError::Join)
}

/// The server binds inside its own runtime; Running starts once it accepts.
fn wait_until_listening(running: &Running) -> Result<(), ServerError> {
    let target = match running.addr.ip() {
        ip if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), running.addr.port()),
        _ => running.addr,
    };
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if running.handle.is_finished() {
            // The server logs why; most often the port was taken meanwhile
            return Err(ServerError::Bind {
                addr: running.addr.to_string(),
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        match TcpStream::connect_timeout(&target, STARTUP_POLL) {
            Ok(_) => return Ok(()),
            Err(e) => debug!("Waiting for OPC UA listener: {}", e),
        }
        if Instant::now() >= deadline {
            return Err(ServerError::Startup(running.addr));
        }
        thread::sleep(STARTUP_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_node_is_a_read_only_boolean() {
        let mut space = AddressSpace::new();
        add_reading_node(&mut space, true).unwrap();

        let value = space.get_variable_value(reading_node_id()).unwrap();
        assert_eq!(value.value, Some(Variant::Boolean(true)));

        let node_id = reading_node_id();
        assert_eq!(node_id.namespace, NAMESPACE);
        assert_eq!(node_id.to_string(), "ns=1;s=ColorAreaReading");
    }

    #[test]
    fn sink_writes_through_to_the_node() {
        let address_space = Arc::new(RwLock::new(AddressSpace::new()));
        add_reading_node(&mut address_space.write(), false).unwrap();

        let variable = PolledVariable::new(false, Duration::from_secs(1));
        variable.attach(Arc::new(ReadingNode {
            address_space: Arc::clone(&address_space),
        }));
        variable.update(true);

        let value = address_space.read().get_variable_value(reading_node_id()).unwrap();
        assert_eq!(value.value, Some(Variant::Boolean(true)));
    }
}
