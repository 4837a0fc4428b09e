//! Broker routing calls between clients
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::ConnId;
use crate::periodic::{Periodic, Work};
use crate::{Action, CallError, Config, Connection, Error, Flag, Message, Result};

/// Handle to a broker
#[derive(Debug)]
pub struct Broker {
    config: Config,
    router: Arc<Mutex<Router>>,
    periodic: Periodic,
}

/// Routing state. Held under a single lock for a whole work cycle, so only one call is in
/// flight at a time.
#[derive(Debug)]
struct Router {
    config: Config,
    endpoints: Vec<Endpoint>,
    functions: HashMap<String, Registration>,
    /// Requests awaiting dispatch
    requests: VecDeque<(ConnId, Message)>,
    /// Replies nobody was waiting for
    returns: VecDeque<(ConnId, Message)>,
    next_conn_id: u64,
}

/// Client connection attached to broker
#[derive(Debug)]
struct Endpoint {
    id: ConnId,
    conn: Connection,
    /// Cleared once a read or write fails. Broken endpoints are no longer polled.
    live: bool,
}

/// Owner of a registered function
#[derive(Debug, Clone, Copy)]
struct Registration {
    owner: ConnId,
    long_running: bool,
}

struct RouterWorker(Arc<Mutex<Router>>);

impl Broker {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let periodic = Periodic::new("broker", config.idle_delay, config.stop_timeout);
        Self {
            router: Arc::new(Mutex::new(Router::new(config.clone()))),
            config,
            periodic,
        }
    }

    /// Name the routing loop, used to tell brokers apart in logs. Applies from the next
    /// [Broker::start].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.periodic.set_name(name);
        self
    }

    pub fn name(&self) -> &str {
        self.periodic.name()
    }

    /// Register a new client, returning the client side of its connection
    pub async fn register_client(&self) -> Result<Connection> {
        let (local, remote) = Connection::pair()?;
        self.add_connection(local).await;
        Ok(remote)
    }

    /// Attach an existing connection to broker
    pub async fn add_connection(&self, conn: Connection) -> ConnId {
        self.router.lock().await.add(conn)
    }

    /// Number of connected clients
    pub async fn n_clients(&self) -> usize {
        self.router.lock().await.endpoints.len()
    }

    /// Number of registered functions
    pub async fn n_functions(&self) -> usize {
        self.router.lock().await.functions.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start routing on a dedicated task
    pub fn start(&mut self) -> Result<()> {
        self.periodic.start(RouterWorker(self.router.clone()))
    }

    /// Stop routing
    pub async fn stop(&mut self) -> Result<()> {
        self.periodic.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Broker::new()
    }
}

impl Work for RouterWorker {
    async fn work(&mut self) {
        self.0.lock().await.work().await
    }
}

impl Router {
    fn new(config: Config) -> Self {
        Self {
            config,
            endpoints: vec![],
            functions: HashMap::new(),
            requests: VecDeque::new(),
            returns: VecDeque::new(),
            next_conn_id: 0,
        }
    }

    fn add(&mut self, conn: Connection) -> ConnId {
        let id = ConnId::from(self.next_conn_id);
        self.next_conn_id = self.next_conn_id.wrapping_add(1);
        info!("client connected {id} - {:?}", conn);
        self.endpoints.push(Endpoint {
            id,
            conn,
            live: true,
        });
        id
    }

    /// One poll + dispatch cycle
    async fn work(&mut self) {
        self.poll().await;
        self.dispatch_all().await;
    }

    /// Wait for any live endpoint to become readable, then drain every readable endpoint
    async fn poll(&mut self) {
        let poll_interval = self.config.poll_interval;
        let waits: Vec<_> = self
            .endpoints
            .iter_mut()
            .filter(|e| e.live)
            .map(|e| Box::pin(e.conn.poll(poll_interval)))
            .collect();
        if waits.is_empty() {
            tokio::time::sleep(poll_interval).await;
            return;
        }
        let _ = select_all(waits).await;

        for endpoint in self.endpoints.iter_mut().filter(|e| e.live) {
            while endpoint.conn.poll(Duration::ZERO).await {
                match endpoint.conn.recv().await {
                    Ok(msg) if *msg.action() == Action::Return => {
                        self.returns.push_back((endpoint.id, msg))
                    }
                    Ok(msg) => self.requests.push_back((endpoint.id, msg)),
                    Err(e) => {
                        warn!("failed to read from {} - {e}", endpoint.id);
                        endpoint.live = false;
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch queued requests, including ones queued while dispatching
    async fn dispatch_all(&mut self) {
        while let Some((from, msg)) = self.requests.pop_front() {
            self.dispatch(from, msg).await;
        }
        for (from, msg) in self.returns.drain(..) {
            debug!("dropping stale reply from {from} - {msg}");
        }
    }

    async fn dispatch(&mut self, from: ConnId, msg: Message) {
        match msg.action().clone() {
            Action::RegisterFunction => self.register_function(from, msg).await,
            Action::Close => self.close(from),
            Action::Call(name) => self.call(from, &name, msg).await,
            Action::Return => warn!("unexpected reply in request queue from {from} - {msg}"),
        }
    }

    async fn register_function(&mut self, from: ConnId, msg: Message) {
        let name = match msg.payload() {
            Ok(serde_json::Value::String(name)) => name.clone(),
            _ => {
                let err = CallError::InvalidArguments("function name is not a string".to_string());
                self.reply(from, Message::reply(&msg, Err(err))).await;
                return;
            }
        };

        if self.functions.contains_key(&name) {
            warn!("rejecting duplicate registration of {name} from {from}");
            let err = CallError::FunctionAlreadyRegistered(name);
            self.reply(from, Message::reply(&msg, Err(err))).await;
            return;
        }

        let long_running = msg.has_flag(Flag::LongRunning);
        info!("registered {name} for {from} long_running={long_running}");
        self.functions.insert(
            name,
            Registration {
                owner: from,
                long_running,
            },
        );
        self.reply(from, Message::reply(&msg, Ok("OK".into()))).await;
    }

    /// Remove sender. Its registrations stay behind as dead entries.
    fn close(&mut self, from: ConnId) {
        info!("client closed {from}");
        self.endpoints.retain(|e| e.id != from);
    }

    async fn call(&mut self, from: ConnId, name: &str, msg: Message) {
        let Some(reg) = self.functions.get(name).copied() else {
            let err = CallError::FunctionNotRegistered(name.to_string());
            self.reply(from, Message::reply(&msg, Err(err))).await;
            return;
        };

        let reply = match self.forward(reg, &msg).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("no response from {} for {name} - {e}", reg.owner);
                if e.is_transport() {
                    self.mark_broken(reg.owner);
                }
                Message::reply(&msg, Err(CallError::NoResponse))
            }
        };
        self.reply(from, reply).await;
    }

    /// Forward request to owner of function and wait for its reply
    async fn forward(&mut self, reg: Registration, msg: &Message) -> Result<Message> {
        let timeout = (!reg.long_running).then(|| self.config.reply_timeout());
        let owner = reg.owner;
        let endpoint = self
            .endpoints
            .iter_mut()
            .find(|e| e.id == owner)
            .ok_or(Error::UnknownConnection(owner))?;

        endpoint.conn.send(msg).await?;

        let requests = &mut self.requests;
        let returns = &mut self.returns;
        endpoint
            .conn
            .recv_reply(msg, timeout, move |m| {
                if *m.action() == Action::Return {
                    returns.push_back((owner, m));
                } else {
                    requests.push_back((owner, m));
                }
            })
            .await
    }

    /// Send message to endpoint, if still connected
    async fn reply(&mut self, to: ConnId, msg: Message) {
        let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.id == to) else {
            debug!("dropping reply for closed {to} - {msg}");
            return;
        };
        if let Err(e) = endpoint.conn.send(&msg).await {
            warn!("failed to reply to {to} - {e}");
            endpoint.live = false;
        }
    }

    fn mark_broken(&mut self, id: ConnId) {
        if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.live = false;
        }
    }
}
