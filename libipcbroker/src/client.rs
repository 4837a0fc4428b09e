//! Client exposing local functions to, and calling remote functions through, a broker
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::connection::{Reader, Writer};
use crate::periodic::{Periodic, Work};
use crate::{Action, Args, Broker, CallError, Config, Connection, Error, Message, Result};

/// Function callable through the broker
pub type Function = Arc<dyn Fn(Args) -> std::result::Result<Value, CallError> + Send + Sync>;

/// Handle for a broker client
pub struct Client {
    inner: Arc<Inner>,
    periodic: Periodic,
}

struct Inner {
    config: Config,
    /// Receiving side of connection. Held by a request for its whole round trip.
    inbox: Mutex<Inbox>,
    /// Sending side of connection. Only held while a message is written.
    writer: Mutex<Writer>,
    /// Requests from broker awaiting dispatch
    pending: Mutex<mpsc::UnboundedReceiver<Message>>,
    /// Functions served by this client
    functions: RwLock<HashMap<String, Function>>,
}

struct Inbox {
    reader: Reader,
    requests: mpsc::UnboundedSender<Message>,
    /// Replies nobody was waiting for
    returns: VecDeque<Message>,
    connected: bool,
}

struct ClientWorker(Arc<Inner>);

impl Client {
    /// Register a new client with given broker
    pub async fn new(broker: &Broker) -> Result<Self> {
        let conn = broker.register_client().await?;
        Ok(Self::with_connection(conn, broker.config().clone()))
    }

    /// Connect to a broker listening at socket path
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::connect(path).await?;
        Ok(Self::with_connection(conn, Config::default()))
    }

    /// Create new client over an established connection to broker
    pub fn with_connection(conn: Connection, config: Config) -> Self {
        let periodic = Periodic::new("client", config.idle_delay, config.stop_timeout);
        let (reader, writer) = conn.split();
        let (requests, pending) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            inbox: Mutex::new(Inbox {
                reader,
                requests,
                returns: VecDeque::new(),
                connected: true,
            }),
            writer: Mutex::new(writer),
            pending: Mutex::new(pending),
            functions: RwLock::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
            periodic,
        }
    }

    /// Name the serving loop, used to tell clients apart in logs. Applies from the next
    /// [Client::start].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.periodic.set_name(name);
        self
    }

    pub fn name(&self) -> &str {
        self.periodic.name()
    }

    /// Call a function. Locally registered functions are invoked directly, everything else is
    /// called through the broker.
    pub async fn call(&self, name: &str, args: Args) -> Result<Value> {
        let local = self.inner.functions.read().await.get(name).cloned();
        match local {
            Some(f) => Ok(invoke(f, args).await?),
            None => self.inner.remote_call(name, args).await,
        }
    }

    /// Register a function with broker, subject to broker's reply timeout
    pub async fn register_function<F, R>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Args) -> std::result::Result<R, CallError> + Send + Sync + 'static,
        R: Serialize,
    {
        self.inner.register(name, wrap(f), false).await
    }

    /// Register a function with broker that may take arbitrarily long to reply
    pub async fn register_long_running_function<F, R>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Args) -> std::result::Result<R, CallError> + Send + Sync + 'static,
        R: Serialize,
    {
        self.inner.register(name, wrap(f), true).await
    }

    /// Whether `name` is served by this client
    pub async fn is_local(&self, name: &str) -> bool {
        self.inner.functions.read().await.contains_key(name)
    }

    /// Start serving requests from broker on a dedicated task
    pub fn start(&mut self) -> Result<()> {
        self.periodic.start(ClientWorker(self.inner.clone()))
    }

    /// Stop serving requests
    pub async fn stop(&mut self) -> Result<()> {
        self.periodic.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.periodic.is_running()
    }

    /// Stop serving and ask broker to remove this client
    pub async fn close(mut self) -> Result<()> {
        if self.periodic.is_running() {
            self.periodic.stop().await?;
        }
        let mut writer = self.inner.writer.lock().await;
        writer.send(&Message::close()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("periodic", &self.periodic)
            .finish_non_exhaustive()
    }
}

impl Work for ClientWorker {
    async fn work(&mut self) {
        self.0.work().await
    }
}

impl Inner {
    async fn register(&self, name: &str, f: Function, long_running: bool) -> Result<()> {
        if self.functions.read().await.contains_key(name) {
            return Err(Error::AlreadyRegisteredLocally(name.to_string()));
        }

        let request = Message::register_function(name, long_running);
        let reply = self.request(&request).await?;
        match reply.into_payload()? {
            Value::String(ok) if ok == "OK" => {
                debug!("registered {name} long_running={long_running}");
                self.functions.write().await.insert(name.to_string(), f);
                Ok(())
            }
            other => Err(Error::RegistrationRejected(other)),
        }
    }

    async fn remote_call(&self, name: &str, args: Args) -> Result<Value> {
        let request = Message::call(name, &args)?;
        let reply = self.request(&request).await?;
        Ok(reply.into_payload()?)
    }

    /// Send request to broker and wait for its reply, without timeout. Only one request is
    /// outstanding at a time.
    async fn request(&self, request: &Message) -> Result<Message> {
        let mut inbox = self.inbox.lock().await;
        self.writer.lock().await.send(request).await?;
        let reply = inbox.recv_reply(request).await?;
        Ok(reply)
    }

    /// One receive + dispatch cycle
    async fn work(&self) {
        // A request waiting on its reply owns the inbox and queues requests for us instead
        if let Ok(mut inbox) = self.inbox.try_lock() {
            inbox.fill(self.config.poll_interval).await;
        }
        let requests = {
            let mut pending = self.pending.lock().await;
            let mut requests = vec![];
            while let Ok(msg) = pending.try_recv() {
                requests.push(msg);
            }
            requests
        };
        for request in requests {
            self.dispatch(request).await;
        }
    }

    /// Serve a request and send its result back to broker. Does not touch the inbox, so a
    /// reply goes out even while a request of ours is waiting on the broker.
    async fn dispatch(&self, request: Message) {
        let result = self.serve(&request).await;
        if let Err(e) = &result {
            debug!("request {} failed - {e}", request.correlation_id());
        }
        let reply = Message::reply(&request, result);
        if let Err(e) = self.writer.lock().await.send(&reply).await {
            warn!("failed to reply to {} - {e}", request.correlation_id());
        }
    }

    async fn serve(&self, request: &Message) -> std::result::Result<Value, CallError> {
        let payload = request.payload().cloned().map_err(|_| {
            CallError::InvalidArguments("payload is not an argument bundle".to_string())
        })?;
        let args = Args::try_from(payload)?;

        let name = match request.action() {
            Action::Call(name) => name,
            action => return Err(CallError::FunctionNotKnown(action.to_string())),
        };
        let f = self
            .functions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CallError::FunctionNotKnown(name.clone()))?;
        invoke(f, args).await
    }
}

impl Inbox {
    /// Receive until reply to `request` arrives, queueing everything else
    async fn recv_reply(&mut self, request: &Message) -> Result<Message> {
        let requests = &self.requests;
        let returns = &mut self.returns;
        self.reader
            .recv_reply(request, None, move |m| {
                if *m.action() == Action::Return {
                    returns.push_back(m);
                } else {
                    let _ = requests.send(m);
                }
            })
            .await
    }

    /// Drain available messages from broker into queues, waiting up to `poll_interval` for the
    /// first one
    async fn fill(&mut self, poll_interval: Duration) {
        if !self.connected {
            return;
        }
        let mut timeout = poll_interval;
        while self.reader.poll(timeout).await {
            timeout = Duration::ZERO;
            match self.reader.recv().await {
                Ok(msg) if *msg.action() == Action::Return => self.returns.push_back(msg),
                Ok(msg) => {
                    let _ = self.requests.send(msg);
                }
                Err(e) => {
                    warn!("lost connection to broker - {e}");
                    self.connected = false;
                    break;
                }
            }
        }
        // Requests hold the inbox for their whole round trip, so queued replies are late
        for msg in self.returns.drain(..) {
            debug!("dropping stale reply - {msg}");
        }
    }
}

fn wrap<F, R>(f: F) -> Function
where
    F: Fn(Args) -> std::result::Result<R, CallError> + Send + Sync + 'static,
    R: Serialize,
{
    Arc::new(move |args: Args| f(args).and_then(|r| serde_json::to_value(r).map_err(CallError::failed)))
}

/// Run function off the async workers
async fn invoke(f: Function, args: Args) -> std::result::Result<Value, CallError> {
    match tokio::task::spawn_blocking(move || f(args)).await {
        Ok(result) => result,
        Err(e) => Err(CallError::failed(e)),
    }
}
