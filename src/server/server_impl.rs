//! The server: bound socket, accept loop, live connections, delegate.

use crate::errors::ServerError;
use crate::http::request::{BodyKind, Request, RequestHead};
use crate::http::response::Response;
use crate::http::types::Method;
use crate::options::ServerOptions;
use crate::server::auth::Authenticator;
use crate::server::connection::Connection;
use crate::server::handlers::{
    make_process, match_any_path, match_base_path, match_exact_path, match_path_regex,
    serve_directory_process, serve_file_process, Handler, HandlerRegistry, MatchFn, MatchOutcome,
};
use crate::ws::frame::Message;
use crate::ws::server::{WebSocketOverlay, WebSocketSession, WebSocketTransport};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Optional notifications from the server lifecycle, each invoked on one
/// dedicated context so no two callbacks ever run concurrently.
#[derive(Default)]
pub struct ServerDelegate {
    /// The server bound its socket and began accepting.
    pub did_start: Option<Box<dyn Fn() + Send + Sync>>,
    /// The live-connection count left zero (coalesced).
    pub did_connect: Option<Box<dyn Fn() + Send + Sync>>,
    /// The live-connection count has stayed zero for the coalescing window.
    pub did_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
    /// The service announcer finished registering the advertised name.
    pub did_complete_service_registration: Option<Box<dyn Fn() + Send + Sync>>,
    /// The bound socket closed; in-flight connections may still drain.
    pub did_stop: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Hooks for external service discovery (e.g. Bonjour). The server calls
/// `announce` after binding and `withdraw` on stop; the registration
/// machinery itself lives outside this crate.
pub trait ServiceAnnouncer: Send + Sync {
    fn announce(&self, name: &str, port: u16);
    fn withdraw(&self);
}

pub(crate) enum DelegateEvent {
    DidStart,
    DidConnect,
    DidDisconnect,
    DidCompleteServiceRegistration,
    DidStop,
    WebSocketWillStart(WebSocketSession),
    WebSocketReceived(WebSocketSession, Message),
    WebSocketWillEnd(WebSocketSession),
}

/// Everything a connection task needs for its lifetime, snapshotted at start.
pub(crate) struct ConnectionContext {
    pub(crate) server_name: String,
    pub(crate) map_head_to_get: bool,
    pub(crate) authenticator: Option<Authenticator>,
    pub(crate) max_body_size: Option<u64>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) handlers: Arc<[Arc<Handler>]>,
    pub(crate) events: mpsc::UnboundedSender<DelegateEvent>,
    pub(crate) tracker: SharedTracker,
    pub(crate) web_socket: Option<Arc<WebSocketOverlay>>,
}

struct RunningState {
    port: u16,
    bonjour_name: Option<String>,
    shutdown: watch::Sender<bool>,
    pause: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    events: mpsc::UnboundedSender<DelegateEvent>,
}

/// An embeddable HTTP/1.1 server.
///
/// Handlers are registered while stopped, then `start` binds the socket and
/// serves until `stop`. In-flight connections always drain to natural
/// completion; `stop` never aborts them.
///
/// # Examples
///
/// ```no_run
/// use embed_web::{Server, ServerOptions, Response};
///
/// #[tokio::main]
/// async fn main() {
///     let mut server = Server::new();
///     server
///         .add_default_handler_for_method(embed_web::Method::Get, |_req| async {
///             Some(Response::text("hello"))
///         })
///         .unwrap();
///
///     server.start(ServerOptions::default()).await.unwrap();
///     tokio::signal::ctrl_c().await.unwrap();
///     server.stop().await;
/// }
/// ```
pub struct Server {
    registry: HandlerRegistry,
    delegate: Arc<ServerDelegate>,
    announcer: Option<Arc<dyn ServiceAnnouncer>>,
    web_socket: Option<WebSocketOverlay>,
    running: Option<RunningState>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::default(),
            delegate: Arc::new(ServerDelegate::default()),
            announcer: None,
            web_socket: None,
            running: None,
        }
    }

    /// Installs lifecycle callbacks. Replaces the previous delegate wholesale.
    pub fn set_delegate(&mut self, delegate: ServerDelegate) {
        self.delegate = Arc::new(delegate);
    }

    /// Supplies the service-discovery hooks used when
    /// [`ServerOptions::bonjour_name`] is set.
    pub fn set_service_announcer(&mut self, announcer: Arc<dyn ServiceAnnouncer>) {
        self.announcer = Some(announcer);
    }

    pub(crate) fn install_web_socket_overlay(&mut self, overlay: WebSocketOverlay) {
        self.web_socket = Some(overlay);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The bound port while running (meaningful with `port: 0` options).
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|state| state.port)
    }

    /// `http://localhost:<port>/` while running.
    pub fn server_url(&self) -> Option<String> {
        self.running
            .as_ref()
            .map(|state| match state.port {
                80 => "http://localhost/".to_string(),
                port => format!("http://localhost:{port}/"),
            })
    }

    fn ensure_stopped(&self) -> Result<(), ServerError> {
        match self.running.is_some() {
            true => Err(ServerError::HandlersLocked),
            false => Ok(()),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

// Handler registration. The list is append-only and frozen while running.
impl Server {
    /// Registers a raw (match, process) pair. The last-registered handler
    /// whose match returns a request wins.
    pub fn add_handler<M, P, Fut>(&mut self, matcher: M, process: P) -> Result<(), ServerError>
    where
        M: Fn(&RequestHead) -> Option<Request> + Send + Sync + 'static,
        P: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.ensure_stopped()?;
        let match_fn: MatchFn = Box::new(move |head| match matcher(head) {
            Some(request) => MatchOutcome::Matched(request),
            None => MatchOutcome::NoMatch,
        });
        self.registry.add(match_fn, make_process(process));
        Ok(())
    }

    pub fn remove_all_handlers(&mut self) -> Result<(), ServerError> {
        self.ensure_stopped()?;
        self.registry.clear();
        Ok(())
    }

    /// Matches every request with the given method, any path.
    pub fn add_default_handler_for_method<P, Fut>(
        &mut self,
        method: Method,
        process: P,
    ) -> Result<(), ServerError>
    where
        P: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.add_default_handler_for_method_with_body(method, BodyKind::None, process)
    }

    pub fn add_default_handler_for_method_with_body<P, Fut>(
        &mut self,
        method: Method,
        body_kind: BodyKind,
        process: P,
    ) -> Result<(), ServerError>
    where
        P: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.ensure_stopped()?;
        self.registry
            .add(match_any_path(method, body_kind), make_process(process));
        Ok(())
    }

    /// Case-insensitive exact-path handler.
    pub fn add_handler_for_path<P, Fut>(
        &mut self,
        method: Method,
        path: impl Into<String>,
        body_kind: BodyKind,
        process: P,
    ) -> Result<(), ServerError>
    where
        P: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.ensure_stopped()?;
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ServerError::InvalidHandler(format!(
                "path must start with '/': {path}"
            )));
        }
        self.registry
            .add(match_exact_path(method, path, body_kind), make_process(process));
        Ok(())
    }

    /// Case-insensitive regex handler, anchored over the whole decoded path.
    pub fn add_handler_for_path_regex<P, Fut>(
        &mut self,
        method: Method,
        pattern: &str,
        body_kind: BodyKind,
        process: P,
    ) -> Result<(), ServerError>
    where
        P: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.ensure_stopped()?;
        let match_fn = match_path_regex(method, pattern, body_kind)
            .map_err(|error| ServerError::InvalidHandler(error.to_string()))?;
        self.registry.add(match_fn, make_process(process));
        Ok(())
    }

    /// Serves fixed in-memory data for GET on `path`.
    pub fn add_get_handler_for_data(
        &mut self,
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
        cache_age: u32,
    ) -> Result<(), ServerError> {
        let data = data.into();
        let content_type = content_type.into();
        self.add_handler_for_path(Method::Get, path, BodyKind::None, move |_request| {
            let data = data.clone();
            let content_type = content_type.clone();
            async move {
                let mut response = Response::data(data, content_type);
                response.set_cache_control_max_age(cache_age);
                Some(response)
            }
        })
    }

    /// Serves one file for GET on `path`.
    pub fn add_get_handler_for_file(
        &mut self,
        path: impl Into<String>,
        file_path: impl Into<PathBuf>,
        is_attachment: bool,
        cache_age: u32,
        allow_range_requests: bool,
    ) -> Result<(), ServerError> {
        self.ensure_stopped()?;
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ServerError::InvalidHandler(format!(
                "path must start with '/': {path}"
            )));
        }
        self.registry.add(
            match_exact_path(Method::Get, path, BodyKind::None),
            serve_file_process(file_path.into(), is_attachment, cache_age, allow_range_requests),
        );
        Ok(())
    }

    /// Serves a directory tree for GET under `base_path` (recursive,
    /// case-sensitive). `index_filename` is tried for directory requests;
    /// otherwise an HTML listing is generated.
    pub fn add_get_handler_for_base_path(
        &mut self,
        base_path: impl Into<String>,
        directory: impl Into<PathBuf>,
        index_filename: Option<&str>,
        cache_age: u32,
        allow_range_requests: bool,
    ) -> Result<(), ServerError> {
        self.ensure_stopped()?;
        let base_path = base_path.into();
        if !base_path.starts_with('/') || !base_path.ends_with('/') {
            return Err(ServerError::InvalidHandler(format!(
                "base path must start and end with '/': {base_path}"
            )));
        }
        self.registry.add(
            match_base_path(Method::Get, base_path.clone(), BodyKind::None),
            serve_directory_process(
                base_path,
                directory.into(),
                index_filename.map(str::to_string),
                cache_age,
                allow_range_requests,
            ),
        );
        Ok(())
    }
}

// Lifecycle
impl Server {
    /// Binds the socket and starts serving. Fails when already running or
    /// the port cannot be bound.
    pub async fn start(&mut self, options: ServerOptions) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = bind_listener(options.port, options.max_pending_connections)
            .map_err(|source| ServerError::Bind {
                port: options.port,
                source,
            })?;
        let port = listener.local_addr()?.port();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);

        let tracker = Arc::new(Mutex::new(ConnectionTracker {
            count: 0,
            interval: options.connected_state_coalescing_interval,
            pending_disconnect: None,
            events: events_tx.clone(),
        }));

        let web_socket = self.web_socket.take().map(Arc::new);
        let transport = web_socket.as_ref().map(|overlay| overlay.transport.clone());

        let ctx = Arc::new(ConnectionContext {
            server_name: options.server_name.clone(),
            map_head_to_get: options.automatically_map_head_to_get,
            authenticator: options.authentication.as_ref().map(Authenticator::new),
            max_body_size: options.maximum_request_body_size,
            read_timeout: options.socket_read_timeout,
            write_timeout: options.socket_write_timeout,
            handlers: self.registry.snapshot(),
            events: events_tx.clone(),
            tracker,
            web_socket,
        });

        // One context for every delegate callback keeps them serialized.
        let delegate = self.delegate.clone();
        tokio::spawn(run_delegate_queue(events_rx, delegate, transport));

        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx, pause_rx));

        if let (Some(announcer), Some(name)) = (&self.announcer, &options.bonjour_name) {
            announcer.announce(name, port);
            let _ = events_tx.send(DelegateEvent::DidCompleteServiceRegistration);
        }
        let _ = events_tx.send(DelegateEvent::DidStart);
        tracing::info!(port, server_name = %options.server_name, "server started");

        self.running = Some(RunningState {
            port,
            bonjour_name: options.bonjour_name.clone(),
            shutdown: shutdown_tx,
            pause: pause_tx,
            accept_task,
            events: events_tx,
        });
        Ok(())
    }

    /// Closes the bound socket and returns once no further connections will
    /// be accepted. In-flight connections drain to natural completion.
    pub async fn stop(&mut self) {
        let Some(state) = self.running.take() else {
            return;
        };

        let _ = state.shutdown.send(true);
        let _ = state.accept_task.await;

        if let (Some(announcer), Some(_)) = (&self.announcer, &state.bonjour_name) {
            announcer.withdraw();
        }
        let _ = state.events.send(DelegateEvent::DidStop);
        tracing::info!(port = state.port, "server stopped");
    }

    /// Parks the accept loop while keeping the socket bound; part of the
    /// mobile background-suspend contract. Connections mid-request continue.
    pub fn pause_accepting(&self) -> Result<(), ServerError> {
        let state = self.running.as_ref().ok_or(ServerError::NotRunning)?;
        let _ = state.pause.send(true);
        tracing::debug!("accepting paused");
        Ok(())
    }

    pub fn resume_accepting(&self) -> Result<(), ServerError> {
        let state = self.running.as_ref().ok_or(ServerError::NotRunning)?;
        let _ = state.pause.send(false);
        tracing::debug!("accepting resumed");
        Ok(())
    }
}

/// Binds through socket2 so the backlog honors `max_pending_connections`.
fn bind_listener(port: u16, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&address.into())?;
    socket.listen(backlog as i32)?;

    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
    mut pause: watch::Receiver<bool>,
) {
    loop {
        if *pause.borrow() {
            tokio::select! {
                changed = pause.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = shutdown.changed() => return,
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    spawn_connection(stream, remote, ctx.clone());
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }
}

fn spawn_connection(stream: TcpStream, remote: SocketAddr, ctx: Arc<ConnectionContext>) {
    tracker_opened(&ctx.tracker);

    let guard_ctx = ctx.clone();
    tokio::spawn(async move {
        // The guard closes out the live count on every exit path, panics in
        // handler code included; dropping the task also drops the socket.
        let _guard = ConnectionGuard(guard_ctx);
        Connection::new(stream, remote, ctx).run().await;
    });
}

struct ConnectionGuard(Arc<ConnectionContext>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        tracker_closed(&self.0.tracker);
    }
}

async fn run_delegate_queue(
    mut events: mpsc::UnboundedReceiver<DelegateEvent>,
    delegate: Arc<ServerDelegate>,
    transport: Option<Arc<dyn WebSocketTransport>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DelegateEvent::DidStart => {
                if let Some(callback) = &delegate.did_start {
                    callback();
                }
            }
            DelegateEvent::DidConnect => {
                if let Some(callback) = &delegate.did_connect {
                    callback();
                }
            }
            DelegateEvent::DidDisconnect => {
                if let Some(callback) = &delegate.did_disconnect {
                    callback();
                }
            }
            DelegateEvent::DidCompleteServiceRegistration => {
                if let Some(callback) = &delegate.did_complete_service_registration {
                    callback();
                }
            }
            DelegateEvent::DidStop => {
                if let Some(callback) = &delegate.did_stop {
                    callback();
                }
            }
            DelegateEvent::WebSocketWillStart(session) => {
                if let Some(transport) = &transport {
                    transport.transport_will_start(&session);
                }
            }
            DelegateEvent::WebSocketReceived(session, message) => {
                if let Some(transport) = &transport {
                    transport.transport_received(&session, message);
                }
            }
            DelegateEvent::WebSocketWillEnd(session) => {
                if let Some(transport) = &transport {
                    transport.transport_will_end(&session);
                }
            }
        }
    }
}

// Connect/disconnect coalescing.
//
// `did_connect` fires on the 0 -> N edge. When the count returns to zero a
// timer arms for the coalescing interval; a reconnect inside the window
// cancels the pending `did_disconnect` AND suppresses its own `did_connect`,
// so transient bursts produce no events at all. A non-positive interval
// fires both edges synchronously with the transitions.

pub(crate) type SharedTracker = Arc<Mutex<ConnectionTracker>>;

pub(crate) struct ConnectionTracker {
    count: usize,
    interval: f64,
    pending_disconnect: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<DelegateEvent>,
}

fn tracker_opened(tracker: &SharedTracker) {
    let mut state = tracker.lock().expect("tracker mutex poisoned");
    state.count += 1;
    if state.count != 1 {
        return;
    }

    match state.pending_disconnect.take() {
        Some(timer) => timer.abort(), // burst coalesced away: no events
        None => {
            let _ = state.events.send(DelegateEvent::DidConnect);
        }
    }
}

fn tracker_closed(tracker: &SharedTracker) {
    let mut state = tracker.lock().expect("tracker mutex poisoned");
    state.count -= 1;
    if state.count != 0 {
        return;
    }

    if state.interval <= 0.0 {
        let _ = state.events.send(DelegateEvent::DidDisconnect);
        return;
    }

    let shared = tracker.clone();
    let interval = Duration::from_secs_f64(state.interval);
    state.pending_disconnect = Some(tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        let mut state = shared.lock().expect("tracker mutex poisoned");
        state.pending_disconnect = None;
        if state.count == 0 {
            let _ = state.events.send(DelegateEvent::DidDisconnect);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracker(interval: f64) -> (SharedTracker, mpsc::UnboundedReceiver<DelegateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Mutex::new(ConnectionTracker {
            count: 0,
            interval,
            pending_disconnect: None,
            events: tx,
        }));
        (tracker, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DelegateEvent>) -> Vec<&'static str> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(match event {
                DelegateEvent::DidConnect => "connect",
                DelegateEvent::DidDisconnect => "disconnect",
                _ => "other",
            });
        }
        seen
    }

    #[tokio::test]
    async fn synchronous_events_without_coalescing() {
        let (tracker, mut rx) = test_tracker(0.0);

        tracker_opened(&tracker);
        tracker_opened(&tracker);
        tracker_closed(&tracker);
        tracker_closed(&tracker);

        assert_eq!(drain(&mut rx), ["connect", "disconnect"]);
    }

    #[tokio::test]
    async fn burst_within_window_is_silent() {
        let (tracker, mut rx) = test_tracker(0.05);

        tracker_opened(&tracker);
        assert_eq!(drain(&mut rx), ["connect"]);

        // Drop to zero and reconnect inside the window: both edges vanish.
        tracker_closed(&tracker);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker_opened(&tracker);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(drain(&mut rx), Vec::<&str>::new());

        // Final close fires the coalesced disconnect after the window.
        tracker_closed(&tracker);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(drain(&mut rx), ["disconnect"]);
    }

    #[tokio::test]
    async fn disconnect_waits_for_window() {
        let (tracker, mut rx) = test_tracker(0.05);

        tracker_opened(&tracker);
        tracker_closed(&tracker);
        assert_eq!(drain(&mut rx), ["connect"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(drain(&mut rx), ["disconnect"]);
    }
}
