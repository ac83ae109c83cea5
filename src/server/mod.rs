//! The relay server: binds a TCP listener, accepts connections and wires
//! each one into the registry and the fan-out dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::connection::{ConnectionHandle, ConnectionIdAllocator, ConnectionRegistry, RegistryStats};
use crate::error::{RelayError, Result};
use crate::relay::{RelayDispatcher, RelayEvent, RelayStatsSnapshot};
use crate::shutdown::{ShutdownCoordinator, ShutdownResult};

/// Capacity of the external subscriber channel.
const SUBSCRIBER_BUFFER: usize = 256;

/// Backoff after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

pub struct RelayServer {
    settings: Settings,
    registry: Arc<ConnectionRegistry>,
    allocator: ConnectionIdAllocator,
    dispatcher: Arc<RelayDispatcher>,
    subscribers: broadcast::Sender<RelayEvent>,
    inbound_tx: mpsc::Sender<RelayEvent>,
    inbound_rx: Mutex<Option<mpsc::Receiver<RelayEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_started: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.relay.inbound_buffer);
        let (shutdown_tx, _) = watch::channel(false);
        let dispatcher = Arc::new(RelayDispatcher::new(registry.clone(), subscribers.clone()));

        Self {
            settings,
            registry,
            allocator: ConnectionIdAllocator::new(),
            dispatcher,
            subscribers,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            shutdown_started: AtomicBool::new(false),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            dispatcher_task: Mutex::new(None),
        }
    }

    /// Bind the listener and start the fan-out dispatcher. Does not accept
    /// yet; that is `listen`. A bind failure is fatal and surfaced to the
    /// caller, never retried.
    pub async fn bind(&self) -> Result<SocketAddr> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }

        let addr: SocketAddr = self.settings.server_addr().parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        *self.listener.lock().unwrap() = Some(listener);
        *self.local_addr.lock().unwrap() = Some(local_addr);

        if let Some(inbound_rx) = self.inbound_rx.lock().unwrap().take() {
            let dispatcher = self.dispatcher.clone();
            *self.dispatcher_task.lock().unwrap() = Some(tokio::spawn(dispatcher.run(inbound_rx)));
        }

        tracing::info!(addr = %local_addr, "Relay server bound");
        Ok(local_addr)
    }

    /// The address actually bound, available after `bind`. With port 0 in
    /// the settings this is the OS-assigned ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Accept connections until the shutdown signal fires. The caller
    /// decides whether to await this or spawn it.
    pub async fn listen(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(RelayError::ShuttingDown);
        }

        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or(RelayError::NotBound)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tracing::info!("Accepting connections");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        // An accept that races the shutdown signal must not
                        // register the socket.
                        if *shutdown_rx.borrow() {
                            tracing::debug!(peer = %peer_addr, "Accepted during shutdown, discarding");
                            drop(stream);
                            break;
                        }
                        self.admit(stream, peer_addr);
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Accept loop stopped");
        Ok(())
    }

    /// Wrap an accepted socket in a handle, register it and start its
    /// receive loop.
    fn admit(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let id = self.allocator.allocate();
        let handle = Arc::new(ConnectionHandle::new(
            id,
            stream,
            peer_addr,
            &self.settings.relay,
            self.shutdown_tx.subscribe(),
            self.inbound_tx.clone(),
        ));

        self.registry.insert(handle.clone());
        handle.start();

        tracing::info!(connection_id = %id, peer = %peer_addr, "Connection accepted");

        // When the receive loop ends, for whatever reason, the connection
        // disposes itself without taking the server down.
        let registry = self.registry.clone();
        let join_timeout = self.settings.shutdown.join_timeout();
        let remove_on_disconnect = self.settings.relay.remove_on_disconnect;
        tokio::spawn(async move {
            handle.closed().await;
            handle.dispose(join_timeout).await;
            if remove_on_disconnect {
                registry.remove(handle.id);
            }
        });
    }

    /// Subscribe to relayed messages. The only way outside code observes
    /// what the server forwards.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.subscribers.subscribe()
    }

    /// Full teardown: stop listening, fire the root shutdown signal and
    /// dispose every registered connection. Idempotent under concurrent
    /// callers; only the first performs the teardown and gets the result.
    pub async fn shutdown(&self) -> Option<ShutdownResult> {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return None;
        }

        // Drop the listener if `listen` never took it; a running accept
        // loop exits on the signal below and drops its own.
        self.listener.lock().unwrap().take();

        let coordinator = ShutdownCoordinator::new(
            self.registry.clone(),
            self.shutdown_tx.clone(),
            self.settings.shutdown.clone(),
        );
        let result = coordinator.execute("server dispose").await;

        // Defensive second pass over anything still registered.
        let join_timeout = self.settings.shutdown.join_timeout();
        for handle in self.registry.all() {
            if !handle.is_disposed() {
                handle.dispose(join_timeout).await;
            }
        }

        if let Some(task) = self.dispatcher_task.lock().unwrap().take() {
            task.abort();
        }

        tracing::info!("Relay server disposed");
        Some(result)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn relay_stats(&self) -> RelayStatsSnapshot {
        self.dispatcher.stats()
    }
}
