//! Connection server -- the listening socket plus the services around it.
//!
//! Owns the accept loop, the connection manager with its two sweeps, the
//! event router and the message overseer. One instance is built by the
//! process's composition root and shared as `Arc<ConnectionServer>`.

use std::net::SocketAddr;
use std::sync::Arc;

use fleetlink_protocol::{Message, MessageError, Outcome, Rejection, RequestType};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::directory::ServerDirectory;
use crate::error::{ConnectionError, Result};
use crate::manager::{ConnectionManager, ManagerSettings};
use crate::observer::ErrorObserver;
use crate::overseer::MessageOverseer;
use crate::router::{EventHandler, EventRouter};

pub struct ConnectionServer {
    config: NodeConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    manager: Arc<ConnectionManager>,
    router: Arc<EventRouter>,
    overseer: Arc<MessageOverseer>,
    observer: Arc<dyn ErrorObserver>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionServer {
    /// Bind the listening socket. Nothing is accepted until `start`.
    pub async fn bind(
        config: NodeConfig,
        directory: Arc<dyn ServerDirectory>,
        observer: Arc<dyn ErrorObserver>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.server.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let router = Arc::new(EventRouter::new());
        let manager = ConnectionManager::new(
            ManagerSettings::from_config(&config),
            directory,
            Arc::clone(&observer),
            Arc::clone(&router),
            cancel.child_token(),
        );

        tracing::info!(%local_addr, "server: listening");
        Ok(Arc::new(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            manager,
            router,
            overseer: Arc::new(MessageOverseer::new()),
            observer,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn overseer(&self) -> &Arc<MessageOverseer> {
        &self.overseer
    }

    /// Spawn the accept loop and the lobby, heartbeat and overseer sweeps.
    pub async fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Err(ConnectionError::Transport("server already started".into()));
        };

        let timeouts = &self.config.timeouts;
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.manager),
            Arc::clone(&self.observer),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(
            Arc::clone(&self.manager).run_lobby_sweep(timeouts.lobby_sweep()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.manager).run_heartbeat_sweep(timeouts.heartbeat_sweep()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.overseer).run(self.config.overseer.sweep(), self.cancel.clone()),
        ));
        tracing::info!(addr = %self.local_addr, "server: started");
        Ok(())
    }

    /// Stop accepting, close every connection and wait for the loops to end.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manager.stop().await;
        // Never started: drop the bound socket
        self.listener.lock().await.take();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("server: background task ended abnormally: {e}");
            }
        }
        tracing::info!("server: stopped");
    }

    pub async fn client(&self, public_id: &str) -> Option<Arc<Connection>> {
        self.manager.find(public_id).await
    }

    /// Register the handler for inbound Messages of type `kind`.
    pub async fn on_message(&self, kind: &str, handler: impl EventHandler + 'static) {
        self.router.register(kind, Arc::new(handler)).await;
    }

    /// Send `message` to the server known as `public_id`.
    ///
    /// The message is watched by the overseer; its `on_response` or
    /// `on_error` handlers fire exactly once. With `block`, waits for the
    /// outcome and returns the reply; otherwise returns `None` at once.
    pub async fn send_message(
        &self,
        public_id: &str,
        message: Message,
        block: bool,
    ) -> Result<Option<Message>> {
        let mut message = message;
        let expires_at = Instant::now() + self.config.overseer.message_expiry();
        if block {
            message.synchronous();
        }

        let Some(conn) = self.client(public_id).await else {
            tracing::warn!(public_id, message_id = %message.id, "server: no such client");
            message.fail([MessageError::undeliverable()]);
            return Err(ConnectionError::Undeliverable {
                public_id: public_id.to_string(),
                message_id: message.id,
            });
        };
        if let Some(server_id) = conn.server_id() {
            message.server_id = Some(server_id.to_string());
        }
        self.overseer.watch(message.clone(), expires_at);

        let pending = match conn.dispatch_request(RequestType::Message, message.to_json()?).await {
            Ok(pending) => pending,
            Err(e) => {
                self.overseer.remove(&message.id);
                message.fail([MessageError::message(e.to_string())]);
                return Err(e);
            }
        };

        let overseer = Arc::clone(&self.overseer);
        let timeout = self.config.timeouts.response_timeout();
        let mut watched = message.clone();
        tokio::spawn(async move {
            let outcome = pending.wait(timeout).await;
            overseer.remove(&watched.id);
            match outcome {
                Outcome::Fulfilled(content) => match Message::from_json(&content) {
                    Ok(reply) if reply.has_errors() => {
                        watched.fail(reply.errors);
                    }
                    Ok(reply) => {
                        watched.deliver(&reply);
                    }
                    Err(e) => {
                        watched.fail([MessageError::message(e.to_string())]);
                    }
                },
                Outcome::Rejected(Rejection::Errors(errors)) => {
                    watched.fail(errors);
                }
                Outcome::Rejected(reason) => {
                    watched.fail([MessageError::message(reason.to_string())]);
                }
            }
        });

        if !block {
            return Ok(None);
        }
        match message.wait_for_response().await {
            Ok(reply) => Ok(Some(reply)),
            Err(Rejection::Errors(errors)) if errors.contains(&MessageError::undeliverable()) => {
                Err(ConnectionError::Undeliverable {
                    public_id: public_id.to_string(),
                    message_id: message.id,
                })
            }
            Err(rejection) => Err(ConnectionError::from_rejection(
                rejection,
                &message.id.simple().to_string(),
                timeout,
            )),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    observer: Arc<dyn ErrorObserver>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(peer = %addr, "server: accepted");
                if let Err(e) = manager.on_connect(stream).await {
                    observer.report("accept", &e);
                }
            }
            Err(e) => {
                observer.report("accept", &ConnectionError::Io(e));
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
    tracing::debug!("server: accept loop stopped");
}
