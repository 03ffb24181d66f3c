//! Server orchestration
//!
//! [`TunnelServer`] owns the UDP socket, the TUN device, and the session
//! repository, and runs the three long-lived tasks (UDP ingress, TUN
//! egress, idle reaper) plus the registrar's short-lived handshake tasks.
//! Shutdown flips a watch channel every loop selects on, closes the
//! registration queues, and terminates (and zeroizes) every session.

pub mod control;
pub mod ingress;
pub mod reaper;
pub mod registration;
pub mod tun_egress;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::error::{NetworkError, Result, TunWardenError};
use crate::protocol::handshake::IkResponderFactory;
use crate::server::ingress::{Dataplane, UdpIngress};
use crate::server::reaper::IdleReaper;
use crate::server::registration::{RegistrationLimits, Registrar};
use crate::server::tun_egress::TunEgress;
use crate::session::repository::SessionRepository;
use crate::tunnel::TunDevice;

/// The tunwarden server: one UDP listener multiplexing all sessions.
pub struct TunnelServer {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    tun: Arc<TunDevice>,
    repo: Arc<SessionRepository>,
    registrar: Arc<Registrar>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelServer {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let socket = Arc::new(bind_socket(
            config.interface.listen_port,
            config.interface.recv_buffer,
            config.interface.send_buffer,
        )?);
        tracing::info!("Server listening on UDP port {}", config.interface.listen_port);

        let tun = Arc::new(
            TunDevice::create(
                config.server_addr(),
                config.interface.subnet.prefix_len(),
                config.interface.mtu,
            )
            .await?,
        );

        let repo = Arc::new(SessionRepository::new());
        let factory = Arc::new(IkResponderFactory::new(config.interface.private_key));
        let registrar = Arc::new(Registrar::new(
            socket.clone(),
            repo.clone(),
            factory,
            config.acl(),
            config.interface.subnet,
            config.server_addr(),
            RegistrationLimits {
                max_concurrent: config.interface.max_registrations,
                queue_capacity: config.interface.registration_queue,
                ..RegistrationLimits::default()
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            socket,
            tun,
            repo,
            registrar,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The session repository, for external collaborators (TCP-mode
    /// registration, tests, operator tooling).
    pub fn repository(&self) -> Arc<SessionRepository> {
        self.repo.clone()
    }

    /// Signal every loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until Ctrl-C or a core task dies, then tear down.
    pub async fn run(&mut self) -> Result<()> {
        let mtu = usize::from(self.config.interface.mtu);

        let dataplane = Arc::new(Dataplane::new(
            self.repo.clone(),
            self.registrar.clone(),
            self.tun.clone(),
        ));
        let ingress = UdpIngress::new(
            self.socket.clone(),
            dataplane,
            self.shutdown_rx.clone(),
            mtu,
        );
        let egress = TunEgress::new(
            self.tun.clone(),
            self.repo.clone(),
            self.socket.clone(),
            self.shutdown_rx.clone(),
            mtu,
        );
        let reaper = IdleReaper::new(
            self.repo.clone(),
            self.config.interface.idle_timeout,
            self.config.interface.reap_interval,
            self.shutdown_rx.clone(),
        );

        let mut ingress_task = tokio::spawn(ingress.run());
        let mut egress_task = tokio::spawn(egress.run());
        let mut reaper_task = tokio::spawn(reaper.run());

        let result = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                Ok(())
            }
            result = &mut ingress_task => task_result("UDP ingress", result),
            result = &mut egress_task => task_result("TUN egress", result),
            result = &mut reaper_task => task_result("idle reaper", result),
        };

        self.shutdown();
        self.registrar.close_all();
        for task in [ingress_task, egress_task, reaper_task] {
            if !task.is_finished() {
                let _ = task.await;
            }
        }

        let peers = self.repo.all_peers();
        for peer in &peers {
            self.repo.delete(peer);
        }
        if !peers.is_empty() {
            tracing::info!(count = peers.len(), "terminated sessions on shutdown");
        }

        result
    }
}

fn task_result(
    name: &str,
    result: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(inner) => {
            if let Err(e) = &inner {
                tracing::error!("{} failed: {}", name, e);
            }
            inner
        }
        Err(e) => {
            tracing::error!("{} panicked: {}", name, e);
            Err(TunWardenError::System(std::io::Error::other(e.to_string())))
        }
    }
}

/// Bind the UDP listener with the configured socket buffer sizes.
fn bind_socket(port: u16, recv_buffer: usize, send_buffer: usize) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(NetworkError::Io)?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        tracing::warn!("could not set receive buffer to {}: {}", recv_buffer, e);
    }
    if let Err(e) = socket.set_send_buffer_size(send_buffer) {
        tracing::warn!("could not set send buffer to {}: {}", send_buffer, e);
    }
    socket.set_nonblocking(true).map_err(NetworkError::Io)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::Io(e).into())
}
