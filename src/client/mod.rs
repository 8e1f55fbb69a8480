//! Client: the process-level owner of torrents and the listen socket.
//!
//! One client identity (peer id, port) is shared by every torrent. Each
//! torrent runs on its own controller task; the client's accept loop reads
//! just enough of an inbound connection to learn which torrent it is for,
//! then hands the socket over to that controller.
use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::strategy::RarestFirst;
use crate::torrent::Input;
use crate::torrent::Torrent;
use crate::tracker;
use crate::wire::Handshake;

use anyhow::Context;
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// How long an inbound connection gets to produce its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    config: Config,
    peer_id: [u8; 20],
    torrents: Vec<Torrent>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            peer_id: tracker::generate_peer_id(),
            torrents: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Registers a torrent. Storage is created here, so a bad download
    /// directory fails fast instead of mid-swarm.
    pub fn add_torrent(&mut self, metainfo: Metainfo) -> anyhow::Result<()> {
        let torrent = Torrent::new(
            metainfo,
            self.config.clone(),
            self.peer_id,
            Box::new(RarestFirst::default()),
        )
        .context("creating torrent storage")?;
        tracing::info!(name = %torrent.name(), "Added torrent");
        self.torrents.push(torrent);
        Ok(())
    }

    /**
    Runs every registered torrent to completion.

    # How it works:
    1. Binds the listen socket and spawns the accept loop, which routes
       inbound connections by the info-hash in their handshake.
    2. Spawns one controller task per torrent.
    3. Waits for all controllers; the first storage failure aborts the
       whole download with that error.
    */
    pub async fn download_all(self) -> anyhow::Result<()> {
        let routes: HashMap<[u8; 20], mpsc::Sender<Input>> = self
            .torrents
            .iter()
            .map(|t| (t.info_hash(), t.input_sender()))
            .collect();

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("binding listen port {}", self.config.port))?;
        tracing::info!(port = self.config.port, "Listening for peers");
        let accept_task = tokio::spawn(accept_loop(listener, routes.clone()));

        // Ctrl-C asks every torrent to leave the swarm politely (stopped
        // announce) instead of vanishing.
        let signal_routes: Vec<mpsc::Sender<Input>> = routes.values().cloned().collect();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, stopping torrents");
                for route in signal_routes {
                    let _ = route.send(Input::Shutdown).await;
                }
            }
        });

        let mut controllers = Vec::new();
        for mut torrent in self.torrents {
            controllers.push(tokio::spawn(async move { torrent.run().await }));
        }
        let mut outcome = Ok(());
        for controller in controllers {
            match controller.await {
                Ok(Ok(())) => {}
                Ok(Err(torrent_error)) => {
                    outcome = Err(anyhow::Error::new(torrent_error));
                }
                Err(join_error) => {
                    outcome = Err(anyhow::Error::new(join_error));
                }
            }
        }

        accept_task.abort();
        signal_task.abort();
        outcome
    }
}

/// Accepts connections forever; each one gets its own short-lived task
/// for the handshake read so a slow peer cannot stall the loop.
async fn accept_loop(
    listener: TcpListener,
    routes: HashMap<[u8; 20], mpsc::Sender<Input>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "Inbound connection");
                let routes = routes.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, admit(stream, addr, &routes))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(reason)) => {
                            tracing::debug!(%addr, %reason, "Rejected inbound connection");
                        }
                        Err(_) => {
                            tracing::debug!(%addr, "Inbound handshake timed out");
                        }
                    }
                });
            }
            Err(accept_error) => {
                tracing::warn!(error = %accept_error, "Accept failed");
            }
        }
    }
}

/**
Reads the handshake off a fresh inbound connection and routes the socket
to the torrent it belongs to.

A wrong protocol string or an info-hash naming no torrent we own means
the connection is dropped on the floor. Bytes that arrived behind the
handshake travel along as leftover so nothing is lost to the handoff.
*/
async fn admit(
    mut stream: TcpStream,
    addr: SocketAddr,
    routes: &HashMap<[u8; 20], mpsc::Sender<Input>>,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(512);
    let handshake = loop {
        if let Some(handshake) = Handshake::parse(&mut buf)? {
            break handshake;
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed before handshake");
        }
    };

    if !handshake.is_standard_protocol() {
        anyhow::bail!("unknown protocol string");
    }
    let Some(route) = routes.get(&handshake.info_hash) else {
        anyhow::bail!("handshake for a torrent we do not have");
    };
    route
        .send(Input::Inbound {
            addr,
            stream,
            remote: handshake,
            leftover: buf.freeze(),
        })
        .await
        .context("torrent controller gone")?;
    Ok(())
}
