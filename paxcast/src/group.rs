//! Async runtime for one group member.
//!
//! A [`Group`] owns a spawned event loop around a [`Node`]. The loop is the
//! only place that touches protocol state: datagrams, client commands and
//! timer ticks are handled one at a time, in arrival order. Application code
//! talks to it through [`Group::broadcast`], which blocks until the leader's
//! Success for the value reaches this member.
//!
//! ```no_run
//! use paxcast::{Group, GroupConfig, Member, Membership, SeqNo};
//!
//! # async fn demo() -> Result<(), paxcast::PaxcastError> {
//! let members = ["127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002"]
//!     .map(|a| Member::new(a.parse().expect("address")));
//! let membership = Membership::new(members, members[0])?;
//! let app = |seq_no: SeqNo, payload: Vec<u8>| println!("{seq_no}: {payload:?}");
//!
//! let group = Group::bind_udp(membership, GroupConfig::default(), Box::new(app)).await?;
//! group.broadcast(b"hello".to_vec()).await?;
//! group.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::acceptor::MsgIdAllocator;
use crate::config::GroupConfig;
use crate::delivery::Application;
use crate::membership::{Member, Membership};
use crate::node::Node;
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::transport::Transport;
use crate::types::{MsgId, PaxcastError, Value};
use crate::udp::UdpTransport;
use crate::waiting::WaitingRoom;

/// Requests from client handles to the event loop.
#[derive(Debug)]
enum Command {
    /// Send (or resend) a broadcast request to the believed leader.
    Broadcast { value: Value, msg_id: MsgId },
}

/// A running group member.
#[derive(Debug)]
pub struct Group {
    me: Member,
    commands: mpsc::UnboundedSender<Command>,
    waiting: Arc<WaitingRoom>,
    msg_ids: Arc<MsgIdAllocator>,
    broadcast_wait: Duration,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Group {
    /// Start a member over a caller-supplied transport.
    ///
    /// `inbound` carries the raw datagrams addressed to this member. The
    /// event loop stops when [`shutdown`](Self::shutdown) is called, when
    /// the handle is dropped, or when `inbound` closes.
    pub fn start(
        membership: Membership,
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Vec<u8>>,
        app: Box<dyn Application>,
    ) -> Result<Self, PaxcastError> {
        Self::start_with_time(
            membership,
            config,
            transport,
            inbound,
            app,
            TokioTimeProvider::new(),
        )
    }

    /// Like [`start`](Self::start) with an explicit time source.
    pub fn start_with_time<T: TimeProvider>(
        membership: Membership,
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Vec<u8>>,
        app: Box<dyn Application>,
        time: T,
    ) -> Result<Self, PaxcastError> {
        Self::start_inner(
            membership,
            config,
            transport,
            inbound,
            app,
            time,
            CancellationToken::new(),
        )
    }

    /// Bind a UDP socket on this member's address and start it.
    pub async fn bind_udp(
        membership: Membership,
        config: GroupConfig,
        app: Box<dyn Application>,
    ) -> Result<Self, PaxcastError> {
        let udp = UdpTransport::bind(membership.me().addr()).await?;
        let token = CancellationToken::new();
        let inbound = udp.spawn_receiver(token.clone());
        Self::start_inner(
            membership,
            config,
            Arc::new(udp),
            inbound,
            app,
            TokioTimeProvider::new(),
            token,
        )
    }

    fn start_inner<T: TimeProvider>(
        membership: Membership,
        config: GroupConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Vec<u8>>,
        app: Box<dyn Application>,
        time: T,
        token: CancellationToken,
    ) -> Result<Self, PaxcastError> {
        let me = membership.me();
        let node = Node::new(membership, &config, transport, app, time.now())?;
        let waiting = node.waiting_room();
        let msg_ids = node.msg_id_allocator();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(
            node,
            inbound,
            command_rx,
            time,
            config.tick_interval,
            token.clone(),
        ));
        info!(member = %me, "group member started");

        Ok(Self {
            me,
            commands,
            waiting,
            msg_ids,
            broadcast_wait: config.broadcast_wait,
            token,
            task,
        })
    }

    /// This member's address.
    pub fn me(&self) -> Member {
        self.me
    }

    /// Broadcast `payload` to the group in total order.
    ///
    /// Returns once this member has received the leader's Success for the
    /// value, resending the request every `broadcast_wait` until then. The
    /// value reaches the local application through the same ordered path as
    /// every other member's values.
    ///
    /// Dropping the returned future stops waiting. The request may still be
    /// ordered if the leader already has it.
    #[instrument(skip(self, payload), fields(member = %self.me))]
    pub async fn broadcast(&self, payload: impl Into<Vec<u8>>) -> Result<MsgId, PaxcastError> {
        let value = Value::App(payload.into());
        let msg_id = self.msg_ids.next();
        // released on every exit, including a caller dropping this future
        let _registration = self.waiting.track(msg_id);

        let mut attempt = 0u32;
        loop {
            let command = Command::Broadcast {
                value: value.clone(),
                msg_id,
            };
            if self.commands.send(command).is_err() {
                return Err(PaxcastError::Shutdown);
            }
            if self.waiting.wait(msg_id, self.broadcast_wait).await {
                debug!(%msg_id, attempt, "broadcast complete");
                return Ok(msg_id);
            }
            attempt += 1;
            debug!(%msg_id, attempt, "broadcast not yet ordered, resending");
        }
    }

    /// Stop the event loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(member = %self.me, error = %e, "event loop ended abnormally");
        }
        info!(member = %self.me, "group member stopped");
    }
}

/// The event loop. Every protocol event for this member is handled here.
async fn run<T: TimeProvider>(
    mut node: Node,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    time: T,
    tick_interval: Duration,
    token: CancellationToken,
) {
    let mut next_tick = time.now() + tick_interval;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => node.handle_datagram(&frame, time.now()),
                None => {
                    debug!(member = %node.me(), "inbound channel closed");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Broadcast { value, msg_id }) => node.resend_broadcast(value, msg_id),
                // Every handle is gone.
                None => break,
            },
            _ = time.sleep(tick_interval) => {}
        }

        // Steady traffic keeps resetting the sleep above; tick on schedule anyway.
        let now = time.now();
        if now >= next_tick {
            node.tick(now);
            next_tick = now + tick_interval;
        }
    }
    token.cancel();
}
