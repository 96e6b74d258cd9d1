//! A single-threaded, poll-based [`spv_net::Reactor`] implementation,
//! driving a [`StateMachine`] against real TCP sockets.
//!
//! One [`mio`] poll loop owns every peer socket as well as the listener;
//! there is no I/O thread per peer. The state machine itself never touches a
//! socket — it only yields [`Io`] values, which this reactor interprets.
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use spv_common::block::time::{AdjustedClock, LocalTime};
use spv_common::p2p::peer;
use spv_net::{Disconnect, Link, Reactor as ReactorTrait, StateMachine as _};
use spv_p2p::fsm::codec::Codec;
use spv_p2p::fsm::{ChainStore, Command, Connector, Io, PeerId, StateMachine};

use crate::Error;

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);
const FIRST_PEER_TOKEN: usize = 2;

/// Upper bound on a single poll iteration, so the state machine's `tick` and
/// any armed timer still run even when no socket has anything ready.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-connection socket state.
struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    link: Link,
    /// `false` while an outbound connect is still in flight.
    established: bool,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    writable: bool,
}

/// Drives a [`StateMachine`] with a single poll loop over real sockets.
///
/// Listens for inbound connections on the addresses given to [`Reactor::run`]
/// and dials outbound ones as the state machine requests them via
/// [`Io::Connect`].
pub struct Reactor<T, P, C> {
    poll: Poll,
    waker: Arc<Waker>,
    listener: Option<TcpListener>,
    peers: HashMap<Token, Peer>,
    tokens: HashMap<SocketAddr, Token>,
    next_token: usize,
    codec: Codec,
    commands: crossbeam_channel::Receiver<Command>,
    events: crossbeam_channel::Sender<spv_p2p::fsm::Event>,
    _marker: std::marker::PhantomData<(T, P, C)>,
}

impl<T, P, C> Reactor<T, P, C> {
    /// Construct a reactor for the given network, fed commands from
    /// `commands` and forwarding protocol events onto `events`.
    pub fn new(
        network: spv_common::network::Network,
        commands: crossbeam_channel::Receiver<Command>,
        events: crossbeam_channel::Sender<spv_p2p::fsm::Event>,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            poll,
            waker: Arc::new(waker),
            listener: None,
            peers: HashMap::new(),
            tokens: HashMap::new(),
            next_token: FIRST_PEER_TOKEN,
            codec: Codec::new(network.into()),
            commands,
            events,
            _marker: std::marker::PhantomData,
        })
    }

    /// A handle to this reactor's waker, for interrupting its poll loop from
    /// another thread after sending it a command.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}

impl<T, P, C> Connector for Reactor<T, P, C> {
    fn open(&mut self, addr: SocketAddr) {
        if let Err(err) = self.dial(addr) {
            log::error!(target: "client", "failed to connect to {}: {}", addr, err);
        }
    }

    fn close_connections(&mut self, n: usize) {
        let victims: Vec<Token> = self.peers.keys().copied().take(n).collect();
        for token in victims {
            if let Some(mut peer) = self.peers.remove(&token) {
                self.tokens.remove(&peer.addr);
                let _ = self.poll.registry().deregister(&mut peer.stream);
            }
        }
    }

    fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.established).count()
    }
}

impl<T, P, C> Reactor<T, P, C> {
    /// Begin a non-blocking outbound connection, registering it for write
    /// readiness so we learn when it completes (or fails).
    fn dial(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut stream = TcpStream::connect(addr)?;
        let token = self.allocate_token();

        self.poll.registry().register(&mut stream, token, Interest::WRITABLE)?;
        self.tokens.insert(addr, token);
        self.peers.insert(
            token,
            Peer {
                stream,
                addr,
                link: Link::Outbound,
                established: false,
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                writable: false,
            },
        );
        Ok(())
    }

    fn accept_all(&mut self, state_machine: &mut StateMachine<T, P, C>) -> io::Result<()>
    where
        T: ChainStore,
        P: peer::Store,
        C: AdjustedClock<PeerId>,
    {
        if self.listener.is_none() {
            return Ok(());
        }

        loop {
            let (mut stream, addr) = match self.listener.as_ref().unwrap().accept() {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            };
            let local_addr = stream.local_addr()?;
            let token = self.allocate_token();

            self.poll.registry().register(&mut stream, token, Interest::READABLE)?;
            self.tokens.insert(addr, token);
            self.peers.insert(
                token,
                Peer {
                    stream,
                    addr,
                    link: Link::Inbound,
                    established: true,
                    read_buf: Vec::new(),
                    write_buf: Vec::new(),
                    writable: false,
                },
            );
            state_machine.connected(addr, &local_addr, Link::Inbound);
        }
        Ok(())
    }

    fn handle_connect_complete(&mut self, token: Token, state_machine: &mut StateMachine<T, P, C>)
    where
        T: ChainStore,
        P: peer::Store,
        C: AdjustedClock<PeerId>,
    {
        let (addr, result) = {
            let peer = match self.peers.get_mut(&token) {
                Some(peer) => peer,
                None => return,
            };
            let result = peer.stream.take_error().and_then(|maybe_err| match maybe_err {
                Some(err) => Err(err),
                None => peer.stream.local_addr(),
            });
            (peer.addr, result)
        };

        match result {
            Ok(local_addr) => {
                if let Some(peer) = self.peers.get_mut(&token) {
                    peer.established = true;
                    let _ = self.poll.registry().reregister(&mut peer.stream, token, Interest::READABLE);
                }
                state_machine.connected(addr, &local_addr, Link::Outbound);
            }
            Err(err) => {
                self.peers.remove(&token);
                self.tokens.remove(&addr);
                state_machine.disconnected(&addr, Disconnect::ConnectionError(err.to_string()));
            }
        }
    }

    fn readable(&mut self, token: Token, state_machine: &mut StateMachine<T, P, C>)
    where
        T: ChainStore,
        P: peer::Store,
        C: AdjustedClock<PeerId>,
    {
        let mut chunk = [0u8; 64 * 1024];
        let mut total_read = 0usize;
        let (addr, outcome) = {
            let peer = match self.peers.get_mut(&token) {
                Some(peer) => peer,
                None => return,
            };
            let outcome = loop {
                match peer.stream.read(&mut chunk) {
                    Ok(0) => break Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                    Ok(n) => {
                        peer.read_buf.extend_from_slice(&chunk[..n]);
                        total_read += n;
                        if n < chunk.len() {
                            break Ok(());
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => break Err(err),
                }
            };
            (peer.addr, outcome)
        };

        if total_read > 0 {
            state_machine.record_received(&addr, total_read);
        }

        if let Err(err) = outcome {
            self.close_peer(token, &addr, Disconnect::ConnectionError(err.to_string()), state_machine);
            return;
        }

        loop {
            let decoded = {
                let peer = match self.peers.get_mut(&token) {
                    Some(peer) => peer,
                    None => return,
                };
                self.codec.decode(&mut peer.read_buf)
            };
            match decoded {
                Ok(Some(message)) => state_machine.message_received(&addr, Cow::Owned(message)),
                Ok(None) => break,
                Err(err) => {
                    self.close_peer(token, &addr, Disconnect::ConnectionError(err.to_string()), state_machine);
                    break;
                }
            }
        }
    }

    fn writable(&mut self, token: Token) {
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return,
        };
        if peer.write_buf.is_empty() {
            return;
        }
        match peer.stream.write(&peer.write_buf) {
            Ok(n) => {
                peer.write_buf.drain(..n);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => {
                // Surfaced on the next read, which will observe EOF or reset.
            }
        }
        if peer.write_buf.is_empty() && peer.writable {
            peer.writable = false;
            let _ = self.poll.registry().reregister(&mut peer.stream, token, Interest::READABLE);
        }
    }

    fn queue_write(&mut self, addr: SocketAddr, message: spv_common::bitcoin::network::message::NetworkMessage) {
        let token = match self.tokens.get(&addr) {
            Some(token) => *token,
            None => return,
        };
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return,
        };
        if let Err(err) = self.codec.encode(message, &mut peer.write_buf) {
            log::error!(target: "client", "failed to encode message for {}: {}", addr, err);
            return;
        }
        if !peer.writable {
            peer.writable = true;
            let _ = self.poll.registry().reregister(&mut peer.stream, token, Interest::READABLE | Interest::WRITABLE);
        }
    }

    fn close_peer(
        &mut self,
        token: Token,
        addr: &SocketAddr,
        reason: Disconnect<spv_p2p::fsm::DisconnectReason>,
        state_machine: &mut StateMachine<T, P, C>,
    ) where
        T: ChainStore,
        P: peer::Store,
        C: AdjustedClock<PeerId>,
    {
        if let Some(mut peer) = self.peers.remove(&token) {
            self.tokens.remove(&peer.addr);
            let _ = self.poll.registry().deregister(&mut peer.stream);
        }
        state_machine.disconnected(addr, reason);
    }

    /// Disconnect every peer and stop listening, in response to
    /// [`Command::Shutdown`]. Leaves `self` deregistered from all sockets;
    /// the caller returns from [`ReactorTrait::run`] immediately after.
    fn shutdown(&mut self, state_machine: &mut StateMachine<T, P, C>)
    where
        T: ChainStore,
        P: peer::Store,
        C: AdjustedClock<PeerId>,
    {
        let tokens: Vec<Token> = self.peers.keys().copied().collect();
        for token in tokens {
            if let Some(addr) = self.peers.get(&token).map(|p| p.addr) {
                self.close_peer(token, &addr, Disconnect::Command, state_machine);
            }
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}

impl<T, P, C> ReactorTrait<StateMachine<T, P, C>> for Reactor<T, P, C>
where
    T: ChainStore,
    P: peer::Store,
    C: AdjustedClock<PeerId>,
{
    type Error = Error;

    fn run(&mut self, mut state_machine: StateMachine<T, P, C>, listen_addrs: &[SocketAddr]) -> Result<(), Error> {
        if let Some(addr) = listen_addrs.first() {
            let mut listener = TcpListener::bind(*addr)?;
            self.poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
            self.listener = Some(listener);
        }

        state_machine.initialize(LocalTime::now());

        let mut events = Events::with_capacity(1024);
        let mut next_timer: Option<Instant> = None;

        loop {
            let timeout = next_timer
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .map(|d| d.min(POLL_TIMEOUT))
                .unwrap_or(POLL_TIMEOUT);

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    LISTENER_TOKEN => {
                        if let Err(err) = self.accept_all(&mut state_machine) {
                            log::error!(target: "client", "accept failed: {}", err);
                        }
                    }
                    token => {
                        let connecting = self.peers.get(&token).map(|p| !p.established).unwrap_or(false);
                        if connecting && event.is_writable() {
                            self.handle_connect_complete(token, &mut state_machine);
                            continue;
                        }
                        if event.is_readable() {
                            self.readable(token, &mut state_machine);
                        }
                        if event.is_writable() {
                            self.writable(token);
                        }
                    }
                }
            }

            if next_timer.map_or(false, |deadline| Instant::now() >= deadline) {
                next_timer = None;
                state_machine.timer_expired();
            }

            let mut shutting_down = false;
            while let Ok(cmd) = self.commands.try_recv() {
                if matches!(cmd, Command::Shutdown) {
                    shutting_down = true;
                    break;
                }
                state_machine.command(cmd);
            }
            if shutting_down {
                self.shutdown(&mut state_machine);
                return Ok(());
            }

            state_machine.tick(LocalTime::now());

            while let Some(io) = state_machine.next() {
                match io {
                    Io::Write(addr, message) => self.queue_write(addr, message),
                    Io::Connect(addr) => {
                        state_machine.attempted(&addr);
                        if let Err(err) = self.dial(addr) {
                            state_machine.disconnected(&addr, Disconnect::ConnectionError(err.to_string()));
                        }
                    }
                    Io::Disconnect(addr, reason) => {
                        if let Some(&token) = self.tokens.get(&addr) {
                            self.close_peer(token, &addr, reason, &mut state_machine);
                        }
                    }
                    Io::SetTimer(duration) => {
                        next_timer = Some(Instant::now() + Duration::from(duration));
                    }
                    Io::Event(event) => {
                        let _ = self.events.send(event);
                    }
                }
            }
        }
    }

    fn wake(&self) -> Result<(), Error> {
        self.waker.wake()?;
        Ok(())
    }
}
