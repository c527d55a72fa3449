use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use chat_relay::{config::RelayConfig, controller::Controller};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{Instant, sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

async fn start_relay(max_clients: usize) -> Result<Controller> {
    let config = RelayConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, max_clients);
    let mut controller = Controller::bind(config)?;
    controller.start()?;
    Ok(controller)
}

async fn wait_for_count(controller: &Controller, expected: usize) -> Result<()> {
    let deadline = Instant::now() + READ_TIMEOUT;
    loop {
        let count = controller.client_count().await;
        if count == expected {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("expected {expected} clients, still have {count}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Connects and sends `name`, without waiting to be admitted.
    async fn connect(addr: SocketAddr, name: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut peer = Self {
            reader: BufReader::new(reader),
            writer,
        };
        peer.send(name).await?;
        Ok(peer)
    }

    /// Connects and waits for the relay to announce the new session.
    async fn join(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut peer = Self::connect(addr, name).await?;
        assert_eq!(peer.next_line().await?, format!("System: {name} has connected"));
        Ok(peer)
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        self.send_raw(format!("{text}\n").as_bytes()).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for a line"))??;
        if bytes == 0 {
            bail!("connection closed");
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads past any of `skippable` until `expected` arrives.
    async fn expect_line(&mut self, expected: &str, skippable: &[&str]) -> Result<()> {
        loop {
            let line = self.next_line().await?;
            if line == expected {
                return Ok(());
            }
            if !skippable.contains(&line.as_str()) {
                bail!("expected '{expected}', got '{line}'");
            }
        }
    }

    async fn expect_silence(&mut self) -> Result<()> {
        let mut line = String::new();
        match timeout(QUIET_PERIOD, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(()),
            Ok(result) => bail!("expected silence, got {result:?} '{line}'"),
        }
    }

    async fn expect_closed(&mut self) -> Result<()> {
        let mut line = String::new();
        match timeout(READ_TIMEOUT, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => Ok(()),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
            Ok(other) => bail!("expected the relay to close, got {other:?} '{line}'"),
            Err(_) => bail!("timed out waiting for the relay to close"),
        }
    }
}

#[tokio::test]
async fn message_reaches_others_but_not_its_author() -> Result<()> {
    let mut controller = start_relay(4).await?;
    let addr = controller.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::join(addr, "bob").await?;
    assert_eq!(alice.next_line().await?, "System: bob has connected");

    alice.send("hi").await?;
    assert_eq!(bob.next_line().await?, "alice: hi");
    alice.expect_silence().await?;

    bob.send("hello alice").await?;
    assert_eq!(alice.next_line().await?, "bob: hello alice");
    bob.expect_silence().await?;

    controller.stop().await
}

#[tokio::test]
async fn frames_follow_newlines_not_transport_writes() -> Result<()> {
    let mut controller = start_relay(2).await?;
    let addr = controller.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::join(addr, "bob").await?;
    assert_eq!(alice.next_line().await?, "System: bob has connected");

    alice.send_raw(b"one\ntwo\n").await?;
    assert_eq!(bob.next_line().await?, "alice: one");
    assert_eq!(bob.next_line().await?, "alice: two");

    alice.send_raw(b"ha").await?;
    sleep(Duration::from_millis(50)).await;
    alice.send_raw(b"lf\n").await?;
    assert_eq!(bob.next_line().await?, "alice: half");

    controller.stop().await
}

#[tokio::test]
async fn full_relay_admits_a_waiting_client_after_a_departure() -> Result<()> {
    let mut controller = start_relay(1).await?;
    let addr = controller.local_addr();

    let alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::connect(addr, "bob").await?;
    bob.expect_silence().await?;
    assert_eq!(controller.client_count().await, 1);

    drop(alice);
    bob.expect_line("System: bob has connected", &["System: alice has disconnected"])
        .await?;
    wait_for_count(&controller, 1).await?;

    let mut carol = Peer::connect(addr, "carol").await?;
    carol.expect_silence().await?;

    drop(bob);
    carol
        .expect_line("System: carol has connected", &["System: bob has disconnected"])
        .await?;
    wait_for_count(&controller, 1).await?;

    controller.stop().await
}

#[tokio::test]
async fn severed_connection_shrinks_registry_by_one() -> Result<()> {
    let mut controller = start_relay(3).await?;
    let addr = controller.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::join(addr, "bob").await?;
    assert_eq!(alice.next_line().await?, "System: bob has connected");
    let mut carol = Peer::join(addr, "carol").await?;
    assert_eq!(alice.next_line().await?, "System: carol has connected");
    assert_eq!(bob.next_line().await?, "System: carol has connected");
    assert_eq!(controller.client_count().await, 3);

    drop(bob);
    assert_eq!(alice.next_line().await?, "System: bob has disconnected");
    assert_eq!(carol.next_line().await?, "System: bob has disconnected");
    wait_for_count(&controller, 2).await?;

    alice.expect_silence().await?;
    assert_eq!(controller.client_count().await, 2);

    controller.stop().await
}

#[tokio::test]
async fn stop_closes_every_session_without_announcements() -> Result<()> {
    let mut controller = start_relay(3).await?;
    let addr = controller.local_addr();

    let mut alice = Peer::join(addr, "alice").await?;
    let mut bob = Peer::join(addr, "bob").await?;
    assert_eq!(alice.next_line().await?, "System: bob has connected");

    controller.stop().await?;
    assert!(!controller.is_running());
    assert_eq!(controller.client_count().await, 0);

    alice.expect_closed().await?;
    bob.expect_closed().await?;
    assert!(TcpStream::connect(addr).await.is_err());

    // A second stop finds nothing left to release.
    controller.stop().await
}

#[tokio::test]
async fn stop_closes_connections_still_waiting_to_name_themselves() -> Result<()> {
    let mut controller = start_relay(2).await?;
    let addr = controller.local_addr();

    let stream = TcpStream::connect(addr).await?;
    let (reader, writer) = stream.into_split();
    let mut unnamed = Peer {
        reader: BufReader::new(reader),
        writer,
    };
    // Give the acceptor time to hand the connection to its handshake.
    sleep(Duration::from_millis(50)).await;

    controller.stop().await?;

    let mut line = String::new();
    match timeout(Duration::from_millis(500), unnamed.reader.read_line(&mut line)).await {
        Ok(Ok(0)) => {}
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionReset => {}
        other => bail!("expected the unnamed connection to close, got {other:?} '{line}'"),
    }

    // Whatever it sends now, it is never told the relay is full.
    let _ = unnamed.send("alice").await;
    let mut late = String::new();
    let read = timeout(QUIET_PERIOD, unnamed.reader.read_line(&mut late)).await;
    assert!(!late.contains("relay is full"), "unexpected notice after {read:?}: '{late}'");

    Ok(())
}

#[tokio::test]
async fn empty_name_is_rejected_and_frees_its_slot() -> Result<()> {
    let mut controller = start_relay(1).await?;
    let addr = controller.local_addr();

    let mut nameless = Peer::connect(addr, "   ").await?;
    assert_eq!(
        nameless.next_line().await?,
        "System: display name cannot be empty"
    );
    nameless.expect_closed().await?;

    let _alice = Peer::join(addr, "alice").await?;
    assert_eq!(controller.client_count().await, 1);

    controller.stop().await
}

#[tokio::test]
async fn duplicate_names_are_admitted() -> Result<()> {
    let mut controller = start_relay(2).await?;
    let addr = controller.local_addr();

    let mut first = Peer::join(addr, "alice").await?;
    let _second = Peer::join(addr, "alice").await?;
    assert_eq!(first.next_line().await?, "System: alice has connected");
    assert_eq!(controller.client_count().await, 2);

    controller.stop().await
}
