//! Drives an engine from a raw IGMP socket.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::igmp::packet::IPPROTO_IGMP;
use crate::igmp::{AsyncIgmpSocket, Packet};
use crate::timer::{Millis, MonotonicClock};

/// A sans-IO protocol engine: consumes datagrams and timer ticks, produces
/// datagrams to send.
pub trait Engine: Send {
    fn handle_message(&mut self, now: Millis, data: &[u8]) -> Vec<Packet>;

    fn handle_timers(&mut self, now: Millis) -> Vec<Packet>;

    fn next_deadline(&mut self) -> Option<Millis>;
}

#[derive(Debug)]
pub struct Daemon<E> {
    engine: Arc<Mutex<E>>,
    socket: AsyncIgmpSocket,
    clock: MonotonicClock,
    wakeup: Arc<Notify>,
}

impl<E> Clone for Daemon<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            socket: self.socket.clone(),
            clock: self.clock,
            wakeup: self.wakeup.clone(),
        }
    }
}

impl<E: Engine> Daemon<E> {
    pub fn new(engine: E, socket: AsyncIgmpSocket, clock: MonotonicClock) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            socket,
            clock,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    pub fn socket(&self) -> &AsyncIgmpSocket {
        &self.socket
    }

    /// Runs `f` against the engine, sends what it returns and wakes the
    /// event loop so a newly scheduled timer is picked up.
    pub async fn control<F, Err>(&self, f: F) -> Result<(), Err>
    where
        F: FnOnce(&mut E, Millis) -> Result<Vec<Packet>, Err>,
    {
        let packets = {
            let mut engine = self.engine.lock();
            f(&mut *engine, self.clock.now())?
        };
        self.send_all(packets).await;
        self.wakeup.notify_one();
        Ok(())
    }

    async fn send_all(&self, packets: Vec<Packet>) {
        for packet in packets {
            if packet.protocol() != IPPROTO_IGMP {
                log::trace!("leaving datagram to {} to the kernel", packet.destination());
                continue;
            }
            if let Err(e) = self.socket.send(&packet).await {
                log::warn!("failed to send to {}: {}", packet.destination(), e);
            }
        }
    }

    /// Event loop. Only returns if the socket fails.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let mut buf = vec![0u8; 65536];
        loop {
            let deadline = self.engine.lock().next_deadline();
            let sleep = async {
                match deadline {
                    Some(deadline) => {
                        let instant = tokio::time::Instant::from_std(self.clock.instant_at(deadline));
                        tokio::time::sleep_until(instant).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                res = self.socket.recv(&mut buf) => {
                    let len = res?;
                    let now = self.clock.now();
                    let packets = self.engine.lock().handle_message(now, &buf[..len]);
                    self.send_all(packets).await;
                }

                _ = sleep => {
                    let now = self.clock.now();
                    let packets = self.engine.lock().handle_timers(now);
                    self.send_all(packets).await;
                }

                _ = self.wakeup.notified() => {}
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommandError {
    message: &'static str,
}

impl std::fmt::Display for ControlCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ControlCommandError {}

/// One line of the responder's control input: `join <group>` or `leave <group>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Join(Ipv4Addr),
    Leave(Ipv4Addr),
}

impl FromStr for ControlCommand {
    type Err = ControlCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ControlCommandError { message: "empty command" })?;
        let group = words
            .next()
            .ok_or(ControlCommandError { message: "missing group address" })?
            .parse::<Ipv4Addr>()
            .map_err(|_| ControlCommandError { message: "invalid group address" })?;
        if words.next().is_some() {
            return Err(ControlCommandError { message: "trailing arguments" });
        }

        match verb {
            "join" => Ok(ControlCommand::Join(group)),
            "leave" => Ok(ControlCommand::Leave(group)),
            _ => Err(ControlCommandError { message: "unknown command" }),
        }
    }
}
