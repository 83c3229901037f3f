//! Star-topology process group over TCP.
//!
//! Rank 0 listens and every other rank connects to it.  Collectives are
//! relayed through rank 0: followers send their contribution, the leader
//! combines and answers.  Every blocking read honours the group timeout.
//!
//! Frame layout (little endian):
//!
//! ```text
//! tag: u8 | rank: u32 | len: u64 | len × f32
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Collective, DistResult, DistributedError};

const HELLO: u8 = 1;
const BARRIER: u8 = 2;
const RELEASE: u8 = 3;
const REDUCE: u8 = 4;
const RESULT: u8 = 5;
const BCAST: u8 = 6;
const LEAVE: u8 = 7;

const HEADER_LEN: usize = 13;
const MAX_FRAME_ELEMS: u64 = 1 << 31;

struct Frame {
    tag: u8,
    rank: u32,
    payload: Vec<f32>,
}

fn write_frame(stream: &mut TcpStream, tag: u8, rank: usize, payload: &[f32]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() * 4);
    buf.push(tag);
    buf.extend_from_slice(&(rank as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    for v in payload {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    stream.write_all(&buf)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let tag = header[0];
    let rank = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[5..13]);
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_FRAME_ELEMS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} elements exceeds limit"),
        ));
    }

    let mut bytes = vec![0u8; len as usize * 4];
    stream.read_exact(&mut bytes)?;
    let payload = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Frame { tag, rank, payload })
}

fn configure(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)
}

enum Role {
    /// Connections to ranks `1..world_size`, in rank order.
    Leader { peers: Vec<TcpStream> },
    Follower { hub: TcpStream },
}

/// Identity and timeout used when talking to a peer.
#[derive(Clone, Copy)]
struct Link {
    rank: usize,
    timeout: Duration,
}

impl Link {
    fn send(
        self,
        stream: &mut TcpStream,
        tag: u8,
        payload: &[f32],
        peer: usize,
        op: &'static str,
    ) -> DistResult<()> {
        write_frame(stream, tag, self.rank, payload).map_err(|e| io_error(e, op, peer, self.timeout))
    }

    /// Read the next frame from `peer`, which must carry `tag`.
    fn expect(
        self,
        stream: &mut TcpStream,
        tag: u8,
        peer: usize,
        op: &'static str,
    ) -> DistResult<Vec<f32>> {
        let frame = read_frame(stream).map_err(|e| io_error(e, op, peer, self.timeout))?;
        if frame.tag == LEAVE {
            return Err(DistributedError::PeerLost {
                rank: frame.rank as usize,
                reason: "left the group".into(),
            });
        }
        if frame.tag != tag {
            return Err(DistributedError::Protocol(format!(
                "{op}: expected tag {tag} from rank {peer}, got {}",
                frame.tag
            )));
        }
        Ok(frame.payload)
    }
}

pub struct TcpGroup {
    link: Link,
    world_size: usize,
    role: Role,
}

impl TcpGroup {
    /// Accept `world_size - 1` followers on `listener`.
    pub fn leader(listener: TcpListener, world_size: usize, timeout: Duration) -> DistResult<Self> {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unbound>".to_string());
        let rendezvous_err = |source: io::Error| DistributedError::Rendezvous {
            addr: addr.clone(),
            source,
        };
        listener.set_nonblocking(true).map_err(rendezvous_err)?;

        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined + 1 < world_size {
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    stream.set_nonblocking(false).map_err(rendezvous_err)?;
                    configure(&stream, timeout).map_err(rendezvous_err)?;
                    let hello = read_frame(&mut stream)
                        .map_err(|e| io_error(e, "rendezvous", 0, timeout))?;
                    let rank = hello.rank as usize;
                    if hello.tag != HELLO || rank == 0 || rank >= world_size {
                        return Err(DistributedError::Protocol(format!(
                            "unexpected handshake from {peer_addr} (tag {}, rank {rank})",
                            hello.tag
                        )));
                    }
                    if slots[rank - 1].is_some() {
                        return Err(DistributedError::Protocol(format!("rank {rank} joined twice")));
                    }
                    debug!(rank, %peer_addr, "Worker joined");
                    slots[rank - 1] = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(DistributedError::Timeout { op: "rendezvous", timeout });
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(rendezvous_err(e)),
            }
        }

        let peers = slots.into_iter().flatten().collect();
        Ok(Self { link: Link { rank: 0, timeout }, world_size, role: Role::Leader { peers } })
    }

    /// Connect to the leader at `addr`, retrying until `timeout` elapses.
    pub fn follower(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> DistResult<Self> {
        let deadline = Instant::now() + timeout;
        let mut hub = loop {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(%addr, error = %e, "Leader not reachable yet; retrying");
                    thread::sleep(Duration::from_millis(100));
                }
                Err(source) => {
                    return Err(DistributedError::Rendezvous { addr: addr.to_string(), source })
                }
            }
        };
        configure(&hub, timeout)
            .map_err(|source| DistributedError::Rendezvous { addr: addr.to_string(), source })?;

        let link = Link { rank, timeout };
        link.send(&mut hub, HELLO, &[], 0, "rendezvous")?;
        debug!(rank, %addr, "Joined process group");

        Ok(Self { link, world_size, role: Role::Follower { hub } })
    }
}

fn check_len(got: usize, want: usize, op: &str) -> DistResult<()> {
    if got != want {
        return Err(DistributedError::Protocol(format!(
            "{op}: buffer length mismatch ({got} != {want})"
        )));
    }
    Ok(())
}

fn io_error(e: io::Error, op: &'static str, peer: usize, timeout: Duration) -> DistributedError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            DistributedError::Timeout { op, timeout }
        }
        _ => DistributedError::PeerLost { rank: peer, reason: e.to_string() },
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.link.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> DistResult<()> {
        let link = self.link;
        match &mut self.role {
            Role::Leader { peers } => {
                for (i, peer) in peers.iter_mut().enumerate() {
                    link.expect(peer, BARRIER, i + 1, "barrier")?;
                }
                for (i, peer) in peers.iter_mut().enumerate() {
                    link.send(peer, RELEASE, &[], i + 1, "barrier")?;
                }
            }
            Role::Follower { hub } => {
                link.send(hub, BARRIER, &[], 0, "barrier")?;
                link.expect(hub, RELEASE, 0, "barrier")?;
            }
        }
        Ok(())
    }

    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> DistResult<()> {
        let link = self.link;
        match &mut self.role {
            Role::Leader { peers } => {
                let mut acc = buf.to_vec();
                for (i, peer) in peers.iter_mut().enumerate() {
                    let part = link.expect(peer, REDUCE, i + 1, "all_reduce")?;
                    check_len(part.len(), acc.len(), "all_reduce")?;
                    for (a, p) in acc.iter_mut().zip(&part) {
                        *a += p;
                    }
                }
                let scale = 1.0 / self.world_size as f32;
                acc.iter_mut().for_each(|a| *a *= scale);
                for (i, peer) in peers.iter_mut().enumerate() {
                    link.send(peer, RESULT, &acc, i + 1, "all_reduce")?;
                }
                buf.copy_from_slice(&acc);
            }
            Role::Follower { hub } => {
                link.send(hub, REDUCE, buf, 0, "all_reduce")?;
                let mean = link.expect(hub, RESULT, 0, "all_reduce")?;
                check_len(mean.len(), buf.len(), "all_reduce")?;
                buf.copy_from_slice(&mean);
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, buf: &mut [f32]) -> DistResult<()> {
        let link = self.link;
        match &mut self.role {
            Role::Leader { peers } => {
                for (i, peer) in peers.iter_mut().enumerate() {
                    link.send(peer, BCAST, buf, i + 1, "broadcast")?;
                }
            }
            Role::Follower { hub } => {
                let data = link.expect(hub, BCAST, 0, "broadcast")?;
                check_len(data.len(), buf.len(), "broadcast")?;
                buf.copy_from_slice(&data);
            }
        }
        Ok(())
    }
}

impl Drop for TcpGroup {
    fn drop(&mut self) {
        match &mut self.role {
            Role::Leader { peers } => {
                for peer in peers.iter() {
                    let _ = peer.shutdown(Shutdown::Both);
                }
            }
            Role::Follower { hub } => {
                if let Err(e) = write_frame(hub, LEAVE, self.link.rank, &[]) {
                    debug!(error = %e, "Leader already gone at teardown");
                }
                let _ = hub.shutdown(Shutdown::Both);
            }
        }
        debug!(rank = self.link.rank, "Left process group");
    }
}
