//! A rebindable UDP socket for one address family.

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
};

use netwatch::{IpFamily, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum Slot {
    Bound(Arc<UdpSocket>),
    /// No socket could be bound, reads wait and writes are dropped.
    Blocked,
    Closed,
}

/// Holds the current socket of one address family.
///
/// The socket can be replaced by [`UdpConn::rebind`] while readers are waiting on it,
/// [`UdpConn::recv_from`] follows the replacement.
#[derive(Debug)]
pub(super) struct UdpConn {
    family: IpFamily,
    slot: watch::Sender<Slot>,
}

impl UdpConn {
    /// Binds `port`, falling back to an ephemeral port.
    pub(super) fn bind(family: IpFamily, port: u16) -> io::Result<Self> {
        let socket = bind_with_fallback(SocketAddr::new(family.unspecified_addr(), port))?;
        Ok(Self {
            family,
            slot: watch::Sender::new(Slot::Bound(Arc::new(socket))),
        })
    }

    /// Binds the exact address given, falling back to an ephemeral port on the same IP.
    pub(super) fn bind_addr(addr: SocketAddr) -> io::Result<Self> {
        let socket = bind_with_fallback(addr)?;
        Ok(Self {
            family: addr.ip().into(),
            slot: watch::Sender::new(Slot::Bound(Arc::new(socket))),
        })
    }

    /// A conn without a socket.
    pub(super) fn blocked(family: IpFamily) -> Self {
        Self {
            family,
            slot: watch::Sender::new(Slot::Blocked),
        }
    }

    pub(super) fn family(&self) -> IpFamily {
        self.family
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        match &*self.slot.borrow() {
            Slot::Bound(socket) => Some(socket.clone()),
            Slot::Blocked | Slot::Closed => None,
        }
    }

    pub(super) fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    /// Whether there is currently no usable socket.
    pub(super) fn is_blocked(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Blocked)
    }

    pub(super) fn is_closed(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Closed)
    }

    /// Whether the socket was bound to the unspecified address.
    pub(super) fn is_unspecified(&self) -> bool {
        self.local_addr().is_some_and(|a| a.ip().is_unspecified())
    }

    /// Drops the current socket and binds `port` again, falling back to an ephemeral port.
    ///
    /// The old socket is released first so that its port can be bound again. If nothing
    /// can be bound the conn is left blocked and the error is returned.
    pub(super) async fn rebind(&self, port: u16) -> io::Result<SocketAddr> {
        let ip = match self.local_addr() {
            Some(addr) => addr.ip(),
            None => self.family.unspecified_addr(),
        };
        let mut old = None;
        let open = self.slot.send_if_modified(|slot| match slot {
            Slot::Closed => false,
            _ => {
                if let Slot::Bound(socket) = std::mem::replace(slot, Slot::Blocked) {
                    old = Some(socket);
                }
                true
            }
        });
        if !open {
            return Err(io::Error::other("conn closed"));
        }
        if let Some(old) = old {
            old.close().await;
        }
        match bind_with_fallback(SocketAddr::new(ip, port)) {
            Ok(socket) => {
                let local_addr = socket.local_addr()?;
                self.slot.send_if_modified(|slot| match slot {
                    Slot::Closed => false,
                    _ => {
                        *slot = Slot::Bound(Arc::new(socket));
                        true
                    }
                });
                Ok(local_addr)
            }
            Err(err) => {
                warn!(family = ?self.family, "no socket could be bound, running blocked: {err:#}");
                Err(err)
            }
        }
    }

    /// Sends a datagram, returns whether it was handed to the socket.
    ///
    /// Datagrams to the other address family or while blocked are not sent.
    pub(super) async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<bool> {
        if IpFamily::from(dst.ip()) != self.family {
            return Ok(false);
        }
        let Some(socket) = self.socket() else {
            return Ok(false);
        };
        socket.send_to(buf, dst).await?;
        Ok(true)
    }

    /// Receives the next datagram from whatever socket is current.
    ///
    /// Waits while blocked. Returns `None` once the conn is closed.
    pub(super) async fn recv_from(&self, buf: &mut [u8]) -> Option<io::Result<(usize, SocketAddr)>> {
        let mut changes = self.slot.subscribe();
        loop {
            let slot = changes.borrow_and_update().clone();
            match slot {
                Slot::Closed => return None,
                Slot::Blocked => {
                    // the sender lives as long as self
                    changes.changed().await.ok()?;
                }
                Slot::Bound(socket) => {
                    tokio::select! {
                        res = socket.recv_from(buf) => match res {
                            Ok(res) => return Some(Ok(res)),
                            // replaced or closed under us
                            Err(_) if socket.is_closed() => continue,
                            Err(err) => return Some(Err(err)),
                        },
                        res = changes.changed() => res.ok()?,
                    }
                }
            }
        }
    }

    /// Closes the socket for good, waking up all readers.
    pub(super) async fn close(&self) {
        if let Slot::Bound(socket) = self.slot.send_replace(Slot::Closed) {
            debug!(family = ?self.family, "closing socket");
            socket.close().await;
        }
    }
}

fn bind_with_fallback(mut addr: SocketAddr) -> io::Result<UdpSocket> {
    debug!(%addr, "binding");

    match UdpSocket::bind_full(addr) {
        Ok(socket) => {
            let local_addr = socket.local_addr()?;
            debug!(%addr, %local_addr, "successfully bound");
            return Ok(socket);
        }
        Err(err) => {
            debug!(%addr, "failed to bind: {err:#}");
            if addr.port() == 0 {
                return Err(err);
            }
        }
    }

    addr.set_port(0);
    UdpSocket::bind_full(addr)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use n0_future::time::Duration;

    use super::*;

    fn local() -> UdpConn {
        UdpConn::bind_addr((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    #[tokio::test]
    async fn test_send_recv() {
        let a = local();
        let b = local();
        let b_addr = b.local_addr().unwrap();

        assert!(a.send_to(b"hello", b_addr).await.unwrap());
        let mut buf = [0u8; 64];
        let (n, src) = b.recv_from(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(src, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_other_family_not_sent() {
        let a = local();
        assert!(!a.send_to(b"x", "[::1]:1234".parse().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_port() {
        let a = local();
        let taken = a.local_addr().unwrap();
        let b = UdpConn::bind_addr(taken).unwrap();
        let got = b.local_addr().unwrap();
        assert_ne!(got.port(), taken.port());
        assert_eq!(got.ip(), taken.ip());
    }

    #[tokio::test]
    async fn test_rebind_keeps_reader() {
        let a = Arc::new(local());
        let sender = local();

        let reader = tokio::spawn({
            let a = a.clone();
            async move {
                let mut buf = [0u8; 64];
                let (n, _) = a.recv_from(&mut buf).await.unwrap().unwrap();
                buf[..n].to_vec()
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let old = a.local_addr().unwrap();
        let new = a.rebind(0).await.unwrap();
        assert_eq!(new.ip(), old.ip());
        assert_eq!(a.local_addr(), Some(new));

        assert!(sender.send_to(b"after", new).await.unwrap());
        let got = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"after");
    }

    #[tokio::test]
    async fn test_blocked() {
        let conn = Arc::new(UdpConn::blocked(IpFamily::V4));
        assert!(conn.is_blocked());
        assert_eq!(conn.local_addr(), None);
        assert!(!conn.send_to(b"x", "127.0.0.1:1".parse().unwrap()).await.unwrap());

        let reader = tokio::spawn({
            let conn = conn.clone();
            async move {
                let mut buf = [0u8; 8];
                conn.recv_from(&mut buf).await.is_none()
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        conn.close().await;
        assert!(reader.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let conn = Arc::new(local());
        let reader = tokio::spawn({
            let conn = conn.clone();
            async move {
                let mut buf = [0u8; 8];
                conn.recv_from(&mut buf).await.is_none()
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.close().await;
        assert!(
            tokio::time::timeout(Duration::from_secs(5), reader)
                .await
                .unwrap()
                .unwrap()
        );
        assert!(conn.is_closed());
        assert!(conn.rebind(0).await.is_err());
    }
}
