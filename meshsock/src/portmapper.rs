//! Port mapping as a source of one more direct address.
//!
//! Talking UPnP, NAT-PMP or PCP to the router is the job of the [`PortMapper`]
//! implementation the host provides.

use std::{fmt::Debug, net::SocketAddrV4, num::NonZeroU16};

use tokio::sync::watch;

/// A client creating a port mapping on the local router.
pub trait PortMapper: Debug + Send + Sync + 'static {
    /// Watches the external address of the current mapping, `None` while there is none.
    ///
    /// The manager re-discovers its direct addresses whenever the value changes.
    fn watch_external_address(&self) -> watch::Receiver<Option<SocketAddrV4>>;

    /// Starts creating a mapping unless there is one already, does not wait for it.
    fn procure_mapping(&self);

    /// Sets the local port to map. `None` releases the mapping.
    fn update_local_port(&self, port: Option<NonZeroU16>);

    /// Releases any mapping, e.g. because the network went down.
    fn deactivate(&self);
}

/// Returns the current mapping, starting to create one if there is none.
pub(crate) fn cached_mapping_or_start_creating_one(port_mapper: &dyn PortMapper) -> Option<SocketAddrV4> {
    let current = *port_mapper.watch_external_address().borrow();
    if current.is_none() {
        port_mapper.procure_mapping();
    }
    current
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;

    /// A [`PortMapper`] whose mapping is set by the test.
    #[derive(Debug)]
    pub(crate) struct FakePortMapper {
        pub(crate) external: watch::Sender<Option<SocketAddrV4>>,
        pub(crate) procured: AtomicUsize,
        pub(crate) local_port: Mutex<Option<NonZeroU16>>,
        pub(crate) deactivated: AtomicBool,
    }

    impl Default for FakePortMapper {
        fn default() -> Self {
            Self {
                external: watch::Sender::new(None),
                procured: AtomicUsize::new(0),
                local_port: Mutex::new(None),
                deactivated: AtomicBool::new(false),
            }
        }
    }

    impl PortMapper for FakePortMapper {
        fn watch_external_address(&self) -> watch::Receiver<Option<SocketAddrV4>> {
            self.external.subscribe()
        }

        fn procure_mapping(&self) {
            self.procured.fetch_add(1, Ordering::SeqCst);
        }

        fn update_local_port(&self, port: Option<NonZeroU16>) {
            *self.local_port.lock().unwrap() = port;
        }

        fn deactivate(&self) {
            self.deactivated.store(true, Ordering::SeqCst);
            self.external.send_replace(None);
        }
    }

    #[test]
    fn test_cached_mapping() {
        let pm = FakePortMapper::default();
        assert_eq!(cached_mapping_or_start_creating_one(&pm), None);
        assert_eq!(pm.procured.load(Ordering::SeqCst), 1);

        let addr: SocketAddrV4 = "1.2.3.4:5678".parse().unwrap();
        pm.external.send_replace(Some(addr));
        assert_eq!(cached_mapping_or_start_creating_one(&pm), Some(addr));
        assert_eq!(pm.procured.load(Ordering::SeqCst), 1);
    }
}
