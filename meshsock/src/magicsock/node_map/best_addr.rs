//! The [`BestAddr`] is the currently active best address for UDP sends.

use std::net::{IpAddr, SocketAddr};

use n0_future::time::{Duration, Instant};
use tracing::{debug, info};

use crate::defaults::timeouts::{GOOD_ENOUGH_LATENCY, TRUST_UDP_ADDR_DURATION};

#[derive(Debug, Default)]
pub(super) struct BestAddr(Option<BestAddrInner>);

#[derive(Debug)]
struct BestAddrInner {
    addr: AddrLatency,
    trust_until: Option<Instant>,
    confirmed_at: Instant,
}

impl BestAddrInner {
    fn addr(&self) -> SocketAddr {
        self.addr.addr
    }
}

#[derive(Debug)]
pub(super) enum State<'a> {
    Valid(&'a AddrLatency),
    Outdated(&'a AddrLatency),
    Empty,
}

#[derive(Debug, Clone, Copy)]
pub(super) enum ClearReason {
    Reset,
    Inactive,
    PongTimeout,
}

impl BestAddr {
    #[cfg(test)]
    pub(super) fn from_parts(
        addr: SocketAddr,
        latency: Duration,
        confirmed_at: Instant,
        trust_until: Instant,
    ) -> Self {
        let inner = BestAddrInner {
            addr: AddrLatency { addr, latency },
            confirmed_at,
            trust_until: Some(trust_until),
        };
        Self(Some(inner))
    }

    pub(super) fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Unconditionally clears the best address.
    pub(super) fn clear(&mut self, reason: ClearReason, has_relay: bool) {
        let old = self.0.take();
        if let Some(old_addr) = old.as_ref().map(BestAddrInner::addr) {
            info!(?reason, ?has_relay, %old_addr, "clearing best_addr");
        }
    }

    /// Clears the best address if equal to `addr`.
    pub(super) fn clear_if_equals(&mut self, addr: SocketAddr, reason: ClearReason, has_relay: bool) {
        if self.addr() == Some(addr) {
            self.clear(reason, has_relay)
        }
    }

    /// Clears the best address if equal to `addr` and not confirmed since `since`.
    pub(super) fn clear_if_addr_older(
        &mut self,
        addr: SocketAddr,
        since: Instant,
        reason: ClearReason,
        has_relay: bool,
    ) {
        if let Some(ref inner) = self.0 {
            if inner.addr.addr == addr && inner.confirmed_at < since {
                self.clear(reason, has_relay);
            }
        }
    }

    pub(super) fn clear_trust(&mut self, why: &'static str) {
        if let Some(state) = self.0.as_mut() {
            debug!(
                %why,
                prev_trust_until = ?state.trust_until,
                "clearing best_addr trust",
            );
            state.trust_until = None;
        }
    }

    /// Sets the best address to the winner of the last selection round.
    ///
    /// If the winner already is the best address, its trust is extended to
    /// `confirmed_at + TRUST_UDP_ADDR_DURATION`.
    pub(super) fn insert_or_reconfirm(&mut self, addr: SocketAddr, latency: Duration, confirmed_at: Instant) {
        let trust_until = confirmed_at + TRUST_UDP_ADDR_DURATION;
        match self.0.as_mut() {
            Some(state) if state.addr.addr == addr => {
                state.addr.latency = latency;
                state.confirmed_at = confirmed_at;
                state.trust_until = Some(trust_until);
            }
            _ => {
                info!(
                    %addr,
                    latency = ?latency,
                    prev = ?self.addr(),
                    "selecting new direct path for node"
                );
                self.0 = Some(BestAddrInner {
                    addr: AddrLatency { addr, latency },
                    trust_until: Some(trust_until),
                    confirmed_at,
                });
            }
        }
    }

    pub(super) fn state(&self, now: Instant) -> State<'_> {
        match &self.0 {
            None => State::Empty,
            Some(state) => match state.trust_until {
                Some(expiry) if now < expiry => State::Valid(&state.addr),
                Some(_) | None => State::Outdated(&state.addr),
            },
        }
    }

    /// Whether the trust in the best address ends within `window` of `now`.
    ///
    /// Also true when the address is not trusted at all.
    pub(super) fn trust_expires_within(&self, now: Instant, window: Duration) -> bool {
        match self.0.as_ref().and_then(|state| state.trust_until) {
            Some(expiry) => expiry.saturating_duration_since(now) <= window,
            None => true,
        }
    }

    pub(super) fn addr(&self) -> Option<SocketAddr> {
        self.0.as_ref().map(BestAddrInner::addr)
    }
}

/// A `SocketAddr` with an associated latency.
#[derive(Debug, Clone)]
pub struct AddrLatency {
    pub addr: SocketAddr,
    pub latency: Duration,
}

/// A direct address competing to become the [`BestAddr`].
///
/// `latency` is `None` when the path has no recent pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub(crate) addr: SocketAddr,
    pub(crate) latency: Option<Duration>,
}

impl Candidate {
    /// Reports whether `self` is strictly a better address to use than `other`.
    ///
    /// This is a strict relation: `a.is_better_than(b)` and `b.is_better_than(a)` never
    /// both hold. It is not transitive though, see [`select`].
    pub(crate) fn is_better_than(&self, other: &Self) -> bool {
        if self.addr == other.addr {
            return false;
        }
        let (this, that) = match (self.latency, other.latency) {
            (Some(this), Some(that)) => (this, that),
            (Some(_), None) => return true,
            (None, _) => return false,
        };

        // Only a meaningful improvement counts, unless both are good enough anyway.
        let both_good_enough = this <= GOOD_ENOUGH_LATENCY && that <= GOOD_ENOUGH_LATENCY;
        if !both_good_enough {
            if this * 3 < that * 2 {
                return true;
            }
            if that * 3 < this * 2 {
                return false;
            }
        }

        // Roughly comparable latencies.
        let (this_private, that_private) = (is_private(self.addr.ip()), is_private(other.addr.ip()));
        if this_private != that_private {
            return this_private;
        }
        if self.addr.is_ipv6() != other.addr.is_ipv6() {
            return self.addr.is_ipv6();
        }
        if this != that {
            return this < that;
        }
        self.addr < other.addr
    }
}

/// Picks the best of `candidates`, ignoring those without a latency.
///
/// Pairwise comparison can be cyclic when the latency threshold and the address
/// preferences disagree, so the winner is the candidate beating the most others, with
/// ties going to the lower latency and then the lower address. The result only depends on
/// the set of candidates, not on their order.
pub(crate) fn select(candidates: &[Candidate]) -> Option<Candidate> {
    candidates
        .iter()
        .filter_map(|c| c.latency.map(|latency| (c, latency)))
        .map(|(c, latency)| {
            let wins = candidates.iter().filter(|o| c.is_better_than(o)).count();
            (c, latency, wins)
        })
        .min_by(|(a, a_latency, a_wins), (b, b_latency, b_wins)| {
            b_wins
                .cmp(a_wins)
                .then(a_latency.cmp(b_latency))
                .then(a.addr.cmp(&b.addr))
        })
        .map(|(c, _, _)| *c)
}

/// Private, unique local and link local addresses.
///
/// These usually have one NAT less on the way.
fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private() || ip.is_link_local() || ip.is_loopback(),
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || netwatch::ip::is_unicast_link_local(ip)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cand(addr: &str, ms: Option<u64>) -> Candidate {
        Candidate {
            addr: addr.parse().unwrap(),
            latency: ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn test_meaningfully_better() {
        let a = cand("8.8.8.8:1", Some(10));
        let b = cand("9.9.9.9:1", Some(100));
        assert!(a.is_better_than(&b));
        assert!(!b.is_better_than(&a));

        // 12ms vs 10ms is within the threshold, same class and family, so the lower
        // latency decides.
        let c = cand("9.9.9.9:1", Some(12));
        assert!(a.is_better_than(&c));
        assert!(!c.is_better_than(&a));
    }

    #[test]
    fn test_prefer_private_when_comparable() {
        let public = cand("8.8.8.8:1", Some(10));
        let private = cand("192.168.1.5:1", Some(12));
        assert!(private.is_better_than(&public));
        assert!(!public.is_better_than(&private));

        // But not when the public path is a lot faster.
        let slow_private = cand("192.168.1.5:1", Some(40));
        assert!(public.is_better_than(&slow_private));
    }

    #[test]
    fn test_prefer_ipv6_when_comparable() {
        let v4 = cand("8.8.8.8:1", Some(10));
        let v6 = cand("[2001:db8::1]:1", Some(11));
        assert!(v6.is_better_than(&v4));
        assert!(!v4.is_better_than(&v6));
    }

    #[test]
    fn test_good_enough() {
        let a = cand("8.8.8.8:1", Some(1));
        let b = cand("[2001:db8::1]:1", Some(4));
        // Both good enough, so IPv6 wins even though it is 4x slower.
        assert!(b.is_better_than(&a));
        assert!(!a.is_better_than(&b));
    }

    #[test]
    fn test_invalid() {
        let valid = cand("8.8.8.8:1", Some(500));
        let invalid = cand("192.168.1.1:1", None);
        assert!(valid.is_better_than(&invalid));
        assert!(!invalid.is_better_than(&valid));
        assert!(!invalid.is_better_than(&invalid));
        assert!(!valid.is_better_than(&valid));
    }

    #[test]
    fn test_select_cycle() {
        // a beats b by latency, b beats c by being private, c beats a by being IPv6.
        let a = cand("8.8.8.8:1", Some(6));
        let b = cand("10.0.0.1:1", Some(10));
        let c = cand("[2001:db8::1]:1", Some(8));
        assert!(a.is_better_than(&b));
        assert!(b.is_better_than(&c));
        assert!(c.is_better_than(&a));

        // Everyone wins once, the lowest latency takes it whatever the order.
        assert_eq!(select(&[a, b, c]), Some(a));
        assert_eq!(select(&[c, b, a]), Some(a));
        assert_eq!(select(&[b, a, c]), Some(a));
    }

    #[test]
    fn test_best_addr_trust() {
        let now = Instant::now();
        let addr: SocketAddr = "1.2.3.4:5".parse().unwrap();
        let mut best = BestAddr::default();
        assert!(matches!(best.state(now), State::Empty));

        best.insert_or_reconfirm(addr, Duration::from_millis(10), now);
        assert!(matches!(best.state(now), State::Valid(_)));
        assert!(matches!(
            best.state(now + TRUST_UDP_ADDR_DURATION),
            State::Outdated(_)
        ));

        let later = now + Duration::from_secs(5);
        best.insert_or_reconfirm(addr, Duration::from_millis(10), later);
        assert!(matches!(
            best.state(now + TRUST_UDP_ADDR_DURATION),
            State::Valid(_)
        ));

        best.clear_trust("test");
        assert!(matches!(best.state(later), State::Outdated(_)));
        assert_eq!(best.addr(), Some(addr));

        best.clear_if_addr_older(addr, later, ClearReason::PongTimeout, true);
        assert_eq!(best.addr(), Some(addr));
        best.clear_if_addr_older(addr, later + Duration::from_millis(1), ClearReason::PongTimeout, true);
        assert!(best.is_empty());
    }

    fn arb_candidate() -> impl Strategy<Value = Candidate> {
        let ip = prop_oneof![
            Just("8.8.8.8"),
            Just("9.9.9.9"),
            Just("10.0.0.1"),
            Just("192.168.1.1"),
            Just("2001:db8::1"),
            Just("fd00::1"),
            Just("fe80::1"),
        ];
        (ip, 1u16..4, proptest::option::of(0u64..200)).prop_map(|(ip, port, ms)| {
            let ip: IpAddr = ip.parse().unwrap();
            Candidate {
                addr: SocketAddr::new(ip, port),
                latency: ms.map(Duration::from_millis),
            }
        })
    }

    proptest! {
        #[test]
        fn selection_is_antisymmetric(a in arb_candidate(), b in arb_candidate()) {
            prop_assert!(!(a.is_better_than(&b) && b.is_better_than(&a)));
        }

        #[test]
        fn selection_ignores_order(
            cands in proptest::collection::vec(arb_candidate(), 0..8),
            seed in any::<u64>(),
        ) {
            use rand::{SeedableRng, seq::SliceRandom};

            let mut cands = cands;
            // One entry per address, as in a node's path table.
            cands.sort_by_key(|c| c.addr);
            cands.dedup_by_key(|c| c.addr);
            let want = select(&cands);

            let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
            let mut shuffled = cands.clone();
            shuffled.shuffle(&mut rng);
            prop_assert_eq!(select(&shuffled), want);

            if let Some(winner) = want {
                prop_assert!(winner.latency.is_some());
            }
        }
    }
}
