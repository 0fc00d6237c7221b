use rand::seq::SliceRandom;

use super::{BoxedStream, ProxyEndpoint, ProxyError, ProxyTunnel, TunnelRng};

/// Ordered list of tunnels traversed one after another.
///
/// Hop `i` is asked to connect to hop `i + 1` over the stream produced so far;
/// the final hop connects to the real destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyChain {
    hops: Vec<ProxyTunnel>,
    shuffle: bool,
}

impl ProxyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hop(mut self, hop: ProxyTunnel) -> Self {
        self.hops.push(hop);
        self
    }

    /// Randomize hop order on every connection attempt.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn push(&mut self, hop: ProxyTunnel) {
        self.hops.push(hop);
    }

    pub fn hops(&self) -> &[ProxyTunnel] {
        &self.hops
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub(super) fn http_proxy(&self) -> Option<&ProxyEndpoint> {
        let mut fallback = None;
        for hop in &self.hops {
            if let Some(endpoint) = hop.http_proxy() {
                if endpoint.has_credentials() {
                    return Some(endpoint);
                }
                fallback.get_or_insert(endpoint);
            }
        }
        fallback
    }

    pub(super) async fn connect(
        &self,
        host: &str,
        port: u16,
        existing: Option<BoxedStream>,
        rng: &mut TunnelRng,
    ) -> Result<BoxedStream, ProxyError> {
        if self.hops.is_empty() {
            return Err(ProxyError::InvalidConfig("proxy chain has no hops".to_string()));
        }

        let mut order: Vec<&ProxyTunnel> = self.hops.iter().collect();
        if self.shuffle {
            order.shuffle(&mut *rng);
        }

        let mut current = existing;
        for pair in order.windows(2) {
            let (hop, next) = (pair[0], pair[1]);
            let target = next.endpoint().ok_or_else(|| {
                ProxyError::InvalidConfig(format!("chain hop {next} has no address to tunnel to"))
            })?;
            log::debug!("chaining {hop} -> {}", target.authority());
            current = Some(hop.connect(&target.host, target.port, current, &mut *rng).await?);
        }

        // windows(2) never yields for a single hop, so the last hop is always
        // the one facing the destination.
        let last = order[order.len() - 1];
        last.connect(host, port, current, &mut *rng).await
    }
}
