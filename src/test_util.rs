//! In-process simulation of the mesh: a hub that connects any number of
//! nodes and can drop, duplicate, and reorder datagrams deterministically.
//! Used by this crate's own integration tests and exported for application
//! testing - no radio hardware required.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::envelope::service::EnvelopeService;
use crate::mux::StreamMux;
use crate::radio::{NodeId, RadioSender, SendOutcome};

/// Channel impairments. All randomness is seeded, so a failing test replays
/// identically.
#[derive(Clone, Debug)]
pub struct SimNetConfig {
    pub seed: u64,
    /// Probability of losing any one datagram.
    pub drop_rate: f64,
    /// Probability of delivering a datagram twice.
    pub dup_rate: f64,
    /// When > 1, datagrams are buffered and flushed in reverse order once
    /// this many have accumulated.
    pub reorder_window: usize,
    /// Datagrams with these global indices (0-based, in send order) are
    /// dropped - for targeted-loss scenarios.
    pub drop_indices: HashSet<u64>,
}

impl Default for SimNetConfig {
    fn default() -> SimNetConfig {
        SimNetConfig {
            seed: 42,
            drop_rate: 0.0,
            dup_rate: 0.0,
            reorder_window: 0,
            drop_indices: HashSet::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimNetStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

struct SimNetInner {
    config: SimNetConfig,
    rng: StdRng,
    nodes: FxHashMap<NodeId, mpsc::UnboundedSender<(NodeId, Vec<u8>)>>,
    reorder_buffer: Vec<(NodeId, NodeId, Vec<u8>)>,
    datagram_index: u64,
    stats: SimNetStats,
}

/// The simulated mesh hub.
pub struct SimNet {
    inner: Mutex<SimNetInner>,
}

impl SimNet {
    pub fn new(config: SimNetConfig) -> Arc<SimNet> {
        Arc::new(SimNet {
            inner: Mutex::new(SimNetInner {
                rng: StdRng::seed_from_u64(config.seed),
                config,
                nodes: FxHashMap::default(),
                reorder_buffer: Vec::new(),
                datagram_index: 0,
                stats: SimNetStats::default(),
            }),
        })
    }

    /// Register a node. Returns its radio and the inbound datagram queue.
    pub fn attach(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (SimRadio, mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().expect("simnet lock").nodes.insert(node, tx);
        (
            SimRadio {
                node,
                net: self.clone(),
            },
            rx,
        )
    }

    pub fn set_drop_rate(&self, drop_rate: f64) {
        self.inner.lock().expect("simnet lock").config.drop_rate = drop_rate;
    }

    pub fn set_dup_rate(&self, dup_rate: f64) {
        self.inner.lock().expect("simnet lock").config.dup_rate = dup_rate;
    }

    pub fn set_reorder_window(&self, reorder_window: usize) {
        self.inner.lock().expect("simnet lock").config.reorder_window = reorder_window;
    }

    /// Deliver everything the reorder buffer is still holding (in reverse).
    pub fn flush(&self) {
        let mut inner = self.inner.lock().expect("simnet lock");
        let buffered = std::mem::take(&mut inner.reorder_buffer);
        for (from, to, data) in buffered.into_iter().rev() {
            Self::deliver(&mut inner, from, to, data);
        }
    }

    pub fn stats(&self) -> SimNetStats {
        self.inner.lock().expect("simnet lock").stats
    }

    fn transmit(&self, from: NodeId, to: NodeId, data: &[u8]) {
        let mut inner = self.inner.lock().expect("simnet lock");
        let index = inner.datagram_index;
        inner.datagram_index += 1;
        inner.stats.sent += 1;

        if inner.config.drop_indices.contains(&index) {
            inner.stats.dropped += 1;
            trace!("simnet: dropping datagram #{} (targeted)", index);
            return;
        }
        let drop_rate = inner.config.drop_rate;
        if drop_rate > 0.0 && inner.rng.gen_bool(drop_rate) {
            inner.stats.dropped += 1;
            trace!("simnet: dropping datagram #{} ({} bytes)", index, data.len());
            return;
        }

        let dup_rate = inner.config.dup_rate;
        let duplicate = dup_rate > 0.0 && inner.rng.gen_bool(dup_rate);

        if inner.config.reorder_window > 1 {
            inner.reorder_buffer.push((from, to, data.to_vec()));
            if duplicate {
                inner.stats.duplicated += 1;
                inner.reorder_buffer.push((from, to, data.to_vec()));
            }
            if inner.reorder_buffer.len() >= inner.config.reorder_window {
                let buffered = std::mem::take(&mut inner.reorder_buffer);
                for (from, to, data) in buffered.into_iter().rev() {
                    Self::deliver(&mut inner, from, to, data);
                }
            }
            return;
        }

        Self::deliver(&mut inner, from, to, data.to_vec());
        if duplicate {
            inner.stats.duplicated += 1;
            Self::deliver(&mut inner, from, to, data.to_vec());
        }
    }

    fn deliver(inner: &mut SimNetInner, from: NodeId, to: NodeId, data: Vec<u8>) {
        if let Some(tx) = inner.nodes.get(&to) {
            if tx.send((from, data)).is_ok() {
                inner.stats.delivered += 1;
            }
        }
    }
}

/// One node's radio on the simulated mesh.
pub struct SimRadio {
    node: NodeId,
    net: Arc<SimNet>,
}

#[async_trait]
impl RadioSender for SimRadio {
    async fn send_datagram(&self, dest: NodeId, bytes: &[u8]) -> SendOutcome {
        self.net.transmit(self.node, dest, bytes);
        SendOutcome::Sent
    }

    fn local_node(&self) -> NodeId {
        self.node
    }
}

/// Feed a node's inbound queue into a stream multiplexer.
pub fn pump_mux(
    mux: Arc<StreamMux>,
    mut rx: mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((src, data)) = rx.recv().await {
            mux.on_datagram(src, &data).await;
        }
    })
}

/// Feed a node's inbound queue into an envelope service.
pub fn pump_envelope(
    service: Arc<EnvelopeService>,
    mut rx: mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((src, data)) = rx.recv().await {
            service.on_datagram(src, &data).await;
        }
    })
}
