//! A concurrent topological walk over a DAG.
//!
//! Each node gets its own future that waits for every dependency to announce
//! completion, then emits the node to the caller together with a callback the
//! caller uses to mark the node finished. Nodes with no path between them are
//! therefore offered concurrently, while dependents are held back until their
//! dependencies' callbacks fire.

use std::{collections::HashMap, hash::Hash};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

pub struct Start;
pub struct Walking;

/// A node offered by the walker plus the callback that marks it done.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handles: FuturesUnordered<JoinHandle<()>>,
}

// Petgraph node ids are Copy + Eq integers, so the extra Hash + Send bounds
// hold for every graph type we walk.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    /// Builds a walker over the graph. Edges are read in the `Outgoing`
    /// direction: an edge `a -> b` means `a` waits for `b`.
    ///
    /// The graph must not change between building the walker and walking it;
    /// the walker captures the node and edge sets up front.
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let mut finished_txs = HashMap::new();
        let mut finished_rxs = HashMap::new();
        for node in graph.node_identifiers() {
            // A node finishes exactly once.
            let (tx, rx) = broadcast::channel::<()>(1);
            finished_txs.insert(node, tx);
            finished_rxs.insert(node, rx);
        }

        // Sized so that emitting can never block; the channel must hold every
        // node in the worst case.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(finished_txs.len(), 1));

        let join_handles = FuturesUnordered::new();
        for node in graph.node_identifiers() {
            let finished_tx = finished_txs
                .remove(&node)
                .expect("every node has a finish sender");
            let deps_rx = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    finished_rxs
                        .get(&dep)
                        .expect("neighbor missing from graph")
                        .resubscribe()
                })
                .collect::<Vec<_>>();

            join_handles.push(tokio::spawn(walk_node(
                node,
                deps_rx,
                cancel_rx.clone(),
                node_tx.clone(),
                finished_tx,
            )));
        }
        debug_assert!(finished_txs.is_empty(), "all senders moved to node tasks");

        Self {
            marker: std::marker::PhantomData,
            cancel,
            node_events: Some(node_rx),
            join_handles,
        }
    }

    /// Starts the walk, returning the receiving end of the node stream.
    /// The caller must fire each message's callback once the node has been
    /// processed, or its dependents will never be offered.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut node_events,
            join_handles,
            ..
        } = self;
        let node_events = node_events.take().expect("walker already started");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel,
                node_events: None,
                join_handles,
            },
            node_events,
        )
    }
}

async fn walk_node<N: Copy>(
    node: N,
    mut deps_rx: Vec<broadcast::Receiver<()>>,
    mut cancel_rx: watch::Receiver<bool>,
    node_tx: mpsc::Sender<WalkMessage<N>>,
    finished_tx: broadcast::Sender<()>,
) {
    let deps_finished = join_all(deps_rx.iter_mut().map(|rx| rx.recv()));

    tokio::select! {
        // When the cancel and the dependencies are ready at the same time,
        // prefer the cancel so no additional node is offered.
        biased;
        _ = cancel_rx.changed() => {
            // Either cancel() flipped the flag or the sender dropped; both
            // mean the walk is over for this node.
        }
        results = deps_finished => {
            for result in results {
                match result {
                    Ok(()) => (),
                    // A dependency task exited without announcing a finish.
                    // That only happens when a cancellation raced us, so we
                    // stop as well.
                    Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug_assert!(false, "dependency finished {n} extra times");
                        trace!("dependency finished {n} extra times");
                    }
                }
            }

            let (done_tx, done_rx) = oneshot::channel::<()>();
            if node_tx.send((node, done_tx)).await.is_err() {
                // The caller dropped the receiver mid-walk; treat as cancel.
                trace!("walk receiver dropped before walk finished");
                return;
            }
            if done_rx.await.is_err() {
                // A dropped callback counts as the node being finished.
                trace!("done callback dropped without an explicit finish");
            }
            // Failing to send just means no dependents are listening.
            finished_tx.send(()).ok();
        }
    }
}

impl<N> Walker<N, Walking> {
    /// Stops offering new nodes. Nodes already sitting in the channel are
    /// still delivered.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for every per-node future to wind down. Called after a cancel to
    /// make sure nothing is left running.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self {
            mut join_handles, ..
        } = self;
        while let Some(result) = join_handles.next().await {
            result?;
        }
        Ok(())
    }
}
