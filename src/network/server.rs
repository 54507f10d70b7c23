//! The TCP node: accepts connections, gossips blocks and transactions,
//! keeps a mempool and optionally mines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::blockchain::{Block, Blockchain, Transaction, UtxoSet};
use crate::config::{NodeConfig, CENTRAL_NODE, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::network::message::{
    AddrPayload, BlockPayload, GetBlocksPayload, GetDataPayload, InvKind, InvPayload, Message,
    TxPayload, VersionPayload, COMMAND_WIDTH, MAX_PAYLOAD,
};

/// Pending transfers needed before the miner wakes up; the coinbase
/// fills the block's remaining slot.
const MINING_THRESHOLD: usize = 1;

pub struct Server {
    state: Arc<NodeState>,
}

struct NodeState {
    node_addr: String,
    miner_address: Option<String>,
    chain: Blockchain,
    known_peers: Mutex<Vec<String>>,
    mempool: Mutex<HashMap<String, Transaction>>,
    blocks_in_transit: Mutex<Vec<Vec<u8>>>,
    /// Serializes `add_block` and `mine_block` so tip transitions are
    /// linearizable.
    chain_lock: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
    mempool_ready: Notify,
}

impl Server {
    /// Open this node's chain and assemble the shared state. The chain
    /// must have been created beforehand.
    pub fn new(config: &NodeConfig, miner_address: Option<String>) -> Result<Self> {
        let chain = Blockchain::open(config)?;
        Ok(Self {
            state: Arc::new(NodeState {
                node_addr: config.listen_addr(),
                miner_address,
                chain,
                known_peers: Mutex::new(Vec::new()),
                mempool: Mutex::new(HashMap::new()),
                blocks_in_transit: Mutex::new(Vec::new()),
                chain_lock: tokio::sync::Mutex::new(()),
                shutdown: AtomicBool::new(false),
                mempool_ready: Notify::new(),
            }),
        })
    }

    /// Serve until ctrl-c: announce to the central node, accept and
    /// dispatch connections, run the miner when configured.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.state.node_addr).await?;
        log::info!("node listening on {}", self.state.node_addr);

        if self.state.node_addr != CENTRAL_NODE {
            let version = self.state.version_message()?;
            self.state.send(CENTRAL_NODE, &version).await;
        }

        let miner = self
            .state
            .miner_address
            .is_some()
            .then(|| tokio::spawn(mine_loop(Arc::clone(&self.state))));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(state, stream).await {
                                log::warn!("connection handler failed: {err}");
                            }
                        });
                    }
                    Err(err) => log::warn!("accept failed: {err}"),
                },
            }
        }

        log::info!("shutdown signal received");
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.mempool_ready.notify_waiters();
        drop(listener);

        if let Some(task) = miner {
            let _ = task.await;
        }
        // Taking the chain lock waits out any in-flight block write.
        let _quiesce = self.state.chain_lock.lock().await;
        self.state.chain.store().flush()?;
        log::info!("node stopped");
        Ok(())
    }
}

impl NodeState {
    fn version_message(&self) -> Result<Message> {
        Ok(Message::Version(VersionPayload {
            addr_from: self.node_addr.clone(),
            version: PROTOCOL_VERSION,
            best_height: self.chain.get_best_height()?,
        }))
    }

    fn peers(&self) -> Vec<String> {
        self.known_peers.lock().clone()
    }

    /// Record a peer; returns true when it was new.
    fn add_peer(&self, addr: &str) -> bool {
        if addr == self.node_addr {
            return false;
        }
        let mut peers = self.known_peers.lock();
        if peers.iter().any(|p| p == addr) {
            return false;
        }
        peers.push(addr.to_owned());
        log::info!("learned peer {addr}, {} known", peers.len());
        true
    }

    fn remove_peer(&self, addr: &str) {
        self.known_peers.lock().retain(|p| p != addr);
    }

    /// Fire-and-forget send; an unreachable peer is dropped from the
    /// table and the error is absorbed here.
    async fn send(&self, addr: &str, message: &Message) {
        if addr == self.node_addr {
            return;
        }
        if let Err(err) = self.try_send(addr, message).await {
            log::warn!("removing peer {addr}: {err}");
            self.remove_peer(addr);
        }
    }

    async fn try_send(&self, addr: &str, message: &Message) -> Result<()> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|_| Error::PeerUnreachable(addr.to_owned()))?;
        stream.write_all(&message.encode()?).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn broadcast(&self, message: &Message, except: &str) {
        for peer in self.peers() {
            if peer != except {
                self.send(&peer, message).await;
            }
        }
    }
}

/// Send a transaction to a node. Used by the CLI when a transfer is
/// submitted without local mining.
pub async fn send_tx(addr: &str, from_addr: &str, tx: &Transaction) -> Result<()> {
    let message = Message::Tx(TxPayload {
        addr_from: from_addr.to_owned(),
        transaction: tx.serialize()?,
    });
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|_| Error::PeerUnreachable(addr.to_owned()))?;
    stream.write_all(&message.encode()?).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one framed message off a fresh connection and dispatch it.
async fn handle_connection(state: Arc<NodeState>, mut stream: TcpStream) -> Result<()> {
    let mut command = [0u8; COMMAND_WIDTH];
    stream.read_exact(&mut command).await?;
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        log::warn!("dropping oversized payload ({len} bytes)");
        return Ok(());
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    let message = match Message::decode(&command, &payload) {
        Ok(message) => message,
        Err(err) => {
            // Corrupt wire data is dropped, never propagated.
            log::warn!("dropping undecodable message: {err}");
            return Ok(());
        }
    };

    log::debug!("received {} command", message.command());
    dispatch(state, message).await
}

async fn dispatch(state: Arc<NodeState>, message: Message) -> Result<()> {
    match message {
        Message::Version(p) => handle_version(&state, p).await,
        Message::Addr(p) => handle_addr(&state, p).await,
        Message::Inv(p) => handle_inv(&state, p).await,
        Message::GetBlocks(p) => handle_get_blocks(&state, p).await,
        Message::GetData(p) => handle_get_data(&state, p).await,
        Message::Block(p) => handle_block(&state, p).await,
        Message::Tx(p) => handle_tx(&state, p).await,
    }
}

/// Height handshake: the lower side asks for blocks, the higher side
/// replies with its own version. Either way the sender becomes a peer.
async fn handle_version(state: &Arc<NodeState>, payload: VersionPayload) -> Result<()> {
    let my_height = state.chain.get_best_height()?;
    if my_height < payload.best_height {
        state
            .send(
                &payload.addr_from,
                &Message::GetBlocks(GetBlocksPayload {
                    addr_from: state.node_addr.clone(),
                }),
            )
            .await;
    } else if my_height > payload.best_height {
        let version = state.version_message()?;
        state.send(&payload.addr_from, &version).await;
    }
    state.add_peer(&payload.addr_from);
    Ok(())
}

/// Merge advertised peers; anything newly learned is gossiped onward.
async fn handle_addr(state: &Arc<NodeState>, payload: AddrPayload) -> Result<()> {
    let mut learned = state.add_peer(&payload.addr_from);
    for addr in &payload.addrs {
        learned |= state.add_peer(addr);
    }
    if learned {
        let message = Message::Addr(AddrPayload {
            addr_from: state.node_addr.clone(),
            addrs: state.peers(),
        });
        state.broadcast(&message, &payload.addr_from).await;
    }
    Ok(())
}

async fn handle_inv(state: &Arc<NodeState>, payload: InvPayload) -> Result<()> {
    log::debug!(
        "inventory of {} {:?} items from {}",
        payload.items.len(),
        payload.kind,
        payload.addr_from
    );
    match payload.kind {
        InvKind::Block => {
            let first = {
                let mut transit = state.blocks_in_transit.lock();
                *transit = payload.items;
                if transit.is_empty() {
                    None
                } else {
                    Some(transit.remove(0))
                }
            };
            if let Some(hash) = first {
                state
                    .send(
                        &payload.addr_from,
                        &Message::GetData(GetDataPayload {
                            addr_from: state.node_addr.clone(),
                            kind: InvKind::Block,
                            id: hash,
                        }),
                    )
                    .await;
            }
        }
        InvKind::Tx => {
            let Some(id) = payload.items.into_iter().next() else {
                return Ok(());
            };
            let wanted = !state.mempool.lock().contains_key(&hex::encode(&id));
            if wanted {
                state
                    .send(
                        &payload.addr_from,
                        &Message::GetData(GetDataPayload {
                            addr_from: state.node_addr.clone(),
                            kind: InvKind::Tx,
                            id,
                        }),
                    )
                    .await;
            }
        }
    }
    Ok(())
}

/// Advertise every block hash we have, tip first.
async fn handle_get_blocks(state: &Arc<NodeState>, payload: GetBlocksPayload) -> Result<()> {
    let hashes = state.chain.get_block_hashes()?;
    state
        .send(
            &payload.addr_from,
            &Message::Inv(InvPayload {
                addr_from: state.node_addr.clone(),
                kind: InvKind::Block,
                items: hashes,
            }),
        )
        .await;
    Ok(())
}

async fn handle_get_data(state: &Arc<NodeState>, payload: GetDataPayload) -> Result<()> {
    match payload.kind {
        InvKind::Block => {
            let block = match state.chain.get_block(&payload.id) {
                Ok(block) => block,
                Err(err) => {
                    log::warn!("requested block not available: {err}");
                    return Ok(());
                }
            };
            state
                .send(
                    &payload.addr_from,
                    &Message::Block(BlockPayload {
                        addr_from: state.node_addr.clone(),
                        block: block.serialize()?,
                    }),
                )
                .await;
        }
        InvKind::Tx => {
            let tx = state.mempool.lock().get(&hex::encode(&payload.id)).cloned();
            let Some(tx) = tx else {
                log::warn!("requested tx not in mempool");
                return Ok(());
            };
            state
                .send(
                    &payload.addr_from,
                    &Message::Tx(TxPayload {
                        addr_from: state.node_addr.clone(),
                        transaction: tx.serialize()?,
                    }),
                )
                .await;
        }
    }
    Ok(())
}

/// Store a downloaded block, keep draining the in-transit list, and
/// rebuild the UTXO index once the list is empty.
async fn handle_block(state: &Arc<NodeState>, payload: BlockPayload) -> Result<()> {
    let block = match Block::deserialize(&payload.block) {
        Ok(block) => block,
        Err(err) => {
            log::warn!("dropping corrupt block from {}: {err}", payload.addr_from);
            return Ok(());
        }
    };
    log::info!(
        "received block {} at height {}",
        hex::encode(&block.hash),
        block.height
    );

    {
        let _guard = state.chain_lock.lock().await;
        state.chain.add_block(&block)?;
    }

    let next = {
        let mut transit = state.blocks_in_transit.lock();
        if transit.is_empty() {
            None
        } else {
            Some(transit.remove(0))
        }
    };
    match next {
        Some(hash) => {
            state
                .send(
                    &payload.addr_from,
                    &Message::GetData(GetDataPayload {
                        addr_from: state.node_addr.clone(),
                        kind: InvKind::Block,
                        id: hash,
                    }),
                )
                .await;
        }
        None => {
            UtxoSet::new(&state.chain).reindex()?;
            log::info!(
                "sync complete, best height {}",
                state.chain.get_best_height()?
            );
        }
    }
    Ok(())
}

/// Pool an incoming transaction. The central node fans the inventory
/// out to everyone else; a miner checks whether the pool is deep
/// enough to start mining.
async fn handle_tx(state: &Arc<NodeState>, payload: TxPayload) -> Result<()> {
    let tx = match Transaction::deserialize(&payload.transaction) {
        Ok(tx) => tx,
        Err(err) => {
            log::warn!("dropping corrupt tx from {}: {err}", payload.addr_from);
            return Ok(());
        }
    };
    let tx_id = tx.id.clone();
    let pool_len = {
        let mut pool = state.mempool.lock();
        pool.insert(hex::encode(&tx_id), tx);
        pool.len()
    };
    log::debug!("mempool now holds {pool_len} transactions");

    if state.node_addr == CENTRAL_NODE {
        let inv = Message::Inv(InvPayload {
            addr_from: state.node_addr.clone(),
            kind: InvKind::Tx,
            items: vec![tx_id],
        });
        state.broadcast(&inv, &payload.addr_from).await;
    }
    if state.miner_address.is_some() && pool_len >= MINING_THRESHOLD {
        state.mempool_ready.notify_one();
    }
    Ok(())
}

/// Long-running miner: sleeps until the mempool is deep enough, then
/// seals blocks until it drains or shutdown is requested.
async fn mine_loop(state: Arc<NodeState>) {
    let Some(miner_address) = state.miner_address.clone() else {
        return;
    };
    log::info!("miner enabled, rewards to {miner_address}");

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if state.mempool.lock().len() < MINING_THRESHOLD {
            state.mempool_ready.notified().await;
            continue;
        }
        match mine_once(&state, &miner_address).await {
            Ok(()) => {}
            Err(Error::MiningInterrupted) => return,
            Err(err) => {
                log::warn!("mining attempt failed: {err}");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

async fn mine_once(state: &Arc<NodeState>, miner_address: &str) -> Result<()> {
    let _guard = state.chain_lock.lock().await;

    // Select the transactions that still verify; stale or malformed
    // entries are evicted so they cannot wedge the pool.
    let candidates: Vec<Transaction> = state.mempool.lock().values().cloned().collect();
    let mut txs = Vec::new();
    let mut rejected = Vec::new();
    for tx in candidates {
        match state.chain.verify_transaction(&tx) {
            Ok(true) => txs.push(tx),
            _ => rejected.push(hex::encode(&tx.id)),
        }
    }
    if !rejected.is_empty() {
        let mut pool = state.mempool.lock();
        for id in &rejected {
            pool.remove(id);
        }
        log::warn!("evicted {} non-verifying transactions", rejected.len());
    }
    if txs.is_empty() {
        return Ok(());
    }

    let mut block_txs = vec![Transaction::coinbase(miner_address, "")?];
    block_txs.extend(txs);

    let worker = Arc::clone(state);
    let block = tokio::task::spawn_blocking(move || {
        worker.chain.mine_block(block_txs, &worker.shutdown)
    })
    .await
    .map_err(|_| Error::MiningInterrupted)??;

    UtxoSet::new(&state.chain).update(&block)?;

    {
        let mut pool = state.mempool.lock();
        for tx in &block.transactions {
            pool.remove(&hex::encode(&tx.id));
        }
    }
    log::info!(
        "sealed block {} with {} transactions",
        hex::encode(&block.hash),
        block.transactions.len()
    );

    let inv = Message::Inv(InvPayload {
        addr_from: state.node_addr.clone(),
        kind: InvKind::Block,
        items: vec![block.hash.clone()],
    });
    state.broadcast(&inv, "").await;
    Ok(())
}
