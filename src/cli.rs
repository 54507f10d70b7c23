//! Command surface. Every subcommand reads `NODE_ID` from the
//! environment to locate this node's database and wallet file.

use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::blockchain::{Blockchain, Transaction, UtxoSet};
use crate::config::{NodeConfig, CENTRAL_NODE};
use crate::crypto::validate_address;
use crate::network::{self, Server};
use crate::wallet::WalletStore;

#[derive(Parser)]
#[command(name = "ferrocoin", version, about = "An educational UTXO blockchain node")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Get the balance for an address
    Getbalance {
        #[arg(long)]
        address: String,
    },
    /// Create a blockchain and send the genesis reward to an address
    Createblockchain {
        #[arg(long)]
        address: String,
    },
    /// Print the blocks in the chain, tip first
    Printchain,
    /// Create a new wallet
    Createwallet,
    /// List the addresses in this node's wallet file
    Listaddresses,
    /// Rebuild the UTXO index from the chain
    Reindex,
    /// Send coins; with --mine the block is sealed on this node
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        mine: bool,
    },
    /// Start the node; --miner enables mining to the given address
    Startnode {
        #[arg(long)]
        miner: Option<String>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::from_env().context("NODE_ID selects this node's data")?;

    match cli.command {
        Command::Getbalance { address } => get_balance(&config, &address),
        Command::Createblockchain { address } => create_blockchain(&config, &address),
        Command::Printchain => print_chain(&config),
        Command::Createwallet => create_wallet(&config),
        Command::Listaddresses => list_addresses(&config),
        Command::Reindex => reindex(&config),
        Command::Send {
            from,
            to,
            amount,
            mine,
        } => send(&config, &from, &to, amount, mine).await,
        Command::Startnode { miner } => start_node(config, miner).await,
    }
}

fn get_balance(config: &NodeConfig, address: &str) -> anyhow::Result<()> {
    if !validate_address(address) {
        bail!("address is not valid");
    }
    let chain = Blockchain::open(config)?;
    let balance = UtxoSet::new(&chain).balance(address)?;
    println!("Balance of {address}: {balance}");
    Ok(())
}

fn create_blockchain(config: &NodeConfig, address: &str) -> anyhow::Result<()> {
    if !validate_address(address) {
        bail!("address is not valid");
    }
    let chain = Blockchain::create(address, config)?;
    UtxoSet::new(&chain).reindex()?;
    println!("Done!");
    Ok(())
}

fn print_chain(config: &NodeConfig) -> anyhow::Result<()> {
    let chain = Blockchain::open(config)?;
    for block in chain.iterator()? {
        let block = block?;
        println!("============ Block {} ============", hex::encode(&block.hash));
        println!("Height:     {}", block.height);
        println!("Prev. hash: {}", hex::encode(&block.prev_hash));
        println!("PoW valid:  {}", block.validate_pow()?);
        for tx in &block.transactions {
            print!("{tx}");
        }
        println!();
    }
    Ok(())
}

fn create_wallet(config: &NodeConfig) -> anyhow::Result<()> {
    let mut wallets = WalletStore::load(config)?;
    let address = wallets.create_wallet();
    wallets.save()?;
    println!("New address is: {address}");
    Ok(())
}

fn list_addresses(config: &NodeConfig) -> anyhow::Result<()> {
    let wallets = WalletStore::load(config)?;
    for address in wallets.addresses() {
        println!("{address}");
    }
    Ok(())
}

fn reindex(config: &NodeConfig) -> anyhow::Result<()> {
    let chain = Blockchain::open(config)?;
    let utxo = UtxoSet::new(&chain);
    utxo.reindex()?;
    let count = utxo.count_transactions()?;
    println!("Done! There are {count} transactions in the UTXO set.");
    Ok(())
}

async fn send(
    config: &NodeConfig,
    from: &str,
    to: &str,
    amount: u64,
    mine: bool,
) -> anyhow::Result<()> {
    if !validate_address(from) || !validate_address(to) {
        bail!("address is not valid");
    }
    if amount == 0 {
        bail!("amount must be positive");
    }
    let chain = Blockchain::open(config)?;
    let utxo = UtxoSet::new(&chain);

    let wallets = WalletStore::load(config)?;
    let wallet = wallets
        .get(from)
        .context("sending address is not in this node's wallet file")?;
    let tx = Transaction::new(wallet, to, amount, &utxo)?;

    if mine {
        let coinbase = Transaction::coinbase(from, "")?;
        let block = chain.mine_block(vec![coinbase, tx], &AtomicBool::new(false))?;
        utxo.update(&block)?;
    } else {
        network::send_tx(CENTRAL_NODE, &config.listen_addr(), &tx).await?;
    }
    println!("Success!");
    Ok(())
}

async fn start_node(config: NodeConfig, miner: Option<String>) -> anyhow::Result<()> {
    println!("Starting node {}", config.node_id);
    if let Some(address) = &miner {
        if !validate_address(address) {
            bail!("wrong miner address");
        }
        println!("Mining is on. Address to receive rewards: {address}");
    }
    let server = Server::new(&config, miner)?;
    server.run().await?;
    Ok(())
}
