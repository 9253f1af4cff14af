use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::*;

use mirach_blocklog::BlockLog;
use mirach_common::logging;
use mirach_config::Config;
use mirach_consensus_logic::chain::{AncillaryWrites, BlockBackend};
use mirach_consensus_logic::schedule::Schedule;
use mirach_consensus_logic::{BlockProcessor, Chain, Finalizer, Mempool, SyncManager};
use mirach_db::{DocStore, RocksDocStore};
use mirach_miner::{miner_task, Miner};
use mirach_p2p::discovery::Discovery;
use mirach_p2p::transport::{listen_task, LocalIdentity};
use mirach_p2p::{PeerRegistry, RecoveryEngine};
use mirach_primitives::crypto;
use mirach_state::collections::{ACCOUNTS, TOKENS};
use mirach_state::{start_writer_task, StateCache};
use mirach_status::{StatusChannel, SyncStatus};
use mirach_steemio::rpc::client::HttpSteemClient;
use mirach_steemio::rpc::pool::SteemClientPool;
use mirach_tasks::{TaskExecutor, TaskManager};
use mirach_txexec::TxExecutor;

use crate::args::{Args, RebuildOptions};
use crate::node::{dispatch_task, timers_task, upstream_task, Node, WitnessIdentity};

mod args;
mod node;
mod rebuild;

fn main() {
    let args: Args = argh::from_env();
    if let Err(e) = main_inner(args) {
        eprintln!("FATAL: {e:#}");
        std::process::exit(1);
    }
}

fn main_inner(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load(&args.config).context("loading config")?;
    if let Some(datadir) = &args.datadir {
        config.client.db_dir = datadir.clone();
    }
    let params = Arc::new(config.params.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mirach-rt")
        .build()
        .expect("init: build rt");
    let task_manager = TaskManager::new(runtime.handle().clone());
    let executor = task_manager.executor();

    logging::init(logging::LoggerConfig::with_base_name("mirach-client"));

    let rebuild_opts = RebuildOptions::from_env();
    runtime.block_on(init_node(
        &config,
        params,
        &executor,
        &rebuild_opts,
    ))?;
    if rebuild_opts.rebuild_state && rebuild_opts.terminate_after {
        info!("rebuild finished, terminating as requested");
        logging::finalize();
        return Ok(());
    }

    task_manager.start_signal_listeners();
    let res = task_manager.monitor(Some(Duration::from_secs(5)));
    logging::finalize();
    res
}

async fn init_node(
    config: &Config,
    params: Arc<mirach_primitives::params::Params>,
    executor: &TaskExecutor,
    rebuild_opts: &RebuildOptions,
) -> anyhow::Result<()> {
    // Document store and the cache over it.
    let db_path = config.client.db_dir.join(&config.client.db_name);
    let store: Arc<dyn DocStore> =
        Arc::new(RocksDocStore::open(&db_path).context("opening document store")?);
    if rebuild_opts.rebuild_state {
        info!("rebuild requested, dropping state database");
        store.drop_database().await?;
    }
    let cache = Arc::new(StateCache::new(store.clone()));
    let head_cursor = cache.load_head_cursor().await?;

    // Block storage: the binary log when a dir is configured, else the
    // document store.
    if rebuild_opts.rebuild_state && config.client.blocks_dir.is_none() {
        anyhow::bail!("REBUILD_STATE needs BLOCKS_DIR: the block log is the rebuild source");
    }

    let mut rebuild_log = None;
    let backend = match &config.client.blocks_dir {
        Some(dir) => {
            let log = BlockLog::open(dir).context("opening block store")?;
            if rebuild_opts.rebuild_state {
                // The replay reads the log directly; the chain keeps its
                // own handle.
                rebuild_log = Some(BlockLog::open(dir)?);
            }
            BlockBackend::Log(Mutex::new(log))
        }
        None => {
            let height = head_cursor.map(|h| h as i64).unwrap_or(-1);
            BlockBackend::docs(store.clone(), height)
        }
    };

    let txexec = Arc::new(TxExecutor::with_builtin_handlers());
    let ancillary = AncillaryWrites {
        notifications: config.features.notifications,
        tx_history: config.features.tx_history,
        witness_stats: config.features.witness_stats,
    };
    let chain = Arc::new(Chain::new(
        params.clone(),
        cache.clone(),
        txexec.clone(),
        backend,
        ancillary,
    ));
    chain.bootstrap().await.context("chain bootstrap")?;

    if let Some(mut log) = rebuild_log {
        rebuild::rebuild_from_log(&chain, &mut log, rebuild_opts).await?;
        chain.load_recent().await?;
        if rebuild_opts.terminate_after {
            return Ok(());
        }
    }

    // Head cursor vs block store: replay anything the flush missed.
    let head = chain.head_id();
    if let Some(cursor) = head_cursor {
        if cursor < head {
            info!(%cursor, %head, "state cursor behind block store, replaying tail");
            let tail = chain.backend().read_range(cursor as i64 + 1, head as i64).await?;
            for b in &tail {
                chain.execute_block_transactions(b, false).await?;
                cache.set_head_block(b.id);
            }
            cache.write_to_disk().await?;
        }
    }

    // Warm the cache before the pipeline starts.
    cache.warmup(ACCOUNTS, params.run.warmup_accounts).await?;
    cache.warmup(TOKENS, params.run.warmup_tokens).await?;
    cache.warmup_witnesses().await?;

    // The flush queue.
    let (writer_handle, writer_fut) = start_writer_task(store.clone());
    cache.attach_writer(writer_handle);
    executor.spawn_critical_async("state-writer", writer_fut);

    // Upstream client pool.
    let clients = config
        .steem
        .endpoints
        .iter()
        .map(|url| HttpSteemClient::new(url.clone()))
        .collect::<Result<Vec<_>, _>>()
        .context("building upstream clients")?;
    let pool = Arc::new(SteemClientPool::new(clients));
    let processor = Arc::new(BlockProcessor::new(
        pool.clone(),
        params.clone(),
        cache.clone(),
        txexec.clone(),
        chain.head().steem_block,
    ));

    // Witness identity, when this node mines.
    let witness = match (&config.witness.account, &config.witness.private_key) {
        (Some(account), Some(wif)) => {
            let key = crypto::seckey_from_b58(wif)
                .map_err(|e| anyhow::anyhow!("bad witness key: {e}"))?;
            info!(%account, "witness identity loaded");
            Some(WitnessIdentity {
                account: account.clone(),
                key,
            })
        }
        _ => None,
    };

    let node_id = witness
        .as_ref()
        .map(|w| crypto::pubkey_to_b58(&crypto::pubkey_for(&w.key)))
        .or_else(|| config.witness.public_key.clone())
        .unwrap_or_else(|| format!("observer-{}", std::process::id()));

    let origin_hash = chain
        .backend()
        .read(0)
        .await?
        .and_then(|g| g.hash)
        .context("missing genesis hash")?;

    // Nodes come up syncing and earn their way out through the quorum.
    let sync = Arc::new(SyncManager::new(params.clone(), true));
    let status_channel = StatusChannel::new(SyncStatus {
        node_id: node_id.clone(),
        behind: 0,
        steem_block: chain.head().steem_block,
        is_syncing: true,
        block_id: chain.head_id(),
        exit_target: None,
    });

    let registry = Arc::new(PeerRegistry::new(params.clone()));
    let discovery = Arc::new(Discovery::new(
        params.clone(),
        config.p2p.bootstrap_peers.clone(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(params.clone()));
    let finalizer = Arc::new(Finalizer::new(params.clone()));
    let mempool = Arc::new(Mutex::new(Mempool::new(
        params.run.max_mempool,
        params.run.mempool_expiry_ms,
    )));
    let schedule = Arc::new(Mutex::new(Schedule::default()));

    let identity = LocalIdentity {
        node_id: node_id.clone(),
        origin_hash,
        p2p_port: config.p2p.port,
    };

    let node = Arc::new(Node {
        params: params.clone(),
        chain: chain.clone(),
        pool,
        processor: processor.clone(),
        sync: sync.clone(),
        finalizer,
        mempool: mempool.clone(),
        registry: registry.clone(),
        discovery,
        recovery,
        schedule: schedule.clone(),
        status_channel,
        identity: identity.clone(),
        witness,
        inbound_tx: std::sync::OnceLock::new(),
    });
    node.recompute_schedule().await?;

    // Channels: peer frames in, mined candidates in.
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (proposal_tx, proposal_rx) = mpsc::channel(8);
    node.wire_inbound(inbound_tx.clone());

    // P2P listener.
    let listen_chain = chain.clone();
    executor.spawn_critical_async(
        "p2p-listener",
        listen_task(
            config.p2p.bind.clone(),
            registry.clone(),
            identity,
            inbound_tx,
            move || listen_chain.head_id(),
        ),
    );

    // Bootstrap dials.
    for url in &config.p2p.bootstrap_peers {
        node.spawn_dial(url.clone());
    }

    // Core tasks.
    let t_node = node.clone();
    executor.spawn_critical_async_with_shutdown("dispatch", move |shutdown| {
        dispatch_task(t_node, inbound_rx, proposal_rx, shutdown)
    });
    let t_node = node.clone();
    executor
        .spawn_critical_async_with_shutdown("upstream-pump", move |shutdown| {
            upstream_task(t_node, shutdown)
        });
    let t_node = node.clone();
    executor.spawn_critical_async_with_shutdown("timers", move |shutdown| {
        timers_task(t_node, shutdown)
    });

    // The miner, when we carry a witness key.
    if let Some(w) = &node.witness {
        let miner = Arc::new(Miner::new(
            chain.clone(),
            processor,
            sync,
            mempool,
            w.account.clone(),
            w.key,
        ));
        executor.spawn_critical_async_with_shutdown("miner", move |shutdown| {
            miner_task(miner, schedule, proposal_tx, shutdown)
        });
    }

    info!("node initialized, tasks running");
    Ok(())
}
