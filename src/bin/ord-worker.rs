use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use chrono::Utc;
use log::{debug, error, info, warn};
use ord_funder::chain::{ChainBackend, ChainObserver, ElectrumClient, IndexerClient};
use ord_funder::config::BackendKind;
use ord_funder::pipeline::{
    drain, BatchWorker, EventHandler, EventQueue, FundedConsumer, FundingPoller,
    NotificationLogger, PipelineContext, Queues, RevealConsumer,
};
use ord_funder::secure::{
    FsObjectStore, LocalKeyService, MemoryObjectStore, ObjectStore, SecureDocumentStore,
};
use ord_funder::store::{
    CollectionBookkeeper, CollectionStore, FundingStore, MemoryCollectionStore,
    MemoryFundingStore, RedbStore,
};
use ord_funder::{Config, OrdResult};

#[derive(FromArgs, Debug)]
#[argh(description = "Polls funding addresses and drives paid requests to their reveal")]
struct Args {
    #[argh(option, short = 'c')]
    /// path of the TOML configuration
    config: PathBuf,

    #[argh(switch)]
    /// run a single tick, then exit
    once: bool,

    #[argh(option)]
    /// collection whose requests are revealed together; may be repeated
    collection: Vec<String>,
}

#[tokio::main]
async fn main() -> OrdResult<()> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = Arc::new(Config::from_file(&args.config)?);
    info!(
        "starting on {} with {:?} backend at {}",
        config.network, config.chain.backend, config.chain.url
    );

    let backend: Arc<dyn ChainBackend> = match config.chain.backend {
        BackendKind::Indexer => Arc::new(IndexerClient::new(
            &config.chain.url,
            config.call_timeout(),
        )?),
        BackendKind::Electrum => Arc::new(
            ElectrumClient::connect(&config.chain.url, config.call_timeout()).await?,
        ),
    };
    let mut observer = ChainObserver::new(backend, config.poller.pool_size, config.call_timeout());
    if config.poller.accept_unconfirmed {
        warn!("unconfirmed payments are accepted as funding");
        observer = observer.accept_unconfirmed();
    }

    let objects: Arc<dyn ObjectStore> = match &config.storage.documents_dir {
        Some(dir) => Arc::new(FsObjectStore::new(dir)),
        None => {
            warn!("no documents directory configured, keeping documents in memory");
            Arc::new(MemoryObjectStore::default())
        }
    };
    let keys = Arc::new(LocalKeyService::from_hex(&config.keys.master_key)?);

    let (funding, collections, queues) = match &config.storage.state_path {
        Some(path) => {
            info!("keeping funding records and queues in {}", path.display());
            let store = Arc::new(RedbStore::open(path)?);
            let queues = Queues::redb(store.database(), &config.queue)?;
            let funding: Arc<dyn FundingStore> = store.clone();
            let collections: Arc<dyn CollectionStore> = store;
            (funding, collections, queues)
        }
        None => {
            warn!("no state path configured, funding records and queues are lost on restart");
            let funding: Arc<dyn FundingStore> = Arc::new(MemoryFundingStore::new());
            let collections: Arc<dyn CollectionStore> = Arc::new(MemoryCollectionStore::default());
            (funding, collections, Queues::memory(&config.queue))
        }
    };
    tokio::spawn(
        CollectionBookkeeper::new(collections, funding.clone()).run(funding.subscribe()),
    );

    let ctx = PipelineContext {
        config: config.clone(),
        funding,
        documents: SecureDocumentStore::new(objects, keys),
        observer,
        queues,
    };

    let interval = Duration::from_secs(config.poller.interval_secs);
    loop {
        tick(&ctx, &args.collection).await;
        if args.once {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    Ok(())
}

/// One pass over every stage; failures are logged and left to the next tick.
async fn tick(ctx: &PipelineContext, batched: &[String]) {
    match FundingPoller::new(ctx.clone()).run_once(Utc::now()).await {
        Ok(report) => debug!("poll: {report:?}"),
        Err(err) => error!("poll failed: {err}"),
    }

    let funded = FundedConsumer::new(ctx.clone()).with_batched_collections(batched.iter().cloned());
    drain_logged("funded", ctx.queues.funded.as_ref(), &funded, ctx).await;

    let batches = BatchWorker::new(ctx.clone());
    for collection_id in batched {
        match batches.run_once(collection_id).await {
            Ok(Some(batch_id)) => info!("{collection_id}: batch {batch_id} started"),
            Ok(None) => {}
            Err(err) => error!("{collection_id}: batching failed: {err}"),
        }
    }

    let reveal = RevealConsumer::new(ctx.clone());
    drain_logged("genesis", ctx.queues.genesis.as_ref(), &reveal, ctx).await;
    drain_logged(
        "notifications",
        ctx.queues.notifications.as_ref(),
        &NotificationLogger,
        ctx,
    )
    .await;
}

async fn drain_logged(
    name: &str,
    queue: &dyn EventQueue,
    handler: &dyn EventHandler,
    ctx: &PipelineContext,
) {
    match drain(queue, handler, ctx.config.queue.retry_delay()).await {
        Ok(report) => debug!("{name} queue: {report:?}"),
        Err(err) => error!("{name} queue failed: {err}"),
    }
}
