//! Loader: CAR log and remote sync
//!
//! Every local transaction is written as one CAR through the local gateway.
//! Each block, the `TransactionMeta` root included, is passed through the
//! block codec first, so with encryption enabled only ciphertext reaches a
//! gateway. The CAR log (oldest first) is persisted as a meta record, which
//! is enough to reload the store.
//!
//! With a remote configured, each commit also records a `DbMeta` in the WAL.
//! Processing the WAL copies the CARs to the remote gateway and publishes
//! the meta there as an event of the meta clock. Remote metas go the other
//! way: unknown CARs are fetched, decoded and handed back as blocks plus the
//! head they make durable.
//!
//! Gateway layout under the base URL:
//! - `data/<cid>?store=data`: CARs and files
//! - `meta/main?store=meta`: meta record
//! - `wal/main?store=wal`: WAL state

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use ember_core::{Block, Cid, ClockHead, Codec, Error, Result, TransactionMeta};
use ember_durability::gateway::join_key;
use ember_durability::{
    CarArchive, DbMeta, DbMetaEvent, Envelope, EnvelopeError, EnvelopeType, FileOperation,
    Gateway, GatewayError, GatewayResult, Subscription, WalSink, WriteAheadLog,
};
use ember_storage::BlockCodec;

use crate::crdt_clock::CommitHook;

/// Key of the meta and WAL records.
const MAIN_KEY: &str = "main";

/// Resolved gateway URLs of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUrls {
    /// Prefix for CARs and files
    pub data: Url,
    /// Meta record
    pub meta: Url,
    /// WAL record
    pub wal: Url,
}

impl StoreUrls {
    /// Start `gateway` on `base` and derive the store URLs.
    pub async fn resolve(gateway: &dyn Gateway, base: &Url) -> Result<Self> {
        let base = gateway.start(base).await?;
        let area = |name: &str| -> GatewayResult<Url> {
            let mut url = join_key(&base, name)?;
            url.query_pairs_mut().append_pair("store", name);
            Ok(url)
        };
        let data = area("data")?;
        let meta = gateway.build_url(&area("meta")?, MAIN_KEY).await?;
        let wal = gateway.build_url(&area("wal")?, MAIN_KEY).await?;
        Ok(Self { data, meta, wal })
    }

    async fn block(&self, gateway: &dyn Gateway, cid: &Cid) -> GatewayResult<Url> {
        gateway.build_url(&self.data, &cid.to_string()).await
    }
}

/// Remote side of a store.
pub struct RemoteStore {
    gateway: Arc<dyn Gateway>,
    urls: StoreUrls,
}

impl RemoteStore {
    /// Remote over `gateway` rooted at `base`.
    pub async fn open(gateway: Arc<dyn Gateway>, base: &Url) -> Result<Self> {
        let urls = StoreUrls::resolve(&*gateway, base).await?;
        Ok(Self { gateway, urls })
    }

    /// Resolved remote URLs.
    pub fn urls(&self) -> &StoreUrls {
        &self.urls
    }
}

/// Blocks and head reproduced from CARs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedState {
    /// Event CIDs to advance to. After [`Loader::load`] this is the sorted
    /// union of every CAR's head, which may still hold ancestors.
    pub head: ClockHead,
    /// Decoded blocks of every CAR read
    pub blocks: Vec<Block>,
    /// The CARs read
    pub cars: Vec<Cid>,
}

struct ReadCar {
    meta: TransactionMeta,
    blocks: Vec<Block>,
    bytes: Vec<u8>,
}

/// CAR log of one store plus its remote sync state.
pub struct Loader {
    gateway: Arc<dyn Gateway>,
    urls: StoreUrls,
    codec: Arc<dyn BlockCodec>,
    car_log: Mutex<Vec<Cid>>,
    log_gate: tokio::sync::Mutex<()>,
    last_meta: Mutex<Option<TransactionMeta>>,
    remote: Option<RemoteStore>,
    wal: Option<WriteAheadLog>,
    meta_head: Mutex<Vec<Cid>>,
    published: Mutex<HashSet<Cid>>,
    uploaded: Mutex<HashSet<Cid>>,
}

impl Loader {
    /// Open a loader on `gateway` at `base`.
    ///
    /// The WAL is only used with a remote.
    pub async fn open(
        gateway: Arc<dyn Gateway>,
        base: &Url,
        codec: Arc<dyn BlockCodec>,
        remote: Option<RemoteStore>,
    ) -> Result<Self> {
        let urls = StoreUrls::resolve(&*gateway, base).await?;
        let wal = match remote {
            Some(_) => Some(WriteAheadLog::load(gateway.clone(), urls.wal.clone()).await?),
            None => None,
        };
        debug!(target: "ember::loader", data = %urls.data, codec = codec.codec_id(), "Loader opened");
        Ok(Self {
            gateway,
            urls,
            codec,
            car_log: Mutex::new(Vec::new()),
            log_gate: tokio::sync::Mutex::new(()),
            last_meta: Mutex::new(None),
            remote,
            wal,
            meta_head: Mutex::new(Vec::new()),
            published: Mutex::new(HashSet::new()),
            uploaded: Mutex::new(HashSet::new()),
        })
    }

    /// Resolved local URLs.
    pub fn urls(&self) -> &StoreUrls {
        &self.urls
    }

    /// CAR CIDs, oldest first.
    pub fn car_log(&self) -> Vec<Cid> {
        self.car_log.lock().clone()
    }

    /// Meta of the newest local transaction or compaction.
    pub fn last_meta(&self) -> Option<TransactionMeta> {
        self.last_meta.lock().clone()
    }

    /// True when a remote is configured.
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Pending WAL entries; zero without a remote.
    pub fn wal_len(&self) -> usize {
        self.wal.as_ref().map_or(0, |wal| wal.state().len())
    }

    /// Read the local meta record and every CAR it names.
    ///
    /// `None` for a store that was never written. Remote CARs sit in the
    /// same log, so the newest CAR alone does not name the local head.
    pub async fn load(&self) -> Result<Option<LoadedState>> {
        let records = match self.gateway.get(&self.urls.meta).await {
            Ok(envelope) => envelope.into_meta()?,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(record) = records.into_iter().next() else {
            return Ok(None);
        };
        let db_meta = record.to_db_meta()?;

        let mut blocks = Vec::new();
        let mut heads = BTreeSet::new();
        let mut newest = None;
        for car in &db_meta.cars {
            let read = self.read_car(&*self.gateway, &self.urls, car).await?;
            blocks.extend(read.blocks);
            heads.extend(read.meta.head.iter().copied());
            newest = Some(read.meta);
        }
        info!(
            target: "ember::loader",
            cars = db_meta.cars.len(),
            blocks = blocks.len(),
            "Loader ready"
        );
        *self.car_log.lock() = db_meta.cars.clone();
        let loaded = newest.is_some();
        *self.last_meta.lock() = newest;
        Ok(loaded.then(|| LoadedState {
            head: heads.into_iter().collect(),
            blocks,
            cars: db_meta.cars,
        }))
    }

    async fn write_car(&self, blocks: &[Block], meta: &TransactionMeta) -> Result<Cid> {
        let root = self.codec.encode(&Block::encode(meta)?)?;
        let root_cid = root.cid;
        let mut encoded = Vec::with_capacity(blocks.len() + 1);
        encoded.push(root);
        for block in blocks {
            encoded.push(self.codec.encode(block)?);
        }
        let car = CarArchive::new(vec![root_cid], encoded).to_block()?;
        let url = self.urls.block(&*self.gateway, &car.cid).await?;
        self.gateway.put(&url, Envelope::Car(car.bytes)).await?;
        debug!(target: "ember::loader", car = %car.cid, blocks = blocks.len(), "CAR written");
        Ok(car.cid)
    }

    async fn read_car(&self, gateway: &dyn Gateway, urls: &StoreUrls, cid: &Cid) -> Result<ReadCar> {
        let url = urls.block(gateway, cid).await?;
        let bytes = gateway.get(&url).await?.into_car()?;
        if !cid.matches(&bytes) {
            return Err(Error::Corruption(format!(
                "CAR {} does not match its address",
                cid
            )));
        }
        let archive = CarArchive::decode(&bytes)?;
        let root = *archive
            .roots
            .first()
            .ok_or_else(|| Error::Corruption(format!("CAR {} has no root", cid)))?;

        let mut meta = None;
        let mut blocks = Vec::with_capacity(archive.blocks.len());
        for encoded in &archive.blocks {
            let block = self.codec.decode(encoded)?;
            if encoded.cid == root {
                meta = Some(block.decode::<TransactionMeta>()?);
            } else {
                blocks.push(block);
            }
        }
        let meta = meta.ok_or(Error::MissingBlock(root))?;
        Ok(ReadCar {
            meta,
            blocks,
            bytes,
        })
    }

    async fn persist(&self, cars: &[Cid]) -> Result<()> {
        let (event, _) = DbMetaEvent::create(DbMeta::new(cars.to_vec()), Vec::new())?;
        self.gateway
            .put(&self.urls.meta, Envelope::Meta(vec![event.to_serialized()?]))
            .await?;
        Ok(())
    }

    /// Replace the CAR log with a single CAR holding `blocks`.
    ///
    /// Old CARs are deleted from the local gateway; a failed delete is
    /// logged and skipped.
    pub async fn compacted(&self, blocks: &[Block], meta: &TransactionMeta) -> Result<Cid> {
        let car = self.write_car(blocks, meta).await?;
        let old = {
            let _log = self.log_gate.lock().await;
            self.persist(&[car]).await?;
            std::mem::replace(&mut *self.car_log.lock(), vec![car])
        };
        if !meta.is_empty() {
            *self.last_meta.lock() = Some(meta.clone());
        }

        for cid in old.iter().filter(|c| **c != car) {
            let url = self.urls.block(&*self.gateway, cid).await?;
            if let Err(e) = self.gateway.delete(&url).await {
                warn!(target: "ember::loader", car = %cid, error = %e, "Failed to delete compacted CAR");
            }
        }

        if let Some(wal) = &self.wal {
            wal.enqueue(DbMeta::new(vec![car]), true).await?;
            self.sync_quietly().await;
        }
        info!(target: "ember::loader", car = %car, replaced = old.len(), "CAR log compacted");
        Ok(car)
    }

    /// Store a standalone file.
    ///
    /// Non-public files go through the block codec. Returns the stored
    /// block's CID.
    pub async fn put_file(&self, bytes: Vec<u8>, public: bool) -> Result<Cid> {
        let plain = Block::raw(bytes);
        let stored = if public {
            plain
        } else {
            self.codec.encode(&plain)?
        };
        let url = self.urls.block(&*self.gateway, &stored.cid).await?;
        self.gateway.put(&url, Envelope::File(stored.bytes)).await?;
        if let Some(wal) = &self.wal {
            wal.enqueue_file(stored.cid, public).await?;
            self.sync_quietly().await;
        }
        Ok(stored.cid)
    }

    /// Read a file stored with [`Loader::put_file`], locally or remotely.
    pub async fn get_file(&self, cid: &Cid) -> Result<Vec<u8>> {
        let bytes = match self.fetch_file(&*self.gateway, &self.urls, cid).await {
            Ok(bytes) => bytes,
            Err(Error::GatewayError(msg)) => match &self.remote {
                Some(remote) => {
                    debug!(target: "ember::loader", cid = %cid, error = %msg, "File not local");
                    self.fetch_file(&*remote.gateway, &remote.urls, cid).await?
                }
                None => return Err(Error::GatewayError(msg)),
            },
            Err(e) => return Err(e),
        };
        let block = Block::new(*cid, bytes);
        if !block.verify() {
            return Err(Error::Corruption(format!("file {} does not match its address", cid)));
        }
        if cid.codec() == Codec::Encrypted {
            return Ok(self.codec.decode(&block)?.bytes);
        }
        Ok(block.bytes)
    }

    async fn fetch_file(&self, gateway: &dyn Gateway, urls: &StoreUrls, cid: &Cid) -> Result<Vec<u8>> {
        let url = urls.block(gateway, cid).await?;
        match gateway.get(&url).await? {
            Envelope::File(bytes) => Ok(bytes),
            other => Err(EnvelopeError::UnexpectedType {
                actual: other.kind(),
                expected: EnvelopeType::File.to_string(),
            }
            .into()),
        }
    }

    /// Upload everything pending in the WAL.
    ///
    /// Returns the number of WAL entries completed; `Ok(0)` without a
    /// remote.
    pub async fn sync(&self) -> Result<usize> {
        let (Some(wal), Some(remote)) = (&self.wal, &self.remote) else {
            return Ok(0);
        };
        let sink = RemoteSink {
            loader: self,
            remote,
        };
        Ok(wal.process(&sink).await?)
    }

    async fn sync_quietly(&self) {
        if let Err(e) = self.sync().await {
            debug!(target: "ember::loader", error = %e, "Remote sync deferred");
        }
    }

    /// Subscribe to remote meta publications.
    pub async fn subscribe_remote(&self) -> Result<Option<Subscription>> {
        match &self.remote {
            Some(remote) => Ok(Some(remote.gateway.subscribe(&remote.urls.meta).await?)),
            None => Ok(None),
        }
    }

    /// Meta events currently stored on the remote.
    pub async fn remote_metas(&self) -> Result<Vec<DbMetaEvent>> {
        let Some(remote) = &self.remote else {
            return Ok(Vec::new());
        };
        let records = match remote.gateway.get(&remote.urls.meta).await {
            Ok(envelope) => envelope.into_meta()?,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        records.iter().map(|r| r.to_event()).collect()
    }

    /// Ingest a remote meta event.
    ///
    /// Fetches every CAR it names that is not in the local log, keeps a
    /// local copy, and returns their blocks with the head of its newest
    /// CAR. `None` for metas published by this loader or naming no new CAR.
    /// The CARs join the log only through [`Loader::adopt`], once their
    /// head is applied.
    pub async fn handle_db_meta(&self, event: &DbMetaEvent) -> Result<Option<LoadedState>> {
        if self.published.lock().contains(&event.event_cid) {
            return Ok(None);
        }
        {
            let mut head = self.meta_head.lock();
            head.retain(|c| !event.parents.contains(c));
            if !head.contains(&event.event_cid) {
                head.push(event.event_cid);
            }
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(newest) = event.meta.cars.last() else {
            return Ok(None);
        };

        let known: HashSet<Cid> = self.car_log().into_iter().collect();
        let mut fetched = Vec::new();
        let mut blocks = Vec::new();
        let mut head = None;
        for car in event.meta.cars.iter().filter(|c| !known.contains(*c)) {
            let read = self.read_car(&*remote.gateway, &remote.urls, car).await?;
            let local = self.urls.block(&*self.gateway, car).await?;
            self.gateway.put(&local, Envelope::Car(read.bytes)).await?;
            blocks.extend(read.blocks);
            fetched.push(*car);
            if car == newest {
                head = Some(read.meta.head);
            }
        }
        if fetched.is_empty() {
            return Ok(None);
        }
        let head = match head {
            Some(head) => head,
            None => self.read_car(&*self.gateway, &self.urls, newest).await?.meta.head,
        };

        debug!(
            target: "ember::loader",
            meta = %event.event_cid,
            cars = fetched.len(),
            blocks = blocks.len(),
            "Remote meta loaded"
        );
        Ok(Some(LoadedState {
            head,
            blocks,
            cars: fetched,
        }))
    }

    /// Append remote CARs to the log.
    ///
    /// They count as uploaded, so the WAL never copies them back.
    pub async fn adopt(&self, cars: &[Cid]) -> Result<()> {
        let _log = self.log_gate.lock().await;
        let mut log = self.car_log();
        let before = log.len();
        for car in cars {
            if !log.contains(car) {
                log.push(*car);
            }
        }
        self.uploaded.lock().extend(cars.iter().copied());
        if log.len() == before {
            return Ok(());
        }
        self.persist(&log).await?;
        *self.car_log.lock() = log;
        Ok(())
    }
}

#[async_trait]
impl CommitHook for Loader {
    async fn committed(&self, blocks: Vec<Block>, meta: &TransactionMeta) -> Result<()> {
        let car = self.write_car(&blocks, meta).await?;
        let cars = {
            let _log = self.log_gate.lock().await;
            let mut cars = self.car_log();
            cars.push(car);
            self.persist(&cars).await?;
            *self.car_log.lock() = cars.clone();
            cars
        };
        *self.last_meta.lock() = Some(meta.clone());

        if let Some(wal) = &self.wal {
            if let Err(e) = wal.enqueue(DbMeta::new(cars), false).await {
                warn!(target: "ember::loader", car = %car, error = %e, "WAL enqueue failed");
                return Ok(());
            }
            self.sync_quietly().await;
        }
        Ok(())
    }
}

struct RemoteSink<'a> {
    loader: &'a Loader,
    remote: &'a RemoteStore,
}

impl RemoteSink<'_> {
    async fn copy(&self, cid: &Cid) -> GatewayResult<()> {
        if self.loader.uploaded.lock().contains(cid) {
            return Ok(());
        }
        let local = self.loader.urls.block(&*self.loader.gateway, cid).await?;
        let envelope = self.loader.gateway.get(&local).await?;
        let url = self.remote.urls.block(&*self.remote.gateway, cid).await?;
        self.remote.gateway.put(&url, envelope).await?;
        self.loader.uploaded.lock().insert(*cid);
        debug!(target: "ember::loader", cid = %cid, "Uploaded");
        Ok(())
    }
}

#[async_trait]
impl<'a> WalSink for RemoteSink<'a> {
    async fn flush_car(&self, cid: &Cid) -> GatewayResult<()> {
        self.copy(cid).await
    }

    async fn flush_file(&self, op: &FileOperation) -> GatewayResult<()> {
        self.copy(&op.cid).await
    }

    async fn publish_meta(&self, meta: &DbMeta) -> GatewayResult<()> {
        let parents = self.loader.meta_head.lock().clone();
        let (event, _) = DbMetaEvent::create(meta.clone(), parents)
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let record = event
            .to_serialized()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        self.loader.published.lock().insert(event.event_cid);
        self.remote
            .gateway
            .put(&self.remote.urls.meta, Envelope::Meta(vec![record]))
            .await?;
        *self.loader.meta_head.lock() = vec![event.event_cid];
        debug!(target: "ember::loader", meta = %event.event_cid, cars = meta.cars.len(), "Meta published");
        Ok(())
    }
}
