//! Known peer addresses, persisted as JSON.

use super::netaddress::NetAddress;
use crate::error::ServiceError;
use crate::service::BaseService;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

const NEED_ADDRESS_THRESHOLD: usize = 1000;
const DUMP_ADDRESS_INTERVAL: Duration = Duration::from_secs(120);
const MAX_FAILED_ATTEMPTS: u32 = 10;
const GET_SELECTION_PERCENT: usize = 23;
const MIN_GET_SELECTION: usize = 32;
const MAX_GET_SELECTION: usize = 250;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    New,
    Old,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnownAddress {
    pub addr: NetAddress,
    pub src: NetAddress,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub bucket: Bucket,
}

#[derive(Serialize, Deserialize, Default)]
struct BookFile {
    addrs: Vec<KnownAddress>,
}

#[derive(Default)]
struct Book {
    addrs: HashMap<NetAddress, KnownAddress>,
    ours: HashSet<NetAddress>,
}

pub struct AddrBook {
    service: BaseService,
    file: PathBuf,
    strict: bool,
    book: Mutex<Book>,
    quit: watch::Sender<bool>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl AddrBook {
    pub fn new(file: &Path, strict: bool) -> Self {
        let (quit, _) = watch::channel(false);
        Self {
            service: BaseService::new("AddrBook"),
            file: file.to_path_buf(),
            strict,
            book: Mutex::new(Book::default()),
            quit,
            saver: Mutex::new(None),
        }
    }

    /// Loads the book file and spawns the periodic save task.
    pub fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        self.service.begin_start()?;
        self.load();
        let book = self.clone();
        let mut quit = self.quit.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(DUMP_ADDRESS_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = quit.wait_for(|q| *q) => break,
                    _ = interval.tick() => book.save(),
                }
            }
        });
        *self.saver.lock() = Some(handle);
        self.service.finish_start(true);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.service.begin_stop()?;
        self.quit.send_replace(true);
        let saver = self.saver.lock().take();
        if let Some(handle) = saver {
            let _ = handle.await;
        }
        self.save();
        self.service.finish_stop();
        Ok(())
    }

    fn load(&self) {
        let raw = match std::fs::read(&self.file) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_slice::<BookFile>(&raw) {
            Ok(file) => {
                let mut book = self.book.lock();
                for known in file.addrs {
                    book.addrs.insert(known.addr, known);
                }
                info!(file = %self.file.display(), size = book.addrs.len(), "address book loaded");
            }
            Err(err) => error!(file = %self.file.display(), %err, "corrupt address book, starting empty"),
        }
    }

    pub fn save(&self) {
        let file = BookFile {
            addrs: self.book.lock().addrs.values().cloned().collect(),
        };
        let result = serde_json::to_vec_pretty(&file)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                if let Some(dir) = self.file.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let tmp = self.file.with_extension("tmp");
                std::fs::write(&tmp, bytes)?;
                std::fs::rename(&tmp, &self.file)
            });
        match result {
            Ok(()) => debug!(size = file.addrs.len(), "address book saved"),
            Err(err) => error!(file = %self.file.display(), %err, "failed to save address book"),
        }
    }

    pub fn add_our_address(&self, addr: NetAddress) {
        let mut book = self.book.lock();
        book.addrs.remove(&addr);
        book.ours.insert(addr);
    }

    /// Returns false when the address was ignored.
    pub fn add_address(&self, addr: NetAddress, src: NetAddress) -> bool {
        if !addr.valid() || (self.strict && !addr.routable()) {
            debug!(%addr, "ignoring unroutable address");
            return false;
        }
        let mut book = self.book.lock();
        if book.ours.contains(&addr) {
            return false;
        }
        book.addrs.entry(addr).or_insert_with(|| KnownAddress {
            addr,
            src,
            attempts: 0,
            last_attempt: None,
            last_success: None,
            bucket: Bucket::New,
        });
        true
    }

    pub fn size(&self) -> usize {
        self.book.lock().addrs.len()
    }

    pub fn need_more_addrs(&self) -> bool {
        self.size() < NEED_ADDRESS_THRESHOLD
    }

    pub fn has(&self, addr: &NetAddress) -> bool {
        self.book.lock().addrs.contains_key(addr)
    }

    /// Picks a random address. `new_bias` (0..=100) is the chance of
    /// drawing from the untried addresses rather than the proven ones.
    pub fn pick_address(&self, new_bias: u32) -> Option<NetAddress> {
        let book = self.book.lock();
        let (new, old): (Vec<_>, Vec<_>) = book
            .addrs
            .values()
            .partition(|k| k.bucket == Bucket::New);
        let mut rng = rand::thread_rng();
        let prefer_new = rng.gen_range(0..100) < new_bias.min(100);
        let pool = match (prefer_new, new.is_empty(), old.is_empty()) {
            (_, true, true) => return None,
            (true, false, _) | (false, false, true) => new,
            _ => old,
        };
        pool.choose(&mut rng).map(|k| k.addr)
    }

    pub fn mark_attempt(&self, addr: &NetAddress) {
        if let Some(known) = self.book.lock().addrs.get_mut(addr) {
            known.attempts += 1;
            known.last_attempt = Some(Utc::now());
        }
    }

    pub fn mark_good(&self, addr: &NetAddress) {
        if let Some(known) = self.book.lock().addrs.get_mut(addr) {
            known.attempts = 0;
            known.last_success = Some(Utc::now());
            known.bucket = Bucket::Old;
        }
    }

    /// Forgets the address after too many failures.
    pub fn mark_failed(&self, addr: &NetAddress) {
        let mut book = self.book.lock();
        if let Some(known) = book.addrs.get(addr) {
            if known.bucket == Bucket::New && known.attempts >= MAX_FAILED_ATTEMPTS {
                book.addrs.remove(addr);
            }
        }
    }

    pub fn mark_bad(&self, addr: &NetAddress) {
        self.book.lock().addrs.remove(addr);
    }

    /// A random sample to share with a peer.
    pub fn get_selection(&self) -> Vec<NetAddress> {
        let book = self.book.lock();
        let mut all: Vec<NetAddress> = book.addrs.keys().copied().collect();
        let n = (all.len() * GET_SELECTION_PERCENT / 100)
            .max(MIN_GET_SELECTION)
            .min(MAX_GET_SELECTION)
            .min(all.len());
        all.shuffle(&mut rand::thread_rng());
        all.truncate(n);
        all
    }
}
