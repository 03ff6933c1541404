//! Instantiates the storage and handler graph from configuration.
//!
//! Each prefix is built on first reference; a prefix referenced again
//! while it is still being set up is a configuration cycle, reported
//! with the full path so the offending chain is visible:
//!
//! ```text
//! configuration loop: /a/ -> /b/ -> /a/
//! ```

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use larch_core::BlobRef;
use larch_core::Error;
use larch_core::MemoryStorage;
use larch_core::Result;
use larch_core::Storage;
use larch_disk::DiskStorage;
use larch_index::Index;
use larch_index::SqliteIndex;
use larch_routing::CondStorage;
use larch_routing::RemoteStorage;
use larch_routing::ReplicaStorage;
use larch_routing::ShardStorage;
use larch_routing::WriteRule;

use crate::config::PrefixConfig;
use crate::config::ServerConfig;
use crate::server::search::SearchHandler;

/// A constructed prefix handler.
#[derive(Clone)]
pub enum Handler {
    /// A plain storage backend, served over the blob protocol.
    Storage(Arc<dyn Storage>),
    /// An index: a storage for receiving, plus the query interface.
    Index {
        storage: Arc<dyn Storage>,
        index: Arc<dyn Index>,
    },
    /// The search/describe endpoints over an index.
    Search(Arc<SearchHandler>),
}

impl Handler {
    /// The storage view of this handler, if it has one.
    pub fn storage(&self) -> Option<Arc<dyn Storage>> {
        match self {
            Handler::Storage(storage) => Some(storage.clone()),
            Handler::Index { storage, .. } => Some(storage.clone()),
            Handler::Search(_) => None,
        }
    }
}

/// Builds and caches handlers by prefix.
pub struct Loader {
    configs: BTreeMap<String, PrefixConfig>,
    built: HashMap<String, Handler>,
    in_progress: Vec<String>,
}

impl Loader {
    pub fn new(config: &ServerConfig) -> Loader {
        Loader {
            configs: config.prefixes.clone(),
            built: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    /// Instantiate every configured prefix.
    pub fn build_all(&mut self) -> Result<()> {
        let prefixes: Vec<String> = self.configs.keys().cloned().collect();
        for prefix in prefixes {
            self.setup(&prefix)?;
        }
        Ok(())
    }

    /// The storage registered at `prefix`, building it if needed.
    pub fn get_storage(&mut self, prefix: &str) -> Result<Arc<dyn Storage>> {
        self.setup(prefix)?;
        self.built
            .get(prefix)
            .and_then(Handler::storage)
            .ok_or_else(|| Error::config(format!("handler {prefix:?} is not a storage")))
    }

    /// The index registered at `prefix`, building it if needed.
    pub fn get_index(&mut self, prefix: &str) -> Result<Arc<dyn Index>> {
        self.setup(prefix)?;
        match self.built.get(prefix) {
            Some(Handler::Index { index, .. }) => Ok(index.clone()),
            _ => Err(Error::config(format!("handler {prefix:?} is not an index"))),
        }
    }

    /// Any handler at `prefix`, building it if needed.
    pub fn get_handler(&mut self, prefix: &str) -> Result<Handler> {
        self.setup(prefix)?;
        self.built
            .get(prefix)
            .cloned()
            .ok_or_else(|| Error::config(format!("no handler at {prefix:?}")))
    }

    /// The configured handler type name for `prefix`.
    pub fn get_handler_type(&self, prefix: &str) -> Option<&str> {
        self.configs.get(prefix).map(|c| c.handler.as_str())
    }

    /// All built handlers, by prefix.
    pub fn handlers(&self) -> impl Iterator<Item = (&String, &Handler)> {
        self.built.iter()
    }

    fn setup(&mut self, prefix: &str) -> Result<()> {
        if self.built.contains_key(prefix) {
            return Ok(());
        }
        if self.in_progress.iter().any(|p| p == prefix) {
            let mut path = self.in_progress.clone();
            path.push(prefix.to_string());
            return Err(Error::config(format!(
                "configuration loop: {}",
                path.join(" -> ")
            )));
        }
        let config = self
            .configs
            .get(prefix)
            .cloned()
            .ok_or_else(|| Error::config(format!("reference to undefined handler {prefix:?}")))?;

        self.in_progress.push(prefix.to_string());
        let result = self.construct(&config);
        self.in_progress.pop();

        self.built.insert(prefix.to_string(), result?);
        Ok(())
    }

    fn construct(&mut self, config: &PrefixConfig) -> Result<Handler> {
        match config.handler.as_str() {
            "storage-memory" => Ok(Handler::Storage(Arc::new(MemoryStorage::new()))),
            "storage-localdisk" => {
                let args: DiskArgs = parse_args(config)?;
                let storage = match args.partition {
                    Some(partition) => DiskStorage::with_partition(args.path, partition)?,
                    None => DiskStorage::new(args.path)?,
                };
                Ok(Handler::Storage(Arc::new(storage)))
            }
            "storage-shard" => {
                let args: BackendsArgs = parse_args(config)?;
                let shards = self.resolve_backends(&args.backends)?;
                Ok(Handler::Storage(Arc::new(ShardStorage::new(shards)?)))
            }
            "storage-replica" => {
                let args: ReplicaArgs = parse_args(config)?;
                let backends = self.resolve_backends(&args.backends)?;
                let min_writes = args.min_writes_for_success.unwrap_or(backends.len());
                Ok(Handler::Storage(Arc::new(ReplicaStorage::new(
                    backends, min_writes,
                )?)))
            }
            "storage-cond" => {
                let args: CondArgs = parse_args(config)?;
                let write = match args.write {
                    CondWriteArgs::Always(prefix) => {
                        WriteRule::Always(self.get_storage(&prefix)?)
                    }
                    CondWriteArgs::If {
                        predicate,
                        then,
                        otherwise,
                    } => {
                        if predicate != "isSchema" {
                            return Err(Error::config(format!(
                                "unknown cond predicate {predicate:?}"
                            )));
                        }
                        WriteRule::IfSchema {
                            then: self.get_storage(&then)?,
                            otherwise: self.get_storage(&otherwise)?,
                        }
                    }
                };
                let read = self.get_storage(&args.read)?;
                let mut cond = CondStorage::new(write, read);
                if let Some(remove) = args.remove {
                    cond = cond.with_remove_target(self.get_storage(&remove)?);
                }
                Ok(Handler::Storage(Arc::new(cond)))
            }
            "storage-remote" => {
                let args: RemoteArgs = parse_args(config)?;
                Ok(Handler::Storage(Arc::new(RemoteStorage::new(
                    args.url,
                    args.password,
                ))))
            }
            "storage-sqlite-index" => {
                let args: SqliteIndexArgs = parse_args(config)?;
                let index = match args.file.as_deref() {
                    None | Some(":memory:") => SqliteIndex::open_in_memory()?,
                    Some(path) => SqliteIndex::open(path)?,
                };
                let index = Arc::new(index);
                Ok(Handler::Index {
                    storage: index.clone(),
                    index,
                })
            }
            "search" => {
                let args: SearchArgs = parse_args(config)?;
                let index = self.get_index(&args.index)?;
                let owner = BlobRef::parse(&args.owner).ok_or_else(|| {
                    Error::config(format!(
                        "search 'owner' has malformed blobref {:?}; expecting e.g. sha1-xxxxxxxx",
                        args.owner
                    ))
                })?;
                Ok(Handler::Search(Arc::new(SearchHandler::new(index, owner))))
            }
            other => Err(Error::config(format!("unknown handler type {other:?}"))),
        }
    }

    fn resolve_backends(&mut self, prefixes: &[String]) -> Result<Vec<Arc<dyn Storage>>> {
        prefixes.iter().map(|p| self.get_storage(p)).collect()
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(config: &PrefixConfig) -> Result<T> {
    let args = match &config.handler_args {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(args).map_err(|e| {
        Error::config(format!("invalid handlerArgs for {:?}: {e}", config.handler))
    })
}

#[derive(Deserialize)]
struct DiskArgs {
    path: String,
    #[serde(default)]
    partition: Option<String>,
}

#[derive(Deserialize)]
struct BackendsArgs {
    backends: Vec<String>,
}

#[derive(Deserialize)]
struct ReplicaArgs {
    backends: Vec<String>,
    #[serde(rename = "minWritesForSuccess", default)]
    min_writes_for_success: Option<usize>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CondWriteArgs {
    Always(String),
    If {
        #[serde(rename = "if")]
        predicate: String,
        then: String,
        #[serde(rename = "else")]
        otherwise: String,
    },
}

#[derive(Deserialize)]
struct CondArgs {
    write: CondWriteArgs,
    read: String,
    #[serde(default)]
    remove: Option<String>,
}

#[derive(Deserialize)]
struct RemoteArgs {
    url: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Deserialize)]
struct SqliteIndexArgs {
    #[serde(default)]
    file: Option<String>,
}

#[derive(Deserialize)]
struct SearchArgs {
    index: String,
    owner: String,
}
