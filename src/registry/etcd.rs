// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Distributed registry store.
//!
//! Keeps the registry as one JSON value under a well-known etcd key, so that
//! several kable instances can share it. The store talks to etcd through its
//! v3 JSON gateway (`/v3/kv/range`, `/v3/kv/put`, `/v3/kv/txn`) with a bounded
//! timeout per call. The key's `mod_revision` serves as the registry
//! [`Revision`], and conditional writes are etcd transactions that compare it.

use crate::registry::{
    store::{RegistryStore, Revision, Snapshot, StoreError},
    RepoRegistry,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{de::IgnoredAny, Deserialize, Deserializer};
use serde_json::json;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io::ErrorKind,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// One key-value pair held by the backend.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// Minimal key-value operations the distributed store needs.
pub trait KvBackend: Send + Sync {
    /// Fetch every value stored under key.
    fn range(&self, key: &[u8]) -> Result<Vec<KeyValue>>;

    /// Store value under key unconditionally.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Store value under key only if its modification revision still equals
    /// `expected`. A revision of zero means the key must not exist yet.
    ///
    /// Returns whether the value was stored.
    fn put_if_revision(&self, key: &[u8], value: &[u8], expected: u64) -> Result<bool>;
}

/// Client of etcd's v3 JSON gateway.
///
/// Endpoints are tried in order. An endpoint that cannot be reached hands
/// the call over to the next one.
#[derive(Clone)]
pub struct EtcdGateway {
    endpoints: Vec<String>,
    agent: ureq::Agent,
}

impl EtcdGateway {
    /// Construct new gateway client with per-call timeout.
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { endpoints, agent }
    }

    fn post<T>(&self, path: &str, body: serde_json::Value) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut last = StoreError::NoEndpoints;

        for endpoint in &self.endpoints {
            let url = format!("{}{path}", endpoint.trim_end_matches('/'));
            match self.agent.post(&url).send_json(&body) {
                Ok(response) => {
                    return response.into_json::<T>().map_err(|err| {
                        if is_timeout(&err) {
                            StoreError::Timeout {
                                endpoint: endpoint.clone(),
                            }
                        } else {
                            StoreError::Response {
                                endpoint: endpoint.clone(),
                                reason: err.to_string(),
                            }
                        }
                    });
                }
                Err(ureq::Error::Transport(transport)) => {
                    let err = transport_error(endpoint, transport);
                    warn!("etcd endpoint {endpoint} failed: {err}");
                    last = err;
                }
                Err(err) => {
                    return Err(StoreError::Http {
                        endpoint: endpoint.clone(),
                        source: Box::new(err),
                    });
                }
            }
        }

        Err(last)
    }
}

impl Debug for EtcdGateway {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("EtcdGateway")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl KvBackend for EtcdGateway {
    #[instrument(skip(self, key), level = "debug")]
    fn range(&self, key: &[u8]) -> Result<Vec<KeyValue>> {
        let response: RangeResponse =
            self.post("/v3/kv/range", json!({ "key": BASE64.encode(key) }))?;
        response
            .kvs
            .into_iter()
            .map(WireKeyValue::decode)
            .collect()
    }

    #[instrument(skip(self, key, value), level = "debug")]
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _: IgnoredAny = self.post(
            "/v3/kv/put",
            json!({ "key": BASE64.encode(key), "value": BASE64.encode(value) }),
        )?;
        Ok(())
    }

    #[instrument(skip(self, key, value), level = "debug")]
    fn put_if_revision(&self, key: &[u8], value: &[u8], expected: u64) -> Result<bool> {
        let key = BASE64.encode(key);
        let response: TxnResponse = self.post(
            "/v3/kv/txn",
            json!({
                "compare": [{
                    "key": key,
                    "result": "EQUAL",
                    "target": "MOD",
                    "mod_revision": expected.to_string(),
                }],
                "success": [{
                    "request_put": { "key": key, "value": BASE64.encode(value) }
                }],
            }),
        )?;
        Ok(response.succeeded)
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn transport_error(endpoint: &str, transport: ureq::Transport) -> StoreError {
    let timed_out = std::error::Error::source(&transport)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(is_timeout);

    if timed_out {
        StoreError::Timeout {
            endpoint: endpoint.to_string(),
        }
    } else {
        StoreError::Http {
            endpoint: endpoint.to_string(),
            source: Box::new(ureq::Error::Transport(transport)),
        }
    }
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<WireKeyValue>,
}

#[derive(Deserialize)]
struct WireKeyValue {
    #[serde(default)]
    key: String,

    #[serde(default)]
    value: String,

    #[serde(default, deserialize_with = "int64")]
    mod_revision: u64,
}

impl WireKeyValue {
    fn decode(self) -> Result<KeyValue> {
        let decode = |data: &str| {
            BASE64.decode(data).map_err(|err| StoreError::Response {
                endpoint: "etcd".into(),
                reason: err.to_string(),
            })
        };

        Ok(KeyValue {
            key: decode(&self.key)?,
            value: decode(&self.value)?,
            mod_revision: self.mod_revision,
        })
    }
}

#[derive(Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}

// The gateway encodes int64 fields as JSON strings.
fn int64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Text(String),
        Number(u64),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Text(text) => text.parse().map_err(serde::de::Error::custom),
        Int64::Number(number) => Ok(number),
    }
}

/// Registry stored under one key of a key-value backend.
#[derive(Debug, Clone)]
pub struct EtcdStore<B = EtcdGateway>
where
    B: KvBackend,
{
    backend: B,
    key: String,
}

impl<B> EtcdStore<B>
where
    B: KvBackend,
{
    /// Construct new store keeping the registry under target key.
    pub fn new(backend: B, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    /// Key holding the registry document.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn fetch(&self) -> Result<Option<Snapshot>> {
        let mut kvs = self.backend.range(self.key.as_bytes())?;

        // INVARIANT: At most one registry lives under the registry key.
        if kvs.len() > 1 {
            return Err(StoreError::MultipleRegistriesInStore {
                key: self.key.clone(),
                count: kvs.len(),
            });
        }

        match kvs.pop() {
            Some(kv) => Ok(Some(Snapshot {
                registry: serde_json::from_slice(&kv.value)?,
                revision: Revision::new(kv.mod_revision),
            })),
            None => Ok(None),
        }
    }
}

impl<B> RegistryStore for EtcdStore<B>
where
    B: KvBackend,
{
    #[instrument(skip(self), level = "debug")]
    fn read_registry(&self) -> Result<Snapshot> {
        if let Some(snapshot) = self.fetch()? {
            return Ok(snapshot);
        }

        info!("initialize empty registry under key {:?}", self.key);
        let value = serde_json::to_vec(&RepoRegistry::default())?;
        if !self
            .backend
            .put_if_revision(self.key.as_bytes(), &value, Revision::ABSENT.get())?
        {
            debug!("another writer initialized registry first");
        }

        self.fetch()?.ok_or_else(|| StoreError::Response {
            endpoint: "etcd".into(),
            reason: format!("registry key {:?} vanished after initialization", self.key),
        })
    }

    #[instrument(skip(self, registry), level = "debug")]
    fn write_registry(&self, registry: &RepoRegistry) -> Result<()> {
        let value = serde_json::to_vec(registry)?;
        self.backend.put(self.key.as_bytes(), &value)?;
        debug!("wrote registry under key {:?}", self.key);
        Ok(())
    }

    #[instrument(skip(self, registry), level = "debug")]
    fn compare_and_write(&self, registry: &RepoRegistry, expected: Revision) -> Result<()> {
        let value = serde_json::to_vec(registry)?;
        if !self
            .backend
            .put_if_revision(self.key.as_bytes(), &value, expected.get())?
        {
            return Err(StoreError::StaleRegistry);
        }
        debug!("wrote registry under key {:?}", self.key);
        Ok(())
    }
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{add_repository, Repository};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::{
        collections::BTreeMap,
        io::{Read, Write},
        net::TcpListener,
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
        thread,
        time::Instant,
    };

    // In-memory backend with etcd's revision semantics.
    #[derive(Default)]
    struct MemoryKv {
        data: Mutex<BTreeMap<Vec<u8>, KeyValue>>,
        revision: AtomicU64,
        duplicate: bool,
    }

    impl KvBackend for MemoryKv {
        fn range(&self, key: &[u8]) -> Result<Vec<KeyValue>> {
            let data = self.data.lock().map_err(|_| StoreError::NoEndpoints)?;
            let found = data.get(key).cloned().into_iter();
            if self.duplicate {
                Ok(found.flat_map(|kv| [kv.clone(), kv]).collect())
            } else {
                Ok(found.collect())
            }
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            let mut data = self.data.lock().map_err(|_| StoreError::NoEndpoints)?;
            let mod_revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            data.insert(
                key.to_vec(),
                KeyValue {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    mod_revision,
                },
            );
            Ok(())
        }

        fn put_if_revision(&self, key: &[u8], value: &[u8], expected: u64) -> Result<bool> {
            let current = self
                .data
                .lock()
                .map_err(|_| StoreError::NoEndpoints)?
                .get(key)
                .map(|kv| kv.mod_revision)
                .unwrap_or(0);
            if current != expected {
                return Ok(false);
            }
            self.put(key, value)?;
            Ok(true)
        }
    }

    fn demo_registry() -> anyhow::Result<RepoRegistry> {
        Ok(add_repository(
            Repository::new("demo-https", "https://github.com/redradrat/demo-concepts.git"),
            false,
        )?(RepoRegistry::default())?)
    }

    #[test]
    fn etcd_store_bootstraps_empty_registry() -> anyhow::Result<()> {
        let store = EtcdStore::new(MemoryKv::default(), "/kable/registry");

        let snapshot = store.read_registry()?;
        assert_eq!(snapshot.registry, RepoRegistry::default());
        assert_eq!(snapshot.revision, Revision::new(1));

        Ok(())
    }

    #[test]
    fn etcd_store_round_trip() -> anyhow::Result<()> {
        let store = EtcdStore::new(MemoryKv::default(), "/kable/registry");
        let registry = demo_registry()?;

        store.write_registry(&registry)?;
        assert_eq!(store.read_registry()?.registry, registry);

        Ok(())
    }

    #[test]
    fn etcd_store_rejects_stale_revision() -> anyhow::Result<()> {
        let store = EtcdStore::new(MemoryKv::default(), "/kable/registry");
        let before = store.read_registry()?;

        store.write_registry(&demo_registry()?)?;
        let result = store.compare_and_write(&RepoRegistry::default(), before.revision);
        assert!(matches!(result, Err(StoreError::StaleRegistry)));

        let current = store.read_registry()?;
        store.compare_and_write(&RepoRegistry::default(), current.revision)?;
        assert_eq!(store.read_registry()?.registry, RepoRegistry::default());

        Ok(())
    }

    #[test]
    fn etcd_store_detects_multiple_registries() -> anyhow::Result<()> {
        let backend = MemoryKv {
            duplicate: true,
            ..Default::default()
        };
        backend.put(b"/kable/registry", b"{}")?;
        let store = EtcdStore::new(backend, "/kable/registry");

        let result = store.read_registry();
        assert!(matches!(
            result,
            Err(StoreError::MultipleRegistriesInStore { count: 2, .. })
        ));

        Ok(())
    }

    #[test]
    fn gateway_responses_decode_string_encoded_revisions() -> anyhow::Result<()> {
        let response: RangeResponse = serde_json::from_value(json!({
            "header": { "revision": "7" },
            "kvs": [{
                "key": BASE64.encode("/kable/registry"),
                "value": BASE64.encode("{}"),
                "mod_revision": "7",
            }],
            "count": "1",
        }))?;
        let kvs = response
            .kvs
            .into_iter()
            .map(WireKeyValue::decode)
            .collect::<Result<Vec<_>>>()?;

        let expect = vec![KeyValue {
            key: b"/kable/registry".to_vec(),
            value: b"{}".to_vec(),
            mod_revision: 7,
        }];
        assert_eq!(kvs, expect);

        let response: TxnResponse = serde_json::from_value(json!({ "header": {} }))?;
        assert!(!response.succeeded);

        Ok(())
    }

    // Accept one connection, write `reply`, then hold the connection open.
    fn stalling_endpoint(reply: &'static str) -> anyhow::Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(reply.as_bytes());
                thread::sleep(Duration::from_secs(5));
            }
        });
        Ok(endpoint)
    }

    #[test_case(""; "no reply")]
    #[test_case("HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n{\"kvs\": ["; "stalled body")]
    #[test]
    fn unresponsive_endpoint_times_out(reply: &'static str) -> anyhow::Result<()> {
        let endpoint = stalling_endpoint(reply)?;
        let gateway = EtcdGateway::new(vec![endpoint.clone()], Duration::from_millis(200));

        let start = Instant::now();
        let result = gateway.range(b"/kable/registry");
        assert!(matches!(result, Err(StoreError::Timeout { endpoint: found }) if found == endpoint));
        assert!(start.elapsed() < Duration::from_secs(3));

        Ok(())
    }

    #[test]
    fn gateway_without_endpoints_fails() {
        let gateway = EtcdGateway::new(Vec::new(), Duration::from_millis(100));
        assert!(matches!(
            gateway.range(b"/kable/registry"),
            Err(StoreError::NoEndpoints)
        ));
    }
}
