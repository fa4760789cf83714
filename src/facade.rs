//! Client facade (§4.9): registers/unregisters a peer's GATT service set
//! and owns the top-level [`Registry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use tokio::sync::Mutex;

use crate::{
    cache::{self, CacheStore},
    codec,
    discovery::{self, CharacteristicRegistrar},
    escalator::with_escalation,
    l2cap::{SecurityLevel, SeqPacket},
    model::{Characteristic, DiscoveryState, GattService, PeerKey, Primary},
    pipeline::Pipeline,
    transport::TransportHandle,
    Address, AddressType, Config, Error, ErrorKind, Result,
};

/// Delivers one characteristic's value change to one registered watcher
/// (§4.6/§4.7). The facade stays D-Bus-free; this is the seam an external
/// publisher uses to emit the change, mirroring
/// [`CharacteristicRegistrar`](crate::discovery::CharacteristicRegistrar).
pub trait WatcherDispatcher: Send + Sync {
    /// `characteristic_path` is the changed characteristic's own object
    /// path; `subscriber_id`/`subscriber_path` identify the watcher as
    /// registered via [`Facade::register_watcher`].
    fn dispatch(&self, subscriber_id: &str, subscriber_path: &str, characteristic_path: &str, value: &[u8]);
}

/// A connected peer's live state. `service` is behind its own lock so a
/// long-running discovery on one peer never blocks operations on another
/// (§5: independent transports run concurrently). `notify_started` guards
/// the one value-change-dispatch task spawned per peer, lazily, on the
/// first `register_watcher` call.
struct Entry {
    service: Arc<Mutex<GattService>>,
    pipeline: Pipeline,
    transport: TransportHandle,
    notify_started: Arc<AtomicBool>,
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            pipeline: self.pipeline.clone(),
            transport: self.transport.clone(),
            notify_started: self.notify_started.clone(),
        }
    }
}

/// Top-level lifecycle manager. One `Facade` per adapter; holds every
/// connected peer's [`GattService`] in an explicit registry (§9's "Global
/// service list" replacement), never a process-wide list.
pub struct Facade {
    config: Config,
    cache: Arc<dyn CacheStore>,
    registry: Mutex<HashMap<PeerKey, Entry>>,
    dispatcher: OnceLock<Arc<dyn WatcherDispatcher>>,
}

impl Facade {
    /// Creates a facade with the given configuration and cache backend.
    pub fn new(config: Config, cache: Arc<dyn CacheStore>) -> Self {
        Self { config, cache, registry: Mutex::new(HashMap::new()), dispatcher: OnceLock::new() }
    }

    /// Attaches the external watcher dispatcher (normally called once, right
    /// after the D-Bus session that owns it is constructed — see
    /// [`crate::session::Session`]). A no-op if already set.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn WatcherDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    async fn lookup(&self, key: PeerKey) -> Result<Entry> {
        self.registry.lock().await.get(&key).cloned().ok_or_else(|| Error::new(ErrorKind::InvalidArgs))
    }

    /// Registers a newly-connected peer. `primaries` is the caller-supplied
    /// list of already-discovered primary services (`(start, end, uuid)`);
    /// characteristics within them are populated from cache (if present) or
    /// left empty pending `DiscoverCharacteristics`.
    ///
    /// Fails with [`ErrorKind::InvalidArgs`] if the peer is already
    /// registered — replacing the existing entry would leak its transport
    /// reference and published objects (§4.9).
    pub async fn register(
        &self, local_addr: Address, peer_addr: Address, addr_type: AddressType, psm: Option<u16>,
        pre_opened: Option<SeqPacket>, primaries: Vec<(u16, u16, String)>,
    ) -> Result<Vec<(u16, String)>> {
        let key: PeerKey = (local_addr, peer_addr);
        let mut registry = self.registry.lock().await;
        if registry.contains_key(&key) {
            return Err(Error::with_message(ErrorKind::InvalidArgs, "peer already registered"));
        }

        let transport = match pre_opened {
            Some(socket) => TransportHandle::from_socket(socket, peer_addr),
            None => TransportHandle::connect(peer_addr, addr_type, psm, self.config.initial_security).await?,
        };
        let pipeline = Pipeline::spawn(transport.clone());

        let mut service = GattService::new(local_addr, peer_addr, psm);
        let mut paths = Vec::new();
        for (start, end, uuid) in primaries {
            let mut primary = Primary::new(start, end, uuid);
            if let Some(cached) = self.cache.read_device_characteristics(local_addr, peer_addr, start).await? {
                if let Ok(chars) = cache::parse_characteristics(&cached) {
                    for c in chars {
                        primary.characteristics.push(Characteristic {
                            value_handle: c.value_handle,
                            end_handle: c.end_handle,
                            properties: c.properties,
                            uuid: c.uuid,
                            value: None,
                            descriptors: Default::default(),
                        });
                    }
                }
                // A malformed cache entry is treated as absent (§4.8); the
                // Primary simply starts empty and discovery runs fresh.
            }
            let path_prefix = format!("/service{start:04x}");
            primary.path_prefix = path_prefix.clone();
            paths.push((start, path_prefix));
            service.primaries.push(primary);
        }

        registry.insert(
            key,
            Entry { service: Arc::new(Mutex::new(service)), pipeline, transport, notify_started: Arc::new(AtomicBool::new(false)) },
        );
        Ok(paths)
    }

    /// Unregisters a peer, releasing its transport and dropping its entry
    /// from the registry. Unpublishing objects is the caller's
    /// responsibility (the facade itself is D-Bus-free).
    pub async fn unregister(&self, local_addr: Address, peer_addr: Address) -> Result<()> {
        let key: PeerKey = (local_addr, peer_addr);
        self.registry.lock().await.remove(&key).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
        Ok(())
    }

    /// Cancels outstanding discoveries and releases the transport reference
    /// held by current operations, without destroying published objects
    /// (§4.9).
    pub async fn disconnect(&self, local_addr: Address, peer_addr: Address) -> Result<()> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let mut service = entry.service.lock().await;
        for primary in &mut service.primaries {
            primary.discovery.state = DiscoveryState::Failed;
            if let Some(reply) = primary.discovery.reply.take() {
                let _ = reply.send(Err(Error::with_message(ErrorKind::TransportFailure("disconnected".into()), "")));
            }
        }
        Ok(())
    }

    /// Runs `discover_characteristics` (§4.5) for one Primary, identified by
    /// its start handle.
    pub async fn discover_characteristics(
        &self, local_addr: Address, peer_addr: Address, start_handle: u16, path_prefix: &str,
        registrar: Option<&dyn CharacteristicRegistrar>,
    ) -> Result<Vec<String>> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let mut service = entry.service.lock().await;
        let primary = service.primary_mut(start_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
        discovery::discover_characteristics(
            primary,
            path_prefix,
            &entry.pipeline,
            &entry.transport,
            &self.config,
            self.cache.clone(),
            local_addr,
            peer_addr,
            registrar,
        )
        .await
    }

    /// Read Value (§4.6): reads `value_handle` and updates the cached
    /// value on success.
    pub async fn read_value(&self, local_addr: Address, peer_addr: Address, start_handle: u16, value_handle: u16) -> Result<Vec<u8>> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let value = with_escalation(&entry.transport, self.config.escalated_security, || async {
            let pdu = entry.pipeline.request(codec::encode_read_req(value_handle), codec::OP_READ_RSP).await?;
            Ok(codec::decode_read_rsp(&pdu)?.to_vec())
        })
        .await
        .map_err(|err| Error::with_message(err.kind, "update characteristic value failed"))?;

        let mut service = entry.service.lock().await;
        if let Some((primary, idx)) = service.find_characteristic_mut(value_handle) {
            primary.characteristics[idx].value = Some(value.clone());
        }
        Ok(value)
    }

    /// Write Value (§4.6): writes `value_handle` and updates the cached
    /// value on success. No long-write fallback — oversized payloads are
    /// the caller's responsibility.
    pub async fn write_value(
        &self, local_addr: Address, peer_addr: Address, start_handle: u16, value_handle: u16, value: Vec<u8>,
    ) -> Result<()> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        with_escalation(&entry.transport, self.config.escalated_security, || async {
            let pdu = entry.pipeline.request(codec::encode_write_req(value_handle, &value), codec::OP_WRITE_RSP).await?;
            codec::decode_write_rsp(&pdu)
        })
        .await
        .map_err(|_| Error::with_message(ErrorKind::InvalidArgs, "invalid arguments"))?;

        let mut service = entry.service.lock().await;
        if let Some((primary, idx)) = service.find_characteristic_mut(value_handle) {
            primary.characteristics[idx].value = Some(value);
        }
        Ok(())
    }

    /// Write Client Configuration (§4.6): as [`Facade::write_value`] but
    /// targets a characteristic's `client_config_handle`.
    pub async fn write_client_config(
        &self, local_addr: Address, peer_addr: Address, start_handle: u16, value_handle: u16, config_value: u16,
    ) -> Result<()> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let config_handle = {
            let service = entry.service.lock().await;
            let primary = service.primaries.iter().find(|p| p.start_handle == start_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
            let c = primary.characteristic(value_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
            c.descriptors.client_config_handle.ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?
        };

        let bytes = config_value.to_le_bytes().to_vec();
        with_escalation(&entry.transport, self.config.escalated_security, || async {
            let pdu = entry.pipeline.request(codec::encode_write_req(config_handle, &bytes), codec::OP_WRITE_RSP).await?;
            codec::decode_write_rsp(&pdu)
        })
        .await
        .map_err(|_| Error::with_message(ErrorKind::InvalidArgs, "invalid arguments"))?;

        let mut service = entry.service.lock().await;
        if let Some((primary, idx)) = service.find_characteristic_mut(value_handle) {
            primary.characteristics[idx].descriptors.client_config = Some(config_value);
        }
        Ok(())
    }

    /// Forces a fresh read of `value_handle`, discarding the cached value
    /// (the `UpdateValue` D-Bus method, §6).
    pub async fn update_value(&self, local_addr: Address, peer_addr: Address, start_handle: u16, value_handle: u16) -> Result<Vec<u8>> {
        self.read_value(local_addr, peer_addr, start_handle, value_handle).await
    }

    /// Registers a watcher on a Primary's value-change stream (§4.6/§4.7).
    ///
    /// On this peer's first watcher (of any Primary), lazily spawns the
    /// value-change dispatch task: it consumes the pipeline's notification/
    /// indication stream, updates the matching `Characteristic.value`, and
    /// fans the change out to every watcher registered on the owning
    /// Primary via the attached [`WatcherDispatcher`]. The task holds its
    /// own clone of the transport reference for as long as this peer stays
    /// registered, satisfying §5/§8's "listen mode holds a transport
    /// reference for the watcher's lifetime" invariant; it is not torn down
    /// when the last watcher unregisters; simpler to run for the peer's
    /// whole lifetime than to track a second refcount, and harmless since it
    /// simply has nothing to dispatch to in that state.
    pub async fn register_watcher(
        &self, local_addr: Address, peer_addr: Address, start_handle: u16, subscriber_id: &str, subscriber_path: &str,
    ) -> Result<()> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        {
            let mut service = entry.service.lock().await;
            let primary = service.primary_mut(start_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
            primary.register_watcher(subscriber_id, subscriber_path);
        }

        if !entry.notify_started.swap(true, Ordering::SeqCst) {
            let mut notifications = entry.pipeline.register_notify_handler();
            let service = entry.service.clone();
            let transport = entry.transport.clone();
            let dispatcher = self.dispatcher.get().cloned();
            tokio::spawn(async move {
                let _transport = transport;
                while let Some(event) = notifications.next().await {
                    let mut locked = service.lock().await;
                    let Some((primary, idx)) = locked.find_characteristic_mut(event.handle) else {
                        continue;
                    };
                    primary.characteristics[idx].value = Some(event.value.clone());
                    let characteristic_path = format!("{}/char{:04x}", primary.path_prefix, event.handle);
                    let watchers = primary.watchers.clone();
                    drop(locked);

                    if let Some(dispatcher) = &dispatcher {
                        for watcher in &watchers {
                            dispatcher.dispatch(&watcher.subscriber_id, &watcher.subscriber_path, &characteristic_path, &event.value);
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Unregisters a previously-registered watcher.
    pub async fn unregister_watcher(
        &self, local_addr: Address, peer_addr: Address, start_handle: u16, subscriber_id: &str, subscriber_path: &str,
    ) -> Result<()> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let mut service = entry.service.lock().await;
        let primary = service.primary_mut(start_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
        primary.unregister_watcher(subscriber_id, subscriber_path)
    }

    /// Current escalated security level configured for this facade's
    /// transports.
    pub fn escalated_security(&self) -> SecurityLevel {
        self.config.escalated_security
    }

    /// Snapshot of a service's properties (§6's per-service `GetProperties`).
    pub async fn service_properties(&self, local_addr: Address, peer_addr: Address, start_handle: u16) -> Result<ServiceProperties> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let service = entry.service.lock().await;
        let primary = service.primary(start_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
        Ok(ServiceProperties {
            uuid: primary.uuid.clone(),
            characteristic_value_handles: primary.characteristics.iter().map(|c| c.value_handle).collect(),
        })
    }

    /// Snapshot of a characteristic's properties (§6's per-characteristic
    /// `GetProperties`).
    pub async fn characteristic_properties(
        &self, local_addr: Address, peer_addr: Address, start_handle: u16, value_handle: u16,
    ) -> Result<CharacteristicProperties> {
        let entry = self.lookup((local_addr, peer_addr)).await?;
        let service = entry.service.lock().await;
        let primary = service.primary(start_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
        let c = primary.characteristic(value_handle).ok_or_else(|| Error::new(ErrorKind::InvalidArgs))?;
        Ok(CharacteristicProperties {
            uuid: c.uuid.clone(),
            properties: c.properties,
            user_description: c.descriptors.user_description.clone(),
            client_config: c.descriptors.client_config,
            value: c.value.clone(),
        })
    }
}

/// Snapshot returned by [`Facade::service_properties`].
#[derive(Debug, Clone)]
pub struct ServiceProperties {
    /// Service UUID.
    pub uuid: String,
    /// Value handles of its characteristics, in discovery order.
    pub characteristic_value_handles: Vec<u16>,
}

/// Snapshot returned by [`Facade::characteristic_properties`].
#[derive(Debug, Clone)]
pub struct CharacteristicProperties {
    /// Characteristic UUID.
    pub uuid: String,
    /// ATT characteristic properties bitfield.
    pub properties: u8,
    /// `0x2901` User Description, if read during discovery.
    pub user_description: Option<String>,
    /// Cached Client Characteristic Configuration value, if any.
    pub client_config: Option<u16>,
    /// Last-observed value.
    pub value: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::MemoryCacheStore;

    use super::*;

    fn facade() -> Facade {
        Facade::new(Config::default(), Arc::new(MemoryCacheStore::default()))
    }

    fn addrs() -> (Address, Address) {
        (Address::new([1, 2, 3, 4, 5, 6]), Address::new([6, 5, 4, 3, 2, 1]))
    }

    #[tokio::test]
    async fn operations_on_an_unregistered_peer_fail_with_invalid_args() {
        let facade = facade();
        let (local, peer) = addrs();

        assert_eq!(facade.unregister(local, peer).await.unwrap_err().kind, ErrorKind::InvalidArgs);
        assert_eq!(facade.disconnect(local, peer).await.unwrap_err().kind, ErrorKind::InvalidArgs);
        assert_eq!(facade.read_value(local, peer, 0x10, 0x12).await.unwrap_err().kind, ErrorKind::InvalidArgs);
        assert_eq!(facade.write_value(local, peer, 0x10, 0x12, vec![1]).await.unwrap_err().kind, ErrorKind::InvalidArgs);
        assert_eq!(facade.service_properties(local, peer, 0x10).await.unwrap_err().kind, ErrorKind::InvalidArgs);
        assert_eq!(
            facade.characteristic_properties(local, peer, 0x10, 0x12).await.unwrap_err().kind,
            ErrorKind::InvalidArgs
        );
        assert_eq!(
            facade.register_watcher(local, peer, 0x10, "sub", "/path").await.unwrap_err().kind,
            ErrorKind::InvalidArgs
        );
    }

    #[tokio::test]
    async fn escalated_security_reflects_configured_value() {
        let mut config = Config::default();
        config.escalated_security = SecurityLevel::High;
        let facade = Facade::new(config, Arc::new(MemoryCacheStore::default()));
        assert_eq!(facade.escalated_security(), SecurityLevel::High);
    }
}
