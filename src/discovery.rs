//! Drives characteristic and descriptor discovery for one Primary (§4.5).
//!
//! `discover_characteristics` is directly awaited by its caller (the facade
//! or a D-Bus method body) rather than running as a detached background
//! task: `Primary::discovery.state` still tracks progress so a concurrent
//! second call is rejected, but there is no separate driver task to hand a
//! cancellation request to — `disconnect()` cancels by dropping this
//! future, which the watchdog's `tokio::select!` makes safe (every held
//! `TransportHandle` clone drops with it, releasing the reference).

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};

use crate::{
    cache::{self, CacheStore},
    codec,
    escalator::with_escalation,
    l2cap::SecurityLevel,
    model::{Characteristic, CharacteristicDescriptors, DiscoveryState, Primary, PresentationFormat},
    pipeline::Pipeline,
    transport::TransportHandle,
    Address, Config, Error, ErrorKind, Result,
};

const UUID_CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x2902;
const UUID_CHARACTERISTIC_USER_DESCRIPTION: u16 = 0x2901;
const UUID_CHARACTERISTIC_PRESENTATION_FORMAT: u16 = 0x2904;

/// Registers newly-discovered characteristics with the external object
/// publisher (§4.5 step 4, §6). The discovery engine itself never touches
/// D-Bus; this trait is the seam.
pub trait CharacteristicRegistrar: Send + Sync {
    /// Called once per `discover_characteristics` run, after the
    /// characteristic list (with provisional `end_handle`s) is known and
    /// persisted to cache, before per-characteristic descriptor/value
    /// reads begin.
    fn register_characteristics(&self, start_handle: u16, characteristics: &[Characteristic]);
}

enum Update {
    Value { char_idx: usize, value: Vec<u8> },
    ClientConfigHandle { char_idx: usize, handle: u16 },
    ClientConfigValue { char_idx: usize, value: u16 },
    UserDescription { char_idx: usize, text: String },
    PresentationFormat { char_idx: usize, format: PresentationFormat },
}

/// Runs *Discover All Characteristics of a Service* followed by
/// per-characteristic descriptor enumeration and value priming, for one
/// Primary. Returns the object paths of every characteristic once
/// discovery completes (or has already completed, in which case the
/// existing set is returned with no new ATT traffic — see §8's
/// idempotence property).
#[allow(clippy::too_many_arguments)]
pub async fn discover_characteristics(
    primary: &mut Primary, path_prefix: &str, pipeline: &Pipeline, transport: &TransportHandle, config: &Config,
    cache: std::sync::Arc<dyn CacheStore>, local_addr: Address, peer_addr: Address,
    registrar: Option<&dyn CharacteristicRegistrar>,
) -> Result<Vec<String>> {
    match &primary.discovery.state {
        DiscoveryState::Idle | DiscoveryState::Done | DiscoveryState::Failed => {}
        DiscoveryState::CharsPending | DiscoveryState::DescriptorsPending { .. } => {
            return Err(Error::new(ErrorKind::DiscoveryInProgress));
        }
    }

    primary.path_prefix = path_prefix.to_string();

    if !primary.characteristics.is_empty() {
        // Idempotent re-run: already populated, nothing to do (§8).
        return Ok(characteristic_paths(primary, path_prefix));
    }

    primary.discovery.state = DiscoveryState::CharsPending;

    let declarations = match with_escalation(transport, config.escalated_security, || async {
        let pdu = pipeline
            .request(
                codec::encode_read_by_type_req(primary.start_handle, primary.end_handle, codec::CHARACTERISTIC_DECLARATION_UUID),
                codec::OP_READ_BY_TYPE_RSP,
            )
            .await?;
        codec::decode_characteristic_declarations(&pdu)
    })
    .await
    {
        Ok(decls) => decls,
        Err(err) => {
            primary.discovery.state = DiscoveryState::Failed;
            return Err(err);
        }
    };

    if declarations.is_empty() {
        primary.discovery.state = DiscoveryState::Done;
        return Ok(Vec::new());
    }

    for decl in &declarations {
        primary.characteristics.push(Characteristic {
            value_handle: decl.value_handle,
            end_handle: primary.end_handle,
            properties: decl.properties,
            uuid: decl.uuid.clone(),
            value: None,
            descriptors: CharacteristicDescriptors::default(),
        });
        let n = primary.characteristics.len();
        if n >= 2 {
            primary.characteristics[n - 2].end_handle = decl.declaration_handle - 1;
        }
    }

    cache
        .write_device_characteristics(local_addr, peer_addr, primary.start_handle, cache::serialize_characteristics(&primary.characteristics))
        .await?;

    if let Some(registrar) = registrar {
        registrar.register_characteristics(primary.start_handle, &primary.characteristics);
    }

    let mut units: FuturesUnordered<BoxFuture<'static, Vec<Update>>> = FuturesUnordered::new();
    let mut n_outstanding = 0usize;
    for (idx, c) in primary.characteristics.iter().enumerate() {
        units.push(read_value_unit(pipeline.clone(), transport.clone(), config.escalated_security, idx, c.value_handle).boxed());
        n_outstanding += 1;
        if c.has_descriptor_range() {
            units.push(
                descriptor_unit(
                    pipeline.clone(),
                    transport.clone(),
                    config.escalated_security,
                    idx,
                    c.value_handle + 1,
                    c.end_handle,
                    cache.clone(),
                    local_addr,
                    peer_addr,
                )
                .boxed(),
            );
            n_outstanding += 1;
        }
    }
    primary.discovery.state = DiscoveryState::DescriptorsPending { n_outstanding };

    let mut deadline = Box::pin(tokio::time::sleep(config.gatt_timeout));
    loop {
        if n_outstanding == 0 {
            break;
        }
        tokio::select! {
            biased;
            next = units.next() => {
                let Some(updates) = next else { break };
                apply_updates(primary, updates);
                n_outstanding -= 1;
                primary.discovery.state = DiscoveryState::DescriptorsPending { n_outstanding };
                deadline.as_mut().reset(tokio::time::Instant::now() + config.gatt_timeout);
            }
            _ = &mut deadline => {
                primary.discovery.state = DiscoveryState::Failed;
                return Err(Error::new(ErrorKind::DiscoveryTimeout));
            }
        }
    }

    primary.discovery.state = DiscoveryState::Done;
    Ok(characteristic_paths(primary, path_prefix))
}

fn characteristic_paths(primary: &Primary, path_prefix: &str) -> Vec<String> {
    primary.characteristics.iter().map(|c| format!("{path_prefix}/char{:04x}", c.value_handle)).collect()
}

fn apply_updates(primary: &mut Primary, updates: Vec<Update>) {
    for update in updates {
        match update {
            Update::Value { char_idx, value } => {
                if let Some(c) = primary.characteristics.get_mut(char_idx) {
                    c.value = Some(value);
                }
            }
            Update::ClientConfigHandle { char_idx, handle } => {
                if let Some(c) = primary.characteristics.get_mut(char_idx) {
                    c.descriptors.client_config_handle = Some(handle);
                }
            }
            Update::ClientConfigValue { char_idx, value } => {
                if let Some(c) = primary.characteristics.get_mut(char_idx) {
                    c.descriptors.client_config = Some(value);
                }
            }
            Update::UserDescription { char_idx, text } => {
                if let Some(c) = primary.characteristics.get_mut(char_idx) {
                    c.descriptors.user_description = Some(text);
                }
            }
            Update::PresentationFormat { char_idx, format } => {
                if let Some(c) = primary.characteristics.get_mut(char_idx) {
                    c.descriptors.presentation_format = Some(format);
                }
            }
        }
    }
}

async fn read_value_unit(
    pipeline: Pipeline, transport: TransportHandle, escalated: SecurityLevel, char_idx: usize, value_handle: u16,
) -> Vec<Update> {
    let result = with_escalation(&transport, escalated, || async {
        let pdu = pipeline.request(codec::encode_read_req(value_handle), codec::OP_READ_RSP).await?;
        Ok::<_, Error>(codec::decode_read_rsp(&pdu)?.to_vec())
    })
    .await;
    match result {
        Ok(value) => vec![Update::Value { char_idx, value }],
        Err(err) => {
            log::warn!("reading value handle {value_handle:#06x} failed: {err}");
            Vec::new()
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn descriptor_unit(
    pipeline: Pipeline, transport: TransportHandle, escalated: SecurityLevel, char_idx: usize, start_handle: u16,
    end_handle: u16, cache: std::sync::Arc<dyn CacheStore>, local_addr: Address, peer_addr: Address,
) -> Vec<Update> {
    let entries = match with_escalation(&transport, escalated, || async {
        let pdu = pipeline.request(codec::encode_find_information_req(start_handle, end_handle), codec::OP_FIND_INFORMATION_RSP).await?;
        codec::decode_find_information_rsp(&pdu)
    })
    .await
    {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("find information over ({start_handle:#06x}, {end_handle:#06x}) failed: {err}");
            return Vec::new();
        }
    };

    let mut updates = Vec::new();
    for entry in entries {
        match entry.uuid {
            UUID_CLIENT_CHARACTERISTIC_CONFIGURATION => {
                updates.push(Update::ClientConfigHandle { char_idx, handle: entry.handle });
                match read_descriptor(&pipeline, &transport, escalated, entry.handle).await {
                    Ok(value) if value.len() >= 2 => {
                        store_attribute(cache.as_ref(), local_addr, peer_addr, entry.uuid, entry.handle, &value).await;
                        updates.push(Update::ClientConfigValue { char_idx, value: u16::from_le_bytes([value[0], value[1]]) });
                    }
                    Ok(_) => log::warn!("client configuration at {:#06x} shorter than 2 bytes", entry.handle),
                    Err(err) => log::warn!("reading client configuration at {:#06x} failed: {err}", entry.handle),
                }
            }
            UUID_CHARACTERISTIC_USER_DESCRIPTION => match read_descriptor(&pipeline, &transport, escalated, entry.handle).await {
                Ok(value) => {
                    store_attribute(cache.as_ref(), local_addr, peer_addr, entry.uuid, entry.handle, &value).await;
                    updates.push(Update::UserDescription { char_idx, text: String::from_utf8_lossy(&value).into_owned() });
                }
                Err(err) => log::warn!("reading user description at {:#06x} failed: {err}", entry.handle),
            },
            UUID_CHARACTERISTIC_PRESENTATION_FORMAT => match read_descriptor(&pipeline, &transport, escalated, entry.handle).await {
                Ok(value) if value.len() >= 7 => {
                    store_attribute(cache.as_ref(), local_addr, peer_addr, entry.uuid, entry.handle, &value).await;
                    let mut buf = [0u8; 7];
                    buf.copy_from_slice(&value[..7]);
                    updates.push(Update::PresentationFormat { char_idx, format: PresentationFormat::from_bytes(&buf) });
                }
                Ok(_) => log::warn!("presentation format at {:#06x} shorter than 7 bytes", entry.handle),
                Err(err) => log::warn!("reading presentation format at {:#06x} failed: {err}", entry.handle),
            },
            _ => {}
        }
    }
    updates
}

/// Persists one descriptor's raw value under its handle (§4.8: "Stored
/// attributes... are written per-characteristic under the descriptor handle
/// as `<uuid-string>#<hex-bytes>`"). Best-effort: a write failure is logged,
/// not propagated — the in-memory `Update` already applied is what matters
/// for this connection's lifetime.
async fn store_attribute(store: &dyn CacheStore, local_addr: Address, peer_addr: Address, uuid: u16, handle: u16, value: &[u8]) {
    let payload = cache::serialize_attribute(&format!("{uuid:04X}"), value);
    if let Err(err) = store.write_device_attribute(local_addr, peer_addr, handle, payload).await {
        log::warn!("caching attribute at {handle:#06x} failed: {err}");
    }
}

async fn read_descriptor(
    pipeline: &Pipeline, transport: &TransportHandle, escalated: SecurityLevel, handle: u16,
) -> Result<Vec<u8>> {
    with_escalation(transport, escalated, || async {
        let pdu = pipeline.request(codec::encode_read_req(handle), codec::OP_READ_RSP).await?;
        Ok(codec::decode_read_rsp(&pdu)?.to_vec())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_paths_use_lowercase_hex_value_handle() {
        let mut primary = Primary::new(0x0010, 0x0015, "1800");
        primary.characteristics.push(Characteristic {
            value_handle: 0x0012,
            end_handle: 0x0015,
            properties: 0x0A,
            uuid: "2A00".into(),
            value: None,
            descriptors: CharacteristicDescriptors::default(),
        });
        assert_eq!(characteristic_paths(&primary, "/service0"), vec!["/service0/char0012"]);
    }
}
