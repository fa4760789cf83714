//! Publishes discovered GATT services and characteristics as D-Bus objects
//! (§6). Method bodies are thin translators: they decode D-Bus argument
//! types and call straight into [`Facade`] — no protocol logic lives here.

use std::sync::{Arc, Weak};

use dbus::{
    arg::{PropMap, RefArg, Variant},
    channel::Sender,
    message::SignalArgs,
    nonblock::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged,
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};

use crate::{
    discovery::CharacteristicRegistrar, facade::WatcherDispatcher, method_call, model::Characteristic, session::SessionInner,
    Address, DbusResult, Error,
};

pub(crate) const SERVICE_INTERFACE: &str = "org.gatt_client.Service1";
pub(crate) const CHARACTERISTIC_INTERFACE: &str = "org.gatt_client.Characteristic1";

fn invalid_arg(name: &str) -> MethodErr {
    MethodErr::invalid_arg(name)
}

/// Published object for one Primary service.
pub(crate) struct ServiceObject {
    session: Weak<SessionInner>,
    local_addr: Address,
    peer_addr: Address,
    start_handle: u16,
    path: Path<'static>,
}

impl ServiceObject {
    pub(crate) fn new(session: Weak<SessionInner>, local_addr: Address, peer_addr: Address, start_handle: u16, path: Path<'static>) -> Self {
        Self { session, local_addr, peer_addr, start_handle, path }
    }

    fn session(&self) -> DbusResult<Arc<SessionInner>> {
        self.session.upgrade().ok_or_else(|| MethodErr::failed("session gone"))
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(SERVICE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async("DiscoverCharacteristics", (), ("paths",), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    let registrar = Registrar {
                        session: reg.session.clone(),
                        local_addr: reg.local_addr,
                        peer_addr: reg.peer_addr,
                        start_handle: reg.start_handle,
                        service_path: reg.path.clone(),
                    };
                    let path_prefix = reg.path.to_string();
                    let paths = session
                        .facade
                        .discover_characteristics(reg.local_addr, reg.peer_addr, reg.start_handle, &path_prefix, Some(&registrar))
                        .await
                        .map_err(to_method_err)?;
                    Ok((paths,))
                })
            });
            ib.method_with_cr_async("RegisterCharacteristicsWatcher", ("path",), (), |ctx, cr, (path,): (String,)| {
                let sender = ctx.message().sender().map(|s| s.to_string()).unwrap_or_default();
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    session
                        .facade
                        .register_watcher(reg.local_addr, reg.peer_addr, reg.start_handle, &sender, &path)
                        .await
                        .map_err(to_method_err)?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("UnregisterCharacteristicsWatcher", ("path",), (), |ctx, cr, (path,): (String,)| {
                let sender = ctx.message().sender().map(|s| s.to_string()).unwrap_or_default();
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    session
                        .facade
                        .unregister_watcher(reg.local_addr, reg.peer_addr, reg.start_handle, &sender, &path)
                        .await
                        .map_err(to_method_err)?;
                    Ok(())
                })
            });
            ib.method_with_cr_async("GetProperties", (), ("properties",), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    let props = session.facade.service_properties(reg.local_addr, reg.peer_addr, reg.start_handle).await.map_err(to_method_err)?;
                    let mut map = PropMap::new();
                    map.insert("UUID".to_string(), Variant(Box::new(props.uuid) as Box<dyn RefArg>));
                    let paths: Vec<String> = props
                        .characteristic_value_handles
                        .iter()
                        .map(|h| format!("{}/char{:04x}", reg.path, h))
                        .collect();
                    map.insert("Characteristics".to_string(), Variant(Box::new(paths) as Box<dyn RefArg>));
                    Ok((map,))
                })
            });
            ib.method_with_cr_async("Disconnect", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    session.facade.disconnect(reg.local_addr, reg.peer_addr).await.map_err(to_method_err)?;
                    Ok(())
                })
            });
        })
    }
}

/// Published object for one characteristic.
pub(crate) struct CharacteristicObject {
    session: Weak<SessionInner>,
    local_addr: Address,
    peer_addr: Address,
    start_handle: u16,
    value_handle: u16,
}

impl CharacteristicObject {
    pub(crate) fn for_session(session: Weak<SessionInner>, local_addr: Address, peer_addr: Address, start_handle: u16, value_handle: u16) -> Self {
        Self { session, local_addr, peer_addr, start_handle, value_handle }
    }

    fn session(&self) -> DbusResult<Arc<SessionInner>> {
        self.session.upgrade().ok_or_else(|| MethodErr::failed("session gone"))
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(CHARACTERISTIC_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async("GetProperties", (), ("properties",), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    let props = session
                        .facade
                        .characteristic_properties(reg.local_addr, reg.peer_addr, reg.start_handle, reg.value_handle)
                        .await
                        .map_err(to_method_err)?;
                    let mut map = PropMap::new();
                    map.insert("UUID".to_string(), Variant(Box::new(props.uuid) as Box<dyn RefArg>));
                    map.insert("Properties".to_string(), Variant(Box::new(props.properties as u32) as Box<dyn RefArg>));
                    if let Some(desc) = props.user_description {
                        map.insert("Description".to_string(), Variant(Box::new(desc) as Box<dyn RefArg>));
                    }
                    if let Some(cfg) = props.client_config {
                        map.insert("ClientConfiguration".to_string(), Variant(Box::new(cfg as u32) as Box<dyn RefArg>));
                    }
                    if let Some(value) = props.value {
                        map.insert("Value".to_string(), Variant(Box::new(value) as Box<dyn RefArg>));
                    }
                    Ok((map,))
                })
            });
            ib.method_with_cr_async("SetProperty", ("name", "value"), (), |ctx, cr, (name, value): (String, Variant<Box<dyn RefArg>>)| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    match name.as_str() {
                        "Value" => {
                            let bytes = dbus::arg::cast::<Vec<u8>>(&*value.0).ok_or_else(|| invalid_arg("value"))?.clone();
                            session
                                .facade
                                .write_value(reg.local_addr, reg.peer_addr, reg.start_handle, reg.value_handle, bytes)
                                .await
                                .map_err(to_method_err)
                        }
                        "ClientConfiguration" => {
                            let v = value.0.as_u64().ok_or_else(|| invalid_arg("value"))? as u16;
                            session
                                .facade
                                .write_client_config(reg.local_addr, reg.peer_addr, reg.start_handle, reg.value_handle, v)
                                .await
                                .map_err(to_method_err)
                        }
                        _ => Err(invalid_arg("name")),
                    }
                })
            });
            ib.method_with_cr_async("UpdateValue", (), ("value",), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let session = reg.session()?;
                    let value = session
                        .facade
                        .update_value(reg.local_addr, reg.peer_addr, reg.start_handle, reg.value_handle)
                        .await
                        .map_err(to_method_err)?;
                    Ok((value,))
                })
            });
        })
    }
}

fn to_method_err(err: Error) -> MethodErr {
    err.into()
}

/// Bridges [`discover_characteristics`](crate::discovery::discover_characteristics)
/// back into the D-Bus object tree: called once the characteristic list
/// (with provisional handles) is known, before descriptor/value reads
/// begin. Publishing happens on a detached task since the trait method
/// itself is synchronous and the Crossroads lock is async.
struct Registrar {
    session: Weak<SessionInner>,
    local_addr: Address,
    peer_addr: Address,
    start_handle: u16,
    service_path: Path<'static>,
}

impl CharacteristicRegistrar for Registrar {
    fn register_characteristics(&self, _start_handle: u16, characteristics: &[Characteristic]) {
        let Some(session) = self.session.upgrade() else { return };
        let local_addr = self.local_addr;
        let peer_addr = self.peer_addr;
        let start_handle = self.start_handle;
        let service_path = self.service_path.clone();
        let characteristics = characteristics.to_vec();
        tokio::spawn(async move {
            let mut crossroads = session.crossroads.lock().await;
            for c in &characteristics {
                let path: Path<'static> = Path::new(format!("{service_path}/char{:04x}", c.value_handle)).expect("valid path");
                let object = CharacteristicObject {
                    session: Arc::downgrade(&session),
                    local_addr,
                    peer_addr,
                    start_handle,
                    value_handle: c.value_handle,
                };
                crossroads.insert(path, &[session.characteristic_token], Arc::new(object));
            }
        });
    }
}

/// Emits the value change as a `PropertiesChanged` signal on the
/// characteristic's own object path (§4.6/§4.7). `subscriber_id`/
/// `subscriber_path` identify the watcher but aren't used to address the
/// signal — `PropertiesChanged` is a broadcast on the object path, the same
/// way property updates are delivered for any other D-Bus object; a GATT
/// watcher is really just a client that has called `AddMatch` on that path.
pub(crate) struct SignalDispatcher {
    session: Weak<SessionInner>,
}

impl SignalDispatcher {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self { session }
    }
}

impl WatcherDispatcher for SignalDispatcher {
    fn dispatch(&self, _subscriber_id: &str, _subscriber_path: &str, characteristic_path: &str, value: &[u8]) {
        let Some(session) = self.session.upgrade() else { return };
        let Ok(path) = Path::new(characteristic_path.to_string()) else {
            log::warn!("cannot emit change on malformed path {characteristic_path}");
            return;
        };

        let mut changed_properties = PropMap::new();
        changed_properties.insert("Value".to_string(), Variant(Box::new(value.to_vec()) as Box<dyn RefArg>));
        let signal = PropertiesPropertiesChanged {
            interface_name: CHARACTERISTIC_INTERFACE.to_string(),
            changed_properties,
            invalidated_properties: Vec::new(),
        };
        if session.connection.send(signal.to_emit_message(&path)).is_err() {
            log::warn!("failed to emit value change on {characteristic_path}");
        }
    }
}
