//! D-Bus session: owns the connection, the Crossroads object tree, and the
//! [`Facade`] that drives it.

use std::sync::Arc;

use dbus::{nonblock::SyncConnection, Path};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::{lock::Mutex, StreamExt};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::{
    cache::CacheStore,
    facade::Facade,
    l2cap::SeqPacket,
    publish::{CharacteristicObject, ServiceObject, SignalDispatcher},
    Address, AddressType, Config, Error, Result, SERVICE_PREFIX,
};

/// Shared state behind every published object's `Weak` reference.
pub(crate) struct SessionInner {
    pub(crate) connection: Arc<SyncConnection>,
    pub(crate) crossroads: Mutex<Crossroads>,
    pub(crate) service_token: IfaceToken<Arc<ServiceObject>>,
    pub(crate) characteristic_token: IfaceToken<Arc<CharacteristicObject>>,
    pub(crate) facade: Facade,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

/// A running GATT client session: a D-Bus connection plus the object tree
/// it publishes discovered services and characteristics under.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connects to the system D-Bus and sets up the object tree. No peers
    /// are registered yet; call [`Session::register_peer`] per connection.
    pub async fn new(config: Config, cache: Arc<dyn CacheStore>) -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("connected to D-Bus with unique name {}", connection.unique_name());

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((connection.clone(), Box::new(|x| {
            tokio::spawn(x);
        }))));
        crossroads.set_object_manager_support(Some(connection.clone()));

        let service_token = ServiceObject::register_interface(&mut crossroads);
        let characteristic_token = CharacteristicObject::register_interface(&mut crossroads);

        let inner = Arc::new(SessionInner {
            connection: connection.clone(),
            crossroads: Mutex::new(crossroads),
            service_token,
            characteristic_token,
            facade: Facade::new(config, cache),
            dbus_task,
        });
        inner.facade.set_dispatcher(Arc::new(SignalDispatcher::new(Arc::downgrade(&inner))));

        let mc_callback = connection.add_match(dbus::message::MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let Some(inner) = mc_inner.upgrade() else { return };
                let mut crossroads = inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &*inner.connection);
            }
        });

        Ok(Self { inner })
    }

    /// Registers a connected peer (§4.9), publishing one object per Primary
    /// and, for any Primary with a populated cache entry, one object per
    /// cached characteristic. Returns the full D-Bus object paths of the
    /// published Primaries.
    pub async fn register_peer(
        &self, local_addr: Address, peer_addr: Address, addr_type: AddressType, psm: Option<u16>,
        pre_opened: Option<SeqPacket>, primaries: Vec<(u16, u16, String)>,
    ) -> Result<Vec<String>> {
        let registered = self.inner.facade.register(local_addr, peer_addr, addr_type, psm, pre_opened, primaries).await?;
        let peer_component = peer_addr.to_string().replace(':', "");

        let mut crossroads = self.inner.crossroads.lock().await;
        let mut full_paths = Vec::with_capacity(registered.len());
        for (start_handle, suffix) in registered {
            let path = Path::new(format!("{SERVICE_PREFIX}/{peer_component}{suffix}")).map_err(|_| invalid_path())?;
            let object = ServiceObject::new(Arc::downgrade(&self.inner), local_addr, peer_addr, start_handle, path.clone());
            crossroads.insert(path.clone(), &[self.inner.service_token], Arc::new(object));

            if let Ok(props) = self.inner.facade.service_properties(local_addr, peer_addr, start_handle).await {
                for value_handle in props.characteristic_value_handles {
                    let char_path = Path::new(format!("{path}/char{value_handle:04x}")).map_err(|_| invalid_path())?;
                    let char_object = CharacteristicObject::for_session(Arc::downgrade(&self.inner), local_addr, peer_addr, start_handle, value_handle);
                    crossroads.insert(char_path, &[self.inner.characteristic_token], Arc::new(char_object));
                }
            }

            full_paths.push(path.to_string());
        }
        Ok(full_paths)
    }

    /// Unregisters a peer: unpublishes its Primary and characteristic
    /// objects and releases its transport.
    pub async fn unregister_peer(&self, local_addr: Address, peer_addr: Address) -> Result<()> {
        self.inner.facade.unregister(local_addr, peer_addr).await
    }

    /// Current D-Bus unique name of this session's connection.
    pub fn unique_name(&self) -> String {
        self.inner.connection.unique_name().to_string()
    }
}

fn invalid_path() -> Error {
    Error::with_message(crate::ErrorKind::InvalidArgs, "invalid D-Bus object path")
}
