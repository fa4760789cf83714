//! # gatt-client — a GATT client engine for Bluetooth Low Energy
//!
//! This crate implements the client side of the Generic Attribute Profile
//! (GATT) on top of the Attribute Protocol (ATT), carried over an L2CAP
//! connection-oriented channel. It exposes a remote peripheral's primary
//! services, characteristics, and descriptors as a navigable tree with
//! read/write/notify semantics.
//!
//! The engine (codec, transport, request pipeline, security escalator,
//! discovery state machine, service model, cache) has no D-Bus dependency
//! and is usable headless. The [`facade`] module and an internal publisher
//! add a D-Bus object-publisher surface on top, gated behind the
//! `dbus-facade` feature (on by default), in the same spirit as this
//! codebase's other Bluetooth crates separate protocol engines from their
//! D-Bus bindings.
//!
//! ## Basic usage
//! Build a [`Config`](config::Config), open a [`Transport`](transport::Transport)
//! to a peer, then drive [`discovery::discover_characteristics`] over a
//! [`model::Primary`]. The [`facade::Facade`] ties this together with an
//! explicit per-peer registry and (with `dbus-facade`) publishes the result
//! over D-Bus.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("gatt-client only supports the Linux operating system.");

use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};
use strum::{Display, EnumString};

#[cfg(feature = "dbus-facade")]
pub(crate) const SERVICE_PREFIX: &str = "/org/gatt_client";

#[cfg(feature = "dbus-facade")]
macro_rules! publish_path {
    ($path:expr) => {
        concat!("/org/gatt_client/", env!("CARGO_PKG_NAME"), "/", $path)
    };
}

#[cfg(feature = "dbus-facade")]
macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            log::trace!("{}: {}.{} = {:?}", ctx.path(), ctx.interface(), &$dbus_name, &value);
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}

#[cfg(feature = "dbus-facade")]
macro_rules! read_prop {
    ($dict:expr, $name:expr, $type:ty) => {
        dbus::arg::prop_cast::<$type>($dict, $name)
            .ok_or_else(|| dbus_crossroads::MethodErr::invalid_arg($name))?
            .to_owned()
    };
}

#[cfg(feature = "dbus-facade")]
macro_rules! read_opt_prop {
    ($dict:expr, $name:expr, $type:ty) => {
        dbus::arg::prop_cast::<$type>($dict, $name).cloned()
    };
}

pub mod cache;
pub mod codec;
pub mod config;
pub use config::Config;
pub mod discovery;
pub mod escalator;
#[cfg(feature = "dbus-facade")]
pub mod facade;
pub mod model;
pub mod pipeline;
#[cfg(feature = "dbus-facade")]
mod publish;
#[cfg(feature = "dbus-facade")]
mod session;
mod sys;
pub mod transport;
pub mod l2cap;

mod uuid_ext;
pub use uuid_ext::UuidExt;

#[doc(no_inline)]
pub use uuid::Uuid;

#[cfg(feature = "dbus-facade")]
pub use crate::{facade::Facade, session::Session};

/// GATT client error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// GATT client error kind.
///
/// This is the taxonomy of failures the engine surfaces to callers; see
/// the error handling policy for each kind in the component design.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ErrorKind {
    /// invalid arguments
    InvalidArgs,
    /// operation not authorised
    Unauthorised,
    /// transport failure: {0}
    #[strum(disabled)]
    TransportFailure(String),
    /// ATT error response, code {0:#04x}
    #[strum(disabled)]
    AttError(u8),
    /// discover characteristic values timed out
    DiscoveryTimeout,
    /// malformed PDU
    MalformedPdu,
    /// discovery already in progress
    DiscoveryInProgress,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error kind not part of the stable error taxonomy.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// IO error {0:?}
    #[cfg_attr(feature = "serde", serde(with = "io_errorkind_serde"))]
    Io(std::io::ErrorKind),
    /// join error
    JoinError,
    /// lost connection to the transport
    TransportLost,
    #[cfg(feature = "dbus-facade")]
    /// D-Bus error {0}
    DBus(String),
    #[cfg(feature = "dbus-facade")]
    /// key {0} is missing
    MissingKey(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

#[cfg(feature = "dbus-facade")]
impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("D-Bus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
            message: err.message().unwrap_or_default().to_string(),
        }
    }
}

#[cfg(feature = "dbus-facade")]
impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        match err.kind {
            ErrorKind::InvalidArgs => dbus::MethodErr::invalid_arg(&err.message),
            ErrorKind::Unauthorised => dbus::MethodErr::failed(&format!("not authorised: {}", err.message)),
            _ => dbus::MethodErr::failed(&err.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind as E;
        let kind = match &err.kind {
            ErrorKind::InvalidArgs => E::InvalidInput,
            ErrorKind::Unauthorised => E::PermissionDenied,
            ErrorKind::TransportFailure(_) => E::ConnectionReset,
            ErrorKind::AttError(_) => E::Other,
            ErrorKind::DiscoveryTimeout => E::TimedOut,
            ErrorKind::MalformedPdu => E::InvalidData,
            ErrorKind::DiscoveryInProgress => E::Other,
            ErrorKind::Internal(InternalErrorKind::Io(k)) => *k,
            ErrorKind::Internal(_) => E::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(all(feature = "dbus-facade", feature = "serde"))]
mod io_errorkind_serde {
    pub fn serialize<S>(_kind: &std::io::ErrorKind, ser: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::Serialize;
        ().serialize(ser)
    }

    pub fn deserialize<'de, D>(deser: D) -> Result<std::io::ErrorKind, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::Deserialize;
        <()>::deserialize(deser)?;
        Ok(std::io::ErrorKind::Other)
    }
}

/// GATT client result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth device address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address, corresponding to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<sys::bdaddr_t> for Address {
    fn from(mut addr: sys::bdaddr_t) -> Self {
        addr.b.reverse();
        Self(addr.b)
    }
}

impl From<Address> for sys::bdaddr_t {
    fn from(mut addr: Address) -> Self {
        addr.0.reverse();
        sys::bdaddr_t { b: addr.0 }
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Bluetooth device address type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) address.
    #[strum(serialize = "br/edr")]
    BrEdr = sys::BDADDR_BREDR,
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = sys::BDADDR_LE_PUBLIC,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = sys::BDADDR_LE_RANDOM,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::LePublic
    }
}

/// Result of calling one of our D-Bus methods.
#[cfg(feature = "dbus-facade")]
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Calls an async method body against the `Arc<T>` Crossroads associates
/// with the current object path, logging request/response at trace level.
#[cfg(feature = "dbus-facade")]
pub(crate) fn method_call<T, R, F>(
    mut ctx: dbus_crossroads::Context, cr: &mut dbus_crossroads::Crossroads, f: impl FnOnce(std::sync::Arc<T>) -> F,
) -> impl std::future::Future<Output = std::marker::PhantomData<R>>
where
    T: Send + Sync + 'static,
    R: dbus::arg::AppendAll + Debug,
    F: std::future::Future<Output = DbusResult<R>> + Send + 'static,
{
    let data: std::sync::Arc<T> = cr.data_mut(ctx.path()).unwrap().clone();
    async move {
        let result = f(data).await;
        log::trace!("{}: {}.{} -> {:?}", ctx.path(), ctx.interface().map(|i| i.to_string()).unwrap_or_default(), ctx.method(), &result);
        ctx.reply(result)
    }
}
