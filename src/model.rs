//! In-memory tree of services → characteristics → descriptors.
//!
//! Parent/child relationships are expressed as parent-owned children plus
//! an index (service id, primary id, characteristic id) rather than as a
//! bidirectional owning reference — `Characteristic → Primary → GattService`
//! back-pointers are replaced with lookups by id, the same way this
//! codebase derives object identity from a parsed path instead of storing
//! a parent pointer.

use crate::{Address, Error, ErrorKind, Result};

/// 7-byte Characteristic Presentation Format record (`0x2904`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PresentationFormat {
    /// Format.
    pub format: u8,
    /// Exponent.
    pub exponent: i8,
    /// Unit (Bluetooth SIG assigned number).
    pub unit: u16,
    /// Namespace.
    pub namespace: u8,
    /// Description (Bluetooth SIG assigned number).
    pub description: u16,
}

impl PresentationFormat {
    /// Parses a presentation format record from its 7-byte wire form.
    /// Payloads shorter than 7 bytes are rejected by the caller before
    /// this is invoked (§4.5 step 5 requires `>= 7` bytes).
    pub fn from_bytes(b: &[u8; 7]) -> Self {
        Self {
            format: b[0],
            exponent: b[1] as i8,
            unit: u16::from_le_bytes([b[2], b[3]]),
            namespace: b[4],
            description: u16::from_le_bytes([b[5], b[6]]),
        }
    }
}

/// Descriptor-derived metadata attached to a characteristic.
#[derive(Debug, Clone, Default)]
pub struct CharacteristicDescriptors {
    /// `0x2901` User Description, as a NUL-terminated string (the engine
    /// appends the terminator; the wire payload is raw UTF-8).
    pub user_description: Option<String>,
    /// `0x2904` Presentation Format.
    pub presentation_format: Option<PresentationFormat>,
    /// Handle of the `0x2902` Client Characteristic Configuration
    /// descriptor, if the characteristic has one.
    pub client_config_handle: Option<u16>,
    /// Cached value of the Client Characteristic Configuration (2 bytes).
    pub client_config: Option<u16>,
}

/// A single GATT characteristic.
#[derive(Debug, Clone)]
pub struct Characteristic {
    /// Value handle; unique within the service.
    pub value_handle: u16,
    /// Inclusive last descriptor handle (or the parent's `end_handle` for
    /// the last characteristic of a service).
    pub end_handle: u16,
    /// ATT characteristic properties bitfield.
    pub properties: u8,
    /// Characteristic UUID.
    pub uuid: String,
    /// Last-observed value; absent until first read or notification.
    pub value: Option<Vec<u8>>,
    /// Descriptor-derived metadata.
    pub descriptors: CharacteristicDescriptors,
}

impl Characteristic {
    /// `true` if this characteristic's descriptor range
    /// `(value_handle, end_handle]` has room for any descriptor, i.e.
    /// whether step 5's *Find Information* should run at all (§4.5 edge
    /// case).
    pub fn has_descriptor_range(&self) -> bool {
        self.end_handle >= self.value_handle + 1
    }
}

/// A subscriber to value-change events on a primary service.
#[derive(Debug, Clone)]
pub struct Watcher {
    /// Opaque subscriber identity (e.g. a D-Bus unique bus name).
    pub subscriber_id: String,
    /// Opaque subscriber path (e.g. a D-Bus object path) the watcher
    /// delivers change notifications to.
    pub subscriber_path: String,
}

/// Per-Primary discovery state machine (§9: replaces the source's
/// callback-chain-over-a-heap-blob design with explicit states).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum DiscoveryState {
    /// No discovery has run, or the previous one completed/failed and the
    /// Primary is ready to discover again.
    #[default]
    Idle,
    /// *Discover All Characteristics of a Service* is outstanding.
    CharsPending,
    /// Per-characteristic descriptor/value reads are outstanding.
    /// `n_outstanding` counts completions still owed before the `last`-
    /// tagged one is expected.
    DescriptorsPending {
        /// Completions still outstanding.
        n_outstanding: usize,
    },
    /// Discovery completed successfully.
    Done,
    /// Discovery failed (watchdog expiry, remote disconnect, or an
    /// unescalatable ATT error on a required step).
    Failed,
}

/// In-flight discovery bookkeeping for one [`Primary`].
#[derive(Debug, Default)]
pub struct DiscoveryContext {
    /// Current state.
    pub state: DiscoveryState,
    /// Reply sender for the in-flight `DiscoverCharacteristics` call, if
    /// any is still owed a reply. `take()`n exactly once, on whichever
    /// path completes or fails the discovery — this is the concrete
    /// mechanism that makes the "already cleared" fast path a safe no-op
    /// rather than a double-reply.
    pub reply: Option<tokio::sync::oneshot::Sender<Result<Vec<String>>>>,
}

/// A top-level GATT service: `(start_handle, end_handle, uuid)`, immutable
/// once created.
#[derive(Debug)]
pub struct Primary {
    /// Start handle, inclusive.
    pub start_handle: u16,
    /// End handle, inclusive.
    pub end_handle: u16,
    /// Service UUID.
    pub uuid: String,
    /// Characteristics, ordered by ascending value handle.
    pub characteristics: Vec<Characteristic>,
    /// Registered watchers.
    pub watchers: Vec<Watcher>,
    /// In-flight discovery context.
    pub discovery: DiscoveryContext,
    /// D-Bus object path this Primary is published under, used to build a
    /// characteristic's path for value-change dispatch (§4.6/§4.7) without
    /// threading it through every call. Empty until the facade sets it.
    pub path_prefix: String,
}

impl Primary {
    /// Creates an empty Primary for the given handle range and UUID.
    pub fn new(start_handle: u16, end_handle: u16, uuid: impl Into<String>) -> Self {
        Self {
            start_handle,
            end_handle,
            uuid: uuid.into(),
            characteristics: Vec::new(),
            watchers: Vec::new(),
            discovery: DiscoveryContext::default(),
            path_prefix: String::new(),
        }
    }

    /// Finds a characteristic by value handle.
    pub fn characteristic(&self, value_handle: u16) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.value_handle == value_handle)
    }

    /// Finds a characteristic by value handle, mutably.
    pub fn characteristic_mut(&mut self, value_handle: u16) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.value_handle == value_handle)
    }

    /// Registers a watcher. Appending duplicates is permitted (§4.7).
    pub fn register_watcher(&mut self, subscriber_id: impl Into<String>, subscriber_path: impl Into<String>) {
        self.watchers.push(Watcher { subscriber_id: subscriber_id.into(), subscriber_path: subscriber_path.into() });
    }

    /// Unregisters a watcher matched by `(subscriber_id, subscriber_path)`.
    /// Fails with [`ErrorKind::Unauthorised`] if absent.
    pub fn unregister_watcher(&mut self, subscriber_id: &str, subscriber_path: &str) -> Result<()> {
        let pos = self
            .watchers
            .iter()
            .position(|w| w.subscriber_id == subscriber_id && w.subscriber_path == subscriber_path)
            .ok_or_else(|| Error::new(ErrorKind::Unauthorised))?;
        self.watchers.remove(pos);
        Ok(())
    }

    /// Checks §3/§8's handle-ordering invariant over the current
    /// characteristic list: strictly increasing value handles, each
    /// `end_handle` equal to either the next value handle minus one or
    /// this Primary's `end_handle`.
    pub fn check_handle_invariant(&self) -> bool {
        for (i, c) in self.characteristics.iter().enumerate() {
            if c.value_handle < self.start_handle || c.value_handle > self.end_handle {
                return false;
            }
            if i > 0 && c.value_handle <= self.characteristics[i - 1].value_handle {
                return false;
            }
            let expected_end = match self.characteristics.get(i + 1) {
                Some(next) => next.value_handle - 1,
                None => self.end_handle,
            };
            if c.end_handle != expected_end {
                return false;
            }
        }
        true
    }
}

/// One per connected peer. Identity is `(local_addr, peer_addr)`.
#[derive(Debug)]
pub struct GattService {
    /// Local adapter address.
    pub local_addr: Address,
    /// Peer address.
    pub peer_addr: Address,
    /// Dynamic PSM, or `None` for the fixed ATT CID (`0x0004`).
    pub psm: Option<u16>,
    /// Primary services, ordered by ascending start handle.
    pub primaries: Vec<Primary>,
    /// Whether the transport should remain open to receive unsolicited
    /// PDUs once live operations drop to zero.
    pub listen: bool,
}

impl GattService {
    /// Creates a new, empty GattService for a peer.
    pub fn new(local_addr: Address, peer_addr: Address, psm: Option<u16>) -> Self {
        Self { local_addr, peer_addr, psm, primaries: Vec::new(), listen: false }
    }

    /// Finds a Primary by start handle.
    pub fn primary(&self, start_handle: u16) -> Option<&Primary> {
        self.primaries.iter().find(|p| p.start_handle == start_handle)
    }

    /// Finds a Primary by start handle, mutably.
    pub fn primary_mut(&mut self, start_handle: u16) -> Option<&mut Primary> {
        self.primaries.iter_mut().find(|p| p.start_handle == start_handle)
    }

    /// Finds the Primary containing the given attribute handle, along with
    /// the characteristic it belongs to, if any — used by value-change
    /// dispatch (§4.6) to route a Notification/Indication without a
    /// stored back-pointer.
    pub fn find_characteristic_mut(&mut self, handle: u16) -> Option<(&mut Primary, usize)> {
        self.primaries.iter_mut().find_map(|p| {
            let idx = p.characteristics.iter().position(|c| c.value_handle == handle)?;
            Some((p, idx))
        })
    }
}

/// Peer identity used as the facade registry key.
pub type PeerKey = (Address, Address);
