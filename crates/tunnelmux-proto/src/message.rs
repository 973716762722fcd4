//! Message vocabulary shared by the server and agents
//!
//! A [`Message`] is a code, a 32-bit id and either a set of numbered,
//! typed fields or a raw binary payload. The id is a request id for control
//! messages and a channel id for `CHANNEL_DATA`.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// Frame header flags
pub mod flags {
    /// Frame body is a single opaque payload instead of a field list
    pub const RAW_BINARY: u16 = 0x0001;
    /// Frame belongs to a control exchange (informational, never required)
    pub const CONTROL: u16 = 0x0002;
}

/// Request completion codes carried in the `RCC` field
pub mod rcc {
    /// Request completed successfully
    pub const SUCCESS: u32 = 0;
    /// Request type is not understood by the receiver
    pub const UNKNOWN_COMMAND: u32 = 400;
    /// Receiver refused the request
    pub const ACCESS_DENIED: u32 = 401;
    /// Request arguments are missing or malformed
    pub const BAD_ARGUMENTS: u32 = 402;
    /// Receiver hit an internal failure
    pub const INTERNAL_ERROR: u32 = 500;
    /// Request arrived in a state where it is not allowed
    pub const OUT_OF_STATE: u32 = 911;
    /// Certificate could not be issued or stored
    pub const CERTIFICATE_ERROR: u32 = 920;
    /// Receiver timed out waiting on its own dependency
    pub const REQUEST_TIMEOUT: u32 = 504;
}

/// Message codes understood by the tunnel core
///
/// Codes outside the known set are preserved as [`MessageCode::Other`] so
/// that responses to control requests can be correlated without the codec
/// having to know every code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    /// Liveness probe; echoed back with the same id
    Keepalive,
    /// Response to any control request; carries `RCC`
    RequestCompleted,
    /// First message from the agent; advertises its metadata
    SetupAgentTunnel,
    /// Server asks the agent to bind to a node and request a certificate
    BindAgentTunnel,
    /// Agent submits a CSR for the pending bind or renewal
    RequestCertificate,
    /// Server returns the issued certificate
    NewCertificate,
    /// Server asks the agent to open a channel
    CreateChannel,
    /// Either side closes a channel
    CloseChannel,
    /// Opaque channel bytes; the message id is the channel id
    ChannelData,
    /// Server asks the agent to drop and re-establish the tunnel
    ResetTunnel,
    /// Any other code
    Other(u16),
}

impl MessageCode {
    /// Numeric wire value of this code
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Keepalive => 0x0003,
            Self::RequestCompleted => 0x001C,
            Self::SetupAgentTunnel => 0x0136,
            Self::BindAgentTunnel => 0x0137,
            Self::RequestCertificate => 0x0138,
            Self::NewCertificate => 0x0139,
            Self::CreateChannel => 0x013A,
            Self::ChannelData => 0x013B,
            Self::CloseChannel => 0x013C,
            Self::ResetTunnel => 0x013E,
            Self::Other(code) => code,
        }
    }

    /// Map a wire value to a code
    pub const fn from_u16(code: u16) -> Self {
        match code {
            0x0003 => Self::Keepalive,
            0x001C => Self::RequestCompleted,
            0x0136 => Self::SetupAgentTunnel,
            0x0137 => Self::BindAgentTunnel,
            0x0138 => Self::RequestCertificate,
            0x0139 => Self::NewCertificate,
            0x013A => Self::CreateChannel,
            0x013B => Self::ChannelData,
            0x013C => Self::CloseChannel,
            0x013E => Self::ResetTunnel,
            other => Self::Other(other),
        }
    }

    /// Symbolic name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keepalive => "KEEPALIVE",
            Self::RequestCompleted => "REQUEST_COMPLETED",
            Self::SetupAgentTunnel => "SETUP_AGENT_TUNNEL",
            Self::BindAgentTunnel => "BIND_AGENT_TUNNEL",
            Self::RequestCertificate => "REQUEST_CERTIFICATE",
            Self::NewCertificate => "NEW_CERTIFICATE",
            Self::CreateChannel => "CREATE_CHANNEL",
            Self::CloseChannel => "CLOSE_CHANNEL",
            Self::ChannelData => "CHANNEL_DATA",
            Self::ResetTunnel => "RESET_TUNNEL",
            Self::Other(_) => "OTHER",
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "0x{:04X}", code),
            known => f.write_str(known.as_str()),
        }
    }
}

/// Numbered field identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u32);

impl FieldId {
    /// Request completion code (u32)
    pub const RCC: Self = Self(28);
    /// Server id (u64)
    pub const SERVER_ID: Self = Self(100);
    /// Node GUID, used as certificate OU (guid)
    pub const NODE_GUID: Self = Self(101);
    /// Tunnel GUID, used as certificate CN (guid)
    pub const TUNNEL_GUID: Self = Self(102);
    /// DER-encoded certificate (binary)
    pub const CERTIFICATE: Self = Self(103);
    /// DER-encoded certificate signing request (binary)
    pub const CERTIFICATE_REQUEST: Self = Self(104);
    /// Channel id (u32)
    pub const CHANNEL_ID: Self = Self(105);
    /// Agent system name (string)
    pub const SYS_NAME: Self = Self(106);
    /// Agent system description (string)
    pub const SYS_DESCRIPTION: Self = Self(107);
    /// Agent platform name (string)
    pub const PLATFORM_NAME: Self = Self(108);
    /// Agent GUID (guid)
    pub const AGENT_ID: Self = Self(109);
    /// Hardware id (binary)
    pub const HARDWARE_ID: Self = Self(110);
    /// Agent version (string)
    pub const AGENT_VERSION: Self = Self(111);
    /// Agent build tag (string)
    pub const AGENT_BUILD_TAG: Self = Self(112);
    /// Host name as seen by the agent (string)
    pub const HOSTNAME: Self = Self(113);
    /// Zone UIN (i32)
    pub const ZONE_UIN: Self = Self(114);
    /// User agent is installed (bool)
    pub const USER_AGENT_INSTALLED: Self = Self(115);
    /// Agent acts as proxy (bool)
    pub const AGENT_PROXY: Self = Self(116);
    /// Agent acts as SNMP proxy (bool)
    pub const SNMP_PROXY: Self = Self(117);
    /// Agent acts as SNMP trap proxy (bool)
    pub const SNMP_TRAP_PROXY: Self = Self(118);
    /// Tunnel is bound to a node (bool)
    pub const IS_ACTIVE: Self = Self(119);
    /// Certificate country attribute (string)
    pub const COUNTRY: Self = Self(120);
    /// Certificate organization attribute (string)
    pub const ORGANIZATION: Self = Self(121);
}

/// Wire type tag of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// Signed 32-bit integer
    I32 = 0,
    /// UTF-8 string with u32 byte length
    String = 1,
    /// Signed 64-bit integer
    I64 = 2,
    /// Unsigned 16-bit integer
    U16 = 3,
    /// Binary blob with u32 byte length
    Binary = 4,
    /// Unsigned 32-bit integer
    U32 = 5,
    /// Unsigned 64-bit integer
    U64 = 6,
    /// 16-byte GUID
    Guid = 7,
    /// Unix time in seconds, signed 64-bit
    Time = 8,
    /// Boolean as one byte
    Bool = 9,
}

impl FieldType {
    /// Parse a wire tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::I32,
            1 => Self::String,
            2 => Self::I64,
            3 => Self::U16,
            4 => Self::Binary,
            5 => Self::U32,
            6 => Self::U64,
            7 => Self::Guid,
            8 => Self::Time,
            9 => Self::Bool,
            _ => return None,
        })
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Signed 32-bit integer
    I32(i32),
    /// Signed 64-bit integer
    I64(i64),
    /// Unsigned 16-bit integer
    U16(u16),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Unsigned 64-bit integer
    U64(u64),
    /// UTF-8 string
    String(String),
    /// Binary blob
    Binary(Bytes),
    /// GUID
    Guid(Uuid),
    /// Unix time in seconds
    Time(i64),
    /// Boolean
    Bool(bool),
}

impl FieldValue {
    /// Wire type tag for this value
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::I32(_) => FieldType::I32,
            Self::I64(_) => FieldType::I64,
            Self::U16(_) => FieldType::U16,
            Self::U32(_) => FieldType::U32,
            Self::U64(_) => FieldType::U64,
            Self::String(_) => FieldType::String,
            Self::Binary(_) => FieldType::Binary,
            Self::Guid(_) => FieldType::Guid,
            Self::Time(_) => FieldType::Time,
            Self::Bool(_) => FieldType::Bool,
        }
    }

    /// Encoded size of the value part (excluding field id and tag)
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Self::I32(_) | Self::U32(_) => 4,
            Self::I64(_) | Self::U64(_) | Self::Time(_) => 8,
            Self::U16(_) => 2,
            Self::Bool(_) => 1,
            Self::Guid(_) => 16,
            Self::String(s) => 4 + s.len(),
            Self::Binary(b) => 4 + b.len(),
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Self::I32(v) => Some(v as i128),
            Self::I64(v) | Self::Time(v) => Some(v as i128),
            Self::U16(v) => Some(v as i128),
            Self::U32(v) => Some(v as i128),
            Self::U64(v) => Some(v as i128),
            Self::Bool(v) => Some(v as i128),
            _ => None,
        }
    }
}

macro_rules! field_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for FieldValue {
            fn from(value: $ty) -> Self {
                Self::$variant(value.into())
            }
        })*
    };
}

field_value_from! {
    i32 => I32,
    i64 => I64,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    bool => Bool,
    Uuid => Guid,
    String => String,
    &str => String,
    Bytes => Binary,
    Vec<u8> => Binary,
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(value))
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    code: MessageCode,
    id: u32,
    flags: u16,
    fields: BTreeMap<FieldId, FieldValue>,
    payload: Option<Bytes>,
}

impl Message {
    /// Create a field-carrying message
    pub fn new(code: MessageCode, id: u32) -> Self {
        Self {
            code,
            id,
            flags: 0,
            fields: BTreeMap::new(),
            payload: None,
        }
    }

    /// Create a raw-payload message
    pub fn raw(code: MessageCode, id: u32, payload: Bytes) -> Self {
        Self {
            code,
            id,
            flags: flags::RAW_BINARY,
            fields: BTreeMap::new(),
            payload: Some(payload),
        }
    }

    /// Create a `CHANNEL_DATA` frame for the given channel
    pub fn channel_data(channel_id: u32, data: Bytes) -> Self {
        Self::raw(MessageCode::ChannelData, channel_id, data)
    }

    /// Create a `REQUEST_COMPLETED` response carrying `rcc`
    pub fn request_completed(id: u32, rcc: u32) -> Self {
        Self::new(MessageCode::RequestCompleted, id).with(FieldId::RCC, rcc)
    }

    pub(crate) fn from_parts(
        code: MessageCode,
        id: u32,
        flags: u16,
        fields: BTreeMap<FieldId, FieldValue>,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            code,
            id,
            flags,
            fields,
            payload,
        }
    }

    /// Message code
    pub fn code(&self) -> MessageCode {
        self.code
    }

    /// Request id, or channel id for channel data
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Header flags
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Whether the body is a raw payload
    pub fn is_raw(&self) -> bool {
        self.flags & flags::RAW_BINARY != 0
    }

    /// Raw payload, if this is a raw message
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Take the raw payload out of the message
    pub fn into_payload(self) -> Option<Bytes> {
        self.payload
    }

    /// Number of fields
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Iterate over fields in id order
    pub fn fields(&self) -> impl Iterator<Item = (&FieldId, &FieldValue)> {
        self.fields.iter()
    }

    /// Set a field, replacing any previous value
    pub fn set(&mut self, field: FieldId, value: impl Into<FieldValue>) {
        self.fields.insert(field, value.into());
    }

    /// Builder form of [`Message::set`]
    pub fn with(mut self, field: FieldId, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Whether the field is present
    pub fn has(&self, field: FieldId) -> bool {
        self.fields.contains_key(&field)
    }

    /// Raw field value
    pub fn get(&self, field: FieldId) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    /// Field as u32; integer fields of other widths are accepted when in range
    pub fn get_u32(&self, field: FieldId) -> Option<u32> {
        self.get(field)?
            .as_i128()
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Field as i32; integer fields of other widths are accepted when in range
    pub fn get_i32(&self, field: FieldId) -> Option<i32> {
        self.get(field)?
            .as_i128()
            .and_then(|v| i32::try_from(v).ok())
    }

    /// Field as u64
    pub fn get_u64(&self, field: FieldId) -> Option<u64> {
        self.get(field)?
            .as_i128()
            .and_then(|v| u64::try_from(v).ok())
    }

    /// Field as i64 (also reads time fields)
    pub fn get_i64(&self, field: FieldId) -> Option<i64> {
        self.get(field)?
            .as_i128()
            .and_then(|v| i64::try_from(v).ok())
    }

    /// Field as a boolean; integer fields are true when non-zero
    pub fn get_bool(&self, field: FieldId) -> Option<bool> {
        self.get(field)?.as_i128().map(|v| v != 0)
    }

    /// Field as a string
    pub fn get_str(&self, field: FieldId) -> Option<&str> {
        match self.get(field)? {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Field as binary
    pub fn get_binary(&self, field: FieldId) -> Option<&Bytes> {
        match self.get(field)? {
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Field as a GUID; 16-byte binary fields are accepted too
    pub fn get_guid(&self, field: FieldId) -> Option<Uuid> {
        match self.get(field)? {
            FieldValue::Guid(g) => Some(*g),
            FieldValue::Binary(b) => Uuid::from_slice(b).ok(),
            _ => None,
        }
    }

    /// `RCC` field; a response without one is treated as an internal error
    pub fn rcc(&self) -> u32 {
        self.get_u32(FieldId::RCC).unwrap_or(rcc::INTERNAL_ERROR)
    }
}
