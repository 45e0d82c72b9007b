//! BVLC-SC (BACnet Virtual Link Control - Secure Connect) Protocol
//!
//! Implements ASHRAE 135-2020 Addendum bj (Annex AB) - BACnet Secure Connect.
//!
//! Frame layout (WebSocket messages delimit frames, so there is no length
//! field):
//!
//! ```text
//! +----------+---------+---------------+-------------+-------------+
//! | Byte 0   | Byte 1  | Bytes 2-3     | 6 bytes opt | 6 bytes opt |
//! +----------+---------+---------------+-------------+-------------+
//! | Function | Control | Message ID    | Origin VMAC | Dest VMAC   |
//! +----------+---------+---------------+-------------+-------------+
//! | Destination options | Data options | Payload                   |
//! +---------------------+--------------+---------------------------+
//! ```
//!
//! Presence of the VMAC fields and option lists is governed by the control
//! octet. Each header option starts with a marker octet carrying the
//! option type, a `must understand` flag and a `more options follow` flag;
//! options with header data add a 16-bit length and the data itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DeviceUuid, Vmac};

/// BVLC-SC message type identifier (1 byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    /// BVLC-Result: response indicating success or failure
    Result = 0x00,

    /// Encapsulated NPDU
    EncapsulatedNpdu = 0x01,

    /// Address Resolution request
    AddressResolution = 0x02,

    /// Address Resolution ACK
    AddressResolutionAck = 0x03,

    /// Advertisement: node announces its capabilities
    Advertisement = 0x04,

    /// Advertisement Solicitation: request an advertisement
    AdvertisementSolicitation = 0x05,

    /// Connect Request: initiator asserts its identity
    ConnectRequest = 0x06,

    /// Connect Accept: acceptor answers with its identity
    ConnectAccept = 0x07,

    /// Disconnect Request: graceful disconnection
    DisconnectRequest = 0x08,

    /// Disconnect ACK: confirms disconnection
    DisconnectAck = 0x09,

    /// Heartbeat Request: keep-alive message
    HeartbeatRequest = 0x0A,

    /// Heartbeat ACK: response to heartbeat
    HeartbeatAck = 0x0B,

    /// Proprietary Message
    ProprietaryMessage = 0x0C,
}

impl BvlcFunction {
    /// Convert from u8, returns None for unknown values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Result),
            0x01 => Some(Self::EncapsulatedNpdu),
            0x02 => Some(Self::AddressResolution),
            0x03 => Some(Self::AddressResolutionAck),
            0x04 => Some(Self::Advertisement),
            0x05 => Some(Self::AdvertisementSolicitation),
            0x06 => Some(Self::ConnectRequest),
            0x07 => Some(Self::ConnectAccept),
            0x08 => Some(Self::DisconnectRequest),
            0x09 => Some(Self::DisconnectAck),
            0x0A => Some(Self::HeartbeatRequest),
            0x0B => Some(Self::HeartbeatAck),
            0x0C => Some(Self::ProprietaryMessage),
            _ => None,
        }
    }
}

/// Error class `communication` (ASHRAE 135 Clause 18).
pub const ERROR_CLASS_COMMUNICATION: u16 = 7;

/// Error code `optional-functionality-not-supported`.
pub const ERROR_CODE_OPTIONAL_FUNCTIONALITY_NOT_SUPPORTED: u16 = 45;

/// Error code `header-not-understood` (Addendum bj).
pub const ERROR_CODE_HEADER_NOT_UNDERSTOOD: u16 = 360;

/// Error code `node-duplicate-vmac` (Addendum bj).
pub const ERROR_CODE_NODE_DUPLICATE_VMAC: u16 = 361;

/// Control octet flags
const CONTROL_DATA_OPTIONS: u8 = 0x01;
const CONTROL_DEST_OPTIONS: u8 = 0x02;
const CONTROL_DEST_VMAC: u8 = 0x04;
const CONTROL_ORIG_VMAC: u8 = 0x08;

/// Header option marker flags
const OPTION_MORE: u8 = 0x80;
const OPTION_MUST_UNDERSTAND: u8 = 0x40;
const OPTION_HEADER_DATA: u8 = 0x20;
const OPTION_TYPE_MASK: u8 = 0x1F;

/// Header option type `secure path`
pub const OPTION_TYPE_SECURE_PATH: u8 = 0x01;

/// Header option type `proprietary`
pub const OPTION_TYPE_PROPRIETARY: u8 = 0x1F;

/// One destination or data header option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOption {
    /// The marker octet exactly as received; echoed back in BVLC-Result
    /// NAKs that reference the offending option.
    pub marker: u8,

    /// Option header data, present when the marker's data flag is set.
    pub data: Option<Bytes>,
}

impl HeaderOption {
    pub fn secure_path() -> Self {
        HeaderOption {
            marker: OPTION_TYPE_SECURE_PATH,
            data: None,
        }
    }

    pub fn option_type(&self) -> u8 {
        self.marker & OPTION_TYPE_MASK
    }

    pub fn must_understand(&self) -> bool {
        self.marker & OPTION_MUST_UNDERSTAND != 0
    }

    /// Whether this implementation understands the option.
    pub fn understood(&self) -> bool {
        self.option_type() == OPTION_TYPE_SECURE_PATH
    }
}

/// BVLC-SC message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub function: BvlcFunction,

    /// Correlates requests with their BVLC-Result replies.
    pub message_id: u16,

    /// Originating node; absent on a direct hop.
    pub origin: Option<Vmac>,

    /// Destination node; [`Vmac::BROADCAST`] addresses every node.
    pub dest: Option<Vmac>,

    pub dest_options: Vec<HeaderOption>,
    pub data_options: Vec<HeaderOption>,
}

impl Header {
    pub fn new(function: BvlcFunction, message_id: u16) -> Self {
        Header {
            function,
            message_id,
            origin: None,
            dest: None,
            dest_options: Vec::new(),
            data_options: Vec::new(),
        }
    }

    fn control(&self) -> u8 {
        let mut c = 0u8;
        if !self.data_options.is_empty() {
            c |= CONTROL_DATA_OPTIONS;
        }
        if !self.dest_options.is_empty() {
            c |= CONTROL_DEST_OPTIONS;
        }
        if self.dest.is_some() {
            c |= CONTROL_DEST_VMAC;
        }
        if self.origin.is_some() {
            c |= CONTROL_ORIG_VMAC;
        }
        c
    }
}

/// Identity fields exchanged by the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub vmac: Vmac,
    pub uuid: DeviceUuid,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
}

/// Hub connection status reported in an Advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HubConnectionStatus {
    NoConnection = 0x00,
    ConnectedToPrimary = 0x01,
    ConnectedToFailover = 0x02,
}

impl HubConnectionStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::NoConnection),
            0x01 => Some(Self::ConnectedToPrimary),
            0x02 => Some(Self::ConnectedToFailover),
            _ => None,
        }
    }
}

/// Advertisement payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    pub hub_status: HubConnectionStatus,
    /// Whether this node accepts direct connections.
    pub accept_direct: bool,
    pub max_bvlc_len: u16,
    pub max_npdu_len: u16,
}

/// BVLC-Result payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPayload {
    /// The BVLC function the result refers to.
    pub function: BvlcFunction,

    /// `false` is an ACK; `true` a NAK carrying the error fields.
    pub nak: bool,

    /// Marker octet of the offending header option, when the NAK refers
    /// to one.
    pub error_header_marker: Option<u8>,

    pub error_class: u16,
    pub error_code: u16,

    /// UTF-8 diagnostic string; informational only.
    pub details: Bytes,
}

/// Decoded message payload, one variant per BVLC function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Result(ResultPayload),
    EncapsulatedNpdu(Bytes),
    AddressResolution,
    /// Space-separated (0x20) UTF-8 WebSocket URI list, kept raw; the
    /// supervisor splits and validates it.
    AddressResolutionAck(Bytes),
    Advertisement(Advertisement),
    AdvertisementSolicitation,
    ConnectRequest(ConnectParams),
    ConnectAccept(ConnectParams),
    DisconnectRequest,
    DisconnectAck,
    HeartbeatRequest,
    HeartbeatAck,
    Proprietary(Bytes),
}

/// A decoded (or to-be-encoded) BVLC-SC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

/// BVLC-SC codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BvlcError {
    #[error("BVLC-SC message too short")]
    MessageTooShort,

    #[error("unknown BVLC-SC function: 0x{0:02X}")]
    UnknownFunction(u8),

    #[error("malformed header options")]
    MalformedOptions,

    #[error("malformed payload for function {0:?}")]
    MalformedPayload(BvlcFunction),
}

impl Message {
    /// Encode the message into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);

        buf.put_u8(self.header.function as u8);
        buf.put_u8(self.header.control());
        buf.put_u16(self.header.message_id);
        if let Some(origin) = self.header.origin {
            buf.put_slice(&origin.0);
        }
        if let Some(dest) = self.header.dest {
            buf.put_slice(&dest.0);
        }
        encode_options(&mut buf, &self.header.dest_options);
        encode_options(&mut buf, &self.header.data_options);

        match &self.payload {
            Payload::Result(r) => {
                buf.put_u8(r.function as u8);
                buf.put_u8(if r.nak { 0x01 } else { 0x00 });
                if r.nak {
                    buf.put_u8(r.error_header_marker.unwrap_or(0));
                    buf.put_u16(r.error_class);
                    buf.put_u16(r.error_code);
                    buf.put_slice(&r.details);
                }
            }
            Payload::EncapsulatedNpdu(npdu) => buf.put_slice(npdu),
            Payload::AddressResolutionAck(uris) => buf.put_slice(uris),
            Payload::Advertisement(adv) => {
                buf.put_u8(adv.hub_status as u8);
                buf.put_u8(if adv.accept_direct { 0x01 } else { 0x00 });
                buf.put_u16(adv.max_bvlc_len);
                buf.put_u16(adv.max_npdu_len);
            }
            Payload::ConnectRequest(p) | Payload::ConnectAccept(p) => {
                buf.put_slice(&p.vmac.0);
                buf.put_slice(&p.uuid.0);
                buf.put_u16(p.max_bvlc_len);
                buf.put_u16(p.max_npdu_len);
            }
            Payload::Proprietary(data) => buf.put_slice(data),
            Payload::AddressResolution
            | Payload::AdvertisementSolicitation
            | Payload::DisconnectRequest
            | Payload::DisconnectAck
            | Payload::HeartbeatRequest
            | Payload::HeartbeatAck => {}
        }

        buf
    }

    /// Decode a message from one WebSocket frame.
    pub fn decode(mut buf: Bytes) -> Result<Self, BvlcError> {
        if buf.len() < 4 {
            return Err(BvlcError::MessageTooShort);
        }

        let function_byte = buf.get_u8();
        let function =
            BvlcFunction::from_u8(function_byte).ok_or(BvlcError::UnknownFunction(function_byte))?;
        let control = buf.get_u8();
        let message_id = buf.get_u16();

        let origin = if control & CONTROL_ORIG_VMAC != 0 {
            Some(get_vmac(&mut buf)?)
        } else {
            None
        };
        let dest = if control & CONTROL_DEST_VMAC != 0 {
            Some(get_vmac(&mut buf)?)
        } else {
            None
        };

        let dest_options = if control & CONTROL_DEST_OPTIONS != 0 {
            decode_options(&mut buf)?
        } else {
            Vec::new()
        };
        let data_options = if control & CONTROL_DATA_OPTIONS != 0 {
            decode_options(&mut buf)?
        } else {
            Vec::new()
        };

        let payload = decode_payload(function, buf)?;

        Ok(Message {
            header: Header {
                function,
                message_id,
                origin,
                dest,
                dest_options,
                data_options,
            },
            payload,
        })
    }

    /// Decoded destination, without the cost of a full decode. `None`
    /// means no destination VMAC is present (a direct hop).
    pub fn peek_dest(frame: &[u8]) -> Option<Vmac> {
        if frame.len() < 4 {
            return None;
        }
        let control = frame[1];
        let mut at = 4;
        if control & CONTROL_ORIG_VMAC != 0 {
            at += 6;
        }
        if control & CONTROL_DEST_VMAC == 0 || frame.len() < at + 6 {
            return None;
        }
        let mut vmac = [0u8; 6];
        vmac.copy_from_slice(&frame[at..at + 6]);
        Some(Vmac(vmac))
    }

    // Constructors for every message kind the core produces.

    pub fn connect_request(message_id: u16, params: ConnectParams) -> Self {
        Message {
            header: Header::new(BvlcFunction::ConnectRequest, message_id),
            payload: Payload::ConnectRequest(params),
        }
    }

    pub fn connect_accept(message_id: u16, params: ConnectParams) -> Self {
        Message {
            header: Header::new(BvlcFunction::ConnectAccept, message_id),
            payload: Payload::ConnectAccept(params),
        }
    }

    pub fn disconnect_request(message_id: u16) -> Self {
        Message {
            header: Header::new(BvlcFunction::DisconnectRequest, message_id),
            payload: Payload::DisconnectRequest,
        }
    }

    pub fn disconnect_ack(message_id: u16) -> Self {
        Message {
            header: Header::new(BvlcFunction::DisconnectAck, message_id),
            payload: Payload::DisconnectAck,
        }
    }

    pub fn heartbeat_request(message_id: u16) -> Self {
        Message {
            header: Header::new(BvlcFunction::HeartbeatRequest, message_id),
            payload: Payload::HeartbeatRequest,
        }
    }

    pub fn heartbeat_ack(message_id: u16) -> Self {
        Message {
            header: Header::new(BvlcFunction::HeartbeatAck, message_id),
            payload: Payload::HeartbeatAck,
        }
    }

    pub fn address_resolution(message_id: u16, dest: Vmac) -> Self {
        let mut header = Header::new(BvlcFunction::AddressResolution, message_id);
        header.dest = Some(dest);
        Message {
            header,
            payload: Payload::AddressResolution,
        }
    }

    pub fn address_resolution_ack(message_id: u16, dest: Option<Vmac>, uris: &[u8]) -> Self {
        let mut header = Header::new(BvlcFunction::AddressResolutionAck, message_id);
        header.dest = dest;
        Message {
            header,
            payload: Payload::AddressResolutionAck(Bytes::copy_from_slice(uris)),
        }
    }

    pub fn advertisement(message_id: u16, dest: Option<Vmac>, adv: Advertisement) -> Self {
        let mut header = Header::new(BvlcFunction::Advertisement, message_id);
        header.dest = dest;
        Message {
            header,
            payload: Payload::Advertisement(adv),
        }
    }

    pub fn encapsulated_npdu(message_id: u16, dest: Option<Vmac>, npdu: Bytes) -> Self {
        let mut header = Header::new(BvlcFunction::EncapsulatedNpdu, message_id);
        header.dest = dest;
        Message {
            header,
            payload: Payload::EncapsulatedNpdu(npdu),
        }
    }

    /// Build a NAK result for `function`, addressed to `dest`.
    pub fn result_nak(
        message_id: u16,
        dest: Option<Vmac>,
        function: BvlcFunction,
        error_header_marker: Option<u8>,
        error_class: u16,
        error_code: u16,
        details: &str,
    ) -> Self {
        let mut header = Header::new(BvlcFunction::Result, message_id);
        header.dest = dest;
        Message {
            header,
            payload: Payload::Result(ResultPayload {
                function,
                nak: true,
                error_header_marker,
                error_class,
                error_code,
                details: Bytes::copy_from_slice(details.as_bytes()),
            }),
        }
    }
}

fn get_vmac(buf: &mut Bytes) -> Result<Vmac, BvlcError> {
    if buf.len() < 6 {
        return Err(BvlcError::MessageTooShort);
    }
    let mut vmac = [0u8; 6];
    buf.copy_to_slice(&mut vmac);
    Ok(Vmac(vmac))
}

fn encode_options(buf: &mut BytesMut, options: &[HeaderOption]) {
    for (i, opt) in options.iter().enumerate() {
        let mut marker = opt.marker & !(OPTION_MORE | OPTION_HEADER_DATA);
        if i + 1 < options.len() {
            marker |= OPTION_MORE;
        }
        if opt.data.is_some() {
            marker |= OPTION_HEADER_DATA;
        }
        buf.put_u8(marker);
        if let Some(data) = &opt.data {
            buf.put_u16(data.len() as u16);
            buf.put_slice(data);
        }
    }
}

fn decode_options(buf: &mut Bytes) -> Result<Vec<HeaderOption>, BvlcError> {
    let mut options = Vec::new();
    loop {
        if buf.is_empty() {
            return Err(BvlcError::MalformedOptions);
        }
        let marker = buf.get_u8();
        let data = if marker & OPTION_HEADER_DATA != 0 {
            if buf.len() < 2 {
                return Err(BvlcError::MalformedOptions);
            }
            let len = buf.get_u16() as usize;
            if buf.len() < len {
                return Err(BvlcError::MalformedOptions);
            }
            Some(buf.split_to(len))
        } else {
            None
        };
        options.push(HeaderOption { marker, data });
        if marker & OPTION_MORE == 0 {
            return Ok(options);
        }
    }
}

fn decode_payload(function: BvlcFunction, mut buf: Bytes) -> Result<Payload, BvlcError> {
    match function {
        BvlcFunction::Result => {
            if buf.len() < 2 {
                return Err(BvlcError::MalformedPayload(function));
            }
            let nested = buf.get_u8();
            let nested = BvlcFunction::from_u8(nested).ok_or(BvlcError::UnknownFunction(nested))?;
            let nak = buf.get_u8() != 0;
            if !nak {
                return Ok(Payload::Result(ResultPayload {
                    function: nested,
                    nak: false,
                    error_header_marker: None,
                    error_class: 0,
                    error_code: 0,
                    details: Bytes::new(),
                }));
            }
            if buf.len() < 5 {
                return Err(BvlcError::MalformedPayload(function));
            }
            let marker = buf.get_u8();
            let error_class = buf.get_u16();
            let error_code = buf.get_u16();
            Ok(Payload::Result(ResultPayload {
                function: nested,
                nak: true,
                error_header_marker: if marker != 0 { Some(marker) } else { None },
                error_class,
                error_code,
                details: buf,
            }))
        }
        BvlcFunction::EncapsulatedNpdu => Ok(Payload::EncapsulatedNpdu(buf)),
        BvlcFunction::AddressResolution => Ok(Payload::AddressResolution),
        BvlcFunction::AddressResolutionAck => Ok(Payload::AddressResolutionAck(buf)),
        BvlcFunction::Advertisement => {
            if buf.len() < 6 {
                return Err(BvlcError::MalformedPayload(function));
            }
            let status = buf.get_u8();
            let hub_status = HubConnectionStatus::from_u8(status)
                .ok_or(BvlcError::MalformedPayload(function))?;
            let accept_direct = buf.get_u8() != 0;
            let max_bvlc_len = buf.get_u16();
            let max_npdu_len = buf.get_u16();
            Ok(Payload::Advertisement(Advertisement {
                hub_status,
                accept_direct,
                max_bvlc_len,
                max_npdu_len,
            }))
        }
        BvlcFunction::AdvertisementSolicitation => Ok(Payload::AdvertisementSolicitation),
        BvlcFunction::ConnectRequest | BvlcFunction::ConnectAccept => {
            if buf.len() < 26 {
                return Err(BvlcError::MalformedPayload(function));
            }
            let vmac = get_vmac(&mut buf)?;
            let mut uuid = [0u8; 16];
            buf.copy_to_slice(&mut uuid);
            let max_bvlc_len = buf.get_u16();
            let max_npdu_len = buf.get_u16();
            let params = ConnectParams {
                vmac,
                uuid: DeviceUuid(uuid),
                max_bvlc_len,
                max_npdu_len,
            };
            Ok(match function {
                BvlcFunction::ConnectRequest => Payload::ConnectRequest(params),
                _ => Payload::ConnectAccept(params),
            })
        }
        BvlcFunction::DisconnectRequest => Ok(Payload::DisconnectRequest),
        BvlcFunction::DisconnectAck => Ok(Payload::DisconnectAck),
        BvlcFunction::HeartbeatRequest => Ok(Payload::HeartbeatRequest),
        BvlcFunction::HeartbeatAck => Ok(Payload::HeartbeatAck),
        BvlcFunction::ProprietaryMessage => Ok(Payload::Proprietary(buf)),
    }
}
