//! ATT PDU encoding and decoding.
//!
//! This module is deliberately pure data transforms: no I/O, no async, no
//! D-Bus. All multi-byte integers are little-endian, matching the
//! Attribute Protocol wire format (Bluetooth Core Specification Vol 3 Part F
//! §3).

use crate::{Error, ErrorKind, Result};

/// Error Response.
pub const OP_ERROR_RSP: u8 = 0x01;
/// Read By Type Request. Used by the discovery engine to run *Discover All
/// Characteristics of a Service* against the Characteristic Declaration
/// UUID (`0x2803`); not one of §4.1's core opcodes but required to
/// implement §4.5 step 1, so it lives alongside them.
pub const OP_READ_BY_TYPE_REQ: u8 = 0x08;
/// Read By Type Response.
pub const OP_READ_BY_TYPE_RSP: u8 = 0x09;
/// Characteristic Declaration UUID, the attribute type searched for by
/// *Discover All Characteristics of a Service*.
pub const CHARACTERISTIC_DECLARATION_UUID: u16 = 0x2803;
/// Find Information Request.
pub const OP_FIND_INFORMATION_REQ: u8 = 0x04;
/// Find Information Response.
pub const OP_FIND_INFORMATION_RSP: u8 = 0x05;
/// Read Request.
pub const OP_READ_REQ: u8 = 0x0A;
/// Read Response.
pub const OP_READ_RSP: u8 = 0x0B;
/// Write Request.
pub const OP_WRITE_REQ: u8 = 0x12;
/// Write Response.
pub const OP_WRITE_RSP: u8 = 0x13;
/// Handle Value Notification.
pub const OP_HANDLE_VALUE_NOTIFICATION: u8 = 0x1B;
/// Handle Value Indication.
pub const OP_HANDLE_VALUE_INDICATION: u8 = 0x1D;
/// Handle Value Confirmation.
pub const OP_HANDLE_VALUE_CONFIRMATION: u8 = 0x1E;

/// ATT error code: insufficient encryption.
pub const ATT_ERROR_INSUFF_ENC: u8 = 0x0F;
/// ATT error code: insufficient authentication.
pub const ATT_ERROR_AUTHENTICATION: u8 = 0x05;

fn malformed() -> Error {
    Error::new(ErrorKind::MalformedPdu)
}

fn u16_le(b: &[u8]) -> Result<u16> {
    if b.len() < 2 {
        return Err(malformed());
    }
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

/// `Find Information Request` PDU: `(opcode, start_handle, end_handle)`.
pub fn encode_find_information_req(start_handle: u16, end_handle: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(OP_FIND_INFORMATION_REQ);
    buf.extend_from_slice(&start_handle.to_le_bytes());
    buf.extend_from_slice(&end_handle.to_le_bytes());
    buf
}

/// One entry of a parsed `Find Information Response`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct InformationEntry {
    /// Attribute handle.
    pub handle: u16,
    /// 16-bit UUID. Format `0x02` (128-bit UUID) entries are skipped by
    /// the parser, per the documented limitation, so this is always the
    /// short form.
    pub uuid: u16,
}

/// Decodes a `Find Information Response` PDU (`0x05`).
///
/// Format `0x01` entries (16-bit UUID) are parsed; format `0x02` entries
/// (128-bit UUID) are skipped silently, matching the documented limitation.
pub fn decode_find_information_rsp(pdu: &[u8]) -> Result<Vec<InformationEntry>> {
    if pdu.len() < 2 || pdu[0] != OP_FIND_INFORMATION_RSP {
        return Err(malformed());
    }
    let format = pdu[1];
    let body = &pdu[2..];
    match format {
        0x01 => {
            if body.len() % 4 != 0 {
                return Err(malformed());
            }
            Ok(body
                .chunks_exact(4)
                .map(|c| InformationEntry { handle: u16::from_le_bytes([c[0], c[1]]), uuid: u16::from_le_bytes([c[2], c[3]]) })
                .collect())
        }
        0x02 => {
            if body.len() % 18 != 0 {
                return Err(malformed());
            }
            log::trace!("skipping {} format-0x02 (128-bit UUID) Find Information entries", body.len() / 18);
            Ok(Vec::new())
        }
        _ => Err(malformed()),
    }
}

/// `Read By Type Request` PDU searching `[start_handle, end_handle]` for
/// attributes of the given 16-bit type UUID.
pub fn encode_read_by_type_req(start_handle: u16, end_handle: u16, type_uuid: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7);
    buf.push(OP_READ_BY_TYPE_REQ);
    buf.extend_from_slice(&start_handle.to_le_bytes());
    buf.extend_from_slice(&end_handle.to_le_bytes());
    buf.extend_from_slice(&type_uuid.to_le_bytes());
    buf
}

/// One characteristic declaration returned by *Discover All Characteristics
/// of a Service*.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicDeclaration {
    /// Handle of the declaration attribute itself.
    pub declaration_handle: u16,
    /// ATT characteristic properties bitfield.
    pub properties: u8,
    /// Handle of the characteristic value attribute.
    pub value_handle: u16,
    /// Characteristic UUID, as a Bluetooth-form string (`"2A00"` for
    /// 16-bit, lowercase hyphenated 128-bit form otherwise).
    pub uuid: String,
}

/// Decodes a `Read By Type Response` PDU (`0x09`) carrying characteristic
/// declarations (value = `properties(1) | value_handle(2) | uuid(2 or 16)`).
pub fn decode_characteristic_declarations(pdu: &[u8]) -> Result<Vec<CharacteristicDeclaration>> {
    if pdu.len() < 2 || pdu[0] != OP_READ_BY_TYPE_RSP {
        return Err(malformed());
    }
    let elem_len = pdu[1] as usize;
    if elem_len < 2 + 3 {
        return Err(malformed());
    }
    let body = &pdu[2..];
    if body.is_empty() || body.len() % elem_len != 0 {
        return Err(malformed());
    }
    let uuid_len = elem_len - 2 - 3;
    let mut out = Vec::with_capacity(body.len() / elem_len);
    for chunk in body.chunks_exact(elem_len) {
        let declaration_handle = u16::from_le_bytes([chunk[0], chunk[1]]);
        let properties = chunk[2];
        let value_handle = u16::from_le_bytes([chunk[3], chunk[4]]);
        let uuid_bytes = &chunk[5..5 + uuid_len];
        let uuid = match uuid_len {
            2 => format!("{:04X}", u16::from_le_bytes([uuid_bytes[0], uuid_bytes[1]])),
            16 => {
                let mut be = uuid_bytes.to_vec();
                be.reverse();
                uuid::Uuid::from_slice(&be).map_err(|_| malformed())?.to_string()
            }
            _ => return Err(malformed()),
        };
        out.push(CharacteristicDeclaration { declaration_handle, properties, value_handle, uuid });
    }
    Ok(out)
}

/// `Read Request` PDU: `(opcode, handle)`.
pub fn encode_read_req(handle: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3);
    buf.push(OP_READ_REQ);
    buf.extend_from_slice(&handle.to_le_bytes());
    buf
}

/// Decodes a `Read Response` PDU (`0x0B`), returning the attribute value.
pub fn decode_read_rsp(pdu: &[u8]) -> Result<&[u8]> {
    if pdu.is_empty() || pdu[0] != OP_READ_RSP {
        return Err(malformed());
    }
    Ok(&pdu[1..])
}

/// `Write Request` PDU: `(opcode, handle, value)`.
pub fn encode_write_req(handle: u16, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + value.len());
    buf.push(OP_WRITE_REQ);
    buf.extend_from_slice(&handle.to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decodes a `Write Response` PDU (`0x13`); it carries no payload.
pub fn decode_write_rsp(pdu: &[u8]) -> Result<()> {
    if pdu.is_empty() || pdu[0] != OP_WRITE_RSP {
        return Err(malformed());
    }
    Ok(())
}

/// A parsed Handle Value Notification or Indication.
#[derive(Debug, Clone)]
pub struct HandleValue {
    /// Attribute handle whose value changed.
    pub handle: u16,
    /// New value.
    pub value: Vec<u8>,
}

/// Decodes a Handle Value Notification (`0x1B`) or Indication (`0x1D`) PDU.
///
/// Both share the same layout: `(opcode, handle, value)`. A PDU shorter
/// than 3 bytes is malformed and, per policy, must not be confirmed even
/// if it claims to be an indication.
pub fn decode_handle_value(pdu: &[u8]) -> Result<HandleValue> {
    if pdu.len() < 3 {
        return Err(malformed());
    }
    let handle = u16_le(&pdu[1..3])?;
    Ok(HandleValue { handle, value: pdu[3..].to_vec() })
}

/// Encodes a Handle Value Confirmation (`0x1E`). It carries no payload
/// beyond the opcode.
pub fn encode_handle_value_confirmation() -> Vec<u8> {
    vec![OP_HANDLE_VALUE_CONFIRMATION]
}

/// A parsed Error Response (`0x01`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorRsp {
    /// Opcode of the request that caused the error.
    pub request_opcode: u8,
    /// Attribute handle the error refers to.
    pub handle: u16,
    /// ATT error code.
    pub error_code: u8,
}

/// Decodes an Error Response PDU (`0x01`).
pub fn decode_error_rsp(pdu: &[u8]) -> Result<ErrorRsp> {
    if pdu.len() < 5 || pdu[0] != OP_ERROR_RSP {
        return Err(malformed());
    }
    Ok(ErrorRsp { request_opcode: pdu[1], handle: u16_le(&pdu[2..4])?, error_code: pdu[4] })
}

/// `true` if `error_code` is one the security escalator retries on.
pub fn is_escalatable(error_code: u8) -> bool {
    matches!(error_code, ATT_ERROR_INSUFF_ENC | ATT_ERROR_AUTHENTICATION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_information_rsp_format_01_round_trips() {
        let pdu = [OP_FIND_INFORMATION_RSP, 0x01, 0x13, 0x00, 0x01, 0x29, 0x14, 0x00, 0x02, 0x29];
        let entries = decode_find_information_rsp(&pdu).unwrap();
        assert_eq!(entries, vec![
            InformationEntry { handle: 0x0013, uuid: 0x2901 },
            InformationEntry { handle: 0x0014, uuid: 0x2902 },
        ]);
    }

    #[test]
    fn find_information_rsp_format_02_is_skipped() {
        let mut pdu = vec![OP_FIND_INFORMATION_RSP, 0x02];
        pdu.extend_from_slice(&[0u8; 18]);
        let entries = decode_find_information_rsp(&pdu).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn read_rsp_round_trips() {
        let pdu = [OP_READ_RSP, 0x41, 0x42];
        assert_eq!(decode_read_rsp(&pdu).unwrap(), &[0x41, 0x42]);
    }

    #[test]
    fn truncated_pdus_are_malformed() {
        assert!(decode_read_rsp(&[]).is_err());
        assert!(decode_handle_value(&[OP_HANDLE_VALUE_NOTIFICATION, 0x01]).is_err());
        assert!(decode_error_rsp(&[OP_ERROR_RSP, 0x01]).is_err());
    }

    #[test]
    fn handle_value_decodes_handle_and_payload() {
        let pdu = [OP_HANDLE_VALUE_INDICATION, 0x12, 0x00, 0x77];
        let hv = decode_handle_value(&pdu).unwrap();
        assert_eq!(hv.handle, 0x0012);
        assert_eq!(hv.value, vec![0x77]);
    }

    #[test]
    fn characteristic_declarations_round_trip_16bit_uuid() {
        // declaration_handle=0x0011, properties=0x0A, value_handle=0x0012, uuid=2A00
        let pdu = [OP_READ_BY_TYPE_RSP, 0x07, 0x11, 0x00, 0x0A, 0x12, 0x00, 0x00, 0x2A];
        let decls = decode_characteristic_declarations(&pdu).unwrap();
        assert_eq!(decls, vec![CharacteristicDeclaration {
            declaration_handle: 0x0011,
            properties: 0x0A,
            value_handle: 0x0012,
            uuid: "2A00".to_string(),
        }]);
    }

    #[test]
    fn escalatable_error_codes() {
        assert!(is_escalatable(ATT_ERROR_INSUFF_ENC));
        assert!(is_escalatable(ATT_ERROR_AUTHENTICATION));
        assert!(!is_escalatable(0x02));
    }
}
