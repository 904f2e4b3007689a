//! Message layer shared by the vlun runtime and the kernel transport.
//!
//! Everything that crosses the transact ioctl boundary lives here: request and
//! response frames, the storage unit provisioning parameters, and the SCSI
//! status/sense payloads that ride along with responses. Structures are
//! `#[repr(C)]` and byte-order stable so they can be handed to the kernel
//! driver unmodified.

#![no_std]

use core::fmt;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Number of bytes in an encoded [`TransactReq`].
pub const TRANSACT_REQ_LEN: usize = 40;
/// Number of bytes in an encoded [`TransactRsp`].
pub const TRANSACT_RSP_LEN: usize = 32;
/// Number of bytes in one [`UnmapDescriptor`] entry.
pub const UNMAP_DESCRIPTOR_LEN: usize = 16;
/// Request kinds 0..TRANSACT_KIND_COUNT are defined; the debug-log mask has
/// one bit per kind in this range.
pub const TRANSACT_KIND_COUNT: u32 = 5;
/// Upper bound for [`StorageUnitParams::max_transfer_length`].
pub const MAX_TRANSFER_LENGTH_CAP: u32 = 16 << 20;

/// SCSI status bytes, sense keys and additional sense codes used by the
/// runtime. Values are from SPC-3/SAM-5.
pub mod scsi {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;

    /// Reserved status value: a handler storing this has taken over
    /// completion and will answer later through the deferred path.
    pub const STATUS_PENDING: u8 = 0xFF;

    pub const SENSE_NO_SENSE: u8 = 0x00;
    pub const SENSE_RECOVERED_ERROR: u8 = 0x01;
    pub const SENSE_NOT_READY: u8 = 0x02;
    pub const SENSE_MEDIUM_ERROR: u8 = 0x03;
    pub const SENSE_HARDWARE_ERROR: u8 = 0x04;
    pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
    pub const SENSE_UNIT_ATTENTION: u8 = 0x06;
    pub const SENSE_DATA_PROTECT: u8 = 0x07;
    pub const SENSE_ABORTED_COMMAND: u8 = 0x0B;

    pub const ASC_NO_SENSE: u8 = 0x00;
    pub const ASC_WRITE_ERROR: u8 = 0x0C;
    pub const ASC_UNRECOVERED_READ: u8 = 0x11;
    pub const ASC_INVALID_CDB: u8 = 0x20;
    pub const ASC_ILLEGAL_BLOCK: u8 = 0x21;
    pub const ASC_WRITE_PROTECT: u8 = 0x27;

    /// Fixed-format sense, current error.
    pub const SENSE_RESPONSE_CURRENT: u8 = 0x70;
    /// Fixed-format sense, deferred error.
    pub const SENSE_RESPONSE_DEFERRED: u8 = 0x71;
    /// Information-field-valid bit in the sense response code byte.
    pub const SENSE_INFORMATION_VALID: u8 = 0x80;
}

/// Errors surfaced while decoding or validating protocol structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Request kind outside the defined range.
    InvalidKind(u32),
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidKind(kind) => write!(f, "invalid request kind {kind}"),
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

impl core::error::Error for ProtoError {}

/// Result alias for protocol operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Request kinds carried in [`TransactReq::kind`]. Value 0 is reserved for
/// transport-originated spurious wakeups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TransactKind {
    Read = 1,
    Write = 2,
    Flush = 3,
    Unmap = 4,
}

impl TryFrom<u32> for TransactKind {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            3 => Ok(Self::Flush),
            4 => Ok(Self::Unmap),
            other => Err(ProtoError::InvalidKind(other)),
        }
    }
}

impl From<TransactKind> for u32 {
    fn from(kind: TransactKind) -> Self {
        kind as u32
    }
}

/// 128-bit storage unit identity, supplied by the client at provision time
/// and persisted alongside the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub const NIL: Guid = Guid([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

/// Packed bus/target/LUN triple assigned by the kernel at provision time.
///
/// Layout: bus in bits 16..24, target in bits 8..16, lun in bits 0..8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct Btl(u32);

impl Btl {
    pub const fn new(bus: u8, target: u8, lun: u8) -> Self {
        Self(((bus as u32) << 16) | ((target as u32) << 8) | lun as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn bus(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn target(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn lun(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for Btl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bus(), self.target(), self.lun())
    }
}

/// Provisioning parameters for a storage unit. Fixed for the LUN's life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StorageUnitParams {
    pub guid: Guid,
    /// Logical block count.
    pub block_count: u64,
    /// Bytes per logical block; power of two in [512, 4096].
    pub block_length: u32,
    /// Upper bound in bytes for a single Read/Write payload; multiple of
    /// `block_length`, at most [`MAX_TRANSFER_LENGTH_CAP`].
    pub max_transfer_length: u32,
    /// Upper bound on descriptors in a single Unmap request.
    pub max_unmap_descriptor_count: u32,
    pub write_protected: u8,
    pub cache_supported: u8,
    pub unmap_supported: u8,
    pub eject_disabled: u8,
    /// Space-padded ASCII product identifier.
    pub product_id: [u8; 16],
    /// Space-padded ASCII revision level.
    pub product_revision_level: [u8; 4],
    pub reserved: [u8; 4],
}

impl StorageUnitParams {
    /// Checks the invariants the runtime relies on. The kernel revalidates at
    /// provision time; this catches client mistakes before the ioctl.
    pub fn validate(&self) -> Result<()> {
        if self.block_length == 0 || !self.block_length.is_power_of_two() {
            return Err(ProtoError::InvalidValue(
                "block length must be a power of two",
            ));
        }
        if !(512..=4096).contains(&self.block_length) {
            return Err(ProtoError::InvalidValue(
                "block length out of supported range",
            ));
        }
        if self.block_count == 0 {
            return Err(ProtoError::InvalidValue("block count must be non-zero"));
        }
        if self
            .block_count
            .checked_mul(self.block_length as u64)
            .is_none()
        {
            return Err(ProtoError::InvalidValue("unit capacity overflows u64"));
        }
        if self.max_transfer_length == 0
            || !self
                .max_transfer_length
                .is_multiple_of(self.block_length)
        {
            return Err(ProtoError::InvalidValue(
                "max transfer length must be a multiple of block length",
            ));
        }
        if self.max_transfer_length > MAX_TRANSFER_LENGTH_CAP {
            return Err(ProtoError::InvalidValue("max transfer length too large"));
        }
        ascii_field(&self.product_id, "product id")?;
        ascii_field(&self.product_revision_level, "product revision level")?;
        Ok(())
    }
}

fn ascii_field(bytes: &[u8], field: &'static str) -> Result<()> {
    if bytes[0] == 0 {
        return Err(ProtoError::InvalidValue(field));
    }
    if !bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(ProtoError::InvalidValue(field));
    }
    Ok(())
}

/// Read operands. `address` is a kernel-assigned payload cookie; the payload
/// itself travels through the transact data buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReadOp {
    pub block_address: u64,
    pub block_count: u32,
    pub reserved: u32,
    pub address: u64,
}

/// Write operands; same layout as [`ReadOp`] with the transfer direction
/// reversed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WriteOp {
    pub block_address: u64,
    pub block_count: u32,
    pub reserved: u32,
    pub address: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlushOp {
    pub block_address: u64,
    pub block_count: u32,
    pub reserved: u32,
}

/// Unmap operands. `count` descriptors ride in the transact data buffer as a
/// packed [`UnmapDescriptor`] array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UnmapOp {
    pub count: u32,
    pub reserved: u32,
}

/// One block range in an Unmap request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UnmapDescriptor {
    pub block_address: u64,
    pub block_count: u32,
    pub reserved: u32,
}

/// Typed view over the operand area of a [`TransactReq`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read(ReadOp),
    Write(WriteOp),
    Flush(FlushOp),
    Unmap(UnmapOp),
}

/// Request frame delivered by one transact call.
///
/// `hint` is the opaque token pairing this request with its eventual
/// response; zero marks a spurious wakeup and never identifies a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TransactReq {
    pub hint: u64,
    pub kind: u32,
    reserved: u32,
    op: [u8; 24],
}

impl TransactReq {
    /// A zeroed frame; `hint == 0` makes it a spurious wakeup.
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    pub fn read(hint: u64, op: ReadOp) -> Self {
        Self::with_op(hint, TransactKind::Read, op.as_bytes())
    }

    pub fn write(hint: u64, op: WriteOp) -> Self {
        Self::with_op(hint, TransactKind::Write, op.as_bytes())
    }

    pub fn flush(hint: u64, op: FlushOp) -> Self {
        Self::with_op(hint, TransactKind::Flush, op.as_bytes())
    }

    pub fn unmap(hint: u64, op: UnmapOp) -> Self {
        Self::with_op(hint, TransactKind::Unmap, op.as_bytes())
    }

    fn with_op(hint: u64, kind: TransactKind, op_bytes: &[u8]) -> Self {
        let mut req = Self::new_zeroed();
        req.hint = hint;
        req.kind = kind.into();
        req.op[..op_bytes.len()].copy_from_slice(op_bytes);
        req
    }

    /// True when this frame is a transport wakeup rather than a request.
    pub fn is_spurious(&self) -> bool {
        self.hint == 0
    }

    /// Decode the operand area according to `kind`.
    pub fn operation(&self) -> Result<Operation> {
        let kind = TransactKind::try_from(self.kind)?;
        let op = match kind {
            TransactKind::Read => Operation::Read(read_op(&self.op)?),
            TransactKind::Write => Operation::Write(read_op(&self.op)?),
            TransactKind::Flush => Operation::Flush(read_op(&self.op)?),
            TransactKind::Unmap => Operation::Unmap(read_op(&self.op)?),
        };
        Ok(op)
    }
}

fn read_op<T: FromBytes>(op: &[u8; 24]) -> Result<T> {
    T::read_from_prefix(op)
        .map(|(value, _)| value)
        .map_err(|_| ProtoError::InvalidLength {
            expected: core::mem::size_of::<T>(),
            actual: op.len(),
        })
}

/// 18-byte fixed-format sense data (SPC-3 §4.5.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SenseData {
    /// Response code 0x70/0x71; bit 7 marks the information field valid.
    pub response_code: u8,
    pub segment_number: u8,
    /// Sense key in the low nibble.
    pub sense_key: u8,
    /// Big-endian information field; carries the LBA of failure for medium
    /// errors.
    pub information: [u8; 4],
    pub additional_sense_length: u8,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        let mut sense = Self::new_zeroed();
        sense.response_code = scsi::SENSE_RESPONSE_CURRENT;
        sense.sense_key = sense_key & 0x0F;
        sense.additional_sense_length =
            (core::mem::size_of::<SenseData>() - SENSE_HEADER_LEN) as u8;
        sense.additional_sense_code = asc;
        sense.additional_sense_code_qualifier = ascq;
        sense
    }

    /// Attach the information field (low 32 bits of `info`, big-endian) and
    /// set the valid bit.
    pub fn with_information(mut self, info: u64) -> Self {
        self.response_code |= scsi::SENSE_INFORMATION_VALID;
        self.information = (info as u32).to_be_bytes();
        self
    }

    pub fn with_command_specific(mut self, value: u32) -> Self {
        self.command_specific_information = value.to_be_bytes();
        self
    }

    /// True when the information field carries a value.
    pub fn information_valid(&self) -> bool {
        self.response_code & scsi::SENSE_INFORMATION_VALID != 0
    }
}

const SENSE_HEADER_LEN: usize = 8;

/// SCSI completion status for one request: status byte plus sense payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StorageStatus {
    pub scsi_status: u8,
    pub sense_data: SenseData,
}

impl StorageStatus {
    pub fn good() -> Self {
        Self::new_zeroed()
    }

    pub fn check(sense_key: u8, asc: u8, ascq: u8) -> Self {
        Self {
            scsi_status: scsi::CHECK_CONDITION,
            sense_data: SenseData::new(sense_key, asc, ascq),
        }
    }

    /// CHECK CONDITION carrying the failing LBA in the information field.
    pub fn check_with_information(sense_key: u8, asc: u8, ascq: u8, info: u64) -> Self {
        Self {
            scsi_status: scsi::CHECK_CONDITION,
            sense_data: SenseData::new(sense_key, asc, ascq).with_information(info),
        }
    }

    /// In-place variant for handlers mutating a borrowed status.
    pub fn set_sense(&mut self, sense_key: u8, asc: u8, ascq: u8) {
        *self = Self::check(sense_key, asc, ascq);
    }

    pub fn set_sense_with_information(&mut self, sense_key: u8, asc: u8, ascq: u8, info: u64) {
        *self = Self::check_with_information(sense_key, asc, ascq, info);
    }

    pub fn is_good(&self) -> bool {
        self.scsi_status == scsi::GOOD
    }
}

/// Response frame submitted through transact; pairs with the request whose
/// `hint` it echoes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TransactRsp {
    pub hint: u64,
    pub kind: u32,
    pub status: StorageStatus,
    reserved: u8,
}

impl TransactRsp {
    /// Build a response echoing the request's `hint` and raw `kind`.
    pub fn new(hint: u64, kind: u32, status: StorageStatus) -> Self {
        let mut rsp = Self::new_zeroed();
        rsp.hint = hint;
        rsp.kind = kind;
        rsp.status = status;
        rsp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StorageUnitParams {
        let mut params = StorageUnitParams::new_zeroed();
        params.guid = Guid::from_bytes([1; 16]);
        params.block_count = 8;
        params.block_length = 512;
        params.max_transfer_length = 64 * 1024;
        params.max_unmap_descriptor_count = 16;
        params.product_id = *b"vlun disk       ";
        params.product_revision_level = *b"1.0 ";
        params
    }

    #[test]
    fn request_operation_round_trip() {
        let op = ReadOp {
            block_address: 42,
            block_count: 8,
            reserved: 0,
            address: 0xdead_beef,
        };
        let req = TransactReq::read(7, op);
        assert_eq!(req.hint, 7);
        assert_eq!(req.kind, u32::from(TransactKind::Read));
        assert_eq!(req.operation().unwrap(), Operation::Read(op));
    }

    #[test]
    fn request_survives_byte_copy() {
        let req = TransactReq::flush(
            9,
            FlushOp {
                block_address: 100,
                block_count: 4,
                reserved: 0,
            },
        );
        assert_eq!(req.as_bytes().len(), TRANSACT_REQ_LEN);
        let copy = TransactReq::read_from_bytes(req.as_bytes()).unwrap();
        assert_eq!(copy, req);
    }

    #[test]
    fn bad_kind_rejected() {
        let mut req = TransactReq::zeroed();
        req.hint = 1;
        req.kind = 99;
        assert_eq!(req.operation(), Err(ProtoError::InvalidKind(99)));
    }

    #[test]
    fn response_size_is_stable() {
        let rsp = TransactRsp::new(1, TransactKind::Write.into(), StorageStatus::good());
        assert_eq!(rsp.as_bytes().len(), TRANSACT_RSP_LEN);
    }

    #[test]
    fn btl_packing() {
        let btl = Btl::new(1, 2, 3);
        assert_eq!(btl.raw(), 0x0001_0203);
        assert_eq!((btl.bus(), btl.target(), btl.lun()), (1, 2, 3));
        assert_eq!(Btl::from_raw(btl.raw()), btl);
    }

    #[test]
    fn params_validate_accepts_sane_input() {
        params().validate().unwrap();
    }

    #[test]
    fn params_validate_rejects_bad_block_length() {
        for bad in [0u32, 3, 48, 256, 8192] {
            let mut p = params();
            p.block_length = bad;
            assert!(p.validate().is_err(), "block_length {bad} accepted");
        }
    }

    #[test]
    fn params_validate_rejects_misaligned_transfer_length() {
        let mut p = params();
        p.max_transfer_length = 513;
        assert!(p.validate().is_err());
        p.max_transfer_length = MAX_TRANSFER_LENGTH_CAP + 512;
        assert!(p.validate().is_err());
    }

    #[test]
    fn params_validate_rejects_capacity_overflow() {
        let mut p = params();
        p.block_count = u64::MAX / 256;
        assert!(p.validate().is_err());
    }

    #[test]
    fn params_validate_rejects_bad_ascii() {
        let mut p = params();
        p.product_id[0] = 0;
        assert!(p.validate().is_err());

        let mut p = params();
        p.product_revision_level = [0xFF, b' ', b' ', b' '];
        assert!(p.validate().is_err());
    }

    #[test]
    fn sense_layout_matches_fixed_format() {
        let sense = SenseData::new(scsi::SENSE_MEDIUM_ERROR, scsi::ASC_UNRECOVERED_READ, 0)
            .with_information(7);
        let bytes = sense.as_bytes();
        assert_eq!(bytes.len(), 18);
        assert_eq!(bytes[0], 0xF0); // current error + valid bit
        assert_eq!(bytes[2] & 0x0F, 0x03);
        assert_eq!(&bytes[3..7], &[0, 0, 0, 7]); // big-endian LBA
        assert_eq!(bytes[7], 10); // additional sense length
        assert_eq!(bytes[12], 0x11);
        assert_eq!(bytes[13], 0x00);
    }

    #[test]
    fn status_helpers() {
        let status = StorageStatus::good();
        assert!(status.is_good());
        assert_eq!(status.sense_data, SenseData::new_zeroed());

        let mut status = StorageStatus::good();
        status.set_sense(scsi::SENSE_ILLEGAL_REQUEST, scsi::ASC_INVALID_CDB, 0);
        assert_eq!(status.scsi_status, scsi::CHECK_CONDITION);
        assert_eq!(status.sense_data.sense_key, scsi::SENSE_ILLEGAL_REQUEST);
        assert!(!status.sense_data.information_valid());
    }

    #[test]
    fn unmap_descriptor_parses_from_packed_bytes() {
        let descriptors = [
            UnmapDescriptor {
                block_address: 10,
                block_count: 4,
                reserved: 0,
            },
            UnmapDescriptor {
                block_address: 99,
                block_count: 1,
                reserved: 0,
            },
        ];
        let mut packed = [0u8; 2 * UNMAP_DESCRIPTOR_LEN];
        packed[..UNMAP_DESCRIPTOR_LEN].copy_from_slice(descriptors[0].as_bytes());
        packed[UNMAP_DESCRIPTOR_LEN..].copy_from_slice(descriptors[1].as_bytes());
        let parsed: [UnmapDescriptor; 2] = [
            UnmapDescriptor::read_from_bytes(&packed[..UNMAP_DESCRIPTOR_LEN]).unwrap(),
            UnmapDescriptor::read_from_bytes(&packed[UNMAP_DESCRIPTOR_LEN..]).unwrap(),
        ];
        assert_eq!(parsed, descriptors);
    }
}
