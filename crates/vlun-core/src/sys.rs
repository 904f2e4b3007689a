//! UAPI for the vlun control device.
//!
//! One repr(C) payload struct per ioctl, mirrored by the kernel driver.
//! Request codes are built from the `'V'` magic; renumbering any of them is
//! an ABI break.

#![allow(dead_code)]

use nix::{ioctl_readwrite, ioctl_write_ptr};
use vlun_proto::{StorageUnitParams, TransactReq, TransactRsp};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const VLUN_IOC_MAGIC: u8 = b'V';

/// Maximum LUNs reported by one LIST call.
pub const LIST_MAX: usize = 256;

/// The `response` field of [`TransactMsg`] is populated.
pub const TRANSACT_RSP_VALID: u32 = 1 << 0;
/// The caller wants a request back; `request` is populated on return.
pub const TRANSACT_REQ_VALID: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ProvisionMsg {
    pub params: StorageUnitParams,
    /// Out: assigned bus/target/LUN.
    pub btl: u32,
    pub reserved: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UnprovisionMsg {
    pub btl: u32,
    pub reserved: u32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ListMsg {
    /// Out: number of valid entries in `btls`.
    pub count: u32,
    pub btls: [u32; LIST_MAX],
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TransactMsg {
    pub btl: u32,
    pub flags: u32,
    /// User-space pointer to the payload buffer shared by both directions.
    pub data_buffer: u64,
    pub data_length: u32,
    pub reserved: u32,
    pub response: TransactRsp,
    /// Out: next request when [`TRANSACT_REQ_VALID`] was set.
    pub request: TransactReq,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SetTransactTimeoutMsg {
    pub btl: u32,
    pub timeout_ms: u32,
}

ioctl_readwrite!(vlun_provision, VLUN_IOC_MAGIC, 0x01, ProvisionMsg);
ioctl_write_ptr!(vlun_unprovision, VLUN_IOC_MAGIC, 0x02, UnprovisionMsg);
ioctl_readwrite!(vlun_list, VLUN_IOC_MAGIC, 0x03, ListMsg);
ioctl_readwrite!(vlun_transact, VLUN_IOC_MAGIC, 0x04, TransactMsg);
ioctl_write_ptr!(vlun_set_transact_timeout, VLUN_IOC_MAGIC, 0x05, SetTransactTimeoutMsg);
