//! In-memory disk served through the kernel transport.
//!
//! Provisions a 64 MiB RAM-backed unit, runs one dispatcher worker per CPU,
//! and tears down on ctrl-c through the shutdown guard.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing::info;
use vlun_core::{
    Guard, HandlerOutcome, ServiceErrorKind, StorageUnit, StorageUnitInterface,
};
use vlun_proto::{scsi, Guid, StorageStatus, StorageUnitParams, UnmapDescriptor};

struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    block_length: u32,
}

impl RamDisk {
    fn new(block_count: u64, block_length: u32) -> Self {
        Self {
            blocks: Mutex::new(vec![0u8; (block_count * block_length as u64) as usize]),
            block_length,
        }
    }

    fn range(&self, block_address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let total = self.blocks.lock().unwrap().len() as u64;
        let start = block_address.checked_mul(self.block_length as u64)?;
        let end = start.checked_add(len as u64)?;
        (end <= total).then(|| start as usize..end as usize)
    }
}

impl StorageUnitInterface for RamDisk {
    fn read(
        &self,
        _unit: &StorageUnit,
        block_address: u64,
        buffer: &mut [u8],
        _block_count: u32,
        status: &mut StorageStatus,
    ) -> HandlerOutcome {
        match self.range(block_address, buffer.len()) {
            Some(range) => buffer.copy_from_slice(&self.blocks.lock().unwrap()[range]),
            None => status.set_sense_with_information(
                scsi::SENSE_ILLEGAL_REQUEST,
                scsi::ASC_ILLEGAL_BLOCK,
                0,
                block_address,
            ),
        }
        HandlerOutcome::Complete
    }

    fn write(
        &self,
        _unit: &StorageUnit,
        block_address: u64,
        buffer: &[u8],
        _block_count: u32,
        status: &mut StorageStatus,
    ) -> HandlerOutcome {
        match self.range(block_address, buffer.len()) {
            Some(range) => self.blocks.lock().unwrap()[range].copy_from_slice(buffer),
            None => status.set_sense_with_information(
                scsi::SENSE_ILLEGAL_REQUEST,
                scsi::ASC_ILLEGAL_BLOCK,
                0,
                block_address,
            ),
        }
        HandlerOutcome::Complete
    }

    fn flush(
        &self,
        _unit: &StorageUnit,
        _block_address: u64,
        _block_count: u32,
        _status: &mut StorageStatus,
    ) -> HandlerOutcome {
        // Memory is always durable as far as this disk is concerned.
        HandlerOutcome::Complete
    }

    fn unmap(
        &self,
        _unit: &StorageUnit,
        descriptors: &[UnmapDescriptor],
        _status: &mut StorageStatus,
    ) -> HandlerOutcome {
        let mut blocks = self.blocks.lock().unwrap();
        let total = blocks.len() as u64;
        for descriptor in descriptors {
            let start = descriptor.block_address * self.block_length as u64;
            let end = start + descriptor.block_count as u64 * self.block_length as u64;
            if end <= total {
                blocks[start as usize..end as usize].fill(0);
            }
        }
        HandlerOutcome::Complete
    }
}

static SHUTDOWN: Guard<StorageUnit> = Guard::new();

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let block_count: u64 = 128 * 1024;
    let block_length: u32 = 512;
    let params = StorageUnitParams {
        guid: Guid::from_bytes(*b"vlun-ramdisk-001"),
        block_count,
        block_length,
        max_transfer_length: 64 * 1024,
        max_unmap_descriptor_count: 256,
        write_protected: 0,
        cache_supported: 0,
        unmap_supported: 1,
        eject_disabled: 0,
        product_id: *b"vlun ramdisk    ",
        product_revision_level: *b"1.0 ",
        reserved: [0; 4],
    };

    let disk = RamDisk::new(block_count, block_length);
    let unit = StorageUnit::create(params, Some(Arc::new(disk))).context("create storage unit")?;

    SHUTDOWN.set(Some(Arc::clone(&unit)));
    ctrlc::set_handler(|| {
        SHUTDOWN.execute(|unit| unit.shutdown());
    })
    .context("install ctrl-c handler")?;

    unit.start_dispatcher(0).context("start dispatcher")?;
    info!(btl = %unit.btl(), guid = %unit.guid(), "ramdisk online");

    let result = unit.wait_dispatcher();
    SHUTDOWN.set(None);
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ServiceErrorKind::Cancelled => {
            info!("ramdisk stopped");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
