// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Services of the device that commands act on: the model table, memory,
//! flash, firmware images, keys, GPIO and power control.
//!
//! The pipeline only depends on the [`DeviceServices`] trait; [`SimDevice`]
//! keeps everything in memory.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use npu_track::entity::Entity;
use npu_track::{debug, info, warn};

use crate::config::FirmwareIdentity;
use crate::error::ErrorCode;
use crate::framing::command::{ModelInfo, decode_model_table};
use crate::framing::legacy::{
    FirmwareTarget, LEGACY_AUTH_FAIL, LEGACY_DATA_ERROR, LEGACY_OK, SystemStatus,
};

/// DDR layout reported to the host.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DdrLayout {
    pub available_begin: u32,
    pub available_end: u32,
    pub model_end: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RebootKind {
    Reboot,
    Shutdown,
    RebootSystem,
}

/// Status of an eFuse key write, as reported by the key storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EfuseStatus {
    Ok,
    CannotBurn,
    Protected,
    Failed,
}

impl From<EfuseStatus> for ErrorCode {
    fn from(status: EfuseStatus) -> Self {
        match status {
            EfuseStatus::Ok => ErrorCode::Success,
            EfuseStatus::CannotBurn => ErrorCode::EfuseCanNotBurn,
            EfuseStatus::Protected => ErrorCode::EfuseProtected,
            EfuseStatus::Failed => ErrorCode::EfuseOther,
        }
    }
}

pub trait DeviceServices {
    fn identity(&self) -> FirmwareIdentity;

    /// The loaded model table; empty when no model is loaded.
    fn models(&self) -> Vec<ModelInfo>;

    fn find_model(&self, model_id: u32) -> Option<ModelInfo> {
        self.models().into_iter().find(|m| m.model_id == model_id)
    }

    /// Replace the model table from a firmware-info blob. Returns the number
    /// of models.
    fn reload_model_info(&self, fw_info: &[u8]) -> Result<usize, ErrorCode>;

    fn store_model_data(&self, data: &[u8]);

    fn load_model_from_flash(&self) -> Result<usize, ErrorCode>;

    /// The model table stored in flash, whether loaded or not.
    fn stored_models(&self) -> Vec<ModelInfo>;

    fn memory_read(&self, address: u32, length: usize) -> Result<Vec<u8>, ErrorCode>;

    fn memory_write(&self, address: u32, data: &[u8]) -> Result<(), ErrorCode>;

    fn flash_read(&self, offset: u32, length: usize) -> Result<Vec<u8>, ErrorCode>;

    fn flash_write(&self, offset: u32, data: &[u8]) -> Result<(), ErrorCode>;

    /// Whether `length` bytes at `address` lie inside DDR.
    fn check_memory_range(&self, address: u32, length: usize) -> Result<(), ErrorCode>;

    /// Whether `length` bytes at `offset` lie inside flash.
    fn check_flash_range(&self, offset: u32, length: usize) -> Result<(), ErrorCode>;

    fn load_firmware(&self, fw_type: u32, fw_start: u32, image: &[u8]) -> Result<(), ErrorCode>;

    fn update_firmware(&self, firmware_id: u32, image: &[u8]) -> Result<(), ErrorCode>;

    fn update_loader(&self, image: &[u8]) -> Result<(), ErrorCode>;

    fn load_nef(&self, nef: &[u8]) -> Result<(), ErrorCode>;

    fn update_nef(&self, nef: &[u8], auto_reboot: bool) -> Result<(), ErrorCode>;

    fn set_crypto_key(&self, key: u32) -> EfuseStatus;

    fn set_secure_boot_key(&self, entry: u32, key: u32) -> Result<(), ErrorCode>;

    fn set_gpio(&self, pin: u32, value: u32) -> Result<(), ErrorCode>;

    fn switch_boot_mode(&self, boot_mode: u32) -> Result<(), ErrorCode>;

    /// Reserve `size` bytes of DDR for debug checkpoint dumps. Reserving
    /// again once reserved succeeds without allocating.
    fn reserve_checkpoint_area(&self, size: usize) -> Result<(), ErrorCode>;

    fn ddr_layout(&self) -> DdrLayout;

    fn set_heap_boundary(&self, address: u32);

    fn reboot(&self, kind: RebootKind);

    fn system_status(&self) -> SystemStatus;

    /// Apply a firmware image received through the legacy protocol.
    /// Returns the legacy response code.
    fn legacy_update_firmware(&self, target: FirmwareTarget, image: &[u8]) -> u32;

    /// Apply models received through the legacy protocol. Returns the legacy
    /// response code.
    fn legacy_update_model(&self, fw_info: &[u8], models: &[u8]) -> u32;
}

const DDR_BASE: u32 = 0x6000_0000;
const DDR_SIZE: u32 = 64 * 1024 * 1024;
const MODEL_AREA_SIZE: u32 = 16 * 1024 * 1024;
const FLASH_SIZE: usize = 32 * 1024 * 1024;

/// An in-memory device.
pub struct SimDevice {
    pub entity: Rc<Entity>,
    identity: FirmwareIdentity,
    models: RefCell<Vec<ModelInfo>>,
    model_data: RefCell<Vec<u8>>,
    flash_models: RefCell<Option<(Vec<u8>, Vec<u8>)>>,
    ddr: RefCell<BTreeMap<u32, u8>>,
    flash: RefCell<Vec<u8>>,
    firmware: RefCell<BTreeMap<u32, usize>>,
    crypto_key: Cell<Option<u32>>,
    secure_boot_keys: RefCell<BTreeMap<u32, u32>>,
    gpio: RefCell<BTreeMap<u32, u32>>,
    boot_mode: Cell<u32>,
    heap_boundary: Cell<u32>,
    checkpoint_area: Cell<bool>,
    ddr_free: Cell<usize>,
    reboots: RefCell<Vec<RebootKind>>,
}

impl SimDevice {
    #[must_use]
    pub fn new(parent: &Rc<Entity>, identity: FirmwareIdentity) -> Rc<Self> {
        Rc::new(Self {
            entity: Rc::new(Entity::new(parent, "device")),
            identity,
            models: RefCell::new(Vec::new()),
            model_data: RefCell::new(Vec::new()),
            flash_models: RefCell::new(None),
            ddr: RefCell::new(BTreeMap::new()),
            flash: RefCell::new(Vec::new()),
            firmware: RefCell::new(BTreeMap::new()),
            crypto_key: Cell::new(None),
            secure_boot_keys: RefCell::new(BTreeMap::new()),
            gpio: RefCell::new(BTreeMap::new()),
            boot_mode: Cell::new(0),
            heap_boundary: Cell::new(DDR_BASE + DDR_SIZE),
            checkpoint_area: Cell::new(false),
            ddr_free: Cell::new((DDR_SIZE - MODEL_AREA_SIZE) as usize),
            reboots: RefCell::new(Vec::new()),
        })
    }

    /// Install a model table directly, as if a model had been loaded.
    pub fn install_models(&self, models: Vec<ModelInfo>) {
        *self.models.borrow_mut() = models;
    }

    /// Limit the DDR that is left for lazily allocated areas.
    pub fn set_ddr_free(&self, bytes: usize) {
        self.ddr_free.set(bytes);
    }

    #[must_use]
    pub fn model_data_len(&self) -> usize {
        self.model_data.borrow().len()
    }

    #[must_use]
    pub fn gpio(&self, pin: u32) -> Option<u32> {
        self.gpio.borrow().get(&pin).copied()
    }

    #[must_use]
    pub fn boot_mode(&self) -> u32 {
        self.boot_mode.get()
    }

    #[must_use]
    pub fn heap_boundary(&self) -> u32 {
        self.heap_boundary.get()
    }

    #[must_use]
    pub fn reboots(&self) -> Vec<RebootKind> {
        self.reboots.borrow().clone()
    }

    #[must_use]
    pub fn firmware_size(&self, firmware_id: u32) -> Option<usize> {
        self.firmware.borrow().get(&firmware_id).copied()
    }

}

impl DeviceServices for SimDevice {
    fn identity(&self) -> FirmwareIdentity {
        self.identity
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.borrow().clone()
    }

    fn reload_model_info(&self, fw_info: &[u8]) -> Result<usize, ErrorCode> {
        let models = decode_model_table(fw_info).map_err(|_| ErrorCode::LoadModelFailed)?;
        if models.is_empty() {
            return Err(ErrorCode::LoadModelFailed);
        }
        info!(self.entity ; "loaded {} models", models.len());
        let count = models.len();
        *self.models.borrow_mut() = models;
        Ok(count)
    }

    fn store_model_data(&self, data: &[u8]) {
        debug!(self.entity ; "stored {} bytes of model data", data.len());
        *self.model_data.borrow_mut() = data.to_vec();
    }

    fn load_model_from_flash(&self) -> Result<usize, ErrorCode> {
        let Some((fw_info, data)) = self.flash_models.borrow().clone() else {
            return Err(ErrorCode::LoadModelFailed);
        };
        let count = self.reload_model_info(&fw_info)?;
        self.store_model_data(&data);
        Ok(count)
    }

    fn stored_models(&self) -> Vec<ModelInfo> {
        self.flash_models
            .borrow()
            .as_ref()
            .and_then(|(fw_info, _)| decode_model_table(fw_info).ok())
            .unwrap_or_default()
    }

    fn memory_read(&self, address: u32, length: usize) -> Result<Vec<u8>, ErrorCode> {
        self.check_memory_range(address, length)?;
        let ddr = self.ddr.borrow();
        Ok((0..length as u32)
            .map(|i| ddr.get(&(address + i)).copied().unwrap_or(0))
            .collect())
    }

    fn memory_write(&self, address: u32, data: &[u8]) -> Result<(), ErrorCode> {
        self.check_memory_range(address, data.len())?;
        let mut ddr = self.ddr.borrow_mut();
        for (addr, byte) in (address..).zip(data) {
            ddr.insert(addr, *byte);
        }
        Ok(())
    }

    fn flash_read(&self, offset: u32, length: usize) -> Result<Vec<u8>, ErrorCode> {
        self.check_flash_range(offset, length)?;
        let flash = self.flash.borrow();
        let start = offset as usize;
        Ok((start..start + length)
            .map(|i| flash.get(i).copied().unwrap_or(0xFF))
            .collect())
    }

    fn check_memory_range(&self, address: u32, length: usize) -> Result<(), ErrorCode> {
        let ddr_end = u64::from(DDR_BASE) + u64::from(DDR_SIZE);
        match u64::from(address).checked_add(length as u64) {
            Some(end) if address >= DDR_BASE && end <= ddr_end => Ok(()),
            _ => Err(ErrorCode::InvalidParam),
        }
    }

    fn check_flash_range(&self, offset: u32, length: usize) -> Result<(), ErrorCode> {
        match (offset as usize).checked_add(length) {
            Some(end) if end <= FLASH_SIZE => Ok(()),
            _ => Err(ErrorCode::InvalidParam),
        }
    }

    fn flash_write(&self, offset: u32, data: &[u8]) -> Result<(), ErrorCode> {
        self.check_flash_range(offset, data.len())?;
        let mut flash = self.flash.borrow_mut();
        let start = offset as usize;
        if flash.len() < start + data.len() {
            flash.resize(start + data.len(), 0xFF);
        }
        flash[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn load_firmware(&self, fw_type: u32, fw_start: u32, image: &[u8]) -> Result<(), ErrorCode> {
        if image.is_empty() {
            return Err(ErrorCode::InvalidFirmware);
        }
        info!(self.entity ; "firmware type {fw_type} loaded at {fw_start:#x} ({} bytes)", image.len());
        self.firmware.borrow_mut().insert(fw_type, image.len());
        Ok(())
    }

    fn update_firmware(&self, firmware_id: u32, image: &[u8]) -> Result<(), ErrorCode> {
        if image.is_empty() {
            return Err(ErrorCode::FwUpdateFailed);
        }
        info!(self.entity ; "firmware {firmware_id} updated ({} bytes)", image.len());
        self.firmware.borrow_mut().insert(firmware_id, image.len());
        Ok(())
    }

    fn update_loader(&self, image: &[u8]) -> Result<(), ErrorCode> {
        if image.is_empty() {
            return Err(ErrorCode::LoaderError);
        }
        info!(self.entity ; "loader updated ({} bytes)", image.len());
        Ok(())
    }

    fn load_nef(&self, nef: &[u8]) -> Result<(), ErrorCode> {
        if nef.is_empty() {
            return Err(ErrorCode::LoadModelFailed);
        }
        self.store_model_data(nef);
        Ok(())
    }

    fn update_nef(&self, nef: &[u8], auto_reboot: bool) -> Result<(), ErrorCode> {
        if nef.is_empty() {
            return Err(ErrorCode::LoadModelFailed);
        }
        self.flash_write(0, nef)?;
        if auto_reboot {
            self.reboot(RebootKind::Reboot);
        }
        Ok(())
    }

    fn set_crypto_key(&self, key: u32) -> EfuseStatus {
        if self.crypto_key.get().is_some() {
            warn!(self.entity ; "crypto key already burned");
            return EfuseStatus::Protected;
        }
        self.crypto_key.set(Some(key));
        EfuseStatus::Ok
    }

    fn set_secure_boot_key(&self, entry: u32, key: u32) -> Result<(), ErrorCode> {
        let mut keys = self.secure_boot_keys.borrow_mut();
        if keys.contains_key(&entry) {
            return Err(ErrorCode::EfuseProtected);
        }
        keys.insert(entry, key);
        Ok(())
    }

    fn set_gpio(&self, pin: u32, value: u32) -> Result<(), ErrorCode> {
        if pin >= 32 {
            return Err(ErrorCode::InvalidParam);
        }
        self.gpio.borrow_mut().insert(pin, value);
        Ok(())
    }

    fn switch_boot_mode(&self, boot_mode: u32) -> Result<(), ErrorCode> {
        if boot_mode > 3 {
            return Err(ErrorCode::InvalidBootConfig);
        }
        self.boot_mode.set(boot_mode);
        Ok(())
    }

    fn reserve_checkpoint_area(&self, size: usize) -> Result<(), ErrorCode> {
        if self.checkpoint_area.get() {
            return Ok(());
        }
        if self.ddr_free.get() < size {
            warn!(self.entity ; "no DDR left for a {size} byte checkpoint area");
            return Err(ErrorCode::DdrMallocFailed);
        }
        self.ddr_free.set(self.ddr_free.get() - size);
        self.checkpoint_area.set(true);
        Ok(())
    }

    fn ddr_layout(&self) -> DdrLayout {
        DdrLayout {
            available_begin: DDR_BASE + MODEL_AREA_SIZE,
            available_end: self.heap_boundary.get(),
            model_end: DDR_BASE + MODEL_AREA_SIZE,
        }
    }

    fn set_heap_boundary(&self, address: u32) {
        debug!(self.entity ; "heap boundary moved to {address:#x}");
        self.heap_boundary.set(address);
    }

    fn reboot(&self, kind: RebootKind) {
        info!(self.entity ; "{kind:?}");
        self.reboots.borrow_mut().push(kind);
    }

    fn system_status(&self) -> SystemStatus {
        let packed = self.identity.version().to_words()[0];
        SystemStatus {
            scpu_firmware_id: packed,
            scpu_build_id: self.identity.build,
            sys_status: 0,
            app_status: 0,
            ncpu_firmware_id: packed,
            ncpu_build_id: self.identity.build,
        }
    }

    fn legacy_update_firmware(&self, target: FirmwareTarget, image: &[u8]) -> u32 {
        if image.len() != target.image_size() {
            return LEGACY_DATA_ERROR;
        }
        match self.update_firmware(target as u32, image) {
            Ok(()) => LEGACY_OK,
            Err(_) => LEGACY_AUTH_FAIL,
        }
    }

    fn legacy_update_model(&self, fw_info: &[u8], models: &[u8]) -> u32 {
        if decode_model_table(fw_info).is_err() || models.is_empty() {
            return LEGACY_DATA_ERROR;
        }
        *self.flash_models.borrow_mut() = Some((fw_info.to_vec(), models.to_vec()));
        LEGACY_OK
    }
}

#[cfg(test)]
mod tests {
    use npu_track::entity::toplevel;
    use npu_track::tracker::dev_null_tracker;

    use super::*;
    use crate::framing::command::encode_model_table;

    fn device() -> Rc<SimDevice> {
        let top = toplevel(&dev_null_tracker(), "top");
        SimDevice::new(&top, FirmwareIdentity::default())
    }

    #[test]
    fn memory_window_is_bounded() {
        let device = device();
        device.memory_write(DDR_BASE + 4, &[1, 2, 3]).unwrap();
        assert_eq!(device.memory_read(DDR_BASE + 3, 5), Ok(vec![0, 1, 2, 3, 0]));
        assert_eq!(device.memory_read(0, 4), Err(ErrorCode::InvalidParam));
    }

    #[test]
    fn ranges_at_the_edge_of_u32_are_refused() {
        let device = device();
        assert_eq!(
            device.check_memory_range(DDR_BASE, u32::MAX as usize),
            Err(ErrorCode::InvalidParam)
        );
        assert_eq!(device.check_memory_range(u32::MAX, 1), Err(ErrorCode::InvalidParam));
        assert_eq!(device.check_memory_range(DDR_BASE, DDR_SIZE as usize), Ok(()));
        assert_eq!(device.check_flash_range(0, usize::MAX), Err(ErrorCode::InvalidParam));
        assert_eq!(device.check_flash_range(0, FLASH_SIZE), Ok(()));
        assert_eq!(device.check_flash_range(1, FLASH_SIZE), Err(ErrorCode::InvalidParam));
    }

    #[test]
    fn models_from_flash_need_a_prior_update() {
        let device = device();
        assert_eq!(device.load_model_from_flash(), Err(ErrorCode::LoadModelFailed));

        let table = encode_model_table(&[ModelInfo {
            model_id: 19,
            input_count: 1,
            width: 224,
            height: 224,
            channels: 3,
            output_size: 1000,
        }]);
        assert_eq!(device.legacy_update_model(&table, &[0; 64]), LEGACY_OK);
        assert_eq!(device.load_model_from_flash(), Ok(1));
        assert!(device.find_model(19).is_some());
        assert_eq!(device.model_data_len(), 64);
    }

    #[test]
    fn crypto_key_burns_once() {
        let device = device();
        assert_eq!(device.set_crypto_key(7), EfuseStatus::Ok);
        assert_eq!(
            ErrorCode::from(device.set_crypto_key(8)),
            ErrorCode::EfuseProtected
        );
    }

    #[test]
    fn checkpoint_area_needs_free_ddr() {
        let device = device();
        device.set_ddr_free(1024);
        assert_eq!(
            device.reserve_checkpoint_area(8 * 1024 * 1024),
            Err(ErrorCode::DdrMallocFailed)
        );
        device.set_ddr_free(16 * 1024 * 1024);
        assert_eq!(device.reserve_checkpoint_area(8 * 1024 * 1024), Ok(()));
        assert_eq!(device.reserve_checkpoint_area(8 * 1024 * 1024), Ok(()));
    }
}
