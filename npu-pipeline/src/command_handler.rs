// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Execute bulk commands.
//!
//! The receive loop hands every command message (in either framing) to the
//! [`CommandHandler`] and waits for it to finish. Replies go straight to the
//! data-in endpoint, and any data that follows a command (model images,
//! memory contents) is read from the data-out endpoint here, so commands
//! never touch the queues.

use std::rc::Rc;

use npu_engine::time::timeout::Timeout;
use npu_track::entity::Entity;
use npu_track::{debug, info, trace, warn};

use crate::config::CHECKPOINT_AREA_SIZE;
use crate::context::PipelineContext;
use crate::device::RebootKind;
use crate::error::{ErrorCode, TransportError};
use crate::fifoq::FifoqConfig;
use crate::framing::command::{Command, CommandError, encode_model_table, response};
use crate::framing::legacy::{
    ACK_PACKET, FirmwareTarget, LEGACY_DATA_ERROR, LEGACY_OK, LEGACY_REPLY_SIZE, LegacyRequest,
    firmware_update_response, kn_number_response, model_update_response,
};

/// Largest single read of command data.
const RECEIVE_CHUNK_SIZE: usize = 64 * 1024;

pub struct CommandHandler {
    pub entity: Rc<Entity>,
    ctx: Rc<PipelineContext>,
}

impl CommandHandler {
    #[must_use]
    pub fn new(ctx: &Rc<PipelineContext>) -> Self {
        Self {
            entity: Rc::new(Entity::new(&ctx.entity, "commands")),
            ctx: ctx.clone(),
        }
    }

    fn data_timeout(&self) -> Timeout {
        Timeout::Ticks(self.ctx.config.command_data_timeout_ticks)
    }

    fn model_timeout(&self) -> Timeout {
        Timeout::Ticks(self.ctx.config.model_data_timeout_ticks)
    }

    async fn reply(&self, bytes: &[u8]) {
        if let Err(e) = self.ctx.transport.write(bytes, Timeout::Forever).await {
            warn!(self.entity ; "reply lost: {e}");
        }
    }

    async fn reply_code(&self, code: ErrorCode) {
        self.reply(&response(code, &[])).await;
    }

    /// Read up to `len` bytes that follow a command, passing each transfer
    /// to `sink`. Stops early when the host stops sending for longer than
    /// `timeout`, and returns the number of bytes read.
    async fn read_payload(
        &self,
        len: usize,
        timeout: Timeout,
        mut sink: impl FnMut(&[u8]),
    ) -> Result<usize, TransportError> {
        let mut chunk = vec![0; len.min(RECEIVE_CHUNK_SIZE)];
        let mut received = 0;
        while received < len {
            let want = chunk.len().min(len - received);
            match self.ctx.transport.read(&mut chunk[..want], timeout).await {
                Ok(n) => {
                    sink(&chunk[..n]);
                    received += n;
                }
                Err(TransportError::Timeout) => {
                    warn!(self.entity ; "timed out after {received} of {len} bytes");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(received)
    }

    /// Read up to `len` bytes that follow a command. Fewer bytes are
    /// returned when the host stops sending for longer than `timeout`.
    async fn receive_data(&self, len: usize, timeout: Timeout) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::new();
        let received = self
            .read_payload(len, timeout, |bytes| data.extend_from_slice(bytes))
            .await?;
        trace!(self.entity ; "received {received} bytes of data");
        Ok(data)
    }

    /// Skip the data that follows a refused command.
    async fn discard_data(&self, len: usize, timeout: Timeout) {
        match self.read_payload(len, timeout, |_| ()).await {
            Ok(skipped) => {
                debug!(self.entity ; "discarded {skipped} bytes of data");
            }
            Err(e) => {
                warn!(self.entity ; "discarding data failed: {e}");
            }
        }
    }

    /// Read exactly `len` bytes, reporting a short transfer as a size
    /// mismatch.
    async fn receive_exact(&self, len: usize, timeout: Timeout) -> Result<Vec<u8>, ErrorCode> {
        let data = self.receive_data(len, timeout).await?;
        if data.len() == len {
            Ok(data)
        } else {
            Err(ErrorCode::ReceiveSizeMismatch)
        }
    }

    /// Execute one command in the newer framing.
    pub async fn handle(&self, bytes: &[u8]) {
        let command = match Command::decode(bytes) {
            Ok(command) => command,
            Err(CommandError::Unknown(id)) => {
                warn!(self.entity ; "unknown command {id:#x}");
                return;
            }
            Err(CommandError::Frame(e)) => {
                warn!(self.entity ; "malformed command: {e}");
                self.reply_code(ErrorCode::InvalidParam).await;
                return;
            }
        };
        debug!(self.entity ; "{:?}", command.id());
        self.execute(command).await;
    }

    async fn execute(&self, command: Command) {
        let device = &self.ctx.device;
        match command {
            Command::LoadModel { model_size, fw_info } => {
                if let Err(code) = device.reload_model_info(&fw_info) {
                    self.reply_code(code).await;
                    return;
                }
                self.reply_code(ErrorCode::Success).await;
                match self
                    .receive_exact(model_size as usize, self.model_timeout())
                    .await
                {
                    Ok(data) => device.store_model_data(&data),
                    Err(code) => warn!(self.entity ; "model data not received: {code}"),
                }
            }
            Command::MemoryRead {
                start_address,
                length,
            } => match device.memory_read(start_address, length as usize) {
                Ok(data) => {
                    self.reply_code(ErrorCode::Success).await;
                    self.reply(&data).await;
                }
                Err(code) => self.reply_code(code).await,
            },
            Command::MemoryWrite {
                start_address,
                length,
            } => {
                let length = length as usize;
                let code = if let Err(code) = device.check_memory_range(start_address, length) {
                    self.discard_data(length, self.data_timeout()).await;
                    code
                } else {
                    match self.receive_exact(length, self.data_timeout()).await {
                        Ok(data) => status(device.memory_write(start_address, &data)),
                        Err(code) => code,
                    }
                };
                self.reply_code(code).await;
            }
            Command::GetSystemInfo => {
                let identity = device.identity();
                let [version, build] = identity.version().to_words();
                self.reply(&response(
                    ErrorCode::Success,
                    &[identity.kn_number, version, build],
                ))
                .await;
            }
            Command::GetModelInfo { from_ddr } => {
                let models = if from_ddr {
                    device.models()
                } else {
                    device.stored_models()
                };
                if models.is_empty() {
                    self.reply_code(ErrorCode::GetModelInfoFailed).await;
                    return;
                }
                let table = encode_model_table(&models);
                self.reply(&response(
                    ErrorCode::Success,
                    &[table.len() as u32, device.identity().target_chip],
                ))
                .await;
                self.reply(&table).await;
            }
            Command::LoadFirmware {
                fw_type,
                fw_start,
                fw_size,
            } => {
                let code = match self.receive_exact(fw_size as usize, self.model_timeout()).await {
                    Ok(image) => status(device.load_firmware(fw_type, fw_start, &image)),
                    Err(code) => code,
                };
                self.reply_code(code).await;
            }
            Command::LoadModelFromFlash => {
                let code = status(device.load_model_from_flash().map(|_| ()));
                self.reply_code(code).await;
            }
            Command::SetCryptoKey { key } => {
                self.reply_code(device.set_crypto_key(key).into()).await;
            }
            Command::SetSecureBootKey { entry, key } => {
                self.reply_code(status(device.set_secure_boot_key(entry, key)))
                    .await;
            }
            Command::SetGpio { pin, value } => {
                self.reply_code(status(device.set_gpio(pin, value))).await;
            }
            Command::SetDebugCheckpoint { flags, enable } => {
                if enable {
                    if let Err(code) = device.reserve_checkpoint_area(CHECKPOINT_AREA_SIZE) {
                        self.reply_code(code).await;
                        return;
                    }
                }
                self.reply_code(ErrorCode::Success).await;
                self.ctx.set_checkpoints(flags, enable);
            }
            Command::SetProfileEnable { enable } => {
                self.ctx.set_profiling(enable);
                self.reply_code(ErrorCode::Success).await;
            }
            Command::GetProfileStatistics => {
                let stats = self.ctx.profile();
                self.reply(&response(ErrorCode::Success, &stats.words()))
                    .await;
            }
            Command::GetDdrConfig => {
                let layout = device.ddr_layout();
                self.reply(&response(
                    ErrorCode::Success,
                    &[
                        layout.available_begin,
                        layout.available_end,
                        layout.model_end,
                        u32::from(self.ctx.fifoq.is_allocated()),
                    ],
                ))
                .await;
            }
            Command::LoadNef { nef_size } => {
                let code = match self.receive_exact(nef_size as usize, self.model_timeout()).await {
                    Ok(nef) => status(device.load_nef(&nef)),
                    Err(code) => code,
                };
                self.reply_code(code).await;
            }
            Command::UpdateFirmware {
                firmware_id,
                firmware_size,
            } => {
                let code = match self
                    .receive_exact(firmware_size as usize, self.model_timeout())
                    .await
                {
                    Ok(image) => status(device.update_firmware(firmware_id, &image)),
                    Err(code) => code,
                };
                self.reply_code(code).await;
            }
            Command::SwitchBootMode { boot_mode } => {
                self.reply_code(status(device.switch_boot_mode(boot_mode)))
                    .await;
            }
            Command::UpdateLoader { loader_size } => {
                let code = match self
                    .receive_exact(loader_size as usize, self.model_timeout())
                    .await
                {
                    Ok(image) => status(device.update_loader(&image)),
                    Err(code) => code,
                };
                self.reply_code(code).await;
            }
            Command::GetFifoqConfig => {
                let config = self.ctx.fifoq.config().unwrap_or(FifoqConfig::default());
                self.reply(&response(
                    ErrorCode::Success,
                    &[
                        config.image_count as u32,
                        config.image_size as u32,
                        config.result_count as u32,
                        config.result_size as u32,
                    ],
                ))
                .await;
            }
            Command::SetPerformanceMonitor { enable } => {
                self.ctx.set_perf_monitor(enable);
                self.reply_code(ErrorCode::Success).await;
            }
            Command::GetPerformanceMonitorStatistics => {
                let stats = self.ctx.perf_monitor();
                self.reply(&response(ErrorCode::Success, &stats.words()))
                    .await;
            }
            Command::UpdateNef {
                nef_size,
                auto_reboot,
            } => {
                let code = match self.receive_exact(nef_size as usize, self.model_timeout()).await {
                    Ok(nef) => status(device.update_nef(&nef, auto_reboot)),
                    Err(code) => code,
                };
                self.reply_code(code).await;
            }
            Command::ReadFlash { offset, length } => {
                match device.flash_read(offset, length as usize) {
                    Ok(data) => {
                        self.reply_code(ErrorCode::Success).await;
                        self.reply(&data).await;
                    }
                    Err(code) => self.reply_code(code).await,
                }
            }
            Command::WriteFlash { offset, length } => {
                let length = length as usize;
                let code = if let Err(code) = device.check_flash_range(offset, length) {
                    self.discard_data(length, self.data_timeout()).await;
                    code
                } else {
                    match self.receive_exact(length, self.data_timeout()).await {
                        Ok(data) => status(device.flash_write(offset, &data)),
                        Err(code) => code,
                    }
                };
                self.reply_code(code).await;
            }
        }
    }

    /// Execute one command in the legacy framing.
    pub async fn handle_legacy(&self, bytes: &[u8]) {
        let request = match LegacyRequest::decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(self.entity ; "malformed legacy command: {e}");
                self.reply(&[0; LEGACY_REPLY_SIZE]).await;
                return;
            }
        };
        debug!(self.entity ; "legacy {request:?}");

        let device = &self.ctx.device;
        match request {
            LegacyRequest::SystemStatus => {
                self.reply(&device.system_status().encode()).await;
            }
            LegacyRequest::GetKnNumber => {
                self.reply(&kn_number_response(device.identity().kn_number))
                    .await;
            }
            LegacyRequest::UpdateFirmware { fw_id, auto_reboot } => {
                let Some(target) = FirmwareTarget::from_id(fw_id) else {
                    warn!(self.entity ; "no firmware with id {fw_id}");
                    self.reply(&[0; LEGACY_REPLY_SIZE]).await;
                    return;
                };
                self.reply(&ACK_PACKET).await;
                let code = match self
                    .receive_data(target.image_size(), self.model_timeout())
                    .await
                {
                    Ok(image) => device.legacy_update_firmware(target, &image),
                    Err(_) => LEGACY_DATA_ERROR,
                };
                info!(self.entity ; "{target:?} firmware update finished with {code}");
                self.reply(&firmware_update_response(code, fw_id)).await;
                if code == LEGACY_OK && auto_reboot {
                    device.reboot(RebootKind::Reboot);
                }
            }
            LegacyRequest::UpdateModel {
                fw_info_size,
                all_models_size,
                auto_reboot,
            } => {
                self.reply(&ACK_PACKET).await;
                let code = match self.receive_legacy_models(fw_info_size, all_models_size).await {
                    Some((fw_info, models)) => device.legacy_update_model(&fw_info, &models),
                    None => LEGACY_DATA_ERROR,
                };
                info!(self.entity ; "model update finished with {code}");
                self.reply(&model_update_response(code)).await;
                if code == LEGACY_OK && auto_reboot {
                    device.reboot(RebootKind::Reboot);
                }
            }
            LegacyRequest::Unsupported(cmd) => {
                warn!(self.entity ; "legacy command {cmd:#x} not supported");
                self.reply(&[0; LEGACY_REPLY_SIZE]).await;
            }
        }
    }

    async fn receive_legacy_models(
        &self,
        fw_info_size: u32,
        all_models_size: u32,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let timeout = self.model_timeout();
        let fw_info = self
            .receive_exact(fw_info_size as usize, timeout)
            .await
            .ok()?;
        let models = self
            .receive_exact(all_models_size as usize, timeout)
            .await
            .ok()?;
        Some((fw_info, models))
    }
}

fn status(result: Result<(), ErrorCode>) -> ErrorCode {
    result.err().unwrap_or(ErrorCode::Success)
}
