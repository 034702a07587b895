// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! Inference requests and results.
//!
//! Both built-in applications frame each input buffer as a header followed
//! by the image bytes, and answer with a [`ResultHeader`] followed by the
//! raw accelerator output.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::buffer::MAX_BUFFERS_PER_OBJECT;
use crate::framing::header::{HEADER_STAMP_SIZE, HeaderStamp};
use crate::framing::{FrameError, WireReader, put_u32};

/// Job id of the generic raw inference application.
pub const JOB_GENERIC_RAW: u32 = 10;

/// Job id of the generic raw inference with bypassed pre-processing.
pub const JOB_GENERIC_RAW_BYPASS: u32 = 17;

pub const MAX_CROP_BOX: usize = 4;

const CROP_BOX_SIZE: usize = 20;
const IMAGE_HEADER_SIZE: usize = 28 + MAX_CROP_BOX * CROP_BOX_SIZE;
const PRE_PROC_INFO_SIZE: usize = 40 + CROP_BOX_SIZE;

/// Size of a generic raw request header.
pub const GENERIC_RAW_HEADER_SIZE: usize = HEADER_STAMP_SIZE + 8 + IMAGE_HEADER_SIZE;

/// Size of a bypass request header.
pub const BYPASS_HEADER_SIZE: usize = HEADER_STAMP_SIZE + 12;

/// Size of a result header, whatever the number of inputs.
pub const RESULT_HEADER_SIZE: usize =
    HEADER_STAMP_SIZE + 4 + MAX_BUFFERS_PER_OBJECT * PRE_PROC_INFO_SIZE + 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum ResizeMode {
    Disable = 1,
    Enable = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum PaddingMode {
    Disable = 1,
    Corner = 2,
    Symmetric = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum ImageFormat {
    Rgba8888 = 0x0D,
    Raw8 = 0x20,
    Yuyv = 0x2F,
    YCbCr422CrY1CbY0 = 0x30,
    YCbCr422CbY1CrY0 = 0x31,
    YCbCr422Y1CrY0Cb = 0x32,
    YCbCr422Y1CbY0Cr = 0x33,
    YCbCr422CrY0CbY1 = 0x34,
    YCbCr422CbY0CrY1 = 0x35,
    YCbCr422Y0CrY1Cb = 0x36,
    YCbCr422Y0CbY1Cr = 0x37,
    Rgb565 = 0x60,
}

impl ImageFormat {
    #[must_use]
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Rgba8888 => 4,
            ImageFormat::Raw8 => 1,
            _ => 2,
        }
    }

    /// The format the accelerator is configured with. YUYV is the same
    /// byte order as `Y0 Cb Y1 Cr`.
    #[must_use]
    pub fn hardware_format(self) -> Self {
        match self {
            ImageFormat::Yuyv => ImageFormat::YCbCr422Y0CbY1Cr,
            other => other,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum NormalizeMode {
    Kneron = 1,
    Tensorflow = 2,
    Yolo = 3,
    CustomizedDefault = 4,
    CustomizedSub128 = 5,
    CustomizedDiv2 = 6,
    CustomizedSub128Div2 = 7,
    Disable = 0xFF,
}

impl NormalizeMode {
    /// `(subtract 128, shift right by one)` as applied by the accelerator.
    #[must_use]
    pub fn hardware_flags(self) -> (bool, bool) {
        match self {
            NormalizeMode::Kneron | NormalizeMode::Tensorflow | NormalizeMode::CustomizedSub128 => {
                (true, false)
            }
            NormalizeMode::Yolo | NormalizeMode::CustomizedDiv2 => (false, true),
            NormalizeMode::CustomizedSub128Div2 => (true, true),
            NormalizeMode::CustomizedDefault | NormalizeMode::Disable => (false, false),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CropBox {
    pub crop_number: u32,
    pub x1: u32,
    pub y1: u32,
    pub width: u32,
    pub height: u32,
}

impl CropBox {
    fn read(r: &mut WireReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            crop_number: r.u32()?,
            x1: r.u32()?,
            y1: r.u32()?,
            width: r.u32()?,
            height: r.u32()?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        for word in [self.crop_number, self.x1, self.y1, self.width, self.height] {
            put_u32(out, word);
        }
    }
}

/// Description of one input image. Mode fields keep their wire values;
/// the typed accessors return `None` for values the device does not know.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub resize_mode: u32,
    pub padding_mode: u32,
    pub image_format: u32,
    pub normalize_mode: u32,
    pub crop_count: u32,
    pub crops: [CropBox; MAX_CROP_BOX],
}

impl ImageHeader {
    #[must_use]
    pub fn resize(&self) -> Option<ResizeMode> {
        ResizeMode::from_u32(self.resize_mode)
    }

    #[must_use]
    pub fn padding(&self) -> Option<PaddingMode> {
        PaddingMode::from_u32(self.padding_mode)
    }

    #[must_use]
    pub fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_u32(self.image_format)
    }

    #[must_use]
    pub fn normalize(&self) -> Option<NormalizeMode> {
        NormalizeMode::from_u32(self.normalize_mode)
    }

    /// The first crop box, if cropping was requested.
    #[must_use]
    pub fn crop(&self) -> Option<CropBox> {
        (self.crop_count > 0).then_some(self.crops[0])
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, FrameError> {
        let mut header = Self {
            width: r.u32()?,
            height: r.u32()?,
            resize_mode: r.u32()?,
            padding_mode: r.u32()?,
            image_format: r.u32()?,
            normalize_mode: r.u32()?,
            crop_count: r.u32()?,
            crops: [CropBox::default(); MAX_CROP_BOX],
        };
        for crop in &mut header.crops {
            *crop = CropBox::read(r)?;
        }
        Ok(header)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        for word in [
            self.width,
            self.height,
            self.resize_mode,
            self.padding_mode,
            self.image_format,
            self.normalize_mode,
            self.crop_count,
        ] {
            put_u32(out, word);
        }
        for crop in &self.crops {
            crop.encode_into(out);
        }
    }
}

/// Header of one input buffer of a generic raw inference.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GenericRawRequest {
    pub stamp: HeaderStamp,
    pub inference_number: u32,
    pub model_id: u32,
    pub image: ImageHeader,
}

impl GenericRawRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        Ok(Self {
            stamp: HeaderStamp::read(&mut r)?,
            inference_number: r.u32()?,
            model_id: r.u32()?,
            image: ImageHeader::read(&mut r)?,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.stamp.encode_into(out);
        put_u32(out, self.inference_number);
        put_u32(out, self.model_id);
        self.image.encode_into(out);
    }
}

/// Header of one input buffer whose pre-processing is bypassed: the
/// image is already in the model's input layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BypassRequest {
    pub stamp: HeaderStamp,
    pub inference_number: u32,
    pub model_id: u32,
    pub image_buffer_size: u32,
}

impl BypassRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        Ok(Self {
            stamp: HeaderStamp::read(&mut r)?,
            inference_number: r.u32()?,
            model_id: r.u32()?,
            image_buffer_size: r.u32()?,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.stamp.encode_into(out);
        put_u32(out, self.inference_number);
        put_u32(out, self.model_id);
        put_u32(out, self.image_buffer_size);
    }
}

/// The pre-processing that was actually applied to one input.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PreProcInfo {
    pub img_width: u32,
    pub img_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pad_left: u32,
    pub pad_right: u32,
    pub model_width: u32,
    pub model_height: u32,
    pub crop_area: CropBox,
}

impl PreProcInfo {
    fn read(r: &mut WireReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            img_width: r.u32()?,
            img_height: r.u32()?,
            resized_width: r.u32()?,
            resized_height: r.u32()?,
            pad_top: r.u32()?,
            pad_bottom: r.u32()?,
            pad_left: r.u32()?,
            pad_right: r.u32()?,
            model_width: r.u32()?,
            model_height: r.u32()?,
            crop_area: CropBox::read(r)?,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        for word in [
            self.img_width,
            self.img_height,
            self.resized_width,
            self.resized_height,
            self.pad_top,
            self.pad_bottom,
            self.pad_left,
            self.pad_right,
            self.model_width,
            self.model_height,
        ] {
            put_u32(out, word);
        }
        self.crop_area.encode_into(out);
    }
}

/// Header of a built-in application's result. The raw output follows it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultHeader {
    pub stamp: HeaderStamp,
    pub pre_proc: Vec<PreProcInfo>,
    pub product_id: u32,
    pub inference_number: u32,
    pub crop_number: u32,
    pub is_last_crop: bool,
}

impl ResultHeader {
    /// Encode into `out`, padding the pre-process table to its fixed size.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.stamp.encode_into(out);
        let count = self.pre_proc.len().min(MAX_BUFFERS_PER_OBJECT);
        put_u32(out, count as u32);
        for info in &self.pre_proc[..count] {
            info.encode_into(out);
        }
        for _ in count..MAX_BUFFERS_PER_OBJECT {
            PreProcInfo::default().encode_into(out);
        }
        put_u32(out, self.product_id);
        put_u32(out, self.inference_number);
        put_u32(out, self.crop_number);
        put_u32(out, u32::from(self.is_last_crop));
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESULT_HEADER_SIZE);
        self.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        let stamp = HeaderStamp::read(&mut r)?;
        let count = r.u32()? as usize;
        if count > MAX_BUFFERS_PER_OBJECT {
            return Err(FrameError::InvalidField("num_of_pre_proc_info"));
        }
        let mut pre_proc = Vec::with_capacity(count);
        for i in 0..MAX_BUFFERS_PER_OBJECT {
            let info = PreProcInfo::read(&mut r)?;
            if i < count {
                pre_proc.push(info);
            }
        }
        Ok(Self {
            stamp,
            pre_proc,
            product_id: r.u32()?,
            inference_number: r.u32()?,
            crop_number: r.u32()?,
            is_last_crop: r.u32()? != 0,
        })
    }
}

/// Size of a debug checkpoint header. The dumped data follows it.
pub const CHECKPOINT_HEADER_SIZE: usize = HEADER_STAMP_SIZE + 12;

/// Header of a debug checkpoint dump.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub stamp: HeaderStamp,

    /// The checkpoint that produced the dump.
    pub checkpoint_tag: u32,
    pub model_id: u32,
    pub data_size: u32,
}

impl CheckpointHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.stamp.encode_into(out);
        put_u32(out, self.checkpoint_tag);
        put_u32(out, self.model_id);
        put_u32(out, self.data_size);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        Ok(Self {
            stamp: HeaderStamp::read(&mut r)?,
            checkpoint_tag: r.u32()?,
            model_id: r.u32()?,
            data_size: r.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::header::MagicType;

    #[test]
    fn fixed_sizes() {
        assert_eq!(GENERIC_RAW_HEADER_SIZE, 140);
        assert_eq!(BYPASS_HEADER_SIZE, 36);
        assert_eq!(RESULT_HEADER_SIZE, 344);
    }

    #[test]
    fn generic_raw_request_fields_survive() {
        let mut image = ImageHeader {
            width: 640,
            height: 480,
            resize_mode: ResizeMode::Enable as u32,
            padding_mode: PaddingMode::Symmetric as u32,
            image_format: ImageFormat::Rgb565 as u32,
            normalize_mode: NormalizeMode::Kneron as u32,
            crop_count: 1,
            ..ImageHeader::default()
        };
        image.crops[0] = CropBox {
            crop_number: 0,
            x1: 10,
            y1: 20,
            width: 300,
            height: 200,
        };
        let request = GenericRawRequest {
            stamp: HeaderStamp::new(MagicType::Inference, 140 + 640 * 480 * 2, JOB_GENERIC_RAW),
            inference_number: 9,
            model_id: 211,
            image,
        };
        let mut bytes = Vec::new();
        request.encode_into(&mut bytes);
        assert_eq!(bytes.len(), GENERIC_RAW_HEADER_SIZE);

        let decoded = GenericRawRequest::decode(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.image.format(), Some(ImageFormat::Rgb565));
        assert_eq!(decoded.image.crop().map(|c| c.width), Some(300));
    }

    #[test]
    fn result_header_pads_the_pre_proc_table() {
        let header = ResultHeader {
            stamp: HeaderStamp::new(MagicType::Inference, 344, JOB_GENERIC_RAW_BYPASS),
            pre_proc: vec![PreProcInfo {
                img_width: 224,
                img_height: 224,
                model_width: 224,
                model_height: 224,
                ..PreProcInfo::default()
            }],
            product_id: 0x100,
            inference_number: 3,
            crop_number: 0,
            is_last_crop: true,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), RESULT_HEADER_SIZE);
        assert_eq!(ResultHeader::decode(&bytes), Ok(header));
    }

    #[test]
    fn normalization_flags() {
        assert_eq!(NormalizeMode::Yolo.hardware_flags(), (false, true));
        assert_eq!(NormalizeMode::Tensorflow.hardware_flags(), (true, false));
        assert_eq!(
            NormalizeMode::CustomizedSub128Div2.hardware_flags(),
            (true, true)
        );
        assert_eq!(ImageFormat::Yuyv.bytes_per_pixel(), 2);
        assert_eq!(
            ImageFormat::Yuyv.hardware_format(),
            ImageFormat::YCbCr422Y0CbY1Cr
        );
    }
}
