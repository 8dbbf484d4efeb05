//! Alignment padding for the flow estimator.
//!
//! RIFE-style networks downsample by powers of two internally, so spatial
//! dimensions must be multiples of [`PAD_ALIGN`]. Padding replicates the last
//! row and column into the bottom/right margin; the origin never moves, which
//! keeps cropping a plain slice.

use crate::error::{Result, SlowmoError};
use crate::types::{Frame, CHANNELS};

pub const PAD_ALIGN: usize = 32;

/// A frame whose dimensions are multiples of [`PAD_ALIGN`], plus the size it had before padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedFrame {
    frame: Frame,
    original_width: u32,
    original_height: u32,
}

impl PaddedFrame {
    /// Wrap an estimator output that is already at padded size.
    pub fn from_estimate(frame: Frame, original_width: u32, original_height: u32) -> Result<Self> {
        let (width, height) = frame.dimensions();
        if width != padded_dim(original_width) || height != padded_dim(original_height) {
            return Err(SlowmoError::ShapeMismatch {
                first_width: padded_dim(original_width),
                first_height: padded_dim(original_height),
                second_width: width,
                second_height: height,
            });
        }
        Ok(Self {
            frame,
            original_width,
            original_height,
        })
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn original_dimensions(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }

    pub fn padded_dimensions(&self) -> (u32, u32) {
        self.frame.dimensions()
    }
}

pub fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - dim % PAD_ALIGN) % PAD_ALIGN
}

fn padded_dim(dim: u32) -> u32 {
    (dim as usize + pad_amount(dim as usize)) as u32
}

pub fn pad(frame: &Frame) -> Result<PaddedFrame> {
    let (width, height) = frame.dimensions();
    let w = width as usize;
    let h = height as usize;
    let pad_w = pad_amount(w);
    let pad_h = pad_amount(h);

    if pad_w == 0 && pad_h == 0 {
        return Ok(PaddedFrame {
            frame: frame.clone(),
            original_width: width,
            original_height: height,
        });
    }

    let padded_w = w + pad_w;
    let padded_h = h + pad_h;
    let src = frame.data();
    let src_stride = w * CHANNELS;
    let dst_stride = padded_w * CHANNELS;
    let mut data = Vec::with_capacity(dst_stride * padded_h);

    for y in 0..padded_h {
        let row = &src[y.min(h - 1) * src_stride..][..src_stride];
        data.extend_from_slice(row);
        let last_pixel = &row[src_stride - CHANNELS..];
        for _ in 0..pad_w {
            data.extend_from_slice(last_pixel);
        }
    }

    Ok(PaddedFrame {
        frame: Frame::new(padded_w as u32, padded_h as u32, data)?,
        original_width: width,
        original_height: height,
    })
}

/// Crop a padded frame back to the dimensions it was created with.
pub fn unpad(padded: &PaddedFrame) -> Result<Frame> {
    let (width, height) = padded.frame.dimensions();
    if width == padded.original_width && height == padded.original_height {
        return Ok(padded.frame.clone());
    }

    let w = padded.original_width as usize;
    let h = padded.original_height as usize;
    let src_stride = width as usize * CHANNELS;
    let dst_stride = w * CHANNELS;
    let src = padded.frame.data();
    let mut data = Vec::with_capacity(dst_stride * h);
    for y in 0..h {
        data.extend_from_slice(&src[y * src_stride..][..dst_stride]);
    }

    Frame::new(padded.original_width, padded.original_height, data)
}
