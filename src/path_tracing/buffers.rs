// src/path_tracing/buffers.rs
// Render buffer storage and pixel addressing
// Passes are interleaved per pixel: pixel_index * pass_stride + pass_offset
// RELEVANT FILES:src/path_tracing/accumulate.rs,src/path_tracing/film.rs,src/path_tracing/work/mod.rs

use std::sync::atomic::{AtomicU32, Ordering};

/// Geometry of a (part of a) render buffer in full-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferParams {
    pub width: usize,
    pub height: usize,
    /// Position of this buffer inside the full frame
    pub full_x: usize,
    pub full_y: usize,
    /// Floats per pixel
    pub pass_stride: usize,
}

impl BufferParams {
    pub fn new(width: usize, height: usize, pass_stride: usize) -> Self {
        Self {
            width,
            height,
            full_x: 0,
            full_y: 0,
            pass_stride,
        }
    }

    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    pub fn buffer_len(&self) -> usize {
        self.num_pixels() * self.pass_stride
    }

    /// Offset and stride which turn full-frame (x, y) into a pixel index of this buffer.
    pub fn get_offset_stride(&self) -> (i64, usize) {
        let stride = self.width;
        let offset = -((self.full_x + self.full_y * stride) as i64);
        (offset, stride)
    }

    /// Whether switching to `other` requires reallocating per-device buffers.
    pub fn modified(&self, other: &BufferParams) -> bool {
        self != other
    }

    /// Downscaled copy used for navigation passes.
    pub fn with_resolution_divider(&self, divider: usize) -> Self {
        let divider = divider.max(1);
        Self {
            width: (self.width / divider).max(1),
            height: (self.height / divider).max(1),
            full_x: self.full_x / divider,
            full_y: self.full_y / divider,
            pass_stride: self.pass_stride,
        }
    }

    /// Render pixel index of full-frame coordinates.
    pub fn pixel_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x >= self.full_x && y >= self.full_y);
        (x - self.full_x) + (y - self.full_y) * self.width
    }
}

/// Flat float storage shared between the host and the kernels.
///
/// Values live in 32-bit atomic words so shading lanes can accumulate into
/// the same pixel concurrently; the sample-count pass stores integer bits.
#[derive(Debug)]
pub struct RenderBuffers {
    params: BufferParams,
    data: Box<[AtomicU32]>,
}

impl RenderBuffers {
    pub fn new(params: BufferParams) -> Self {
        let data = (0..params.buffer_len())
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { params, data }
    }

    pub fn params(&self) -> &BufferParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zero(&self) {
        for word in self.data.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn read(&self, index: usize) -> f32 {
        f32::from_bits(self.data[index].load(Ordering::Relaxed))
    }

    pub fn write(&self, index: usize, value: f32) {
        self.data[index].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Non-atomic read-modify-write, valid when one thread owns the pixel.
    pub fn add_plain(&self, index: usize, value: f32) {
        let word = &self.data[index];
        let current = f32::from_bits(word.load(Ordering::Relaxed));
        word.store((current + value).to_bits(), Ordering::Relaxed);
    }

    pub fn add_atomic(&self, index: usize, value: f32) {
        let word = &self.data[index];
        let mut current = word.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match word.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn read_u32(&self, index: usize) -> u32 {
        self.data[index].load(Ordering::Relaxed)
    }

    pub fn write_u32(&self, index: usize, value: u32) {
        self.data[index].store(value, Ordering::Relaxed);
    }

    /// Returns the previous value.
    pub fn fetch_add_u32(&self, index: usize, value: u32) -> u32 {
        self.data[index].fetch_add(value, Ordering::Relaxed)
    }

    /// Copy all passes of one pixel into `dst` pixel of another buffer.
    pub fn copy_pixel_to(&self, src_pixel: usize, dst: &RenderBuffers, dst_pixel: usize) {
        let stride = self.params.pass_stride;
        debug_assert_eq!(stride, dst.params.pass_stride);
        let src = &self.data[src_pixel * stride..(src_pixel + 1) * stride];
        let dst = &dst.data[dst_pixel * stride..(dst_pixel + 1) * stride];
        for (s, d) in src.iter().zip(dst.iter()) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Host snapshot of the raw floats.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data
            .iter()
            .map(|w| f32::from_bits(w.load(Ordering::Relaxed)))
            .collect()
    }
}
