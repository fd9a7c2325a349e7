// src/path_tracing/display.rs
// Display sink the path tracer writes half-float pixels into
// RELEVANT FILES:src/path_tracing/path_trace.rs,src/path_tracing/film.rs

use std::sync::{Arc, Mutex, PoisonError};

use half::f16;

use crate::path_tracing::kernel::functions::Half4;

/// Destination of `copy_to_display`. Implementations own the texture memory;
/// the path tracer maps it between `update_begin` and `update_end`.
pub trait Display: Send {
    /// Start an update of a `width` x `height` texture. Returns false when the
    /// display cannot be updated right now, in which case the update is skipped.
    fn update_begin(&mut self, width: usize, height: usize) -> bool;

    /// Row-major pixels of the texture, `None` if mapping failed.
    fn map_texture_buffer(&mut self) -> Option<&mut [Half4]>;

    fn update_end(&mut self);
}

/// Last completed update, readable while the path tracer owns the display.
#[derive(Debug, Default, Clone)]
pub struct DisplayFrame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<Half4>,
    pub num_updates: usize,
}

impl DisplayFrame {
    pub fn pixel(&self, x: usize, y: usize) -> [f32; 4] {
        self.pixels[y * self.width + x].map(f16::to_f32)
    }
}

/// Cloneable reader of a `HalfDisplay`'s presented frame, e.g. for a draw thread.
#[derive(Debug, Clone, Default)]
pub struct DisplayHandle {
    frame: Arc<Mutex<DisplayFrame>>,
}

impl DisplayHandle {
    pub fn frame(&self) -> DisplayFrame {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn num_updates(&self) -> usize {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .num_updates
    }
}

/// Display keeping its texture in host memory. Updates are presented to the
/// handle on `update_end`.
#[derive(Debug, Default)]
pub struct HalfDisplay {
    width: usize,
    height: usize,
    texture: Vec<Half4>,
    in_update: bool,
    presented: DisplayHandle,
}

impl HalfDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> DisplayHandle {
        self.presented.clone()
    }
}

impl Display for HalfDisplay {
    fn update_begin(&mut self, width: usize, height: usize) -> bool {
        if self.in_update {
            log::warn!("Display update started twice");
            return false;
        }
        if self.width != width || self.height != height {
            self.width = width;
            self.height = height;
            self.texture = vec![[f16::ZERO; 4]; width * height];
        }
        self.in_update = true;
        true
    }

    fn map_texture_buffer(&mut self) -> Option<&mut [Half4]> {
        if !self.in_update {
            return None;
        }
        Some(&mut self.texture)
    }

    fn update_end(&mut self) {
        if !self.in_update {
            return;
        }
        self.in_update = false;
        let mut frame = self
            .presented
            .frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        frame.width = self.width;
        frame.height = self.height;
        frame.pixels.clone_from(&self.texture);
        frame.num_updates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_only_inside_update() {
        let mut display = HalfDisplay::new();
        let handle = display.handle();
        assert!(display.map_texture_buffer().is_none());

        assert!(display.update_begin(3, 2));
        let texture = display.map_texture_buffer().unwrap();
        assert_eq!(texture.len(), 6);
        texture[5] = [f16::ONE; 4];
        assert_eq!(handle.num_updates(), 0);
        display.update_end();

        let frame = handle.frame();
        assert_eq!(frame.num_updates, 1);
        assert_eq!(frame.pixel(2, 1), [1.0; 4]);
        assert!(display.map_texture_buffer().is_none());
    }

    #[test]
    fn test_nested_update_is_refused() {
        let mut display = HalfDisplay::new();
        assert!(display.update_begin(1, 1));
        assert!(!display.update_begin(1, 1));
        display.update_end();
        assert!(display.update_begin(1, 1));
    }
}
