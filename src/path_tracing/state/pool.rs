// src/path_tracing/state/pool.rs
// Structure-of-arrays path-state pool indexed by path slot
// Columns follow STATE_FIELDS; disabled features leave their columns unallocated

use log::debug;

use super::layout::{KernelFeatures, STATE_FIELDS};
use super::IntegratorState;
use crate::path_tracing::wavefront::queues::IntegratorQueueCounter;

/// One allocated or skipped column: a schema field, one array element of it.
#[derive(Clone, Copy, Debug)]
struct ColumnDesc {
    field: usize,
    element: usize,
    record_offset: usize,
    words: usize,
}

#[derive(Debug, Clone)]
pub struct PathStatePool {
    capacity: usize,
    features: KernelFeatures,
    layout: Vec<ColumnDesc>,
    /// `None` models a compiled-out member: reads return nothing, copies skip it.
    columns: Vec<Option<Vec<u32>>>,
    /// First column of every schema field
    field_columns: Vec<usize>,
    path_queued_kernel: usize,
    shadow_queued_kernel: usize,
}

impl PathStatePool {
    /// Reserve zeroed storage for `capacity` path slots.
    pub fn allocate(capacity: usize, features: KernelFeatures) -> Self {
        let mut layout = Vec::new();
        let mut columns = Vec::new();
        let mut field_columns = Vec::with_capacity(STATE_FIELDS.len());

        for (field_index, field) in STATE_FIELDS.iter().enumerate() {
            field_columns.push(layout.len());
            let enabled = field.is_enabled(features);
            for element in 0..field.array_size {
                layout.push(ColumnDesc {
                    field: field_index,
                    element,
                    record_offset: field.element_offset(element),
                    words: field.words,
                });
                columns.push(enabled.then(|| vec![0u32; capacity * field.words]));
            }
        }

        let column_of = |name: &str| {
            let index = super::layout::field_index(name).unwrap_or(usize::MAX);
            field_columns.get(index).copied().unwrap_or(usize::MAX)
        };
        let path_queued_kernel = column_of("path.queued_kernel");
        let shadow_queued_kernel = column_of("shadow_path.queued_kernel");

        let allocated_words: usize = columns.iter().flatten().map(Vec::len).sum();
        debug!(
            "Allocated path state pool: {} slots, {} of {} columns, {:.2} MiB",
            capacity,
            columns.iter().filter(|c| c.is_some()).count(),
            columns.len(),
            (allocated_words * 4) as f64 / (1024.0 * 1024.0)
        );

        Self {
            capacity,
            features,
            layout,
            columns,
            field_columns,
            path_queued_kernel,
            shadow_queued_kernel,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn features(&self) -> KernelFeatures {
        self.features
    }

    pub fn zero(&mut self) {
        for column in self.columns.iter_mut().flatten() {
            column.fill(0);
        }
    }

    fn column_index(&self, field: usize, element: usize) -> Option<usize> {
        let schema = STATE_FIELDS.get(field)?;
        if element >= schema.array_size {
            return None;
        }
        Some(self.field_columns[field] + element)
    }

    pub fn is_field_allocated(&self, field: usize) -> bool {
        self.column_index(field, 0)
            .and_then(|c| self.columns[c].as_ref())
            .is_some()
    }

    /// Words of `field[element]` for `slot`, `None` when the column is not allocated.
    pub fn read(&self, field: usize, slot: usize, element: usize) -> Option<&[u32]> {
        let column = self.column_index(field, element)?;
        let words = self.layout[column].words;
        self.columns[column]
            .as_deref()
            .map(|data| &data[slot * words..(slot + 1) * words])
    }

    /// Returns false when the column is not allocated.
    pub fn write(&mut self, field: usize, slot: usize, element: usize, value: &[u32]) -> bool {
        let Some(column) = self.column_index(field, element) else {
            return false;
        };
        let words = self.layout[column].words;
        match self.columns[column].as_mut() {
            Some(data) => {
                data[slot * words..(slot + 1) * words].copy_from_slice(&value[..words]);
                true
            }
            None => false,
        }
    }

    pub fn read_u32(&self, field: usize, slot: usize, element: usize) -> Option<u32> {
        self.read(field, slot, element).map(|words| words[0])
    }

    pub fn read_f32(&self, field: usize, slot: usize, element: usize) -> Option<f32> {
        self.read_u32(field, slot, element).map(f32::from_bits)
    }

    /// Gather all allocated columns of `slot` into a record. Unallocated members read as zero.
    pub fn load(&self, slot: usize) -> IntegratorState {
        let mut state = IntegratorState::new();
        let record: &mut [u32] = bytemuck::cast_slice_mut(std::slice::from_mut(&mut state));
        for (desc, column) in self.layout.iter().zip(&self.columns) {
            if let Some(data) = column {
                record[desc.record_offset..desc.record_offset + desc.words]
                    .copy_from_slice(&data[slot * desc.words..(slot + 1) * desc.words]);
            }
        }
        state
    }

    /// Scatter a record into the allocated columns of `slot`.
    pub fn store(&mut self, slot: usize, state: &IntegratorState) {
        let record: &[u32] = bytemuck::cast_slice(std::slice::from_ref(state));
        for (desc, column) in self.layout.iter().zip(self.columns.iter_mut()) {
            if let Some(data) = column {
                data[slot * desc.words..(slot + 1) * desc.words]
                    .copy_from_slice(&record[desc.record_offset..desc.record_offset + desc.words]);
            }
        }
    }

    /// Copy every member of `from` into `to`, queue tags included.
    pub fn copy_slot(&mut self, to: usize, from: usize) {
        if to == from {
            return;
        }
        for (desc, column) in self.layout.iter().zip(self.columns.iter_mut()) {
            if let Some(data) = column {
                let w = desc.words;
                data.copy_within(from * w..(from + 1) * w, to * w);
            }
        }
    }

    /// Copy `from` into `to` and retire `from`.
    pub fn move_slot(&mut self, to: usize, from: usize) {
        self.copy_slot(to, from);
        if to != from {
            self.clear_tags(from);
        }
    }

    /// Duplicate a live path into a free slot and count its queue tags, so the
    /// copy is scheduled like any other path.
    pub fn split_slot(&mut self, to: usize, from: usize, counter: &IntegratorQueueCounter) {
        debug_assert!(self.is_slot_free(to), "split into live slot {to}");
        self.copy_slot(to, from);
        counter.count_tags(self.path_tags()[to], self.shadow_tags()[to]);
    }

    fn clear_tags(&mut self, slot: usize) {
        for column in [self.path_queued_kernel, self.shadow_queued_kernel] {
            if let Some(data) = self.columns[column].as_mut() {
                data[slot] = 0;
            }
        }
    }

    /// `path.queued_kernel` for every slot.
    pub fn path_tags(&self) -> &[u32] {
        self.columns[self.path_queued_kernel].as_deref().unwrap_or(&[])
    }

    /// `shadow_path.queued_kernel` for every slot.
    pub fn shadow_tags(&self) -> &[u32] {
        self.columns[self.shadow_queued_kernel].as_deref().unwrap_or(&[])
    }

    pub fn is_slot_free(&self, slot: usize) -> bool {
        self.path_tags()[slot] == 0 && self.shadow_tags()[slot] == 0
    }

    /// Transfer into another pool (host mirror <-> device store). Columns missing on
    /// either side are skipped; slots beyond the smaller capacity are left alone.
    pub fn copy_to(&self, dst: &mut PathStatePool) {
        let slots = self.capacity.min(dst.capacity);
        for ((desc, src), dst) in self.layout.iter().zip(&self.columns).zip(dst.columns.iter_mut()) {
            if let (Some(src), Some(dst)) = (src, dst) {
                let len = slots * desc.words;
                dst[..len].copy_from_slice(&src[..len]);
            }
        }
    }

    /// Name of the schema field and element behind a column, for diagnostics.
    pub fn column_name(&self, column: usize) -> Option<(&'static str, usize)> {
        self.layout
            .get(column)
            .map(|desc| (STATE_FIELDS[desc.field].name, desc.element))
    }
}
