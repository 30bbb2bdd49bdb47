//! Native pixel surfaces.
//!
//! A [`SurfaceQueue`] is a small pool of pixel buffers shared between the
//! producer (a rasterize thread) and the consumer (the main thread's texture
//! upload). The producer dequeues a writable buffer, draws into it, and
//! enqueues it; the consumer acquires the latest enqueued buffer.
//!
//! The software implementation keeps buffers in CPU memory and uses mailbox
//! semantics: enqueueing a new frame releases any older frame the consumer
//! has not acquired yet.

use crate::error::SurfaceError;
use log::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Bytes per pixel of every surface (premultiplied RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

/// Identity of the texture a surface backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// A buffer taken out of a surface queue for writing.
///
/// Ownership of the pixels moves to the holder until the buffer is enqueued
/// or cancelled.
#[derive(Debug)]
pub struct WritableBuffer {
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: usize,
    pub pixels: Box<[u8]>,
}

/// A frame the consumer holds until it calls `release`.
#[derive(Debug, Clone)]
pub struct AcquiredFrame {
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub pixels: Vec<u8>,
}

/// Producer side of a native surface.
pub trait SurfaceQueue: Send {
    /// Texture the consumer samples from.
    fn texture(&self) -> TextureId;
    /// Whether a writable buffer is available right now.
    fn can_dequeue(&self) -> bool;
    /// Takes a free buffer for writing.
    fn dequeue_writable_buffer(&mut self) -> Option<WritableBuffer>;
    /// Hands a written buffer to the consumer.
    fn enqueue_buffer(&mut self, buffer: WritableBuffer);
    /// Returns a buffer without presenting it.
    fn cancel_buffer(&mut self, buffer: WritableBuffer);
    /// Drops buffers the consumer has released. Called when playback stops.
    fn free_released_buffers(&mut self) {}
}

/// Creates surfaces for a renderer's rendering data.
pub trait SurfaceFactory: Send + Sync {
    fn create_surface(&self, width: u32, height: u32) -> Result<Box<dyn SurfaceQueue>, SurfaceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Dequeued,
    Queued,
    Acquired,
}

struct Slot {
    state: SlotState,
    pixels: Option<Box<[u8]>>,
    sequence: u64,
}

struct SlotPool {
    width: u32,
    height: u32,
    stride: usize,
    slots: Vec<Slot>,
    next_sequence: u64,
}

impl SlotPool {
    fn buffer_len(&self) -> usize {
        self.stride * self.height as usize
    }
}

fn lock_pool(pool: &Mutex<SlotPool>) -> MutexGuard<'_, SlotPool> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

/// CPU-memory surface queue.
pub struct SoftwareSurfaceQueue {
    texture: TextureId,
    pool: Arc<Mutex<SlotPool>>,
}

impl SurfaceQueue for SoftwareSurfaceQueue {
    fn texture(&self) -> TextureId {
        self.texture
    }

    fn can_dequeue(&self) -> bool {
        lock_pool(&self.pool)
            .slots
            .iter()
            .any(|slot| slot.state == SlotState::Free)
    }

    fn dequeue_writable_buffer(&mut self) -> Option<WritableBuffer> {
        let mut pool = lock_pool(&self.pool);
        let len = pool.buffer_len();
        let (width, height, stride) = (pool.width, pool.height, pool.stride);
        let (index, slot) = pool
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state == SlotState::Free)?;
        slot.state = SlotState::Dequeued;
        let pixels = slot
            .pixels
            .take()
            .unwrap_or_else(|| vec![0u8; len].into_boxed_slice());
        Some(WritableBuffer {
            slot: index,
            width,
            height,
            stride,
            pixels,
        })
    }

    fn enqueue_buffer(&mut self, buffer: WritableBuffer) {
        let mut pool = lock_pool(&self.pool);
        let sequence = pool.next_sequence;
        pool.next_sequence += 1;
        for slot in pool.slots.iter_mut() {
            if slot.state == SlotState::Queued {
                slot.state = SlotState::Free;
            }
        }
        if let Some(slot) = pool.slots.get_mut(buffer.slot) {
            slot.state = SlotState::Queued;
            slot.pixels = Some(buffer.pixels);
            slot.sequence = sequence;
        }
    }

    fn cancel_buffer(&mut self, buffer: WritableBuffer) {
        let mut pool = lock_pool(&self.pool);
        if let Some(slot) = pool.slots.get_mut(buffer.slot) {
            slot.state = SlotState::Free;
            slot.pixels = Some(buffer.pixels);
        }
    }

    fn free_released_buffers(&mut self) {
        let mut pool = lock_pool(&self.pool);
        for slot in pool.slots.iter_mut() {
            if slot.state == SlotState::Free {
                slot.pixels = None;
            }
        }
    }
}

/// Factory for [`SoftwareSurfaceQueue`]s that also exposes the consumer side.
pub struct SoftwareSurfaceFactory {
    buffer_count: usize,
    next_texture: AtomicU64,
    surfaces: Mutex<HashMap<TextureId, Weak<Mutex<SlotPool>>>>,
}

impl SoftwareSurfaceFactory {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            buffer_count: buffer_count.max(1),
            next_texture: AtomicU64::new(1),
            surfaces: Mutex::new(HashMap::new()),
        }
    }

    /// Copies out the most recently enqueued frame of `texture` and holds its
    /// slot until [`release`](Self::release). Returns `None` if nothing new
    /// was enqueued or the surface is gone.
    pub fn acquire_latest(&self, texture: TextureId) -> Option<AcquiredFrame> {
        let pool = self.pool(texture)?;
        let mut pool = lock_pool(&pool);
        let (width, height, stride) = (pool.width, pool.height, pool.stride);
        let (index, slot) = pool
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Queued)
            .max_by_key(|(_, slot)| slot.sequence)?;
        slot.state = SlotState::Acquired;
        let pixels = slot.pixels.as_deref().map(<[u8]>::to_vec).unwrap_or_default();
        Some(AcquiredFrame {
            slot: index,
            width,
            height,
            stride,
            pixels,
        })
    }

    /// Returns an acquired slot to the producer.
    pub fn release(&self, texture: TextureId, frame: &AcquiredFrame) {
        if let Some(pool) = self.pool(texture) {
            let mut pool = lock_pool(&pool);
            if let Some(slot) = pool.slots.get_mut(frame.slot) {
                if slot.state == SlotState::Acquired {
                    slot.state = SlotState::Free;
                }
            }
        }
    }

    /// Buffers of `texture` currently holding pixel storage.
    pub fn allocated_buffers(&self, texture: TextureId) -> usize {
        let Some(pool) = self.pool(texture) else {
            return 0;
        };
        let pool = lock_pool(&pool);
        pool.slots.iter().filter(|slot| slot.pixels.is_some()).count()
    }

    /// Number of surfaces still alive.
    pub fn live_surfaces(&self) -> usize {
        let mut surfaces = self.surfaces.lock().unwrap_or_else(PoisonError::into_inner);
        surfaces.retain(|_, pool| pool.strong_count() > 0);
        surfaces.len()
    }

    fn pool(&self, texture: TextureId) -> Option<Arc<Mutex<SlotPool>>> {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&texture)
            .and_then(Weak::upgrade)
    }
}

impl SurfaceFactory for SoftwareSurfaceFactory {
    fn create_surface(&self, width: u32, height: u32) -> Result<Box<dyn SurfaceQueue>, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::InvalidSize { width, height });
        }
        let texture = TextureId(self.next_texture.fetch_add(1, Ordering::Relaxed));
        let slots = (0..self.buffer_count)
            .map(|_| Slot {
                state: SlotState::Free,
                pixels: None,
                sequence: 0,
            })
            .collect();
        let pool = Arc::new(Mutex::new(SlotPool {
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
            slots,
            next_sequence: 1,
        }));
        let mut surfaces = self.surfaces.lock().unwrap_or_else(PoisonError::into_inner);
        surfaces.retain(|_, pool| pool.strong_count() > 0);
        surfaces.insert(texture, Arc::downgrade(&pool));
        debug!(
            "SoftwareSurfaceFactory: Created {:?} ({}x{}, {} buffers)",
            texture, width, height, self.buffer_count
        );
        Ok(Box::new(SoftwareSurfaceQueue { texture, pool }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_reject_empty_surfaces() {
        let factory = SoftwareSurfaceFactory::new(2);
        assert!(matches!(
            factory.create_surface(0, 10),
            Err(SurfaceError::InvalidSize { width: 0, height: 10 })
        ));
    }

    #[test]
    fn it_should_hand_out_buffers_sized_to_the_surface() {
        let factory = SoftwareSurfaceFactory::new(2);
        let mut surface = factory.create_surface(3, 2).unwrap();
        let buffer = surface.dequeue_writable_buffer().unwrap();
        assert_eq!(buffer.stride, 12);
        assert_eq!(buffer.pixels.len(), 24);
        surface.cancel_buffer(buffer);
    }

    #[test]
    fn it_should_release_older_unacquired_frames_on_enqueue() {
        let factory = SoftwareSurfaceFactory::new(2);
        let mut surface = factory.create_surface(1, 1).unwrap();

        let mut first = surface.dequeue_writable_buffer().unwrap();
        first.pixels[0] = 1;
        surface.enqueue_buffer(first);
        let mut second = surface.dequeue_writable_buffer().unwrap();
        second.pixels[0] = 2;
        surface.enqueue_buffer(second);

        // The first frame went back to the pool, so the producer never stalls.
        assert!(surface.can_dequeue());
        let frame = factory.acquire_latest(surface.texture()).unwrap();
        assert_eq!(frame.pixels[0], 2);
    }

    #[test]
    fn it_should_block_dequeue_while_every_slot_is_held() {
        let factory = SoftwareSurfaceFactory::new(1);
        let mut surface = factory.create_surface(1, 1).unwrap();
        let buffer = surface.dequeue_writable_buffer().unwrap();
        surface.enqueue_buffer(buffer);

        let frame = factory.acquire_latest(surface.texture()).unwrap();
        assert!(!surface.can_dequeue());
        assert!(surface.dequeue_writable_buffer().is_none());

        factory.release(surface.texture(), &frame);
        assert!(surface.can_dequeue());
    }

    #[test]
    fn it_should_forget_dropped_surfaces() {
        let factory = SoftwareSurfaceFactory::new(2);
        let surface = factory.create_surface(4, 4).unwrap();
        let texture = surface.texture();
        assert_eq!(factory.live_surfaces(), 1);
        drop(surface);
        assert_eq!(factory.live_surfaces(), 0);
        assert!(factory.acquire_latest(texture).is_none());
    }
}
