//! Ping-pong accumulation buffers.
//!
//! Two raw linear-light color textures and two RNG seed textures. Within one
//! iteration the pair selected by `active` is read as feedback while the other
//! is written; [`AccumulationStore::swap`] flips the roles.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::backend::{
    check_frame_size, RenderBackend, TextureDesc, TextureFormat, TextureId, TextureInit,
};
use crate::util::Result;

/// Color + seed texture pair bound together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPair {
    pub color: TextureId,
    pub seed: TextureId,
}

/// Double-buffered accumulation state.
#[derive(Debug)]
pub struct AccumulationStore {
    raw_color: [TextureId; 2],
    seed: [TextureId; 2],
    active: usize,
    width: u32,
    height: u32,
}

impl AccumulationStore {
    /// Allocate zeroed color buffers and randomly seeded RNG buffers.
    ///
    /// Each seed buffer gets its own independent draw from `seed`.
    pub fn allocate(
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Result<Self> {
        check_frame_size(width, height)?;

        let color_desc = TextureDesc {
            label: "accum_color",
            width,
            height,
            format: TextureFormat::Rgba32Float,
        };
        let seed_desc = TextureDesc {
            label: "accum_seed",
            format: TextureFormat::Rgba32Uint,
            ..color_desc
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let values = seed_desc.value_count()?;

        // color 0, seed 0, color 1, seed 1
        let mut created = Vec::with_capacity(4);
        for _ in 0..2 {
            // xorshift state must never be all zero
            let seeds: Vec<u32> = (0..values).map(|_| rng.random::<u32>() | 1).collect();
            for (desc, init) in [
                (&color_desc, TextureInit::Zeroed),
                (&seed_desc, TextureInit::Uint(&seeds)),
            ] {
                match backend.create_texture(desc, init) {
                    Ok(id) => created.push(id),
                    Err(e) => {
                        for id in created {
                            backend.release_texture(id);
                        }
                        return Err(e);
                    }
                }
            }
        }

        tracing::debug!(width, height, "allocated accumulation buffers");

        Ok(Self {
            raw_color: [created[0], created[2]],
            seed: [created[1], created[3]],
            active: 0,
            width,
            height,
        })
    }

    /// Buffers read as feedback in the current iteration.
    pub fn current_source(&self) -> BufferPair {
        BufferPair {
            color: self.raw_color[self.active],
            seed: self.seed[self.active],
        }
    }

    /// Buffers written in the current iteration.
    pub fn current_destination(&self) -> BufferPair {
        let other = 1 - self.active;
        BufferPair {
            color: self.raw_color[other],
            seed: self.seed[other],
        }
    }

    /// Exchange source and destination roles.
    pub fn swap(&mut self) {
        self.active = 1 - self.active;
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Release all four textures back to the backend.
    pub fn release(self, backend: &mut dyn RenderBackend) {
        for id in self.raw_color.into_iter().chain(self.seed) {
            backend.release_texture(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::cpu::CpuBackend;
    use crate::render::testing::FailingBackend;
    use crate::util::Error;

    #[test]
    fn test_allocate_distinct() {
        let mut backend = CpuBackend::new();
        let store = AccumulationStore::allocate(&mut backend, 16, 9, 0).unwrap();
        let src = store.current_source();
        let dst = store.current_destination();
        assert_ne!(src.color, dst.color);
        assert_ne!(src.seed, dst.seed);
        assert_ne!(src.color, src.seed);
        assert_ne!(dst.color, dst.seed);
        assert_eq!(store.dimensions(), (16, 9));
    }

    #[test]
    fn test_seed_buffers_differ() {
        let mut backend = CpuBackend::new();
        let store = AccumulationStore::allocate(&mut backend, 4, 4, 7).unwrap();
        let a = backend.seed_texels(store.current_source().seed).unwrap().to_vec();
        let b = backend.seed_texels(store.current_destination().seed).unwrap().to_vec();
        assert_eq!(a.len(), 4 * 4 * 4);
        assert_ne!(a, b);
        assert!(a.iter().all(|&s| s != 0));
    }

    #[test]
    fn test_swap_involution() {
        let mut backend = CpuBackend::new();
        let mut store = AccumulationStore::allocate(&mut backend, 3, 2, 0).unwrap();
        let src = store.current_source();
        let dst = store.current_destination();

        store.swap();
        assert_eq!(store.current_source(), dst);
        assert_eq!(store.current_destination(), src);

        store.swap();
        assert_eq!(store.current_source(), src);
        assert_eq!(store.current_destination(), dst);
        assert_eq!(store.active_index(), 0);
    }

    #[test]
    fn test_oversized_rejected_before_allocating() {
        let mut backend = CpuBackend::new();
        let err = AccumulationStore::allocate(&mut backend, 60000, 60000, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions { width: 60000, height: 60000 }));
        assert_eq!(backend.texture_count(), 0);
    }

    #[test]
    fn test_partial_allocation_released() {
        for fail_at in 0..4 {
            let (mut backend, faults) = FailingBackend::new();
            faults.lock().creates_left = Some(fail_at);
            assert!(AccumulationStore::allocate(&mut backend, 4, 4, 0).is_err());
            assert_eq!(faults.lock().live_textures, 0, "leak when create #{fail_at} fails");
        }
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let mut backend = CpuBackend::new();
        let err = AccumulationStore::allocate(&mut backend, 0, 10, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDimensions { width: 0, height: 10 }));
        assert!(AccumulationStore::allocate(&mut backend, 10, 0, 0).is_err());
    }
}
