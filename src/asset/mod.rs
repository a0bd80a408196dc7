pub mod cache;
pub mod handle;
pub mod mesh;
pub mod primitives;

pub use cache::AssetCache;
pub use handle::Handle;
pub use mesh::{Mesh, MeshData, Subset};

use crate::renderer::Material;

pub struct Assets {
    pub meshes: AssetCache<Mesh>,
    pub materials: AssetCache<Material>,
}

impl Assets {
    pub fn new() -> Self {
        Self {
            meshes: AssetCache::new(),
            materials: AssetCache::new(),
        }
    }
}

impl Default for Assets {
    fn default() -> Self {
        Self::new()
    }
}
