use std::collections::{hash_map, HashMap};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::face::Face;
use crate::Voxel;

/// A voxel category.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Category(String);

/// Description of a voxel type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelInfo {
    pub name: String,
    pub category: Category,
    pub texture: VoxelTexture,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FaceTexture {
    /// The resource name of the texture image
    pub resource: String,
}

/// Description of how a voxel is textured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VoxelTexture {
    /// The voxel has the given face texture on all faces.
    Uniform(FaceTexture),
    /// The voxel has the given face textures on corresponding faces.
    Nonuniform {
        top: FaceTexture,
        bottom: FaceTexture,
        side: FaceTexture,
    },
}

/// Description of the selection of available voxels and categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelConfig {
    voxels: Vec<VoxelInfo>,
}

#[derive(Debug, Clone)]
pub struct VoxelConfigHelper {
    voxels_by_name: HashMap<String, (Voxel, VoxelInfo)>,
    voxels_by_id: Vec<VoxelInfo>,
    texture_index_map: HashMap<FaceTexture, u32>,
    /// Texture layer per voxel id, indexed by top, bottom, side.
    face_layers: Vec<[u32; 3]>,
}

impl Category {
    pub fn new(name: &str) -> Self {
        Category(name.into())
    }
}

impl VoxelInfo {
    pub fn new(name: &str, category: &str, texture: VoxelTexture) -> Self {
        Self {
            name: name.into(),
            category: Category::new(category),
            texture,
        }
    }
}

impl FaceTexture {
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

impl VoxelConfig {
    pub fn new(voxels: Vec<VoxelInfo>) -> Self {
        Self { voxels }
    }
}

impl VoxelConfigHelper {
    pub fn new(config: &VoxelConfig) -> Result<Self> {
        if config.voxels.is_empty() || config.voxels[0].category != Category("air".into()) {
            bail!("First entry in voxel config must have category \"air\"");
        }

        if config.voxels.len() > u16::MAX as usize {
            bail!(
                "Voxel config has {} entries but at most {} fit in a voxel",
                config.voxels.len(),
                u16::MAX
            );
        }

        let voxels_by_id = config.voxels.clone();

        let voxels_by_name = voxels_by_id
            .iter()
            .enumerate()
            .map(|(i, voxel_info)| {
                let name = voxel_info.name.clone();
                let voxel = Voxel::from_u16(i as u16);
                (name, (voxel, voxel_info.clone()))
            })
            .collect();

        for (voxel_id, voxel) in voxels_by_id.iter().enumerate() {
            log::info!("Voxel id {} is {}", voxel_id, voxel.name);
        }

        let texture_index_map = Self::build_texture_index_map(&voxels_by_id);
        let face_layers = voxels_by_id
            .iter()
            .map(|voxel| {
                let layer = |face_tex: &FaceTexture| texture_index_map[face_tex];
                match &voxel.texture {
                    VoxelTexture::Uniform(face_tex) => [layer(face_tex); 3],
                    VoxelTexture::Nonuniform { top, bottom, side } => {
                        [layer(top), layer(bottom), layer(side)]
                    }
                }
            })
            .collect();

        Ok(Self {
            voxels_by_name,
            voxels_by_id,
            texture_index_map,
            face_layers,
        })
    }

    /// Parses a voxel config from YAML and validates it.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let config: VoxelConfig = serde_yaml::from_str(source)?;
        Self::new(&config)
    }

    pub fn voxel_by_name(&self, name: &str) -> Option<(Voxel, &VoxelInfo)> {
        let (voxel, voxel_info) = self.voxels_by_name.get(name)?;
        Some((*voxel, voxel_info))
    }

    pub fn voxel_info(&self, voxel: Voxel) -> Option<&VoxelInfo> {
        self.voxels_by_id.get(voxel.to_u16() as usize)
    }

    /// True if the voxel's tag names an entry in this config.
    pub fn is_known(&self, voxel: Voxel) -> bool {
        (voxel.to_u16() as usize) < self.voxels_by_id.len()
    }

    pub fn voxels(&self) -> &[VoxelInfo] {
        &self.voxels_by_id[..]
    }

    pub fn texture_index_map(&self) -> &HashMap<FaceTexture, u32> {
        &self.texture_index_map
    }

    /// Texture array layer for one face of a voxel. Unknown voxels use layer 0.
    pub fn face_texture_index(&self, voxel: Voxel, face: Face) -> u32 {
        let layers = match self.face_layers.get(voxel.to_u16() as usize) {
            Some(layers) => layers,
            None => return 0,
        };

        match face {
            Face::PosY => layers[0],
            Face::NegY => layers[1],
            _ => layers[2],
        }
    }

    fn build_texture_index_map(voxels: &[VoxelInfo]) -> HashMap<FaceTexture, u32> {
        let mut index_map: HashMap<FaceTexture, u32> = HashMap::new();
        let mut index = 0;

        let mut insert = |face_tex: FaceTexture| -> u32 {
            let entry = index_map.entry(face_tex);
            match entry {
                hash_map::Entry::Occupied(entry) => *entry.get(),
                hash_map::Entry::Vacant(entry) => {
                    let res = *entry.insert(index);
                    index += 1;
                    res
                }
            }
        };

        for voxel in voxels {
            match voxel.texture.clone() {
                VoxelTexture::Uniform(face_tex) => {
                    let index = insert(face_tex);
                    log::info!(
                        "Voxel {} gets a uniform texture with index {}",
                        voxel.name,
                        index
                    );
                }
                VoxelTexture::Nonuniform { top, bottom, side } => {
                    let index_top = insert(top);
                    let index_bottom = insert(bottom);
                    let index_side = insert(side);

                    log::info!(
                        "Voxel {} gets a non-uniform texture with indices {}/{}/{}",
                        voxel.name,
                        index_top,
                        index_bottom,
                        index_side
                    );
                }
            }
        }

        index_map
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_CONFIG: &str = r#"
voxels:
  - name: Air
    category: air
    texture:
      Uniform:
        resource: air
  - name: Grass
    category: ground
    texture:
      Nonuniform:
        top:
          resource: grass_top
        bottom:
          resource: dirt
        side:
          resource: grass_side
  - name: Dirt
    category: ground
    texture:
      Uniform:
        resource: dirt
  - name: Rock
    category: ground
    texture:
      Uniform:
        resource: rock
"#;

    #[test]
    fn test_parse_and_texture_layers() {
        let helper = VoxelConfigHelper::from_yaml(TEST_CONFIG).unwrap();

        let (grass, _) = helper.voxel_by_name("Grass").unwrap();
        let (dirt, _) = helper.voxel_by_name("Dirt").unwrap();
        let (rock, info) = helper.voxel_by_name("Rock").unwrap();
        assert_eq!(info.name, "Rock");

        // air, grass_top, dirt, grass_side, rock
        assert_eq!(helper.texture_index_map().len(), 5);

        assert_eq!(helper.face_texture_index(grass, Face::PosY), 1);
        assert_eq!(helper.face_texture_index(grass, Face::NegY), 2);
        assert_eq!(helper.face_texture_index(grass, Face::PosX), 3);
        assert_eq!(helper.face_texture_index(dirt, Face::NegZ), 2);
        assert_eq!(helper.face_texture_index(rock, Face::PosY), 4);
        assert_eq!(helper.face_texture_index(Voxel::from_u16(99), Face::PosY), 0);

        assert!(helper.is_known(rock));
        assert!(!helper.is_known(Voxel::from_u16(4)));
    }

    #[test]
    fn test_first_voxel_must_be_air() {
        let config = VoxelConfig::new(vec![VoxelInfo::new(
            "Rock",
            "ground",
            VoxelTexture::Uniform(FaceTexture::new("rock")),
        )]);
        assert!(VoxelConfigHelper::new(&config).is_err());
        assert!(VoxelConfigHelper::new(&VoxelConfig::new(Vec::new())).is_err());
    }
}
