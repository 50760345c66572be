use cgmath::Vector3;

/// One of the six axis-aligned faces of a voxel or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Face {
    NegX,
    PosX,
    NegY,
    PosY,
    NegZ,
    PosZ,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::NegX,
        Face::PosX,
        Face::NegY,
        Face::PosY,
        Face::NegZ,
        Face::PosZ,
    ];

    /// Horizontal faces, i.e. every face except top and bottom.
    pub const SIDES: [Face; 4] = [Face::NegX, Face::PosX, Face::NegZ, Face::PosZ];

    #[inline]
    pub fn normal(self) -> Vector3<i64> {
        match self {
            Face::NegX => Vector3::new(-1, 0, 0),
            Face::PosX => Vector3::new(1, 0, 0),
            Face::NegY => Vector3::new(0, -1, 0),
            Face::PosY => Vector3::new(0, 1, 0),
            Face::NegZ => Vector3::new(0, 0, -1),
            Face::PosZ => Vector3::new(0, 0, 1),
        }
    }

    /// Maps an integer unit normal back to its face.
    pub fn from_normal(normal: Vector3<i64>) -> Option<Face> {
        Face::ALL.iter().copied().find(|face| face.normal() == normal)
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normals_round_trip() {
        for &face in Face::ALL.iter() {
            assert_eq!(Face::from_normal(face.normal()), Some(face));
        }
        assert_eq!(Face::from_normal(Vector3::new(1, 1, 0)), None);
    }
}
